//! Scan session: advertisement filtering, deduplication, and delivery.
//!
//! One session owns the lifetime of a single scanning operation. The facade
//! guarantees at most one live session; constructing a second while one is
//! active fails fast with `AlreadyScanning`.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::adapter::{DeviceDescriptor, ScanFilter};

/// Which descriptor change makes a deduplicated device worth re-emitting.
///
/// Only consulted when the filter's `allow_duplicates` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReemitTrigger {
    /// Re-emit when any descriptor field changed. Keeps caller-facing
    /// device lists fresh.
    #[default]
    AnyFieldChange,
    /// Re-emit only when the name resolved or the RSSI moved.
    NameOrRssiChange,
    /// Emit each device exactly once per session.
    Never,
}

/// Deduplication state: device identifier to last-emitted descriptor.
///
/// Pure and synchronous so the policy can be exercised without a runtime.
#[derive(Debug, Default)]
pub(crate) struct Deduper {
    last_emitted: HashMap<String, DeviceDescriptor>,
}

impl Deduper {
    /// Decide whether `descriptor` should be surfaced, recording it as the
    /// last-emitted snapshot when it is.
    pub(crate) fn offer(
        &mut self,
        descriptor: &DeviceDescriptor,
        allow_duplicates: bool,
        trigger: ReemitTrigger,
    ) -> bool {
        if allow_duplicates {
            self.last_emitted
                .insert(descriptor.id.clone(), descriptor.clone());
            return true;
        }

        let emit = match self.last_emitted.get(&descriptor.id) {
            None => true,
            Some(prior) => match trigger {
                ReemitTrigger::AnyFieldChange => prior != descriptor,
                ReemitTrigger::NameOrRssiChange => {
                    prior.name != descriptor.name || prior.rssi != descriptor.rssi
                }
                ReemitTrigger::Never => false,
            },
        };

        if emit {
            self.last_emitted
                .insert(descriptor.id.clone(), descriptor.clone());
        }

        emit
    }
}

/// Whether a descriptor passes the session's service and RSSI filters.
pub(crate) fn passes_filter(filter: &ScanFilter, descriptor: &DeviceDescriptor) -> bool {
    if !filter.services.is_empty()
        && !descriptor
            .services
            .iter()
            .any(|s| filter.services.contains(s))
    {
        return false;
    }

    descriptor.rssi >= filter.rssi_threshold
}

/// A single active scanning operation.
///
/// Receives raw advertisement reports from the adapter event pump, applies
/// the filter and deduplication policy, and fans accepted descriptors out
/// to subscribers.
pub struct ScanSession {
    filter: ScanFilter,
    trigger: ReemitTrigger,
    dedup: Mutex<Deduper>,
    device_tx: broadcast::Sender<DeviceDescriptor>,
}

impl ScanSession {
    /// Create a session for one scan.
    pub(crate) fn new(filter: ScanFilter, trigger: ReemitTrigger, capacity: usize) -> Self {
        let (device_tx, _) = broadcast::channel(capacity);

        Self {
            filter,
            trigger,
            dedup: Mutex::new(Deduper::default()),
            device_tx,
        }
    }

    /// The filter this session was started with.
    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    /// Subscribe to descriptors accepted by this session.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceDescriptor> {
        self.device_tx.subscribe()
    }

    /// Feed one advertisement report through filter and dedup.
    pub(crate) fn handle_advertisement(&self, descriptor: DeviceDescriptor) {
        if !passes_filter(&self.filter, &descriptor) {
            trace!("Advertisement filtered out: {}", descriptor.id);
            return;
        }

        let emit = self
            .dedup
            .lock()
            .offer(&descriptor, self.filter.allow_duplicates, self.trigger);

        if !emit {
            trace!("Duplicate advertisement suppressed: {}", descriptor.id);
            return;
        }

        // Nobody listening is not an error; the session may outlive its
        // subscribers briefly during stop.
        let _ = self.device_tx.send(descriptor);
    }
}

/// Stream of device descriptors from an active scan.
///
/// Ends when the scan stops. A caller that falls behind loses the oldest
/// reports and is warned once per gap.
pub struct DeviceStream {
    rx: broadcast::Receiver<DeviceDescriptor>,
}

impl DeviceStream {
    pub(crate) fn new(rx: broadcast::Receiver<DeviceDescriptor>) -> Self {
        Self { rx }
    }

    /// Receive the next discovered device, or `None` once the scan stopped.
    pub async fn next(&mut self) -> Option<DeviceDescriptor> {
        loop {
            match self.rx.recv().await {
                Ok(descriptor) => return Some(descriptor),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Device stream lagging, {} reports dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
