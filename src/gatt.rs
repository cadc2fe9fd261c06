//! GATT operation coordination.
//!
//! Tracks every in-flight request as a pending operation keyed by
//! (device, service, characteristic, kind), matches asynchronous adapter
//! completions back to the originating caller, and routes notification
//! events to long-lived per-characteristic streams.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::adapter::DiscoveredService;
use crate::error::{Error, Result};

/// Kind of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Connection establishment.
    Connect,
    /// Connection teardown.
    Disconnect,
    /// Service enumeration.
    DiscoverServices,
    /// Characteristic value read.
    Read,
    /// Characteristic value write.
    Write,
    /// Notification enable.
    Subscribe,
    /// Notification disable.
    Unsubscribe,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::DiscoverServices => "discover-services",
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        };
        write!(f, "{name}")
    }
}

/// Identity of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OpKey {
    pub device_id: String,
    pub service_id: Option<String>,
    pub characteristic_id: Option<String>,
    pub kind: OpKind,
}

impl OpKey {
    /// Key for a device-scoped operation (connect, disconnect, discovery).
    pub fn device(device_id: &str, kind: OpKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            service_id: None,
            characteristic_id: None,
            kind,
        }
    }

    /// Key for a characteristic-scoped operation.
    pub fn characteristic(
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        kind: OpKind,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            service_id: Some(service_id.to_string()),
            characteristic_id: Some(characteristic_id.to_string()),
            kind,
        }
    }

    /// Human-readable target for error messages.
    pub fn describe(&self) -> String {
        match &self.characteristic_id {
            Some(characteristic) => {
                format!("{} on {} ({})", self.kind, characteristic, self.device_id)
            }
            None => format!("{} on {}", self.kind, self.device_id),
        }
    }
}

/// Successful completion payload of a pending operation.
#[derive(Debug, Clone)]
pub(crate) enum OpOutcome {
    /// Completed with no payload.
    Done,
    /// Completed with a characteristic value.
    Data(Vec<u8>),
    /// Completed with a service enumeration.
    Services(Vec<DiscoveredService>),
}

/// One outstanding request. The waiter list is longer than one only for
/// coalesced connects.
struct PendingOp {
    waiters: Vec<oneshot::Sender<Result<OpOutcome>>>,
}

/// A single-resolution completion slot handed to a caller.
pub(crate) type OpReceiver = oneshot::Receiver<Result<OpOutcome>>;

/// Serializes and tracks in-flight GATT requests and notification routing.
pub(crate) struct GattCoordinator {
    pending: Mutex<HashMap<OpKey, PendingOp>>,
    /// Per-characteristic notification channels, keyed (device, characteristic).
    notifications: Mutex<HashMap<(String, String), broadcast::Sender<Vec<u8>>>>,
    notify_capacity: usize,
}

impl GattCoordinator {
    pub fn new(notify_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            notify_capacity,
        }
    }

    /// Register a new pending operation.
    ///
    /// Rejects with `OperationInProgress` while an identical key is
    /// outstanding; the duplicate is never silently dropped or queued.
    pub fn register(&self, key: OpKey) -> Result<OpReceiver> {
        let mut pending = self.pending.lock();

        if pending.contains_key(&key) {
            return Err(Error::OperationInProgress {
                operation: key.describe(),
            });
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(
            key,
            PendingOp {
                waiters: vec![tx],
            },
        );

        Ok(rx)
    }

    /// Get-or-create the connect slot for a device.
    ///
    /// Concurrent connect calls coalesce onto one slot: the caller that
    /// created it (`true`) issues the single radio request, later callers
    /// just wait for the same resolution.
    pub fn connect_slot(&self, device_id: &str) -> (OpReceiver, bool) {
        let key = OpKey::device(device_id, OpKind::Connect);
        let mut pending = self.pending.lock();

        let (tx, rx) = oneshot::channel();

        match pending.get_mut(&key) {
            Some(op) => {
                op.waiters.push(tx);
                trace!(
                    "Joining in-flight connect for {} ({} waiters)",
                    device_id,
                    op.waiters.len()
                );
                (rx, false)
            }
            None => {
                pending.insert(
                    key,
                    PendingOp {
                        waiters: vec![tx],
                    },
                );
                (rx, true)
            }
        }
    }

    /// Resolve a pending operation, waking every waiter exactly once.
    ///
    /// Removal and resolution happen atomically under the map lock, so a
    /// racing duplicate-key check can never observe a resolved-but-present
    /// entry. A completion with no matching entry is discarded with a
    /// diagnostic.
    pub fn resolve(&self, key: &OpKey, result: Result<OpOutcome>) {
        let op = self.pending.lock().remove(key);

        match op {
            Some(op) => {
                for waiter in op.waiters {
                    // A caller that dropped its future no longer cares.
                    let _ = waiter.send(result.clone());
                }
            }
            None => {
                debug!(
                    "Discarding completion with no pending operation: {}",
                    key.describe()
                );
            }
        }
    }

    /// Fail every outstanding operation for one device.
    ///
    /// Required on forced disconnect: an unresolved pending operation is a
    /// leaked resource.
    pub fn fail_device(&self, device_id: &str, error: Error) {
        let drained: Vec<(OpKey, PendingOp)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<OpKey> = pending
                .keys()
                .filter(|k| k.device_id == device_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|op| (k, op)))
                .collect()
        };

        if !drained.is_empty() {
            warn!(
                "Failing {} outstanding operation(s) for {}: {}",
                drained.len(),
                device_id,
                error
            );
        }

        for (_, op) in drained {
            for waiter in op.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Number of outstanding operations for a device.
    #[cfg(test)]
    pub fn pending_count(&self, device_id: &str) -> usize {
        self.pending
            .lock()
            .keys()
            .filter(|k| k.device_id == device_id)
            .count()
    }

    /// Get-or-create the notification channel for a characteristic and
    /// subscribe to it.
    pub fn notification_channel(
        &self,
        device_id: &str,
        characteristic_id: &str,
    ) -> broadcast::Receiver<Vec<u8>> {
        let mut channels = self.notifications.lock();
        let sender = channels
            .entry((device_id.to_string(), characteristic_id.to_string()))
            .or_insert_with(|| broadcast::channel(self.notify_capacity).0);
        sender.subscribe()
    }

    /// Route one notification to its channel, if any subscription is live.
    pub fn route_notification(&self, device_id: &str, characteristic_id: &str, data: Vec<u8>) {
        let channels = self.notifications.lock();

        match channels.get(&(device_id.to_string(), characteristic_id.to_string())) {
            Some(sender) => {
                let _ = sender.send(data);
            }
            None => {
                trace!(
                    "Discarding notification for unsubscribed characteristic {} on {}",
                    characteristic_id,
                    device_id
                );
            }
        }
    }

    /// Tear down one characteristic's notification channel. Live streams
    /// end after draining what was already delivered.
    pub fn drop_notification_channel(&self, device_id: &str, characteristic_id: &str) {
        self.notifications
            .lock()
            .remove(&(device_id.to_string(), characteristic_id.to_string()));
    }

    /// Tear down every notification channel for a device.
    pub fn drop_device_channels(&self, device_id: &str) {
        self.notifications
            .lock()
            .retain(|(device, _), _| device != device_id);
    }
}

/// Stream of values notified by a subscribed characteristic.
///
/// Yields in notification order and ends when the subscription is removed
/// or the device disconnects.
pub struct NotificationStream {
    rx: broadcast::Receiver<Vec<u8>>,
}

impl NotificationStream {
    pub(crate) fn new(rx: broadcast::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Receive the next notified value, or `None` once the subscription ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(data) => return Some(data),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Notification stream lagging, {} values dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
