//! Per-device connection record and state machine.
//!
//! Each device identifier owns one [`DeviceConnection`]: the lifecycle state
//! plus everything discovered over the link. All mutation goes through the
//! record's single lock, which is the per-device mutation lane — different
//! devices never contend.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::adapter::DiscoveredService;
use crate::error::{Error, Result};

/// Connection lifecycle state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and none in progress. Reentrant: a device cycles back
    /// here repeatedly over its lifetime.
    #[default]
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected; GATT operations are permitted.
    Connected,
    /// A disconnect request is in flight.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Everything known about one device, behind the record lock.
#[derive(Default)]
struct ConnectionData {
    state: ConnectionState,
    /// Service identifiers in discovery order.
    service_order: Vec<String>,
    /// Service identifier to its characteristics, in discovery order.
    characteristics: HashMap<String, Vec<String>>,
    /// Characteristic identifier to active-subscription flag.
    subscriptions: HashMap<String, bool>,
    /// Whether service enumeration has completed for this connection.
    services_discovered: bool,
}

/// Connection record for a single device identifier.
pub struct DeviceConnection {
    device_id: String,
    data: RwLock<ConnectionData>,
}

impl DeviceConnection {
    /// Create a record in the `Idle` state.
    pub(crate) fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            data: RwLock::new(ConnectionData::default()),
        }
    }

    /// The device identifier this record tracks.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.data.read().state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Transition to a new state, logging the edge.
    pub(crate) fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut data = self.data.write();
            let old = data.state;
            data.state = new_state;
            old
        };

        if old_state != new_state {
            debug!(
                "Connection state for {}: {} -> {}",
                self.device_id, old_state, new_state
            );
        }
    }

    /// Fail fast unless the record is `Connected`.
    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::DeviceNotConnected {
                device_id: self.device_id.clone(),
            })
        }
    }

    /// Install the result of a completed service discovery.
    pub(crate) fn populate_services(&self, services: &[DiscoveredService]) {
        let mut data = self.data.write();

        data.service_order = services.iter().map(|s| s.id.clone()).collect();
        data.characteristics = services
            .iter()
            .map(|s| (s.id.clone(), s.characteristics.clone()))
            .collect();
        data.services_discovered = true;

        debug!(
            "Recorded {} services for {}",
            data.service_order.len(),
            self.device_id
        );
    }

    /// Discovered service identifiers, in discovery order.
    pub fn services(&self) -> Result<Vec<String>> {
        let data = self.data.read();

        if !data.services_discovered {
            return Err(Error::ServicesNotDiscovered {
                device_id: self.device_id.clone(),
            });
        }

        Ok(data.service_order.clone())
    }

    /// Discovered characteristics of one service, in discovery order.
    pub fn characteristics(&self, service_id: &str) -> Result<Vec<String>> {
        let data = self.data.read();

        if !data.services_discovered {
            return Err(Error::ServicesNotDiscovered {
                device_id: self.device_id.clone(),
            });
        }

        data.characteristics
            .get(service_id)
            .cloned()
            .ok_or_else(|| Error::CharacteristicsNotDiscovered {
                service_id: service_id.to_string(),
            })
    }

    /// Whether a notification subscription is active for a characteristic.
    pub fn is_subscribed(&self, characteristic_id: &str) -> bool {
        self.data
            .read()
            .subscriptions
            .get(characteristic_id)
            .copied()
            .unwrap_or(false)
    }

    /// Record the adapter-confirmed subscription state of a characteristic.
    pub(crate) fn set_subscribed(&self, characteristic_id: &str, active: bool) {
        let mut data = self.data.write();
        if active {
            data.subscriptions
                .insert(characteristic_id.to_string(), true);
        } else {
            data.subscriptions.remove(characteristic_id);
        }
    }

    /// Force the record back to `Idle`, clearing everything discovered.
    ///
    /// Used for confirmed disconnects and for unsolicited connection loss.
    pub(crate) fn reset_to_idle(&self) {
        let mut data = self.data.write();
        let old = data.state;
        *data = ConnectionData::default();

        if old != ConnectionState::Idle {
            debug!(
                "Connection state for {}: {} -> Idle (record cleared)",
                self.device_id, old
            );
        }
    }
}
