//! Connection registry: the process-wide map of device records.
//!
//! Single source of truth for "is this device connected". One record per
//! device identifier; records are created on first connect attempt and
//! reset to `Idle` (not destroyed) on disconnect, so the identifier keeps
//! mapping to at most one record for its whole lifetime.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::DeviceConnection;

/// Map from device identifier to its connection record.
#[derive(Default)]
pub struct ConnectionRegistry {
    records: RwLock<HashMap<String, Arc<DeviceConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing record.
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.records.read().get(device_id).cloned()
    }

    /// Look up a record, creating an `Idle` one if none exists.
    pub fn get_or_create(&self, device_id: &str) -> Arc<DeviceConnection> {
        if let Some(record) = self.records.read().get(device_id) {
            return record.clone();
        }

        self.records
            .write()
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceConnection::new(device_id)))
            .clone()
    }

    /// Whether the device is currently connected.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.records
            .read()
            .get(device_id)
            .map(|r| r.is_connected())
            .unwrap_or(false)
    }

    /// Identifiers of all currently connected devices.
    pub fn connected_devices(&self) -> Vec<String> {
        self.records
            .read()
            .values()
            .filter(|r| r.is_connected())
            .map(|r| r.device_id().to_string())
            .collect()
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Vec<Arc<DeviceConnection>> {
        self.records.read().values().cloned().collect()
    }

    /// Number of known records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no records exist.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
