//! Radio adapter boundary.
//!
//! The core drives the platform Bluetooth stack through the [`RadioAdapter`]
//! trait. Every request method returns as soon as the radio has accepted or
//! rejected the request; the matching completion arrives exactly once as an
//! [`AdapterEvent`] on the stream returned by [`RadioAdapter::events`], from
//! an unspecified task. Notification events are the exception: a subscribed
//! characteristic may emit zero-to-many of them.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

mod btleplug;

pub use self::btleplug::BtleplugAdapter;

/// Error reported by a radio adapter backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The underlying platform call failed.
    #[error("{0}")]
    Backend(String),

    /// The backend cannot perform this request on this platform.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
}

impl AdapterError {
    /// Create a backend error from any displayable source.
    pub fn backend(message: impl Into<String>) -> Self {
        AdapterError::Backend(message.into())
    }
}

/// Immutable snapshot of a device observed during scanning.
///
/// A fresh descriptor replaces any prior one with the same `id`; fields are
/// refreshed, never merged, so earlier snapshots held by callers stay valid.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDescriptor {
    /// Stable, opaque device identifier (platform address).
    pub id: String,
    /// Advertised display name, if resolved.
    pub name: Option<String>,
    /// Last-seen signal strength in dBm.
    pub rssi: i16,
    /// Manufacturer data keyed by company identifier.
    pub manufacturer_data: HashMap<String, Vec<u8>>,
    /// Advertised service identifiers.
    pub services: Vec<String>,
    /// Whether the device accepts connections.
    pub connectable: bool,
}

/// Filter applied to advertisement reports during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Restrict results to devices advertising one of these services
    /// (empty = all devices).
    pub services: Vec<String>,
    /// Drop results weaker than this threshold, in dBm.
    pub rssi_threshold: i16,
    /// Surface repeat advertisements for an already-seen device.
    pub allow_duplicates: bool,
}

impl ScanFilter {
    /// Create a scan filter.
    pub fn new(services: Vec<String>, rssi_threshold: i16, allow_duplicates: bool) -> Self {
        Self {
            services,
            rssi_threshold,
            allow_duplicates,
        }
    }
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            rssi_threshold: -100,
            allow_duplicates: false,
        }
    }
}

/// A service enumerated during discovery, with its characteristics in the
/// order the peripheral reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredService {
    /// Service identifier (UUID-formatted string).
    pub id: String,
    /// Characteristic identifiers within this service.
    pub characteristics: Vec<String>,
}

/// Asynchronous event delivered by a radio adapter.
///
/// Completion variants carry `Err(message)` with the backend's failure
/// message when the request did not succeed on the air interface.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Advertisement report during an active scan.
    Advertisement(DeviceDescriptor),
    /// Outcome of an `open_connection` request.
    ConnectComplete {
        /// Target device.
        device_id: String,
        /// Success, or the backend failure message.
        result: std::result::Result<(), String>,
    },
    /// Outcome of a `close_connection` request.
    DisconnectComplete {
        /// Target device.
        device_id: String,
        /// Success, or the backend failure message.
        result: std::result::Result<(), String>,
    },
    /// The peripheral dropped the link without a `close_connection` request.
    ConnectionLost {
        /// The device that disconnected.
        device_id: String,
    },
    /// Outcome of a `discover_services` request.
    ServicesDiscovered {
        /// Target device.
        device_id: String,
        /// The enumerated services, or the backend failure message.
        result: std::result::Result<Vec<DiscoveredService>, String>,
    },
    /// Outcome of a `read_characteristic` request.
    ReadComplete {
        /// Target device.
        device_id: String,
        /// Containing service.
        service_id: String,
        /// Target characteristic.
        characteristic_id: String,
        /// The value read, or the backend failure message.
        result: std::result::Result<Vec<u8>, String>,
    },
    /// Outcome of a `write_characteristic` request.
    ///
    /// For `with_response` writes this arrives on peripheral acknowledgment;
    /// without response it arrives when the local radio accepts the write
    /// for transmission.
    WriteComplete {
        /// Target device.
        device_id: String,
        /// Containing service.
        service_id: String,
        /// Target characteristic.
        characteristic_id: String,
        /// Success, or the backend failure message.
        result: std::result::Result<(), String>,
    },
    /// Outcome of a `set_notification_state(.., true)` request.
    SubscribeComplete {
        /// Target device.
        device_id: String,
        /// Containing service.
        service_id: String,
        /// Target characteristic.
        characteristic_id: String,
        /// Success, or the backend failure message.
        result: std::result::Result<(), String>,
    },
    /// Outcome of a `set_notification_state(.., false)` request.
    UnsubscribeComplete {
        /// Target device.
        device_id: String,
        /// Containing service.
        service_id: String,
        /// Target characteristic.
        characteristic_id: String,
        /// Success, or the backend failure message.
        result: std::result::Result<(), String>,
    },
    /// Unsolicited value notification from a subscribed characteristic.
    Notification {
        /// Source device.
        device_id: String,
        /// Containing service.
        service_id: String,
        /// Source characteristic.
        characteristic_id: String,
        /// The notified value.
        data: Vec<u8>,
    },
}

/// Abstraction over the platform Bluetooth stack, central role only.
///
/// Implementations must be safe to call from any task, and must deliver
/// exactly one completion event per accepted request. Events may arrive
/// concurrently with new requests; the core synchronizes on its side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Whether the Bluetooth radio is powered on.
    async fn is_enabled(&self) -> std::result::Result<bool, AdapterError>;

    /// Ask the platform to enable the radio.
    ///
    /// Backends that cannot prompt report [`AdapterError::Unsupported`].
    async fn request_enable(&self) -> std::result::Result<(), AdapterError>;

    /// Begin delivering [`AdapterEvent::Advertisement`] events.
    async fn start_scan(&self, filter: &ScanFilter) -> std::result::Result<(), AdapterError>;

    /// Stop delivering advertisement events.
    async fn stop_scan(&self) -> std::result::Result<(), AdapterError>;

    /// Open a connection; completes with [`AdapterEvent::ConnectComplete`].
    async fn open_connection(&self, device_id: &str) -> std::result::Result<(), AdapterError>;

    /// Close a connection; completes with [`AdapterEvent::DisconnectComplete`].
    async fn close_connection(&self, device_id: &str) -> std::result::Result<(), AdapterError>;

    /// Enumerate services; completes with [`AdapterEvent::ServicesDiscovered`].
    async fn discover_services(&self, device_id: &str) -> std::result::Result<(), AdapterError>;

    /// Read a characteristic; completes with [`AdapterEvent::ReadComplete`].
    async fn read_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> std::result::Result<(), AdapterError>;

    /// Write a characteristic; completes with [`AdapterEvent::WriteComplete`].
    ///
    /// `with_response` selects acknowledged writes and is forwarded to the
    /// radio verbatim, never upgraded or downgraded.
    async fn write_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        data: &[u8],
        with_response: bool,
    ) -> std::result::Result<(), AdapterError>;

    /// Enable or disable notifications; completes with
    /// [`AdapterEvent::SubscribeComplete`] / [`AdapterEvent::UnsubscribeComplete`].
    async fn set_notification_state(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        enabled: bool,
    ) -> std::result::Result<(), AdapterError>;

    /// Subscribe to the adapter's event stream.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;
}
