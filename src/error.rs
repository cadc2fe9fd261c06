//! Error types for the nexus-ble crate.

use thiserror::Error;

use crate::adapter::AdapterError;

/// The main error type for this crate.
///
/// Precondition violations (wrong connection state, unknown device,
/// duplicate operation) are detected locally and never reach the radio
/// adapter. Adapter-reported failures are carried in [`Error::AdapterRejected`]
/// with the backend's message preserved verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The Bluetooth radio is powered off or unavailable.
    #[error("Bluetooth radio is disabled")]
    RadioDisabled,

    /// A scan session is already active.
    #[error("A scan is already in progress")]
    AlreadyScanning,

    /// A connection to this device is already established.
    #[error("Already connected to device: {device_id}")]
    AlreadyConnected {
        /// The device identifier.
        device_id: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected: {device_id}")]
    DeviceNotConnected {
        /// The device identifier.
        device_id: String,
    },

    /// The connection was lost while the operation was outstanding.
    #[error("Device disconnected: {device_id}")]
    DeviceDisconnected {
        /// The device identifier.
        device_id: String,
    },

    /// Service enumeration has not completed for this device.
    #[error("Services not discovered for device: {device_id}")]
    ServicesNotDiscovered {
        /// The device identifier.
        device_id: String,
    },

    /// Characteristic enumeration has not completed for this service.
    #[error("Characteristics not discovered for service: {service_id}")]
    CharacteristicsNotDiscovered {
        /// The service identifier.
        service_id: String,
    },

    /// An identical operation is already outstanding for this target.
    #[error("Operation already in progress: {operation}")]
    OperationInProgress {
        /// Description of the outstanding operation.
        operation: String,
    },

    /// The radio adapter rejected or failed the request.
    #[error("Adapter rejected request: {message}")]
    AdapterRejected {
        /// The adapter-supplied failure message, verbatim.
        message: String,
    },

    /// No connection record exists for this identifier.
    #[error("Unknown device: {device_id}")]
    UnknownDevice {
        /// The device identifier.
        device_id: String,
    },

    /// An internal invariant was broken.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        Error::AdapterRejected {
            message: err.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
