// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]

//! # nexus-ble
//!
//! A cross-platform Bluetooth Low Energy **central** client stack:
//! scanning, connection lifecycle management, and GATT operations against
//! one or more simultaneously connected peripherals.
//!
//! The stack is a concurrent protocol engine. Each peripheral has an
//! independent connection state machine, any number of operations can be
//! in flight at once, and every adapter event may race with new requests —
//! the core coordinates all of it without leaking a pending operation when
//! a peripheral disconnects mid-flight.
//!
//! ## Features
//!
//! - **Scanning**: filtered, deduplicated device discovery streams
//! - **Connections**: per-device state machines with coalesced connects
//! - **GATT**: service/characteristic discovery, read, write (with or
//!   without response), notification subscriptions
//! - **Multi-device**: independent operation across connected peripherals
//! - **Injectable radio**: everything runs against the [`RadioAdapter`]
//!   trait; a btleplug-backed implementation is included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nexus_ble::{BleCentral, BtleplugAdapter, Result, ScanFilter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = BtleplugAdapter::new().await.map_err(nexus_ble::Error::from)?;
//!     let central = BleCentral::new(Arc::new(adapter));
//!
//!     // Scan for five seconds, then connect to the first device seen.
//!     let mut devices = central.start_scan(ScanFilter::default()).await?;
//!     let found = tokio::time::timeout(
//!         std::time::Duration::from_secs(5),
//!         devices.next(),
//!     )
//!     .await
//!     .ok()
//!     .flatten();
//!     central.stop_scan().await?;
//!
//!     if let Some(device) = found {
//!         central.connect(&device.id).await?;
//!         for service in central.discover_services(&device.id).await? {
//!             println!("service: {service}");
//!         }
//!         central.disconnect(&device.id).await?;
//!     }
//!
//!     central.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for boundary types

// Public modules
pub mod adapter;
pub mod central;
pub mod config;
pub mod connection;
pub mod error;
pub mod gatt;
pub mod registry;
pub mod scan;

// Re-exports for convenience
pub use adapter::{
    AdapterError, AdapterEvent, BtleplugAdapter, DeviceDescriptor, DiscoveredService,
    RadioAdapter, ScanFilter,
};
pub use central::{BleCentral, CallbackHandle};
pub use config::CentralConfig;
pub use connection::{ConnectionState, DeviceConnection};
pub use error::{Error, Result};
pub use gatt::{NotificationStream, OpKind};
pub use registry::ConnectionRegistry;
pub use scan::{DeviceStream, ReemitTrigger, ScanSession};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<BleCentral>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<DeviceDescriptor>();
        let _ = std::any::TypeId::of::<ScanFilter>();
        let _ = std::any::TypeId::of::<ConnectionState>();
        let _ = std::any::TypeId::of::<CentralConfig>();
    }
}
