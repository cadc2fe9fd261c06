//! Basic example: discover nearby BLE devices
//!
//! Run with: cargo run --example scan_devices

use nexus_ble::{BleCentral, BtleplugAdapter, Error, Result, ScanFilter};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nexus_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for BLE devices for 10 seconds...\n");

    let adapter = BtleplugAdapter::new().await.map_err(Error::from)?;
    let central = BleCentral::new(Arc::new(adapter));

    if !central.is_bluetooth_enabled().await? {
        eprintln!("Bluetooth is disabled; enable it and try again.");
        return Ok(());
    }

    // No duplicates: each device prints once, plus again when it changes.
    let mut devices = central
        .start_scan(ScanFilter::new(Vec::new(), -90, false))
        .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while let Ok(Some(device)) = tokio::time::timeout_at(deadline, devices.next()).await {
        println!(
            "{}  {}  {} dBm  ({} advertised services)",
            device.id,
            device.name.as_deref().unwrap_or("<unnamed>"),
            device.rssi,
            device.services.len()
        );
    }

    central.stop_scan().await?;
    central.shutdown().await?;

    println!("\nDone.");
    Ok(())
}
