//! Connect to a device, enumerate its GATT database, and read what it offers.
//!
//! Run with: cargo run --example read_write -- [device-id]
//!
//! Without an argument, connects to the strongest device found in a short
//! scan.

use nexus_ble::{BleCentral, BtleplugAdapter, Error, Result, ScanFilter};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nexus_ble=info".parse().unwrap()),
        )
        .init();

    let adapter = BtleplugAdapter::new().await.map_err(Error::from)?;
    let central = BleCentral::new(Arc::new(adapter));

    let device_id = match std::env::args().nth(1) {
        Some(id) => id,
        None => pick_strongest(&central).await?,
    };

    println!("Connecting to {device_id}...");
    central.connect(&device_id).await?;

    let services = central.discover_services(&device_id).await?;
    println!("Discovered {} services:", services.len());

    for service_id in &services {
        println!("  service {service_id}");

        for characteristic_id in central.get_characteristics(&device_id, service_id)? {
            match central
                .read_characteristic(&device_id, service_id, &characteristic_id)
                .await
            {
                Ok(value) => println!("    {characteristic_id}: {value:02X?}"),
                Err(e) => println!("    {characteristic_id}: <{e}>"),
            }
        }
    }

    central.disconnect(&device_id).await?;
    central.shutdown().await?;

    Ok(())
}

/// Scan briefly and return the identifier of the strongest device seen.
async fn pick_strongest(central: &BleCentral) -> Result<String> {
    println!("No device given; scanning for 5 seconds...");

    let mut devices = central.start_scan(ScanFilter::default()).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    let mut best: Option<(String, i16)> = None;

    while let Ok(Some(device)) = tokio::time::timeout_at(deadline, devices.next()).await {
        if device.connectable
            && best.as_ref().map(|(_, rssi)| device.rssi > *rssi).unwrap_or(true)
        {
            best = Some((device.id.clone(), device.rssi));
        }
    }

    central.stop_scan().await?;

    best.map(|(id, _)| id)
        .ok_or_else(|| Error::Internal("no connectable device found".to_string()))
}
