//! Subscribe to a characteristic and print its notifications.
//!
//! Run with:
//!   cargo run --example notify -- <device-id> <service-uuid> <characteristic-uuid>

use nexus_ble::{BleCentral, BtleplugAdapter, Error, Result};
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

    let mut args = std::env::args().skip(1);
    let (device_id, service_id, characteristic_id) =
        match (args.next(), args.next(), args.next()) {
            (Some(d), Some(s), Some(c)) => (d, s, c),
            _ => {
                eprintln!(
                    "usage: notify <device-id> <service-uuid> <characteristic-uuid>"
                );
                return Ok(());
            }
        };

    let adapter = BtleplugAdapter::new().await.map_err(Error::from)?;
    let central = BleCentral::new(Arc::new(adapter));

    println!("Connecting to {device_id}...");
    central.connect(&device_id).await?;
    central.discover_services(&device_id).await?;

    let mut stream = central
        .subscribe_to_characteristic(&device_id, &service_id, &characteristic_id)
        .await?;

    println!("Subscribed; printing notifications for 30 seconds.\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);

    while let Ok(Some(value)) = tokio::time::timeout_at(deadline, stream.next()).await {
        println!("{characteristic_id}: {value:02X?}");
    }

    central
        .unsubscribe_from_characteristic(&device_id, &service_id, &characteristic_id)
        .await?;
    central.disconnect(&device_id).await?;
    central.shutdown().await?;

    Ok(())
}
