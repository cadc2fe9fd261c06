//! End-to-end tests of the central stack against a scripted adapter.

mod common;

use common::{eventually, Call, FakeAdapter};
use nexus_ble::adapter::{AdapterEvent, DeviceDescriptor, DiscoveredService, ScanFilter};
use nexus_ble::{BleCentral, Error};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn descriptor(id: &str, rssi: i16) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        name: None,
        rssi,
        manufacturer_data: HashMap::new(),
        services: Vec::new(),
        connectable: true,
    }
}

fn sample_services() -> Vec<DiscoveredService> {
    vec![
        DiscoveredService {
            id: "svc-a".to_string(),
            characteristics: vec!["chr-1".to_string(), "chr-2".to_string()],
        },
        DiscoveredService {
            id: "svc-b".to_string(),
            characteristics: vec!["chr-3".to_string()],
        },
    ]
}

async fn connected_central(fake: &Arc<FakeAdapter>, device_id: &str) -> Arc<BleCentral> {
    let central = Arc::new(BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>));
    central.connect(device_id).await.expect("connect failed");
    central
}

// === Scanning ===

#[tokio::test]
async fn scan_applies_rssi_threshold() {
    let fake = Arc::new(FakeAdapter::new());
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    let filter = ScanFilter::new(Vec::new(), -80, false);
    let mut devices = central.start_scan(filter).await.unwrap();

    fake.emit(AdapterEvent::Advertisement(descriptor("near", -65)));
    fake.emit(AdapterEvent::Advertisement(descriptor("far", -85)));

    let first = timeout(Duration::from_millis(200), devices.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, "near");

    // The -85 device was dropped before deduplication.
    assert!(timeout(Duration::from_millis(50), devices.next())
        .await
        .is_err());
}

#[tokio::test]
async fn scan_dedup_reemits_only_on_change() {
    let fake = Arc::new(FakeAdapter::new());
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    let mut devices = central.start_scan(ScanFilter::default()).await.unwrap();

    fake.emit(AdapterEvent::Advertisement(descriptor("dev", -60)));
    fake.emit(AdapterEvent::Advertisement(descriptor("dev", -60)));

    let first = timeout(Duration::from_millis(200), devices.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.rssi, -60);

    // Identical repeat is suppressed.
    assert!(timeout(Duration::from_millis(50), devices.next())
        .await
        .is_err());

    // A changed field re-emits.
    fake.emit(AdapterEvent::Advertisement(descriptor("dev", -72)));
    let second = timeout(Duration::from_millis(200), devices.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.rssi, -72);
}

#[tokio::test]
async fn scan_session_is_exclusive_and_stop_is_idempotent() {
    let fake = Arc::new(FakeAdapter::new());
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    let _devices = central.start_scan(ScanFilter::default()).await.unwrap();
    assert!(central.is_scanning());

    assert!(matches!(
        central.start_scan(ScanFilter::default()).await,
        Err(Error::AlreadyScanning)
    ));

    central.stop_scan().await.unwrap();
    assert!(!central.is_scanning());
    central.stop_scan().await.unwrap();

    // A new session may start once the previous one ended.
    let _devices = central.start_scan(ScanFilter::default()).await.unwrap();
}

#[tokio::test]
async fn scan_requires_radio_enabled() {
    let fake = Arc::new(FakeAdapter::new());
    fake.set_enabled(false);
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    assert!(matches!(
        central.start_scan(ScanFilter::default()).await,
        Err(Error::RadioDisabled)
    ));
    assert_eq!(fake.count_calls(|c| matches!(c, Call::StartScan(_))), 0);
}

#[tokio::test]
async fn request_enable_unblocks_scanning() {
    let fake = Arc::new(FakeAdapter::new());
    fake.set_enabled(false);
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    assert!(!central.is_bluetooth_enabled().await.unwrap());
    assert!(matches!(
        central.start_scan(ScanFilter::default()).await,
        Err(Error::RadioDisabled)
    ));

    central.request_bluetooth_enable().await.unwrap();
    assert!(central.is_bluetooth_enabled().await.unwrap());
    let _devices = central.start_scan(ScanFilter::default()).await.unwrap();
}

#[tokio::test]
async fn stop_scan_ends_device_stream() {
    let fake = Arc::new(FakeAdapter::new());
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    let mut devices = central.start_scan(ScanFilter::default()).await.unwrap();
    central.stop_scan().await.unwrap();

    assert_eq!(
        timeout(Duration::from_millis(200), devices.next())
            .await
            .unwrap(),
        None
    );
}

// === Connection lifecycle ===

#[tokio::test]
async fn connect_disconnect_cycle() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    let id = central.connect("AA:BB").await.unwrap();
    assert_eq!(id, "AA:BB");
    assert!(central.is_connected("AA:BB"));

    assert!(matches!(
        central.connect("AA:BB").await,
        Err(Error::AlreadyConnected { .. })
    ));

    central.disconnect("AA:BB").await.unwrap();
    assert!(!central.is_connected("AA:BB"));

    // Idle is reentrant: the same device connects again cleanly.
    central.connect("AA:BB").await.unwrap();
    assert!(central.is_connected("AA:BB"));
}

#[tokio::test]
async fn concurrent_connects_coalesce_to_one_radio_request() {
    let fake = Arc::new(FakeAdapter::new());
    let central = Arc::new(BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>));

    let c = central.clone();
    let task = tokio::spawn(async move { tokio::join!(c.connect("dev"), c.connect("dev")) });

    fake.wait_for_calls(|calls| {
        calls
            .iter()
            .filter(|c| matches!(c, Call::OpenConnection(_)))
            .count()
            == 1
    })
    .await;

    fake.emit(AdapterEvent::ConnectComplete {
        device_id: "dev".to_string(),
        result: Ok(()),
    });

    let (r1, r2) = task.await.unwrap();
    assert_eq!(r1.unwrap(), "dev");
    assert_eq!(r2.unwrap(), "dev");
    assert_eq!(
        fake.count_calls(|c| matches!(c, Call::OpenConnection(_))),
        1
    );
}

#[tokio::test]
async fn connect_failure_surfaces_error_and_resets_state() {
    let fake = Arc::new(FakeAdapter::new());
    let central = Arc::new(BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>));

    let c = central.clone();
    let task = tokio::spawn(async move { c.connect("dev").await });

    fake.wait_for_calls(|calls| !calls.is_empty()).await;
    fake.emit(AdapterEvent::ConnectComplete {
        device_id: "dev".to_string(),
        result: Err("peer unreachable".to_string()),
    });

    let result = task.await.unwrap();
    match result {
        Err(Error::AdapterRejected { message }) => assert_eq!(message, "peer unreachable"),
        other => panic!("expected AdapterRejected, got {other:?}"),
    }
    assert!(!central.is_connected("dev"));

    // The record landed back in Idle: a retry issues a fresh radio request.
    let c = central.clone();
    let task = tokio::spawn(async move { c.connect("dev").await });
    fake.wait_for_calls(|calls| {
        calls
            .iter()
            .filter(|c| matches!(c, Call::OpenConnection(_)))
            .count()
            == 2
    })
    .await;
    fake.emit(AdapterEvent::ConnectComplete {
        device_id: "dev".to_string(),
        result: Ok(()),
    });
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn forced_disconnect_fails_outstanding_write_and_clears_record() {
    let fake = Arc::new(FakeAdapter::new());
    let central = Arc::new(BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>));

    let c = central.clone();
    let connect = tokio::spawn(async move { c.connect("dev").await });
    fake.wait_for_calls(|calls| !calls.is_empty()).await;
    fake.emit(AdapterEvent::ConnectComplete {
        device_id: "dev".to_string(),
        result: Ok(()),
    });
    connect.await.unwrap().unwrap();

    let c = central.clone();
    let write = tokio::spawn(async move {
        c.write_characteristic("dev", "svc", "chr", &[1, 2, 3], true)
            .await
    });
    fake.wait_for_calls(|calls| calls.iter().any(|c| matches!(c, Call::Write { .. })))
        .await;

    // The peripheral drops the link while the write is outstanding.
    fake.emit(AdapterEvent::ConnectionLost {
        device_id: "dev".to_string(),
    });

    assert!(matches!(
        write.await.unwrap(),
        Err(Error::DeviceDisconnected { .. })
    ));
    eventually(|| !central.is_connected("dev"), "record back to Idle").await;

    // Reconnect and confirm the discovered maps were cleared.
    let c = central.clone();
    let reconnect = tokio::spawn(async move { c.connect("dev").await });
    fake.wait_for_calls(|calls| {
        calls
            .iter()
            .filter(|c| matches!(c, Call::OpenConnection(_)))
            .count()
            == 2
    })
    .await;
    fake.emit(AdapterEvent::ConnectComplete {
        device_id: "dev".to_string(),
        result: Ok(()),
    });
    reconnect.await.unwrap().unwrap();

    assert!(matches!(
        central.get_services("dev"),
        Err(Error::ServicesNotDiscovered { .. })
    ));
}

#[tokio::test]
async fn operations_on_disconnected_device_never_reach_adapter() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = connected_central(&fake, "dev").await;

    central.disconnect("dev").await.unwrap();

    assert!(matches!(
        central.read_characteristic("dev", "svc", "chr").await,
        Err(Error::DeviceNotConnected { .. })
    ));
    assert!(matches!(
        central
            .write_characteristic("dev", "svc", "chr", &[0], false)
            .await,
        Err(Error::DeviceNotConnected { .. })
    ));
    assert!(matches!(
        central.subscribe_to_characteristic("dev", "svc", "chr").await,
        Err(Error::DeviceNotConnected { .. })
    ));

    assert_eq!(fake.count_calls(|c| matches!(c, Call::Read(..))), 0);
    assert_eq!(fake.count_calls(|c| matches!(c, Call::Write { .. })), 0);
    assert_eq!(fake.count_calls(|c| matches!(c, Call::SetNotify { .. })), 0);
}

#[tokio::test]
async fn unknown_device_is_rejected_synchronously() {
    let fake = Arc::new(FakeAdapter::new());
    let central = BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>);

    assert!(matches!(
        central.read_characteristic("ghost", "svc", "chr").await,
        Err(Error::UnknownDevice { .. })
    ));
    assert!(matches!(
        central.disconnect("ghost").await,
        Err(Error::UnknownDevice { .. })
    ));
    assert!(fake.calls().is_empty());
}

// === GATT operations ===

#[tokio::test]
async fn discovery_populates_pure_reads() {
    let fake = Arc::new(FakeAdapter::auto());
    fake.set_services(sample_services());
    let central = connected_central(&fake, "dev").await;

    assert!(matches!(
        central.get_services("dev"),
        Err(Error::ServicesNotDiscovered { .. })
    ));

    let services = central.discover_services("dev").await.unwrap();
    assert_eq!(services, vec!["svc-a".to_string(), "svc-b".to_string()]);

    assert_eq!(central.get_services("dev").unwrap(), services);
    assert_eq!(
        central.get_characteristics("dev", "svc-a").unwrap(),
        vec!["chr-1".to_string(), "chr-2".to_string()]
    );
    assert!(matches!(
        central.get_characteristics("dev", "svc-missing"),
        Err(Error::CharacteristicsNotDiscovered { .. })
    ));
}

#[tokio::test]
async fn read_returns_adapter_payload() {
    let fake = Arc::new(FakeAdapter::auto());
    fake.set_read_value(vec![0xDE, 0xAD]);
    let central = connected_central(&fake, "dev").await;

    let value = central
        .read_characteristic("dev", "svc", "chr")
        .await
        .unwrap();
    assert_eq!(value, vec![0xDE, 0xAD]);
}

#[tokio::test]
async fn duplicate_in_flight_read_is_rejected() {
    let fake = Arc::new(FakeAdapter::new());
    let central = Arc::new(BleCentral::new(fake.clone() as Arc<dyn nexus_ble::RadioAdapter>));

    let c = central.clone();
    let connect = tokio::spawn(async move { c.connect("dev").await });
    fake.wait_for_calls(|calls| !calls.is_empty()).await;
    fake.emit(AdapterEvent::ConnectComplete {
        device_id: "dev".to_string(),
        result: Ok(()),
    });
    connect.await.unwrap().unwrap();

    let c = central.clone();
    let first = tokio::spawn(async move { c.read_characteristic("dev", "svc", "chr").await });
    fake.wait_for_calls(|calls| calls.iter().any(|c| matches!(c, Call::Read(..))))
        .await;

    assert!(matches!(
        central.read_characteristic("dev", "svc", "chr").await,
        Err(Error::OperationInProgress { .. })
    ));

    fake.emit(AdapterEvent::ReadComplete {
        device_id: "dev".to_string(),
        service_id: "svc".to_string(),
        characteristic_id: "chr".to_string(),
        result: Ok(vec![7]),
    });

    assert_eq!(first.await.unwrap().unwrap(), vec![7]);
    assert_eq!(fake.count_calls(|c| matches!(c, Call::Read(..))), 1);
}

#[tokio::test]
async fn write_response_mode_is_forwarded_verbatim() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = connected_central(&fake, "dev").await;

    central
        .write_characteristic("dev", "svc", "chr", &[1], true)
        .await
        .unwrap();
    central
        .write_characteristic("dev", "svc", "chr", &[2], false)
        .await
        .unwrap();

    let writes: Vec<bool> = fake
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Write { with_response, .. } => Some(with_response),
            _ => None,
        })
        .collect();
    assert_eq!(writes, vec![true, false]);
}

// === Subscriptions ===

#[tokio::test]
async fn notifications_arrive_in_order() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = connected_central(&fake, "dev").await;

    let mut stream = central
        .subscribe_to_characteristic("dev", "svc", "chr")
        .await
        .unwrap();

    for value in [vec![1], vec![2], vec![3]] {
        fake.emit(AdapterEvent::Notification {
            device_id: "dev".to_string(),
            service_id: "svc".to_string(),
            characteristic_id: "chr".to_string(),
            data: value,
        });
    }

    for expected in [vec![1], vec![2], vec![3]] {
        let got = timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, expected);
    }
}

#[tokio::test]
async fn subscribe_is_idempotent_while_active() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = connected_central(&fake, "dev").await;

    let _first = central
        .subscribe_to_characteristic("dev", "svc", "chr")
        .await
        .unwrap();
    let mut second = central
        .subscribe_to_characteristic("dev", "svc", "chr")
        .await
        .unwrap();

    // One enable request total; the second call joined the live subscription.
    assert_eq!(
        fake.count_calls(|c| matches!(c, Call::SetNotify { enabled: true, .. })),
        1
    );

    fake.emit(AdapterEvent::Notification {
        device_id: "dev".to_string(),
        service_id: "svc".to_string(),
        characteristic_id: "chr".to_string(),
        data: vec![9],
    });
    assert_eq!(
        timeout(Duration::from_millis(200), second.next())
            .await
            .unwrap()
            .unwrap(),
        vec![9]
    );
}

#[tokio::test]
async fn unsubscribe_roundtrip_silences_callback() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = connected_central(&fake, "dev").await;

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _handle = central
        .subscribe_with_callback("dev", "svc", "chr", move |data| {
            sink.lock().push(data);
        })
        .await
        .unwrap();

    fake.emit(AdapterEvent::Notification {
        device_id: "dev".to_string(),
        service_id: "svc".to_string(),
        characteristic_id: "chr".to_string(),
        data: vec![1],
    });
    eventually(|| seen.lock().len() == 1, "first notification delivered").await;

    central
        .unsubscribe_from_characteristic("dev", "svc", "chr")
        .await
        .unwrap();

    // Injected after unsubscribe completed: must not reach the callback.
    fake.emit(AdapterEvent::Notification {
        device_id: "dev".to_string(),
        service_id: "svc".to_string(),
        characteristic_id: "chr".to_string(),
        data: vec![2],
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().clone(), vec![vec![1]]);

    // The subscription flag is down: a new subscribe issues a new enable.
    let _stream = central
        .subscribe_to_characteristic("dev", "svc", "chr")
        .await
        .unwrap();
    assert_eq!(
        fake.count_calls(|c| matches!(c, Call::SetNotify { enabled: true, .. })),
        2
    );
}

#[tokio::test]
async fn disconnect_tears_down_subscription_streams() {
    let fake = Arc::new(FakeAdapter::auto());
    let central = connected_central(&fake, "dev").await;

    let mut stream = central
        .subscribe_to_characteristic("dev", "svc", "chr")
        .await
        .unwrap();

    fake.emit(AdapterEvent::ConnectionLost {
        device_id: "dev".to_string(),
    });

    assert_eq!(
        timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap(),
        None
    );
}
