//! Shared test support: a scriptable in-memory radio adapter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use nexus_ble::adapter::{
    AdapterError, AdapterEvent, DiscoveredService, RadioAdapter, ScanFilter,
};

/// One recorded adapter request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(ScanFilter),
    StopScan,
    OpenConnection(String),
    CloseConnection(String),
    DiscoverServices(String),
    Read(String, String, String),
    Write {
        device_id: String,
        characteristic_id: String,
        data: Vec<u8>,
        with_response: bool,
    },
    SetNotify {
        device_id: String,
        characteristic_id: String,
        enabled: bool,
    },
}

/// In-memory adapter: records every request, and either auto-completes
/// each one with a success event or leaves completion to the test.
pub struct FakeAdapter {
    event_tx: broadcast::Sender<AdapterEvent>,
    calls: Mutex<Vec<Call>>,
    enabled: AtomicBool,
    auto_complete: AtomicBool,
    services: Mutex<Vec<DiscoveredService>>,
    read_value: Mutex<Vec<u8>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            event_tx,
            calls: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
            auto_complete: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            read_value: Mutex::new(Vec::new()),
        }
    }

    /// Auto-complete every request with a success event.
    pub fn auto() -> Self {
        let adapter = Self::new();
        adapter.auto_complete.store(true, Ordering::SeqCst);
        adapter
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// The service enumeration auto-completed discovery reports.
    pub fn set_services(&self, services: Vec<DiscoveredService>) {
        *self.services.lock() = services;
    }

    /// The value auto-completed reads report.
    pub fn set_read_value(&self, value: Vec<u8>) {
        *self.read_value.lock() = value;
    }

    /// Inject an adapter event, as the radio would from its own context.
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count_calls<F: Fn(&Call) -> bool>(&self, pred: F) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Wait until the recorded calls satisfy a predicate.
    pub async fn wait_for_calls<F: Fn(&[Call]) -> bool>(&self, pred: F) {
        for _ in 0..1000 {
            if pred(&self.calls.lock()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("adapter never saw the expected calls: {:?}", self.calls());
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn auto_emit(&self, event: AdapterEvent) {
        if self.auto_complete.load(Ordering::SeqCst) {
            self.emit(event);
        }
    }
}

#[async_trait]
impl RadioAdapter for FakeAdapter {
    async fn is_enabled(&self) -> Result<bool, AdapterError> {
        Ok(self.enabled.load(Ordering::SeqCst))
    }

    async fn request_enable(&self) -> Result<(), AdapterError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<(), AdapterError> {
        self.record(Call::StartScan(filter.clone()));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn open_connection(&self, device_id: &str) -> Result<(), AdapterError> {
        self.record(Call::OpenConnection(device_id.to_string()));
        self.auto_emit(AdapterEvent::ConnectComplete {
            device_id: device_id.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    async fn close_connection(&self, device_id: &str) -> Result<(), AdapterError> {
        self.record(Call::CloseConnection(device_id.to_string()));
        self.auto_emit(AdapterEvent::DisconnectComplete {
            device_id: device_id.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<(), AdapterError> {
        self.record(Call::DiscoverServices(device_id.to_string()));
        let services = self.services.lock().clone();
        self.auto_emit(AdapterEvent::ServicesDiscovered {
            device_id: device_id.to_string(),
            result: Ok(services),
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), AdapterError> {
        self.record(Call::Read(
            device_id.to_string(),
            service_id.to_string(),
            characteristic_id.to_string(),
        ));
        let value = self.read_value.lock().clone();
        self.auto_emit(AdapterEvent::ReadComplete {
            device_id: device_id.to_string(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            result: Ok(value),
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), AdapterError> {
        self.record(Call::Write {
            device_id: device_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            data: data.to_vec(),
            with_response,
        });
        self.auto_emit(AdapterEvent::WriteComplete {
            device_id: device_id.to_string(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            result: Ok(()),
        });
        Ok(())
    }

    async fn set_notification_state(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        self.record(Call::SetNotify {
            device_id: device_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            enabled,
        });
        let event = if enabled {
            AdapterEvent::SubscribeComplete {
                device_id: device_id.to_string(),
                service_id: service_id.to_string(),
                characteristic_id: characteristic_id.to_string(),
                result: Ok(()),
            }
        } else {
            AdapterEvent::UnsubscribeComplete {
                device_id: device_id.to_string(),
                service_id: service_id.to_string(),
                characteristic_id: characteristic_id.to_string(),
                result: Ok(()),
            }
        };
        self.auto_emit(event);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.event_tx.subscribe()
    }
}

/// Poll a condition until it holds or the test times out.
pub async fn eventually<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for: {what}");
}
