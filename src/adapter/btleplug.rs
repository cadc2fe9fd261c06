//! btleplug-backed radio adapter.
//!
//! Production [`RadioAdapter`] implementation over the cross-platform
//! btleplug stack (BlueZ / CoreBluetooth / WinRT). Translates btleplug
//! central events and per-request futures into [`AdapterEvent`]s.

use btleplug::api::{
    Central, CentralState, Characteristic, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    AdapterError, AdapterEvent, DeviceDescriptor, DiscoveredService, RadioAdapter, ScanFilter,
};
use async_trait::async_trait;

/// Cached characteristic handle plus the service it belongs to.
type CharEntry = (String, Characteristic);

/// Radio adapter backed by btleplug.
pub struct BtleplugAdapter {
    /// The platform BLE adapter.
    adapter: Adapter,
    /// Channel for adapter events.
    event_tx: broadcast::Sender<AdapterEvent>,
    /// Peripheral handles by device identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Per-device characteristic cache, keyed by characteristic UUID string.
    characteristics: Arc<RwLock<HashMap<String, HashMap<String, CharEntry>>>>,
    /// Devices with a close_connection request in flight, so the central
    /// disconnect event is not reported as unsolicited.
    expected_closes: Arc<Mutex<HashSet<String>>>,
    /// Per-device notification pump tasks.
    notify_tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
    /// Handle to the central event pump.
    pump_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BtleplugAdapter {
    /// Create an adapter on the first available platform Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> std::result::Result<Self, AdapterError> {
        let manager = Manager::new()
            .await
            .map_err(|_e| AdapterError::backend("Bluetooth not available"))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| AdapterError::backend(e.to_string()))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::backend("no Bluetooth adapter present"))?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create an adapter over a specific btleplug adapter.
    ///
    /// Must be called from within a tokio runtime; the central event pump
    /// is spawned immediately.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        let this = Self {
            adapter,
            event_tx,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            expected_closes: Arc::new(Mutex::new(HashSet::new())),
            notify_tasks: Arc::new(Mutex::new(HashMap::new())),
            pump_handle: Mutex::new(None),
        };

        this.spawn_event_pump();
        this
    }

    /// Look up a peripheral handle by device identifier.
    fn peripheral(&self, device_id: &str) -> std::result::Result<Peripheral, AdapterError> {
        self.peripherals
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| {
                AdapterError::backend(format!("peripheral not discovered: {device_id}"))
            })
    }

    /// Look up a cached characteristic handle.
    fn characteristic(
        &self,
        device_id: &str,
        characteristic_id: &str,
    ) -> std::result::Result<Characteristic, AdapterError> {
        self.characteristics
            .read()
            .get(device_id)
            .and_then(|chars| chars.get(characteristic_id))
            .map(|(_, c)| c.clone())
            .ok_or_else(|| {
                AdapterError::backend(format!(
                    "characteristic not discovered: {characteristic_id}"
                ))
            })
    }

    /// Spawn the task translating btleplug central events into adapter events.
    fn spawn_event_pump(&self) {
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let characteristics = self.characteristics.clone();
        let expected_closes = self.expected_closes.clone();
        let notify_tasks = self.notify_tasks.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get central events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                use btleplug::api::CentralEvent;

                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                        Self::process_advertisement(&adapter, id, &peripherals, &event_tx).await;
                    }
                    CentralEvent::DeviceConnected(id) => {
                        debug!("Device connected: {:?}", id);
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let device_id = id.to_string();

                        characteristics.write().remove(&device_id);
                        if let Some(task) = notify_tasks.lock().remove(&device_id) {
                            task.abort();
                        }

                        if expected_closes.lock().remove(&device_id) {
                            // The close_connection task reports the outcome.
                            trace!("Requested disconnect confirmed: {}", device_id);
                        } else {
                            debug!("Unsolicited disconnect: {}", device_id);
                            let _ = event_tx.send(AdapterEvent::ConnectionLost { device_id });
                        }
                    }
                    CentralEvent::ServiceDataAdvertisement { .. } => {}
                    CentralEvent::ServicesAdvertisement { .. } => {}
                    CentralEvent::StateUpdate(state) => {
                        debug!("Central state update: {:?}", state);
                    }
                }
            }

            debug!("Central event pump ended");
        });

        *self.pump_handle.lock() = Some(handle);
    }

    /// Build and emit a descriptor for an advertising peripheral.
    async fn process_advertisement(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &broadcast::Sender<AdapterEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // An advertisement with no signal reading is unusable; drop it with
        // a diagnostic rather than surfacing an error to any caller.
        let rssi = match properties.rssi {
            Some(rssi) => rssi,
            None => {
                trace!("Dropping advertisement without RSSI: {:?}", id);
                return;
            }
        };

        let device_id = id.to_string();

        let descriptor = DeviceDescriptor {
            id: device_id.clone(),
            name: properties.local_name,
            rssi,
            manufacturer_data: properties
                .manufacturer_data
                .into_iter()
                .map(|(company, data)| (format!("{company:04x}"), data))
                .collect(),
            services: properties.services.iter().map(Uuid::to_string).collect(),
            // btleplug does not expose the advertisement's connectable flag.
            connectable: true,
        };

        peripherals.write().insert(device_id, peripheral);

        let _ = event_tx.send(AdapterEvent::Advertisement(descriptor));
    }

    /// Start the per-device notification pump if not already running.
    fn ensure_notification_pump(&self, device_id: &str, peripheral: Peripheral) {
        let mut tasks = self.notify_tasks.lock();
        if tasks.contains_key(device_id) {
            return;
        }

        let device_id = device_id.to_string();
        let characteristics = self.characteristics.clone();
        let event_tx = self.event_tx.clone();

        let task_id = device_id.clone();
        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notification stream for {}: {}", device_id, e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let characteristic_id = notification.uuid.to_string();

                let service_id = characteristics
                    .read()
                    .get(&device_id)
                    .and_then(|chars| chars.get(&characteristic_id))
                    .map(|(service, _)| service.clone());

                let service_id = match service_id {
                    Some(s) => s,
                    None => {
                        trace!(
                            "Notification from unknown characteristic {} on {}",
                            characteristic_id,
                            device_id
                        );
                        continue;
                    }
                };

                trace!(
                    "Notification from {} on {}: {} bytes",
                    characteristic_id,
                    device_id,
                    notification.value.len()
                );

                let _ = event_tx.send(AdapterEvent::Notification {
                    device_id: device_id.clone(),
                    service_id,
                    characteristic_id,
                    data: notification.value,
                });
            }

            debug!("Notification pump for {} ended", device_id);
        });

        tasks.insert(task_id, handle);
    }

    fn parse_filter_services(
        filter: &ScanFilter,
    ) -> std::result::Result<Vec<Uuid>, AdapterError> {
        filter
            .services
            .iter()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| AdapterError::backend(format!("invalid service UUID: {s}")))
            })
            .collect()
    }
}

#[async_trait]
impl RadioAdapter for BtleplugAdapter {
    async fn is_enabled(&self) -> std::result::Result<bool, AdapterError> {
        let state = self
            .adapter
            .adapter_state()
            .await
            .map_err(|e| AdapterError::backend(e.to_string()))?;

        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn request_enable(&self) -> std::result::Result<(), AdapterError> {
        if self.is_enabled().await? {
            return Ok(());
        }
        // No desktop platform lets an application power the radio on.
        Err(AdapterError::Unsupported(
            "radio power-on prompt".to_string(),
        ))
    }

    async fn start_scan(&self, filter: &ScanFilter) -> std::result::Result<(), AdapterError> {
        let services = Self::parse_filter_services(filter)?;

        info!("Starting BLE scan ({} service filters)", services.len());

        self.adapter
            .start_scan(btleplug::api::ScanFilter { services })
            .await
            .map_err(|e| AdapterError::backend(e.to_string()))
    }

    async fn stop_scan(&self) -> std::result::Result<(), AdapterError> {
        info!("Stopping BLE scan");

        self.adapter
            .stop_scan()
            .await
            .map_err(|e| AdapterError::backend(e.to_string()))
    }

    async fn open_connection(&self, device_id: &str) -> std::result::Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id)?;
        let device_id = device_id.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = match peripheral.connect().await {
                Ok(()) => {
                    info!("Connected to {}", device_id);
                    Ok(())
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", device_id, e);
                    Err(e.to_string())
                }
            };

            let _ = event_tx.send(AdapterEvent::ConnectComplete { device_id, result });
        });

        Ok(())
    }

    async fn close_connection(&self, device_id: &str) -> std::result::Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id)?;

        self.expected_closes.lock().insert(device_id.to_string());

        let device_id = device_id.to_string();
        let expected_closes = self.expected_closes.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = match peripheral.disconnect().await {
                Ok(()) => {
                    info!("Disconnected from {}", device_id);
                    Ok(())
                }
                Err(e) => {
                    error!("Disconnect from {} failed: {}", device_id, e);
                    expected_closes.lock().remove(&device_id);
                    Err(e.to_string())
                }
            };

            let _ = event_tx.send(AdapterEvent::DisconnectComplete { device_id, result });
        });

        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> std::result::Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id)?;
        let device_id = device_id.to_string();
        let characteristics = self.characteristics.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let mut discovered = Vec::new();
                    let mut cache = HashMap::new();

                    for service in peripheral.services() {
                        let service_id = service.uuid.to_string();
                        let mut char_ids = Vec::new();

                        for characteristic in service.characteristics {
                            let char_id = characteristic.uuid.to_string();
                            char_ids.push(char_id.clone());
                            cache.insert(char_id, (service_id.clone(), characteristic));
                        }

                        discovered.push(DiscoveredService {
                            id: service_id,
                            characteristics: char_ids,
                        });
                    }

                    debug!(
                        "Discovered {} services on {}",
                        discovered.len(),
                        device_id
                    );

                    characteristics.write().insert(device_id.clone(), cache);
                    Ok(discovered)
                }
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", device_id, e);
                    Err(e.to_string())
                }
            };

            let _ = event_tx.send(AdapterEvent::ServicesDiscovered { device_id, result });
        });

        Ok(())
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> std::result::Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id)?;
        let characteristic = self.characteristic(device_id, characteristic_id)?;

        let device_id = device_id.to_string();
        let service_id = service_id.to_string();
        let characteristic_id = characteristic_id.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = peripheral
                .read(&characteristic)
                .await
                .map_err(|e| e.to_string());

            if let Ok(ref data) = result {
                trace!(
                    "Read {} bytes from {} on {}",
                    data.len(),
                    characteristic_id,
                    device_id
                );
            }

            let _ = event_tx.send(AdapterEvent::ReadComplete {
                device_id,
                service_id,
                characteristic_id,
                result,
            });
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
    ) -> std::result::Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id)?;
        let characteristic = self.characteristic(device_id, characteristic_id)?;

        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        let device_id = device_id.to_string();
        let service_id = service_id.to_string();
        let characteristic_id = characteristic_id.to_string();
        let data = data.to_vec();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = peripheral
                .write(&characteristic, &data, write_type)
                .await
                .map_err(|e| e.to_string());

            trace!(
                "Wrote {} bytes to {} on {} (response: {})",
                data.len(),
                characteristic_id,
                device_id,
                with_response
            );

            let _ = event_tx.send(AdapterEvent::WriteComplete {
                device_id,
                service_id,
                characteristic_id,
                result,
            });
        });

        Ok(())
    }

    async fn set_notification_state(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        enabled: bool,
    ) -> std::result::Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id)?;
        let characteristic = self.characteristic(device_id, characteristic_id)?;

        if enabled {
            self.ensure_notification_pump(device_id, peripheral.clone());
        }

        let device_id = device_id.to_string();
        let service_id = service_id.to_string();
        let characteristic_id = characteristic_id.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            }
            .map_err(|e| e.to_string());

            debug!(
                "Notification state for {} on {} set to {}: {:?}",
                characteristic_id,
                device_id,
                enabled,
                result.is_ok()
            );

            let event = if enabled {
                AdapterEvent::SubscribeComplete {
                    device_id,
                    service_id,
                    characteristic_id,
                    result,
                }
            } else {
                AdapterEvent::UnsubscribeComplete {
                    device_id,
                    service_id,
                    characteristic_id,
                    result,
                }
            };

            let _ = event_tx.send(event);
        });

        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }
        for (_, task) in self.notify_tasks.lock().drain() {
            task.abort();
        }
    }
}
