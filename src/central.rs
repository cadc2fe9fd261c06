//! The public facade over the central stack.
//!
//! [`BleCentral`] owns the connection registry, the GATT coordinator, the
//! scan slot, and the single pump task that serializes adapter events into
//! state updates and pending-operation resolutions. Every operation that
//! targets a device validates connection-state preconditions locally before
//! touching the adapter, so precondition failures never incur radio latency.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::adapter::{AdapterEvent, RadioAdapter, ScanFilter};
use crate::config::CentralConfig;
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::gatt::{GattCoordinator, NotificationStream, OpKey, OpKind, OpOutcome};
use crate::registry::ConnectionRegistry;
use crate::scan::{DeviceStream, ScanSession};

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Central-role BLE client: scanning, connections, and GATT operations
/// against any number of peripherals at once.
///
/// Explicitly constructed and passed to callers; there is no global
/// instance. The adapter is injected, so the whole stack runs unmodified
/// against the btleplug backend or a test double.
pub struct BleCentral {
    adapter: Arc<dyn RadioAdapter>,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<GattCoordinator>,
    scan: Arc<RwLock<Option<Arc<ScanSession>>>>,
    config: CentralConfig,
    is_running: Arc<AtomicBool>,
    pump_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    callback_counter: AtomicU64,
}

impl BleCentral {
    /// Create a central with default configuration.
    ///
    /// Must be called from within a tokio runtime; the adapter event pump
    /// is spawned immediately.
    pub fn new(adapter: Arc<dyn RadioAdapter>) -> Self {
        Self::with_config(adapter, CentralConfig::default())
    }

    /// Create a central with explicit configuration.
    pub fn with_config(adapter: Arc<dyn RadioAdapter>, config: CentralConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let coordinator = Arc::new(GattCoordinator::new(config.notification_channel_capacity));
        let scan: Arc<RwLock<Option<Arc<ScanSession>>>> = Arc::new(RwLock::new(None));
        let is_running = Arc::new(AtomicBool::new(true));

        let mut events = adapter.events();
        let pump_registry = registry.clone();
        let pump_coordinator = coordinator.clone();
        let pump_scan = scan.clone();
        let pump_running = is_running.clone();

        let handle = tokio::spawn(async move {
            while pump_running.load(Ordering::SeqCst) {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => Self::dispatch(
                            event,
                            &pump_registry,
                            &pump_coordinator,
                            &pump_scan,
                        ),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Adapter event stream lagging, {} events dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Adapter event stream closed");
                            break;
                        }
                    },
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        // Re-check the run flag.
                    }
                }
            }

            debug!("Adapter event pump ended");
        });

        Self {
            adapter,
            registry,
            coordinator,
            scan,
            config,
            is_running,
            pump_handle: RwLock::new(Some(handle)),
            callback_counter: AtomicU64::new(0),
        }
    }

    // === Radio state ===

    /// Whether the Bluetooth radio is powered on.
    pub async fn is_bluetooth_enabled(&self) -> Result<bool> {
        self.adapter.is_enabled().await.map_err(Into::into)
    }

    /// Ask the platform to enable the Bluetooth radio.
    ///
    /// Succeeds trivially when the radio is already on.
    pub async fn request_bluetooth_enable(&self) -> Result<()> {
        self.adapter.request_enable().await.map_err(Into::into)
    }

    // === Scanning ===

    /// Start a scan session and stream matching devices.
    ///
    /// Fails with [`Error::AlreadyScanning`] while a session is active and
    /// [`Error::RadioDisabled`] when Bluetooth is off. The scan runs until
    /// [`stop_scan`](Self::stop_scan); time bounds are the caller's concern.
    pub async fn start_scan(&self, filter: ScanFilter) -> Result<DeviceStream> {
        if self.scan.read().is_some() {
            return Err(Error::AlreadyScanning);
        }

        if !self.adapter.is_enabled().await? {
            return Err(Error::RadioDisabled);
        }

        let session = Arc::new(ScanSession::new(
            filter.clone(),
            self.config.reemit_trigger,
            self.config.scan_channel_capacity,
        ));

        {
            let mut slot = self.scan.write();
            if slot.is_some() {
                return Err(Error::AlreadyScanning);
            }
            *slot = Some(session.clone());
        }

        if let Err(e) = self.adapter.start_scan(&filter).await {
            *self.scan.write() = None;
            return Err(e.into());
        }

        info!("Scan session started");

        Ok(DeviceStream::new(session.subscribe()))
    }

    /// Stop the active scan session. Idempotent.
    pub async fn stop_scan(&self) -> Result<()> {
        let session = self.scan.write().take();

        if session.is_none() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        // The session is already unregistered; nothing routes to it even
        // if the radio stop fails below.
        self.adapter.stop_scan().await?;

        info!("Scan session stopped");

        Ok(())
    }

    /// Whether a scan session is active.
    pub fn is_scanning(&self) -> bool {
        self.scan.read().is_some()
    }

    // === Connections ===

    /// Connect to a device, resolving with its identifier.
    ///
    /// Concurrent calls for the same device coalesce onto a single radio
    /// request and all resolve together. Fails with
    /// [`Error::AlreadyConnected`] when a connection is established.
    pub async fn connect(&self, device_id: &str) -> Result<String> {
        let record = self.registry.get_or_create(device_id);

        match record.state() {
            ConnectionState::Connected => {
                return Err(Error::AlreadyConnected {
                    device_id: device_id.to_string(),
                });
            }
            ConnectionState::Disconnecting => {
                return Err(Error::OperationInProgress {
                    operation: OpKey::device(device_id, OpKind::Disconnect).describe(),
                });
            }
            ConnectionState::Idle | ConnectionState::Connecting => {}
        }

        let (rx, created) = self.coordinator.connect_slot(device_id);

        if created {
            record.set_state(ConnectionState::Connecting);

            if let Err(e) = self.adapter.open_connection(device_id).await {
                record.reset_to_idle();
                self.coordinator
                    .resolve(&OpKey::device(device_id, OpKind::Connect), Err(e.into()));
            }
        }

        Self::await_op(rx).await?;
        Ok(device_id.to_string())
    }

    /// Disconnect from a device.
    ///
    /// Trivially succeeds on an `Idle` record; every outstanding operation
    /// for the device fails with [`Error::DeviceDisconnected`] once the
    /// teardown completes.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let record = self
            .registry
            .get(device_id)
            .ok_or_else(|| Error::UnknownDevice {
                device_id: device_id.to_string(),
            })?;

        match record.state() {
            ConnectionState::Idle => return Ok(()),
            ConnectionState::Connecting => {
                return Err(Error::OperationInProgress {
                    operation: OpKey::device(device_id, OpKind::Connect).describe(),
                });
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {}
        }

        let key = OpKey::device(device_id, OpKind::Disconnect);
        let rx = self.coordinator.register(key.clone())?;

        record.set_state(ConnectionState::Disconnecting);

        if let Err(e) = self.adapter.close_connection(device_id).await {
            // The radio refused to even start the teardown; the link is
            // unusable either way, so clear the record.
            record.reset_to_idle();
            self.coordinator.resolve(&key, Err(e.into()));
            self.coordinator.fail_device(
                device_id,
                Error::DeviceDisconnected {
                    device_id: device_id.to_string(),
                },
            );
            self.coordinator.drop_device_channels(device_id);
        }

        Self::await_op(rx).await.map(|_| ())
    }

    /// Whether the device is currently connected. Pure local read.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.registry.is_connected(device_id)
    }

    /// Identifiers of all currently connected devices. Pure local read.
    pub fn connected_devices(&self) -> Vec<String> {
        self.registry.connected_devices()
    }

    // === GATT ===

    /// Enumerate the device's services, resolving with their identifiers.
    pub async fn discover_services(&self, device_id: &str) -> Result<Vec<String>> {
        let _record = self.require_connected(device_id)?;

        let key = OpKey::device(device_id, OpKind::DiscoverServices);
        let rx = self.coordinator.register(key.clone())?;

        if let Err(e) = self.adapter.discover_services(device_id).await {
            self.coordinator.resolve(&key, Err(e.into()));
        }

        match Self::await_op(rx).await? {
            OpOutcome::Services(services) => Ok(services.into_iter().map(|s| s.id).collect()),
            other => Err(Error::Internal(format!(
                "unexpected discovery payload: {other:?}"
            ))),
        }
    }

    /// Already-discovered service identifiers. Pure local read; fails with
    /// [`Error::ServicesNotDiscovered`] before discovery completes.
    pub fn get_services(&self, device_id: &str) -> Result<Vec<String>> {
        let record = self.require_connected(device_id)?;
        record.services()
    }

    /// Already-discovered characteristics of one service. Pure local read.
    pub fn get_characteristics(&self, device_id: &str, service_id: &str) -> Result<Vec<String>> {
        let record = self.require_connected(device_id)?;
        record.characteristics(service_id)
    }

    /// Read a characteristic value.
    pub async fn read_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>> {
        let _record = self.require_connected(device_id)?;

        let key = OpKey::characteristic(device_id, service_id, characteristic_id, OpKind::Read);
        let rx = self.coordinator.register(key.clone())?;

        if let Err(e) = self
            .adapter
            .read_characteristic(device_id, service_id, characteristic_id)
            .await
        {
            self.coordinator.resolve(&key, Err(e.into()));
        }

        match Self::await_op(rx).await? {
            OpOutcome::Data(data) => Ok(data),
            other => Err(Error::Internal(format!(
                "unexpected read payload: {other:?}"
            ))),
        }
    }

    /// Write a characteristic value.
    ///
    /// With `with_response` the result reflects peripheral acknowledgment;
    /// without, it reflects local acceptance for transmission. The flag is
    /// forwarded to the radio verbatim.
    pub async fn write_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let _record = self.require_connected(device_id)?;

        let key = OpKey::characteristic(device_id, service_id, characteristic_id, OpKind::Write);
        let rx = self.coordinator.register(key.clone())?;

        if let Err(e) = self
            .adapter
            .write_characteristic(device_id, service_id, characteristic_id, data, with_response)
            .await
        {
            self.coordinator.resolve(&key, Err(e.into()));
        }

        Self::await_op(rx).await.map(|_| ())
    }

    /// Enable notifications for a characteristic and stream its values.
    ///
    /// A second call while the subscription is active succeeds without a
    /// second radio request and returns a fresh stream on the same
    /// subscription. The stream ends on unsubscribe or disconnect.
    pub async fn subscribe_to_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<NotificationStream> {
        let record = self.require_connected(device_id)?;

        if record.is_subscribed(characteristic_id) {
            debug!(
                "Already subscribed to {} on {}, returning existing subscription",
                characteristic_id, device_id
            );
            return Ok(NotificationStream::new(
                self.coordinator
                    .notification_channel(device_id, characteristic_id),
            ));
        }

        let key = OpKey::characteristic(
            device_id,
            service_id,
            characteristic_id,
            OpKind::Subscribe,
        );
        let rx = self.coordinator.register(key.clone())?;

        // Open the channel before the radio call so no notification that
        // arrives right after the enable can slip past the caller.
        let notify_rx = self
            .coordinator
            .notification_channel(device_id, characteristic_id);

        if let Err(e) = self
            .adapter
            .set_notification_state(device_id, service_id, characteristic_id, true)
            .await
        {
            self.coordinator
                .drop_notification_channel(device_id, characteristic_id);
            self.coordinator.resolve(&key, Err(e.into()));
        }

        Self::await_op(rx).await?;

        Ok(NotificationStream::new(notify_rx))
    }

    /// Disable notifications for a characteristic.
    ///
    /// Trivially succeeds when no subscription is active. On success the
    /// subscription flag is cleared and live streams for the
    /// characteristic end.
    pub async fn unsubscribe_from_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<()> {
        let record = self.require_connected(device_id)?;

        if !record.is_subscribed(characteristic_id) {
            return Ok(());
        }

        let key = OpKey::characteristic(
            device_id,
            service_id,
            characteristic_id,
            OpKind::Unsubscribe,
        );
        let rx = self.coordinator.register(key.clone())?;

        if let Err(e) = self
            .adapter
            .set_notification_state(device_id, service_id, characteristic_id, false)
            .await
        {
            self.coordinator.resolve(&key, Err(e.into()));
        }

        Self::await_op(rx).await.map(|_| ())
    }

    /// Subscribe and pump every notified value into a callback.
    ///
    /// The callback stops firing once the subscription ends; dropping the
    /// returned handle stops it early without unsubscribing.
    pub async fn subscribe_with_callback<F>(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        callback: F,
    ) -> Result<CallbackHandle>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let mut stream = self
            .subscribe_to_characteristic(device_id, service_id, characteristic_id)
            .await?;

        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                callback(data);
            }
        });

        Ok(CallbackHandle::new(callback_id, move || {
            handle.abort();
        }))
    }

    // === Lifecycle ===

    /// Clean shutdown: stop scanning, disconnect everything, end the pump.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down BLE central");

        if let Err(e) = self.stop_scan().await {
            warn!("Error stopping scan during shutdown: {}", e);
        }

        for device_id in self.registry.connected_devices() {
            if let Err(e) = self.disconnect(&device_id).await {
                warn!("Error disconnecting {} during shutdown: {}", device_id, e);
            }
        }

        self.is_running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.pump_handle.write().take() {
            let _ = handle.await;
        }

        Ok(())
    }

    // === Internals ===

    fn require_connected(&self, device_id: &str) -> Result<Arc<crate::connection::DeviceConnection>> {
        let record = self
            .registry
            .get(device_id)
            .ok_or_else(|| Error::UnknownDevice {
                device_id: device_id.to_string(),
            })?;

        record.ensure_connected()?;
        Ok(record)
    }

    async fn await_op(rx: crate::gatt::OpReceiver) -> Result<OpOutcome> {
        rx.await
            .map_err(|_| Error::Internal("completion slot dropped without resolution".to_string()))?
    }

    /// Apply one adapter event to the stack. Runs on the pump task only,
    /// which is what serializes per-device completion order and
    /// per-characteristic notification FIFO.
    fn dispatch(
        event: AdapterEvent,
        registry: &Arc<ConnectionRegistry>,
        coordinator: &Arc<GattCoordinator>,
        scan: &Arc<RwLock<Option<Arc<ScanSession>>>>,
    ) {
        match event {
            AdapterEvent::Advertisement(descriptor) => {
                let session = scan.read().clone();
                match session {
                    Some(session) => session.handle_advertisement(descriptor),
                    None => trace!("Advertisement with no active scan: {}", descriptor.id),
                }
            }

            AdapterEvent::ConnectComplete { device_id, result } => {
                let key = OpKey::device(&device_id, OpKind::Connect);
                let record = registry.get(&device_id);

                match result {
                    Ok(()) => {
                        if let Some(record) = record {
                            record.set_state(ConnectionState::Connected);
                        }
                        coordinator.resolve(&key, Ok(OpOutcome::Done));
                    }
                    Err(message) => {
                        if let Some(record) = record {
                            record.reset_to_idle();
                        }
                        coordinator.resolve(&key, Err(Error::AdapterRejected { message }));
                    }
                }
            }

            AdapterEvent::DisconnectComplete { device_id, result } => {
                let key = OpKey::device(&device_id, OpKind::Disconnect);

                // Either outcome leaves the record cleared: a peripheral
                // that cannot confirm disconnect is still unusable.
                if let Some(record) = registry.get(&device_id) {
                    record.reset_to_idle();
                }

                coordinator.resolve(
                    &key,
                    result
                        .map(|()| OpOutcome::Done)
                        .map_err(|message| Error::AdapterRejected { message }),
                );

                coordinator.fail_device(
                    &device_id,
                    Error::DeviceDisconnected {
                        device_id: device_id.clone(),
                    },
                );
                coordinator.drop_device_channels(&device_id);
            }

            AdapterEvent::ConnectionLost { device_id } => {
                debug!("Unsolicited disconnect from {}", device_id);

                if let Some(record) = registry.get(&device_id) {
                    record.reset_to_idle();
                }

                coordinator.fail_device(
                    &device_id,
                    Error::DeviceDisconnected {
                        device_id: device_id.clone(),
                    },
                );
                coordinator.drop_device_channels(&device_id);
            }

            AdapterEvent::ServicesDiscovered { device_id, result } => {
                let key = OpKey::device(&device_id, OpKind::DiscoverServices);

                match result {
                    Ok(services) => {
                        if let Some(record) = registry.get(&device_id) {
                            record.populate_services(&services);
                        }
                        coordinator.resolve(&key, Ok(OpOutcome::Services(services)));
                    }
                    Err(message) => {
                        coordinator.resolve(&key, Err(Error::AdapterRejected { message }));
                    }
                }
            }

            AdapterEvent::ReadComplete {
                device_id,
                service_id,
                characteristic_id,
                result,
            } => {
                let key = OpKey::characteristic(
                    &device_id,
                    &service_id,
                    &characteristic_id,
                    OpKind::Read,
                );
                coordinator.resolve(
                    &key,
                    result
                        .map(OpOutcome::Data)
                        .map_err(|message| Error::AdapterRejected { message }),
                );
            }

            AdapterEvent::WriteComplete {
                device_id,
                service_id,
                characteristic_id,
                result,
            } => {
                let key = OpKey::characteristic(
                    &device_id,
                    &service_id,
                    &characteristic_id,
                    OpKind::Write,
                );
                coordinator.resolve(
                    &key,
                    result
                        .map(|()| OpOutcome::Done)
                        .map_err(|message| Error::AdapterRejected { message }),
                );
            }

            AdapterEvent::SubscribeComplete {
                device_id,
                service_id,
                characteristic_id,
                result,
            } => {
                let key = OpKey::characteristic(
                    &device_id,
                    &service_id,
                    &characteristic_id,
                    OpKind::Subscribe,
                );

                match result {
                    Ok(()) => {
                        if let Some(record) = registry.get(&device_id) {
                            record.set_subscribed(&characteristic_id, true);
                        }
                        coordinator.resolve(&key, Ok(OpOutcome::Done));
                    }
                    Err(message) => {
                        coordinator.drop_notification_channel(&device_id, &characteristic_id);
                        coordinator.resolve(&key, Err(Error::AdapterRejected { message }));
                    }
                }
            }

            AdapterEvent::UnsubscribeComplete {
                device_id,
                service_id,
                characteristic_id,
                result,
            } => {
                let key = OpKey::characteristic(
                    &device_id,
                    &service_id,
                    &characteristic_id,
                    OpKind::Unsubscribe,
                );

                match result {
                    Ok(()) => {
                        if let Some(record) = registry.get(&device_id) {
                            record.set_subscribed(&characteristic_id, false);
                        }
                        coordinator.drop_notification_channel(&device_id, &characteristic_id);
                        coordinator.resolve(&key, Ok(OpOutcome::Done));
                    }
                    Err(message) => {
                        // The radio still has the registration active, so
                        // the subscription flag stays set.
                        coordinator.resolve(&key, Err(Error::AdapterRejected { message }));
                    }
                }
            }

            AdapterEvent::Notification {
                device_id,
                characteristic_id,
                data,
                ..
            } => {
                coordinator.route_notification(&device_id, &characteristic_id, data);
            }
        }
    }
}

impl Drop for BleCentral {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}
