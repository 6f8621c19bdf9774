// Session facade - wires registry, discovery, connections and positions together
// and serializes every driver event and connect outcome through one lock

use crate::connection::{ConnectAttempt, ConnectionManager, Resolution, RetryPlan};
use crate::discovery::{DiscoveryListener, DiscoveryOutcome};
use crate::driver::{DriverEvent, RadioDriver};
use crate::position::{PositionRefiner, PositionStream};
use crate::registry::DeviceRegistry;
use crate::subscription::{SessionObserver, SubscriberSet, SubscriptionHandle};
use crate::{
    ConnectionState, Device, DeviceId, ErrorContext, Result, SessionConfig, SessionEvent,
    SessionInfo, SessionStats, UwbError,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything that only exists while a session is running
struct ActiveSession {
    info: SessionInfo,
    registry: DeviceRegistry,
    discovery: DiscoveryListener,
    connections: ConnectionManager,
    positions: PositionStream,
    subscribers: SubscriberSet,
    ingest_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn new(config: &SessionConfig) -> Self {
        Self {
            info: SessionInfo {
                session_id: Uuid::new_v4(),
                started_at: Utc::now(),
                auto_connect: config.auto_connect,
                camera_assisted: config.camera_assisted,
            },
            registry: DeviceRegistry::new(config.max_devices),
            discovery: DiscoveryListener::new(),
            connections: ConnectionManager::new(config.retry.clone()),
            positions: PositionStream::new(),
            subscribers: SubscriberSet::new(),
            ingest_task: None,
        }
    }

    fn publish(&self, event: SessionEvent) {
        self.subscribers.publish(&event);
    }

    fn linked_devices(&self) -> Vec<DeviceId> {
        let mut ids = self.registry.ids_in_state(ConnectionState::Connected);
        ids.extend(self.registry.ids_in_state(ConnectionState::Connecting));
        ids
    }
}

struct SessionState {
    config: SessionConfig,
    /// Bumped on every start/stop/termination; tasks from older epochs are ignored
    epoch: u64,
    active: Option<ActiveSession>,
}

impl SessionState {
    fn active_mut(&mut self) -> Result<&mut ActiveSession> {
        self.active.as_mut().ok_or(UwbError::NotStarted)
    }

    fn active(&self) -> Result<&ActiveSession> {
        self.active.as_ref().ok_or(UwbError::NotStarted)
    }
}

struct SessionShared {
    driver: Arc<dyn RadioDriver>,
    refiner: Option<Arc<dyn PositionRefiner>>,
    state: Mutex<SessionState>,
    /// Cancelled when the owning `UwbSession` is dropped
    shutdown: CancellationToken,
}

/// Public entry point: one ranging session over one radio driver
pub struct UwbSession {
    shared: Arc<SessionShared>,
}

impl UwbSession {
    pub fn new(driver: Arc<dyn RadioDriver>) -> Self {
        Self::build(driver, None)
    }

    /// Session with a secondary sensor used when `camera_assisted` is enabled
    pub fn with_refiner(driver: Arc<dyn RadioDriver>, refiner: Arc<dyn PositionRefiner>) -> Self {
        Self::build(driver, Some(refiner))
    }

    fn build(driver: Arc<dyn RadioDriver>, refiner: Option<Arc<dyn PositionRefiner>>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                driver,
                refiner,
                state: Mutex::new(SessionState {
                    config: SessionConfig::default(),
                    epoch: 0,
                    active: None,
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Replace the configuration. Only allowed while the session is not running.
    pub async fn configure(&self, config: SessionConfig) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.active.is_some() {
            return Err(UwbError::InvalidState(
                "cannot configure a running session".to_string(),
            ));
        }
        config.validate()?;

        debug!("Session configured: {:?}", config);
        state.config = config;
        Ok(())
    }

    pub async fn config(&self) -> SessionConfig {
        self.shared.state.lock().await.config.clone()
    }

    /// Start scanning. Calling it on a running session returns the existing session.
    pub async fn start(&self) -> Result<SessionInfo> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        if let Some(active) = &state.active {
            debug!("Session {} already running", active.info.session_id);
            return Ok(active.info.clone());
        }

        state.config.validate()?;
        let events = self.shared.driver.start_scanning(&state.config).await?;

        state.epoch += 1;
        let epoch = state.epoch;
        let mut active = ActiveSession::new(&state.config);
        let info = active.info.clone();

        let shared = Arc::clone(&self.shared);
        active.ingest_task = Some(self.shared.spawn_cancellable(async move {
            shared.run_ingest(epoch, events).await;
        }));
        state.active = Some(active);

        info!(
            session_id = %info.session_id,
            driver = self.shared.driver.driver_name(),
            auto_connect = info.auto_connect,
            camera_assisted = info.camera_assisted,
            "UWB session started"
        );
        Ok(info)
    }

    /// Stop scanning, cancel pending attempts, disconnect linked devices and
    /// drop all session state.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let mut active = state.active.take().ok_or(UwbError::NotStarted)?;
        state.epoch += 1;
        let timeout = state.config.connect_timeout;

        if let Some(task) = active.ingest_task.take() {
            task.abort();
        }
        active.connections.cancel_all();
        let earlier = active.connections.take_all_disconnects();

        let mut requests = JoinSet::new();
        for device_id in active.linked_devices() {
            let _ = active
                .registry
                .set_state(&device_id, ConnectionState::Disconnected);
            let driver = Arc::clone(&self.shared.driver);
            let id = device_id.clone();
            requests.spawn(async move {
                let result = driver.request_disconnect(&id).await;
                (id, result)
            });
            active.publish(SessionEvent::DeviceDisconnected {
                device_id,
                error: None,
            });
        }

        // Every disconnect must reach the radio before it can be handed to a new session
        let abort_handles: Vec<_> = earlier.iter().map(|task| task.abort_handle()).collect();
        let drained = tokio::time::timeout(timeout, async {
            for task in earlier {
                let _ = task.await;
            }
            while let Some(joined) = requests.join_next().await {
                match joined {
                    Ok((device_id, Ok(()))) => debug!("Disconnected {} during stop", device_id),
                    Ok((device_id, Err(e))) => {
                        warn!("Driver failed to disconnect {} during stop: {}", device_id, e)
                    }
                    Err(e) => warn!("Disconnect task failed during stop: {}", e),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Timed out after {:?} waiting for the radio to release devices", timeout);
            requests.abort_all();
            for handle in abort_handles {
                handle.abort();
            }
        }

        if let Err(e) = self.shared.driver.stop_scanning().await {
            e.log_with_context(
                &ErrorContext::new()
                    .with_session_id(active.info.session_id)
                    .with_info("stop_scanning"),
            );
        }

        active.publish(SessionEvent::SessionStopped);
        info!(session_id = %active.info.session_id, "UWB session stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.active.is_some()
    }

    pub async fn info(&self) -> Result<SessionInfo> {
        let state = self.shared.state.lock().await;
        Ok(state.active()?.info.clone())
    }

    pub async fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> Result<SubscriptionHandle> {
        let mut state = self.shared.state.lock().await;
        Ok(state.active_mut()?.subscribers.subscribe(observer))
    }

    /// Subscribe through a channel instead of an observer
    pub async fn subscribe_channel(
        &self,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        let mut state = self.shared.state.lock().await;
        Ok(state.active_mut()?.subscribers.subscribe_channel())
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.active_mut()?.subscribers.unsubscribe(handle)
    }

    /// Request a connection. Returns once the attempt is issued; the outcome
    /// arrives as a `DeviceConnected` or `DeviceConnectFailed` notification.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let epoch = state.epoch;
        let timeout = state.config.connect_timeout;
        let active = state.active_mut()?;

        let (attempt, event) = active.connections.connect(&mut active.registry, device_id)?;
        active.publish(event);
        self.shared.spawn_attempt(active, epoch, timeout, attempt);
        Ok(())
    }

    /// Disconnect a connected device or cancel an in-flight attempt
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let timeout = state.config.connect_timeout;
        let active = state.active_mut()?;

        self.shared.disconnect_device(active, device_id, timeout)
    }

    /// Remove a device from the session, disconnecting it first if linked
    pub async fn forget(&self, device_id: &str) -> Result<Device> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let timeout = state.config.connect_timeout;
        let active = state.active_mut()?;

        if matches!(
            active.registry.state(device_id)?,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.shared.disconnect_device(active, device_id, timeout)?;
        }

        active.connections.forget(device_id);
        active.positions.reset(device_id);
        active.registry.remove(device_id)
    }

    pub async fn device(&self, device_id: &str) -> Result<Device> {
        let state = self.shared.state.lock().await;
        state.active()?.registry.get(device_id).cloned()
    }

    /// Known devices in discovery order
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let state = self.shared.state.lock().await;
        Ok(state.active()?.registry.list())
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let state = self.shared.state.lock().await;
        let active = state.active()?;
        Ok(SessionStats {
            devices: active.registry.len(),
            connected: active.registry.ids_in_state(ConnectionState::Connected).len(),
            dropped_discovery_events: active.discovery.dropped(),
            dropped_position_samples: active.positions.dropped(),
        })
    }
}

impl Drop for UwbSession {
    fn drop(&mut self) {
        // Background tasks hold the shared state; end them so it can be freed
        self.shared.shutdown.cancel();
    }
}

impl SessionShared {
    /// Spawn a session task that ends as soon as the owning `UwbSession` is dropped
    fn spawn_cancellable<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = task => {}
            }
        })
    }

    async fn run_ingest(self: Arc<Self>, epoch: u64, mut events: mpsc::Receiver<DriverEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_driver_event(epoch, event).await {
                break;
            }
        }
        debug!("Driver event ingestion finished (epoch {})", epoch);
    }

    /// Apply one driver event. Returns false when ingestion should stop.
    async fn handle_driver_event(self: &Arc<Self>, epoch: u64, event: DriverEvent) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch != epoch {
            return false;
        }

        let config = state.config.clone();
        let Some(active) = state.active.as_mut() else {
            return false;
        };

        match event {
            DriverEvent::Discovered(discovery) => {
                match active.discovery.process(&mut active.registry, discovery) {
                    DiscoveryOutcome::Discovered { device, evicted } => {
                        if let Some(evicted) = evicted {
                            active.connections.forget(&evicted);
                            active.positions.reset(&evicted);
                            active.publish(SessionEvent::DeviceRemoved { device_id: evicted });
                        }
                        let device_id = device.id.clone();
                        active.publish(SessionEvent::DeviceDiscovered { device });

                        if config.auto_connect {
                            match active.connections.connect(&mut active.registry, &device_id) {
                                Ok((attempt, event)) => {
                                    active.publish(event);
                                    self.spawn_attempt(active, epoch, config.connect_timeout, attempt);
                                }
                                Err(e) => warn!("Auto-connect to {} failed: {}", device_id, e),
                            }
                        }
                    }
                    DiscoveryOutcome::Updated(device) => {
                        active.publish(SessionEvent::DeviceUpdated { device });
                    }
                    DiscoveryOutcome::Dropped(_) => {}
                }
            }
            DriverEvent::Position(raw) => {
                let refiner = if config.camera_assisted {
                    self.refiner.as_deref()
                } else {
                    None
                };
                if let Some(sample) = active.positions.accept(&mut active.registry, raw, refiner) {
                    active.publish(SessionEvent::PositionUpdated { sample });
                }
            }
            DriverEvent::LinkLost { device_id, error } => {
                if let Some(event) = active.connections.link_lost(&mut active.registry, &device_id, error) {
                    active.positions.reset(&device_id);
                    active.publish(event);
                }
            }
            DriverEvent::Fatal { reason } => {
                self.terminate(state, reason).await;
                return false;
            }
        }

        true
    }

    /// End the session after a driver-fatal error
    async fn terminate(&self, state: &mut SessionState, reason: String) {
        let Some(mut active) = state.active.take() else {
            return;
        };
        state.epoch += 1;

        // Called from the ingest task itself, so its handle is only detached
        active.ingest_task.take();
        active.connections.cancel_all();
        for task in active.connections.take_all_disconnects() {
            task.abort();
        }

        for device_id in active.linked_devices() {
            let _ = active
                .registry
                .set_state(&device_id, ConnectionState::Disconnected);
            active.publish(SessionEvent::DeviceDisconnected {
                device_id,
                error: Some(reason.clone()),
            });
        }

        UwbError::DriverError(reason.clone()).log_with_context(
            &ErrorContext::new()
                .with_session_id(active.info.session_id)
                .with_info("session terminated"),
        );
        active.publish(SessionEvent::SessionTerminated { reason });

        if let Err(e) = self.driver.stop_scanning().await {
            warn!("Failed to release radio after fatal error: {}", e);
        }
    }

    /// Issue the driver request for an attempt, bounded by the connect timeout
    fn spawn_attempt(
        self: &Arc<Self>,
        active: &mut ActiveSession,
        epoch: u64,
        timeout: Duration,
        attempt: ConnectAttempt,
    ) {
        let shared = Arc::clone(self);
        let device_id = attempt.device_id.clone();
        let pending_disconnect = active.connections.take_disconnect(&device_id);

        let task = self.spawn_cancellable(async move {
            // The radio must finish releasing the device before linking it again
            if let Some(pending) = pending_disconnect {
                let _ = pending.await;
            }
            let outcome =
                match tokio::time::timeout(timeout, shared.driver.request_connect(&attempt.device_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(UwbError::Timeout(format!(
                        "connect to {} after {:?}",
                        attempt.device_id, timeout
                    ))),
                };
            shared.complete_attempt(epoch, attempt, outcome).await;
        });

        active.connections.track_task(&device_id, task);
    }

    async fn complete_attempt(self: &Arc<Self>, epoch: u64, attempt: ConnectAttempt, outcome: Result<()>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch != epoch {
            debug!("Ignoring connect outcome for {} from a previous session", attempt.device_id);
            return;
        }
        let Some(active) = state.active.as_mut() else {
            return;
        };

        match active.connections.resolve(&mut active.registry, &attempt, outcome) {
            Resolution::Connected(event) => {
                active.positions.reset(&attempt.device_id);
                active.publish(event);
            }
            Resolution::Failed { event, retry } => {
                active.publish(event);
                if let Some(plan) = retry {
                    self.spawn_retry(active, epoch, plan);
                }
            }
            Resolution::Stale => {}
        }
    }

    fn spawn_retry(self: &Arc<Self>, active: &mut ActiveSession, epoch: u64, plan: RetryPlan) {
        let shared = Arc::clone(self);
        let device_id = plan.device_id.clone();

        let task = self.spawn_cancellable(async move {
            tokio::time::sleep(plan.delay).await;
            shared.retry_due(epoch, plan).await;
        });

        active.connections.track_task(&device_id, task);
    }

    async fn retry_due(self: &Arc<Self>, epoch: u64, plan: RetryPlan) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch != epoch {
            return;
        }
        let timeout = state.config.connect_timeout;
        let Some(active) = state.active.as_mut() else {
            return;
        };

        if let Some((attempt, event)) = active.connections.retry_due(&mut active.registry, &plan) {
            info!("Retrying connection to {} (attempt {})", attempt.device_id, attempt.attempt);
            active.publish(event);
            self.spawn_attempt(active, epoch, timeout, attempt);
        }
    }

    fn disconnect_device(&self, active: &mut ActiveSession, device_id: &str, timeout: Duration) -> Result<()> {
        let (previous, event) = active.connections.disconnect(&mut active.registry, device_id)?;
        active.positions.reset(device_id);
        active.publish(event);

        let earlier = active.connections.take_disconnect(device_id);
        let driver = Arc::clone(&self.driver);
        let id = device_id.to_string();
        let task = tokio::spawn(async move {
            if let Some(earlier) = earlier {
                let _ = earlier.await;
            }
            match tokio::time::timeout(timeout, driver.request_disconnect(&id)).await {
                Ok(Ok(())) => debug!("Driver released {} (was {})", id, previous),
                Ok(Err(e)) => warn!("Driver failed to disconnect {}: {}", id, e),
                Err(_) => warn!("Timed out disconnecting {}", id),
            }
        });
        active.connections.track_disconnect(device_id, task);
        Ok(())
    }
}
