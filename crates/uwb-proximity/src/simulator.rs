// In-process radio used by the demo and the tests

use crate::driver::{DriverEvent, RadioDriver};
use crate::{DeviceId, DiscoveryEvent, RawPositionSample, Result, SessionConfig, UwbError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How the simulated radio answers a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail(String),
    /// Fail the first `n` requests for the device, then succeed
    FailTimes(u32, String),
    /// Never answer; only the session's timeout ends the attempt
    Hang,
}

#[derive(Default)]
struct SimulatorState {
    sender: Option<mpsc::Sender<DriverEvent>>,
    scan_config: Option<SessionConfig>,
    behaviors: HashMap<DeviceId, ConnectBehavior>,
    connect_requests: HashMap<DeviceId, u32>,
    disconnect_requests: HashMap<DeviceId, u32>,
    fail_start: Option<String>,
}

/// Scriptable `RadioDriver` with injectable events
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<RwLock<SimulatorState>>,
    default_behavior: ConnectBehavior,
    latency: Duration,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(SimulatorState::default())),
            default_behavior: ConnectBehavior::Succeed,
            latency: Duration::ZERO,
        }
    }

    /// Delay before every connect/disconnect answer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_default_behavior(mut self, behavior: ConnectBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub async fn set_behavior(&self, device_id: &str, behavior: ConnectBehavior) {
        self.state
            .write()
            .await
            .behaviors
            .insert(device_id.to_string(), behavior);
    }

    /// Make the next `start_scanning` fail with a driver error
    pub async fn fail_next_start(&self, reason: &str) {
        self.state.write().await.fail_start = Some(reason.to_string());
    }

    pub async fn emit(&self, event: DriverEvent) -> Result<()> {
        let sender = self
            .state
            .read()
            .await
            .sender
            .clone()
            .ok_or_else(|| UwbError::DriverError("radio is not scanning".to_string()))?;

        sender
            .send(event)
            .await
            .map_err(|_| UwbError::DriverError("event channel closed".to_string()))
    }

    pub async fn discover(&self, device_id: &str, signal_strength: f64) -> Result<()> {
        self.emit(DriverEvent::Discovered(DiscoveryEvent::new(device_id, signal_strength)))
            .await
    }

    pub async fn range(&self, sample: RawPositionSample) -> Result<()> {
        self.emit(DriverEvent::Position(sample)).await
    }

    pub async fn lose_link(&self, device_id: &str, error: Option<&str>) -> Result<()> {
        self.emit(DriverEvent::LinkLost {
            device_id: device_id.to_string(),
            error: error.map(str::to_string),
        })
        .await
    }

    pub async fn fail_hardware(&self, reason: &str) -> Result<()> {
        self.emit(DriverEvent::Fatal {
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn connect_requests(&self, device_id: &str) -> u32 {
        self.state
            .read()
            .await
            .connect_requests
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn disconnect_requests(&self, device_id: &str) -> u32 {
        self.state
            .read()
            .await
            .disconnect_requests
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.read().await.sender.is_some()
    }

    /// Options the current scan was started with
    pub async fn scan_config(&self) -> Option<SessionConfig> {
        self.state.read().await.scan_config.clone()
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    async fn start_scanning(&self, config: &SessionConfig) -> Result<mpsc::Receiver<DriverEvent>> {
        let mut state = self.state.write().await;
        if let Some(reason) = state.fail_start.take() {
            return Err(UwbError::DriverError(reason));
        }

        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        state.sender = Some(sender);
        state.scan_config = Some(config.clone());
        info!(
            "Simulated radio scanning (camera assisted: {})",
            config.camera_assisted
        );
        Ok(receiver)
    }

    async fn stop_scanning(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.sender = None;
        state.scan_config = None;
        info!("Simulated radio stopped scanning");
        Ok(())
    }

    async fn request_connect(&self, device_id: &DeviceId) -> Result<()> {
        let (behavior, request_number) = {
            let mut state = self.state.write().await;
            let count = state.connect_requests.entry(device_id.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            let behavior = state
                .behaviors
                .get(device_id)
                .cloned()
                .unwrap_or_else(|| self.default_behavior.clone());
            (behavior, count)
        };
        debug!("Simulated connect request {} for {}", request_number, device_id);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail(reason) => Err(UwbError::DriverError(reason)),
            ConnectBehavior::FailTimes(n, reason) if request_number <= n => {
                Err(UwbError::DriverError(reason))
            }
            ConnectBehavior::FailTimes(..) => Ok(()),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn request_disconnect(&self, device_id: &DeviceId) -> Result<()> {
        {
            let mut state = self.state.write().await;
            *state.disconnect_requests.entry(device_id.clone()).or_insert(0) += 1;
        }
        debug!("Simulated disconnect request for {}", device_id);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }

    fn driver_name(&self) -> &str {
        "Simulated UWB radio"
    }
}
