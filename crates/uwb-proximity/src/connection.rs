// Connection Manager - per-device connection state machine with retry/backoff

use crate::registry::DeviceRegistry;
use crate::{ConnectionState, DeviceId, Result, SessionEvent, UwbError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for connection retry logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows the `failures`-th failed attempt (1-indexed)
    pub fn calculate_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1) as i32;
        let delay_ms =
            (self.initial_backoff.as_millis() as f64) * self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_millis(delay_ms as u64);

        if delay > self.max_backoff {
            self.max_backoff
        } else {
            delay
        }
    }
}

/// A connect request the session must dispatch to the radio driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub device_id: DeviceId,
    pub generation: u64,
    pub attempt: u32,
}

/// A retry the session must schedule after `delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub device_id: DeviceId,
    pub generation: u64,
    pub delay: Duration,
}

/// What a finished connect attempt did to the state machine
#[derive(Debug, PartialEq)]
pub enum Resolution {
    Connected(SessionEvent),
    Failed {
        event: SessionEvent,
        retry: Option<RetryPlan>,
    },
    /// Attempt was cancelled or superseded; its outcome is discarded
    Stale,
}

#[derive(Default)]
struct AttemptTracker {
    generation: u64,
    attempts: u32,
    task: Option<JoinHandle<()>>,
}

impl AttemptTracker {
    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drives the per-device state machine. Device state itself lives in the registry;
/// this only tracks attempt generations, retry counters and the tasks serving them.
pub struct ConnectionManager {
    trackers: HashMap<DeviceId, AttemptTracker>,
    /// Driver disconnect requests still in flight; they outlive `forget`
    pending_disconnects: HashMap<DeviceId, JoinHandle<()>>,
    retry_config: RetryConfig,
    next_generation: u64,
}

impl ConnectionManager {
    pub fn new(retry_config: RetryConfig) -> Self {
        Self {
            trackers: HashMap::new(),
            pending_disconnects: HashMap::new(),
            retry_config,
            next_generation: 1,
        }
    }

    /// Explicit connect: resets the retry counter and starts a fresh attempt
    pub fn connect(
        &mut self,
        registry: &mut DeviceRegistry,
        device_id: &str,
    ) -> Result<(ConnectAttempt, SessionEvent)> {
        match registry.state(device_id)? {
            ConnectionState::Connecting => {
                debug!("Rejecting connect for {}: attempt already in flight", device_id);
                return Err(UwbError::AlreadyConnecting(device_id.to_string()));
            }
            ConnectionState::Connected => {
                return Err(UwbError::AlreadyConnected(device_id.to_string()));
            }
            _ => {}
        }

        let tracker = self.trackers.entry(device_id.to_string()).or_default();
        // A pending automatic retry is superseded by the explicit request
        tracker.cancel_task();
        tracker.attempts = 0;

        info!("Connecting to device: {}", device_id);
        self.begin_attempt(registry, device_id)
    }

    /// Start the retry planned after a failure, unless something superseded it
    pub fn retry_due(
        &mut self,
        registry: &mut DeviceRegistry,
        plan: &RetryPlan,
    ) -> Option<(ConnectAttempt, SessionEvent)> {
        let current = self.trackers.get(&plan.device_id)?.generation;
        if current != plan.generation || registry.state(&plan.device_id).ok()? != ConnectionState::Failed {
            debug!("Discarding stale retry for {}", plan.device_id);
            return None;
        }

        self.begin_attempt(registry, &plan.device_id).ok()
    }

    fn begin_attempt(
        &mut self,
        registry: &mut DeviceRegistry,
        device_id: &str,
    ) -> Result<(ConnectAttempt, SessionEvent)> {
        let state = registry.state(device_id)?;
        if !state.can_connect() {
            return Err(UwbError::InvalidState(format!(
                "cannot connect {} from state {}",
                device_id, state
            )));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let tracker = self.trackers.entry(device_id.to_string()).or_default();
        tracker.generation = generation;
        tracker.attempts += 1;
        let attempt = tracker.attempts;

        registry.set_state(device_id, ConnectionState::Connecting)?;
        debug!("Connection attempt {} for device {} (generation {})", attempt, device_id, generation);

        Ok((
            ConnectAttempt {
                device_id: device_id.to_string(),
                generation,
                attempt,
            },
            SessionEvent::DeviceConnecting {
                device_id: device_id.to_string(),
                attempt,
            },
        ))
    }

    /// Apply the outcome of a connect attempt (driver callback or timeout).
    /// Only the first outcome for the current generation makes a transition.
    pub fn resolve(
        &mut self,
        registry: &mut DeviceRegistry,
        attempt: &ConnectAttempt,
        outcome: Result<()>,
    ) -> Resolution {
        let device_id = attempt.device_id.as_str();
        let Some(tracker) = self.trackers.get_mut(device_id) else {
            return Resolution::Stale;
        };
        if tracker.generation != attempt.generation
            || registry.state(device_id).ok() != Some(ConnectionState::Connecting)
        {
            debug!("Discarding stale outcome for {} (generation {})", device_id, attempt.generation);
            return Resolution::Stale;
        }

        // The task delivering this outcome is finishing; let it detach
        tracker.task = None;

        match outcome {
            Ok(()) => {
                tracker.attempts = 0;
                if let Err(e) = registry.set_state(device_id, ConnectionState::Connected) {
                    warn!("Connected device {} vanished from registry: {}", device_id, e);
                    return Resolution::Stale;
                }
                info!("Successfully connected to device: {}", device_id);
                Resolution::Connected(SessionEvent::DeviceConnected {
                    device_id: device_id.to_string(),
                })
            }
            Err(err) => {
                let _ = registry.set_state(device_id, ConnectionState::Failed);
                let _ = registry.record_error(device_id, err.to_string());

                let will_retry =
                    err.is_transient() && tracker.attempts < self.retry_config.max_attempts;
                let retry = will_retry.then(|| RetryPlan {
                    device_id: device_id.to_string(),
                    generation: tracker.generation,
                    delay: self.retry_config.calculate_delay(tracker.attempts),
                });

                match &retry {
                    Some(plan) => warn!(
                        "Connection attempt {} failed for device {}: {}. Retrying in {:?}",
                        tracker.attempts, device_id, err, plan.delay
                    ),
                    None => error!(
                        "Failed to connect to device {} after {} attempts: {}",
                        device_id, tracker.attempts, err
                    ),
                }

                Resolution::Failed {
                    event: SessionEvent::DeviceConnectFailed {
                        device_id: device_id.to_string(),
                        attempt: tracker.attempts,
                        error: err.to_string(),
                        will_retry,
                    },
                    retry,
                }
            }
        }
    }

    /// Disconnect a connected device or cancel an in-flight attempt.
    /// Returns the state the device was in and the notification to publish.
    pub fn disconnect(
        &mut self,
        registry: &mut DeviceRegistry,
        device_id: &str,
    ) -> Result<(ConnectionState, SessionEvent)> {
        let previous = registry.state(device_id)?;
        if !matches!(previous, ConnectionState::Connected | ConnectionState::Connecting) {
            return Err(UwbError::NotConnected(device_id.to_string()));
        }

        self.invalidate(device_id);
        registry.set_state(device_id, ConnectionState::Disconnected)?;
        info!("Disconnected from device: {} (was {})", device_id, previous);

        Ok((
            previous,
            SessionEvent::DeviceDisconnected {
                device_id: device_id.to_string(),
                error: None,
            },
        ))
    }

    /// Link dropped by the radio without a local request
    pub fn link_lost(
        &mut self,
        registry: &mut DeviceRegistry,
        device_id: &str,
        error: Option<String>,
    ) -> Option<SessionEvent> {
        if registry.state(device_id).ok()? != ConnectionState::Connected {
            debug!("Ignoring link loss for {}: not connected", device_id);
            return None;
        }

        self.invalidate(device_id);
        registry.set_state(device_id, ConnectionState::Disconnected).ok()?;
        if let Some(error) = &error {
            let _ = registry.record_error(device_id, error.clone());
        }
        warn!("Lost link to device {}: {:?}", device_id, error);

        Some(SessionEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            error,
        })
    }

    /// Remember the task serving the device's current attempt or retry
    pub fn track_task(&mut self, device_id: &str, task: JoinHandle<()>) {
        let tracker = self.trackers.entry(device_id.to_string()).or_default();
        tracker.task = Some(task);
    }

    /// Remember the driver disconnect request serving a device
    pub fn track_disconnect(&mut self, device_id: &str, task: JoinHandle<()>) {
        self.pending_disconnects.insert(device_id.to_string(), task);
    }

    /// Take the device's unfinished disconnect request so the caller can wait on it
    pub fn take_disconnect(&mut self, device_id: &str) -> Option<JoinHandle<()>> {
        self.pending_disconnects
            .remove(device_id)
            .filter(|task| !task.is_finished())
    }

    pub fn take_all_disconnects(&mut self) -> Vec<JoinHandle<()>> {
        self.pending_disconnects
            .drain()
            .map(|(_, task)| task)
            .filter(|task| !task.is_finished())
            .collect()
    }

    /// Drop all tracking for a device, cancelling whatever is in flight
    pub fn forget(&mut self, device_id: &str) {
        if let Some(mut tracker) = self.trackers.remove(device_id) {
            tracker.cancel_task();
        }
    }

    /// Cancel every pending attempt and retry timer
    pub fn cancel_all(&mut self) {
        let count = self.trackers.len();
        for (_, mut tracker) in self.trackers.drain() {
            tracker.cancel_task();
        }
        if count > 0 {
            debug!("Cancelled connection tracking for {} device(s)", count);
        }
    }

    fn invalidate(&mut self, device_id: &str) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let tracker = self.trackers.entry(device_id.to_string()).or_default();
        tracker.cancel_task();
        tracker.generation = generation;
        tracker.attempts = 0;
    }
}
