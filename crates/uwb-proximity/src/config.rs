use crate::connection::RetryConfig;
use crate::{Result, UwbError};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_DEVICES: usize = 50;

/// Options for a ranging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Connect to every newly discovered device without an explicit `connect`
    pub auto_connect: bool,
    /// Feed samples through the installed secondary sensor refiner
    pub camera_assisted: bool,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
    /// Registry capacity
    pub max_devices: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_connect: false,
            camera_assisted: false,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            retry: RetryConfig::default(),
            max_devices: DEFAULT_MAX_DEVICES,
        }
    }
}

impl SessionConfig {
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_camera_assisted(mut self, camera_assisted: bool) -> Self {
        self.camera_assisted = camera_assisted;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// Load configuration from the environment (and `.env` if present)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = SessionConfig {
            auto_connect: env::var("UWB_AUTO_CONNECT")
                .unwrap_or_else(|_| defaults.auto_connect.to_string())
                .parse()?,
            camera_assisted: env::var("UWB_CAMERA_ASSISTED")
                .unwrap_or_else(|_| defaults.camera_assisted.to_string())
                .parse()?,
            connect_timeout: Duration::from_secs(
                env::var("UWB_CONNECT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| DEFAULT_CONNECT_TIMEOUT_SECS.to_string())
                    .parse()?,
            ),
            retry: RetryConfig {
                max_attempts: env::var("UWB_MAX_CONNECT_ATTEMPTS")
                    .unwrap_or_else(|_| defaults.retry.max_attempts.to_string())
                    .parse()?,
                initial_backoff: Duration::from_millis(
                    env::var("UWB_INITIAL_BACKOFF_MS")
                        .unwrap_or_else(|_| defaults.retry.initial_backoff.as_millis().to_string())
                        .parse()?,
                ),
                max_backoff: Duration::from_millis(
                    env::var("UWB_MAX_BACKOFF_MS")
                        .unwrap_or_else(|_| defaults.retry.max_backoff.as_millis().to_string())
                        .parse()?,
                ),
                backoff_multiplier: defaults.retry.backoff_multiplier,
            },
            max_devices: env::var("UWB_MAX_DEVICES")
                .unwrap_or_else(|_| DEFAULT_MAX_DEVICES.to_string())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(UwbError::InvalidConfig("connect timeout must be non-zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(UwbError::InvalidConfig("at least one connect attempt is required".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(UwbError::InvalidConfig("backoff multiplier must be >= 1.0".to_string()));
        }
        if self.max_devices == 0 {
            return Err(UwbError::InvalidConfig("device capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}
