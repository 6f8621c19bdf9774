use crate::DeviceId;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UwbError {
    #[error("Device not found: {0}")]
    NotFound(DeviceId),

    #[error("Connection attempt already in flight for device: {0}")]
    AlreadyConnecting(DeviceId),

    #[error("Device already connected: {0}")]
    AlreadyConnected(DeviceId),

    #[error("Device not connected: {0}")]
    NotConnected(DeviceId),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Session not started")]
    NotStarted,

    #[error("Radio driver error: {0}")]
    DriverError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, UwbError>;

/// Context for error logging
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub session_id: Option<Uuid>,
    pub device_id: Option<DeviceId>,
    pub attempt: Option<u32>,
    pub additional_info: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }
}

impl UwbError {
    /// Log error with structured context
    pub fn log_with_context(&self, context: &ErrorContext) {
        error!(
            error = %self,
            category = %self.category(),
            session_id = ?context.session_id,
            device_id = ?context.device_id,
            attempt = ?context.attempt,
            additional_info = ?context.additional_info,
            timestamp = %chrono::Utc::now(),
            "UWB session error occurred"
        );
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            UwbError::NotFound(id) => {
                format!("The device '{}' could not be found. It may have moved out of range.", id)
            }
            UwbError::AlreadyConnecting(id) => {
                format!("Already connecting to '{}'. Please wait for the current attempt to finish.", id)
            }
            UwbError::AlreadyConnected(id) => {
                format!("The device '{}' is already connected.", id)
            }
            UwbError::NotConnected(id) => {
                format!("The device '{}' is not connected.", id)
            }
            UwbError::InvalidState(details) => {
                format!("This operation is not allowed right now: {}.", details)
            }
            UwbError::NotStarted => {
                "The ranging session has not been started. Please start scanning first.".to_string()
            }
            UwbError::DriverError(details) => {
                format!("Radio error: {}. Please check that UWB is enabled on this device.", details)
            }
            UwbError::Timeout(operation) => {
                format!("Operation timed out: {}. Please try again.", operation)
            }
            UwbError::SubscriptionNotFound(id) => {
                format!("Subscription '{}' not found. It may already have been removed.", id)
            }
            UwbError::InvalidConfig(details) => {
                format!("Invalid configuration: {}.", details)
            }
        }
    }

    /// Get error category for metrics and monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            UwbError::NotFound(_) => ErrorCategory::NotFound,
            UwbError::SubscriptionNotFound(_) => ErrorCategory::NotFound,
            UwbError::AlreadyConnecting(_) => ErrorCategory::Connection,
            UwbError::AlreadyConnected(_) => ErrorCategory::Connection,
            UwbError::NotConnected(_) => ErrorCategory::Connection,
            UwbError::InvalidState(_) => ErrorCategory::Session,
            UwbError::NotStarted => ErrorCategory::Session,
            UwbError::DriverError(_) => ErrorCategory::Driver,
            UwbError::Timeout(_) => ErrorCategory::Timeout,
            UwbError::InvalidConfig(_) => ErrorCategory::Validation,
        }
    }

    /// Whether a connect attempt failing with this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, UwbError::DriverError(_) | UwbError::Timeout(_))
    }
}

/// Error categories for monitoring and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Connection,
    Session,
    Driver,
    Timeout,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Session => write!(f, "session"),
            ErrorCategory::Driver => write!(f, "driver"),
            ErrorCategory::Timeout => write!(f, "timeout"),
        }
    }
}
