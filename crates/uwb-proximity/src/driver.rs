// Radio driver abstraction - the only way the session touches UWB hardware

use crate::{DeviceId, DiscoveryEvent, RawPositionSample, Result, SessionConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events pushed by the radio while scanning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverEvent {
    Discovered(DiscoveryEvent),
    Position(RawPositionSample),
    /// Link dropped without a local disconnect request
    LinkLost {
        device_id: DeviceId,
        error: Option<String>,
    },
    /// Radio is unusable (hardware gone, permission revoked); ends the session
    Fatal { reason: String },
}

/// Trait for platform-specific ranging radio implementations
#[async_trait]
pub trait RadioDriver: Send + Sync {
    /// Begin scanning. The returned channel carries every event until `stop_scanning`
    /// and is not restartable; a later scan returns a new channel.
    async fn start_scanning(&self, config: &SessionConfig) -> Result<mpsc::Receiver<DriverEvent>>;

    /// Stop scanning and release radio resources
    async fn stop_scanning(&self) -> Result<()>;

    /// Ask the radio to connect; resolves once the link is up or has failed
    async fn request_connect(&self, device_id: &DeviceId) -> Result<()>;

    /// Ask the radio to tear the link down
    async fn request_disconnect(&self, device_id: &DeviceId) -> Result<()>;

    /// Get the driver name
    fn driver_name(&self) -> &str;
}
