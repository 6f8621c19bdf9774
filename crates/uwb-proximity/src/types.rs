use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Public identifier of a ranging peer
pub type DeviceId = String;

/// Opaque key/value metadata reported by the radio on discovery
pub type DeviceMetadata = BTreeMap<String, serde_json::Value>;

/// Connection lifecycle of a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Whether a new connect attempt may start from this state
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Discovered | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }

    /// Idle devices have no link and no attempt in flight (a failed device may
    /// still be waiting on a retry timer)
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            ConnectionState::Discovered | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "Discovered"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Distance in meters plus optional bearing in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub distance: f64,
    pub angle: Option<f64>,
}

/// A ranging peer known to the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Last RSSI in dBm
    pub signal_strength: f64,
    pub metadata: DeviceMetadata,
    pub position: Option<Position>,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Raw discovery report from the radio driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub device_id: DeviceId,
    pub signal_strength: f64,
    #[serde(default)]
    pub metadata: DeviceMetadata,
}

impl DiscoveryEvent {
    pub fn new(device_id: impl Into<DeviceId>, signal_strength: f64) -> Self {
        Self {
            device_id: device_id.into(),
            signal_strength,
            metadata: DeviceMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Raw ranging measurement from the radio driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPositionSample {
    pub device_id: DeviceId,
    pub distance: f64,
    pub angle: Option<f64>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl RawPositionSample {
    pub fn new(device_id: impl Into<DeviceId>, distance: f64, sequence: u64) -> Self {
        Self {
            device_id: device_id.into(),
            distance,
            angle: None,
            sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = Some(angle);
        self
    }
}

/// Validated position update handed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub device_id: DeviceId,
    pub distance: f64,
    pub angle: Option<f64>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    pub fn position(&self) -> Position {
        Position {
            distance: self.distance,
            angle: self.angle,
        }
    }
}

impl From<RawPositionSample> for PositionSample {
    fn from(raw: RawPositionSample) -> Self {
        Self {
            device_id: raw.device_id,
            distance: raw.distance,
            angle: raw.angle,
            sequence: raw.sequence,
            timestamp: raw.timestamp,
        }
    }
}

/// Notifications published to session subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    DeviceDiscovered { device: Device },
    DeviceUpdated { device: Device },
    DeviceConnecting { device_id: DeviceId, attempt: u32 },
    DeviceConnected { device_id: DeviceId },
    DeviceConnectFailed {
        device_id: DeviceId,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    DeviceDisconnected { device_id: DeviceId, error: Option<String> },
    /// Device dropped from the registry to make room for a stronger one
    DeviceRemoved { device_id: DeviceId },
    PositionUpdated { sample: PositionSample },
    SessionTerminated { reason: String },
    SessionStopped,
}

/// Information about the running session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub auto_connect: bool,
    pub camera_assisted: bool,
}

/// Counters for data dropped by the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub devices: usize,
    pub connected: usize,
    pub dropped_discovery_events: u64,
    pub dropped_position_samples: u64,
}
