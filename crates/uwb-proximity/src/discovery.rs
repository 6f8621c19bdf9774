// Discovery Listener - validates raw discovery events and merges them into the registry

use crate::registry::{DeviceRegistry, Upsert};
use crate::{Device, DeviceId, DiscoveryEvent};
use tracing::{debug, warn};

/// Plausible RSSI window in dBm
pub const MIN_SIGNAL_STRENGTH: f64 = -127.0;
pub const MAX_SIGNAL_STRENGTH: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    Discovered {
        device: Device,
        evicted: Option<DeviceId>,
    },
    Updated(Device),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    EmptyIdentifier,
    InvalidSignalStrength,
    CapacityReached,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::EmptyIdentifier => write!(f, "empty identifier"),
            DropReason::InvalidSignalStrength => write!(f, "invalid signal strength"),
            DropReason::CapacityReached => write!(f, "registry capacity reached"),
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryListener {
    dropped: u64,
}

impl DiscoveryListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one raw discovery event. Malformed events are counted, never returned as errors.
    pub fn process(&mut self, registry: &mut DeviceRegistry, mut event: DiscoveryEvent) -> DiscoveryOutcome {
        if let Err(reason) = Self::validate(&mut event) {
            return self.drop_event(&event.device_id, reason);
        }

        match registry.upsert(&event) {
            Upsert::Inserted { device, evicted } => DiscoveryOutcome::Discovered { device, evicted },
            Upsert::Updated(device) => DiscoveryOutcome::Updated(device),
            Upsert::Rejected => self.drop_event(&event.device_id, DropReason::CapacityReached),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn validate(event: &mut DiscoveryEvent) -> Result<(), DropReason> {
        let trimmed = event.device_id.trim();
        if trimmed.is_empty() {
            return Err(DropReason::EmptyIdentifier);
        }
        if trimmed.len() != event.device_id.len() {
            event.device_id = trimmed.to_string();
        }

        let rssi = event.signal_strength;
        if !rssi.is_finite() || !(MIN_SIGNAL_STRENGTH..=MAX_SIGNAL_STRENGTH).contains(&rssi) {
            return Err(DropReason::InvalidSignalStrength);
        }
        Ok(())
    }

    fn drop_event(&mut self, device_id: &str, reason: DropReason) -> DiscoveryOutcome {
        self.dropped += 1;
        if reason == DropReason::CapacityReached {
            debug!("Dropped discovery event for {:?}: {}", device_id, reason);
        } else {
            warn!(
                device_id = %device_id,
                dropped_total = self.dropped,
                "Dropped malformed discovery event: {}",
                reason
            );
        }
        DiscoveryOutcome::Dropped(reason)
    }
}
