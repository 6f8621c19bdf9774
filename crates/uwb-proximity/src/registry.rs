// Device Registry - single owner of every Device record in a session

use crate::{ConnectionState, Device, DeviceId, DiscoveryEvent, Position, Result, UwbError};
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info};

/// Result of merging a discovery event into the registry
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted {
        device: Device,
        evicted: Option<DeviceId>,
    },
    Updated(Device),
    /// Registry full and no idle device with a weaker signal to replace
    Rejected,
}

pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
    order: Vec<DeviceId>,
    max_devices: usize,
}

impl DeviceRegistry {
    pub fn new(max_devices: usize) -> Self {
        Self {
            devices: HashMap::new(),
            order: Vec::new(),
            max_devices,
        }
    }

    /// Insert a new device or merge the event into the existing record.
    /// Connection state is never touched by an upsert.
    pub fn upsert(&mut self, event: &DiscoveryEvent) -> Upsert {
        let now = Utc::now();

        if let Some(existing) = self.devices.get_mut(&event.device_id) {
            existing.signal_strength = event.signal_strength;
            existing.last_seen = now;
            existing
                .metadata
                .extend(event.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            debug!("Updated device: {}", event.device_id);
            return Upsert::Updated(existing.clone());
        }

        let mut evicted = None;
        if self.devices.len() >= self.max_devices {
            // Only idle devices are candidates; anything with a link or an attempt stays
            let weakest = self
                .devices
                .values()
                .filter(|d| d.state.is_idle())
                .min_by(|a, b| a.signal_strength.total_cmp(&b.signal_strength))
                .map(|d| (d.id.clone(), d.signal_strength));

            match weakest {
                Some((weakest_id, weakest_signal)) if event.signal_strength > weakest_signal => {
                    info!(
                        "Capacity limit reached, replacing weakest device {} ({} dBm) with {} ({} dBm)",
                        weakest_id, weakest_signal, event.device_id, event.signal_strength
                    );
                    self.devices.remove(&weakest_id);
                    self.order.retain(|id| id != &weakest_id);
                    evicted = Some(weakest_id);
                }
                _ => {
                    debug!(
                        "Capacity limit reached, ignoring device {} ({} dBm)",
                        event.device_id, event.signal_strength
                    );
                    return Upsert::Rejected;
                }
            }
        }

        let device = Device {
            id: event.device_id.clone(),
            signal_strength: event.signal_strength,
            metadata: event.metadata.clone(),
            position: None,
            state: ConnectionState::Discovered,
            last_error: None,
            discovered_at: now,
            last_seen: now,
        };

        info!("Discovered new device: {} ({} dBm)", device.id, device.signal_strength);
        self.order.push(device.id.clone());
        self.devices.insert(device.id.clone(), device.clone());

        Upsert::Inserted { device, evicted }
    }

    pub fn get(&self, id: &str) -> Result<&Device> {
        self.devices
            .get(id)
            .ok_or_else(|| UwbError::NotFound(id.to_string()))
    }

    /// All devices in discovery order
    pub fn list(&self) -> Vec<Device> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id))
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, id: &str) -> Result<Device> {
        let device = self
            .devices
            .remove(id)
            .ok_or_else(|| UwbError::NotFound(id.to_string()))?;
        self.order.retain(|existing| existing != id);
        info!("Removed device: {}", id);
        Ok(device)
    }

    pub fn state(&self, id: &str) -> Result<ConnectionState> {
        self.get(id).map(|d| d.state)
    }

    pub fn set_state(&mut self, id: &str, state: ConnectionState) -> Result<()> {
        let device = self.get_mut(id)?;
        debug!("Device {} state {} -> {}", id, device.state, state);
        device.state = state;
        if state == ConnectionState::Connected {
            device.last_error = None;
        }
        Ok(())
    }

    pub fn record_error(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        self.get_mut(id)?.last_error = Some(error.into());
        Ok(())
    }

    pub fn record_position(&mut self, id: &str, position: Position) -> Result<()> {
        self.get_mut(id)?.position = Some(position);
        Ok(())
    }

    /// Identifiers of devices currently in `state`
    pub fn ids_in_state(&self, state: ConnectionState) -> Vec<DeviceId> {
        self.order
            .iter()
            .filter(|id| self.devices.get(*id).map(|d| d.state) == Some(state))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| UwbError::NotFound(id.to_string()))
    }
}
