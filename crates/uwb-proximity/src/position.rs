// Position Stream - per-device sequence validation of ranging samples

use crate::registry::DeviceRegistry;
use crate::{ConnectionState, DeviceId, PositionSample, RawPositionSample};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Secondary sensor input (e.g. camera assist) that can refine a validated sample
pub trait PositionRefiner: Send + Sync {
    fn refine(&self, sample: PositionSample) -> PositionSample;
}

#[derive(Debug, Default)]
pub struct PositionStream {
    last_sequence: HashMap<DeviceId, u64>,
    dropped: u64,
}

impl PositionStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a raw sample. Returns the sample to publish, or `None` if it was dropped.
    pub fn accept(
        &mut self,
        registry: &mut DeviceRegistry,
        raw: RawPositionSample,
        refiner: Option<&dyn PositionRefiner>,
    ) -> Option<PositionSample> {
        match registry.state(&raw.device_id) {
            Ok(ConnectionState::Connected) => {}
            Ok(state) => {
                return self.drop_sample(&raw, &format!("device is {}", state));
            }
            Err(_) => return self.drop_sample(&raw, "unknown device"),
        }

        if !raw.distance.is_finite() || raw.distance < 0.0 {
            return self.drop_sample(&raw, "invalid distance");
        }
        if raw.angle.is_some_and(|a| !a.is_finite()) {
            return self.drop_sample(&raw, "invalid angle");
        }

        if let Some(&last) = self.last_sequence.get(&raw.device_id) {
            if raw.sequence <= last {
                return self.drop_sample(&raw, &format!("sequence {} not after {}", raw.sequence, last));
            }
        }
        self.last_sequence.insert(raw.device_id.clone(), raw.sequence);

        let mut sample = PositionSample::from(raw);
        if let Some(refiner) = refiner {
            sample = refiner.refine(sample);
        }

        let _ = registry.record_position(&sample.device_id, sample.position());
        debug!(
            device_id = %sample.device_id,
            sequence = sample.sequence,
            distance = sample.distance,
            angle = ?sample.angle,
            "Position updated"
        );
        Some(sample)
    }

    /// Start a fresh sequence for a device that just (re)connected
    pub fn reset(&mut self, device_id: &str) {
        self.last_sequence.remove(device_id);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn drop_sample(&mut self, raw: &RawPositionSample, reason: &str) -> Option<PositionSample> {
        self.dropped += 1;
        warn!(
            device_id = %raw.device_id,
            sequence = raw.sequence,
            dropped_total = self.dropped,
            "Dropped position sample: {}",
            reason
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiscoveryEvent;

    fn connected_registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(10);
        registry.upsert(&DiscoveryEvent::new("dev-1", -60.0));
        registry.set_state("dev-1", ConnectionState::Connected).unwrap();
        registry
    }

    struct AddBearing(f64);

    impl PositionRefiner for AddBearing {
        fn refine(&self, mut sample: PositionSample) -> PositionSample {
            sample.angle = Some(self.0);
            sample
        }
    }

    #[test]
    fn test_out_of_order_sample_is_dropped() {
        let mut registry = connected_registry();
        let mut stream = PositionStream::new();

        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.0, 5), None).is_some());
        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.1, 3), None).is_none());
        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.1, 5), None).is_none());
        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.2, 6), None).is_some());
        assert_eq!(stream.dropped(), 2);
    }

    #[test]
    fn test_sample_for_unconnected_device_is_dropped() {
        let mut registry = DeviceRegistry::new(10);
        registry.upsert(&DiscoveryEvent::new("dev-1", -60.0));
        let mut stream = PositionStream::new();

        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.0, 1), None).is_none());
        assert!(stream.accept(&mut registry, RawPositionSample::new("ghost", 1.0, 1), None).is_none());
        assert_eq!(stream.dropped(), 2);
    }

    #[test]
    fn test_invalid_measurements_are_dropped() {
        let mut registry = connected_registry();
        let mut stream = PositionStream::new();

        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", f64::NAN, 1), None).is_none());
        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", -0.5, 2), None).is_none());
        assert!(stream
            .accept(&mut registry, RawPositionSample::new("dev-1", 1.0, 3).with_angle(f64::INFINITY), None)
            .is_none());
        assert_eq!(stream.dropped(), 3);
    }

    #[test]
    fn test_accepted_sample_updates_registry_position() {
        let mut registry = connected_registry();
        let mut stream = PositionStream::new();

        let sample = stream
            .accept(&mut registry, RawPositionSample::new("dev-1", 2.5, 1).with_angle(30.0), None)
            .unwrap();
        assert_eq!(sample.distance, 2.5);

        let position = registry.get("dev-1").unwrap().position.unwrap();
        assert_eq!(position.distance, 2.5);
        assert_eq!(position.angle, Some(30.0));
    }

    #[test]
    fn test_refiner_is_applied() {
        let mut registry = connected_registry();
        let mut stream = PositionStream::new();
        let refiner = AddBearing(45.0);

        let sample = stream
            .accept(&mut registry, RawPositionSample::new("dev-1", 1.0, 1), Some(&refiner))
            .unwrap();
        assert_eq!(sample.angle, Some(45.0));
    }

    #[test]
    fn test_reset_allows_sequence_restart() {
        let mut registry = connected_registry();
        let mut stream = PositionStream::new();

        stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.0, 10), None);
        stream.reset("dev-1");
        assert!(stream.accept(&mut registry, RawPositionSample::new("dev-1", 1.0, 1), None).is_some());
    }
}
