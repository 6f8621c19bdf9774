// Property-based tests for the device registry and discovery validation

use proptest::prelude::*;
use std::collections::HashSet;
use uwb_proximity::{ConnectionState, DeviceRegistry, DiscoveryEvent, DiscoveryListener, DiscoveryOutcome};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any sequence of discovery events leaves exactly one device per identifier
    #[test]
    fn prop_upsert_is_idempotent_per_identifier(
        ids in prop::collection::hash_set("[a-z0-9]{1,8}", 1..40),
        repeats in 1usize..4,
        rssi in -100.0f64..-20.0,
    ) {
        let mut registry = DeviceRegistry::new(1000);
        for round in 0..repeats {
            for id in &ids {
                registry.upsert(&DiscoveryEvent::new(id.clone(), rssi - round as f64));
            }
        }

        prop_assert_eq!(registry.len(), ids.len());

        let listed: Vec<_> = registry.list().into_iter().map(|d| d.id).collect();
        let unique: HashSet<_> = listed.iter().cloned().collect();
        prop_assert_eq!(listed.len(), unique.len());
        prop_assert_eq!(unique, ids);
    }

    /// Upserts never change an existing device's connection state
    #[test]
    fn prop_upsert_preserves_state(rssi in -120.0f64..0.0) {
        let mut registry = DeviceRegistry::new(10);
        registry.upsert(&DiscoveryEvent::new("dev-1", -60.0));
        registry.set_state("dev-1", ConnectionState::Connected).unwrap();

        registry.upsert(&DiscoveryEvent::new("dev-1", rssi));

        let device = registry.get("dev-1").unwrap();
        prop_assert_eq!(device.state, ConnectionState::Connected);
        prop_assert_eq!(device.signal_strength, rssi);
    }

    /// Discovery accepts a signal strength iff it is a plausible finite RSSI
    #[test]
    fn prop_signal_strength_validation(rssi in prop::num::f64::ANY) {
        let mut registry = DeviceRegistry::new(10);
        let mut listener = DiscoveryListener::new();

        let outcome = listener.process(&mut registry, DiscoveryEvent::new("dev-1", rssi));
        let plausible = rssi.is_finite() && (-127.0..=20.0).contains(&rssi);

        prop_assert_eq!(matches!(outcome, DiscoveryOutcome::Discovered { .. }), plausible);
        prop_assert_eq!(listener.dropped(), if plausible { 0 } else { 1 });
        prop_assert_eq!(registry.len(), if plausible { 1 } else { 0 });
    }
}
