//! Property-based tests for configuration validation
//! **Feature: tenure-config, Property 1: Saved configuration reloads unchanged**
//! **Validates: TOML layering and startup validation**

use crate::types::{EnvironmentKind, LifecycleConfig};
use proptest::prelude::*;

fn environment_strategy() -> impl Strategy<Value = EnvironmentKind> {
    prop_oneof![Just(EnvironmentKind::Test), Just(EnvironmentKind::Production)]
}

fn classification_strategy() -> impl Strategy<Value = [u32; 5]> {
    prop::collection::btree_set(1u32..10_000, 5).prop_map(|keys| {
        let keys: Vec<u32> = keys.into_iter().collect();
        [keys[0], keys[1], keys[2], keys[3], keys[4]]
    })
}

fn config_strategy() -> impl Strategy<Value = LifecycleConfig> {
    (
        "[a-z]{1,8}",
        environment_strategy(),
        0u64..120_000,
        0u64..120_000,
        1u64..5_000,
        classification_strategy(),
        1e-6f64..1.0,
    )
        .prop_map(
            |(root, environment, unit_wait, dataset_wait, poll, keys, tolerance)| {
                let mut config = LifecycleConfig::rooted_at(format!("/srv/{}", root));
                config.environment = environment;
                config.locking.unit_lock_wait_ms = unit_wait;
                config.locking.dataset_lock_wait_ms = dataset_wait;
                config.locking.poll_interval_ms = poll;
                config.classification.current_view = keys[0];
                config.classification.addition = keys[1];
                config.classification.deletion = keys[2];
                config.classification.replacement = keys[3];
                config.classification.schedule_a = keys[4];
                config.topology.cluster_tolerance = tolerance;
                config
            },
        )
}

proptest! {
    /// Property 1: A valid configuration survives a TOML round trip
    #[test]
    fn prop_valid_config_reloads_unchanged(config in config_strategy()) {
        prop_assert!(config.validate().is_ok());

        let text = toml::to_string(&config).unwrap();
        let reloaded: LifecycleConfig = toml::from_str(&text).unwrap();

        prop_assert_eq!(&reloaded, &config);
        prop_assert!(reloaded.validate().is_ok());
    }

    /// Property 2: Any two classes sharing a key are rejected
    #[test]
    fn prop_shared_classification_key_rejected(
        config in config_strategy(),
        first in 0usize..5,
        offset in 1usize..5,
    ) {
        let mut config = config;
        let second = (first + offset) % 5;
        let key = config.classification.all()[first];
        let classes = &mut config.classification;
        match second {
            0 => classes.current_view = key,
            1 => classes.addition = key,
            2 => classes.deletion = key,
            3 => classes.replacement = key,
            _ => classes.schedule_a = key,
        }

        prop_assert!(config.validate().is_err());
    }

    /// Property 3: Stages never share a directory in either environment
    #[test]
    fn prop_stage_directories_distinct(config in config_strategy()) {
        let paths = config.active_paths();
        let all = [
            &paths.baseline,
            &paths.editing,
            &paths.review,
            &paths.pending,
            &paths.archive,
            &paths.downstream,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                prop_assert_ne!(a, b);
            }
        }
    }
}
