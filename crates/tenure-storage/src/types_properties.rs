//! Property-based tests for unit identity derivations
//! **Feature: tenure-storage, Property 1: Forest file id derivation**
//! **Validates: business key conversions used by downstream datasets**

use crate::types::UnitId;
use proptest::prelude::*;

fn unit_number_strategy() -> impl Strategy<Value = u32> {
    1u32..=999
}

proptest! {
    /// Property 1: Forest file ids never contain separators
    #[test]
    fn prop_forest_file_id_has_no_underscore(number in unit_number_strategy()) {
        let unit = UnitId::new(format!("TFL_{}", number)).unwrap();
        let ffid = unit.forest_file_id();

        prop_assert!(!ffid.contains('_'));
        prop_assert!(ffid.starts_with("TFL"));
        prop_assert!(ffid.ends_with(&number.to_string()));
    }

    /// Property 2: Zero-padded keys collapse to the unpadded number
    #[test]
    fn prop_zero_padded_keys_collapse(number in 1u32..=9) {
        let padded = UnitId::new(format!("TFL_0{}", number)).unwrap();
        let plain = UnitId::new(format!("TFL_{}", number)).unwrap();

        prop_assert_eq!(padded.forest_file_id(), plain.forest_file_id());
    }

    /// Property 3: Current-view key keeps the number and swaps the separator
    #[test]
    fn prop_current_view_key_round_trips(number in unit_number_strategy()) {
        let unit = UnitId::new(format!("TFL_{}", number)).unwrap();
        let key = unit.current_view_key();

        prop_assert_eq!(key.replace(' ', "_"), unit.as_str());
    }
}
