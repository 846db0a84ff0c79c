//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use actsweep_core::{
    ActivationKind, Architecture, HyperparamKey, HyperparamTable, Resolver, SearchSpace,
    SeedManager, SelectionMode, StructuralParams, TensorBlob,
};

// --- Hyperparameter resolution ---

proptest! {
    #[test]
    fn sampled_records_stay_in_range(seed in any::<u64>()) {
        let table = HyperparamTable::default();
        let resolver = Resolver::new(&table, SearchSpace::default());
        let mut rng = StdRng::seed_from_u64(seed);
        let r = resolver.resolve(&SelectionMode::Sampled, &mut rng).unwrap();

        prop_assert!(r.beta_1 >= 10f64.powf(-2.5) && r.beta_1 <= 10f64.powf(-0.3));
        prop_assert!(r.beta_2 >= 10f64.powf(-2.0) && r.beta_2 <= 10f64.powf(-0.5));
        prop_assert!(r.eps >= 10f64.powf(-9.5) && r.eps <= 10f64.powf(-7.5));
        prop_assert!(r.weight_decay >= 10f64.powf(-5.5) && r.weight_decay <= 10f64.powf(-3.5));
        prop_assert!(r.max_lr >= 1e-4 && r.max_lr <= 1e-3);
        prop_assert!(r.cycle_peak >= 0.1 && r.cycle_peak < 0.5);
    }

    #[test]
    fn sampling_is_a_function_of_the_seed(seed in any::<u64>()) {
        let table = HyperparamTable::default();
        let resolver = Resolver::new(&table, SearchSpace::default());
        let a = resolver
            .resolve(&SelectionMode::Sampled, &mut StdRng::seed_from_u64(seed))
            .unwrap();
        let b = resolver
            .resolve(&SelectionMode::Sampled, &mut StdRng::seed_from_u64(seed))
            .unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn every_grid_id_resolves(id in 0u32..=20) {
        let table = HyperparamTable::builtin().unwrap();
        let resolver = Resolver::new(&table, SearchSpace::default());
        let mode = SelectionMode::Fixed { key: HyperparamKey::Grid(id) };
        let record = resolver.resolve(&mode, &mut StdRng::seed_from_u64(0)).unwrap();
        prop_assert!(record.validate().is_ok());
    }

    #[test]
    fn grid_ids_past_the_table_are_unknown(id in 21u32..10_000) {
        let table = HyperparamTable::builtin().unwrap();
        prop_assert!(table.get(&HyperparamKey::Grid(id)).is_err());
    }
}

// --- Seeds ---

proptest! {
    #[test]
    fn epoch_seeds_are_distinct_within_a_run(base in 0u64..1_000_000, budget in 1u32..500) {
        let seeds = SeedManager::new(base);
        let mut all: Vec<u64> = (1..=budget).map(|e| seeds.epoch_seed(budget, e)).collect();
        all.sort_unstable();
        all.dedup();
        prop_assert_eq!(all.len(), budget as usize);
    }
}

// --- Tensor blobs ---

proptest! {
    #[test]
    fn tensor_blobs_are_bit_exact(values in prop::collection::vec(any::<f32>(), 0..64)) {
        let blob = TensorBlob::from_f32(vec![values.len()], &values);
        let back = blob.to_f32().unwrap();
        let a: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        let b: Vec<u32> = back.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(a, b);
    }
}

// --- Structure validation ---

proptest! {
    #[test]
    fn single_valued_activations_reject_k_above_one(k in 2usize..8) {
        let params = StructuralParams { k, ..StructuralParams::default() };
        for act in ActivationKind::ALL.into_iter().filter(|a| a.is_single_valued()) {
            prop_assert!(params.validate(Architecture::Mlp, act).is_err());
            let normalized = params.clone().normalized_for(Architecture::Mlp, act);
            prop_assert!(normalized.validate(Architecture::Mlp, act).is_ok());
        }
    }
}
