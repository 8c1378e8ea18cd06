use noteping_core::backoff::BackoffPolicy;
use noteping_core::test_harness::{run_simulator, SimulatorConfig};
use proptest::prelude::*;
use std::time::Duration;

fn simulate(seed: u64, total_operations: u64) -> noteping_core::test_harness::SimulatorReport {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run_simulator(SimulatorConfig {
            seed,
            total_operations,
            ..SimulatorConfig::default()
        }))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_random_transitions_hold_invariants(seed in any::<u64>()) {
        let report = simulate(seed, 150);
        prop_assert!(report.passed(), "{}", report.generate_text());
    }

    #[test]
    fn prop_backoff_grows_until_capped(
        base_ms in 1u64..1_000,
        max_ms in 1u64..60_000,
        jitter in 0.0f64..=1.0,
    ) {
        let policy = BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
            .with_jitter(jitter);
        let mut previous = Duration::ZERO;
        for retry in 0..12 {
            let nominal = policy.nominal_delay(retry);
            prop_assert!(nominal >= previous);
            prop_assert!(nominal <= Duration::from_millis(max_ms));
            let actual = policy.delay(retry);
            prop_assert!(actual >= nominal);
            prop_assert!(actual <= Duration::from_millis(max_ms));
            previous = nominal;
        }
    }
}

#[test]
fn test_long_run_with_fixed_seed() {
    let report = simulate(2024, 2_000);
    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.operations_run, 2_000);
    assert!(report.stats.activations_succeeded > 0);
    assert!(report.stats.deactivations > 0);
}
