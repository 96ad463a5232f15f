#![forbid(unsafe_code)]

use fv_trace::Value;
use proptest::test_runner::{Config, RngAlgorithm, TestRng};

pub const DEFAULT_RTOL: f64 = 1e-9;
pub const DEFAULT_ATOL: f64 = 1e-12;

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("FV_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    if let Ok(raw) = std::env::var("FV_PROPTEST_SEED")
        && let Ok(seed) = raw.parse::<u64>()
    {
        return Some(seed);
    }

    if let Ok(raw) = std::env::var("PROPTEST_RNG_SEED")
        && let Ok(seed) = raw.parse::<u64>()
    {
        return Some(seed);
    }

    None
}

/// Proptest config honoring `FV_PROPTEST_CASES`.
#[must_use]
pub fn proptest_config() -> Config {
    Config {
        cases: property_test_case_count(),
        ..Config::default()
    }
}

/// Deterministic RNG for hand-rolled sampling, seeded from
/// `FV_PROPTEST_SEED` when set.
#[must_use]
pub fn seeded_rng() -> TestRng {
    let seed = capture_proptest_seed().unwrap_or(0x5eed);
    let mut bytes = [0_u8; 32];
    for (chunk, word) in bytes.chunks_mut(8).zip([seed, !seed, seed.rotate_left(17), seed ^ 0xa5a5]) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    TestRng::from_seed(RngAlgorithm::ChaCha, &bytes)
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

#[must_use]
pub fn allclose(actual: f64, expected: f64, rtol: f64, atol: f64) -> bool {
    (actual - expected).abs() <= atol + rtol * expected.abs()
}

/// Panics unless `actual` is a concrete value whose elements match
/// `expected` within the default tolerances.
#[track_caller]
pub fn assert_value_close(actual: &Value, expected: &[f64]) {
    let Some(data) = actual.to_f64_vec() else {
        panic!("expected a concrete value, got {actual:?}");
    };
    assert_eq!(
        data.len(),
        expected.len(),
        "element count mismatch: {data:?} vs {expected:?}"
    );
    for (idx, (got, want)) in data.iter().zip(expected).enumerate() {
        assert!(
            allclose(*got, *want, DEFAULT_RTOL, DEFAULT_ATOL),
            "element {idx}: got {got}, expected {want}"
        );
    }
}
