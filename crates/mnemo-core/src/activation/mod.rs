//! ACT-R Base-Level Activation
//!
//! Activation of a knowledge node is computed from its access timestamps
//! using the ACT-R base-level learning equation:
//!
//! ```text
//! B = ln( sum_i (T - t_i)^(-d) )
//! ```
//!
//! with decay `d` (default 0.5) and elapsed time in seconds. A node that has
//! never been accessed has no activation at all (`None`), which keeps it out
//! of activation-based ranking while remaining eligible for content ranking.
//!
//! Memory strength blends importance with activation and is used only inside
//! the forgetting weight, never stored as the activation value itself.

mod access_history;

pub use access_history::{AccessHistoryManager, BatchAccessResult};

use chrono::{DateTime, Utc};

/// Default ACT-R decay exponent
pub const DEFAULT_DECAY: f64 = 0.5;

/// Guard against a zero interval when an access coincides with `now`
const EPSILON_SECONDS: f64 = 1e-3;

/// Base-level activation from an access history
///
/// Returns `None` for an empty history. Accesses in the future of `now`
/// contribute as if they just happened.
pub fn base_level_activation(
    access_history: &[DateTime<Utc>],
    now: DateTime<Utc>,
    decay: f64,
) -> Option<f64> {
    if access_history.is_empty() {
        return None;
    }

    let sum: f64 = access_history
        .iter()
        .map(|t| {
            let elapsed = (now - *t).num_milliseconds() as f64 / 1000.0;
            (elapsed.max(0.0) + EPSILON_SECONDS).powf(-decay)
        })
        .sum();

    Some(sum.ln())
}

/// Memory strength for the forgetting weight
///
/// `importance * (1 + activation * boost)`, clamped so strength never drops
/// below the bare importance even for strongly negative activations.
pub fn memory_strength(importance: f64, activation: f64, boost: f64) -> f64 {
    (importance * (1.0 + activation * boost)).max(importance)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn history(now: DateTime<Utc>, ages_secs: &[i64]) -> Vec<DateTime<Utc>> {
        ages_secs
            .iter()
            .map(|age| now - Duration::seconds(*age))
            .collect()
    }

    #[test]
    fn test_empty_history_has_no_activation() {
        assert_eq!(base_level_activation(&[], Utc::now(), DEFAULT_DECAY), None);
    }

    #[test]
    fn test_later_access_strictly_increases_activation() {
        let now = Utc::now();
        for seed in [1_i64, 7, 42, 1337] {
            // Pseudo-random history ages derived from the seed
            let ages: Vec<i64> = (1..=5).map(|i| (seed * i * 97) % 86_400 + 60).collect();
            let base = history(now, &ages);
            let with_recent = {
                let mut h = base.clone();
                h.push(now - Duration::seconds(1));
                h
            };

            let before = base_level_activation(&base, now, DEFAULT_DECAY).unwrap();
            let after = base_level_activation(&with_recent, now, DEFAULT_DECAY).unwrap();
            assert!(
                after > before,
                "seed {}: adding a later access must increase activation ({} -> {})",
                seed,
                before,
                after
            );
        }
    }

    #[test]
    fn test_activation_decays_as_time_advances() {
        let now = Utc::now();
        let h = history(now, &[10, 100, 1000]);

        let at_now = base_level_activation(&h, now, DEFAULT_DECAY).unwrap();
        let later = base_level_activation(&h, now + Duration::hours(6), DEFAULT_DECAY).unwrap();
        let much_later =
            base_level_activation(&h, now + Duration::days(30), DEFAULT_DECAY).unwrap();

        assert!(later < at_now);
        assert!(much_later < later);
    }

    #[test]
    fn test_single_recent_access_beats_single_old_access() {
        let now = Utc::now();
        let recent = base_level_activation(&history(now, &[60]), now, DEFAULT_DECAY).unwrap();
        let old = base_level_activation(&history(now, &[86_400]), now, DEFAULT_DECAY).unwrap();
        assert!(recent > old);
    }

    #[test]
    fn test_future_access_does_not_panic() {
        let now = Utc::now();
        let h = vec![now + Duration::seconds(10)];
        let value = base_level_activation(&h, now, DEFAULT_DECAY).unwrap();
        assert!(value.is_finite());
    }

    #[test]
    fn test_memory_strength_clamped_to_importance() {
        // Positive activation raises strength
        assert!(memory_strength(0.5, 2.0, 0.8) > 0.5);
        // Strongly negative activation cannot push strength below importance
        assert!((memory_strength(0.5, -10.0, 0.8) - 0.5).abs() < f64::EPSILON);
        // Zero activation leaves importance untouched
        assert!((memory_strength(0.7, 0.0, 0.8) - 0.7).abs() < f64::EPSILON);
    }
}
