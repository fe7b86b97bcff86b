//! Size Gate Module
//!
//! Post-transform validation: the result replaces the source only when it is
//! actually smaller, unless the caller explicitly allows larger output.

use serde::{Deserialize, Serialize};

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Keep the transformed output
    Accept,
    /// Output is not smaller than the input
    Reject { old_bytes: u64, new_bytes: u64 },
}

/// Check whether a transformed file may replace its source.
///
/// Returns `Reject` if `new_bytes >= old_bytes`, unless `allow_larger` is set.
pub fn check_result_size(old_bytes: u64, new_bytes: u64, allow_larger: bool) -> SizeGateResult {
    if allow_larger || new_bytes < old_bytes {
        SizeGateResult::Accept
    } else {
        SizeGateResult::Reject {
            old_bytes,
            new_bytes,
        }
    }
}

/// Choose among candidate outputs by size.
///
/// Index 0 is the preferred candidate (the one that keeps the original
/// format). Another candidate only wins when it is the smallest and saves at
/// least `min_saving_ratio` relative to the preferred one. Returns `None` for
/// an empty slice.
pub fn pick_smaller(sizes: &[u64], min_saving_ratio: f32) -> Option<usize> {
    let preferred = *sizes.first()?;
    let (best, best_size) = sizes
        .iter()
        .copied()
        .enumerate()
        .min_by_key(|&(i, size)| (size, i))?;

    if best == 0 {
        return Some(0);
    }
    let ratio = f64::from(min_saving_ratio.clamp(0.0, 1.0));
    let threshold = preferred as f64 * (1.0 - ratio);
    if (best_size as f64) <= threshold {
        Some(best)
    } else {
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_equal_size_is_rejected() {
        assert_eq!(
            check_result_size(1000, 1000, false),
            SizeGateResult::Reject {
                old_bytes: 1000,
                new_bytes: 1000
            }
        );
        assert_eq!(check_result_size(1000, 1000, true), SizeGateResult::Accept);
        assert_eq!(check_result_size(1000, 999, false), SizeGateResult::Accept);
    }

    #[test]
    fn test_pick_prefers_original_format() {
        // jpg 4% smaller than png: not worth the conversion at 5%
        assert_eq!(pick_smaller(&[1000, 960], 0.05), Some(0));
        // jpg 40% smaller: convert
        assert_eq!(pick_smaller(&[1000, 600], 0.05), Some(1));
        assert_eq!(pick_smaller(&[500, 600], 0.05), Some(0));
        assert_eq!(pick_smaller(&[], 0.05), None);
        assert_eq!(pick_smaller(&[42], 0.05), Some(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_size_gate(
            old_bytes in 0u64..=u64::MAX / 2,
            new_bytes in 0u64..=u64::MAX / 2,
        ) {
            match check_result_size(old_bytes, new_bytes, false) {
                SizeGateResult::Accept => prop_assert!(new_bytes < old_bytes),
                SizeGateResult::Reject { old_bytes: o, new_bytes: n } => {
                    prop_assert!(new_bytes >= old_bytes);
                    prop_assert_eq!(o, old_bytes);
                    prop_assert_eq!(n, new_bytes);
                }
            }
            prop_assert_eq!(check_result_size(old_bytes, new_bytes, true), SizeGateResult::Accept);
        }

        #[test]
        fn prop_pick_never_chooses_larger_alternative(
            sizes in proptest::collection::vec(1u64..1_000_000, 1..5),
            ratio in 0.0f32..0.5,
        ) {
            let chosen = pick_smaller(&sizes, ratio).unwrap();
            prop_assert!(chosen < sizes.len());
            if chosen != 0 {
                prop_assert!(sizes[chosen] < sizes[0]);
                prop_assert!(sizes.iter().all(|&s| sizes[chosen] <= s));
            }
        }
    }
}
