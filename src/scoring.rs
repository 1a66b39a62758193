//! Deterministic effectiveness scoring (C7).
//!
//! Pure function, no I/O: 25.0 points per attestation vote cast (head,
//! source, target), plus an inclusion-delay component worth up to 25.0. Same
//! inputs always produce the same score (P1/P2), which is exactly what makes
//! it safe to recompute on every ingested snapshot rather than caching it.

const VOTE_POINTS: f64 = 25.0;
const INCLUSION_MAX_POINTS: f64 = 25.0;
const INCLUSION_DECAY_PER_EPOCH: f64 = 6.25;

/// Computes an effectiveness score in `[0.0, 100.0]`, always a multiple of
/// `6.25` (P1). `inclusion_delay` of `0` or negative is treated as "not
/// included", contributing zero; delay of `1` (included in the very next
/// slot) contributes the full 25.0, decaying linearly and floored at zero.
pub fn score(head: bool, source: bool, target: bool, inclusion_delay: i32) -> f64 {
    let votes = [head, source, target].iter().filter(|v| **v).count() as f64 * VOTE_POINTS;

    let inclusion = if inclusion_delay <= 0 {
        0.0
    } else {
        (INCLUSION_MAX_POINTS - INCLUSION_DECAY_PER_EPOCH * (inclusion_delay - 1) as f64).max(0.0)
    };

    votes + inclusion
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_votes_immediate_inclusion_is_perfect() {
        assert_eq!(score(true, true, true, 1), 100.0);
    }

    #[test]
    fn all_votes_next_slot_delay_scores_93_75() {
        assert_eq!(score(true, true, true, 2), 93.75);
    }

    #[test]
    fn two_votes_with_delay_scores_62_5() {
        assert_eq!(score(true, false, true, 3), 62.5);
    }

    #[test]
    fn no_votes_large_delay_scores_zero() {
        assert_eq!(score(false, false, false, 10), 0.0);
    }

    #[test]
    fn zero_delay_treated_as_not_included() {
        assert_eq!(score(true, true, true, 0), 75.0);
    }

    #[test]
    fn inclusion_component_floors_at_zero_for_large_delay() {
        assert_eq!(score(false, false, false, 5), 0.0);
        assert_eq!(score(true, false, false, 100), 25.0);
    }

    #[test]
    fn every_score_is_a_multiple_of_6_25() {
        for head in [true, false] {
            for source in [true, false] {
                for target in [true, false] {
                    for delay in [0, 1, 2, 3, 4, 5, 10, 50] {
                        let s = score(head, source, target, delay);
                        let quotient = s / 6.25;
                        assert!((quotient - quotient.round()).abs() < 1e-9, "score {s} not a multiple of 6.25");
                    }
                }
            }
        }
    }

    #[test]
    fn score_is_monotonically_non_increasing_in_delay() {
        for delay in 1..20 {
            let a = score(true, true, true, delay);
            let b = score(true, true, true, delay + 1);
            assert!(b <= a, "score increased from delay {delay} ({a}) to {} ({b})", delay + 1);
        }
    }

    mod proptests {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn score_always_in_range(head: bool, source: bool, target: bool, delay in -10i32..200) {
                let s = score(head, source, target, delay);
                prop_assert!((0.0..=100.0).contains(&s));
            }

            #[test]
            fn score_non_increasing_in_delay_property(head: bool, source: bool, target: bool, delay in 1i32..200) {
                let a = score(head, source, target, delay);
                let b = score(head, source, target, delay + 1);
                prop_assert!(b <= a);
            }
        }
    }
}
