//! Reciprocal Rank Fusion.
//!
//! Rank-based: scores from different retrieval methods never need
//! normalizing against each other. `RRF(d) = Σ over rankings of
//! 1 / (k + rank(d))` with 1-based ranks.

use std::collections::HashMap;

/// Fuse any number of rankings (each a list of keys, best first) into a
/// single descending-score list. Summation order does not affect the
/// result, so permuting the input rankings leaves the output unchanged.
pub fn fuse(rankings: &[Vec<String>], k: f64) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for ranking in rankings {
        for (idx, key) in ranking.iter().enumerate() {
            let rank = (idx + 1) as f64;
            *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (k + rank);
        }
    }
    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn doc_in_both_rankings_beats_single_method() {
        let fused = fuse(
            &[ranking(&["a", "b", "c"]), ranking(&["b", "d"])],
            60.0,
        );
        assert_eq!(fused[0].0, "b"); // rank 2 + rank 1 beats rank 1 alone
    }

    #[test]
    fn permuting_rankings_does_not_change_result() {
        let r1 = ranking(&["a", "b", "c"]);
        let r2 = ranking(&["c", "a"]);
        let r3 = ranking(&["b", "c", "d", "e"]);

        let forward = fuse(&[r1.clone(), r2.clone(), r3.clone()], 60.0);
        let backward = fuse(&[r3, r2, r1], 60.0);
        assert_eq!(forward, backward);
    }

    #[test]
    fn scores_follow_the_formula() {
        let fused = fuse(&[ranking(&["only"])], 60.0);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(fuse(&[], 60.0).is_empty());
        assert!(fuse(&[Vec::new()], 60.0).is_empty());
    }

    #[test]
    fn deterministic_tie_break_on_key() {
        let fused = fuse(&[ranking(&["b"]), ranking(&["a"])], 60.0);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused[1].0, "b");
    }
}
