//! Static work partitioning across collector instances.
//!
//! Every instance computes its own share from the same inputs, so no
//! coordination is needed: exchange `k` of the sorted global list goes to
//! instance `k mod instance_count`.

use crate::error::{CollectorError, CollectorResult};

/// Sorts and de-duplicates exchange ids into the canonical global order.
pub fn canonical_order<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Returns the exchanges assigned to `instance_index`.
///
/// `sorted_ids` must already be in canonical order (see [`canonical_order`]).
/// Instances beyond the number of exchanges receive an empty subset.
pub fn partition(
    sorted_ids: &[String],
    instance_count: usize,
    instance_index: usize,
) -> CollectorResult<Vec<String>> {
    if instance_count == 0 {
        return Err(CollectorError::Config("instance count must be at least 1".into()));
    }
    if instance_index >= instance_count {
        return Err(CollectorError::Config(format!(
            "instance index {instance_index} out of range for {instance_count} instances"
        )));
    }

    Ok(sorted_ids
        .iter()
        .enumerate()
        .filter(|(k, _)| k % instance_count == instance_index)
        .map(|(_, id)| id.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(n: usize) -> Vec<String> {
        canonical_order((0..n).map(|i| format!("ex{i:03}")))
    }

    #[test]
    fn scenario_three_exchanges_two_instances() {
        let global = canonical_order(["hyperliquid", "bybit", "okx"]);
        assert_eq!(partition(&global, 2, 0).unwrap(), vec!["bybit", "okx"]);
        assert_eq!(partition(&global, 2, 1).unwrap(), vec!["hyperliquid"]);
    }

    #[test]
    fn union_covers_all_and_subsets_are_disjoint() {
        for n_exchanges in [0, 1, 2, 5, 13, 40] {
            let global = ids(n_exchanges);
            for n in 1..=8 {
                let mut seen = HashSet::new();
                let mut total = 0;
                for i in 0..n {
                    let part = partition(&global, n, i).unwrap();
                    total += part.len();
                    for id in part {
                        assert!(seen.insert(id), "duplicate assignment");
                    }
                }
                assert_eq!(total, global.len());
                assert_eq!(seen, global.iter().cloned().collect::<HashSet<_>>());
            }
        }
    }

    #[test]
    fn partition_is_deterministic() {
        let global = ids(17);
        for i in 0..4 {
            assert_eq!(partition(&global, 4, i).unwrap(), partition(&global, 4, i).unwrap());
        }
    }

    #[test]
    fn input_order_does_not_matter_after_canonicalization() {
        let a = canonical_order(["okx", "bybit", "hyperliquid", "bybit"]);
        let b = canonical_order(["hyperliquid", "okx", "bybit"]);
        assert_eq!(a, b);
    }

    #[test]
    fn excess_instances_idle() {
        let global = ids(2);
        assert!(partition(&global, 5, 4).unwrap().is_empty());
        assert_eq!(partition(&global, 5, 1).unwrap().len(), 1);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let global = ids(3);
        assert!(partition(&global, 0, 0).is_err());
        assert!(partition(&global, 2, 2).is_err());
    }
}
