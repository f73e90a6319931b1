//! Merging freshly fetched operations into an account's history.

use crate::account::Operation;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Two copies of an operation whose dates are this close (in milliseconds) are considered to
/// have the same date. Backends don't always agree on sub-second precision.
pub const DATE_TOLERANCE_MS: i64 = 1_000;

/// Whether `b` is the same as the known `a`, or a correction of it (reorg, fee bump, ..).
pub fn same_operation(a: &Operation, b: &Operation) -> bool {
    a.id == b.id
        && a.fee == b.fee
        && a.value == b.value
        && a.block_height == b.block_height
        && (a.date - b.date).num_milliseconds().abs() <= DATE_TOLERANCE_MS
        && a.senders == b.senders
        && a.recipients == b.recipients
}

/// Merge `incoming` operations into the `existing` history.
///
/// `existing` must be sorted by date, newest first, without duplicates. `incoming` may be in
/// any order and overlap with `existing`. Operations of `incoming` which are already known are
/// ignored, the ones which changed supersede their known copy and the new ones are interleaved
/// at their place. Existing operations are never reordered relative to each other.
///
/// If nothing changes, the very same `existing` is returned.
pub fn merge_operations(
    existing: &Arc<Vec<Operation>>,
    incoming: Vec<Operation>,
) -> Arc<Vec<Operation>> {
    if incoming.is_empty() {
        return Arc::clone(existing);
    }

    // Within a single batch the last copy of an operation wins.
    let mut last_position: HashMap<String, usize> = HashMap::with_capacity(incoming.len());
    for (i, op) in incoming.iter().enumerate() {
        last_position.insert(op.id.clone(), i);
    }
    let known: HashMap<&str, &Operation> =
        existing.iter().map(|op| (op.id.as_str(), op)).collect();
    let mut fresh: Vec<Operation> = incoming
        .into_iter()
        .enumerate()
        .filter(|(i, op)| last_position.get(&op.id) == Some(i))
        .map(|(_, op)| op)
        .filter(|op| {
            known
                .get(op.id.as_str())
                .map_or(true, |known_op| !same_operation(known_op, op))
        })
        .collect();

    if fresh.is_empty() {
        return Arc::clone(existing);
    }
    // Stable, so operations with the same date keep the order the backend gave them.
    fresh.sort_by(|a, b| b.date.cmp(&a.date));
    log::debug!(
        "Merging {} new or updated operation(s) into {} known one(s).",
        fresh.len(),
        existing.len()
    );

    if existing.is_empty() {
        return Arc::new(fresh);
    }

    let superseded: HashSet<String> = fresh
        .iter()
        .filter(|op| known.contains_key(op.id.as_str()))
        .map(|op| op.id.clone())
        .collect();
    let mut merged = Vec::with_capacity(existing.len() + fresh.len() - superseded.len());
    let mut fresh = fresh.into_iter().peekable();
    for op in existing.iter() {
        while let Some(newer) = fresh.next_if(|newer| newer.date >= op.date) {
            merged.push(newer);
        }
        if !superseded.contains(&op.id) {
            merged.push(op.clone());
        }
    }
    merged.extend(fresh);

    Arc::new(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::op_at;

    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    const ACC: &str = "cs:1:bitcoin:xpubA:segwit";

    fn hashes(ops: &[Operation]) -> Vec<&str> {
        ops.iter().map(|op| op.hash.as_str()).collect()
    }

    fn is_sorted_desc(ops: &[Operation]) -> bool {
        ops.windows(2).all(|w| w[0].date >= w[1].date)
    }

    // A random history with unique hashes, sorted newest first.
    fn random_history(rng: &mut StdRng, prefix: &str, len: usize) -> Vec<Operation> {
        let mut ops: Vec<Operation> = (0..len)
            .map(|i| {
                op_at(
                    ACC,
                    &format!("{}{}", prefix, i),
                    rng.gen_range(0..50) * 10,
                    if rng.gen_bool(0.8) {
                        Some(rng.gen_range(1..1_000))
                    } else {
                        None
                    },
                )
            })
            .collect();
        ops.sort_by(|a, b| b.date.cmp(&a.date));
        ops
    }

    #[test]
    fn edge_cases() {
        let empty = Arc::new(Vec::new());
        let merged = merge_operations(&empty, Vec::new());
        assert!(Arc::ptr_eq(&merged, &empty));

        let incoming = vec![
            op_at(ACC, "a", 10, Some(1)),
            op_at(ACC, "c", 30, Some(3)),
            op_at(ACC, "b", 20, Some(2)),
        ];
        let merged = merge_operations(&empty, incoming);
        assert_eq!(hashes(&merged), vec!["c", "b", "a"]);

        let merged_again = merge_operations(&merged, Vec::new());
        assert!(Arc::ptr_eq(&merged_again, &merged));
    }

    #[test]
    fn known_operations_are_ignored() {
        let existing = Arc::new(vec![op_at(ACC, "b", 20, Some(2)), op_at(ACC, "a", 10, Some(1))]);
        let merged = merge_operations(&existing, existing.as_ref().clone());
        assert!(Arc::ptr_eq(&merged, &existing));

        // A date difference within the tolerance is not a change.
        let mut jittered = op_at(ACC, "b", 20, Some(2));
        jittered.date = jittered.date + chrono::Duration::milliseconds(DATE_TOLERANCE_MS);
        let merged = merge_operations(&existing, vec![jittered.clone()]);
        assert!(Arc::ptr_eq(&merged, &existing));

        jittered.date = jittered.date + chrono::Duration::milliseconds(1);
        let merged = merge_operations(&existing, vec![jittered]);
        assert!(!Arc::ptr_eq(&merged, &existing));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn interleaving() {
        let existing = Arc::new(vec![
            op_at(ACC, "e50", 50, Some(5)),
            op_at(ACC, "e30", 30, Some(3)),
            op_at(ACC, "e10", 10, Some(1)),
        ]);
        let incoming = vec![
            op_at(ACC, "n05", 5, Some(1)),
            op_at(ACC, "n60", 60, None),
            op_at(ACC, "n30", 30, Some(3)),
            op_at(ACC, "n20", 20, Some(2)),
        ];
        let merged = merge_operations(&existing, incoming);
        // New operations with the same date as an existing one go first.
        assert_eq!(
            hashes(&merged),
            vec!["n60", "e50", "n30", "e30", "n20", "e10", "n05"]
        );
    }

    #[test]
    fn supersession() {
        let existing = Arc::new(vec![
            op_at(ACC, "c", 30, Some(100)),
            op_at(ACC, "b", 20, Some(99)),
            op_at(ACC, "a", 10, Some(98)),
        ]);
        let reorged = op_at(ACC, "b", 20, Some(105));
        let merged = merge_operations(&existing, vec![reorged.clone()]);
        assert_eq!(hashes(&merged), vec!["c", "b", "a"]);
        assert_eq!(merged.iter().filter(|op| op.id == reorged.id).count(), 1);
        assert_eq!(merged[1].block_height, Some(105));

        // A fee bump moving the operation in time takes the new place.
        let mut bumped = op_at(ACC, "a", 40, Some(98));
        bumped.fee = 500;
        let merged = merge_operations(&merged, vec![bumped]);
        assert_eq!(hashes(&merged), vec!["a", "c", "b"]);
        assert_eq!(merged[0].fee, 500);
    }

    #[test]
    fn duplicates_in_a_batch() {
        let existing = Arc::new(vec![op_at(ACC, "a", 10, Some(1))]);
        let first = op_at(ACC, "b", 20, None);
        let second = op_at(ACC, "b", 20, Some(2));
        let merged = merge_operations(&existing, vec![first, second.clone()]);
        assert_eq!(hashes(&merged), vec!["b", "a"]);
        assert_eq!(merged[0], second);
    }

    #[test]
    fn merge_properties() {
        let mut rng = StdRng::seed_from_u64(0xc01d5);
        for _ in 0..500 {
            let a_len = rng.gen_range(0..20);
            let existing = Arc::new(random_history(&mut rng, "a", a_len));

            // Disjoint batch: everything is kept, sorted, and the existing order is preserved.
            let b_len = rng.gen_range(0..20);
            let mut disjoint = random_history(&mut rng, "b", b_len);
            disjoint.shuffle(&mut rng);
            let merged = merge_operations(&existing, disjoint.clone());
            assert_eq!(merged.len(), existing.len() + disjoint.len());
            assert!(is_sorted_desc(&merged));
            let kept: Vec<&Operation> = merged
                .iter()
                .filter(|op| op.hash.starts_with('a'))
                .collect();
            assert_eq!(kept, existing.iter().collect::<Vec<_>>());

            // Overlapping batch, with changed copies and duplicates: idempotent and unique.
            let mut overlapping: Vec<Operation> = existing
                .iter()
                .filter_map(|op| {
                    if !rng.gen_bool(0.5) {
                        return None;
                    }
                    let mut op = op.clone();
                    if rng.gen_bool(0.3) {
                        op.block_height = op.block_height.map(|h| h + 5).or(Some(1));
                    }
                    Some(op)
                })
                .collect();
            overlapping.extend(disjoint.iter().filter(|_| rng.gen_bool(0.5)).cloned());
            if let Some(dup) = overlapping.first().cloned() {
                overlapping.push(dup);
            }
            overlapping.shuffle(&mut rng);
            let once = merge_operations(&existing, overlapping.clone());
            let twice = merge_operations(&once, overlapping.clone());
            assert!(Arc::ptr_eq(&once, &twice));
            assert!(is_sorted_desc(&once));
            let ids: HashSet<&str> = once.iter().map(|op| op.id.as_str()).collect();
            assert_eq!(ids.len(), once.len());
        }
    }
}
