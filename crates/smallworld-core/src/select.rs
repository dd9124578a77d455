//! Occlusion-rule neighbor selection shared by both graph engines.
//!
//! A candidate `c` for anchor `q` is kept iff no already-kept neighbor
//! `p` satisfies `dist(c, p) < dist(c, q)`: keeping only candidates that
//! are closer to the anchor than to any chosen neighbor prunes redundant
//! edges while preserving navigation diversity.

use crate::graph::NodeId;

/// Selects up to `cap` neighbors from `candidates` by the occlusion rule.
///
/// `candidates` must be sorted by ascending distance to the anchor.
/// `scan_limit` bounds how many candidates are examined (the NSG pruning
/// pool size `C`); pass `candidates.len()` for no bound. `sym` answers
/// engine-domain distances between two stored vectors.
///
/// Returns `(kept, pruned)`: the selected neighbors in ascending anchor
/// distance, and the occluded or unexamined remainder in encounter order
/// (used to backfill rows under the fill-to-capacity edge policy).
///
/// The rule is idempotent: re-running it over an already-selected set
/// returns that set unchanged.
pub fn occlusion_prune(
    candidates: &[(NodeId, f32)],
    cap: usize,
    scan_limit: usize,
    sym: &mut dyn FnMut(NodeId, NodeId) -> f32,
) -> (Vec<(NodeId, f32)>, Vec<(NodeId, f32)>) {
    let mut kept: Vec<(NodeId, f32)> = Vec::with_capacity(cap.min(candidates.len()));
    let mut pruned: Vec<(NodeId, f32)> = Vec::new();

    for (scanned, &(id, dist)) in candidates.iter().enumerate() {
        if kept.len() >= cap || scanned >= scan_limit {
            pruned.extend_from_slice(&candidates[scanned..]);
            break;
        }

        let occluded = kept
            .iter()
            .any(|&(kid, _)| kid == id || sym(kid, id) < dist);
        if occluded {
            pruned.push((id, dist));
        } else {
            kept.push((id, dist));
        }
    }

    (kept, pruned)
}
