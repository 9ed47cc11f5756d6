//! Cross-ensemble diff.
//!
//! Given one snapshot per ensemble, [`plan`] computes the mirror nodes to
//! create and delete so that every ensemble's non-ephemeral set converges on
//! the union of the ephemeral sets of all *other* ensembles.
//!
//! Rules, applied to the snapshots exactly as read (nothing applied during
//! the pass feeds back into the plan):
//!
//! 1. For each ordered pair `(A, B)` and each `n` ephemeral on `A`:
//!    - `n` also ephemeral on `B`: conflict, reported for this pair, skipped
//!    - `n` ephemeral on some third ensemble: conflicted elsewhere, skipped
//!    - `n` not yet a mirror on `B`: create it on `B` (once)
//! 2. For each `n` non-ephemeral on `A`: delete it when no other ensemble
//!    announces `n` as ephemeral.
//!
//! The outcome does not depend on the order of the snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::view::MembershipSnapshot;

/// A mirror node to create or delete on ensemble `ensemble` (index into the input).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MirrorOp {
    pub ensemble: usize,
    pub node: String,
}

/// `node` is ephemeral on both `announced_on` and `also_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub node: String,
    pub announced_on: usize,
    pub also_on: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub creates: Vec<MirrorOp>,
    pub deletes: Vec<MirrorOp>,
    /// One entry per ordered conflicting pair.
    pub conflicts: Vec<Conflict>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// Compute the create/delete diff across `snapshots`.
pub fn plan(snapshots: &[&MembershipSnapshot]) -> ReconcilePlan {
    let mut announcers: BTreeMap<&str, usize> = BTreeMap::new();
    for snapshot in snapshots {
        for node in &snapshot.ephemeral {
            *announcers.entry(node.as_str()).or_default() += 1;
        }
    }

    let mut result = ReconcilePlan::default();
    let mut planned: BTreeSet<(usize, &str)> = BTreeSet::new();

    for (a, source) in snapshots.iter().enumerate() {
        for (b, dest) in snapshots.iter().enumerate() {
            if a == b {
                continue;
            }
            for node in &source.ephemeral {
                if dest.ephemeral.contains(node) {
                    result.conflicts.push(Conflict {
                        node: node.clone(),
                        announced_on: a,
                        also_on: b,
                    });
                    continue;
                }
                if announcers.get(node.as_str()).copied().unwrap_or(0) > 1 {
                    continue;
                }
                if !dest.nonephemeral.contains(node) && planned.insert((b, node.as_str())) {
                    result.creates.push(MirrorOp {
                        ensemble: b,
                        node: node.clone(),
                    });
                }
            }
        }
    }

    for (a, snapshot) in snapshots.iter().enumerate() {
        for node in &snapshot.nonephemeral {
            let live_elsewhere = snapshots
                .iter()
                .enumerate()
                .any(|(b, other)| b != a && other.ephemeral.contains(node));
            if !live_elsewhere {
                result.deletes.push(MirrorOp {
                    ensemble: a,
                    node: node.clone(),
                });
            }
        }
    }

    result
}
