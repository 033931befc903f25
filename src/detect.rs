//! Quiescence detection over a map of per-actor snapshots.
//!
//! The detector is pure: it never messages an actor and never aborts.
//! Malformed or partial input can only shrink the result, not produce a
//! false positive.
//!
//! The shape follows the shadow-graph idea: every refob observed in any
//! snapshot is an edge from its owner to its target, and an actor is
//! *potentially unblocked* if its own bookkeeping is not quiescent, if
//! traffic to it is unaccounted for, or if any potentially-unblocked actor
//! holds a path of refobs to it.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::snapshot::{count, Snapshot};
use crate::Address;

/// Computes the set of actors that are provably terminated: quiescent and
/// unreachable from any actor outside the returned set.
///
/// `snapshots` should hold each live actor's most recent idle snapshot;
/// actors without a snapshot are assumed live and unblocked. The receptionist
/// pattern falls out of that: the external world never has a snapshot, so the
/// root actor is excluded for as long as it keeps its receptionist refob.
pub fn detect(snapshots: &HashMap<Address, Snapshot>) -> HashSet<Address> {
    // An actor with no snapshot, or whose own bookkeeping is not quiescent,
    // may still act.
    let mut marked: HashSet<Address> = snapshots
        .iter()
        .filter(|(_, snap)| !snap.is_quiescent())
        .map(|(addr, _)| *addr)
        .collect();

    // Shadow edges: owner -> target for every refob any snapshot evidences.
    // Owned refs additionally claim a send count, checked against the
    // target's receive count; disagreement means traffic is in flight.
    let mut edges: Vec<(Option<Address>, Address)> = Vec::new();
    for (&addr, snap) in snapshots {
        for refob in &snap.refs {
            if *refob == snap.self_ref {
                continue;
            }
            edges.push((Some(addr), refob.target()));
            if let Some(target) = snapshots.get(&refob.target()) {
                if count(&snap.sent, refob.token()) != count(&target.recv, refob.token()) {
                    marked.insert(refob.target());
                }
            }
        }
        for refob in &snap.created {
            edges.push((refob.owner(), refob.target()));
        }
    }

    // Propagate: a potentially-unblocked owner may deliver, and delivery may
    // unblock the target in turn.
    let unblocked = |marked: &HashSet<Address>, addr: Option<Address>| match addr {
        Some(addr) => marked.contains(&addr) || !snapshots.contains_key(&addr),
        None => true,
    };
    loop {
        let mut changed = false;
        for &(owner, target) in &edges {
            if owner == Some(target) {
                continue;
            }
            if unblocked(&marked, owner) && snapshots.contains_key(&target) && marked.insert(target)
            {
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Closure: keep only actors whose outbound evidence points at other kept
    // actors, unless the target's own snapshot shows the refob is already
    // gone from its books. In that case the release has landed, and FIFO
    // delivery means nothing on that refob is still in flight.
    let mut kept: HashSet<Address> = snapshots
        .keys()
        .filter(|addr| !marked.contains(addr))
        .copied()
        .collect();
    loop {
        let dropped: Vec<Address> = kept
            .iter()
            .filter(|&&addr| {
                let snap = &snapshots[&addr];
                snap.refs
                    .iter()
                    .filter(|r| **r != snap.self_ref)
                    .chain(snap.created.iter())
                    .any(|refob| {
                        let target = refob.target();
                        if target == addr {
                            return false;
                        }
                        match snapshots.get(&target) {
                            Some(target_snap) if !target_snap.witnessed(refob.token()) => false,
                            _ => !kept.contains(&target),
                        }
                    })
            })
            .copied()
            .collect();
        if dropped.is_empty() {
            break;
        }
        for addr in dropped {
            kept.remove(&addr);
        }
    }

    debug!(
        snapshots = snapshots.len(),
        terminated = kept.len(),
        "detection pass"
    );
    kept
}
