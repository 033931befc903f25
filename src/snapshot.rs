use std::collections::{HashMap, HashSet};

use crate::{Refob, Token};

pub(crate) fn count(counters: &HashMap<Token, u64>, token: Token) -> u64 {
    counters.get(&token).copied().unwrap_or(0)
}

/// Immutable copy of one actor's GC bookkeeping, taken while the actor is
/// idle. Compared by value; iteration order is never observed.
///
/// `created` is the flat union of the per-target created sets, and `refs`
/// includes refobs whose release has not yet been acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub self_ref: Refob,
    pub refs: HashSet<Refob>,
    pub owners: HashSet<Refob>,
    pub created: HashSet<Refob>,
    pub released_owners: HashSet<Refob>,
    pub sent: HashMap<Token, u64>,
    pub recv: HashMap<Token, u64>,
}

impl Snapshot {
    /// Whether the actor's own bookkeeping says it could stop: owned only by
    /// itself, no unresolved releases, self traffic balanced, and no traffic
    /// received on a refob it has never witnessed.
    pub fn is_quiescent(&self) -> bool {
        let token = self.self_ref.token();
        self.owners.len() == 1
            && self.owners.contains(&self.self_ref)
            && self.released_owners.is_empty()
            && count(&self.sent, token) == count(&self.recv, token)
            && self.recv.keys().all(|t| *t == token || self.witnessed(*t))
    }

    /// Whether this actor has seen the refob identified by `token` among its
    /// inbound refobs, released or not.
    pub(crate) fn witnessed(&self, token: Token) -> bool {
        let probe = Refob::probe(token);
        self.owners.contains(&probe) || self.released_owners.contains(&probe)
    }
}
