use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::snapshot::{count, Snapshot};
use crate::{Address, GcError, Refob, Token};

/// What the local termination check wants done next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TermStep {
    /// All conditions met; the actor may stop.
    Stop,
    /// Not terminable yet; a later event will re-trigger the check.
    Continue,
    /// Inbound side is quiet but foreign refs are still held: release them.
    Shed,
    /// Self traffic is unbalanced: enqueue a `SelfCheck` and wait for it.
    SelfCheck,
}

/// A release sent but not yet acknowledged. Snapshots fold this back in so
/// the detector still sees the outbound evidence while the target may not
/// have witnessed the release.
#[derive(Debug)]
struct PendingRelease {
    releasing: Vec<(Refob, u64)>,
    created: Vec<Refob>,
}

/// One group of a release, addressed to a single target.
#[derive(Debug)]
pub(crate) struct OutboundRelease {
    pub to: Address,
    pub releasing: Vec<Refob>,
    pub created: Vec<Refob>,
    pub seq: u64,
}

/// Per-actor GC bookkeeping. Mutated only by the owning actor while it
/// processes a message; never shared.
#[derive(Debug)]
pub(crate) struct ActorState {
    self_ref: Refob,
    /// Refobs this actor owns and may send on. Always contains `self_ref`.
    refs: HashSet<Refob>,
    /// Refobs fabricated for other actors, keyed by the refob's target.
    /// Shipped to the target when a refob to that target is released.
    created: HashMap<Address, HashSet<Refob>>,
    /// Inbound refobs this actor knows exist. Always contains `self_ref`.
    owners: HashSet<Refob>,
    /// Inbound refobs released before their creation was witnessed.
    released_owners: HashSet<Refob>,
    sent: HashMap<Token, u64>,
    recv: HashMap<Token, u64>,
    token_seq: u64,
    release_seq: u64,
    pending: HashMap<u64, PendingRelease>,
    check_queued: bool,
}

impl ActorState {
    /// State for a newly spawned actor whose first owner is `inbound`: the
    /// refob the spawner minted for itself, or the external receptionist
    /// refob for the root actor.
    pub(crate) fn spawned(addr: Address, inbound: Refob) -> Self {
        let self_ref = Refob::new(Token::new(addr, 0), Some(addr), addr);
        let mut state = Self {
            self_ref,
            refs: HashSet::from([self_ref]),
            created: HashMap::new(),
            owners: HashSet::from([self_ref]),
            released_owners: HashSet::new(),
            sent: HashMap::from([(self_ref.token(), 0)]),
            recv: HashMap::from([(self_ref.token(), 0)]),
            token_seq: 1,
            release_seq: 0,
            pending: HashMap::new(),
            check_queued: false,
        };
        state.owners.insert(inbound);
        state.recv.insert(inbound.token(), 0);
        state
    }

    pub(crate) fn addr(&self) -> Address {
        self.self_ref.target()
    }

    pub(crate) fn self_ref(&self) -> Refob {
        self.self_ref
    }

    fn mint(&mut self) -> Token {
        let token = Token::new(self.addr(), self.token_seq);
        self.token_seq += 1;
        token
    }

    /// Owner-side half of spawning: mint a refob to the new child and start
    /// counting on it. The child's state is seeded with the same refob.
    pub(crate) fn spawn_ref(&mut self, child: Address) -> Refob {
        let refob = Refob::new(self.mint(), Some(self.addr()), child);
        self.refs.insert(refob);
        self.sent.insert(refob.token(), 0);
        refob
    }

    /// Fabricates a refob to `target`'s actor for `recipient`'s actor. The
    /// caller ships it to the recipient inside an app message; the target
    /// learns of it when the underlying refob is released.
    pub(crate) fn create_ref(
        &mut self,
        target: &Refob,
        recipient: &Refob,
    ) -> Result<Refob, GcError> {
        if !self.refs.contains(target) || !self.refs.contains(recipient) {
            return Err(GcError::NotOwned);
        }
        let mine = self.addr();
        let shared = Refob::new(self.mint(), Some(recipient.target()), target.target());
        if shared.target() == mine {
            // Creating a refob to ourselves: we are the target and have just
            // witnessed the creation, so there is nothing to announce later.
            self.owners.insert(shared);
            self.recv.entry(shared.token()).or_insert(0);
        } else if shared.owner() != Some(mine) {
            self.created
                .entry(shared.target())
                .or_default()
                .insert(shared);
        }
        if shared.owner() == Some(mine) {
            // Creating for ourselves: no self-shipment, and created entries
            // are only for refobs handed to someone else. `refs` and
            // `created` stay disjoint.
            self.refs.insert(shared);
            self.sent.entry(shared.token()).or_insert(0);
        }
        Ok(shared)
    }

    /// Counts an outbound application message on `via`.
    pub(crate) fn record_send(&mut self, via: &Refob) -> Result<Token, GcError> {
        if !self.refs.contains(via) {
            return Err(GcError::NotOwned);
        }
        *self.sent.entry(via.token()).or_insert(0) += 1;
        Ok(via.token())
    }

    /// Receive-side assimilation of an application message, before the user
    /// handler runs.
    pub(crate) fn receive_app(&mut self, travel: Token, refs: &[Refob]) {
        *self.recv.entry(travel).or_insert(0) += 1;
        let mine = self.addr();
        for &refob in refs {
            if refob.target() == mine && refob != self.self_ref {
                // A release naming this refob may have raced ahead of us.
                if !self.released_owners.remove(&refob) {
                    self.owners.insert(refob);
                    self.recv.entry(refob.token()).or_insert(0);
                }
            }
            if refob.owner() == Some(mine) && refob != self.self_ref {
                self.refs.insert(refob);
                self.sent.entry(refob.token()).or_insert(0);
            }
        }
    }

    /// Drops refobs this actor owns, grouped per target. Counters and the
    /// created entries for each target leave the live state immediately but
    /// are parked until the matching ack arrives.
    pub(crate) fn release(&mut self, dropping: &[Refob]) -> Vec<OutboundRelease> {
        let mut groups: HashMap<Address, Vec<Refob>> = HashMap::new();
        for &refob in dropping {
            if refob == self.self_ref || !self.refs.contains(&refob) {
                continue;
            }
            groups.entry(refob.target()).or_default().push(refob);
        }
        let mut out = Vec::with_capacity(groups.len());
        for (target, refobs) in groups {
            let created: Vec<Refob> = self
                .created
                .remove(&target)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            let mut parked = Vec::with_capacity(refobs.len());
            for refob in &refobs {
                self.refs.remove(refob);
                let sent = self.sent.remove(&refob.token()).unwrap_or(0);
                parked.push((*refob, sent));
            }
            let seq = self.release_seq;
            self.release_seq += 1;
            self.pending.insert(
                seq,
                PendingRelease {
                    releasing: parked,
                    created: created.clone(),
                },
            );
            out.push(OutboundRelease {
                to: target,
                releasing: refobs,
                created,
                seq,
            });
        }
        out
    }

    /// Target-side handling of a release.
    pub(crate) fn receive_release(&mut self, releasing: &[Refob], created: &[Refob]) {
        for refob in releasing {
            self.recv.remove(&refob.token());
            if !self.owners.remove(refob) {
                // Released before we witnessed the creation; remember the
                // release so the creation cancels against it.
                self.released_owners.insert(*refob);
            }
        }
        for refob in created {
            if refob.target() != self.addr() {
                continue;
            }
            if !self.released_owners.remove(refob) {
                self.owners.insert(*refob);
                self.recv.entry(refob.token()).or_insert(0);
            }
        }
    }

    /// Sender-side handling of a release ack: the parked bookkeeping is
    /// finally forgotten.
    pub(crate) fn receive_ack(&mut self, seq: u64) {
        if self.pending.remove(&seq).is_none() {
            trace!(seq, "ack for unknown release");
        }
    }

    /// Refobs held beyond the self-refob.
    pub(crate) fn foreign_refs(&self) -> Vec<Refob> {
        self.refs
            .iter()
            .filter(|r| **r != self.self_ref)
            .copied()
            .collect()
    }

    /// The local termination check. Strictly local; the detector provides
    /// the cross-actor guarantee.
    pub(crate) fn termination_step(&mut self) -> TermStep {
        if self.owners.len() != 1
            || !self.owners.contains(&self.self_ref)
            || !self.released_owners.is_empty()
        {
            return TermStep::Continue;
        }
        // Self traffic before shedding: an in-flight self-message may still
        // want the held refs when it lands.
        let token = self.self_ref.token();
        if count(&self.sent, token) != count(&self.recv, token) {
            if self.check_queued {
                return TermStep::Continue;
            }
            self.check_queued = true;
            return TermStep::SelfCheck;
        }
        if self.refs.len() > 1 {
            return TermStep::Shed;
        }
        if !self.pending.is_empty() {
            return TermStep::Continue;
        }
        TermStep::Stop
    }

    pub(crate) fn self_check_delivered(&mut self) {
        self.check_queued = false;
    }

    /// Immutable copy of the bookkeeping. Released-but-unacked refobs are
    /// folded back in: until the ack arrives the target may not have
    /// witnessed the release, and the detector must keep seeing them.
    pub(crate) fn snapshot(&self) -> Snapshot {
        let mut refs = self.refs.clone();
        let mut sent = self.sent.clone();
        let mut created: HashSet<Refob> = self.created.values().flatten().copied().collect();
        for parked in self.pending.values() {
            for (refob, n) in &parked.releasing {
                refs.insert(*refob);
                sent.insert(refob.token(), *n);
            }
            created.extend(parked.created.iter().copied());
        }
        Snapshot {
            self_ref: self.self_ref,
            refs,
            owners: self.owners.clone(),
            created,
            released_owners: self.released_owners.clone(),
            sent,
            recv: self.recv.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(handle: usize) -> Address {
        Address {
            handle,
            generation: 0,
        }
    }

    /// Wires up a parent/child pair the way spawn does.
    fn spawned_pair() -> (ActorState, ActorState) {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(0));
        let mut parent = ActorState::spawned(addr(0), ext);
        let child_ref = parent.spawn_ref(addr(1));
        let child = ActorState::spawned(addr(1), child_ref);
        (parent, child)
    }

    #[test]
    fn spawn_seeds_both_sides() {
        let (parent, child) = spawned_pair();
        let held: Vec<Refob> = parent.foreign_refs();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].target(), addr(1));
        assert!(child.owners.contains(&held[0]));
        assert!(child.owners.contains(&child.self_ref));
    }

    #[test]
    fn release_round_trip_restores_balance() {
        let (mut parent, mut child) = spawned_pair();
        let to_child = parent.foreign_refs()[0];

        // Fabricate a refob from some third actor to the child so the
        // created bookkeeping has something to ship.
        let third = parent.spawn_ref(addr(2));
        let shared = parent.create_ref(&to_child, &third).unwrap();
        assert!(parent.created[&addr(1)].contains(&shared));

        for out in parent.release(&[to_child]) {
            assert_eq!(out.to, addr(1));
            assert_eq!(out.created, vec![shared]);
            child.receive_release(&out.releasing, &out.created);
            parent.receive_ack(out.seq);
        }

        assert!(!child.owners.contains(&to_child));
        assert!(child.owners.contains(&shared));
        assert!(child.released_owners.is_empty());
        assert!(!parent.created.contains_key(&addr(1)));
        assert!(parent.pending.is_empty());
        assert!(!parent.refs.contains(&to_child));
        assert!(!parent.sent.contains_key(&to_child.token()));
    }

    #[test]
    fn create_ref_for_self_goes_straight_to_refs() {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(0));
        let mut actor = ActorState::spawned(addr(0), ext);
        let to_other = actor.spawn_ref(addr(1));
        let me = actor.self_ref();

        let second = actor.create_ref(&to_other, &me).unwrap();
        assert!(actor.refs.contains(&second));
        assert!(!actor.created.values().flatten().any(|r| *r == second));

        // Usable immediately, and the books stay disjoint.
        actor.record_send(&second).unwrap();
        assert_eq!(count(&actor.sent, second.token()), 1);
        let snap = actor.snapshot();
        assert!(snap.refs.is_disjoint(&snap.created));
    }

    #[test]
    fn create_release_race_is_tolerated() {
        // The creator announces (t, B, C) to C inside a release before B has
        // sent anything on it.
        let (mut parent, _child) = spawned_pair();
        let to_b = parent.spawn_ref(addr(2));
        let to_c = parent.spawn_ref(addr(3));
        let mut c = ActorState::spawned(addr(3), to_c);
        let shared = parent.create_ref(&to_c, &to_b).unwrap();

        for out in parent.release(&[to_c]) {
            c.receive_release(&out.releasing, &out.created);
        }
        assert!(c.owners.contains(&shared));
        assert!(!c.owners.contains(&to_c));

        // B's first send on the shared refob counts normally.
        c.receive_app(shared.token(), &[]);
        assert_eq!(count(&c.recv, shared.token()), 1);
        assert!(c.owners.contains(&c.self_ref));
        assert!(c.released_owners.is_empty());
    }

    #[test]
    fn release_before_witness_parks_in_released_owners() {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(5));
        let mut actor = ActorState::spawned(addr(5), ext);
        let stranger = Refob::new(Token::new(addr(7), 3), Some(addr(7)), addr(5));

        actor.receive_release(&[stranger], &[]);
        assert!(actor.released_owners.contains(&stranger));

        // The creation arrives later inside an app message and cancels.
        actor.receive_app(ext.token(), &[stranger]);
        assert!(actor.released_owners.is_empty());
        assert!(!actor.owners.contains(&stranger));
    }

    #[test]
    fn termination_requires_quiet_inbound_and_balanced_self() {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(4));
        let mut actor = ActorState::spawned(addr(4), ext);
        assert_eq!(actor.termination_step(), TermStep::Continue);

        actor.receive_release(&[ext], &[]);
        assert_eq!(actor.termination_step(), TermStep::Stop);

        // Unbalanced self traffic asks for a single self-check.
        let me = actor.self_ref();
        actor.record_send(&me).unwrap();
        assert_eq!(actor.termination_step(), TermStep::SelfCheck);
        assert_eq!(actor.termination_step(), TermStep::Continue);
        actor.self_check_delivered();
        actor.receive_app(me.token(), &[]);
        assert_eq!(actor.termination_step(), TermStep::Stop);
    }

    #[test]
    fn termination_sheds_foreign_refs_first() {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(4));
        let mut actor = ActorState::spawned(addr(4), ext);
        let held = actor.spawn_ref(addr(6));
        actor.receive_release(&[ext], &[]);

        assert_eq!(actor.termination_step(), TermStep::Shed);
        let out = actor.release(&[held]);
        assert_eq!(out.len(), 1);
        // Acks outstanding: still not terminable.
        assert_eq!(actor.termination_step(), TermStep::Continue);
        actor.receive_ack(out[0].seq);
        assert_eq!(actor.termination_step(), TermStep::Stop);
    }

    #[test]
    fn self_traffic_defers_shedding() {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(4));
        let mut actor = ActorState::spawned(addr(4), ext);
        let held = actor.spawn_ref(addr(6));
        let me = actor.self_ref();
        actor.record_send(&me).unwrap();
        actor.receive_release(&[ext], &[]);

        assert_eq!(actor.termination_step(), TermStep::SelfCheck);
        assert!(actor.refs.contains(&held));
    }

    #[test]
    fn snapshot_folds_unacked_releases_back_in() {
        let ext = Refob::new(Token::new(addr(99), 0), None, addr(4));
        let mut actor = ActorState::spawned(addr(4), ext);
        let held = actor.spawn_ref(addr(6));
        actor.record_send(&held).unwrap();

        let out = actor.release(&[held]);
        let snap = actor.snapshot();
        assert!(snap.refs.contains(&held));
        assert_eq!(count(&snap.sent, held.token()), 1);

        actor.receive_ack(out[0].seq);
        let snap = actor.snapshot();
        assert!(!snap.refs.contains(&held));
    }
}
