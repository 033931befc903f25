//! Reference-counting garbage collection for actor systems.
//!
//! Actors hold *refobs*, directed reference objects that authorize sending
//! messages to a target actor. Every refob is tracked on both ends: the owner
//! counts messages sent on it, the target counts messages received and keeps
//! a set of known owners. When an actor drops a refob it sends a release to
//! the target, which acknowledges once the bookkeeping has settled. An actor
//! whose only remaining owner is itself, with no traffic in flight, may stop.
//!
//! [`detect`] is the other half: a pure function over per-actor [`Snapshot`]s
//! that computes the set of actors which are provably terminated: quiescent
//! and unreachable from any live actor. Cycles of live, mutually-referencing
//! actors are not collected; only quiescent subgraphs are.
//!
//! ```
//! use soot::{Context, GcError, Refob, System};
//!
//! let mut sys = System::<String>::new();
//! sys.spawn_root("greeter", |_ctx| {
//!     |_ctx: &mut Context<String>, msg: String, _refs: &[Refob]| -> Result<(), GcError> {
//!         println!("hello, {msg}");
//!         Ok(())
//!     }
//! });
//! sys.tell_root("world".to_string());
//! sys.run_until_idle();
//! ```

use std::hash::{Hash, Hasher};

mod detect;
mod envelope;
mod runtime;
mod snapshot;
mod state;

pub use detect::detect;
pub use envelope::Envelope;
pub use runtime::{Behavior, Context, System};
pub use snapshot::Snapshot;


/// Location-independent name of an actor. Opaque to the protocol; the
/// switchboard resolves it to a mailbox for as long as the actor lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub(crate) handle: usize,
    pub(crate) generation: u32,
}

/// Globally unique identifier of a refob: the address of the actor that
/// minted it plus that actor's strictly increasing mint counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    origin: Address,
    seq: u64,
}

impl Token {
    pub(crate) fn new(origin: Address, seq: u64) -> Self {
        Self { origin, seq }
    }

    /// The actor that minted this token.
    pub fn origin(&self) -> Address {
        self.origin
    }
}

/// A directed reference object `(token, owner, target)`. Holding a refob
/// authorizes `owner` to send messages to `target`.
///
/// `owner` is `None` only for the external receptionist refob handed to the
/// world outside the system. Two refobs are equal iff their tokens are equal.
#[derive(Clone, Copy, Debug)]
pub struct Refob {
    token: Token,
    owner: Option<Address>,
    target: Address,
}

impl Refob {
    pub(crate) fn new(token: Token, owner: Option<Address>, target: Address) -> Self {
        Self {
            token,
            owner,
            target,
        }
    }

    /// A refob carrying only a token, for keyed lookups in refob sets.
    /// Equality ignores the other fields, so any values do.
    pub(crate) fn probe(token: Token) -> Self {
        Self {
            token,
            owner: None,
            target: token.origin,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn owner(&self) -> Option<Address> {
        self.owner
    }

    pub fn target(&self) -> Address {
        self.target
    }
}

impl PartialEq for Refob {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for Refob {}

impl Hash for Refob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

/// Faults surfaced by the GC layer. Everything else the protocol repairs
/// locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// The refob is not in this actor's owned set; sending or sharing on it
    /// would corrupt the counters.
    #[error("refob is not owned by this actor")]
    NotOwned,
    /// The target address no longer resolves to a live mailbox.
    #[error("target address does not resolve to a live actor")]
    Unroutable,
}
