use crate::{Address, Refob, Token};

/// Wire-level message recognized by every GC-aware actor.
///
/// Transport is reliable FIFO per directed sender/recipient pair; the
/// protocol leans on that for the one essential ordering property: an `App`
/// sent on a refob always arrives before the `Release` that drops it.
#[derive(Debug)]
pub enum Envelope<M> {
    /// Application traffic, traveling on the refob identified by `travel`,
    /// optionally carrying refobs fabricated for the recipient.
    App {
        travel: Token,
        refs: Vec<Refob>,
        payload: M,
    },
    /// The sender is dropping `releasing` and will never use them again.
    /// `created` carries refobs the sender fabricated that point at the
    /// recipient, so the recipient learns of owners it has not yet heard
    /// from.
    Release {
        from: Address,
        releasing: Vec<Refob>,
        created: Vec<Refob>,
        seq: u64,
    },
    /// Confirms a `Release`, permitting the sender to finalize its
    /// forgetting.
    AckRelease {
        releasing: Vec<Refob>,
        created: Vec<Refob>,
        seq: u64,
    },
    /// Internal wake-up for the local termination check. Never touches the
    /// send/receive counters even though it travels to self.
    SelfCheck,
}

impl<M> Envelope<M> {
    /// Message kind, for log lines.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Envelope::App { .. } => "app",
            Envelope::Release { .. } => "release",
            Envelope::AckRelease { .. } => "ack-release",
            Envelope::SelfCheck => "self-check",
        }
    }
}
