use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use sharded_slab::{Clear, Pool};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::envelope::Envelope;
use crate::snapshot::Snapshot;
use crate::state::{ActorState, TermStep};
use crate::{Address, GcError, Refob, Token};

struct Route<M> {
    tx: Option<flume::Sender<Envelope<M>>>,
    generation: u32,
}

impl<M> Default for Route<M> {
    fn default() -> Self {
        Self {
            tx: None,
            generation: 0,
        }
    }
}

impl<M> Clear for Route<M> {
    fn clear(&mut self) {
        self.tx.take();
        self.generation += 1;
    }
}

/// Routes envelopes to mailboxes by address.
///
/// Addresses are generational: once an actor stops its slot is retired, and
/// mail addressed to the old generation no longer resolves. Freshly spawned
/// actors wait in the nursery until the driving [`System`] adopts them.
pub(crate) struct Switchboard<M> {
    routes: Pool<Route<M>>,
    nursery: Mutex<Vec<Box<dyn AnyCell<M> + Send>>>,
}

impl<M> Switchboard<M> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Pool::new(),
            nursery: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn insert(&self, tx: flume::Sender<Envelope<M>>) -> Address {
        let mut route = self.routes.create().unwrap();
        route.tx = Some(tx);

        Address {
            handle: route.key(),
            generation: route.generation,
        }
    }

    pub(crate) fn send(&self, to: Address, envelope: Envelope<M>) -> Result<(), GcError> {
        let Some(route) = self.route(&to) else {
            return Err(GcError::Unroutable);
        };

        let Some(tx) = &route.tx else {
            return Err(GcError::Unroutable);
        };

        if tx.send(envelope).is_err() {
            // Receiver gone; retire the route so later mail fails fast.
            drop(route);
            self.clear(to);
            return Err(GcError::Unroutable);
        }

        Ok(())
    }

    pub(crate) fn clear(&self, addr: Address) {
        if self.route(&addr).is_some() {
            self.routes.clear(addr.handle);
        }
    }

    fn route(&self, addr: &Address) -> Option<impl Deref<Target = Route<M>> + '_> {
        let route = self.routes.get(addr.handle)?;

        if route.generation != addr.generation {
            None
        } else {
            Some(route)
        }
    }

    fn adopt(&self, cell: Box<dyn AnyCell<M> + Send>) {
        self.nursery.lock().push(cell);
    }
}

/// User logic driven by the GC layer.
pub trait Behavior<M>: Send + 'static {
    /// Handles one application message. `refs` are the refobs that traveled
    /// with it, already assimilated into the actor's books. Returning an
    /// error is fatal for this actor.
    fn on_msg(&mut self, ctx: &mut Context<M>, payload: M, refs: &[Refob])
        -> Result<(), GcError>;
}

impl<M, F> Behavior<M> for F
where
    F: FnMut(&mut Context<M>, M, &[Refob]) -> Result<(), GcError> + Send + 'static,
{
    fn on_msg(
        &mut self,
        ctx: &mut Context<M>,
        payload: M,
        refs: &[Refob],
    ) -> Result<(), GcError> {
        self(ctx, payload, refs)
    }
}

enum Verdict {
    Continue,
    Stop,
    Fault,
}

/// An actor's handle to its own mailbox, bookkeeping, and the switchboard.
/// Handed to the behavior with every message; all GC operations go through
/// it.
pub struct Context<M> {
    board: Arc<Switchboard<M>>,
    rx: flume::Receiver<Envelope<M>>,
    name: String,
    state: ActorState,
    check_after: bool,
}

impl<M> Drop for Context<M> {
    fn drop(&mut self) {
        self.board.clear(self.state.addr());
    }
}

impl<M: Send + 'static> Context<M> {
    pub fn address(&self) -> Address {
        self.state.addr()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The refob this actor holds on itself, for self-sends.
    pub fn self_ref(&self) -> Refob {
        self.state.self_ref()
    }

    /// Spawns a child actor and returns a refob to it. The child starts
    /// processing once the driving [`System`] adopts it.
    pub fn spawn<B, F>(&mut self, name: &str, factory: F) -> Refob
    where
        B: Behavior<M>,
        F: FnOnce(&mut Context<M>) -> B,
    {
        let (tx, rx) = flume::unbounded();
        let child_addr = self.board.insert(tx);
        let child_ref = self.state.spawn_ref(child_addr);
        let mut ctx = Context {
            board: self.board.clone(),
            rx,
            name: name.to_owned(),
            state: ActorState::spawned(child_addr, child_ref),
            check_after: false,
        };
        debug!(parent = %self.name, child = %ctx.name, "spawn");
        let behavior = factory(&mut ctx);
        self.board.adopt(Box::new(Cell { ctx, behavior }));
        child_ref
    }

    /// Fabricates a refob to `target`'s actor for `recipient`'s actor. Ship
    /// it to the recipient inside a message sent along `recipient`; the
    /// target learns of it when the underlying refob is released.
    pub fn create_ref(&mut self, target: &Refob, recipient: &Refob) -> Result<Refob, GcError> {
        self.state.create_ref(target, recipient)
    }

    /// Sends an application message along `via`, attaching `refs`.
    pub fn send(&mut self, via: &Refob, payload: M, refs: Vec<Refob>) -> Result<(), GcError> {
        let travel = self.state.record_send(via)?;
        self.board.send(
            via.target(),
            Envelope::App {
                travel,
                refs,
                payload,
            },
        )
    }

    /// Drops refobs this actor owns. Each target is notified and will
    /// acknowledge; the released refobs must not be used again.
    pub fn release(&mut self, refobs: &[Refob]) {
        let from = self.address();
        for out in self.state.release(refobs) {
            trace!(actor = %self.name, to = ?out.to, releasing = out.releasing.len(), "release");
            let envelope = Envelope::Release {
                from,
                releasing: out.releasing,
                created: out.created,
                seq: out.seq,
            };
            if let Err(err) = self.board.send(out.to, envelope) {
                // A held refob normally keeps its target alive; getting here
                // means the protocol was violated somewhere upstream.
                warn!(actor = %self.name, %err, "release to retired address");
            }
        }
        self.check_after = true;
    }

    /// Releases every refob held besides the self-refob.
    pub fn release_all(&mut self) {
        let foreign = self.state.foreign_refs();
        self.release(&foreign);
    }

    /// Immutable copy of this actor's books. Meaningful to the detector only
    /// when taken at an idle moment.
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    fn deliver<B: Behavior<M>>(&mut self, envelope: Envelope<M>, behavior: &mut B) -> Verdict {
        trace!(actor = %self.name, kind = envelope.kind(), "deliver");
        match envelope {
            Envelope::App {
                travel,
                refs,
                payload,
            } => {
                self.state.receive_app(travel, &refs);
                if let Err(err) = behavior.on_msg(self, payload, &refs) {
                    warn!(actor = %self.name, %err, "behavior fault");
                    return Verdict::Fault;
                }
            }
            Envelope::Release {
                from,
                releasing,
                created,
                seq,
            } => {
                self.state.receive_release(&releasing, &created);
                let ack = Envelope::AckRelease {
                    releasing,
                    created,
                    seq,
                };
                if self.board.send(from, ack).is_err() {
                    trace!(actor = %self.name, "ack to retired address");
                }
            }
            Envelope::AckRelease { seq, .. } => {
                self.state.receive_ack(seq);
            }
            Envelope::SelfCheck => {
                self.state.self_check_delivered();
            }
        }

        // Every delivery could have enabled termination: a release or ack
        // directly, an app message by cancelling a raced release or by
        // balancing the self counters.
        self.check_after = true;
        while std::mem::take(&mut self.check_after) {
            match self.state.termination_step() {
                TermStep::Stop => {
                    debug!(actor = %self.name, "terminated");
                    return Verdict::Stop;
                }
                TermStep::Continue => {}
                TermStep::Shed => self.release_all(),
                TermStep::SelfCheck => {
                    let _ = self.board.send(self.address(), Envelope::SelfCheck);
                }
            }
        }
        Verdict::Continue
    }
}

enum Polled {
    Idle,
    Stepped,
    Stopped,
    Faulted,
}

struct Cell<M, B> {
    ctx: Context<M>,
    behavior: B,
}

trait AnyCell<M>: Send {
    fn poll(&mut self) -> Polled;
    fn address(&self) -> Address;
    fn name(&self) -> &str;
    fn idle(&self) -> bool;
    fn snapshot(&self) -> Snapshot;
}

impl<M: Send + 'static, B: Behavior<M>> AnyCell<M> for Cell<M, B> {
    fn poll(&mut self) -> Polled {
        match self.ctx.rx.try_recv() {
            Ok(envelope) => match self.ctx.deliver(envelope, &mut self.behavior) {
                Verdict::Continue => Polled::Stepped,
                Verdict::Stop => Polled::Stopped,
                Verdict::Fault => Polled::Faulted,
            },
            Err(_) => Polled::Idle,
        }
    }

    fn address(&self) -> Address {
        self.ctx.address()
    }

    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn idle(&self) -> bool {
        self.ctx.rx.is_empty()
    }

    fn snapshot(&self) -> Snapshot {
        self.ctx.snapshot()
    }
}

/// Single-threaded driver: owns the actors, pumps their mailboxes in rounds,
/// and stands in for the external world holding the receptionist refob.
///
/// Delivery is reliable FIFO per sender/recipient pair, which is all the
/// protocol assumes of a transport.
pub struct System<M> {
    board: Arc<Switchboard<M>>,
    cells: Slab<Box<dyn AnyCell<M> + Send>>,
    external_addr: Address,
    external_rx: flume::Receiver<Envelope<M>>,
    external_seq: u64,
    receptionist: Option<Refob>,
    parting: HashMap<Address, Snapshot>,
}

impl<M: Send + 'static> Default for System<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> System<M> {
    pub fn new() -> Self {
        let board = Switchboard::new();
        let (tx, rx) = flume::unbounded();
        let external_addr = board.insert(tx);
        Self {
            board,
            cells: Slab::new(),
            external_addr,
            external_rx: rx,
            external_seq: 0,
            receptionist: None,
            parting: HashMap::new(),
        }
    }

    /// Spawns the root actor. The external world owns its receptionist
    /// refob, so the root cannot terminate until [`System::release_root`].
    /// Expects to be called once per system.
    pub fn spawn_root<B, F>(&mut self, name: &str, factory: F) -> Address
    where
        B: Behavior<M>,
        F: FnOnce(&mut Context<M>) -> B,
    {
        let (tx, rx) = flume::unbounded();
        let root_addr = self.board.insert(tx);
        let receptionist = Refob::new(
            Token::new(self.external_addr, self.external_seq),
            None,
            root_addr,
        );
        self.external_seq += 1;
        let mut ctx = Context {
            board: self.board.clone(),
            rx,
            name: name.to_owned(),
            state: ActorState::spawned(root_addr, receptionist),
            check_after: false,
        };
        debug!(root = %ctx.name, "spawn root");
        let behavior = factory(&mut ctx);
        self.cells.insert(Box::new(Cell { ctx, behavior }));
        self.receptionist = Some(receptionist);
        root_addr
    }

    /// Sends to the root actor along the receptionist refob.
    pub fn tell_root(&mut self, payload: M) -> Result<(), GcError> {
        let receptionist = self.receptionist.ok_or(GcError::Unroutable)?;
        self.board.send(
            receptionist.target(),
            Envelope::App {
                travel: receptionist.token(),
                refs: Vec::new(),
                payload,
            },
        )
    }

    /// The external world drops its receptionist refob. From here on the
    /// root actor is an ordinary candidate for termination.
    pub fn release_root(&mut self) {
        if let Some(receptionist) = self.receptionist.take() {
            let seq = self.external_seq;
            self.external_seq += 1;
            let _ = self.board.send(
                receptionist.target(),
                Envelope::Release {
                    from: self.external_addr,
                    releasing: vec![receptionist],
                    created: Vec::new(),
                    seq,
                },
            );
        }
    }

    /// Adopts freshly spawned actors, then delivers at most one envelope per
    /// live actor. Returns whether anything happened.
    pub fn step(&mut self) -> bool {
        let mut progressed = false;
        let adopted: Vec<_> = self.board.nursery.lock().drain(..).collect();
        for cell in adopted {
            self.cells.insert(cell);
            progressed = true;
        }
        let keys: Vec<usize> = self.cells.iter().map(|(key, _)| key).collect();
        for key in keys {
            match self.cells[key].poll() {
                Polled::Idle => {}
                Polled::Stepped => progressed = true,
                Polled::Stopped => {
                    let cell = self.cells.remove(key);
                    self.parting.insert(cell.address(), cell.snapshot());
                    progressed = true;
                }
                Polled::Faulted => {
                    let cell = self.cells.remove(key);
                    warn!(actor = %cell.name(), "removing faulted actor");
                    progressed = true;
                }
            }
        }
        progressed
    }

    /// Pumps until every mailbox is drained and no actor has work left.
    pub fn run_until_idle(&mut self) {
        while self.step() {}
    }

    /// One snapshot per live actor whose mailbox is currently empty.
    /// Terminated actors contribute nothing.
    pub fn snapshots(&self) -> HashMap<Address, Snapshot> {
        self.cells
            .iter()
            .filter(|(_, cell)| cell.idle())
            .map(|(_, cell)| (cell.address(), cell.snapshot()))
            .collect()
    }

    /// The books an actor stopped with, if it has terminated cleanly.
    pub fn parting_snapshot(&self, addr: Address) -> Option<&Snapshot> {
        self.parting.get(&addr)
    }

    pub fn is_stopped(&self, addr: Address) -> bool {
        self.parting.contains_key(&addr)
    }

    /// Number of live actors.
    pub fn live(&self) -> usize {
        self.cells.len()
    }

    /// Drains mail addressed to the external world, which is mostly release
    /// acks.
    pub fn drain_external(&mut self) -> Vec<Envelope<M>> {
        self.external_rx.try_iter().collect()
    }
}
