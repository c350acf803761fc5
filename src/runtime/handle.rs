use crate::runtime::data_structures::quotation::QuotationId;
use std::{cell::RefCell, rc::Rc};
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

/// Stable identity for a handle-registry entry.  Handed out in insertion order; never reused,
/// since a closed handle must still be able to answer "yes, I'm closed" for any later reference
/// to it rather than silently becoming a different resource.
pub type HandleId = u64;

/// What kind of event-loop resource a handle wraps.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleKind {
    Timer,
    Tcp,
}

/// A message sent to the background task that owns a connected `TcpStream`.  Both the read side
/// and the write side of one connection are driven by a single task (see
/// `runtime::built_ins::uv_words::run_connection`), so arming either direction is just pushing a
/// command through this channel rather than reaching back into the socket directly.
pub enum ConnCommand {
    /// Transmit these bytes. The string's backing buffer was already popped off the data stack by
    /// the word that sent this command -- its release is just the command being dropped once
    /// the write finishes.
    Write(Vec<u8>),

    /// Start delivering `Data`/`Eof` events for bytes arriving on this connection.
    StartRead,
}

/// The interpreter-side state of one handle.  The actual `tokio` resource (the timer sleep, the
/// listener, the stream) is owned by the spawned task referenced by `task` (and, for a connected
/// TCP handle, by the task reachable through `conn`) -- this slot only needs to know what to call
/// back into script code with, and how to cancel or address it.
struct HandleSlot {
    kind: HandleKind,

    /// The quotation to invoke on the next event, if one has been armed.
    callback: Option<QuotationId>,

    /// The background task driving this handle's events (timer ticks, accept loop, or the
    /// combined read/write loop for a connected stream).
    task: Option<JoinHandle<()>>,

    /// Set once `uv:close` has begun closing this handle.  Any further operation on it is a
    /// fatal error rather than silently undefined.
    closed: bool,

    /// For a `Tcp` handle once it is connected or accepted: a channel to the task that owns the
    /// `TcpStream`, used by `uv:write` and `uv:read-start`.
    conn: Option<UnboundedSender<ConnCommand>>,

    /// For a `Tcp` handle between `uv:tcp-bind` and `uv:listen`: the synchronously bound, not yet
    /// `tokio`-registered, listening socket.
    bound: Option<std::net::TcpListener>,
}

impl HandleSlot {
    fn new(kind: HandleKind) -> Self {
        HandleSlot { kind, callback: None, task: None, closed: false, conn: None, bound: None }
    }
}

/// Owns every live (or recently closed) handle.  Append-only: a closed slot is never reclaimed,
/// see the type's doc comment on why.
///
/// Cheaply `Clone`-able: the actual storage lives behind an `Rc<RefCell<_>>`, so a clone handed to
/// a spawned `tokio::task::spawn_local` task (the listener accept loop, a connection's read/write
/// loop) shares the same slots as the registry the interpreter holds. Nothing here is `Send` --
/// every task that holds a clone runs on the same single-threaded `LocalSet` as the interpreter.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    slots: Rc<RefCell<Vec<HandleSlot>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        HandleRegistry { slots: Rc::new(RefCell::new(Vec::new())) }
    }

    /// Register a new handle of the given kind, returning its id.
    pub fn allocate(&self, kind: HandleKind) -> HandleId {
        let mut slots = self.slots.borrow_mut();
        slots.push(HandleSlot::new(kind));
        (slots.len() - 1) as HandleId
    }

    pub fn kind(&self, id: HandleId) -> Option<HandleKind> {
        self.slots.borrow().get(id as usize).map(|slot| slot.kind)
    }

    pub fn is_closed(&self, id: HandleId) -> Option<bool> {
        self.slots.borrow().get(id as usize).map(|slot| slot.closed)
    }

    /// The handle's current callback, if any has been armed. `None` both for "no such handle" and
    /// for "no callback armed yet" -- callers that need to distinguish should check
    /// `is_closed`/existence separately; in practice every caller here already knows the handle
    /// exists, since it was just popped off the data stack.
    pub fn callback(&self, id: HandleId) -> Option<QuotationId> {
        self.slots.borrow().get(id as usize).and_then(|slot| slot.callback)
    }

    /// Replace this handle's callback, dropping any previous reference to one.  The displaced
    /// quotation remains live in the `QuotationStore` (quotations are never evicted there); only
    /// this slot stops rooting it.
    pub fn set_callback(&self, id: HandleId, quote: QuotationId) -> Option<()> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id as usize)?;
        slot.callback = Some(quote);
        Some(())
    }

    /// Record the task driving this handle's events, aborting and replacing any prior one.
    pub fn set_task(&self, id: HandleId, task: JoinHandle<()>) -> Option<()> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id as usize)?;

        if let Some(previous) = slot.task.replace(task) {
            previous.abort();
        }

        Some(())
    }

    /// Disarm a handle's background task without marking the slot closed, so a later re-arm
    /// (`uv:timer-start` again) can spawn a fresh one. Used by `uv:timer-stop`.
    pub fn stop_task(&self, id: HandleId) -> Option<()> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id as usize)?;

        if let Some(task) = slot.task.take() {
            task.abort();
        }

        Some(())
    }

    /// Whether any live background task is still driving this handle's events. `uv:run` keeps
    /// polling the loop as long as at least one handle answers yes here.
    pub fn has_active(&self) -> bool {
        self.slots
            .borrow()
            .iter()
            .any(|slot| !slot.closed && slot.task.as_ref().is_some_and(|task| !task.is_finished()))
    }

    /// Record the channel to a connected stream's owning task, so `uv:write`/`uv:read-start` can
    /// address it.
    pub fn set_conn(&self, id: HandleId, sender: UnboundedSender<ConnCommand>) -> Option<()> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id as usize)?;
        slot.conn = Some(sender);
        Some(())
    }

    /// A clone of the handle's connection channel, if it has one established.
    pub fn conn(&self, id: HandleId) -> Option<UnboundedSender<ConnCommand>> {
        self.slots.borrow().get(id as usize).and_then(|slot| slot.conn.clone())
    }

    /// Record a synchronously bound listener, awaiting `uv:listen` to promote it to `tokio`.
    pub fn set_bound(&self, id: HandleId, listener: std::net::TcpListener) -> Option<()> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id as usize)?;
        slot.bound = Some(listener);
        Some(())
    }

    /// Take the bound listener set by `uv:tcp-bind`, leaving `None` in its place. `uv:listen`
    /// uses this to hand the listener off to the accept-loop task it spawns.
    pub fn take_bound(&self, id: HandleId) -> Option<std::net::TcpListener> {
        let mut slots = self.slots.borrow_mut();
        slots.get_mut(id as usize)?.bound.take()
    }

    /// Begin closing a handle: abort its background task and mark it closed.  Returns `None` if
    /// the id is unknown or already closed, so the caller can raise the appropriate error.
    pub fn close(&self, id: HandleId) -> Option<()> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id as usize)?;

        if slot.closed {
            return None;
        }

        if let Some(task) = slot.task.take() {
            task.abort();
        }

        slot.conn = None;
        slot.bound = None;
        slot.closed = true;
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_hands_out_increasing_ids() {
        let registry = HandleRegistry::new();

        let a = registry.allocate(HandleKind::Timer);
        let b = registry.allocate(HandleKind::Tcp);

        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn close_is_idempotent_failure_on_second_call() {
        let registry = HandleRegistry::new();
        let id = registry.allocate(HandleKind::Timer);

        assert!(registry.close(id).is_some());
        assert!(registry.close(id).is_none());
        assert_eq!(registry.is_closed(id), Some(true));
    }

    #[test]
    fn set_callback_on_unknown_handle_is_none() {
        let registry = HandleRegistry::new();
        assert!(registry.set_callback(42, 0).is_none());
    }

    #[test]
    fn clone_shares_the_same_slots() {
        let registry = HandleRegistry::new();
        let clone = registry.clone();

        let id = registry.allocate(HandleKind::Tcp);

        assert_eq!(clone.kind(id), Some(HandleKind::Tcp));
        assert!(clone.set_callback(id, 7).is_some());
        assert_eq!(registry.callback(id), Some(7));
    }

    #[test]
    fn has_active_ignores_handles_with_no_task() {
        let registry = HandleRegistry::new();
        let id = registry.allocate(HandleKind::Timer);

        assert!(!registry.has_active());

        registry.close(id);
        assert!(!registry.has_active());
    }
}
