//! Log nodes: the unit of submitted work.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

/// Node status before the callback has run.
pub const PENDING: u8 = 0;
/// Node status once the callback has returned.
pub const DONE: u8 = 1;

/// Caller-owned completion flag, shared between the engine and the host so
/// both sides can outlive the submission call without unsafe lifetime
/// bookkeeping. Written [`PENDING`] at submission and [`DONE`] once the
/// callback returns.
pub type StatusCell = Arc<AtomicU8>;

/// Distinguishes update nodes (mutually exclusive with every other node)
/// from read nodes (mutually exclusive only with updates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Runs alone: no other update or read overlaps it.
    Update,
    /// May run concurrently with other reads; waits only on prior updates.
    Read,
}

type Callback = Box<dyn FnOnce() + Send>;

/// One submitted unit of work in the log.
///
/// Created by the submitter before the head-swap publishes it, mutated only
/// by the single thread that wins its trylock, and freed only by the
/// reclamation path of the tail segment that owns it.
pub struct Node {
    callback: UnsafeCell<Option<Callback>>,
    status: AtomicU8,
    status_cell: Option<StatusCell>,
    trylock: AtomicBool,
    kind: Kind,
    /// Previous node in submission order. Written once by the submitter,
    /// before the head-swap that publishes this node.
    pub prev: AtomicPtr<Node>,
    /// Next node in submission order. Written exactly once, by the
    /// *following* submitter, after its own head-swap has succeeded.
    pub next: AtomicPtr<Node>,
}

// `callback` is only ever touched by the single thread that wins `trylock`;
// every other field here is already a plain atomic.
unsafe impl Sync for Node {}

impl Node {
    /// Allocate a new node carrying `callback`. Not yet linked into the log.
    pub fn new(kind: Kind, status_cell: Option<StatusCell>, callback: Callback) -> Box<Node> {
        if let Some(cell) = &status_cell {
            cell.store(PENDING, Ordering::Release);
        }
        Box::new(Node {
            callback: UnsafeCell::new(Some(callback)),
            status: AtomicU8::new(PENDING),
            status_cell,
            trylock: AtomicBool::new(false),
            kind,
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// This node's kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Whether the callback has already run.
    pub fn is_done(&self) -> bool {
        self.status.load(Ordering::Acquire) == DONE
    }

    /// Attempt to become this node's unique executor and, on success, run
    /// its callback.
    ///
    /// Returns `true` if this call executed the callback, `false` if some
    /// other thread already owns (or has already finished) this node's
    /// trylock. The trylock is a single-attempt token, not a spinlock: a
    /// caller that loses the race must move on to the next node rather than
    /// wait here.
    ///
    /// Callers must only invoke this once the node's dependency rules (see
    /// the engine's traversal) have been confirmed satisfied.
    pub fn try_execute(&self) -> bool {
        if self.trylock.swap(true, Ordering::AcqRel) {
            return false;
        }

        // SAFETY: `trylock` just transitioned false -> true for this call
        // alone; no other thread can observe that transition and no other
        // call will ever see it again for this node, so exclusive access to
        // the callback cell is ours for this block only.
        let callback = unsafe { (*self.callback.get()).take() };
        if let Some(callback) = callback {
            callback();
        }

        self.status.store(DONE, Ordering::Release);
        if let Some(cell) = &self.status_cell {
            cell.store(DONE, Ordering::Release);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn try_execute_runs_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let node = Node::new(Kind::Update, None, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!node.is_done());
        assert!(node.try_execute());
        assert!(node.is_done());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second attempt loses the trylock race and does not re-run it.
        assert!(!node.try_execute());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_cell_mirrors_local_status() {
        let cell: StatusCell = Arc::new(AtomicU8::new(0xff));
        let node = Node::new(Kind::Read, Some(cell.clone()), Box::new(|| {}));
        assert_eq!(cell.load(Ordering::SeqCst), PENDING);
        node.try_execute();
        assert_eq!(cell.load(Ordering::SeqCst), DONE);
    }
}
