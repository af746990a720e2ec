//! The engine: submission, traversal, and tail advancement.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::gate::Gate;
use crate::node::{Kind, Node, StatusCell};
use crate::pr;
use crate::segment::{SegmentHandle, TailSegment};

/// An embeddable engine that serializes update and read callbacks against a
/// shared object without a dedicated worker pool.
///
/// Work is executed on whichever caller thread happens to be inside the
/// library when it becomes eligible. Wrap in `Arc<Engine>` to share across
/// submitter threads; the engine itself owns no thread of its own.
pub struct Engine {
    head: AtomicPtr<Node>,
    tail: Gate<SegmentHandle>,
    tail_move: AtomicBool,
    tail_init: AtomicBool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// A fresh engine with an empty log.
    ///
    /// Never fails: stable Rust's global allocator aborts the process on
    /// exhaustion rather than handing back a recoverable error, so there is
    /// no null-handle case left to model here.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: Gate::new_empty(),
            tail_move: AtomicBool::new(false),
            tail_init: AtomicBool::new(false),
        }
    }

    /// Submit an update: mutually exclusive with every other submitted node
    /// on this engine, in submission order.
    ///
    /// `status_cell`, if given, is written `PENDING` now and `DONE` once
    /// `callback` has returned; the caller may poll it independently of
    /// this call, which does not block on completion.
    pub fn submit_update<F>(&self, status_cell: Option<StatusCell>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Kind::Update, status_cell, Box::new(callback));
    }

    /// Submit a read: may run concurrently with other reads, but only after
    /// every update submitted before it has completed.
    ///
    /// See [`Engine::submit_update`] for the status-cell contract.
    pub fn submit_read<F>(&self, status_cell: Option<StatusCell>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Kind::Read, status_cell, Box::new(callback));
    }

    /// Drive one pass of execute-from-tail on the calling thread.
    ///
    /// Unlike a submission, this has no node of its own to walk toward: any
    /// null forward link encountered stops the traversal immediately rather
    /// than pause-spinning, and no tail advancement is attempted. Useful
    /// when a thread wants to help drain eligible work without itself
    /// submitting anything.
    pub fn sync(&self) {
        if let Some(segment) = self.tail.acquire() {
            execute_from_tail(&segment, None);
        }
    }

    fn submit(&self, kind: Kind, status_cell: Option<StatusCell>, callback: Box<dyn FnOnce() + Send>) {
        let node = Box::into_raw(Node::new(kind, status_cell, callback));

        // Step 2: opportunistically acquire the tail-move right. A prior
        // value of `false` means we are the designated mover for this
        // submission round.
        let held_tail_move = !self.tail_move.swap(true, Ordering::AcqRel);

        // The flag must be acquired before the tail segment is (below);
        // otherwise a submitter could hold a stale segment while believing
        // it owns the tail-move right and silently miss a concurrent
        // advancement. This fence sits between that acquisition and the
        // head-swap that publishes our node.
        pr::fence_memory();

        // Step 3: head-swap.
        let prev_head = self.head.swap(node, Ordering::AcqRel);

        // Step 4: link back, or bootstrap the log on the very first
        // submission.
        if prev_head.is_null() {
            let initial = TailSegment::new(node, ptr::null_mut());
            self.tail.install(Arc::new(SegmentHandle::new(initial)));
            self.tail_init.store(true, Ordering::Release);
            log::trace!("won the first-submission race, installed initial tail segment");
        } else {
            // SAFETY: `prev_head` was live at the moment of the head-swap
            // and cannot be freed until it is no longer reachable from the
            // log, which requires this store to have happened first.
            unsafe {
                (*prev_head).next.store(node, Ordering::Release);
                (*node).prev.store(prev_head, Ordering::Release);
            }

            // A very early submitter may still be installing the initial
            // segment; wait for it rather than acquiring a gate that has
            // nothing installed yet.
            let mut backoff = Backoff::new();
            while !self.tail_init.load(Ordering::Acquire) {
                backoff.spin();
            }
        }

        // Step 5: acquire the current tail segment.
        let segment = self
            .tail
            .acquire()
            .expect("tail segment installed before any submitter reaches this point");

        // Step 6: execute everything eligible, walking toward our own
        // insertion.
        let last_visited = execute_from_tail(&segment, Some(node));

        // Tail advancement, still holding `segment`: only the submitter
        // that captured the tail-move right may do this, and only if the
        // traversal actually walked past the segment's own tail-node.
        if held_tail_move {
            if let Some(boundary) = last_visited {
                if boundary != segment.tail_node {
                    advance_tail(&self.tail, &segment, boundary);
                }
            }
        }

        // Step 7: release the tail segment (implicit: `segment` drops at
        // scope end, decrementing its gate refcount).
        drop(segment);

        // Step 8.
        if held_tail_move {
            self.tail_move.store(false, Ordering::Release);
        }
    }
}

/// Wait until `node`'s forward link is populated, spinning with `backoff`.
///
/// Only valid to call on a node known to precede our own insertion: that
/// node's successor has already passed its head-swap, so the link is
/// imminent rather than indefinitely absent.
fn wait_for_next(node: *mut Node, backoff: &mut Backoff) -> *mut Node {
    loop {
        // SAFETY: `node` is still reachable and owned by the segment this
        // traversal is walking; no concurrent reclamation can free it while
        // our segment snapshot is held.
        let next = unsafe { (*node).next.load(Ordering::Acquire) };
        if !next.is_null() {
            return next;
        }
        backoff.spin();
    }
}

/// Walk `segment` from its tail-node forward, executing every node whose
/// dependency rules are satisfied and whose trylock can be won.
///
/// `anchor`, when given, is the node this traversal is walking toward (the
/// one just inserted by the calling submitter): a null forward link on a
/// node that precedes the anchor is waited for, since that link is known to
/// be imminent. Once `current` has *been* the anchor (latched in
/// `reached_anchor`, not just equal to it this iteration — a concurrent
/// submitter may have appended past the anchor before we observed it), any
/// further null link means the tip of the log has been reached and we must
/// not pause-spin: nothing downstream guarantees another submission is
/// coming. With no anchor at all (the `sync` path) any null forward link
/// stops the traversal immediately.
///
/// Returns the last node visited, or `None` if the segment is empty. A node
/// found PENDING but not yet ready (some required predecessor isn't DONE)
/// stops the traversal entirely and is itself returned as the last node
/// visited: everything strictly before it is DONE and safe to reclaim,
/// everything at or after it is not.
fn execute_from_tail(segment: &SegmentHandle, anchor: Option<*mut Node>) -> Option<*mut Node> {
    let mut current = segment.tail_node;
    if current.is_null() {
        return None;
    }

    let mut backoff = Backoff::new();
    let mut reached_anchor = false;

    loop {
        // SAFETY: `current` is within the acquired segment's range, which
        // cannot be reclaimed while `segment` is held.
        let node = unsafe { &*current };
        if !node.is_done() {
            if !is_ready(node, current, segment.tail_node) {
                return Some(current);
            }
            node.try_execute();
        }

        if anchor == Some(current) {
            reached_anchor = true;
        }

        let next = unsafe { (*current).next.load(Ordering::Acquire) };

        if next.is_null() {
            if anchor.is_some() && !reached_anchor {
                current = wait_for_next(current, &mut backoff);
                backoff.reset();
                continue;
            }
            return Some(current);
        }

        backoff.reset();
        current = next;
    }
}

/// Whether `node` (identified by `node_ptr`, living within the segment whose
/// tail-node is `boundary`) may execute now.
///
/// An UPDATE needs every predecessor back to `boundary` DONE; a READ needs
/// only its UPDATE predecessors DONE, ignoring other READs. `boundary`
/// itself participates in the same check as any other predecessor (its kind
/// matters exactly like any other node's would) and the walk always stops
/// there: stepping past it would follow a back-link into an older,
/// possibly already-reclaimed segment.
fn is_ready(node: &Node, node_ptr: *mut Node, boundary: *mut Node) -> bool {
    if node_ptr == boundary {
        // No predecessor range to check at all.
        return true;
    }

    let mut cursor = node.prev.load(Ordering::Acquire);
    loop {
        if cursor.is_null() {
            // Ran off the front of the segment without reaching `boundary`.
            return false;
        }

        // SAFETY: within this segment's still-held range.
        let predecessor = unsafe { &*cursor };
        let blocks = match node.kind() {
            Kind::Update => true,
            Kind::Read => predecessor.kind() == Kind::Update,
        };
        if blocks && !predecessor.is_done() {
            return false;
        }
        if cursor == boundary {
            return true;
        }
        cursor = predecessor.prev.load(Ordering::Acquire);
    }
}

/// Install a new tail segment starting at `boundary`, retiring `old`.
///
/// Only called by the submitter holding the tail-move right, with `old`
/// still acquired: the still-held reference is what makes it safe to read
/// `old`'s fields (and write its `head_node`) after installing the
/// replacement, since it prevents `old`'s destructor from running early.
fn advance_tail(gate: &Gate<SegmentHandle>, old: &SegmentHandle, boundary: *mut Node) {
    let old_ptr = old.as_ptr();
    let new_handle = SegmentHandle::new(TailSegment::new(boundary, old_ptr));
    let new_ptr = new_handle.as_ptr();

    old.next.store(new_ptr, Ordering::Release);
    gate.install(Arc::new(new_handle));
    log::trace!("tail advanced: segment {:p} retired, new boundary {:p}", old_ptr, boundary);

    // SAFETY: `boundary` is within `old`'s still-held range.
    let old_range_end = unsafe { (*boundary).prev.load(Ordering::Acquire) };
    old.head_node.store(old_range_end, Ordering::Release);
}
