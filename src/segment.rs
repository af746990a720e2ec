//! Tail segments and their chained reclamation.
//!
//! A tail segment is a [`gate::Gate`](crate::gate::Gate) version that
//! delimits a contiguous, now-closed-to-new-coverage range of the log. Once
//! the last snapshot of a segment is dropped, it must free every node in its
//! range — but only once it is certain no traversal rooted at an older,
//! still-live segment could still reach into that range. That ordering is
//! enforced by chaining: a segment only frees its nodes once its
//! predecessor has done the same.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::node::Node;
use crate::pr;

const RELEASED_BIT: usize = 1;

/// A predecessor link for a tail segment, packed with a one-bit "released"
/// marker in the low bit of the same word.
///
/// Tagging a raw pointer this directly would be fraught under Rust's
/// aliasing/provenance rules; storing the pair as a plain `usize` behind an
/// `AtomicUsize` sidesteps that while preserving the only thing the
/// reclamation algorithm actually needs: atomic read-modify-write over the
/// pointer-and-bit pair.
pub struct BackLink {
    raw: std::sync::atomic::AtomicUsize,
}

impl BackLink {
    /// A link pointing at `ptr`, released bit clear.
    pub fn new(ptr: *mut TailSegment) -> Self {
        debug_assert_eq!(
            ptr as usize & RELEASED_BIT,
            0,
            "TailSegment must be at least 2-byte aligned"
        );
        Self {
            raw: std::sync::atomic::AtomicUsize::new(ptr as usize),
        }
    }

    fn strip(raw: usize) -> *mut TailSegment {
        (raw & !RELEASED_BIT) as *mut TailSegment
    }

    /// Atomically set the released bit. Returns the pointer part of the
    /// value as it was *before* this call.
    pub fn fetch_set_released(&self) -> *mut TailSegment {
        let old = pr::usize_ops::faa_or(&self.raw, RELEASED_BIT);
        Self::strip(old)
    }

    /// Compare-and-swap the pointer part from `expect` (released bit clear)
    /// to null. Fails if the released bit has already been set concurrently
    /// or the pointer no longer matches `expect`.
    pub fn try_clear(&self, expect: *mut TailSegment) -> bool {
        pr::usize_ops::cas(&self.raw, expect as usize, 0)
    }
}

/// A reclamation-gate version delimiting a contiguous range of the log.
///
/// `tail_node` is the oldest node still live under this segment. `head_node`
/// is null while this segment is the engine's current (installed) segment,
/// and is set to the node that was the last one covered by this segment at
/// the moment a successor segment took over.
pub struct TailSegment {
    pub tail_node: *mut Node,
    pub head_node: AtomicPtr<Node>,
    pub prev: BackLink,
    pub next: AtomicPtr<TailSegment>,
}

// Every field here is either a raw pointer only ever followed under the
// chain-reclamation protocol below, or already a plain atomic.
unsafe impl Send for TailSegment {}
unsafe impl Sync for TailSegment {}

impl TailSegment {
    /// A segment covering `tail_node` onward, chained behind `prev`.
    pub fn new(tail_node: *mut Node, prev: *mut TailSegment) -> Self {
        Self {
            tail_node,
            head_node: AtomicPtr::new(ptr::null_mut()),
            prev: BackLink::new(prev),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Owning handle to a heap-allocated [`TailSegment`].
///
/// This indirection exists because a segment's refcount reaching zero and
/// its backing memory actually being freed are *not* the same event here:
/// step 1 of chained reclamation requires a predecessor's destructor to read
/// a successor segment's `tail_node`/`head_node`/`next` fields, potentially
/// after that successor's own gate refcount has already reached zero. Under
/// a plain `Arc<TailSegment>` those two events would coincide and that read
/// would be a use-after-free. Wrapping the pointer in `SegmentHandle` lets
/// `Drop` run the manual chain protocol (`reclaim_segment`) and only free
/// the struct once the protocol has proven it safe.
pub struct SegmentHandle(*mut TailSegment);

unsafe impl Send for SegmentHandle {}
unsafe impl Sync for SegmentHandle {}

impl SegmentHandle {
    /// Take ownership of `segment`, heap-allocating it.
    pub fn new(segment: TailSegment) -> Self {
        Self(Box::into_raw(Box::new(segment)))
    }

    /// The raw pointer this handle owns. Valid for as long as this handle
    /// (or any clone of the `Arc` wrapping it) is alive.
    pub fn as_ptr(&self) -> *mut TailSegment {
        self.0
    }
}

impl std::ops::Deref for SegmentHandle {
    type Target = TailSegment;

    fn deref(&self) -> &TailSegment {
        // SAFETY: the handle owns this allocation and nothing frees it out
        // from under a live `SegmentHandle`.
        unsafe { &*self.0 }
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        reclaim_segment(self.0);
    }
}

/// Free every node from `segment.tail_node` to `segment.head_node`
/// inclusive.
///
/// `head_node` is null only when `segment` was still the engine's current,
/// never-superseded segment at the moment it was torn down (this only
/// happens when the engine itself is dropped); in that case the range has
/// no known upper bound ahead of time, so this walks until it runs off the
/// end of the log (a null forward link) instead.
fn free_node_range(segment: &TailSegment) {
    let head = segment.head_node.load(Ordering::Acquire);
    let mut current = segment.tail_node;

    while !current.is_null() {
        // SAFETY: `current` is still within this segment's unreclaimed
        // range; no other thread frees nodes here except this chain.
        let next = unsafe { (*current).next.load(Ordering::Acquire) };
        let is_last = current == head || (head.is_null() && next.is_null());

        // SAFETY: this segment is the sole owner of every node in its
        // range, and this call runs only once that range is provably
        // unreachable by any other traversal (see module docs).
        unsafe {
            drop(Box::from_raw(current));
        }

        if is_last {
            break;
        }
        current = next;
    }
}

/// Run the chained reclamation protocol for `seg`, whose gate refcount has
/// just reached zero.
///
/// Segments are freed strictly oldest-first: a traversal rooted at an older
/// segment may walk, via forward links, through nodes belonging to newer
/// segments without ever itself acquiring those newer segments. Freeing a
/// newer segment while such a traversal could still be in flight through it
/// would be a use-after-free; requiring "this segment cannot finish until
/// its predecessor already has" guarantees that by the time a segment's
/// nodes are freed, every traversal that could have reached them has
/// already released its hold.
fn reclaim_segment(mut seg: *mut TailSegment) {
    // SAFETY: `seg` is the struct whose refcount just reached zero; it has
    // not yet been freed and no other thread is entitled to read it except
    // through this same protocol.
    let predecessor = unsafe { (*seg).prev.fetch_set_released() };
    if !predecessor.is_null() {
        // Our predecessor hasn't released yet. Its own later call into this
        // function will notice our released bit and take over freeing us.
        return;
    }

    loop {
        // SAFETY: see above; `seg` is provably the oldest live segment at
        // this point in the chain.
        free_node_range(unsafe { &*seg });

        let next = unsafe { (*seg).next.load(Ordering::Acquire) };
        if next.is_null() {
            // `seg` had no successor installed yet (the engine itself is
            // being torn down). Nothing downstream to hand off to.
            unsafe {
                drop(Box::from_raw(seg));
            }
            return;
        }

        let handed_off = unsafe { (*next).prev.try_clear(seg) };
        unsafe {
            drop(Box::from_raw(seg));
        }

        if handed_off {
            // `next` is still in use; its own eventual release will find
            // its predecessor link already clear and proceed on its own.
            return;
        }

        // `next` had already set its own released bit — it started its own
        // reclamation, found `seg` not yet released, and deferred. Now that
        // `seg` is fully done, take over freeing `next`.
        seg = next;
    }
}
