//! Reference-counted broadcast buffer and its per-source FIFO queue.
//!
//! A [`RefBuf`] is an `Arc`-backed immutable byte chunk threaded into a
//! singly-linked chain. Rather than hand-rolling a reference count (as the
//! originating C implementation must), this models the three simultaneous
//! retention roles described by the data model directly as `Arc` clones:
//!
//! - the chain link itself (`next`) keeps downstream buffers alive;
//! - [`Queue::tail`] holds a clone granting **tail retention**;
//! - [`Queue::min_queue_point`] holds a clone granting **burst retention**
//!   for every buffer from itself to the tail;
//! - a [`crate::listener::Listener`] holds at most one clone, granting
//!   **listener retention**.
//!
//! `Arc::strong_count` is therefore exactly the `_count` field the original
//! tracks by hand, and a buffer is destroyed the moment its last clone
//! drops — which is what "destroyed when count reaches zero" means here.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

bitflags::bitflags! {
    /// Per-buffer flags. Only `flags` and `next` may change after creation;
    /// `data` is immutable once a `RefBuf` is built.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefBufFlags: u8 {
        /// Buffer starts at a codec frame boundary safe for mid-stream join.
        const SYNC_POINT = 0b001;
        /// Buffer is a queue-internal block (as opposed to a private,
        /// per-listener copy such as intro-file content).
        const QUEUE_BLOCK = 0b010;
        /// Buffer has been unlinked from the queue and is awaiting last
        /// release; any listener still pointing at it must drop it.
        const MARKED_FOR_RELEASE = 0b100;
    }
}

struct RefBufInner {
    data: Bytes,
    flags: AtomicU8,
    next: Mutex<Option<RefBuf>>,
}

/// A reference-counted, immutable broadcast buffer.
///
/// Cloning a `RefBuf` is "retaining" it; dropping the last clone is
/// "releasing" it to destruction, matching the vocabulary of §3/§4.1.
#[derive(Clone)]
pub struct RefBuf(Arc<RefBufInner>);

impl RefBuf {
    /// Builds a new, unlinked `RefBuf` from framed bytes produced by the
    /// `Format` adapter.
    pub fn new(data: Bytes, flags: RefBufFlags) -> Self {
        Self(Arc::new(RefBufInner {
            data,
            flags: AtomicU8::new(flags.bits()),
            next: Mutex::new(None),
        }))
    }

    /// The buffer's immutable payload.
    pub fn data(&self) -> &Bytes {
        &self.0.data
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> u64 {
        self.0.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    /// Current flags.
    pub fn flags(&self) -> RefBufFlags {
        RefBufFlags::from_bits_truncate(self.0.flags.load(Ordering::Acquire))
    }

    /// Sets (ORs in) the given flags.
    pub fn set_flags(&self, flags: RefBufFlags) {
        self.0.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Returns the next buffer in the chain, if linked.
    pub fn next(&self) -> Option<RefBuf> {
        self.0.next.lock().clone()
    }

    /// Links `next` after this buffer. Called exactly once per buffer, when
    /// a new buffer is appended to what was previously the tail.
    fn set_next(&self, next: RefBuf) {
        *self.0.next.lock() = Some(next);
    }

    /// Number of live references to this buffer: the queue-internal chain
    /// link that anchors it, plus tail retention, burst retention, and any
    /// listener retention, each contributed by a distinct `Arc` clone.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Identity comparison — used to detect whether a listener's held
    /// buffer is still the same node reachable from the queue.
    pub fn same_buffer(&self, other: &RefBuf) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for RefBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefBuf")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Per-source FIFO of [`RefBuf`]s with a distinguished burst head.
///
/// See §3/§4.1 for the full invariant set; this type enforces them by
/// construction rather than by external bookkeeping.
pub struct Queue {
    head: Option<RefBuf>,
    tail: Option<RefBuf>,
    min_queue_point: Option<RefBuf>,
    min_queue_offset: u64,
    min_queue_size: u64,
    queue_size: u64,
    queue_size_limit: u64,
    default_burst_size: u64,
}

impl Queue {
    pub fn new(queue_size_limit: u64, min_queue_size: u64, default_burst_size: u64) -> Self {
        Self {
            head: None,
            tail: None,
            min_queue_point: None,
            min_queue_offset: 0,
            min_queue_size,
            queue_size: 0,
            queue_size_limit,
            default_burst_size,
        }
    }

    pub fn head(&self) -> Option<&RefBuf> {
        self.head.as_ref()
    }

    pub fn tail(&self) -> Option<&RefBuf> {
        self.tail.as_ref()
    }

    pub fn min_queue_point(&self) -> Option<&RefBuf> {
        self.min_queue_point.as_ref()
    }

    pub fn min_queue_offset(&self) -> u64 {
        self.min_queue_offset
    }

    pub fn min_queue_size(&self) -> u64 {
        self.min_queue_size
    }

    pub fn queue_size(&self) -> u64 {
        self.queue_size
    }

    pub fn queue_size_limit(&self) -> u64 {
        self.queue_size_limit
    }

    pub fn default_burst_size(&self) -> u64 {
        self.default_burst_size
    }

    pub fn set_queue_size_limit(&mut self, limit: u64) {
        self.queue_size_limit = limit;
    }

    pub fn set_min_queue_size(&mut self, size: u64) {
        self.min_queue_size = size;
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends a freshly framed `RefBuf` to the tail, per §4.1's append
    /// algorithm. Returns the buffers that were trimmed from the head as a
    /// side effect, so the caller (the source) can notify listeners still
    /// pointing at them.
    pub fn append(&mut self, r: RefBuf) -> Vec<RefBuf> {
        r.set_flags(RefBufFlags::QUEUE_BLOCK);

        match self.tail.take() {
            None => {
                // Empty queue: r becomes head, tail, and burst point at once.
                self.head = Some(r.clone());
                self.min_queue_point = Some(r.clone());
                self.min_queue_offset = 0;
                self.tail = Some(r);
            }
            Some(old_tail) => {
                old_tail.set_next(r.clone());
                // old_tail's tail-retention reference is released by simply
                // not storing it back into self.tail.
                self.tail = Some(r);
            }
        }

        self.queue_size += self.tail.as_ref().unwrap().len();
        self.min_queue_offset += self.tail.as_ref().unwrap().len();

        // Advance min_queue_point, releasing burst retention as we go.
        while self.min_queue_offset > self.min_queue_size {
            let Some(point) = self.min_queue_point.clone() else {
                break;
            };
            let Some(next) = point.next() else {
                break;
            };
            self.min_queue_offset -= point.len();
            self.min_queue_point = Some(next);
            // `point`'s burst-retention clone is dropped here.
        }

        self.trim()
    }

    /// Trim-from-head: while over the size limit, or the head is retained
    /// only by the queue itself (no listener, no longer within the burst
    /// or tail-retention window), unlink it.
    ///
    /// Preserves the original's literal condition shape: a queue holding a
    /// single buffer never trims via the refcount branch, because that
    /// buffer is simultaneously head, tail, and (usually) the burst point,
    /// so its reference count is never exactly 1.
    fn trim(&mut self) -> Vec<RefBuf> {
        let mut released = Vec::new();
        loop {
            let over_limit = self.queue_size > self.queue_size_limit;
            // Read the count through the stored reference — cloning first
            // would add a second handle and the count could never read 1.
            let only_queue_holds_it = self.head.as_ref().map(|h| h.ref_count()) == Some(1);
            if !over_limit && !only_queue_holds_it {
                break;
            }
            let Some(head) = self.head.clone() else {
                break;
            };
            let Some(next) = head.next() else {
                // Can't trim the only remaining buffer further.
                break;
            };
            self.queue_size = self.queue_size.saturating_sub(head.len());
            head.set_flags(RefBufFlags::MARKED_FOR_RELEASE);
            self.head = Some(next);
            released.push(head);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(n: usize, flags: RefBufFlags) -> RefBuf {
        RefBuf::new(Bytes::from(vec![b'x'; n]), flags)
    }

    #[test]
    fn append_single_buffer_becomes_head_tail_and_burst_point() {
        let mut q = Queue::new(1000, 150, 150);
        let a = buf(100, RefBufFlags::SYNC_POINT);
        q.append(a.clone());
        assert!(q.head().unwrap().same_buffer(&a));
        assert!(q.tail().unwrap().same_buffer(&a));
        assert!(q.min_queue_point().unwrap().same_buffer(&a));
        assert_eq!(q.queue_size(), 100);
    }

    #[test]
    fn queue_size_accumulates_and_burst_point_advances() {
        let mut q = Queue::new(10_000, 150, 150);
        let a = buf(100, RefBufFlags::SYNC_POINT);
        let b = buf(100, RefBufFlags::empty());
        let c = buf(100, RefBufFlags::SYNC_POINT);
        q.append(a.clone());
        q.append(b.clone());
        q.append(c.clone());
        assert_eq!(q.queue_size(), 300);
        // min_queue_size=150: appending B pushes offset to 200, advancing
        // past A to B (offset 100); appending C pushes offset to 200 again,
        // advancing past B to C (offset 100).
        assert!(q.min_queue_point().unwrap().same_buffer(&c));
        assert_eq!(q.min_queue_offset(), 100);
    }

    #[test]
    fn trim_marks_head_for_release_when_over_limit() {
        let mut q = Queue::new(250, 50, 50);
        for _ in 0..5 {
            q.append(buf(100, RefBufFlags::empty()));
        }
        assert!(q.queue_size() <= 250 || q.head().unwrap().ref_count() > 1);
    }

    #[test]
    fn listener_holding_head_prevents_refcount_trim() {
        let mut q = Queue::new(10_000, 50, 50);
        let a = buf(100, RefBufFlags::SYNC_POINT);
        q.append(a.clone());
        let _listener_ref = q.head().unwrap().clone();
        // a is head+tail+burst-point+listener = 4 refs, never ==1.
        assert!(a.ref_count() > 1);
    }

    #[test]
    fn released_buffer_is_marked_for_release() {
        let mut q = Queue::new(150, 10, 10);
        q.append(buf(100, RefBufFlags::empty()));
        let released = q.append(buf(100, RefBufFlags::empty()));
        assert!(!released.is_empty());
        assert!(released[0].flags().contains(RefBufFlags::MARKED_FOR_RELEASE));
    }
}
