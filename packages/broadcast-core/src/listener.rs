//! Listener: one subscriber attached to a [`crate::source::Source`].
//!
//! The listener's behavior is a tagged state (`ops`) rather than a function
//! pointer, per the design notes' guidance on translating "function
//! pointers as state" into a `match` over an enum.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::refbuf::RefBuf;
use crate::source::Source;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListenerFlags: u8 {
        /// Listener has passed authentication (set by the external auth
        /// backend before the listener is ever handed to this crate).
        const AUTHENTICATED = 0b0001;
        /// Current `refbuf` is a private intro-file copy, not a queue node.
        const HAS_INTRO_CONTENT = 0b0010;
        /// Listener has been migrated at least once by the handoff protocol.
        const HAS_MOVED = 0b0100;
        /// Slave/relay connection: bypasses mount-level admission limits.
        const IS_SLAVE = 0b1000;
    }
}

/// Opaque sink for bytes destined for a listener's transport connection.
///
/// The concrete socket/HTTP-chunking mechanics are an external collaborator
/// (§1 Non-goals); this crate only needs to push bytes through one. Tests
/// use an in-memory implementation; a real deployment backs this with an
/// actual connection.
pub trait ListenerSink: Send + Sync {
    /// Attempts to write `data`, returning the number of bytes actually
    /// accepted. Must never block; a partial write is not an error.
    fn send(&self, data: &[u8]) -> std::io::Result<usize>;

    /// Marks the connection as failed/closed from the transport's side.
    fn mark_error(&self) {}
}

/// Connection-level bookkeeping mirroring `connection.{sent_bytes, error,
/// discon_time, con_time}` from §3.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub sent_bytes: AtomicU64,
    pub error: AtomicBool,
    /// Epoch-ms when disconnection became known, 0 if still connected.
    pub discon_time: AtomicU64,
    /// Epoch-ms the connection was accepted.
    pub con_time: AtomicU64,
}

impl ConnectionStats {
    pub fn new(now_ms: u64) -> Self {
        Self {
            sent_bytes: AtomicU64::new(0),
            error: AtomicBool::new(false),
            discon_time: AtomicU64::new(0),
            con_time: AtomicU64::new(now_ms),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::Release);
    }
}

/// Sub-state of the `CLIENT` `ops` variant — the `check_buffer` state
/// machine of §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckBufferState {
    /// Sending HTTP response headers + format preamble.
    HttpSourceListener,
    /// Deciding whether an intro file should play before the live queue.
    HttpSourceIntro,
    /// Streaming from the configured intro file.
    HttpSourceIntroFile,
    /// Streaming from the source's live queue.
    SourceQueueAdvance { burst_located: bool },
}

/// A listener's top-level behavior tag (`ops` in §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOps {
    /// Actively being driven through `check_buffer`.
    Client(CheckBufferState),
    /// Waiting up to 15s for its source to restart (`wait_for_restart`).
    Pause { entered_at_ms: u64 },
    /// Acknowledged termination, waiting for sibling listeners
    /// (`wait_for_other_listeners`).
    Wait,
}

/// One subscriber to a source.
pub struct Listener {
    pub id: Uuid,
    pub sink: Arc<dyn ListenerSink>,
    pub username: Option<String>,
    pub requested_burst_bytes: Option<u64>,
    /// Per-pass write ceiling (`listener_send_trigger`): the `CLIENT` loop
    /// stops once it has written this many bytes in one scheduling pass,
    /// independent of the loop-count bound.
    pub send_trigger_bytes: u64,
    pub flags: Mutex<ListenerFlags>,

    refbuf: Mutex<Option<RefBuf>>,
    pos: AtomicU64,
    queue_pos: AtomicU64,
    /// -1 means intro-file replay is done/inactive.
    intro_offset: AtomicI64,

    pub ops: Mutex<ListenerOps>,
    pub schedule_ms: AtomicU64,
    pub timer_start_ms: AtomicU64,

    pub connection: ConnectionStats,

    /// The source this listener is currently attached to. `Weak` so that a
    /// listener sitting in a source's `listeners` map (which holds `Arc`s
    /// pointing the other way) never keeps that source alive on its own —
    /// an `Arc` here would form a cycle neither side ever drops.
    current_source: Mutex<Weak<Source>>,
}

impl Listener {
    pub fn new(sink: Arc<dyn ListenerSink>, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sink,
            username: None,
            requested_burst_bytes: None,
            send_trigger_bytes: crate::protocol_constants::DEFAULT_LISTENER_SEND_TRIGGER_BYTES,
            flags: Mutex::new(ListenerFlags::empty()),
            refbuf: Mutex::new(None),
            pos: AtomicU64::new(0),
            queue_pos: AtomicU64::new(0),
            intro_offset: AtomicI64::new(-1),
            ops: Mutex::new(ListenerOps::Client(CheckBufferState::HttpSourceListener)),
            schedule_ms: AtomicU64::new(now_ms),
            timer_start_ms: AtomicU64::new(now_ms),
            connection: ConnectionStats::new(now_ms),
            current_source: Mutex::new(Weak::new()),
        }
    }

    /// The source this listener is presently attached to, if it still
    /// exists. `None` means the listener was never attached, or its source
    /// has since been dropped without the listener being moved or torn
    /// down (a bookkeeping gap rather than a normal lifecycle state).
    pub fn current_source(&self) -> Option<Arc<Source>> {
        self.current_source.lock().upgrade()
    }

    /// Records `source` as this listener's current attachment point. Called
    /// whenever a listener is added to a source's `listeners` map, so the
    /// scheduler can always resolve which source to drive it against.
    pub fn set_current_source(&self, source: &Arc<Source>) {
        *self.current_source.lock() = Arc::downgrade(source);
    }

    pub fn refbuf(&self) -> Option<RefBuf> {
        self.refbuf.lock().clone()
    }

    pub fn set_refbuf(&self, buf: Option<RefBuf>) {
        *self.refbuf.lock() = buf;
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    pub fn advance_pos(&self, n: u64) {
        self.pos.fetch_add(n, Ordering::AcqRel);
    }

    pub fn queue_pos(&self) -> u64 {
        self.queue_pos.load(Ordering::Acquire)
    }

    pub fn set_queue_pos(&self, pos: u64) {
        self.queue_pos.store(pos, Ordering::Release);
    }

    pub fn advance_queue_pos(&self, n: u64) {
        self.queue_pos.fetch_add(n, Ordering::AcqRel);
    }

    pub fn intro_offset(&self) -> Option<u64> {
        let v = self.intro_offset.load(Ordering::Acquire);
        if v < 0 {
            None
        } else {
            Some(v as u64)
        }
    }

    pub fn set_intro_offset(&self, offset: Option<u64>) {
        self.intro_offset
            .store(offset.map(|v| v as i64).unwrap_or(-1), Ordering::Release);
    }

    pub fn schedule_now(&self) {
        self.schedule_ms.store(0, Ordering::Release);
    }

    pub fn reschedule_in(&self, now_ms: u64, delay_ms: u64) {
        self.schedule_ms.store(now_ms + delay_ms, Ordering::Release);
    }

    pub fn reschedule_at(&self, at_ms: u64) {
        self.schedule_ms.store(at_ms, Ordering::Release);
    }

    pub fn has_flag(&self, flag: ListenerFlags) -> bool {
        self.flags.lock().contains(flag)
    }

    pub fn set_flag(&self, flag: ListenerFlags) {
        self.flags.lock().insert(flag);
    }

    pub fn clear_flag(&self, flag: ListenerFlags) {
        self.flags.lock().remove(flag);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex as PMutex;

    /// In-memory sink that records everything written to it.
    #[derive(Default)]
    pub struct MemorySink {
        pub written: PMutex<Vec<u8>>,
    }

    impl ListenerSink for MemorySink {
        fn send(&self, data: &[u8]) -> std::io::Result<usize> {
            self.written.lock().extend_from_slice(data);
            Ok(data.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemorySink;
    use super::*;

    #[test]
    fn new_listener_starts_in_header_state() {
        let l = Listener::new(Arc::new(MemorySink::default()), 0);
        assert_eq!(
            *l.ops.lock(),
            ListenerOps::Client(CheckBufferState::HttpSourceListener)
        );
        assert_eq!(l.intro_offset(), None);
    }

    #[test]
    fn current_source_is_none_until_attached() {
        let l = Listener::new(Arc::new(MemorySink::default()), 0);
        assert!(l.current_source().is_none());
    }

    #[test]
    fn pos_and_queue_pos_advance_independently() {
        let l = Listener::new(Arc::new(MemorySink::default()), 0);
        l.advance_pos(10);
        l.advance_queue_pos(5);
        assert_eq!(l.pos(), 10);
        assert_eq!(l.queue_pos(), 5);
    }
}
