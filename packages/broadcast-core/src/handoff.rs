//! Listener migration: the handoff side of §4.6.
//!
//! When a source enters `LISTENERS_SYNC` (because it died, or because a
//! hijacking source displaced it), its listeners are moved one at a time
//! to a successor — either the mount's configured `fallback_mount`, or
//! (on a hijack) the new occupant of the same mountpoint — rather than
//! dropped outright. `Source::check_listeners_sync_watchdog` bounds how
//! long this may take.

use std::sync::Arc;

use crate::listener::{CheckBufferState, Listener, ListenerOps};
use crate::refbuf::RefBuf;
use crate::source::Source;

/// Moves `listener` from `from` to `to`, resetting it to relocate a fresh
/// burst start point on its successor and marking `HAS_MOVED` so
/// diagnostics can distinguish a migrated listener from a freshly attached
/// one. Decrements `from`'s termination count; returns whether that was
/// the last listener `from` was waiting on.
pub fn move_listener(from: &Source, to: &Arc<Source>, listener: Arc<Listener>) -> bool {
    from.remove_listener(&listener.id);
    listener.set_flag(crate::listener::ListenerFlags::HAS_MOVED);
    listener.set_refbuf(None::<RefBuf>);
    listener.set_pos(0);
    listener.set_queue_pos(0);
    *listener.ops.lock() = ListenerOps::Client(CheckBufferState::SourceQueueAdvance {
        burst_located: false,
    });
    Source::attach_listener(to, listener);
    from.acknowledge_listener_migrated()
}

/// Migrates every listener currently attached to `from` onto `to`. Used
/// both for the fallback-on-death path and for the hijack-handoff path;
/// the two differ only in where `to` comes from.
pub fn migrate_all_listeners(from: &Source, to: &Arc<Source>) {
    let ids: Vec<_> = from.listeners.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some(listener) = from.remove_listener(&id) {
            move_listener(from, to, listener);
        }
    }
}

/// Drains every listener on a source that has died with no fallback
/// target, tearing each one down (the connection-level error flag signals
/// the hosting transport to close the socket).
pub fn disconnect_all_listeners(source: &Source) {
    let ids: Vec<_> = source.listeners.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some(listener) = source.remove_listener(&id) {
            listener.connection.set_error();
        }
        source.acknowledge_listener_migrated();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, FormatType};
    use crate::refbuf::RefBufFlags;

    struct StubFormat;
    impl Format for StubFormat {
        fn format_type(&self) -> FormatType {
            FormatType("ogg")
        }
        fn get_buffer(&mut self, _source: &Source) -> crate::error::BroadcastResult<Option<RefBuf>> {
            Ok(None)
        }
        fn write_buf_to_client(&self, _listener: &Listener) -> crate::error::BroadcastResult<usize> {
            Ok(0)
        }
        fn create_client_data(&self, _listener: &Listener) -> crate::error::BroadcastResult<RefBuf> {
            Ok(RefBuf::new(bytes::Bytes::new(), RefBufFlags::empty()))
        }
        fn apply_settings(&mut self, _mount: &crate::config::MountProxy) {}
    }

    fn source(mount: &str) -> Source {
        Source::new(mount, Box::new(StubFormat), 1_000_000, 65_536, 65_536, 10, 0)
    }

    #[test]
    fn move_listener_transfers_ownership_and_resets_position() {
        let from = source("/live.ogg");
        let to = Arc::new(source("/backup.ogg"));
        let listener = Arc::new(Listener::new(
            Arc::new(crate::listener::test_support::MemorySink::default()),
            0,
        ));
        listener.advance_pos(500);
        from.add_listener(listener.clone());
        from.begin_listeners_sync(0);

        let was_last = move_listener(&from, &to, listener.clone());
        assert!(was_last);
        assert_eq!(from.listener_count(), 0);
        assert_eq!(to.listener_count(), 1);
        assert_eq!(listener.pos(), 0);
        assert!(listener.has_flag(crate::listener::ListenerFlags::HAS_MOVED));
    }

    #[test]
    fn migrate_all_listeners_empties_source() {
        let from = source("/live.ogg");
        let to = Arc::new(source("/backup.ogg"));
        for _ in 0..3 {
            let listener = Arc::new(Listener::new(
                Arc::new(crate::listener::test_support::MemorySink::default()),
                0,
            ));
            from.add_listener(listener);
        }
        from.begin_listeners_sync(0);
        migrate_all_listeners(&from, &to);
        assert_eq!(from.listener_count(), 0);
        assert_eq!(to.listener_count(), 3);
    }
}
