//! Per-listener delivery: the `check_buffer` state machine of §4.5.
//!
//! A listener's `ops` tag selects which stage runs on each scheduling pass.
//! Every stage is non-blocking: it reads and writes as much as it can
//! without waiting, then returns a reschedule delay for the worker's
//! scheduler (`worker.rs`) to honor.

use crate::listener::{CheckBufferState, Listener, ListenerOps};
use crate::protocol_constants::{
    BURST_LOCATE_RETRY_MS, CLIENT_SEND_LOOP_MAX, QUEUE_CATCHUP_IDLE_MS,
};
use crate::refbuf::RefBuf;
use crate::source::Source;

/// Outcome of one `check_buffer` pass: either the listener made progress
/// and should be rescheduled, or it hit a terminal error and must be torn
/// down.
#[derive(Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Reschedule in this many milliseconds from `now`.
    Reschedule(u64),
    /// The connection failed (write error, or source gone with nowhere to
    /// fall back); the caller should remove this listener.
    Disconnect,
}

/// Locates the queue position a newly attached (or newly burst-located)
/// listener should start reading from.
///
/// Walks forward from the burst point (`min_queue_point`) while the
/// remaining retained window (`lag`) exceeds the caller's desired burst
/// size, shrinking `lag` by each skipped buffer's length. If the desired
/// burst is at or beyond the whole retained window, no walk happens at
/// all and `lag` comes back as the full `min_queue_offset` — the listener
/// simply starts at the earliest point still available, which may be more
/// audio than it asked for. This is deliberately not "corrected" to clamp
/// at the requested size.
///
/// From the chosen buffer, advances forward to the first `SYNC_POINT` so
/// the listener's first delivered frame is always a safe join point;
/// returns `None` if no sync point exists anywhere in the remaining chain
/// (caller reschedules and retries once more data has arrived).
pub fn locate_start_on_queue(source: &Source, burst_bytes: u64) -> Option<(RefBuf, u64)> {
    let queue = source.queue.lock();
    let mut node = queue.min_queue_point()?.clone();
    let mut lag = queue.min_queue_offset();
    while lag > burst_bytes {
        let Some(next) = node.next() else {
            break;
        };
        lag = lag.saturating_sub(node.len());
        node = next;
    }
    loop {
        if node.flags().contains(crate::refbuf::RefBufFlags::SYNC_POINT) {
            return Some((node, lag));
        }
        let next = node.next()?;
        lag = lag.saturating_sub(node.len());
        node = next;
    }
}

/// Runs one scheduling pass of the `check_buffer` state machine for
/// `listener` against `source`.
pub fn process_listener(listener: &Listener, source: &Source, now_ms: u64) -> PassOutcome {
    if listener.connection.is_error() {
        return PassOutcome::Disconnect;
    }

    let mut ops = *listener.ops.lock();
    let outcome = match ops {
        ListenerOps::Client(CheckBufferState::HttpSourceListener) => {
            http_source_listener(listener, source, &mut ops)
        }
        ListenerOps::Client(CheckBufferState::HttpSourceIntro) => {
            http_source_intro(listener, &mut ops)
        }
        ListenerOps::Client(CheckBufferState::HttpSourceIntroFile) => {
            http_source_introfile(listener, &mut ops)
        }
        ListenerOps::Client(CheckBufferState::SourceQueueAdvance { burst_located }) => {
            source_queue_advance(listener, source, now_ms, burst_located, &mut ops)
        }
        ListenerOps::Pause { entered_at_ms } => pause(source, now_ms, entered_at_ms, &mut ops),
        ListenerOps::Wait => wait(source, &mut ops),
    };
    *listener.ops.lock() = ops;
    outcome
}

fn http_source_listener(listener: &Listener, source: &Source, ops: &mut ListenerOps) -> PassOutcome {
    let format = source.format.lock();
    match format.create_client_data(listener) {
        Ok(buf) => {
            listener.set_refbuf(Some(buf));
            listener.set_pos(0);
            *ops = ListenerOps::Client(CheckBufferState::HttpSourceIntro);
            PassOutcome::Reschedule(0)
        }
        Err(_) => PassOutcome::Disconnect,
    }
}

fn http_source_intro(listener: &Listener, ops: &mut ListenerOps) -> PassOutcome {
    // Intro-file playback is file-I/O driven by the hosting application;
    // this crate only tracks whether one is active via HAS_INTRO_CONTENT.
    if listener.has_flag(crate::listener::ListenerFlags::HAS_INTRO_CONTENT) {
        *ops = ListenerOps::Client(CheckBufferState::HttpSourceIntroFile);
    } else {
        *ops = ListenerOps::Client(CheckBufferState::SourceQueueAdvance {
            burst_located: false,
        });
    }
    PassOutcome::Reschedule(0)
}

fn http_source_introfile(listener: &Listener, ops: &mut ListenerOps) -> PassOutcome {
    // No intro content currently wired in; fall through to the live queue.
    listener.clear_flag(crate::listener::ListenerFlags::HAS_INTRO_CONTENT);
    listener.set_intro_offset(None);
    *ops = ListenerOps::Client(CheckBufferState::SourceQueueAdvance {
        burst_located: false,
    });
    PassOutcome::Reschedule(0)
}

fn source_queue_advance(
    listener: &Listener,
    source: &Source,
    now_ms: u64,
    burst_located: bool,
    ops: &mut ListenerOps,
) -> PassOutcome {
    if !burst_located {
        let burst_bytes = listener
            .requested_burst_bytes
            .unwrap_or_else(|| source.queue.lock().default_burst_size());
        let Some((node, lag)) = locate_start_on_queue(source, burst_bytes) else {
            // Queue is empty; nothing to serve yet.
            return PassOutcome::Reschedule(BURST_LOCATE_RETRY_MS);
        };
        listener.set_refbuf(Some(node));
        listener.set_pos(0);
        listener.set_queue_pos(lag);
        *ops = ListenerOps::Client(CheckBufferState::SourceQueueAdvance {
            burst_located: true,
        });
    }

    let format = source.format.lock();
    let mut iterations = 0u32;
    let mut total_written = 0u64;
    loop {
        if iterations >= CLIENT_SEND_LOOP_MAX || total_written >= listener.send_trigger_bytes {
            return PassOutcome::Reschedule(0);
        }
        iterations += 1;

        let Some(buf) = listener.refbuf() else {
            return PassOutcome::Reschedule(BURST_LOCATE_RETRY_MS);
        };

        if buf.flags().contains(crate::refbuf::RefBufFlags::MARKED_FOR_RELEASE) {
            // The trimmer unlinked this block while we were still pointed
            // at it: we fell behind the queue's retention window. Dropped
            // as a slow listener rather than given a chance to catch up.
            source.record_slow_listener();
            listener.connection.set_error();
            return PassOutcome::Disconnect;
        }

        if listener.pos() >= buf.len() {
            match buf.next() {
                Some(next) => {
                    listener.set_refbuf(Some(next));
                    listener.set_pos(0);
                    continue;
                }
                None => {
                    // Caught up to the live tail; wait for the source to
                    // append more before the next pass.
                    return PassOutcome::Reschedule(QUEUE_CATCHUP_IDLE_MS);
                }
            }
        }

        match format.write_buf_to_client(listener) {
            Ok(0) => return PassOutcome::Reschedule(QUEUE_CATCHUP_IDLE_MS),
            Ok(sent) => {
                listener.advance_pos(sent as u64);
                listener.advance_queue_pos(sent as u64);
                total_written += sent as u64;
                listener.connection.sent_bytes.fetch_add(
                    sent as u64,
                    std::sync::atomic::Ordering::AcqRel,
                );
            }
            Err(_) => {
                listener.connection.set_error();
                return PassOutcome::Disconnect;
            }
        }

        let _ = now_ms;
    }
}

/// Holds a listener while its source is mid-handoff and expected to restart.
/// Exits back to the CLIENT header stage once the source is running again
/// or once the source clears `PAUSE_LISTENERS` on its own (e.g. the
/// administrator gave up waiting); disconnects on timeout.
fn pause(source: &Source, now_ms: u64, entered_at_ms: u64, ops: &mut ListenerOps) -> PassOutcome {
    if source.is_running() || !source.pause_listeners() {
        *ops = ListenerOps::Client(CheckBufferState::HttpSourceListener);
        return PassOutcome::Reschedule(0);
    }
    if now_ms.saturating_sub(entered_at_ms)
        >= crate::protocol_constants::PAUSE_WAIT_FOR_RESTART_MS
    {
        PassOutcome::Disconnect
    } else {
        PassOutcome::Reschedule(crate::protocol_constants::PAUSE_WAIT_FOR_RESTART_MS / 10)
    }
}

/// Holds a listener that already acknowledged termination (decremented
/// `termination_count`) while other listeners on the same source catch up.
/// Returns to the CLIENT header stage once the source's `LISTENERS_SYNC`
/// clears, whichever way it resolves (fallback handoff or plain teardown).
fn wait(source: &Source, ops: &mut ListenerOps) -> PassOutcome {
    if source.listeners_sync_active() {
        PassOutcome::Reschedule(QUEUE_CATCHUP_IDLE_MS)
    } else {
        *ops = ListenerOps::Client(CheckBufferState::HttpSourceListener);
        PassOutcome::Reschedule(0)
    }
}
