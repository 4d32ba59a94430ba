//! Named constants for the streaming core.
//!
//! Grouped by concern the way a production mountpoint server groups them:
//! timing constants that drive the cooperative scheduler, fallback/admission
//! defaults, and the ICY metadata sideband constant. These are protocol- and
//! scheduling-level constants, not user tunables — per-mount overrides live
//! in [`crate::config::MountProxy`].

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────────────────────────────────────

/// How often a source client is rescheduled while data is flowing.
pub const SOURCE_POLL_MS: u64 = 15;

/// Initial backoff applied to a source client when a read produced no data.
pub const SOURCE_SKIP_MIN_MS: u64 = 10;

/// Ceiling for the adaptive no-data backoff.
pub const SOURCE_SKIP_MAX_MS: u64 = 400;

/// Growth factor applied to `skip_duration` on a read that produced no data.
pub const SOURCE_SKIP_GROWTH: f64 = 1.3;

/// Shrink factor applied to `skip_duration` on a read that produced data.
pub const SOURCE_SKIP_DECAY: f64 = 0.9;

/// Emit a "no data" warning once a source has been silent this long.
pub const SOURCE_NO_DATA_WARN_MS: u64 = 3_000;

/// Maximum time `LISTENERS_SYNC` may hold before the watchdog forces teardown.
pub const LISTENERS_SYNC_WATCHDOG_MS: u64 = 1_500;

/// Maximum time a listener waits in `PAUSE` for its source to restart.
pub const PAUSE_WAIT_FOR_RESTART_MS: u64 = 15_000;

/// Reschedule delay for a listener stalled on an empty intro file.
pub const INTRO_FILE_EMPTY_RETRY_MS: u64 = 100;

/// Reschedule delay for a listener that could not locate a burst start point.
pub const BURST_LOCATE_RETRY_MS: u64 = 150;

/// Extra delay added after the source's own schedule when a listener runs
/// dry at the tail of the queue.
pub const QUEUE_CATCHUP_IDLE_MS: u64 = 5;

/// Upper bound on inner-loop iterations per `CLIENT` scheduling pass.
pub const CLIENT_SEND_LOOP_MAX: u32 = 12;

/// Upper bound on bytes written per `CLIENT` scheduling pass
/// (`listener_send_trigger`), independent of the loop-count bound above —
/// whichever limit is hit first ends the pass.
pub const DEFAULT_LISTENER_SEND_TRIGGER_BYTES: u64 = 65_536;

/// Floor (seconds) for how often a source reconsiders which worker it runs
/// on; the actual interval is `max(source_count, SOURCE_REBALANCE_MIN_SECS)`.
pub const SOURCE_REBALANCE_MIN_SECS: u64 = 6;

/// Listener-gravitation threshold floor: a listener migrates toward its
/// source's worker when the worker load difference is below
/// `max(listener_count + 10, LISTENER_REBALANCE_FLOOR)`.
pub const LISTENER_REBALANCE_FLOOR: u64 = 1_000;

/// If `8 * incoming_rate > limit_rate`, the source client throttles by
/// sleeping this long before its next read.
pub const LIMIT_RATE_THROTTLE_MS: u64 = 110;

// ─────────────────────────────────────────────────────────────────────────────
// Fallback / admission
// ─────────────────────────────────────────────────────────────────────────────

/// Bound on fallback-chain traversal depth; any cycle is treated as "not found".
pub const MAX_FALLBACK_DEPTH: u32 = 10;

/// Default burst size (bytes) handed to a newly attached listener absent any
/// per-request override.
pub const DEFAULT_BURST_SIZE: u64 = 65_536;

/// Default queue retention ceiling (bytes) before trim-from-head kicks in.
pub const DEFAULT_QUEUE_SIZE_LIMIT: u64 = 1 << 20;

/// Default minimum burst retention window (bytes).
pub const DEFAULT_MIN_QUEUE_SIZE: u64 = DEFAULT_BURST_SIZE;

/// Default per-source stats/housekeeping interval (seconds).
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// ICY Protocol (Shoutcast/Icecast metadata)
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes of audio between ICY metadata blocks, per the SHOUTcast/ICY convention.
pub const ICY_METAINT: usize = 8_192;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name surfaced in protocol-facing strings (ICY headers, logs).
pub const APP_NAME: &str = "broadcast-core";
