//! A connected source (encoder/relay) and the audio it is broadcasting.
//!
//! `Source` owns the per-mount [`crate::refbuf::Queue`], the attached
//! `Format` adapter, and the set of listeners currently subscribed to it.
//! Its `flags` track the handoff protocol described in §4.6: a source
//! being replaced enters `LISTENERS_SYNC` while its listeners are handed
//! off one at a time, guarded by a watchdog so a stuck handoff cannot wedge
//! the mountpoint forever.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::format::Format;
use crate::listener::Listener;
use crate::protocol_constants::LISTENERS_SYNC_WATCHDOG_MS;
use crate::refbuf::Queue;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFlags: u8 {
        /// Source is actively being read from and is eligible to serve
        /// listeners. Cleared the instant the ingest connection ends.
        const RUNNING = 0b0000_0001;
        /// A handoff is in progress: listeners are being migrated to a
        /// successor source or a fallback mount, one at a time.
        const LISTENERS_SYNC = 0b0000_0010;
        /// This source won its mountpoint by hijacking a previous
        /// occupant (`fallback_override`), rather than a fresh `reserve`.
        const HIJACKED = 0b0000_0100;
        /// Source has no live encoder attached; it is driven by demand
        /// (e.g. a file-backed relay) rather than a continuous ingest
        /// connection. `setup_listener` wakes the worker on attach when
        /// this is set, since there's no running read loop to find it.
        const ON_DEMAND = 0b0000_1000;
        /// Ingestion has ended and the source is draining: no further
        /// reads happen, listeners are being woken to acknowledge, and
        /// the source is freed once `termination_count` reaches 0.
        const TERMINATING = 0b0001_0000;
        /// Listeners in `PAUSE` should stay paused rather than returning
        /// to `CLIENT` once the condition that put them there clears.
        const PAUSE_LISTENERS = 0b0010_0000;
        /// Ingestion ended specifically because of a silence timeout
        /// (`SOURCE_TIMEOUT`), as opposed to EOF/socket error/admin stop.
        const TIMEOUT = 0b0100_0000;
        /// Source speaks the legacy SHOUTcast (non-HTTP, ICY-only)
        /// handshake rather than Icecast's HTTP-based one.
        const SHOUTCAST_COMPAT = 0b1000_0000;
    }
}

/// Parsed `ice-audio-info` style metadata: `ice-bitrate=128;ice-channels=2;...`.
///
/// Matches `source.c`'s `_parse_audio_info` exactly: a segment survives only
/// if its key starts with `ice-` or is exactly `bitrate` (encoders disagree
/// on whether the bitrate field carries the `ice-` prefix), and its value is
/// URL-unescaped before storage. Anything else — unknown keys, segments with
/// no `=`, empty segments from a stray `;;` — is silently dropped, the same
/// tolerance the original extends to encoders that send extra/garbled
/// fields.
pub fn parse_audio_info(header: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    for segment in header.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.starts_with("ice-") || key == "bitrate" {
            info.insert(key.to_string(), percent_decode(value.trim()));
        }
    }
    info
}

/// Decodes `%XX` escapes in a header/query value. Malformed escapes (a `%`
/// not followed by two hex digits) pass through literally rather than
/// truncating the rest of the string.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Rolling bytes/sec meter over a fixed window, used for both ingest
/// (`in_bitrate`) and delivery (`out_bitrate`) accounting.
pub struct RateMeter {
    window_ms: u64,
    window_start_ms: AtomicU64,
    bytes_in_window: AtomicU64,
    last_rate: AtomicU64,
}

impl RateMeter {
    pub fn new(window_ms: u64, now_ms: u64) -> Self {
        Self {
            window_ms,
            window_start_ms: AtomicU64::new(now_ms),
            bytes_in_window: AtomicU64::new(0),
            last_rate: AtomicU64::new(0),
        }
    }

    /// Records `n` bytes transferred at `now_ms`, rolling the window over
    /// and latching `last_rate` whenever it elapses.
    pub fn record(&self, n: u64, now_ms: u64) {
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) >= self.window_ms {
            let elapsed_secs = (now_ms.saturating_sub(start)).max(1) as f64 / 1000.0;
            let bytes = self.bytes_in_window.swap(0, Ordering::AcqRel);
            self.last_rate
                .store((bytes as f64 / elapsed_secs) as u64, Ordering::Release);
            self.window_start_ms.store(now_ms, Ordering::Release);
        }
        self.bytes_in_window.fetch_add(n, Ordering::AcqRel);
    }

    /// Bytes/sec as of the last completed window.
    pub fn rate(&self) -> u64 {
        self.last_rate.load(Ordering::Acquire)
    }
}

/// A connected source and the audio it is broadcasting on one mountpoint.
pub struct Source {
    pub id: Uuid,
    pub mount_name: String,

    pub format: Mutex<Box<dyn Format>>,
    pub queue: Mutex<Queue>,
    pub listeners: DashMap<Uuid, Arc<Listener>>,

    flags: Mutex<SourceFlags>,
    /// Parsed `ice-audio-info` fields, keyed by the raw header key (e.g.
    /// `"ice-bitrate"`, `"ice-channels"`). Populated by
    /// [`Source::apply_audio_info`] during `source_init`.
    pub audio_info: Mutex<HashMap<String, String>>,

    pub in_bitrate: RateMeter,
    pub out_bitrate: RateMeter,

    last_activity_ms: AtomicU64,
    pub source_timeout_secs: u64,

    /// Adaptive no-data backoff (§4.1): grows ×1.3 (capped 400ms) on a read
    /// that produced nothing, decays ×0.9 (floored 10ms) on one that did.
    /// Stored per-source so the growth/decay actually compounds across
    /// scheduling passes rather than resetting every call.
    skip_duration_ms: AtomicU64,

    /// Epoch-ms of the last "source has been silent" warning log, so the
    /// 3-second warning fires once per silence episode rather than every
    /// poll.
    last_no_data_warning_ms: AtomicU64,

    /// Listeners still owed a handoff acknowledgement before `LISTENERS_SYNC`
    /// can clear (§4.6).
    termination_count: AtomicU32,

    listeners_sync_started_ms: AtomicU64,

    /// Listeners dropped because their held `RefBuf` was trimmed out from
    /// under them (§4.1, §7). Diagnostic counter only.
    slow_listeners: AtomicU32,

    /// Highest `listener_count` ever observed on this source.
    peak_listener_count: AtomicU32,

    /// Index of the worker currently driving this source, for listener
    /// gravitation (§4.7). `usize::MAX` until first assigned.
    current_worker_index: AtomicUsize,

    /// Epoch-ms this source last reconsidered migrating to a less busy
    /// worker (§4.7's `worker_balance_recheck`).
    worker_balance_recheck_ms: AtomicU64,

    /// Epoch-ms housekeeping (stats, listener gravitation) is next due.
    stats_update_deadline_ms: AtomicU64,
    pub stats_interval_secs: u64,

    /// Handle to an on-disk recording of this source's incoming stream, if
    /// dumping is configured. Opening/rotating the file is the hosting
    /// application's job (§6); this crate only writes through it.
    pub dump_file: Mutex<Option<Box<dyn Write + Send>>>,

    /// Path to an intro file to replay to newly attached listeners before
    /// they catch up to the live queue, resolved by the hosting
    /// application as `webroot_dir + "/" + intro_filename`.
    pub intro_file: Mutex<Option<PathBuf>>,

    /// Invoked once `init()` succeeds (args: mount name, username).
    pub on_connect: Mutex<Option<Arc<dyn Fn(&str, &str) + Send + Sync>>>,

    /// Invoked once the source is freed (args: mount name, username).
    pub on_disconnect: Mutex<Option<Arc<dyn Fn(&str, &str) + Send + Sync>>>,

    /// Epoch-ms this source last transitioned to not-running; `0` while
    /// still running or before it has ever run.
    disconnected_at_ms: AtomicU64,

    /// Seconds the mountpoint is held reserved after this source stops,
    /// refusing a new source, before [`MountRegistry::recheck_mounts`] may
    /// drop the stale entry. `0` = no post-disconnect hold.
    wait_time_secs: AtomicU64,

    /// Mount name this source's listeners should be migrated to (§4.6) if
    /// it dies while still carrying listeners, rather than being
    /// disconnected outright. `None` means no fallback is configured.
    fallback_mount: Mutex<Option<String>>,

    /// Ingest throttle ceiling in bytes/sec (§4.8's `limit_rate`); `None`
    /// disables throttling. Checked as `8 * incoming_rate > limit_rate`
    /// against `in_bitrate`, mirroring the original's bits-vs-bytes mix.
    limit_rate: Mutex<Option<u64>>,
}

impl Source {
    pub fn new(
        mount_name: impl Into<String>,
        format: Box<dyn Format>,
        queue_size_limit: u64,
        min_queue_size: u64,
        default_burst_size: u64,
        source_timeout_secs: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mount_name: mount_name.into(),
            format: Mutex::new(format),
            queue: Mutex::new(Queue::new(queue_size_limit, min_queue_size, default_burst_size)),
            listeners: DashMap::new(),
            flags: Mutex::new(SourceFlags::RUNNING),
            audio_info: Mutex::new(HashMap::new()),
            // §4.8 `source_init`: in_bitrate is metered over a 60s window,
            // out_bitrate over 9s — the original's own asymmetric choice,
            // not a typo.
            in_bitrate: RateMeter::new(60_000, now_ms),
            out_bitrate: RateMeter::new(9_000, now_ms),
            last_activity_ms: AtomicU64::new(now_ms),
            source_timeout_secs,
            skip_duration_ms: AtomicU64::new(crate::protocol_constants::SOURCE_POLL_MS),
            last_no_data_warning_ms: AtomicU64::new(0),
            termination_count: AtomicU32::new(0),
            listeners_sync_started_ms: AtomicU64::new(0),
            slow_listeners: AtomicU32::new(0),
            peak_listener_count: AtomicU32::new(0),
            current_worker_index: AtomicUsize::new(usize::MAX),
            worker_balance_recheck_ms: AtomicU64::new(now_ms),
            stats_update_deadline_ms: AtomicU64::new(now_ms),
            stats_interval_secs: crate::protocol_constants::DEFAULT_STATS_INTERVAL_SECS,
            dump_file: Mutex::new(None),
            intro_file: Mutex::new(None),
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            disconnected_at_ms: AtomicU64::new(0),
            wait_time_secs: AtomicU64::new(0),
            fallback_mount: Mutex::new(None),
            limit_rate: Mutex::new(None),
        }
    }

    pub fn limit_rate(&self) -> Option<u64> {
        *self.limit_rate.lock()
    }

    pub fn set_limit_rate(&self, limit: Option<u64>) {
        *self.limit_rate.lock() = limit;
    }

    /// True when ingestion should throttle this pass: `8 * incoming_rate`
    /// (bitrate) exceeds the configured `limit_rate` (also bits/sec).
    /// Preserves the original's literal `8 *` bytes-to-bits conversion.
    pub fn should_throttle_ingest(&self) -> bool {
        match self.limit_rate() {
            Some(limit) => 8 * self.in_bitrate.rate() > limit,
            None => false,
        }
    }

    pub fn fallback_mount(&self) -> Option<String> {
        self.fallback_mount.lock().clone()
    }

    pub fn set_fallback_mount(&self, mount: Option<String>) {
        *self.fallback_mount.lock() = mount;
    }

    pub fn flags(&self) -> SourceFlags {
        *self.flags.lock()
    }

    pub fn is_running(&self) -> bool {
        self.flags.lock().contains(SourceFlags::RUNNING)
    }

    pub fn set_running(&self, running: bool) {
        let mut f = self.flags.lock();
        f.set(SourceFlags::RUNNING, running);
    }

    /// Records that this source just stopped, starting the `wait_time`
    /// clock `recheck_mounts` consults before reclaiming the mountpoint.
    pub fn mark_disconnected(&self, now_ms: u64) {
        self.disconnected_at_ms.store(now_ms, Ordering::Release);
    }

    pub fn set_wait_time_secs(&self, secs: u64) {
        self.wait_time_secs.store(secs, Ordering::Release);
    }

    /// Whether the post-disconnect hold (`wait_time`) has elapsed. `true`
    /// if the source never recorded a disconnect (nothing to wait out).
    pub fn wait_time_elapsed(&self, now_ms: u64) -> bool {
        let disconnected = self.disconnected_at_ms.load(Ordering::Acquire);
        if disconnected == 0 {
            return true;
        }
        let wait_ms = self.wait_time_secs.load(Ordering::Acquire) * 1_000;
        now_ms.saturating_sub(disconnected) >= wait_ms
    }

    pub fn is_on_demand(&self) -> bool {
        self.flags.lock().contains(SourceFlags::ON_DEMAND)
    }

    pub fn set_on_demand(&self, on_demand: bool) {
        self.flags.lock().set(SourceFlags::ON_DEMAND, on_demand);
    }

    pub fn pause_listeners(&self) -> bool {
        self.flags.lock().contains(SourceFlags::PAUSE_LISTENERS)
    }

    pub fn set_pause_listeners(&self, pause: bool) {
        self.flags.lock().set(SourceFlags::PAUSE_LISTENERS, pause);
    }

    pub fn timed_out_flag(&self) -> bool {
        self.flags.lock().contains(SourceFlags::TIMEOUT)
    }

    pub fn is_shoutcast_compat(&self) -> bool {
        self.flags.lock().contains(SourceFlags::SHOUTCAST_COMPAT)
    }

    pub fn set_shoutcast_compat(&self, compat: bool) {
        self.flags.lock().set(SourceFlags::SHOUTCAST_COMPAT, compat);
    }

    /// A source is available (§4.2) when `RUNNING` is set and
    /// `LISTENERS_SYNC` is clear.
    pub fn is_available(&self) -> bool {
        let f = self.flags.lock();
        f.contains(SourceFlags::RUNNING) && !f.contains(SourceFlags::LISTENERS_SYNC)
    }

    pub fn listeners_sync_active(&self) -> bool {
        self.flags.lock().contains(SourceFlags::LISTENERS_SYNC)
    }

    pub fn touch_activity(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Release);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    /// Grows `skip_duration` by [`crate::protocol_constants::SOURCE_SKIP_GROWTH`],
    /// capped at [`crate::protocol_constants::SOURCE_SKIP_MAX_MS`], and
    /// returns the new value. Called once per read that produced no data.
    pub fn grow_skip_duration(&self) -> u64 {
        use crate::protocol_constants::{SOURCE_SKIP_GROWTH, SOURCE_SKIP_MAX_MS};
        let current = self.skip_duration_ms.load(Ordering::Acquire);
        let next = ((current as f64) * SOURCE_SKIP_GROWTH).min(SOURCE_SKIP_MAX_MS as f64) as u64;
        self.skip_duration_ms.store(next, Ordering::Release);
        next
    }

    /// Decays `skip_duration` by [`crate::protocol_constants::SOURCE_SKIP_DECAY`],
    /// floored at [`crate::protocol_constants::SOURCE_SKIP_MIN_MS`], and
    /// returns the new value. Called once per successful read.
    pub fn decay_skip_duration(&self) -> u64 {
        use crate::protocol_constants::{SOURCE_SKIP_DECAY, SOURCE_SKIP_MIN_MS};
        let current = self.skip_duration_ms.load(Ordering::Acquire);
        let next = ((current as f64) * SOURCE_SKIP_DECAY).max(SOURCE_SKIP_MIN_MS as f64) as u64;
        self.skip_duration_ms.store(next, Ordering::Release);
        next
    }

    /// True once [`crate::protocol_constants::SOURCE_NO_DATA_WARN_MS`] of
    /// silence has elapsed and a warning hasn't already been logged for
    /// this silence episode; marks the warning as issued as a side effect.
    pub fn should_warn_no_data(&self, now_ms: u64) -> bool {
        let last_warned = self.last_no_data_warning_ms.load(Ordering::Acquire);
        let silent_for = now_ms.saturating_sub(self.last_activity_ms());
        if silent_for < crate::protocol_constants::SOURCE_NO_DATA_WARN_MS || last_warned >= self.last_activity_ms() {
            return false;
        }
        self.last_no_data_warning_ms.store(now_ms, Ordering::Release);
        true
    }

    /// True once `source_timeout_secs` has elapsed since the last ingest
    /// read, per §4.2's silence-timeout edge case.
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        now_ms.saturating_sub(last) >= self.source_timeout_secs * 1_000
    }

    /// Parses a raw `ice-audio-info` header value via [`parse_audio_info`]
    /// and merges the accepted fields into `audio_info`. Part of
    /// `source_init` (§4.8): called once, under the source's own lock, when
    /// the ingest handshake supplies the header.
    pub fn apply_audio_info(&self, raw: &str) {
        self.audio_info.lock().extend(parse_audio_info(raw));
    }

    /// Writes `data` through the configured dump file, if any, ignoring
    /// write errors (a stalled disk must never back-pressure the live
    /// stream).
    /// Fires the `on_connect` hook, if configured, with this source's
    /// mount name and `username`.
    pub fn fire_on_connect(&self, username: &str) {
        if let Some(hook) = self.on_connect.lock().as_ref() {
            hook(&self.mount_name, username);
        }
    }

    /// Fires the `on_disconnect` hook, if configured, with this source's
    /// mount name and `username`.
    pub fn fire_on_disconnect(&self, username: &str) {
        if let Some(hook) = self.on_disconnect.lock().as_ref() {
            hook(&self.mount_name, username);
        }
    }

    pub fn dump(&self, data: &[u8]) {
        if let Some(file) = self.dump_file.lock().as_mut() {
            let _ = file.write_all(data);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn add_listener(&self, listener: Arc<Listener>) {
        self.listeners.insert(listener.id, listener);
        self.peak_listener_count
            .fetch_max(self.listeners.len() as u32, Ordering::AcqRel);
    }

    /// Like [`Source::add_listener`], but also records `source` as the
    /// listener's current attachment point, so a later scheduling pass
    /// resolves the right source even after a migration. Prefer this
    /// whenever an `Arc<Source>` is available; `add_listener` alone is
    /// only safe for call sites (mostly tests) that never reschedule the
    /// listener through a worker.
    pub fn attach_listener(source: &Arc<Source>, listener: Arc<Listener>) {
        listener.set_current_source(source);
        source.add_listener(listener);
    }

    pub fn remove_listener(&self, id: &Uuid) -> Option<Arc<Listener>> {
        self.listeners.remove(id).map(|(_, v)| v)
    }

    /// Increments the slow-listener drop counter (§7, §8 scenario 2).
    pub fn record_slow_listener(&self) {
        self.slow_listeners.fetch_add(1, Ordering::AcqRel);
    }

    pub fn slow_listener_count(&self) -> u32 {
        self.slow_listeners.load(Ordering::Acquire)
    }

    pub fn peak_listener_count(&self) -> u32 {
        self.peak_listener_count.load(Ordering::Acquire)
    }

    pub fn current_worker_index(&self) -> usize {
        self.current_worker_index.load(Ordering::Acquire)
    }

    pub fn set_current_worker_index(&self, index: usize) {
        self.current_worker_index.store(index, Ordering::Release);
    }

    /// True once `interval_ms` has elapsed since the last worker-migration
    /// recheck; marks the recheck as taken as a side effect.
    pub fn due_for_worker_recheck(&self, now_ms: u64, interval_ms: u64) -> bool {
        let last = self.worker_balance_recheck_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < interval_ms {
            return false;
        }
        self.worker_balance_recheck_ms.store(now_ms, Ordering::Release);
        true
    }

    /// True once `stats_interval_secs` has elapsed since the last
    /// housekeeping pass (stats refresh, listener worker gravitation);
    /// marks it as taken as a side effect.
    pub fn due_for_stats_update(&self, now_ms: u64) -> bool {
        let deadline = self.stats_update_deadline_ms.load(Ordering::Acquire);
        if now_ms < deadline {
            return false;
        }
        self.stats_update_deadline_ms
            .store(now_ms + self.stats_interval_secs * 1_000, Ordering::Release);
        true
    }

    /// Begins the handoff protocol: flags `LISTENERS_SYNC` and
    /// `TERMINATING` (§4.2 `RUNNING` → `TERMINATING | LISTENERS_SYNC`),
    /// remembers the start time for the watchdog, and seeds the
    /// termination count with the number of listeners that must
    /// acknowledge migration.
    pub fn begin_listeners_sync(&self, now_ms: u64) {
        let mut f = self.flags.lock();
        f.insert(SourceFlags::LISTENERS_SYNC | SourceFlags::TERMINATING);
        self.listeners_sync_started_ms.store(now_ms, Ordering::Release);
        self.termination_count
            .store(self.listeners.len() as u32, Ordering::Release);
    }

    /// Marks ingestion as having ended specifically due to silence
    /// (`SOURCE_TIMEOUT`), then begins the same handoff protocol as any
    /// other ingestion failure.
    pub fn begin_timeout_shutdown(&self, now_ms: u64) {
        self.flags.lock().insert(SourceFlags::TIMEOUT);
        self.begin_listeners_sync(now_ms);
    }

    /// Called once per listener as it is migrated off this source.
    /// Returns `true` when the last listener has been accounted for.
    pub fn acknowledge_listener_migrated(&self) -> bool {
        let prev = self.termination_count.fetch_sub(1, Ordering::AcqRel);
        prev <= 1
    }

    pub fn termination_count(&self) -> u32 {
        self.termination_count.load(Ordering::Acquire)
    }

    /// Watchdog from §4.6/§9: if `LISTENERS_SYNC` has been set for longer
    /// than [`LISTENERS_SYNC_WATCHDOG_MS`], clear `RUNNING`, `LISTENERS_SYNC`,
    /// and `TERMINATING` together unconditionally — even if listeners remain
    /// attached. `TERMINATING` is cleared alongside the other two because
    /// `begin_listeners_sync` is what set it in the first place; a stuck
    /// handoff that never completes must not leave the source latched in
    /// `TERMINATING` forever. Listeners still attached to a source that is
    /// no longer running are cleaned up on their own next scheduling pass
    /// rather than here.
    pub fn check_listeners_sync_watchdog(&self, now_ms: u64) -> bool {
        let mut f = self.flags.lock();
        if !f.contains(SourceFlags::LISTENERS_SYNC) {
            return false;
        }
        let started = self.listeners_sync_started_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(started) < LISTENERS_SYNC_WATCHDOG_MS {
            return false;
        }
        f.remove(SourceFlags::RUNNING | SourceFlags::LISTENERS_SYNC | SourceFlags::TERMINATING);
        true
    }
}

/// Per-mount state needed to decide whether a connecting source may hijack
/// the mountpoint's current occupant (§4.8).
#[derive(Debug, Clone, Default)]
pub struct HijackPolicy {
    pub allow_override: bool,
}

/// Replaces `existing`'s role on a mountpoint with `incoming`, per the
/// hijack path of `source_init`: only permitted when the formats match and
/// `fallback_override` is configured, and it hands off listeners through
/// the normal `LISTENERS_SYNC` protocol rather than dropping them.
pub fn source_swap_client(
    existing: &Source,
    incoming: &Source,
    policy: &HijackPolicy,
    now_ms: u64,
) -> Result<(), crate::error::BroadcastError> {
    if !policy.allow_override {
        return Err(crate::error::BroadcastError::MountInUse(
            existing.mount_name.clone(),
        ));
    }
    if existing.format.lock().format_type() != incoming.format.lock().format_type() {
        return Err(crate::error::BroadcastError::FormatMismatch(
            existing.mount_name.clone(),
        ));
    }
    existing.begin_listeners_sync(now_ms);
    incoming.flags.lock().insert(SourceFlags::HIJACKED);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatType;

    struct StubFormat(FormatType);
    impl Format for StubFormat {
        fn format_type(&self) -> FormatType {
            self.0
        }
        fn get_buffer(
            &mut self,
            _source: &Source,
        ) -> crate::error::BroadcastResult<Option<crate::refbuf::RefBuf>> {
            Ok(None)
        }
        fn write_buf_to_client(
            &self,
            _listener: &Listener,
        ) -> crate::error::BroadcastResult<usize> {
            Ok(0)
        }
        fn create_client_data(
            &self,
            _listener: &Listener,
        ) -> crate::error::BroadcastResult<crate::refbuf::RefBuf> {
            Ok(crate::refbuf::RefBuf::new(
                bytes::Bytes::new(),
                crate::refbuf::RefBufFlags::empty(),
            ))
        }
        fn apply_settings(&mut self, _mount: &crate::config::MountProxy) {}
    }

    fn source(now_ms: u64) -> Source {
        Source::new(
            "/live.ogg",
            Box::new(StubFormat(FormatType("ogg"))),
            1_000_000,
            65_536,
            65_536,
            10,
            now_ms,
        )
    }

    #[test]
    fn parse_audio_info_keeps_only_ice_prefixed_or_bare_bitrate_keys() {
        let info = parse_audio_info(
            "ice-bitrate=128;ice-channels=2;ice-samplerate=44100;quality=0.8;bitrate=96",
        );
        assert_eq!(info.get("ice-bitrate").map(String::as_str), Some("128"));
        assert_eq!(info.get("ice-channels").map(String::as_str), Some("2"));
        assert_eq!(info.get("ice-samplerate").map(String::as_str), Some("44100"));
        assert_eq!(info.get("bitrate").map(String::as_str), Some("96"));
        // "quality" has neither the ice- prefix nor is it "bitrate" — dropped.
        assert!(!info.contains_key("quality"));
    }

    #[test]
    fn parse_audio_info_ignores_garbage_segments() {
        let info = parse_audio_info("bitrate=128;garbage;;ice-channels=2");
        assert_eq!(info.get("bitrate").map(String::as_str), Some("128"));
        assert_eq!(info.get("ice-channels").map(String::as_str), Some("2"));
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn parse_audio_info_percent_decodes_values() {
        let info = parse_audio_info("ice-name=My%20Station%21");
        assert_eq!(info.get("ice-name").map(String::as_str), Some("My Station!"));
    }

    #[test]
    fn new_source_starts_running_without_listeners_sync() {
        let s = source(0);
        assert!(s.is_running());
        assert!(!s.flags().contains(SourceFlags::LISTENERS_SYNC));
    }

    #[test]
    fn source_times_out_after_silence() {
        let s = source(0);
        assert!(!s.is_timed_out(5_000));
        assert!(s.is_timed_out(10_000));
    }

    #[test]
    fn listeners_sync_watchdog_clears_both_flags_after_deadline() {
        let s = source(0);
        s.begin_listeners_sync(0);
        assert!(!s.check_listeners_sync_watchdog(1_000));
        assert!(s.flags().contains(SourceFlags::LISTENERS_SYNC));
        assert!(s.check_listeners_sync_watchdog(1_500));
        assert!(!s.flags().contains(SourceFlags::LISTENERS_SYNC));
        assert!(!s.flags().contains(SourceFlags::RUNNING));
    }

    #[test]
    fn listeners_sync_watchdog_also_clears_terminating() {
        let s = source(0);
        s.begin_listeners_sync(0);
        assert!(s.flags().contains(SourceFlags::TERMINATING));
        assert!(s.check_listeners_sync_watchdog(1_500));
        assert!(!s.flags().contains(SourceFlags::TERMINATING));
    }

    #[test]
    fn hijack_requires_allow_override_and_matching_format() {
        let existing = source(0);
        let incoming = source(0);
        let denied = source_swap_client(&existing, &incoming, &HijackPolicy::default(), 0);
        assert!(denied.is_err());

        let policy = HijackPolicy { allow_override: true };
        let allowed = source_swap_client(&existing, &incoming, &policy, 0);
        assert!(allowed.is_ok());
        assert!(existing.flags().contains(SourceFlags::LISTENERS_SYNC));
    }

    /// §8 scenario 5: a successful hijack tags the incoming broadcaster
    /// `HIJACKED` and starts the existing source's handoff protocol without
    /// touching its queue or listener set directly — those are only moved
    /// by `handoff::migrate_all_listeners` once the registry points callers
    /// at the new occupant, never dropped as part of the swap itself.
    #[test]
    fn hijack_preserves_queue_and_listeners_until_handoff_moves_them() {
        let existing = Arc::new(source(0));
        let incoming = source(0);
        for _ in 0..3 {
            let l = Arc::new(Listener::new(
                Arc::new(crate::listener::test_support::MemorySink::default()),
                0,
            ));
            Source::attach_listener(&existing, l);
        }
        existing
            .queue
            .lock()
            .append(crate::refbuf::RefBuf::new(
                bytes::Bytes::from_static(b"abc"),
                crate::refbuf::RefBufFlags::SYNC_POINT,
            ));

        let policy = HijackPolicy { allow_override: true };
        source_swap_client(&existing, &incoming, &policy, 0).unwrap();

        assert!(incoming.flags().contains(SourceFlags::HIJACKED));
        assert_eq!(existing.listener_count(), 3);
        assert!(existing.queue.lock().tail().is_some());
        for entry in existing.listeners.iter() {
            assert!(!entry.value().connection.is_error());
        }
    }

    #[test]
    fn rate_meter_latches_rate_after_window_elapses() {
        let m = RateMeter::new(1_000, 0);
        m.record(1_000, 0);
        assert_eq!(m.rate(), 0);
        m.record(0, 1_000);
        assert_eq!(m.rate(), 1_000);
    }

    #[test]
    fn skip_duration_compounds_across_calls_and_respects_bounds() {
        let s = source(0);
        let a = s.grow_skip_duration();
        let b = s.grow_skip_duration();
        assert!(b > a, "growth should compound, not reset each call");

        for _ in 0..50 {
            s.grow_skip_duration();
        }
        assert!(s.grow_skip_duration() <= crate::protocol_constants::SOURCE_SKIP_MAX_MS);

        for _ in 0..50 {
            s.decay_skip_duration();
        }
        assert!(s.decay_skip_duration() >= crate::protocol_constants::SOURCE_SKIP_MIN_MS);
    }

    #[test]
    fn peak_listener_count_tracks_high_water_mark() {
        let s = source(0);
        for _ in 0..3 {
            let l = Arc::new(Listener::new(
                Arc::new(crate::listener::test_support::MemorySink::default()),
                0,
            ));
            s.add_listener(l);
        }
        assert_eq!(s.peak_listener_count(), 3);
        let id = *s.listeners.iter().next().unwrap().key();
        s.remove_listener(&id);
        assert_eq!(s.listener_count(), 2);
        assert_eq!(s.peak_listener_count(), 3);
    }

    #[test]
    fn dump_writes_through_configured_file_and_tolerates_absence() {
        let s = source(0);
        s.dump(b"no dump file configured, should be a no-op");

        use parking_lot::Mutex as PMutex;
        use std::sync::Arc as StdArc;

        #[derive(Default)]
        struct RecordingSink(StdArc<PMutex<Vec<u8>>>);
        impl Write for RecordingSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let recorded = StdArc::new(PMutex::new(Vec::new()));
        *s.dump_file.lock() = Some(Box::new(RecordingSink(recorded.clone())));
        s.dump(b"hello");
        assert_eq!(&*recorded.lock(), b"hello");
    }

    #[test]
    fn on_connect_and_on_disconnect_hooks_fire_with_mount_and_username() {
        let s = source(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_connect = seen.clone();
        *s.on_connect.lock() = Some(Arc::new(move |mount, user| {
            seen_connect.lock().push(format!("connect:{mount}:{user}"));
        }));
        let seen_disconnect = seen.clone();
        *s.on_disconnect.lock() = Some(Arc::new(move |mount, user| {
            seen_disconnect.lock().push(format!("disconnect:{mount}:{user}"));
        }));

        s.fire_on_connect("alice");
        s.fire_on_disconnect("alice");
        assert_eq!(
            *seen.lock(),
            vec!["connect:/live.ogg:alice", "disconnect:/live.ogg:alice"]
        );
    }

    #[test]
    fn attach_listener_records_backref_resolvable_later() {
        let s = Arc::new(source(0));
        let l = Arc::new(Listener::new(
            Arc::new(crate::listener::test_support::MemorySink::default()),
            0,
        ));
        Source::attach_listener(&s, l.clone());
        let resolved = l.current_source().expect("backref should resolve");
        assert_eq!(resolved.id, s.id);
        assert_eq!(s.listener_count(), 1);
    }

    #[test]
    fn fallback_mount_defaults_to_none_and_can_be_set() {
        let s = source(0);
        assert_eq!(s.fallback_mount(), None);
        s.set_fallback_mount(Some("/backup.ogg".to_string()));
        assert_eq!(s.fallback_mount().as_deref(), Some("/backup.ogg"));
    }

    #[test]
    fn ingest_throttle_trips_once_bitrate_exceeds_limit_rate() {
        let s = source(0);
        assert!(!s.should_throttle_ingest(), "no limit configured yet");

        s.set_limit_rate(Some(1_000));
        assert!(!s.should_throttle_ingest(), "rate meter hasn't latched a reading yet");

        s.in_bitrate.record(2_000, 0);
        s.in_bitrate.record(0, 60_000); // rolls the 60s window over, latching ~33 bytes/sec
        assert!(!s.should_throttle_ingest(), "8 * 33 = 264 <= 1000");

        s.in_bitrate.record(12_000, 60_000);
        s.in_bitrate.record(0, 120_000); // latches 200 bytes/sec
        assert!(s.should_throttle_ingest(), "8 * 200 = 1600 > 1000");
    }

    #[test]
    fn worker_recheck_gates_on_interval() {
        let s = source(0);
        assert!(!s.due_for_worker_recheck(500, 1_000));
        assert!(s.due_for_worker_recheck(1_000, 1_000));
        assert!(!s.due_for_worker_recheck(1_500, 1_000));
        assert!(s.due_for_worker_recheck(2_000, 1_000));
    }
}
