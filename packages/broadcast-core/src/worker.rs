//! Cooperative scheduling: one OS thread running many sources and
//! listeners as non-blocking state machines (§4.7).
//!
//! Every source and listener carries its own `schedule_ms` deadline. A
//! worker's run loop is: pop whatever is due, call its non-blocking
//! `process`, re-insert it at the deadline `process` returned, sleep until
//! the next deadline (or until woken early by a newly attached item).
//! This is the same shape as a timer wheel, deliberately implemented with
//! `std::thread` + `Condvar` rather than an async runtime: the spec models
//! workers as plain OS threads each looping over non-blocking `process`
//! calls, not as executor tasks.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::listener::Listener;
use crate::mount_registry::MountRegistry;
use crate::protocol_constants::{LISTENER_REBALANCE_FLOOR, SOURCE_REBALANCE_MIN_SECS};
use crate::send_pipeline::{self, PassOutcome};
use crate::source::Source;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One item a worker is responsible for scheduling.
///
/// A listener carries no source of its own here — it resolves the source
/// to drive against via `Listener::current_source` on every pass, so a
/// migration (§4.6 handoff) that points the listener elsewhere takes
/// effect on its very next scheduling pass rather than requiring the
/// `WorkItem` itself to be rewritten.
enum WorkItem {
    Source(Arc<Source>),
    Listener(Arc<Listener>),
}

struct Due {
    at_ms: u64,
    id: Uuid,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.id == other.id
    }
}
impl Eq for Due {}
impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Due {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at_ms.cmp(&other.at_ms).then(self.id.cmp(&other.id))
    }
}

/// A single cooperative scheduling thread.
pub struct Worker {
    pub index: usize,
    items: Mutex<std::collections::HashMap<Uuid, WorkItem>>,
    heap: Mutex<BinaryHeap<Reverse<Due>>>,
    wake: Condvar,
    shutdown: AtomicBool,
    load: AtomicU64,

    /// The full worker pool this worker belongs to, installed once by
    /// `bootstrap_core` after every worker thread exists. Used by the
    /// migration heuristics of §4.7; absent (e.g. in isolated unit tests)
    /// simply disables rebalancing.
    siblings: OnceLock<Vec<Arc<Worker>>>,

    /// The mount registry, installed alongside `siblings`, used only to
    /// size the `max(source_count, 6)` rebalance-recheck interval.
    registry: OnceLock<Arc<MountRegistry>>,
}

impl Worker {
    pub fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            items: Mutex::new(std::collections::HashMap::new()),
            heap: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            load: AtomicU64::new(0),
            siblings: OnceLock::new(),
            registry: OnceLock::new(),
        })
    }

    /// Wires this worker into the pool it belongs to, enabling the
    /// cross-worker migration heuristics of §4.7. Idempotent-once: later
    /// calls are ignored, matching `OnceLock` semantics.
    pub fn install_pool(&self, siblings: Vec<Arc<Worker>>, registry: Arc<MountRegistry>) {
        let _ = self.siblings.set(siblings);
        let _ = self.registry.set(registry);
    }

    /// Number of sources + listeners this worker currently drives, used by
    /// the rebalancing heuristics in §4.7.
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    pub fn add_source(&self, source: Arc<Source>) {
        source.set_current_worker_index(self.index);
        self.schedule(source.id, WorkItem::Source(source), 0);
    }

    pub fn add_listener(&self, listener: Arc<Listener>, source: Arc<Source>) {
        listener.set_current_source(&source);
        self.schedule(listener.id, WorkItem::Listener(listener), 0);
    }

    /// Removes and returns the listener identified by `id`, if this worker
    /// currently owns it — used by the migration logic when a listener
    /// gravitates to a different worker (§4.7's rebalancing).
    pub fn take_listener(&self, id: &Uuid) -> Option<Arc<Listener>> {
        let mut items = self.items.lock().unwrap();
        match items.remove(id) {
            Some(WorkItem::Listener(l)) => {
                self.load.fetch_sub(1, Ordering::AcqRel);
                Some(l)
            }
            Some(other) => {
                items.insert(*id, other);
                None
            }
            None => None,
        }
    }

    fn schedule(&self, id: Uuid, item: WorkItem, at_ms: u64) {
        let is_new = {
            let mut items = self.items.lock().unwrap();
            let was_present = items.contains_key(&id);
            items.insert(id, item);
            !was_present
        };
        if is_new {
            self.load.fetch_add(1, Ordering::AcqRel);
        }
        self.heap.lock().unwrap().push(Reverse(Due { at_ms, id }));
        self.wake.notify_all();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    /// Runs the scheduling loop until `request_shutdown` is called. Meant
    /// to be the body of a dedicated `std::thread`.
    pub fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let due_id = {
                let mut heap = self.heap.lock().unwrap();
                loop {
                    let Some(Reverse(due)) = heap.peek() else {
                        // Nothing scheduled at all; wait to be woken.
                        let (guard, _) = self
                            .wake
                            .wait_timeout(heap, Duration::from_millis(1_000))
                            .unwrap();
                        heap = guard;
                        if self.shutdown.load(Ordering::Acquire) {
                            return;
                        }
                        continue;
                    };
                    let now = now_ms();
                    if due.at_ms <= now {
                        let Reverse(due) = heap.pop().unwrap();
                        break due.id;
                    }
                    let wait = Duration::from_millis(due.at_ms - now);
                    let (guard, _) = self.wake.wait_timeout(heap, wait).unwrap();
                    heap = guard;
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                }
            };

            let item = self.items.lock().unwrap().remove(&due_id);
            let Some(item) = item else { continue };
            self.load.fetch_sub(1, Ordering::AcqRel);

            match item {
                WorkItem::Source(source) => {
                    let next = now_ms() + self.process_source(&source);
                    match self.maybe_migrate_source(&source) {
                        Some(dest) => {
                            log::info!(
                                "migrating source {} from worker {} to worker {}",
                                source.mount_name,
                                self.index,
                                dest.index
                            );
                            source.set_current_worker_index(dest.index);
                            dest.schedule(due_id, WorkItem::Source(source), next);
                        }
                        None => self.schedule(due_id, WorkItem::Source(source), next),
                    }
                }
                WorkItem::Listener(listener) => {
                    let now = now_ms();
                    let Some(source) = listener.current_source() else {
                        // Its source was dropped without migrating or
                        // disconnecting it first; nothing left to drive.
                        continue;
                    };
                    if let Some(dest) = self.maybe_migrate_listener(&source, now) {
                        dest.schedule(due_id, WorkItem::Listener(listener), now);
                        continue;
                    }
                    match send_pipeline::process_listener(&listener, &source, now) {
                        PassOutcome::Reschedule(delay) => {
                            self.schedule(due_id, WorkItem::Listener(listener), now + delay);
                        }
                        PassOutcome::Disconnect => {
                            source.remove_listener(&listener.id);
                            // Dropped: not rescheduled.
                        }
                    }
                }
            }
        }
    }

    /// §4.7: every `max(source_count, 6)` seconds, a source considers
    /// moving to the least-busy worker. Returns the destination worker if
    /// this source should migrate off `self` now.
    fn maybe_migrate_source(&self, source: &Source) -> Option<Arc<Worker>> {
        let siblings = self.siblings.get()?;
        let registry = self.registry.get()?;
        let source_count = registry.len().max(1) as u64;
        let interval_ms = source_count.max(SOURCE_REBALANCE_MIN_SECS) * 1_000;
        if !source.due_for_worker_recheck(now_ms(), interval_ms) {
            return None;
        }
        let my_load = self.load();
        siblings
            .iter()
            .filter(|w| w.index != self.index)
            .min_by_key(|w| w.load())
            .filter(|candidate| {
                candidate.load() + source.listener_count() as u64 + 10 < my_load
            })
            .cloned()
    }

    /// §4.7's `listener_change_worker`: once per `stats_interval_secs`, a
    /// listener gravitates toward its source's current worker if the load
    /// difference between the two workers is small enough that moving
    /// won't just shuffle the imbalance elsewhere.
    fn maybe_migrate_listener(&self, source: &Source, now_ms: u64) -> Option<Arc<Worker>> {
        let siblings = self.siblings.get()?;
        let target_index = source.current_worker_index();
        if target_index == self.index || target_index == usize::MAX {
            return None;
        }
        if !source.due_for_stats_update(now_ms) {
            return None;
        }
        let target = siblings.get(target_index)?;
        let threshold = (source.listener_count() as u64 + 10).max(LISTENER_REBALANCE_FLOOR);
        let diff = target.load().abs_diff(self.load());
        (diff < threshold).then(|| target.clone())
    }

    /// Resolves `source`'s configured fallback mount (§4.6) to a live,
    /// available source to migrate listeners onto, if one exists. Requires
    /// an installed registry, so an isolated unit-test `Worker` with no
    /// pool never attempts a handoff.
    fn resolve_fallback(&self, source: &Source) -> Option<Arc<Source>> {
        let mount = source.fallback_mount()?;
        let registry = self.registry.get()?;
        let target = registry.find_raw(&mount)?;
        target.is_available().then_some(target)
    }

    /// Either migrates every listener on a dying `source` to its resolved
    /// fallback (§4.6, §8 scenario 3), or drops them outright if no
    /// fallback is configured or available.
    fn teardown_or_handoff(&self, source: &Source) {
        match self.resolve_fallback(source) {
            Some(target) => {
                log::info!(
                    "migrating listeners from {} to fallback {} on source death",
                    source.mount_name,
                    target.mount_name
                );
                crate::handoff::migrate_all_listeners(source, &target);
            }
            None => crate::handoff::disconnect_all_listeners(source),
        }
    }

    /// One pass of a source client: pulls as much as `get_buffer` will hand
    /// back without blocking, appends each chunk to the queue, and reports
    /// the next poll delay using the adaptive backoff of §4.2.
    fn process_source(&self, source: &Source) -> u64 {
        use crate::protocol_constants::SOURCE_POLL_MS;

        if !source.is_running() {
            return SOURCE_POLL_MS;
        }

        let now = now_ms();
        if source.check_listeners_sync_watchdog(now) {
            self.teardown_or_handoff(source);
            return SOURCE_POLL_MS;
        }
        if source.is_timed_out(now) {
            log::warn!("source {} timed out after silence", source.mount_name);
            source.begin_timeout_shutdown(now);
            source.set_running(false);
            source.mark_disconnected(now);
            self.teardown_or_handoff(source);
            return SOURCE_POLL_MS;
        }
        if source.should_warn_no_data(now) {
            log::warn!("source {} has sent no data in 3s", source.mount_name);
        }

        if source.should_throttle_ingest() {
            return crate::protocol_constants::LIMIT_RATE_THROTTLE_MS;
        }

        let got_data = {
            let mut format = source.format.lock();
            match format.get_buffer(source) {
                Ok(Some(buf)) => {
                    source.touch_activity(now);
                    source.in_bitrate.record(buf.len(), now);
                    source.dump(buf.data());
                    let released = source.queue.lock().append(buf);
                    drop(released);
                    true
                }
                Ok(None) => false,
                Err(_) => {
                    source.begin_listeners_sync(now);
                    source.set_running(false);
                    source.mark_disconnected(now);
                    self.teardown_or_handoff(source);
                    false
                }
            }
        };

        if got_data {
            source.decay_skip_duration()
        } else {
            source.grow_skip_duration()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, FormatType};
    use crate::refbuf::{RefBuf, RefBufFlags};
    use std::sync::atomic::AtomicUsize;

    struct OneShotFormat {
        served: AtomicBool,
        count: Arc<AtomicUsize>,
    }
    impl Format for OneShotFormat {
        fn format_type(&self) -> FormatType {
            FormatType("ogg")
        }
        fn get_buffer(&mut self, _source: &Source) -> crate::error::BroadcastResult<Option<RefBuf>> {
            if self.served.swap(true, Ordering::AcqRel) {
                Ok(None)
            } else {
                self.count.fetch_add(1, Ordering::AcqRel);
                Ok(Some(RefBuf::new(bytes::Bytes::from_static(b"hi"), RefBufFlags::empty())))
            }
        }
        fn write_buf_to_client(&self, _listener: &Listener) -> crate::error::BroadcastResult<usize> {
            Ok(0)
        }
        fn create_client_data(&self, _listener: &Listener) -> crate::error::BroadcastResult<RefBuf> {
            Ok(RefBuf::new(bytes::Bytes::new(), RefBufFlags::empty()))
        }
        fn apply_settings(&mut self, _mount: &crate::config::MountProxy) {}
    }

    #[test]
    fn process_source_appends_once_then_backs_off() {
        let count = Arc::new(AtomicUsize::new(0));
        let source = Source::new(
            "/live.ogg",
            Box::new(OneShotFormat {
                served: AtomicBool::new(false),
                count: count.clone(),
            }),
            1_000_000,
            65_536,
            65_536,
            10,
            now_ms(),
        );
        let worker = Worker::new(0);
        let first_delay = worker.process_source(&source);
        let second_delay = worker.process_source(&source);
        assert_eq!(count.load(Ordering::Acquire), 1);
        assert!(second_delay >= first_delay);
    }

    #[test]
    fn source_death_migrates_listeners_to_available_fallback() {
        let registry = Arc::new(MountRegistry::new());
        let worker = Worker::new(0);
        worker.install_pool(vec![worker.clone()], registry.clone());

        let primary = idle_source("/live.ogg");
        let fallback = idle_source("/backup.ogg");
        primary.set_fallback_mount(Some("/backup.ogg".to_string()));
        registry.reserve("/live.ogg", primary.clone()).unwrap();
        registry.reserve("/backup.ogg", fallback.clone()).unwrap();

        for _ in 0..3 {
            let listener = Arc::new(Listener::new(
                Arc::new(crate::listener::test_support::MemorySink::default()),
                now_ms(),
            ));
            Source::attach_listener(&primary, listener);
        }
        assert_eq!(primary.listener_count(), 3);

        // Ingestion has already stopped; the next pass should discover the
        // silence timeout and hand off rather than disconnect.
        primary.touch_activity(0);
        worker.process_source(&primary);

        assert_eq!(primary.listener_count(), 0);
        assert_eq!(fallback.listener_count(), 3);
        assert!(!primary.is_running());
    }

    #[test]
    fn source_death_disconnects_listeners_when_no_fallback_configured() {
        let registry = Arc::new(MountRegistry::new());
        let worker = Worker::new(0);
        worker.install_pool(vec![worker.clone()], registry.clone());

        let primary = idle_source("/live.ogg");
        registry.reserve("/live.ogg", primary.clone()).unwrap();

        let listener = Arc::new(Listener::new(
            Arc::new(crate::listener::test_support::MemorySink::default()),
            now_ms(),
        ));
        Source::attach_listener(&primary, listener.clone());

        primary.touch_activity(0);
        worker.process_source(&primary);

        assert_eq!(primary.listener_count(), 0);
        assert!(listener.connection.is_error());
    }

    #[test]
    fn worker_tracks_load_as_items_are_added_and_taken() {
        let worker = Worker::new(0);
        let source = Arc::new(Source::new(
            "/live.ogg",
            Box::new(OneShotFormat {
                served: AtomicBool::new(true),
                count: Arc::new(AtomicUsize::new(0)),
            }),
            1_000_000,
            65_536,
            65_536,
            10,
            now_ms(),
        ));
        let listener = Arc::new(Listener::new(
            Arc::new(crate::listener::test_support::MemorySink::default()),
            now_ms(),
        ));
        let id = listener.id;
        worker.add_listener(listener, source);
        assert_eq!(worker.load(), 1);
        assert!(worker.take_listener(&id).is_some());
        assert_eq!(worker.load(), 0);
    }

    fn idle_source(name: &str) -> Arc<Source> {
        Arc::new(Source::new(
            name,
            Box::new(OneShotFormat {
                served: AtomicBool::new(true),
                count: Arc::new(AtomicUsize::new(0)),
            }),
            1_000_000,
            65_536,
            65_536,
            10,
            now_ms(),
        ))
    }

    #[test]
    fn source_migrates_to_least_loaded_sibling_once_recheck_is_due() {
        let registry = Arc::new(MountRegistry::new());
        let busy = Worker::new(0);
        let idle = Worker::new(1);
        let siblings = vec![busy.clone(), idle.clone()];
        busy.install_pool(siblings.clone(), registry.clone());
        idle.install_pool(siblings, registry);

        // Pile enough load onto `busy` that the `+10` gravitation margin is cleared.
        for _ in 0..20 {
            busy.load.fetch_add(1, Ordering::AcqRel);
        }

        let source = idle_source("/live.ogg");
        // Force the recheck window open immediately.
        assert!(source.due_for_worker_recheck(now_ms(), 0));

        let dest = busy.maybe_migrate_source(&source);
        assert_eq!(dest.map(|w| w.index), Some(1));
    }

    #[test]
    fn source_does_not_migrate_without_an_installed_pool() {
        let worker = Worker::new(0);
        let source = idle_source("/live.ogg");
        assert!(worker.maybe_migrate_source(&source).is_none());
    }

    #[test]
    fn listener_gravitates_to_sources_current_worker_when_close_in_load() {
        let registry = Arc::new(MountRegistry::new());
        let here = Worker::new(0);
        let there = Worker::new(1);
        let siblings = vec![here.clone(), there.clone()];
        here.install_pool(siblings.clone(), registry.clone());
        there.install_pool(siblings, registry);

        let source = idle_source("/live.ogg");
        source.set_current_worker_index(1);
        assert!(source.due_for_stats_update(now_ms()));

        let dest = here.maybe_migrate_listener(&source, now_ms());
        assert_eq!(dest.map(|w| w.index), Some(1));
    }
}
