//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root: the single place the mount
//! registry, the worker pool, and their OS threads are created and wired
//! together. Splitting this out keeps `apps/server` a thin transport shell
//! with no knowledge of how sources and listeners are scheduled.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::GlobalConfig;
use crate::error::{BroadcastError, BroadcastResult};
use crate::mount_registry::MountRegistry;
use crate::runtime::{TaskSpawner, ThreadSpawner};
use crate::worker::{now_ms, Worker};

/// How often the housekeeping thread sweeps the mount registry for stale
/// entries (§4.3's `source_recheck_mounts`).
const MOUNT_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Container for the bootstrapped streaming core: the mount table plus a
/// pool of cooperative scheduling threads ready to take sources and
/// listeners.
pub struct BootstrappedCore {
    pub config: GlobalConfig,
    pub registry: Arc<MountRegistry>,
    pub workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    housekeeping_shutdown: Arc<(Mutex<bool>, Condvar)>,
    housekeeping_handle: Option<JoinHandle<()>>,
}

impl BootstrappedCore {
    /// Picks the least-loaded worker for a freshly connecting source or
    /// listener, per the load-gravitation heuristic of §4.7.
    pub fn least_loaded_worker(&self) -> Arc<Worker> {
        self.workers
            .iter()
            .min_by_key(|w| w.load())
            .expect("worker pool is never empty")
            .clone()
    }

    /// Signals every worker thread and the housekeeping sweep to stop, and
    /// waits for them to exit.
    pub fn shutdown(mut self) {
        log::info!("shutting down {} worker thread(s)", self.workers.len());
        for worker in &self.workers {
            worker.request_shutdown();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        let (lock, cvar) = &*self.housekeeping_shutdown;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.housekeeping_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bootstraps the streaming core: validates `config`, builds an empty
/// mount registry, and spawns one OS thread per worker running its
/// cooperative scheduling loop.
///
/// Spawns through the default [`ThreadSpawner`]; see
/// [`bootstrap_core_with_spawner`] to host the worker and housekeeping
/// threads on a caller-supplied [`TaskSpawner`] instead.
///
/// # Arguments
/// * `config` - Server-wide configuration, already loaded by the hosting
///   application.
/// * `worker_count` - Number of scheduling threads to spawn; the original
///   sizes this to the host's core count, left to the caller here.
///
/// # Errors
/// Returns [`BroadcastError::Configuration`] if `config` fails validation.
pub fn bootstrap_core(config: GlobalConfig, worker_count: usize) -> BroadcastResult<BootstrappedCore> {
    bootstrap_core_with_spawner(config, worker_count, &ThreadSpawner)
}

/// Same as [`bootstrap_core`], but hosts the worker and housekeeping
/// threads on `spawner` instead of hardcoding [`ThreadSpawner`] — the seam
/// an embedding application uses to run this crate's background work on its
/// own thread pool rather than one this crate spins up itself.
///
/// # Errors
/// Returns [`BroadcastError::Configuration`] if `config` fails validation.
pub fn bootstrap_core_with_spawner(
    config: GlobalConfig,
    worker_count: usize,
    spawner: &dyn TaskSpawner,
) -> BroadcastResult<BootstrappedCore> {
    config
        .validate()
        .map_err(BroadcastError::Configuration)?;

    let worker_count = worker_count.max(1);
    let registry = Arc::new(MountRegistry::new());

    let mut workers = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        workers.push(Worker::new(index));
    }
    for worker in &workers {
        worker.install_pool(workers.clone(), registry.clone());
    }

    let mut handles = Vec::with_capacity(worker_count);
    for worker in &workers {
        let worker = worker.clone();
        let run_handle = spawner.spawn_named(
            format!("broadcast-worker-{}", worker.index),
            Box::new(move || worker.run()),
        );
        handles.push(run_handle);
    }

    log::info!(
        "bootstrapped streaming core: {} worker thread(s), queue_size_limit={}",
        worker_count,
        config.queue_size_limit
    );

    let housekeeping_shutdown = Arc::new((Mutex::new(false), Condvar::new()));
    let housekeeping_handle = {
        let registry = registry.clone();
        let shutdown = housekeeping_shutdown.clone();
        spawner.spawn_named(
            "broadcast-housekeeping".to_string(),
            Box::new(move || {
                let (lock, cvar) = &*shutdown;
                let mut done = lock.lock().unwrap();
                while !*done {
                    let (guard, _) = cvar.wait_timeout(done, MOUNT_RECHECK_INTERVAL).unwrap();
                    done = guard;
                    if *done {
                        return;
                    }
                    registry.recheck_mounts(now_ms());
                }
            }),
        )
    };

    Ok(BootstrappedCore {
        config,
        registry,
        workers,
        handles,
        housekeeping_shutdown,
        housekeeping_handle: Some(housekeeping_handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_rejects_invalid_config() {
        let mut config = GlobalConfig::default();
        config.queue_size_limit = 0;
        let result = bootstrap_core(config, 2);
        assert!(matches!(result, Err(BroadcastError::Configuration(_))));
    }

    #[test]
    fn bootstrap_spawns_requested_worker_count_and_shuts_down_cleanly() {
        let core = bootstrap_core(GlobalConfig::default(), 3).unwrap();
        assert_eq!(core.workers.len(), 3);
        let least_loaded = core.least_loaded_worker();
        assert_eq!(least_loaded.load(), 0);
        core.shutdown();
    }

    /// A spawner that counts how many background tasks it was asked to run,
    /// delegating the actual thread creation to `ThreadSpawner`. Proves
    /// `bootstrap_core_with_spawner` actually goes through the supplied
    /// `TaskSpawner` rather than hardcoding `std::thread::spawn` internally.
    struct CountingSpawner {
        count: std::sync::atomic::AtomicUsize,
        inner: ThreadSpawner,
    }

    impl crate::runtime::TaskSpawner for CountingSpawner {
        fn spawn_named(
            &self,
            name: String,
            task: Box<dyn FnOnce() + Send + 'static>,
        ) -> std::thread::JoinHandle<()> {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.spawn_named(name, task)
        }
    }

    #[test]
    fn bootstrap_with_spawner_routes_every_background_thread_through_it() {
        let spawner = CountingSpawner {
            count: std::sync::atomic::AtomicUsize::new(0),
            inner: ThreadSpawner,
        };
        let core = bootstrap_core_with_spawner(GlobalConfig::default(), 2, &spawner).unwrap();
        // 2 worker threads + 1 housekeeping thread.
        assert_eq!(spawner.count.load(std::sync::atomic::Ordering::SeqCst), 3);
        core.shutdown();
    }
}
