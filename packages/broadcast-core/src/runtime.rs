//! Task spawning abstraction for runtime independence.
//!
//! The teacher's own `runtime.rs` abstracts background work behind a
//! `TaskSpawner` trait so a desktop host can hand it Tauri's runtime while a
//! standalone server hands it Tokio, without either caller hardcoding which
//! executor backs it. This crate's workers are deliberately *not* executor
//! tasks (§9: "workers are plain OS threads ... not executor tasks"), so the
//! seam here is over spawning a named, long-running closure rather than a
//! `Future` — but the intent is the same: [`bootstrap_core`](crate::bootstrap::bootstrap_core)
//! never hardcodes `std::thread::spawn` as the only way to host a worker
//! loop, and a host embedding this crate into its own thread pool can supply
//! its own [`TaskSpawner`].

/// Abstraction for spawning a long-running background task.
///
/// Implementations should ensure the task keeps running even if the
/// `TaskSpawner` itself is dropped — the returned [`JoinHandle`] is the only
/// thing tying the caller back to the task's lifetime.
///
/// [`JoinHandle`]: std::thread::JoinHandle
pub trait TaskSpawner: Send + Sync {
    /// Spawns `task` as a named background thread and returns its handle.
    fn spawn_named(
        &self,
        name: String,
        task: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::thread::JoinHandle<()>;
}

/// Default [`TaskSpawner`]: spawns a plain named OS thread via
/// `std::thread::Builder`. What `bootstrap_core` uses unless a host
/// overrides it.
#[derive(Clone, Copy, Default)]
pub struct ThreadSpawner;

impl TaskSpawner for ThreadSpawner {
    fn spawn_named(
        &self,
        name: String,
        task: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(name)
            .spawn(task)
            .expect("failed to spawn thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn thread_spawner_runs_the_task_and_names_the_thread() {
        let spawner = ThreadSpawner;
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let handle = spawner.spawn_named(
            "broadcast-test-thread".to_string(),
            Box::new(move || ran_clone.store(true, Ordering::SeqCst)),
        );
        assert_eq!(handle.thread().name(), Some("broadcast-test-thread"));
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
