//! Streaming core for a mountpoint-based audio broadcast server.
//!
//! This crate implements the mountpoint/source/listener/queue machinery
//! shared by any codec or transport: a source connects and is reserved a
//! mountpoint, listeners attach and are served from a reference-counted
//! FIFO queue with burst-on-connect semantics, and listeners migrate to a
//! fallback mount when their source dies or is hijacked.
//!
//! # Architecture
//!
//! - [`refbuf`]: the reference-counted buffer chain and per-source queue
//! - [`format`]: the codec-agnostic `Format` adapter seam
//! - [`source`]: connected sources and their state
//! - [`listener`]: attached listeners and their delivery state
//! - [`mount_registry`]: the mountpoint table and fallback-chain resolution
//! - [`admission`]: listener admission (capacity, bandwidth, duplicate login)
//! - [`send_pipeline`]: the per-listener `check_buffer` delivery state machine
//! - [`handoff`]: listener migration during source handoff/teardown
//! - [`icy`]: ICY/Shoutcast `StreamTitle` metadata formatting and injection
//! - [`worker`]: the cooperative OS-thread scheduler driving everything above
//! - [`config`]: validated configuration types
//! - [`error`]: centralized error types
//! - [`runtime`]: runtime-independent background task spawning
//! - [`bootstrap`]: composition root wiring config, registry, and workers
//!
//! This crate has no async runtime or HTTP framework dependency; workers
//! are plain OS threads each looping over non-blocking `process` calls.
//! A hosting application (see `apps/server`) owns the actual sockets and
//! any async I/O, translating connections into `Source`/`Listener` values.

#![warn(clippy::all)]

pub mod admission;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod format;
pub mod handoff;
pub mod icy;
pub mod listener;
pub mod mount_registry;
pub mod protocol_constants;
pub mod refbuf;
pub mod runtime;
pub mod send_pipeline;
pub mod source;
pub mod worker;

pub use admission::{
    admit_listener, check_duplicate_login, setup_listener, AdmissionOutcome, AdmissionRequest,
};
pub use bootstrap::{bootstrap_core, BootstrappedCore};
pub use config::{AuthPolicy, GlobalConfig, MountProxy};
pub use error::{BroadcastError, BroadcastResult, ErrorCode};
pub use format::{Format, FormatType};
pub use icy::{IcyFormatter, IcyMetadataInjector, StreamMetadata};
pub use listener::{CheckBufferState, Listener, ListenerFlags, ListenerOps, ListenerSink};
pub use mount_registry::MountRegistry;
pub use refbuf::{Queue, RefBuf, RefBufFlags};
pub use runtime::{TaskSpawner, ThreadSpawner};
pub use source::{parse_audio_info, source_swap_client, HijackPolicy, Source, SourceFlags};
pub use worker::Worker;
