//! Broadcast Server - standalone mountpoint-based audio streaming server.
//!
//! This binary is a thin transport shell around `broadcast-core`: it owns
//! the actual TCP/HTTP sockets and translates them into `Source`/`Listener`
//! values, but all scheduling, queueing, and fallback logic lives in the
//! core crate. It demonstrates the two external endpoints described in
//! the core's design — `PUT /<mount>` for source ingest and
//! `GET /<mount>` for listener attach — rather than providing a complete,
//! production-grade codec/ingest implementation.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use broadcast_core::{
    admit_listener, bootstrap_core, setup_listener, AdmissionOutcome, AdmissionRequest,
    BootstrappedCore, Format, FormatType, Listener, ListenerSink, Source,
};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::config::ServerConfig;

/// Broadcast Server - standalone mountpoint-based audio streaming server.
#[derive(Parser, Debug)]
#[command(name = "broadcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "BROADCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "BROADCAST_BIND_PORT")]
    port: Option<u16>,
}

/// Shared application state handed to every axum handler.
#[derive(Clone)]
struct AppState {
    core: Arc<BootstrappedCore>,
}

/// A no-op framing `Format` used for the ingest demo endpoint: it treats
/// each chunk handed up from the PUT request body as one buffer, with no
/// codec-level framing of its own. A real deployment supplies a concrete
/// codec adapter (Ogg, MP3, ...) instead. Bytes arrive from the async
/// body-pump task in `ingest_source` over a plain `std::sync::mpsc`
/// channel, since the worker that drives `get_buffer` runs on its own
/// cooperative-scheduler thread, not inside tokio.
struct PassthroughFormat {
    rx: std::sync::mpsc::Receiver<Bytes>,
}

impl Format for PassthroughFormat {
    fn format_type(&self) -> FormatType {
        FormatType("application/octet-stream")
    }

    fn get_buffer(&mut self, _source: &Source) -> broadcast_core::BroadcastResult<Option<broadcast_core::RefBuf>> {
        use std::sync::mpsc::TryRecvError;
        match self.rx.try_recv() {
            Ok(chunk) => Ok(Some(broadcast_core::RefBuf::new(
                chunk,
                broadcast_core::RefBufFlags::empty(),
            ))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(broadcast_core::BroadcastError::FormatAdapter(
                "ingest body closed".to_string(),
            )),
        }
    }

    fn write_buf_to_client(&self, listener: &Listener) -> broadcast_core::BroadcastResult<usize> {
        let Some(buf) = listener.refbuf() else {
            return Ok(0);
        };
        let pos = listener.pos() as usize;
        if pos >= buf.data().len() {
            return Ok(0);
        }
        match listener.sink.send(&buf.data()[pos..]) {
            Ok(sent) => Ok(sent),
            Err(e) => Err(broadcast_core::BroadcastError::FormatAdapter(e.to_string())),
        }
    }

    fn create_client_data(&self, _listener: &Listener) -> broadcast_core::BroadcastResult<broadcast_core::RefBuf> {
        Ok(broadcast_core::RefBuf::new(
            Bytes::new(),
            broadcast_core::RefBufFlags::empty(),
        ))
    }

    fn apply_settings(&mut self, _mount: &broadcast_core::MountProxy) {}
}

/// Forwards bytes written by the streaming core into a channel an axum
/// response body streams out of.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ListenerSink for ChannelSink {
    fn send(&self, data: &[u8]) -> std::io::Result<usize> {
        match self.tx.send(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(data.len()),
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "listener gone")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("broadcast-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.core.port = port;
    }

    log::info!(
        "configuration: port={}, worker_count={}, mounts={}",
        config.core.port,
        config.worker_count,
        config.core.mounts.len()
    );

    let core = bootstrap_core(config.core, config.worker_count)
        .context("Failed to bootstrap streaming core")?;
    let bind_port = core.config.port;
    let state = AppState { core: Arc::new(core) };

    let app = Router::new()
        .route("/{*mount}", get(attach_listener).put(ingest_source))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", bind_port))
        .await
        .with_context(|| format!("failed to bind port {bind_port}"))?;
    log::info!("listening on 0.0.0.0:{bind_port}");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                log::error!("server error: {e}");
            }
        }
        _ = shutdown_signal() => {
            log::info!("shutdown signal received");
        }
    }

    if let Ok(state) = Arc::try_unwrap(state.core) {
        state.shutdown();
    }

    log::info!("shutdown complete");
    Ok(())
}

async fn attach_listener(
    State(state): State<AppState>,
    AxumPath(mount): AxumPath<String>,
) -> Response {
    let mount_name = format!("/{mount}");
    let request = AdmissionRequest::default();

    let source = match admit_listener(&state.core.registry, &state.core.config, &mount_name, &request) {
        Ok(AdmissionOutcome::Live(source)) => source,
        Ok(AdmissionOutcome::FileFallback { mount, bitrate }) => {
            return (
                StatusCode::TEMPORARY_REDIRECT,
                format!("redirect to static mirror {mount} at {bitrate}kbps"),
            )
                .into_response();
        }
        Err(e) => return (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), e.to_string()).into_response(),
    };

    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let sink = Arc::new(ChannelSink { tx });
    let listener = Arc::new(Listener::new(sink, broadcast_core::worker::now_ms()));

    // `setup_listener` reports whether the source is ON_DEMAND; this
    // worker's `add_listener` already schedules the first pass for
    // immediately, so there's nothing further to do with that signal here.
    let _wake_now = setup_listener(&source, listener.clone());
    state.core.least_loaded_worker().add_listener(listener, source);

    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
    Response::new(Body::from_stream(stream))
}

async fn ingest_source(
    State(state): State<AppState>,
    AxumPath(mount): AxumPath<String>,
    headers: HeaderMap,
    body: Body,
) -> impl IntoResponse {
    let mount_name = format!("/{mount}");
    let username = headers
        .get("x-source-username")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("source")
        .to_string();

    let (tx, rx) = std::sync::mpsc::channel::<Bytes>();
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) if !bytes.is_empty() => {
                    if tx.send(bytes).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("ingest body stream error: {e}");
                    break;
                }
            }
        }
    });

    let source = Arc::new(Source::new(
        mount_name.clone(),
        Box::new(PassthroughFormat { rx }),
        state.core.config.queue_size_limit_for(&mount_name),
        state.core.config.min_queue_size_for(&mount_name),
        state.core.config.burst_size_for(&mount_name),
        state.core.config.source_timeout_secs,
        broadcast_core::worker::now_ms(),
    ));
    let allow_override = state
        .core
        .config
        .mount(&mount_name)
        .map(|m| m.fallback_override)
        .unwrap_or(false);
    if let Some(mount_cfg) = state.core.config.mount(&mount_name) {
        source.set_wait_time_secs(mount_cfg.wait_time_secs.unwrap_or(0));
        source.set_fallback_mount(mount_cfg.fallback_mount.clone());
        source.set_limit_rate(mount_cfg.limit_rate);
        if let Some(handle) = mount_cfg.on_connect.clone() {
            let mount_for_log = mount_name.clone();
            *source.on_connect.lock() = Some(Arc::new(move |mount, user| {
                log::info!("on_connect hook {handle} fired for {mount_for_log} ({mount}, {user})");
            }));
        }
    }

    // source_init (§4.8): parse ice-audio-info before the source is handed
    // to a worker, and run the on_connect hook now that the mount is
    // actually ours.
    if let Some(audio_info) = headers.get("ice-audio-info").and_then(|v| v.to_str().ok()) {
        source.apply_audio_info(audio_info);
    }

    match state.core.registry.reserve(&mount_name, source.clone()) {
        Ok(()) => {
            source.fire_on_connect(&username);
            state.core.least_loaded_worker().add_source(source);
            (StatusCode::OK, format!("mounted {mount_name}")).into_response()
        }
        Err(broadcast_core::BroadcastError::MountInUse(_)) => {
            // The mount is occupied by a running source. Rather than
            // rejecting outright, offer the hijack handshake (§4.8's
            // `source_init` override path): only takes effect when the
            // mount is configured with `fallback_override` and the two
            // formats match.
            match state.core.registry.find_raw(&mount_name) {
                Some(existing) => {
                    let policy = broadcast_core::HijackPolicy { allow_override };
                    match broadcast_core::source_swap_client(
                        &existing,
                        &source,
                        &policy,
                        broadcast_core::worker::now_ms(),
                    ) {
                        Ok(()) => {
                            state.core.registry.replace(&mount_name, source.clone());
                            broadcast_core::handoff::migrate_all_listeners(&existing, &source);
                            source.fire_on_connect(&username);
                            state.core.least_loaded_worker().add_source(source);
                            (StatusCode::OK, format!("hijacked {mount_name}")).into_response()
                        }
                        Err(e) => (
                            StatusCode::from_u16(e.status_code())
                                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                            e.to_string(),
                        )
                            .into_response(),
                    }
                }
                None => (StatusCode::FORBIDDEN, format!("mount {mount_name} in use")).into_response(),
            }
        }
        Err(e) => (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), e.to_string())
            .into_response(),
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
