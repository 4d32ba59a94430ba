//! Listener admission: the `add_listener` algorithm of §4.4.
//!
//! Pure decision logic, deliberately kept free of any socket/format I/O so
//! it can be exercised directly in tests: given a mount registry, a config,
//! and a connecting listener's identity, decide which mount (if any) the
//! listener should be attached to, or which error to return.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::error::{BroadcastError, BroadcastResult};
use crate::listener::{CheckBufferState, Listener, ListenerOps};
use crate::mount_registry::MountRegistry;
use crate::source::Source;

/// Identity/request facts needed to make an admission decision, independent
/// of any particular transport.
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    pub username: Option<String>,
    pub is_slave: bool,
}

/// Where a resolved admission attempt landed: either a live source to
/// attach to, or a static-file mirror to redirect to (§4.4 step 1's
/// `mount[bitrate]` file-fallback path).
#[derive(Clone)]
pub enum AdmissionOutcome {
    /// Attach the listener to this live source.
    Live(Arc<Source>),
    /// No live source exists at `mount`, but its name carried a bracketed
    /// bitrate hint (`/stream[128]`); serve it from the static file mirror
    /// at that bitrate instead of a queue.
    FileFallback { mount: String, bitrate: u32 },
}

impl std::fmt::Debug for AdmissionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live(source) => f.debug_tuple("Live").field(&source.mount_name).finish(),
            Self::FileFallback { mount, bitrate } => f
                .debug_struct("FileFallback")
                .field("mount", mount)
                .field("bitrate", bitrate)
                .finish(),
        }
    }
}

/// Parses a trailing `[<bitrate>]` suffix off a mount name, e.g.
/// `/stream[128]` → `("/stream", 128)`. Returns `None` if the mount name
/// carries no such suffix or the bracketed contents aren't a plain integer.
pub fn parse_bracket_bitrate(mount: &str) -> Option<(&str, u32)> {
    let start = mount.rfind('[')?;
    if !mount.ends_with(']') {
        return None;
    }
    let base = &mount[..start];
    let bitrate: u32 = mount[start + 1..mount.len() - 1].parse().ok()?;
    Some((base, bitrate))
}

/// Checks whether `username` is already attached to `source` and the
/// mount's auth policy forbids the duplicate, per §4.4's duplicate-login
/// check. A pure predicate so it can be unit tested without a live
/// connection.
pub fn check_duplicate_login(source: &Source, config: &GlobalConfig, username: &str) -> bool {
    let policy = config
        .mount(&source.mount_name)
        .map(|m| m.auth.clone())
        .unwrap_or_default();
    if policy.allow_duplicate_users {
        return false;
    }
    source
        .listeners
        .iter()
        .any(|entry| entry.value().username.as_deref() == Some(username))
}

/// Resolves which mountpoint a connecting listener should attach to,
/// applying the `fallback_when_full` cascade when the originally requested
/// mount is at its listener-count or bandwidth ceiling.
///
/// Slave (relay) connections bypass per-mount admission limits, matching
/// the original's treatment of relays as infrastructure rather than
/// end-user traffic.
pub fn admit_listener(
    registry: &MountRegistry,
    config: &GlobalConfig,
    mount_name: &str,
    request: &AdmissionRequest,
) -> BroadcastResult<AdmissionOutcome> {
    let mut current = mount_name.to_string();
    for _ in 0..crate::protocol_constants::MAX_FALLBACK_DEPTH {
        let source = match registry.find_with_fallback(&current, |m| {
            config.mount(m).and_then(|p| p.fallback_mount.clone())
        }) {
            Ok(source) => source,
            Err(BroadcastError::MountNotFound(_)) => {
                let mount_cfg = config.mount(&current);
                if let Some((base, bitrate)) = parse_bracket_bitrate(&current) {
                    return Ok(AdmissionOutcome::FileFallback {
                        mount: base.to_string(),
                        bitrate,
                    });
                }
                if let Some(rate) = mount_cfg.and_then(|m| m.limit_rate) {
                    return Ok(AdmissionOutcome::FileFallback {
                        mount: current.clone(),
                        bitrate: (rate / 125) as u32, // bytes/sec -> kbit/sec
                    });
                }
                return Err(BroadcastError::MountNotFound(mount_name.to_string()));
            }
            Err(e) => return Err(e),
        };

        if let Some(username) = &request.username {
            if !request.is_slave && check_duplicate_login(&source, config, username) {
                let policy = config
                    .mount(&source.mount_name)
                    .map(|m| m.auth.clone())
                    .unwrap_or_default();
                if !policy.drop_existing_listener {
                    return Err(BroadcastError::DuplicateLogin(username.clone()));
                }
                drop_existing_listener_with_username(&source, username);
            }
        }

        if request.is_slave {
            return Ok(AdmissionOutcome::Live(source));
        }

        let mount_cfg = config.mount(&source.mount_name);

        let stream_bitrate = mount_cfg
            .and_then(|m| m.bitrate)
            .map(|kbps| kbps as u64 * 125)
            .unwrap_or(0);

        if let Some(limit) = config.max_bandwidth {
            if registry.total_outgoing_bandwidth() + stream_bitrate > limit {
                return Err(BroadcastError::BandwidthLimitReached);
            }
        }

        let max_listeners = mount_cfg.and_then(|m| m.max_listeners);
        let at_capacity = max_listeners
            .map(|limit| source.listener_count() as u32 >= limit)
            .unwrap_or(false);

        let max_bandwidth = mount_cfg.and_then(|m| m.max_bandwidth);
        let over_bandwidth = max_bandwidth
            .map(|limit| (source.listener_count() as u64 + 1) * stream_bitrate > limit)
            .unwrap_or(false);

        if !at_capacity && !over_bandwidth {
            return Ok(AdmissionOutcome::Live(source));
        }

        match mount_cfg.and_then(|m| m.fallback_when_full.clone()) {
            Some(next) if next != current => current = next,
            _ => {
                return if over_bandwidth {
                    Err(BroadcastError::BandwidthLimitReached)
                } else {
                    Err(BroadcastError::MaxListenersReached(source.mount_name.clone()))
                }
            }
        }
    }
    Err(BroadcastError::FallbackChainTooDeep(mount_name.to_string()))
}

/// Performs the listener-attach side effects of `add_listener` (§4.4 step
/// 3) once a live source has been resolved: seeds `check_buffer` at
/// `http_source_listener`, resets `queue_pos`, and inserts the listener
/// into the source's listener set. Returns `true` if the source is
/// `ON_DEMAND`, signaling the caller should wake its worker immediately
/// rather than waiting for the next scheduled pass.
pub fn setup_listener(source: &Arc<Source>, listener: Arc<Listener>) -> bool {
    listener.set_queue_pos(0);
    *listener.ops.lock() = ListenerOps::Client(CheckBufferState::HttpSourceListener);
    let on_demand = source.is_on_demand();
    Source::attach_listener(source, listener);
    on_demand
}

fn drop_existing_listener_with_username(source: &Source, username: &str) {
    let stale: Vec<_> = source
        .listeners
        .iter()
        .filter(|e| e.value().username.as_deref() == Some(username))
        .map(|e| *e.key())
        .collect();
    for id in stale {
        if let Some(listener) = source.remove_listener(&id) {
            listener.connection.set_error();
        }
    }
}
