//! Configuration types for the streaming core.
//!
//! Read-only, refcounted configuration: global limits plus per-mount proxy
//! records. Parsing an actual config file format is out of scope for this
//! crate (see `apps/server/src/config.rs` for a YAML-backed loader); this
//! module only defines the validated shape and sensible defaults, following
//! the same serde-derive-plus-`validate()` pattern used throughout this
//! codebase's configuration types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_BURST_SIZE, DEFAULT_MIN_QUEUE_SIZE, DEFAULT_QUEUE_SIZE_LIMIT,
    DEFAULT_STATS_INTERVAL_SECS,
};

/// Server-wide configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Hostname advertised in responses and logs.
    pub hostname: String,

    /// Port the server listens on.
    pub port: u16,

    /// Root directory for static fallback files and intro files.
    pub webroot_dir: String,

    /// Maximum number of concurrently connected sources, across all mounts.
    pub source_limit: u32,

    /// Server-wide outgoing bandwidth ceiling in bytes/sec; `None` = unlimited.
    pub max_bandwidth: Option<u64>,

    /// Default queue retention ceiling (bytes) for mounts without an override.
    pub queue_size_limit: u64,

    /// Default burst retention window (bytes) for mounts without an override.
    pub min_queue_size: u64,

    /// Default burst size (bytes) handed to a newly attached listener.
    pub burst_size: u64,

    /// Default source ingestion timeout (seconds of silence before
    /// `SOURCE_TIMEOUT`) for mounts without an override.
    pub source_timeout_secs: u64,

    /// Per-mount configuration, keyed by mount name.
    #[serde(default)]
    pub mounts: HashMap<String, MountProxy>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 8000,
            webroot_dir: "./webroot".to_string(),
            source_limit: 16,
            max_bandwidth: None,
            queue_size_limit: DEFAULT_QUEUE_SIZE_LIMIT,
            min_queue_size: DEFAULT_MIN_QUEUE_SIZE,
            burst_size: DEFAULT_BURST_SIZE,
            source_timeout_secs: 10,
            mounts: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Validates the configuration, rejecting values that would make the
    /// streaming core misbehave at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_size_limit == 0 {
            return Err("queue_size_limit must be >= 1".to_string());
        }
        if self.min_queue_size == 0 {
            return Err("min_queue_size must be >= 1".to_string());
        }
        if self.source_limit == 0 {
            return Err("source_limit must be >= 1".to_string());
        }
        for (name, mount) in &self.mounts {
            mount
                .validate()
                .map_err(|e| format!("mount {name}: {e}"))?;
        }
        Ok(())
    }

    /// Looks up the per-mount configuration for `mount`, if any.
    pub fn mount(&self, mount: &str) -> Option<&MountProxy> {
        self.mounts.get(mount)
    }

    /// Resolves the effective queue size limit for `mount`.
    pub fn queue_size_limit_for(&self, mount: &str) -> u64 {
        self.mount(mount)
            .and_then(|m| m.queue_size_limit)
            .unwrap_or(self.queue_size_limit)
    }

    /// Resolves the effective burst retention window for `mount`.
    pub fn min_queue_size_for(&self, mount: &str) -> u64 {
        self.mount(mount)
            .and_then(|m| m.min_queue_size)
            .unwrap_or(self.min_queue_size)
    }

    /// Resolves the effective default burst size for `mount`.
    pub fn burst_size_for(&self, mount: &str) -> u64 {
        self.mount(mount)
            .and_then(|m| m.burst_size)
            .unwrap_or(self.burst_size)
    }
}

/// Admission/behavior policy toward duplicate logins on the same mount.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthPolicy {
    /// Whether two connections with the same username may coexist.
    pub allow_duplicate_users: bool,

    /// If `true` and duplicates are disallowed, the existing listener is
    /// dropped in favor of the new one rather than rejecting the new one.
    pub drop_existing_listener: bool,
}

/// Per-mount configuration record (`mount_proxy` in the original design).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MountProxy {
    /// Mountpoint name this record applies to.
    pub mount_name: String,

    /// Mount to fall back to when this source terminates.
    pub fallback_mount: Option<String>,

    /// If set, a new source connecting here may steal this mount's
    /// existing listeners on startup (see `source_init`/4.8 hijack-adjacent
    /// "fallback_override" path).
    pub fallback_override: bool,

    /// If admission fails on this mount (bandwidth/listener-count), cascade
    /// to this mount instead of rejecting outright.
    pub fallback_when_full: Option<String>,

    /// Maximum concurrent listeners; `None` = unlimited.
    pub max_listeners: Option<u32>,

    /// Maximum aggregate listener bandwidth in bytes/sec; `None` = unlimited.
    pub max_bandwidth: Option<u64>,

    /// Override of the global queue retention ceiling.
    pub queue_size_limit: Option<u64>,

    /// Override of the global burst retention window.
    pub min_queue_size: Option<u64>,

    /// Override of the global default burst size.
    pub burst_size: Option<u64>,

    /// Ingest throttle: if `8 * incoming_rate > limit_rate`, the source
    /// client sleeps before its next read. `None` = no throttle.
    pub limit_rate: Option<u64>,

    /// Override of the global source silence timeout.
    pub source_timeout_secs: Option<u64>,

    /// Duplicate-login policy for this mount.
    pub auth: AuthPolicy,

    /// Advertised stream metadata (name/description/url/genre/bitrate),
    /// passed through to the Format adapter and any out-of-scope YP
    /// publisher; never interpreted by the core.
    pub stream_name: Option<String>,
    pub stream_description: Option<String>,
    pub stream_url: Option<String>,
    pub stream_genre: Option<String>,
    pub bitrate: Option<u32>,

    /// MIME type / subtype advertised to listeners and the YP directory
    /// (e.g. `"audio"` / `"mpeg"`); never interpreted by the core.
    pub content_type: Option<String>,
    pub content_subtype: Option<String>,

    /// If `true`, omitted from the out-of-scope YP/status directory listing.
    pub hidden: bool,

    /// Whether this mount is offered to the out-of-scope YP directory at all.
    pub yp_public: bool,

    /// Maximum source connection lifetime in seconds before forced teardown;
    /// `None` = unbounded.
    pub max_stream_duration_secs: Option<u64>,

    /// Maximum per-listener connection lifetime in seconds; `None` = unbounded.
    pub max_listener_duration_secs: Option<u64>,

    /// Path (relative to `webroot_dir`) the raw incoming stream is
    /// teed to; opening and writing the file is the hosting
    /// application's job, handed to `Source::dump_file`.
    pub dumpfile: Option<String>,

    /// Path to a short audio clip played to a listener before the live
    /// queue; surfaced on `Source::intro_file`, played by the hosting
    /// application.
    pub intro_filename: Option<String>,

    /// Opaque handle identifying an on-connect hook to invoke (e.g. a
    /// script path); execution is entirely the hosting application's
    /// responsibility, wired through `Source::on_connect`.
    pub on_connect: Option<String>,

    /// Opaque handle identifying an on-disconnect hook, analogous to
    /// `on_connect`.
    pub on_disconnect: Option<String>,

    /// Shared secret required of relay/slave sources on this mount;
    /// `None` disables cluster authentication for it.
    pub cluster_password: Option<String>,

    /// Seconds a mountpoint is held reserved (refusing new sources) after
    /// its last source disconnects, before another may claim it.
    pub wait_time_secs: Option<u64>,
}

impl MountProxy {
    /// Validates this mount's configuration in isolation.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.queue_size_limit {
            return Err("queue_size_limit must be >= 1".to_string());
        }
        if let Some(0) = self.min_queue_size {
            return Err("min_queue_size must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_config_default_is_valid() {
        let config = GlobalConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn global_config_rejects_zero_queue_size_limit() {
        let mut config = GlobalConfig::default();
        config.queue_size_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mount_overrides_fall_back_to_global_defaults() {
        let mut config = GlobalConfig::default();
        config.mounts.insert(
            "/live.ogg".to_string(),
            MountProxy {
                mount_name: "/live.ogg".to_string(),
                burst_size: Some(1000),
                ..Default::default()
            },
        );
        assert_eq!(config.burst_size_for("/live.ogg"), 1000);
        assert_eq!(config.queue_size_limit_for("/live.ogg"), config.queue_size_limit);
        assert_eq!(config.burst_size_for("/unknown.ogg"), config.burst_size);
    }

    #[test]
    fn invalid_mount_override_fails_global_validate() {
        let mut config = GlobalConfig::default();
        config.mounts.insert(
            "/live.ogg".to_string(),
            MountProxy {
                min_queue_size: Some(0),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }
}
