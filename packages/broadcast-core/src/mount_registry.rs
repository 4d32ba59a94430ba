//! The mountpoint table: name → active source, plus fallback resolution.
//!
//! Mirrors the original's flat mount-name lookup, but resolves fallback
//! chains (`fallback_mount` hops followed when a source has died or is
//! full) as an explicit, depth-bounded walk rather than recursion, so a
//! misconfigured cycle fails closed instead of overflowing a stack.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{BroadcastError, BroadcastResult};
use crate::protocol_constants::MAX_FALLBACK_DEPTH;
use crate::source::Source;

/// Live mountpoint table.
#[derive(Default)]
pub struct MountRegistry {
    mounts: DashMap<String, Arc<Source>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            mounts: DashMap::new(),
        }
    }

    /// Reserves `mount_name` for `source`, failing if it is already
    /// occupied by a different, still-running source. Callers wanting to
    /// hijack an existing source must go through
    /// [`crate::source::source_swap_client`] first and then call
    /// [`Self::replace`].
    pub fn reserve(&self, mount_name: &str, source: Arc<Source>) -> BroadcastResult<()> {
        match self.mounts.entry(mount_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                if e.get().is_running() {
                    return Err(BroadcastError::MountInUse(mount_name.to_string()));
                }
                drop(e);
                self.mounts.insert(mount_name.to_string(), source);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(source);
                Ok(())
            }
        }
    }

    /// Unconditionally installs `source` on `mount_name`, displacing
    /// whatever was there. Used after a successful hijack handshake.
    pub fn replace(&self, mount_name: &str, source: Arc<Source>) {
        self.mounts.insert(mount_name.to_string(), source);
    }

    pub fn remove(&self, mount_name: &str) -> Option<Arc<Source>> {
        self.mounts.remove(mount_name).map(|(_, v)| v)
    }

    /// Looks up `mount_name` directly, without following any fallback
    /// chain. A template mount name never matches a concrete connection,
    /// even if (mis)configured with a source reserved under that literal
    /// name.
    pub fn find_raw(&self, mount_name: &str) -> Option<Arc<Source>> {
        if Self::is_mount_template(mount_name) {
            return None;
        }
        self.mounts.get(mount_name).map(|e| e.clone())
    }

    /// Resolves `mount_name` to a running source, following
    /// `fallback_mount` hops (via the supplied resolver, since the
    /// fallback target is per-mount configuration, not queryable from
    /// `Source` itself) up to [`MAX_FALLBACK_DEPTH`] times.
    ///
    /// Returns [`BroadcastError::FallbackChainTooDeep`] if the chain
    /// doesn't bottom out in a running source within the depth budget, and
    /// [`BroadcastError::MountNotFound`] if a hop in the chain names a
    /// mount with no source and no further fallback.
    pub fn find_with_fallback(
        &self,
        mount_name: &str,
        fallback_of: impl Fn(&str) -> Option<String>,
    ) -> BroadcastResult<Arc<Source>> {
        let mut current = mount_name.to_string();
        for _ in 0..MAX_FALLBACK_DEPTH {
            if let Some(source) = self.find_raw(&current) {
                if source.is_available() {
                    return Ok(source);
                }
            }
            match fallback_of(&current) {
                Some(next) if next != current => current = next,
                _ => return Err(BroadcastError::MountNotFound(mount_name.to_string())),
            }
        }
        Err(BroadcastError::FallbackChainTooDeep(mount_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Sum of every live source's current outgoing rate, used by the
    /// admission path's server-wide `max_bandwidth` check (§4.4 step 2).
    pub fn total_outgoing_bandwidth(&self) -> u64 {
        self.mounts
            .iter()
            .filter(|e| e.value().is_running())
            .map(|e| e.value().out_bitrate.rate())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Mount names whose pattern makes them templates rather than concrete
    /// mountpoints — any `*` or `?` glob character — used by
    /// `source_recheck_mounts` to skip them when scanning for stale
    /// entries. `[` is deliberately excluded: here it marks a bracketed
    /// bitrate hint (`/stream[128]`, §4.4/§6), a concrete mount name, not a
    /// glob.
    pub fn is_mount_template(mount_name: &str) -> bool {
        mount_name.contains('*') || mount_name.contains('?')
    }

    /// Drops any entry whose source is no longer running, has no attached
    /// listeners, and has outlasted its `wait_time` post-disconnect hold —
    /// the periodic sweep described alongside `source_recheck_mounts`.
    pub fn recheck_mounts(&self, now_ms: u64) {
        let stale: Vec<String> = self
            .mounts
            .iter()
            .filter(|e| {
                !Self::is_mount_template(e.key())
                    && !e.value().is_running()
                    && e.value().listener_count() == 0
                    && e.value().wait_time_elapsed(now_ms)
            })
            .map(|e| e.key().clone())
            .collect();
        for name in stale {
            self.mounts.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, FormatType};
    use crate::listener::Listener;

    struct StubFormat;
    impl Format for StubFormat {
        fn format_type(&self) -> FormatType {
            FormatType("ogg")
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

    fn source() -> Arc<Source> {
        Arc::new(Source::new(
            "/live.ogg",
            Box::new(StubFormat),
            1_000_000,
            65_536,
            65_536,
            10,
            0,
        ))
    }

    #[test]
    fn reserve_then_find_raw_round_trips() {
        let reg = MountRegistry::new();
        let s = source();
        reg.reserve("/live.ogg", s.clone()).unwrap();
        assert!(reg.find_raw("/live.ogg").is_some());
    }

    #[test]
    fn find_raw_never_matches_a_template_mount() {
        let reg = MountRegistry::new();
        reg.reserve("/shows/*", source()).unwrap();
        assert!(reg.find_raw("/shows/*").is_none());
    }

    #[test]
    fn reserve_rejects_occupied_running_mount() {
        let reg = MountRegistry::new();
        reg.reserve("/live.ogg", source()).unwrap();
        let err = reg.reserve("/live.ogg", source()).unwrap_err();
        assert!(matches!(err, BroadcastError::MountInUse(_)));
    }

    #[test]
    fn find_with_fallback_follows_chain_to_running_source() {
        let reg = MountRegistry::new();
        let fallback_target = source();
        reg.reserve("/backup.ogg", fallback_target).unwrap();

        let dead = source();
        dead.set_running(false);
        reg.reserve("/live.ogg", dead).unwrap();

        let resolved = reg
            .find_with_fallback("/live.ogg", |m| {
                if m == "/live.ogg" {
                    Some("/backup.ogg".to_string())
                } else {
                    None
                }
            })
            .unwrap();
        assert!(resolved.is_running());
    }

    #[test]
    fn find_with_fallback_detects_cycles_as_too_deep() {
        let reg = MountRegistry::new();
        let err = reg
            .find_with_fallback("/a", |m| {
                Some(if m == "/a" { "/b" } else { "/a" }.to_string())
            })
            .unwrap_err();
        assert!(matches!(err, BroadcastError::FallbackChainTooDeep(_)));
    }

    #[test]
    fn recheck_mounts_drops_dead_sources_with_no_listeners() {
        let reg = MountRegistry::new();
        let dead = source();
        dead.set_running(false);
        reg.reserve("/stale.ogg", dead).unwrap();
        reg.recheck_mounts(0);
        assert!(reg.find_raw("/stale.ogg").is_none());
    }

    #[test]
    fn recheck_mounts_respects_wait_time_hold() {
        let reg = MountRegistry::new();
        let dead = source();
        dead.set_running(false);
        dead.mark_disconnected(1_000);
        dead.set_wait_time_secs(30);
        reg.reserve("/stale.ogg", dead).unwrap();

        reg.recheck_mounts(10_000);
        assert!(reg.find_raw("/stale.ogg").is_some());

        reg.recheck_mounts(31_000);
        assert!(reg.find_raw("/stale.ogg").is_none());
    }
}
