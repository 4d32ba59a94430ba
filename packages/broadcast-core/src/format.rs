//! The `Format` adapter: the sole interface to codec-specific logic.
//!
//! Everything format-specific — demuxing ingress bytes, building HTTP
//! response preambles, actually writing bytes to a listener socket — lives
//! behind this trait. The streaming core never branches on codec type; it
//! only calls through `Format`. This mirrors the narrow-interface style
//! this codebase uses at every platform/codec seam (e.g. `IpDetector`,
//! `TaskSpawner` in the surrounding pack).

use crate::error::BroadcastResult;
use crate::listener::Listener;
use crate::refbuf::RefBuf;
use crate::source::Source;

/// A stable identifier for a codec/container type, used only to decide
/// whether a hijack or handoff target is compatible (§4.3, §4.8) — never
/// to drive codec-specific behavior in the core itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatType(pub &'static str);

/// Per-codec plugin. Implementations are provided by the hosting
/// application; this crate only depends on the trait.
pub trait Format: Send + Sync {
    /// This adapter's format type, used for hijack/fallback compatibility
    /// checks.
    fn format_type(&self) -> FormatType;

    /// Reads from the source's ingress socket and frames the next chunk of
    /// audio into a `RefBuf`. Returns `Ok(None)` on a short/empty read
    /// (not an error — the source client simply reschedules). Sets
    /// `SYNC_POINT` on the returned buffer when it starts a codec frame
    /// boundary safe for mid-stream join.
    fn get_buffer(&mut self, source: &Source) -> BroadcastResult<Option<RefBuf>>;

    /// Sends `listener.refbuf()[pos..]` over the listener's socket.
    /// Returns the number of bytes actually written; must tolerate partial
    /// writes (returns `< remaining` rather than blocking).
    fn write_buf_to_client(&self, listener: &Listener) -> BroadcastResult<usize>;

    /// Builds the per-listener HTTP response headers and any format
    /// preamble, installing it as the listener's current `refbuf` (which
    /// may be a linked chain — see `HAS_INTRO_CONTENT`).
    fn create_client_data(&self, listener: &Listener) -> BroadcastResult<RefBuf>;

    /// Applies mount configuration (bitrate, name, description, ...) that
    /// affects how this adapter frames or describes the stream.
    fn apply_settings(&mut self, mount: &crate::config::MountProxy);

    /// Writes a queued buffer to the append-only dump file, if configured.
    /// A no-op default since dump-file I/O is out of scope for the core.
    fn write_buf_to_file(&self, _source: &Source, _buf: &RefBuf) -> BroadcastResult<()> {
        Ok(())
    }
}
