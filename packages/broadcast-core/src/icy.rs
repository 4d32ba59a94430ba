//! ICY (Shoutcast) metadata sideband for MP3/AAC listeners.
//!
//! Icecast/Shoutcast interleave `StreamTitle` metadata blocks into the
//! audio byte stream itself, every [`crate::protocol_constants::ICY_METAINT`]
//! bytes, rather than using a side channel. This module is stateless
//! formatting plus a stateful per-listener injector that tracks where the
//! next block is due.

use bytes::{Bytes, BytesMut};

pub use crate::protocol_constants::ICY_METAINT;

/// Now-playing metadata surfaced to listeners via `StreamTitle`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub artist: Option<String>,
    pub title: Option<String>,
}

/// Stateless ICY metadata block formatting.
pub struct IcyFormatter;

impl IcyFormatter {
    /// Formats metadata into an ICY metadata block.
    ///
    /// Per the ICY convention, a single zero byte means "no change". Other-
    /// wise the first byte is the number of 16-byte blocks that follow,
    /// and the `StreamTitle='...';` string is padded with zeros to fill
    /// them.
    #[must_use]
    pub fn format_metadata(metadata: &StreamMetadata) -> Vec<u8> {
        let title = match (&metadata.artist, &metadata.title) {
            (Some(a), Some(t)) => format!("{a} - {t}"),
            (None, Some(t)) => t.clone(),
            (Some(a), None) => a.clone(),
            (None, None) => return vec![0],
        };
        if title.is_empty() {
            return vec![0];
        }

        // Single quotes delimit the StreamTitle value; swap in the
        // Unicode lookalike rather than backslash-escaping, since several
        // popular clients render a backslash escape literally.
        let title = title.replace('\'', "\u{2019}");
        let meta_str = format!("StreamTitle='{title}';");
        let meta_bytes = meta_str.as_bytes();

        let num_blocks = meta_bytes.len().div_ceil(16);
        let padded_len = num_blocks * 16;

        let mut result = Vec::with_capacity(padded_len + 1);
        result.push(num_blocks as u8);
        result.extend_from_slice(meta_bytes);
        result.resize(padded_len + 1, 0);
        result
    }
}

/// Stateful per-listener injector: tracks bytes since the last metadata
/// block and splices a fresh one in at each `ICY_METAINT` boundary.
/// Caches the formatted block so unchanged metadata doesn't reformat on
/// every chunk.
pub struct IcyMetadataInjector {
    bytes_since_meta: usize,
    cached_metadata: Vec<u8>,
    last_metadata: StreamMetadata,
    output_buffer: BytesMut,
}

impl IcyMetadataInjector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_since_meta: 0,
            cached_metadata: vec![0],
            last_metadata: StreamMetadata::default(),
            output_buffer: BytesMut::new(),
        }
    }

    fn update_metadata_cache(&mut self, metadata: &StreamMetadata) -> usize {
        if &self.last_metadata != metadata {
            self.cached_metadata = IcyFormatter::format_metadata(metadata);
            self.last_metadata = metadata.clone();
        }
        self.cached_metadata.len()
    }

    /// Splices ICY metadata blocks into `chunk` at the correct byte
    /// offsets, returning the audio bytes the listener should actually be
    /// sent for this pass.
    pub fn inject(&mut self, chunk: &[u8], metadata: &StreamMetadata) -> Bytes {
        let meta_len = self.update_metadata_cache(metadata);

        let total_bytes = self.bytes_since_meta + chunk.len();
        let num_insertions = total_bytes / ICY_METAINT;
        self.output_buffer
            .reserve(chunk.len() + num_insertions * meta_len);

        let mut remaining = chunk;
        while !remaining.is_empty() {
            let bytes_to_meta = ICY_METAINT - self.bytes_since_meta;
            if remaining.len() < bytes_to_meta {
                self.output_buffer.extend_from_slice(remaining);
                self.bytes_since_meta += remaining.len();
                break;
            }
            self.output_buffer
                .extend_from_slice(&remaining[..bytes_to_meta]);
            self.output_buffer.extend_from_slice(&self.cached_metadata);
            remaining = &remaining[bytes_to_meta..];
            self.bytes_since_meta = 0;
        }

        self.output_buffer.split().freeze()
    }

    #[must_use]
    pub fn bytes_since_meta(&self) -> usize {
        self.bytes_since_meta
    }
}

impl Default for IcyMetadataInjector {
    fn default() -> Self {
        Self::new()
    }
}
