//! Output sink collaborator for job output.

use crate::image::{ProgressChunk, parse_progress};

/// Append-only sink for a job's output.
pub trait OutputSink: Send + Sync {
    fn write(&self, text: &str);

    /// Parse a raw progress chunk from the image tooling, append its readable
    /// lines and hand the parsed events back to the caller.
    fn write_chunk(&self, raw: &[u8]) -> Vec<ProgressChunk> {
        let chunks = parse_progress(raw);
        for chunk in &chunks {
            if let Some(text) = chunk.display_text() {
                self.write(&text);
            }
        }
        chunks
    }
}
