//! Append-only job output log.

use std::sync::{PoisonError, RwLock};

/// Position of a reader in an [`OutputBuffer`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutputCursor(usize);

/// Append-only log of output chunks. One writer at a time, any number of
/// concurrent readers, each with its own cursor.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    chunks: RwLock<Vec<String>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
    }

    /// Chunks written since `cursor`, and the cursor to continue from.
    pub fn read_from(&self, cursor: OutputCursor) -> (Vec<String>, OutputCursor) {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let start = cursor.0.min(chunks.len());
        (chunks[start..].to_vec(), OutputCursor(chunks.len()))
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .concat()
    }

    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
