//! Streaming text assembly.
//!
//! The buffer is append-only until it is committed (copied out and cleared)
//! or discarded. Emission cadence is throttled by the controller's debounce
//! timer; the buffer itself is never truncated.

#[derive(Debug, Default)]
pub struct TextAssembler {
    buffer: String,
    /// Buffer changed since the last snapshot.
    dirty: bool,
}

impl TextAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns `false` for empty fragments.
    pub fn append(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() {
            return false;
        }
        self.buffer.push_str(fragment);
        self.dirty = true;
        true
    }

    /// Current buffer contents, if they changed since the last snapshot.
    pub fn snapshot(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.buffer.clone())
    }

    /// Take the buffered text as a committed segment and clear the buffer.
    pub fn commit(&mut self) -> Option<String> {
        self.dirty = false;
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    /// Discard buffered text.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.dirty = false;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}
