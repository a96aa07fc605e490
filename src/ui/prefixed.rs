//! UI decorator that prefixes every line with a target name.

use std::sync::Arc;

use super::{ReadCloser, Ui, UiError};

/// Wraps another UI and prefixes output with `target: `.
pub struct PrefixedUi {
    target: String,
    inner: Arc<dyn Ui>,
}

impl PrefixedUi {
    /// Creates a prefixing wrapper around `inner`.
    #[must_use]
    pub fn new(target: impl Into<String>, inner: Arc<dyn Ui>) -> Self {
        Self {
            target: target.into(),
            inner,
        }
    }

    fn prefixed(&self, message: &str) -> String {
        format!("{}: {message}", self.target)
    }
}

impl Ui for PrefixedUi {
    fn say(&self, message: &str) {
        self.inner.say(&self.prefixed(message));
    }

    fn message(&self, message: &str) {
        self.inner.message(&self.prefixed(message));
    }

    fn error(&self, message: &str) {
        self.inner.error(&self.prefixed(message));
    }

    fn machine(&self, event_type: &str, args: &[&str]) {
        self.inner.machine(event_type, args);
    }

    fn ask(&self, query: &str) -> Result<String, UiError> {
        self.inner.ask(&self.prefixed(query))
    }

    fn track_progress(
        &self,
        label: &str,
        current: u64,
        total: u64,
        stream: Box<dyn ReadCloser>,
    ) -> Box<dyn ReadCloser> {
        self.inner
            .track_progress(&self.prefixed(label), current, total, stream)
    }
}
