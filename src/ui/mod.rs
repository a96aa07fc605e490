//! Operator-facing output.
//!
//! Every message a build shows to the operator goes through [`Ui`]. Steps,
//! hooks and the runner never write to stdout or stderr directly; diagnostics
//! that are not meant for the operator go through `tracing` instead.

use std::io::{self, Read};

use thiserror::Error;

mod basic;
mod machine;
mod prefixed;
mod progress;

pub use basic::BasicUi;
pub use machine::MachineReadableUi;
pub use prefixed::PrefixedUi;
pub use progress::{ProgressReader, ProgressUpdate};

/// Errors raised by UI implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UiError {
    /// Raised by non-interactive variants when input is requested.
    #[error("this UI cannot prompt for input")]
    Unsupported,
    /// Raised when reading the operator's answer fails.
    #[error("failed to read input: {0}")]
    Io(String),
}

/// Byte stream that can be explicitly closed.
pub trait ReadCloser: Read + Send {
    /// Releases the underlying resource.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised while closing.
    fn close(&mut self) -> io::Result<()>;
}

/// Progress reporting surface shared by steps, hooks and the runner.
pub trait Ui: Send + Sync {
    /// Emits a top-level status line.
    fn say(&self, message: &str);

    /// Emits a detail line belonging to the previous status.
    fn message(&self, message: &str);

    /// Emits an error the operator must see.
    fn error(&self, message: &str);

    /// Emits a structured event for tooling.
    fn machine(&self, event_type: &str, args: &[&str]);

    /// Asks the operator a question and returns the answer.
    ///
    /// # Errors
    ///
    /// Returns [`UiError::Unsupported`] when the UI is not interactive.
    fn ask(&self, query: &str) -> Result<String, UiError>;

    /// Wraps `stream` so reads report progress towards `total` bytes.
    fn track_progress(
        &self,
        label: &str,
        current: u64,
        total: u64,
        stream: Box<dyn ReadCloser>,
    ) -> Box<dyn ReadCloser>;
}
