//! Plain pass-through UI writing to a pair of byte sinks.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ProgressReader, ReadCloser, Ui, UiError};

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// UI that writes status lines to `out` and errors to `err`.
///
/// Prompts are only supported when an input reader is attached.
pub struct BasicUi {
    out: Sink,
    err: Sink,
    input: Option<Mutex<Box<dyn BufRead + Send>>>,
}

impl BasicUi {
    /// Creates a non-interactive UI over the given sinks.
    #[must_use]
    pub fn new(out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
            err: Arc::new(Mutex::new(Box::new(err))),
            input: None,
        }
    }

    /// Creates an interactive UI bound to the process's standard streams.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr()).with_input(BufReader::new(io::stdin()))
    }

    /// Attaches a reader used to answer prompts.
    #[must_use]
    pub fn with_input(mut self, input: impl BufRead + Send + 'static) -> Self {
        self.input = Some(Mutex::new(Box::new(input)));
        self
    }

    fn write_line(sink: &Sink, line: &str) {
        let mut target = sink.lock();
        writeln!(target, "{line}").ok();
        target.flush().ok();
    }
}

impl Ui for BasicUi {
    fn say(&self, message: &str) {
        tracing::debug!(target: "kiln::ui", "say: {message}");
        Self::write_line(&self.out, &format!("==> {message}"));
    }

    fn message(&self, message: &str) {
        tracing::debug!(target: "kiln::ui", "message: {message}");
        Self::write_line(&self.out, &format!("    {message}"));
    }

    fn error(&self, message: &str) {
        tracing::debug!(target: "kiln::ui", "error: {message}");
        Self::write_line(&self.err, &format!("==> {message}"));
    }

    fn machine(&self, event_type: &str, args: &[&str]) {
        tracing::debug!(target: "kiln::ui", event_type, ?args, "machine event");
    }

    fn ask(&self, query: &str) -> Result<String, UiError> {
        let Some(input) = self.input.as_ref() else {
            return Err(UiError::Unsupported);
        };
        {
            let mut out = self.out.lock();
            write!(out, "{query} ").map_err(|err| UiError::Io(err.to_string()))?;
            out.flush().map_err(|err| UiError::Io(err.to_string()))?;
        }
        let mut line = String::new();
        let read = input
            .lock()
            .read_line(&mut line)
            .map_err(|err| UiError::Io(err.to_string()))?;
        if read == 0 {
            return Err(UiError::Io(String::from("end of input")));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }

    fn track_progress(
        &self,
        label: &str,
        current: u64,
        total: u64,
        stream: Box<dyn ReadCloser>,
    ) -> Box<dyn ReadCloser> {
        let out = Arc::clone(&self.out);
        Box::new(ProgressReader::by_decile(
            label,
            current,
            total,
            stream,
            move |update| {
                let percent = update.percent().unwrap_or(0);
                let line = format!(
                    "    {}: {percent}% ({}/{} bytes)",
                    update.label, update.current, update.total
                );
                Self::write_line(&out, &line);
            },
        ))
    }
}
