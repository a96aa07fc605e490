//! Machine-readable UI emitting one comma separated event per line.
//!
//! Each line has the shape `timestamp,target,type,data...`. Commas inside a
//! field are replaced by `%!(KILN_COMMA)` and line breaks are escaped so every
//! event stays on one line.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::{ProgressReader, ReadCloser, Ui, UiError};

const COMMA_ESCAPE: &str = "%!(KILN_COMMA)";

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// UI for tooling integrations; never prompts.
pub struct MachineReadableUi {
    target: String,
    out: Sink,
}

impl MachineReadableUi {
    /// Creates a machine-readable UI writing events for `target` to `out`.
    #[must_use]
    pub fn new(target: impl Into<String>, out: impl Write + Send + 'static) -> Self {
        Self {
            target: target.into(),
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    fn emit(out: &Sink, target: &str, event_type: &str, args: &[&str]) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let mut fields = vec![
            timestamp.to_string(),
            escape(target),
            escape(event_type),
        ];
        fields.extend(args.iter().map(|arg| escape(arg)));

        let mut sink = out.lock();
        writeln!(sink, "{}", fields.join(",")).ok();
        sink.flush().ok();
    }
}

fn escape(field: &str) -> String {
    field
        .replace(',', COMMA_ESCAPE)
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

impl Ui for MachineReadableUi {
    fn say(&self, message: &str) {
        Self::emit(&self.out, &self.target, "ui", &["say", message]);
    }

    fn message(&self, message: &str) {
        Self::emit(&self.out, &self.target, "ui", &["message", message]);
    }

    fn error(&self, message: &str) {
        Self::emit(&self.out, &self.target, "ui", &["error", message]);
    }

    fn machine(&self, event_type: &str, args: &[&str]) {
        Self::emit(&self.out, &self.target, event_type, args);
    }

    fn ask(&self, _query: &str) -> Result<String, UiError> {
        Err(UiError::Unsupported)
    }

    fn track_progress(
        &self,
        label: &str,
        current: u64,
        total: u64,
        stream: Box<dyn ReadCloser>,
    ) -> Box<dyn ReadCloser> {
        let out = Arc::clone(&self.out);
        let target = self.target.clone();
        Box::new(ProgressReader::by_decile(
            label,
            current,
            total,
            stream,
            move |update| {
                let current_text = update.current.to_string();
                let total_text = update.total.to_string();
                Self::emit(
                    &out,
                    &target,
                    "progress",
                    &[update.label.as_str(), current_text.as_str(), total_text.as_str()],
                );
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SharedBuffer;

    fn fields(line: &str) -> Vec<String> {
        line.split(',').skip(1).map(str::to_owned).collect()
    }

    #[test]
    fn say_is_wrapped_in_ui_event() {
        let out = SharedBuffer::new();
        let ui = MachineReadableUi::new("scaleway", out.clone());

        ui.say("Creating machine...");

        assert_eq!(
            fields(out.contents().trim_end()),
            vec!["scaleway", "ui", "say", "Creating machine..."]
        );
    }

    #[test]
    fn commas_and_newlines_are_escaped() {
        let out = SharedBuffer::new();
        let ui = MachineReadableUi::new("scaleway", out.clone());

        ui.machine("artifact", &["img-1,img-2", "line\nbreak"]);

        let contents = out.contents();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("artifact,img-1%!(KILN_COMMA)img-2,line\\nbreak"));
    }

    #[test]
    fn ask_is_unsupported() {
        let ui = MachineReadableUi::new("scaleway", SharedBuffer::new());
        assert_eq!(ui.ask("continue?"), Err(UiError::Unsupported));
    }
}
