//! Stream wrapper reporting transfer progress.

use std::io::{self, Read};

use super::ReadCloser;

/// Snapshot of a tracked transfer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgressUpdate {
    /// Label passed to `track_progress`.
    pub label: String,
    /// Bytes transferred so far.
    pub current: u64,
    /// Expected total in bytes; zero when unknown.
    pub total: u64,
}

impl ProgressUpdate {
    /// Completed percentage, or `None` when the total is unknown.
    #[must_use]
    pub fn percent(&self) -> Option<u64> {
        self.current
            .saturating_mul(100)
            .checked_div(self.total)
            .map(|percent| percent.min(100))
    }

    /// Completed tenth (0..=10), or `None` when the total is unknown.
    #[must_use]
    pub fn decile(&self) -> Option<u64> {
        self.percent().and_then(|percent| percent.checked_div(10))
    }
}

type Report = Box<dyn FnMut(&ProgressUpdate) + Send>;

/// Proxies reads and closes of an inner stream while reporting progress.
pub struct ProgressReader {
    inner: Box<dyn ReadCloser>,
    update: ProgressUpdate,
    report: Report,
    closed: bool,
}

impl ProgressReader {
    /// Wraps `inner`, calling `report` after every successful read.
    #[must_use]
    pub fn new(
        label: &str,
        current: u64,
        total: u64,
        inner: Box<dyn ReadCloser>,
        report: impl FnMut(&ProgressUpdate) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            update: ProgressUpdate {
                label: label.to_owned(),
                current,
                total,
            },
            report: Box::new(report),
            closed: false,
        }
    }

    /// Wraps `inner`, calling `report` only when another tenth completes.
    #[must_use]
    pub fn by_decile(
        label: &str,
        current: u64,
        total: u64,
        inner: Box<dyn ReadCloser>,
        mut report: impl FnMut(&ProgressUpdate) + Send + 'static,
    ) -> Self {
        let mut last = ProgressUpdate {
            label: label.to_owned(),
            current,
            total,
        }
        .decile();
        Self::new(label, current, total, inner, move |update| {
            let decile = update.decile();
            if decile.is_some() && decile > last {
                last = decile;
                report(update);
            }
        })
    }

    /// Returns the progress observed so far.
    #[must_use]
    pub const fn progress(&self) -> &ProgressUpdate {
        &self.update
    }
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            let advanced = u64::try_from(read).unwrap_or(u64::MAX);
            self.update.current = self.update.current.saturating_add(advanced);
            (self.report)(&self.update);
        }
        Ok(read)
    }
}

impl ReadCloser for ProgressReader {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close()
    }
}
