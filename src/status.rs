//! Fire-and-forget progress reporting.
//!
//! The rewrite pass posts [`StatusItem`]s to a [`StatusSink`] and never waits
//! for a consumer. The CLI drains an unbounded crossbeam channel on a worker
//! thread; tests and library callers that do not care use [`NullStatus`].

use crossbeam_channel::Sender;

/// Progress value of the terminal success item. Kept below 100 so that a
/// consumer can tell "done" from "almost done" by the text alone.
pub const COMPLETED_PROGRESS: f64 = 99.99;

/// One status record. Every field is optional; consumers keep the previous
/// value of a field that is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusItem {
    pub left: Option<String>,
    pub right: Option<String>,
    pub progress: Option<f64>,
}

impl StatusItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_left<S: Into<String>>(mut self, left: S) -> Self {
        self.left = Some(left.into());
        self
    }

    pub fn with_right<S: Into<String>>(mut self, right: S) -> Self {
        self.right = Some(right.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 100.0));
        self
    }
}

/// Destination for status records.
pub trait StatusSink {
    fn post(&self, item: StatusItem);
}

impl StatusSink for Sender<StatusItem> {
    fn post(&self, item: StatusItem) {
        // a dropped receiver only means nobody is listening
        let _ = self.send(item);
    }
}

impl<S: StatusSink + ?Sized> StatusSink for &S {
    fn post(&self, item: StatusItem) {
        (**self).post(item)
    }
}

/// Discards every status record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn post(&self, _item: StatusItem) {}
}
