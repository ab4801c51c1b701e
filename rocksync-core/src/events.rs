use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

/// Messages a sync run sends to whoever started it. The stream is one-way:
/// the run never waits on its receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Log(String),
    Status(String),
    Progress { percent: u8, tooltip: String },
    Notice(String),
    ReindexDestination(PathBuf),
    Finished(SyncOutcome),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub planned: u64,
    pub copied: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_copied: u64,
    pub verified: u64,
    pub mismatches: u64,
    pub auto_repaired: u64,
    pub failed_repairs: u64,
    pub deleted: u64,
    pub delete_failed: u64,
    pub transformed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Cancelled,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed with errors",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub status: RunStatus,
    pub summary: SyncSummary,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn finished(summary: SyncSummary) -> Self {
        let status = if summary.failed > 0 || summary.failed_repairs > 0 || summary.delete_failed > 0
        {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        Self {
            status,
            summary,
            error: None,
        }
    }

    pub fn cancelled(summary: SyncSummary) -> Self {
        Self {
            status: RunStatus::Cancelled,
            summary,
            error: None,
        }
    }

    pub fn failed(summary: SyncSummary, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            summary,
            error: Some(error.into()),
        }
    }

    /// Process-style exit code: zero only for a clean run.
    pub fn code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::CompletedWithErrors => 1,
            RunStatus::Failed => 2,
            RunStatus::Cancelled => 130,
        }
    }
}

/// Sending half of the event stream. A dropped receiver silences the sink
/// instead of failing the run.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.send(SyncEvent::Log(line.into()));
    }

    pub fn status(&self, text: impl Into<String>) {
        self.send(SyncEvent::Status(text.into()));
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.send(SyncEvent::Notice(text.into()));
    }

    pub fn progress(&self, percent: u8, tooltip: impl Into<String>) {
        self.send(SyncEvent::Progress {
            percent: percent.min(100),
            tooltip: tooltip.into(),
        });
    }

    pub fn added(&self, relative: &str) {
        self.log(format!("+ {relative}"));
    }

    pub fn resumed(&self, relative: &str) {
        self.log(format!("~ {relative}"));
    }

    pub fn deleted(&self, relative: &str) {
        self.log(format!("- {relative}"));
    }

    pub fn error(&self, relative: &str, err: impl fmt::Display) {
        self.log(format!("! {relative}: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_formats_markers_and_survives_closed_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.added("Album/01.flac");
        sink.error("Album/02.flac", "disk full");
        sink.progress(140, "almost");

        assert_eq!(rx.try_recv().unwrap(), SyncEvent::Log("+ Album/01.flac".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::Log("! Album/02.flac: disk full".into())
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::Progress {
                percent: 100,
                tooltip: "almost".into()
            }
        );

        drop(rx);
        sink.status("nobody listens");
    }

    #[test]
    fn outcome_codes_reflect_errors() {
        let clean = SyncOutcome::finished(SyncSummary::default());
        assert_eq!(clean.code(), 0);

        let summary = SyncSummary {
            failed_repairs: 1,
            ..SyncSummary::default()
        };
        assert_eq!(SyncOutcome::finished(summary).status, RunStatus::CompletedWithErrors);
        assert_ne!(SyncOutcome::failed(summary, "boom").code(), 0);
        assert_ne!(SyncOutcome::cancelled(summary).code(), 0);
    }
}
