use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, SyncSummary};

/// Mutable state of one run, owned by the run task.
pub struct SyncSession {
    pub events: EventSink,
    pub summary: SyncSummary,
    cancel: CancellationToken,
    total_planned: u64,
    total_done: u64,
    touched: Vec<PathBuf>,
    touched_set: HashSet<PathBuf>,
    assumed_complete: Vec<PathBuf>,
    sources: HashMap<PathBuf, PathBuf>,
    transformed: Vec<PathBuf>,
    meter: ProgressMeter,
}

impl SyncSession {
    pub fn new(events: EventSink, cancel: CancellationToken, progress_interval: Duration) -> Self {
        Self {
            events,
            summary: SyncSummary::default(),
            cancel,
            total_planned: 0,
            total_done: 0,
            touched: Vec::new(),
            touched_set: HashSet::new(),
            assumed_complete: Vec::new(),
            sources: HashMap::new(),
            transformed: Vec::new(),
            meter: ProgressMeter::new(progress_interval),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_planned(&mut self, total_bytes: u64) {
        self.total_planned = total_bytes;
        self.total_done = 0;
        self.meter.restart();
    }

    pub fn total_planned(&self) -> u64 {
        self.total_planned
    }

    pub fn total_done(&self) -> u64 {
        self.total_done
    }

    /// Accounts for `bytes` just written and emits a throttled progress event.
    pub fn add_done(&mut self, bytes: u64) {
        self.total_done = self.total_done.saturating_add(bytes);
        self.summary.bytes_copied = self.summary.bytes_copied.saturating_add(bytes);
        if let Some((percent, tooltip)) = self.meter.tick(self.total_planned, self.total_done) {
            self.events.progress(percent, tooltip);
        }
    }

    /// Final 100% event, sent regardless of throttling.
    pub fn finish_progress(&mut self) {
        let tooltip = self.meter.describe(self.total_planned, self.total_done);
        self.events.progress(100, tooltip);
    }

    pub fn mark_touched(&mut self, dest: &Path, source: &Path) {
        self.sources.insert(dest.to_path_buf(), source.to_path_buf());
        if self.touched_set.insert(dest.to_path_buf()) {
            self.touched.push(dest.to_path_buf());
        }
    }

    pub fn mark_assumed_complete(&mut self, dest: &Path, source: &Path) {
        self.sources.insert(dest.to_path_buf(), source.to_path_buf());
        if !self.assumed_complete.iter().any(|p| p == dest) {
            self.assumed_complete.push(dest.to_path_buf());
        }
    }

    pub fn touched(&self) -> &[PathBuf] {
        &self.touched
    }

    pub fn assumed_complete(&self) -> &[PathBuf] {
        &self.assumed_complete
    }

    pub fn source_for(&self, dest: &Path) -> Option<&Path> {
        self.sources.get(dest).map(PathBuf::as_path)
    }

    pub fn record_transformed(&mut self, files: Vec<PathBuf>) {
        self.summary.transformed = self.summary.transformed.saturating_add(files.len() as u64);
        self.transformed.extend(files);
    }

    pub fn transformed(&self) -> &[PathBuf] {
        &self.transformed
    }
}

/// Throughput and ETA over the bytes of one copy phase.
#[derive(Debug)]
pub struct ProgressMeter {
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            last_emit: None,
        }
    }

    pub fn restart(&mut self) {
        self.started = Instant::now();
        self.last_emit = None;
    }

    pub fn tick(&mut self, total_planned: u64, total_done: u64) -> Option<(u8, String)> {
        let now = Instant::now();
        if let Some(last) = self.last_emit
            && now.duration_since(last) < self.interval
        {
            return None;
        }
        self.last_emit = Some(now);
        Some((
            percent(total_planned, total_done),
            self.describe(total_planned, total_done),
        ))
    }

    pub fn describe(&self, total_planned: u64, total_done: u64) -> String {
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            total_done as f64 / elapsed
        } else {
            0.0
        };
        let eta = eta_seconds(total_planned, total_done, throughput)
            .map(format_eta)
            .unwrap_or_else(|| "--:--".to_string());
        format!(
            "{} of {}, {}/s, ETA {}",
            human_bytes(total_done),
            human_bytes(total_planned),
            human_bytes(throughput as u64),
            eta
        )
    }
}

pub fn percent(total_planned: u64, total_done: u64) -> u8 {
    if total_planned == 0 {
        return 100;
    }
    ((total_done.min(total_planned) as u128 * 100) / total_planned as u128) as u8
}

/// `(total_planned - total_done) / throughput`, if throughput is known.
pub fn eta_seconds(total_planned: u64, total_done: u64, throughput: f64) -> Option<u64> {
    if throughput <= 0.0 {
        return None;
    }
    Some((total_planned.saturating_sub(total_done) as f64 / throughput).ceil() as u64)
}

fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;

    #[test]
    fn eta_uses_remaining_bytes() {
        assert_eq!(eta_seconds(1000, 400, 100.0), Some(6));
        assert_eq!(eta_seconds(1000, 1000, 100.0), Some(0));
        assert_eq!(eta_seconds(1000, 0, 0.0), None);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(200, 50), 25);
        assert_eq!(format_eta(3725), "1:02:05");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn progress_is_throttled() {
        let (sink, mut rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::from_secs(3600));
        session.set_planned(100);
        session.add_done(10);
        session.add_done(10);

        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::Progress { percent: 10, .. }
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.total_done(), 20);
    }

    #[test]
    fn touched_paths_are_ordered_and_unique() {
        let (sink, _rx) = EventSink::channel();
        let mut session = SyncSession::new(sink, CancellationToken::new(), Duration::ZERO);
        session.mark_touched(Path::new("/d/b"), Path::new("/s/b"));
        session.mark_touched(Path::new("/d/a"), Path::new("/s/a"));
        session.mark_touched(Path::new("/d/b"), Path::new("/s/b"));

        assert_eq!(session.touched(), &[PathBuf::from("/d/b"), PathBuf::from("/d/a")]);
        assert_eq!(session.source_for(Path::new("/d/a")), Some(Path::new("/s/a")));
    }
}
