//! Progress tracking for external tools.
//!
//! Each tool speaks its own tiny grammar: usually one line announcing the total
//! amount of work, then repeated lines reporting how far it got. A
//! [`ProgressGrammar`] is a pair of patterns plus two callbacks turning matches
//! into unit counts; the [`ProgressTracker`] folds the recognised lines into a
//! monotonic [`Progress`] and pushes every change to a sink.

use crate::asset::Progress;
use regex::{Captures, Regex};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives every progress change. Must not block.
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// A recognised line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Total(u64),
    Completed(u64),
}

/// Pluggable line grammar for one external tool.
#[derive(Clone)]
pub struct ProgressGrammar {
    name: &'static str,
    total: Option<Regex>,
    current: Regex,
    initial_total: Option<u64>,
    saw_total: fn(&Captures<'_>) -> Option<u64>,
    saw_progress: fn(&Captures<'_>) -> Option<u64>,
}

impl ProgressGrammar {
    /// Build a grammar from a total pattern, a progress pattern and the two callbacks.
    pub fn new(
        name: &'static str,
        total: Option<&str>,
        current: &str,
        saw_total: fn(&Captures<'_>) -> Option<u64>,
        saw_progress: fn(&Captures<'_>) -> Option<u64>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            total: total.map(Regex::new).transpose()?,
            current: Regex::new(current)?,
            initial_total: None,
            saw_total,
            saw_progress,
        })
    }

    /// Start determinate with a known total (e.g. percentages).
    pub fn with_initial_total(mut self, total: u64) -> Self {
        self.initial_total = Some(total);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Transcoder: `Duration: HH:MM:SS.ff` once, then `out_time_us=<n>` lines.
    /// Units are milliseconds of media time.
    pub fn ffmpeg() -> Self {
        static GRAMMAR: OnceLock<ProgressGrammar> = OnceLock::new();
        GRAMMAR
            .get_or_init(|| {
                ProgressGrammar::new(
                    "ffmpeg",
                    Some(r"Duration:\s*(\d+):(\d{2}):(\d{2})(?:\.(\d+))?"),
                    r"^out_time_(?:us|ms)=(\d+)",
                    duration_ms,
                    |caps| parse_u64(caps, 1).map(|us| us / 1000),
                )
                .expect("static ffmpeg pattern")
            })
            .clone()
    }

    /// Document distiller: `Processing pages N through M.` once, then `Page <k>` lines.
    pub fn ghostscript() -> Self {
        static GRAMMAR: OnceLock<ProgressGrammar> = OnceLock::new();
        GRAMMAR
            .get_or_init(|| {
                ProgressGrammar::new(
                    "ghostscript",
                    Some(r"Processing pages (\d+) through (\d+)"),
                    r"^Page (\d+)",
                    |caps| parse_u64(caps, 2),
                    |caps| parse_u64(caps, 1),
                )
                .expect("static ghostscript pattern")
            })
            .clone()
    }

    /// Any tool printing `NN%` or `NN.N%`. Units are tenths of a percent.
    pub fn percent() -> Self {
        static GRAMMAR: OnceLock<ProgressGrammar> = OnceLock::new();
        GRAMMAR
            .get_or_init(|| {
                ProgressGrammar::new(
                    "percent",
                    None,
                    r"(\d{1,3}(?:\.\d+)?)\s*%",
                    |_| None,
                    |caps| {
                        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
                        Some((value * 10.0).round() as u64)
                    },
                )
                .expect("static percent pattern")
                .with_initial_total(1000)
            })
            .clone()
    }

    /// Recognise one line of output.
    pub fn parse_line(&self, line: &str) -> Option<ProgressEvent> {
        if let Some(total) = &self.total {
            if let Some(caps) = total.captures(line) {
                return (self.saw_total)(&caps).map(ProgressEvent::Total);
            }
        }
        self.current
            .captures(line)
            .and_then(|caps| (self.saw_progress)(&caps))
            .map(ProgressEvent::Completed)
    }
}

impl fmt::Debug for ProgressGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressGrammar")
            .field("name", &self.name)
            .field("total", &self.total.as_ref().map(Regex::as_str))
            .field("current", &self.current.as_str())
            .field("initial_total", &self.initial_total)
            .finish()
    }
}

fn parse_u64(caps: &Captures<'_>, group: usize) -> Option<u64> {
    caps.get(group)?.as_str().parse().ok()
}

fn duration_ms(caps: &Captures<'_>) -> Option<u64> {
    let hours = parse_u64(caps, 1)?;
    let minutes = parse_u64(caps, 2)?;
    let seconds = parse_u64(caps, 3)?;
    // Fractional digits are hundredths in ffmpeg's banner but be lenient.
    let fraction_ms = caps
        .get(4)
        .map(|m| {
            let digits: String = m.as_str().chars().take(3).collect();
            let scale = 10u64.pow(3 - digits.len() as u32);
            digits.parse::<u64>().unwrap_or(0) * scale
        })
        .unwrap_or(0);
    Some(((hours * 60 + minutes) * 60 + seconds) * 1000 + fraction_ms)
}

/// Folds a tool's output lines into progress updates.
pub struct ProgressTracker {
    grammar: ProgressGrammar,
    progress: Progress,
    sink: Option<ProgressSink>,
}

impl ProgressTracker {
    pub fn new(grammar: ProgressGrammar, description: impl Into<String>, sink: ProgressSink) -> Self {
        let progress = match grammar.initial_total {
            Some(total) => Progress::determinate(total, description),
            None => Progress::indeterminate(description),
        };
        Self {
            grammar,
            progress,
            sink: Some(sink),
        }
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Feed one line; returns whether the progress changed and was published.
    pub fn feed_line(&mut self, line: &str) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };
        let changed = match self.grammar.parse_line(line) {
            Some(ProgressEvent::Total(total)) => {
                debug!(grammar = self.grammar.name, total, "progress total");
                self.progress.set_total(total)
            }
            Some(ProgressEvent::Completed(completed)) => self.progress.advance_to(completed),
            None => false,
        };
        if changed {
            sink(self.progress.clone());
        }
        changed
    }

    /// Stop publishing; later lines are ignored.
    pub fn detach(&mut self) {
        self.sink = None;
    }

    /// Consume lines until every sender is gone (the stream hit EOF), then detach.
    pub fn spawn(mut self, mut lines: mpsc::UnboundedReceiver<String>) -> JoinHandle<Progress> {
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                self.feed_line(&line);
            }
            self.detach();
            self.progress
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (ProgressSink, Arc<Mutex<Vec<Progress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = seen.clone();
        let sink: ProgressSink = Arc::new(move |p| store.lock().unwrap().push(p));
        (sink, seen)
    }

    #[test]
    fn test_ffmpeg_grammar() {
        let grammar = ProgressGrammar::ffmpeg();
        assert_eq!(
            grammar.parse_line("  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s"),
            Some(ProgressEvent::Total(62_500))
        );
        assert_eq!(
            grammar.parse_line("out_time_us=31250000"),
            Some(ProgressEvent::Completed(31_250))
        );
        assert_eq!(grammar.parse_line("frame=120"), None);
        assert_eq!(grammar.parse_line("progress=continue"), None);
    }

    #[test]
    fn test_ghostscript_grammar() {
        let grammar = ProgressGrammar::ghostscript();
        assert_eq!(
            grammar.parse_line("Processing pages 1 through 12."),
            Some(ProgressEvent::Total(12))
        );
        assert_eq!(grammar.parse_line("Page 3"), Some(ProgressEvent::Completed(3)));
        assert_eq!(grammar.parse_line("Loading font Helvetica"), None);
    }

    #[test]
    fn test_percent_grammar_starts_determinate() {
        let (sink, seen) = collecting_sink();
        let mut tracker = ProgressTracker::new(ProgressGrammar::percent(), "Quantizing", sink);
        assert!(!tracker.progress().indeterminate);
        assert!(tracker.feed_line("progress: 42.5%"));
        assert_eq!(seen.lock().unwrap().last().unwrap().completed_units, 425);
    }

    #[test]
    fn test_progress_before_total_is_ignored() {
        let (sink, seen) = collecting_sink();
        let mut tracker = ProgressTracker::new(ProgressGrammar::ghostscript(), "Compressing PDF", sink);

        assert!(!tracker.feed_line("Page 2"));
        assert!(tracker.feed_line("Processing pages 1 through 4."));
        assert!(tracker.feed_line("Page 1"));
        assert!(tracker.feed_line("Page 2"));
        // A second total line does not refine again
        assert!(!tracker.feed_line("Processing pages 1 through 99."));
        assert!(tracker.feed_line("Page 9"));

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.total_units, 4);
        assert_eq!(last.completed_units, 4, "clamped to total");
        assert_eq!(last.description, "Compressing PDF");
    }

    #[test]
    fn test_detached_tracker_ignores_lines() {
        let (sink, seen) = collecting_sink();
        let mut tracker = ProgressTracker::new(ProgressGrammar::ghostscript(), "Compressing PDF", sink);
        tracker.feed_line("Processing pages 1 through 4.");
        tracker.detach();
        assert!(!tracker.is_attached());
        assert!(!tracker.feed_line("Page 2"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_tracker_runs_until_eof() {
        let (sink, seen) = collecting_sink();
        let tracker = ProgressTracker::new(ProgressGrammar::ffmpeg(), "Encoding video", sink);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tracker.spawn(rx);

        tx.send("Duration: 00:00:10.00, start: 0.0".to_string()).unwrap();
        tx.send("out_time_us=2500000".to_string()).unwrap();
        tx.send("out_time_us=5000000".to_string()).unwrap();
        drop(tx);

        let final_progress = handle.await.unwrap();
        assert_eq!(final_progress.total_units, 10_000);
        assert_eq!(final_progress.completed_units, 5_000);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_custom_grammar() {
        let grammar = ProgressGrammar::new(
            "frames",
            Some(r"^total frames: (\d+)"),
            r"^frame (\d+)",
            |caps| caps.get(1)?.as_str().parse().ok(),
            |caps| caps.get(1)?.as_str().parse().ok(),
        )
        .unwrap();
        assert_eq!(grammar.parse_line("total frames: 300"), Some(ProgressEvent::Total(300)));
        assert_eq!(grammar.parse_line("frame 12"), Some(ProgressEvent::Completed(12)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_tracker_reports_monotonic_progress(
            total_pages in 1u64..500,
            pages in proptest::collection::vec(0u64..1000, 0..60),
        ) {
            let (sink, seen) = collecting_sink();
            let mut tracker = ProgressTracker::new(ProgressGrammar::ghostscript(), "pdf", sink);
            tracker.feed_line(&format!("Processing pages 1 through {}.", total_pages));
            for page in pages {
                tracker.feed_line(&format!("Page {}", page));
            }

            let seen = seen.lock().unwrap();
            let mut last = 0;
            for progress in seen.iter() {
                prop_assert!(progress.completed_units >= last);
                prop_assert!(progress.completed_units <= progress.total_units);
                last = progress.completed_units;
            }
        }
    }
}
