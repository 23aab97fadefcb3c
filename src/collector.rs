//! Output collector
//!
//! A thread-safe sink shared by every environment of a matrix run. Text is buffered per [`EnvKey`] and rendered
//! to one output stream without interleaving across concurrent environments:
//!
//! - [`StreamMode::Live`]: each `write` goes straight through to the sink. Only safe with a single writer, so the
//!   executor uses it for serial runs.
//! - [`StreamMode::Buffered`]: text is held until [`OutputCollector::suite_report`], which emits the whole buffer
//!   as one contiguous block.
//!
//! Every sink write happens while holding the collector's single mutex, so a block is never split by another
//! environment's output.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use envmatrix_core::{EnvKey, Outcome};
use parking_lot::Mutex;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// How writes reach the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Live,
    Buffered,
}

/// Counts per outcome for a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatrixSummary {
    pub passed: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub skipped: usize,
}

impl MatrixSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Passed => summary.passed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Unresolved => summary.unresolved += 1,
                Outcome::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.unresolved == 0
    }
}

struct CollectorState {
    sink: Box<dyn Write + Send>,
    mode: StreamMode,
    buffers: BTreeMap<EnvKey, String>,
    outcomes: BTreeMap<EnvKey, Outcome>,
    at_line_start: bool,
}

impl CollectorState {
    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.at_line_start = text.ends_with('\n');
        // A closed stdout must not take the run down with it.
        if let Err(e) = self.sink.write_all(text.as_bytes()).and_then(|()| self.sink.flush()) {
            tracing::debug!(error = %e, "output sink write failed");
        }
    }
}

/// Process-wide output sink and result ledger for a matrix run.
pub struct OutputCollector {
    state: Mutex<CollectorState>,
    color: bool,
}

impl OutputCollector {
    pub fn new(sink: Box<dyn Write + Send>, color: bool) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                sink,
                mode: StreamMode::Buffered,
                buffers: BTreeMap::new(),
                outcomes: BTreeMap::new(),
                at_line_start: true,
            }),
            color,
        }
    }

    /// Collector writing to the process's stdout.
    pub fn stdout(color: bool) -> Self {
        Self::new(Box::new(io::stdout()), color)
    }

    pub fn set_mode(&self, mode: StreamMode) {
        self.state.lock().mode = mode;
    }

    /// Append `text` to the stream for `key`.
    pub fn write(&self, key: &EnvKey, text: &str) {
        let mut state = self.state.lock();
        state.buffers.entry(key.clone()).or_default().push_str(text);
        if state.mode == StreamMode::Live {
            state.emit(text);
        }
    }

    /// Write a line that belongs to no particular environment.
    pub fn notice(&self, text: &str) {
        self.state.lock().emit(text);
    }

    /// Record that `key` ended in failure.
    pub fn failed(&self, key: &EnvKey) {
        self.record(key, Outcome::Failed);
    }

    /// Record the terminal outcome for `key`. A later record replaces an earlier one.
    pub fn record(&self, key: &EnvKey, outcome: Outcome) {
        self.state.lock().outcomes.insert(key.clone(), outcome);
    }

    /// Flush `key`'s block (when buffered) followed by its closing summary line.
    ///
    /// Output of a pair that did not fail is dropped afterwards; the final report only repeats failures.
    pub fn suite_report(&self, key: &EnvKey) {
        let mut state = self.state.lock();
        let outcome = state.outcomes.get(key).copied().unwrap_or(Outcome::Skipped);
        let mut block = String::new();
        if state.mode == StreamMode::Buffered {
            if let Some(text) = state.buffers.get(key) {
                block.push_str(text);
            }
        }
        if !block.is_empty() && !block.ends_with('\n') {
            block.push('\n');
        } else if block.is_empty() && !state.at_line_start {
            block.push('\n');
        }
        block.push_str(&render_footer(key, outcome, self.color));
        state.emit(&block);
        if !outcome.is_failure() {
            state.buffers.remove(key);
        }
    }

    /// Everything written for `key` so far.
    pub fn output(&self, key: &EnvKey) -> String {
        self.state.lock().buffers.get(key).cloned().unwrap_or_default()
    }

    /// All recorded outcomes, ordered by key.
    pub fn outcomes(&self) -> Vec<(EnvKey, Outcome)> {
        self.state.lock().outcomes.iter().map(|(k, o)| (k.clone(), *o)).collect()
    }

    /// Write the final report listing every pair's outcome, then the output of each failure.
    pub fn overall_report(&self) {
        let mut state = self.state.lock();
        let report = render_overall(&state.outcomes, &state.buffers, self.color);
        state.emit(&report);
    }
}

fn paint(color: &str, text: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

fn outcome_color(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Passed => GREEN,
        Outcome::Failed | Outcome::Unresolved => RED,
        Outcome::Skipped => YELLOW,
    }
}

/// Closing line for one pair's block.
pub fn render_footer(key: &EnvKey, outcome: Outcome, color: bool) -> String {
    format!(
        "------ {} {} ------\n",
        key,
        paint(outcome_color(outcome), outcome.as_str(), color)
    )
}

/// Final human-readable report.
pub fn render_overall(
    outcomes: &BTreeMap<EnvKey, Outcome>,
    buffers: &BTreeMap<EnvKey, String>,
    color: bool,
) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(&paint(BOLD, "====== matrix results ======", color));
    out.push('\n');
    for (key, outcome) in outcomes {
        out.push_str(&format!(
            "{} ... {}\n",
            key,
            paint(outcome_color(*outcome), outcome.as_str(), color)
        ));
    }

    let failures: Vec<_> = outcomes.iter().filter(|(_, o)| o.is_failure()).collect();
    if !failures.is_empty() {
        out.push('\n');
        out.push_str(&paint(RED, "====== failures ======", color));
        out.push('\n');
        for (key, _) in &failures {
            out.push_str(&format!("______ {} ______\n", key));
            if let Some(text) = buffers.get(*key) {
                out.push_str(text);
                if !text.is_empty() && !text.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }

    let summary = MatrixSummary::from_outcomes(outcomes.values());
    let mut parts = Vec::new();
    if summary.passed > 0 {
        parts.push(format!("{} passed", summary.passed));
    }
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed));
    }
    if summary.unresolved > 0 {
        parts.push(format!("{} unresolved", summary.unresolved));
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped));
    }
    if parts.is_empty() {
        parts.push("no environments ran".to_string());
    }
    let line = format!("====== {} ======", parts.join(", "));
    let line_color = if summary.is_success() { GREEN } else { RED };
    out.push('\n');
    out.push_str(&paint(line_color, &line, color));
    out.push('\n');
    out
}

/// In-memory sink; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn collector() -> (OutputCollector, MemorySink) {
        let sink = MemorySink::new();
        (OutputCollector::new(Box::new(sink.clone()), false), sink)
    }

    #[test]
    fn test_buffered_writes_wait_for_report() {
        let (collector, sink) = collector();
        let key = EnvKey::new("rack", 0);
        collector.write(&key, "line one\n");
        assert_eq!(sink.contents(), "");

        collector.record(&key, Outcome::Passed);
        collector.suite_report(&key);
        assert_eq!(sink.contents(), "line one\n------ rack env 0 PASSED ------\n");
    }

    #[test]
    fn test_live_writes_go_straight_through() {
        let (collector, sink) = collector();
        collector.set_mode(StreamMode::Live);
        let key = EnvKey::new("rack", 1);
        collector.write(&key, "streamed\n");
        assert_eq!(sink.contents(), "streamed\n");

        collector.failed(&key);
        collector.suite_report(&key);
        assert_eq!(sink.contents(), "streamed\n------ rack env 1 FAILED ------\n");
    }

    #[test]
    fn test_live_footer_starts_on_its_own_line() {
        let (collector, sink) = collector();
        collector.set_mode(StreamMode::Live);
        let key = EnvKey::new("rack", 0);
        collector.write(&key, "partial output");
        collector.record(&key, Outcome::Passed);
        collector.suite_report(&key);
        assert_eq!(sink.contents(), "partial output\n------ rack env 0 PASSED ------\n");
    }

    #[test]
    fn test_passing_output_is_released_after_report() {
        let (collector, _) = collector();
        let passed = EnvKey::new("rack", 0);
        let failed = EnvKey::new("rack", 1);
        collector.write(&passed, "ok\n");
        collector.write(&failed, "boom\n");
        collector.record(&passed, Outcome::Passed);
        collector.failed(&failed);
        collector.suite_report(&passed);
        collector.suite_report(&failed);

        assert_eq!(collector.output(&passed), "");
        assert_eq!(collector.output(&failed), "boom\n");
    }

    #[test]
    fn test_recorded_outcomes_and_summary() {
        let (collector, _) = collector();
        collector.record(&EnvKey::new("rack", 0), Outcome::Passed);
        collector.failed(&EnvKey::new("rack", 1));
        collector.record(&EnvKey::new("rack", 2), Outcome::Skipped);
        collector.record(&EnvKey::new("rack", 3), Outcome::Unresolved);

        let outcomes = collector.outcomes();
        let failures: Vec<_> = outcomes.iter().filter(|(_, o)| o.is_failure()).map(|(k, _)| k.clone()).collect();
        assert_eq!(failures, vec![EnvKey::new("rack", 1), EnvKey::new("rack", 3)]);
        let summary = MatrixSummary::from_outcomes(outcomes.iter().map(|(_, o)| o));
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_footer_color() {
        let key = EnvKey::new("rack", 0);
        assert_eq!(
            render_footer(&key, Outcome::Failed, true),
            "------ rack env 0 \x1b[31mFAILED\x1b[0m ------\n"
        );
    }

    #[test]
    fn test_overall_report_lists_failures_with_output() {
        let mut outcomes = BTreeMap::new();
        let mut buffers = BTreeMap::new();
        outcomes.insert(EnvKey::new("rack", 0), Outcome::Passed);
        outcomes.insert(EnvKey::new("rack", 1), Outcome::Failed);
        buffers.insert(EnvKey::new("rack", 0), "ok\n".to_string());
        buffers.insert(EnvKey::new("rack", 1), "1 failure".to_string());

        insta::assert_snapshot!(render_overall(&outcomes, &buffers, false).trim(), @r"
        ====== matrix results ======
        rack env 0 ... PASSED
        rack env 1 ... FAILED

        ====== failures ======
        ______ rack env 1 ______
        1 failure

        ====== 1 passed, 1 failed ======
        ");
    }

    #[test]
    fn test_overall_report_when_nothing_ran() {
        let report = render_overall(&BTreeMap::new(), &BTreeMap::new(), false);
        assert!(report.contains("====== no environments ran ======"));
    }

    #[test]
    fn test_concurrent_writers_emit_contiguous_blocks() {
        let (collector, sink) = collector();
        let collector = Arc::new(collector);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    let key = EnvKey::new("suite", i);
                    for n in 0..50 {
                        collector.write(&key, &format!("env{i}:{n}\n"));
                    }
                    collector.record(&key, Outcome::Passed);
                    collector.suite_report(&key);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = sink.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 8 * 51);
        for block in lines.chunks(51) {
            let prefix = block[0].split(':').next().unwrap();
            for (n, line) in block[..50].iter().enumerate() {
                assert_eq!(*line, format!("{prefix}:{n}"));
            }
            assert!(block[50].starts_with("------ suite env "));
        }
    }
}
