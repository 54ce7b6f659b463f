//! Operator-facing output.
//!
//! The [`Reporter`] prints one block per finished test and the final summary
//! line. Blocks are written under a single lock so concurrently finishing
//! tests never interleave. [`RunSummary`] is the machine-readable form of a
//! run, optionally written as JSON.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::exec::TestReport;

/// Column limit for captured output lines, prefix included.
pub const WRAP_WIDTH: usize = 80;

const OUTPUT_PREFIX: &str = "| ";
const OUTPUT_FOOTER: &str = "+-------------------";

// ============================================================================
// Run summary
// ============================================================================

/// One test in a [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub name: String,
    pub namespace: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&TestReport> for TestRecord {
    fn from(report: &TestReport) -> Self {
        Self {
            name: report.name.clone(),
            namespace: report.namespace.clone(),
            passed: report.passed,
            duration_ms: report.duration.as_millis() as u64,
            message: report.message.clone(),
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: usize,
    pub total: usize,
    /// Finished tests, in registry order.
    pub tests: Vec<TestRecord>,
    /// Selected names with no implementation.
    pub missing: Vec<String>,
    /// Patterns were given but matched no runnable test.
    pub no_matches: bool,
    /// Namespaces whose cleanup could not be verified.
    pub tainted: Vec<String>,
    /// Namespaces still present after shutdown.
    pub undeleted: Vec<String>,
    /// Highest number of tests observed running at once.
    pub peak_running: usize,
}

impl RunSummary {
    /// An empty summary stamped with the current time.
    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            passed: 0,
            total: 0,
            tests: Vec::new(),
            missing: Vec::new(),
            no_matches: false,
            tainted: Vec::new(),
            undeleted: Vec::new(),
            peak_running: 0,
        }
    }

    pub fn success(&self) -> bool {
        !self.no_matches && self.passed == self.total
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the summary as pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(io::Error::other)?;
        std::fs::write(path, json + "\n")
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Render captured output as a boxed, wrapped block.
///
/// Returns an empty string when there is nothing to show.
pub fn render_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let chop = WRAP_WIDTH - OUTPUT_PREFIX.len();
    let mut rendered = String::new();
    for line in trimmed.lines() {
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            rendered.push_str(OUTPUT_PREFIX.trim_end());
            rendered.push('\n');
            continue;
        }
        for chunk in chars.chunks(chop) {
            rendered.push_str(OUTPUT_PREFIX);
            rendered.extend(chunk);
            rendered.push('\n');
        }
    }
    rendered.push_str(OUTPUT_FOOTER);
    rendered.push('\n');
    rendered
}

/// Render the result block for one finished test.
pub fn render_report(report: &TestReport, verbose: bool) -> String {
    let status = if report.passed { "PASS" } else { "FAIL" };
    let mut block = format!("{status}: {}\n", report.name);
    if !report.passed || verbose {
        block.push_str(&render_output(&report.output));
    }
    block
}

pub fn render_summary(summary: &RunSummary) -> String {
    format!("\nResults: {}/{} tests passed\n", summary.passed, summary.total)
}

// ============================================================================
// Reporter
// ============================================================================

/// Serialized writer for run output.
pub struct Reporter {
    sink: Mutex<Box<dyn Write + Send>>,
    verbose: bool,
}

impl Reporter {
    pub fn new(sink: impl Write + Send + 'static, verbose: bool) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            verbose,
        }
    }

    /// Reporter writing to standard output.
    pub fn stdout(verbose: bool) -> Self {
        Self::new(io::stdout(), verbose)
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    fn write(&self, text: &str) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sink.write_all(text.as_bytes())?;
        sink.flush()
    }

    pub fn test_finished(&self, report: &TestReport) -> io::Result<()> {
        self.write(&render_report(report, self.verbose))
    }

    pub fn missing(&self, name: &str) -> io::Result<()> {
        self.write(&format!("Missing implementation for test {name:?}\n"))
    }

    pub fn no_matches(&self) -> io::Result<()> {
        self.write("Test name patterns didn't find any matches\n")
    }

    pub fn summary(&self, summary: &RunSummary) -> io::Result<()> {
        self.write(&render_summary(summary))
    }
}

/// Cloneable in-memory sink, handy for capturing reporter output.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn report(name: &str, passed: bool, output: &str) -> TestReport {
        TestReport {
            name: name.to_string(),
            namespace: "kcnamespace1".to_string(),
            passed,
            message: (!passed).then(|| "boom".to_string()),
            output: output.to_string(),
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_render_failure_shows_output() {
        let block = render_report(&report("Pod001", false, "line one\nline two\n"), false);
        assert_eq!(
            block,
            "FAIL: Pod001\n| line one\n| line two\n+-------------------\n"
        );
    }

    #[test]
    fn test_render_pass_hides_output_unless_verbose() {
        let passed = report("Pod001", true, "chatter\n");
        assert_eq!(render_report(&passed, false), "PASS: Pod001\n");
        assert!(render_report(&passed, true).contains("| chatter\n"));
    }

    #[test]
    fn test_render_empty_output_has_no_box() {
        assert_eq!(render_report(&report("Pod001", false, "  \n"), false), "FAIL: Pod001\n");
    }

    #[test]
    fn test_long_lines_wrap_at_width() {
        let long = "x".repeat(200);
        let rendered = render_output(&long);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[..3].iter().all(|l| l.chars().count() <= WRAP_WIDTH));
        assert_eq!(lines[0].len(), WRAP_WIDTH);
        assert_eq!(lines[2], format!("| {}", "x".repeat(200 - 2 * 78)));
        assert_eq!(lines[3], OUTPUT_FOOTER);
    }

    #[test]
    fn test_wrap_counts_characters_not_bytes() {
        let long = "é".repeat(100);
        let rendered = render_output(&long);
        let first = rendered.lines().next().unwrap();
        assert_eq!(first.chars().count(), WRAP_WIDTH);
    }

    #[test]
    fn test_reporter_writes_blocks_and_summary() {
        let sink = MemorySink::new();
        let reporter = Reporter::new(sink.clone(), false);
        reporter.test_finished(&report("A1", true, "")).unwrap();
        reporter.test_finished(&report("A2", false, "bad")).unwrap();
        reporter.missing("A3").unwrap();

        let mut summary = RunSummary::empty();
        summary.passed = 1;
        summary.total = 2;
        reporter.summary(&summary).unwrap();

        assert_eq!(
            sink.contents(),
            "PASS: A1\nFAIL: A2\n| bad\n+-------------------\n\
             Missing implementation for test \"A3\"\n\nResults: 1/2 tests passed\n"
        );
    }

    #[test]
    fn test_exit_code() {
        let mut summary = RunSummary::empty();
        assert_eq!(summary.exit_code(), 0);
        summary.total = 2;
        summary.passed = 1;
        assert_eq!(summary.exit_code(), 1);
        summary.passed = 2;
        assert_eq!(summary.exit_code(), 0);
        summary.no_matches = true;
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_summary_json() {
        let mut summary = RunSummary::empty();
        summary.tests.push(TestRecord::from(&report("A2", false, "")));
        summary.total = 1;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        summary.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["tests"][0]["name"], "A2");
        assert_eq!(value["tests"][0]["duration_ms"], 1500);
        assert_eq!(value["tests"][0]["message"], "boom");
        assert!(value["started_at"].as_str().unwrap().contains('T'));
    }
}
