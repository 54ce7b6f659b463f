//! Per-run test state and the helpers test bodies use.
//!
//! A [`TestContext`] is created fresh for every test invocation and owned
//! exclusively by it. All textual output of the test goes into the
//! context's capture buffer rather than the process streams, so concurrent
//! tests never interleave. Assertion helpers return [`TestFailure`] and are
//! propagated with `?` up to the execution boundary.

use std::fmt;
use std::fmt::Write as _;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::poll::{PollError, Poller, Probe};
use crate::query::{Document, QueryError};
use crate::runner::{CommandOutput, CommandRunner};

/// Result type returned by test bodies.
pub type TestResult = Result<(), TestFailure>;

/// An unmet expectation inside a test body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    message: String,
    location: Option<String>,
}

impl TestFailure {
    /// Failure at the caller's source location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let caller = Location::caller();
        let file = Path::new(caller.file())
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| caller.file().to_string());
        Self {
            message: message.into(),
            location: Some(format!("{file}:{}", caller.line())),
        }
    }

    /// Failure without location information (e.g. from a caught panic).
    pub fn bare(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TestFailure {}

impl From<QueryError> for TestFailure {
    #[track_caller]
    fn from(err: QueryError) -> Self {
        TestFailure::new(err.to_string())
    }
}

impl From<PollError> for TestFailure {
    #[track_caller]
    fn from(err: PollError) -> Self {
        TestFailure::new(err.to_string())
    }
}

/// Mutable state of one test run.
pub struct TestContext {
    name: String,
    namespace: String,
    workdir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    passing: bool,
    message: Option<String>,
    output: String,
    verbose: bool,
    poll_interval: Duration,
}

impl TestContext {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        workdir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            workdir: workdir.into(),
            runner,
            passing: true,
            message: None,
            output: String::new(),
            verbose: false,
            poll_interval: crate::poll::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Record executed commands in the captured output.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Interval used by the wait helpers.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace assigned to this run.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Private working directory of this run.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Interval test bodies should use for their own polling.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn passed(&self) -> bool {
        self.passing
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Text captured so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub(crate) fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Mark the run as failing. There is no way back to passing.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.passing = false;
        self.message = Some(message.into());
    }

    /// Append a line to the captured output.
    pub fn log(&mut self, msg: impl AsRef<str>) {
        let _ = writeln!(self.output, "{}", msg.as_ref());
    }

    /// Fail unless `condition` holds.
    #[track_caller]
    pub fn check(&self, condition: bool, message: impl Into<String>) -> TestResult {
        if condition {
            Ok(())
        } else {
            Err(TestFailure::new(message))
        }
    }

    /// Fail unless `actual == expected`.
    #[track_caller]
    pub fn check_eq<T: PartialEq + fmt::Debug>(&self, actual: T, expected: T, what: &str) -> TestResult {
        if actual == expected {
            Ok(())
        } else {
            Err(TestFailure::new(format!(
                "Wrong {what}({actual:?}), expected {expected:?}"
            )))
        }
    }

    /// Unconditional failure.
    #[track_caller]
    pub fn fail(&self, message: impl Into<String>) -> TestFailure {
        TestFailure::new(message)
    }

    /// Run a cluster command in this run's working directory.
    pub fn kubectl(&mut self, args: &[&str]) -> CommandOutput {
        if self.verbose {
            self.log(format!("[ kubectl {} ]", args.join(" ")));
        }
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(&args, Some(&self.workdir))
    }

    /// Run a cluster command and fail the test if it exits nonzero.
    #[track_caller]
    pub fn kubectl_ok(&mut self, args: &[&str]) -> Result<CommandOutput, TestFailure> {
        let out = self.kubectl(args);
        if out.success() {
            return Ok(out);
        }
        Err(TestFailure::new(format!(
            "kubectl {} failed({}): {}",
            args.join(" "),
            out.code,
            out.output.trim()
        )))
    }

    /// Write a file inside the working directory.
    #[track_caller]
    pub fn create_file(&self, name: &str, content: &str) -> Result<PathBuf, TestFailure> {
        let path = self.workdir.join(name);
        match std::fs::write(&path, content) {
            Ok(()) => Ok(path),
            Err(err) => Err(TestFailure::new(format!("Error creating file({name}): {err}"))),
        }
    }

    /// Evaluate `path` against JSON text.
    pub fn json_value(&self, text: &str, path: &str) -> Result<String, QueryError> {
        Document::from_json(text)?.query(path)
    }

    /// Evaluate `path` against YAML text.
    pub fn yaml_value(&self, text: &str, path: &str) -> Result<String, QueryError> {
        Document::from_yaml(text)?.query(path)
    }

    fn get_json_args(&self, target: &str) -> Vec<String> {
        ["get", target, "-o", "json", "--namespace", self.namespace.as_str()]
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    /// Wait until `<kind>/<name>` in this namespace reports `status.phase == phase`.
    #[track_caller]
    pub fn wait_for_phase(&self, kind: &str, name: &str, phase: &str, timeout: Duration) -> TestResult {
        let target = format!("{kind}/{name}");
        let args = self.get_json_args(&target);

        let outcome = Poller::new(timeout)
            .with_interval(self.poll_interval)
            .wait(|| {
                let out = self.runner.run(&args, Some(&self.workdir));
                if !out.success() {
                    return Probe::pending(format!("Error getting {target}: {}", out.output.trim()));
                }
                match Document::from_json(&out.output).and_then(|doc| doc.lookup("status.phase")) {
                    Ok(Some(current)) if current == phase => Probe::ready(),
                    Ok(current) => Probe::pending(format!(
                        "{target} phase is {}",
                        current.as_deref().unwrap_or("<unset>")
                    )),
                    Err(err) => Probe::pending(err.to_string()),
                }
            });

        match outcome.into_result(&format!("{target} to reach {phase}")) {
            Ok(()) => Ok(()),
            Err(err) => Err(TestFailure::new(err.to_string())),
        }
    }

    /// Wait until `<kind>/<name>` no longer exists in this namespace.
    #[track_caller]
    pub fn wait_for_deletion(&self, kind: &str, name: &str, timeout: Duration) -> TestResult {
        let target = format!("{kind}/{name}");
        let args = self.get_json_args(&target);

        let outcome = Poller::new(timeout)
            .with_interval(self.poll_interval)
            .wait(|| {
                let out = self.runner.run(&args, Some(&self.workdir));
                if out.success() {
                    return Probe::pending(format!("{target} still there"));
                }
                Probe::when(out.contains("not found"), format!("{target} still there"))
            });

        match outcome.into_result(&format!("{target} to be deleted")) {
            Ok(()) => Ok(()),
            Err(err) => Err(TestFailure::new(err.to_string())),
        }
    }
}
