//! Isolated execution of one test.
//!
//! Each run gets a private temporary working directory (removed afterward),
//! its own capture buffer and a recovery boundary around the body. Failures
//! returned by the body and panics raised inside it both end up as a failing
//! [`TestReport`]; neither escapes to the scheduler. Only infrastructure
//! problems (no working directory, no cluster command) are returned as
//! errors.
//!
//! A panic inside a body is kept out of the shared stderr: while a body runs,
//! the process panic hook only records where the panic happened and the
//! message ends up in that test's captured output.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::context::TestContext;
use crate::poll::DEFAULT_POLL_INTERVAL;
use crate::registry::TestCase;
use crate::runner::CommandRunner;

/// Infrastructure failure while setting up a run.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Can't create working directory for {test}: {source}")]
    Workdir {
        test: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Can't run the cluster command for {test}: {message}")]
    ClusterCommand { test: String, message: String },
}

/// Knobs shared by every run.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub verbose: bool,
    pub poll_interval: Duration,
    /// Parent of the per-run working directories (system temp dir if unset).
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            scratch_dir: None,
        }
    }
}

/// Recorded result of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub name: String,
    /// Namespace the test ran in; empty if it never got one.
    pub namespace: String,
    pub passed: bool,
    pub message: Option<String>,
    /// Everything the test logged.
    pub output: String,
    pub duration: Duration,
}

impl TestReport {
    /// Failing report for a test that never reached its body.
    pub fn aborted(name: impl Into<String>, message: impl Into<String>, duration: Duration) -> Self {
        let message = message.into();
        Self {
            name: name.into(),
            namespace: String::new(),
            passed: false,
            output: format!("Failure:\n{message}\n"),
            message: Some(message),
            duration,
        }
    }
}

/// Run `case` in `namespace` inside a fresh working directory.
pub fn run_test(
    case: &TestCase,
    namespace: &str,
    runner: Arc<dyn CommandRunner>,
    options: &ExecOptions,
) -> Result<TestReport, ExecError> {
    let start = Instant::now();
    let mut builder = tempfile::Builder::new();
    builder.prefix("kcon");
    let workdir = match &options.scratch_dir {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
    .map_err(|source| ExecError::Workdir {
        test: case.name.to_string(),
        source,
    })?;
    debug!(test = case.name, namespace, workdir = %workdir.path().display(), "Running test");

    let mut ctx = TestContext::new(case.name, namespace, workdir.path(), runner)
        .with_verbose(options.verbose)
        .with_poll_interval(options.poll_interval);

    install_panic_hook();
    let outcome = {
        let _scope = BodyScope::enter();
        panic::catch_unwind(AssertUnwindSafe(|| (case.body)(&mut ctx)))
    };
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(failure)) => Some(failure.to_string()),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            Some(match PANIC_LOCATION.with(|slot| slot.borrow_mut().take()) {
                Some(location) => format!("Test panicked at {location}: {message}"),
                None => format!("Test panicked: {message}"),
            })
        }
    };
    if let Some(message) = failure {
        ctx.log(format!("Failure:\n{message}"));
        ctx.mark_failed(message);
    }

    if let Err(err) = workdir.close() {
        warn!(test = case.name, error = %err, "Failed to remove working directory");
    }

    Ok(TestReport {
        name: case.name.to_string(),
        namespace: namespace.to_string(),
        passed: ctx.passed(),
        message: ctx.message().map(str::to_string),
        output: ctx.take_output(),
        duration: start.elapsed(),
    })
}

thread_local! {
    static IN_BODY: Cell<bool> = const { Cell::new(false) };
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Marks the current thread as running a test body.
struct BodyScope;

impl BodyScope {
    fn enter() -> Self {
        PANIC_LOCATION.with(|slot| *slot.borrow_mut() = None);
        IN_BODY.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for BodyScope {
    fn drop(&mut self) {
        IN_BODY.with(|flag| flag.set(false));
    }
}

/// Wrap the process panic hook once. Panics outside test bodies still go
/// to the previous hook.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !IN_BODY.with(Cell::get) {
                previous(info);
                return;
            }
            let location = info.location().map(|loc| {
                let file = Path::new(loc.file())
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| loc.file().to_string());
                format!("{file}:{}", loc.line())
            });
            PANIC_LOCATION.with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = location;
                }
            });
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
