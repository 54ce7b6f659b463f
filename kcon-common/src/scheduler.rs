//! Test scheduler.
//!
//! Drives the selected tests through the namespace pool and the execution
//! context with at most `concurrency` tests in flight. Admission goes through
//! a fair semaphore acquired in registry order: ordinary tests take one
//! permit, serialized tests take every permit and therefore run alone. Test
//! bodies are blocking code and run on the blocking pool; the launch loop
//! itself never blocks the runtime.
//!
//! After the last launch every task is drained before the pool's namespaces
//! are destroyed, exactly once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::exec::{self, ExecError, ExecOptions, TestReport};
use crate::pool::{NamespacePool, PoolConfig, ReleaseOutcome};
use crate::registry::{Registry, TestCase, TestFilter};
use crate::report::{Reporter, RunSummary, TestRecord};
use crate::runner::CommandRunner;

/// Upper bound on the concurrency limit.
pub const MAX_CONCURRENCY: usize = 64;

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid concurrency limit {0} (expected 1..={MAX_CONCURRENCY})")]
    InvalidConcurrency(usize),

    #[error("No usable cluster context (kubeconfig: {kubeconfig}): {output}")]
    Preflight { kubeconfig: String, output: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Test task failed: {0}")]
    Join(#[from] JoinError),

    #[error("Admission closed unexpectedly")]
    AdmissionClosed,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub exec: ExecOptions,
    pub pool: PoolConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            exec: ExecOptions::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Run counters, all guarded by one lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerState {
    pub running: usize,
    pub completed: usize,
    pub passed: usize,
    pub peak_running: usize,
    /// An infrastructure failure occurred; launch nothing new.
    pub halted: bool,
}

type TaskResult = (usize, Result<TestReport, ExecError>);

pub struct Scheduler {
    runner: Arc<dyn CommandRunner>,
    pool: Arc<NamespacePool>,
    reporter: Arc<Reporter>,
    state: Arc<Mutex<SchedulerState>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: SchedulerConfig,
        reporter: Arc<Reporter>,
    ) -> Result<Self, SchedulerError> {
        if config.concurrency == 0 || config.concurrency > MAX_CONCURRENCY {
            return Err(SchedulerError::InvalidConcurrency(config.concurrency));
        }
        let pool = Arc::new(NamespacePool::new(runner.clone(), config.pool.clone()));
        Ok(Self {
            runner,
            pool,
            reporter,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            config,
        })
    }

    /// Snapshot of the run counters.
    pub fn state(&self) -> SchedulerState {
        *lock_state(&self.state)
    }

    pub fn pool(&self) -> &NamespacePool {
        &self.pool
    }

    /// Run every test in `registry` matching `filter`.
    pub async fn run(
        &self,
        registry: &Registry,
        filter: &TestFilter,
    ) -> Result<RunSummary, SchedulerError> {
        let started_at = Utc::now();
        let selection = registry.select(filter);

        for name in &selection.missing {
            warn!(test = %name, "Missing implementation");
            if let Err(err) = self.reporter.missing(name) {
                warn!(error = %err, "Failed to write report");
            }
        }

        if selection.cases.is_empty() {
            let mut summary = RunSummary::empty();
            summary.started_at = started_at;
            summary.missing = selection.missing;
            summary.no_matches = !filter.is_empty();
            let written = if summary.no_matches {
                self.reporter.no_matches()
            } else {
                self.reporter.summary(&summary)
            };
            if let Err(err) = written {
                warn!(error = %err, "Failed to write report");
            }
            return Ok(summary);
        }

        self.preflight().await?;

        let concurrency = self.config.concurrency;
        info!(
            tests = selection.cases.len(),
            concurrency, "Starting conformance run"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut reports: Vec<Option<TestReport>> = vec![None; selection.cases.len()];
        let mut fatal: Option<SchedulerError> = None;

        for (index, case) in selection.cases.iter().copied().enumerate() {
            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut reports, &mut fatal);
            }
            if fatal.is_some() {
                break;
            }

            let permits = if case.serialize { concurrency } else { 1 };
            if case.serialize {
                debug!(test = case.name, "Waiting for exclusive slot");
            }
            let Ok(permit) = semaphore.clone().acquire_many_owned(permits as u32).await else {
                fatal = Some(SchedulerError::AdmissionClosed);
                break;
            };

            {
                let mut state = lock_state(&self.state);
                if state.halted {
                    break;
                }
                state.running += 1;
                state.peak_running = state.peak_running.max(state.running);
            }

            let task = TestTask {
                case,
                runner: self.runner.clone(),
                pool: self.pool.clone(),
                reporter: self.reporter.clone(),
                state: self.state.clone(),
                options: self.config.exec.clone(),
            };
            tasks.spawn_blocking(move || {
                let _permit = permit;
                (index, task.run())
            });
        }

        // Drain before tearing anything down.
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut reports, &mut fatal);
        }

        let tainted = self.pool.tainted();
        let pool = self.pool.clone();
        let destroyed = tokio::task::spawn_blocking(move || pool.destroy_all()).await?;
        for (name, reason) in &destroyed.failed {
            error!(namespace = %name, reason = %reason, "Namespace survived shutdown");
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        let tests: Vec<TestRecord> = reports.iter().flatten().map(TestRecord::from).collect();
        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            passed: tests.iter().filter(|t| t.passed).count(),
            total: tests.len(),
            tests,
            missing: selection.missing,
            no_matches: false,
            tainted,
            undeleted: destroyed.failed.into_iter().map(|(name, _)| name).collect(),
            peak_running: self.state().peak_running,
        };
        if let Err(err) = self.reporter.summary(&summary) {
            warn!(error = %err, "Failed to write report");
        }
        info!(
            passed = summary.passed,
            total = summary.total,
            "Conformance run finished"
        );
        Ok(summary)
    }

    async fn preflight(&self) -> Result<(), SchedulerError> {
        let runner = self.runner.clone();
        let out = tokio::task::spawn_blocking(move || runner.invoke(&["config", "current-context"]))
            .await?;
        if out.success() {
            debug!(context = %out.output.trim(), "Using cluster context");
            return Ok(());
        }
        Err(SchedulerError::Preflight {
            kubeconfig: kubeconfig_location(),
            output: out.output.trim().to_string(),
        })
    }
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn collect(
    joined: Result<TaskResult, JoinError>,
    reports: &mut [Option<TestReport>],
    fatal: &mut Option<SchedulerError>,
) {
    match joined {
        Ok((index, Ok(report))) => reports[index] = Some(report),
        Ok((_, Err(err))) => {
            error!(error = %err, "Infrastructure failure; no further tests will start");
            if fatal.is_none() {
                *fatal = Some(err.into());
            }
        }
        Err(err) => {
            error!(error = %err, "Test task died");
            if fatal.is_none() {
                *fatal = Some(err.into());
            }
        }
    }
}

/// Where the cluster command will look for its configuration.
fn kubeconfig_location() -> String {
    if let Some(path) = std::env::var_os("KUBECONFIG").filter(|p| !p.is_empty()) {
        return PathBuf::from(path).display().to_string();
    }
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config").display().to_string())
        .unwrap_or_else(|| "~/.kube/config".to_string())
}

/// Everything one launched test needs, moved onto the blocking pool.
struct TestTask {
    case: TestCase,
    runner: Arc<dyn CommandRunner>,
    pool: Arc<NamespacePool>,
    reporter: Arc<Reporter>,
    state: Arc<Mutex<SchedulerState>>,
    options: ExecOptions,
}

impl TestTask {
    fn run(self) -> Result<TestReport, ExecError> {
        let result = self.execute();

        if let Ok(report) = &result
            && let Err(err) = self.reporter.test_finished(report)
        {
            warn!(test = self.case.name, error = %err, "Failed to write report");
        }

        let mut state = lock_state(&self.state);
        state.running -= 1;
        match &result {
            Ok(report) => {
                state.completed += 1;
                if report.passed {
                    state.passed += 1;
                }
            }
            Err(_) => state.halted = true,
        }
        result
    }

    fn execute(&self) -> Result<TestReport, ExecError> {
        let start = Instant::now();
        let namespace = match self.pool.acquire() {
            Ok(namespace) => namespace,
            Err(err) if err.is_infrastructure() => {
                return Err(ExecError::ClusterCommand {
                    test: self.case.name.to_string(),
                    message: err.to_string(),
                });
            }
            Err(err) => {
                warn!(test = self.case.name, error = %err, "Could not get a namespace");
                return Ok(TestReport::aborted(self.case.name, err.to_string(), start.elapsed()));
            }
        };

        let result = exec::run_test(&self.case, &namespace, self.runner.clone(), &self.options);

        match self.pool.release(&namespace) {
            Ok(ReleaseOutcome::Reclaimed) => {}
            Ok(ReleaseOutcome::Tainted { reason }) => {
                warn!(test = self.case.name, namespace = %namespace, reason = %reason, "Namespace left tainted");
            }
            Err(err) => {
                warn!(test = self.case.name, error = %err, "Failed to release namespace");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{TestContext, TestResult};
    use crate::mock_cluster::MockCluster;
    use crate::poll::Poller;
    use crate::report::MemorySink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn config(concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            concurrency,
            exec: ExecOptions {
                poll_interval: Duration::from_millis(5),
                ..ExecOptions::default()
            },
            pool: PoolConfig {
                prefix: "kcnamespace".to_string(),
                verify: Poller::new(Duration::from_millis(200))
                    .with_interval(Duration::from_millis(10)),
            },
        }
    }

    fn scheduler(cluster: Arc<MockCluster>, concurrency: usize) -> (MemorySink, Scheduler) {
        let sink = MemorySink::new();
        let reporter = Arc::new(Reporter::new(sink.clone(), false));
        let scheduler = Scheduler::new(cluster, config(concurrency), reporter).unwrap();
        (sink, scheduler)
    }

    fn pass(ctx: &mut TestContext) -> TestResult {
        ctx.log("ok");
        Ok(())
    }

    fn fail(ctx: &mut TestContext) -> TestResult {
        Err(ctx.fail("expected failure"))
    }

    fn slow(ctx: &mut TestContext) -> TestResult {
        thread::sleep(Duration::from_millis(50));
        ctx.check(!ctx.namespace().is_empty(), "no namespace")
    }

    #[tokio::test]
    async fn test_one_pass_one_fail() {
        let cluster = Arc::new(MockCluster::new());
        let (sink, scheduler) = scheduler(cluster.clone(), 1);
        let registry = Registry::new([TestCase::new("A1", pass), TestCase::new("A2", fail)]);

        let summary = scheduler.run(&registry, &TestFilter::all()).await.unwrap();

        assert_eq!(summary.passed, 1);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.exit_code(), 1);
        let output = sink.contents();
        assert!(output.contains("PASS: A1\n"));
        assert!(output.contains("FAIL: A2\n| Failure:\n"));
        assert!(output.ends_with("Results: 1/2 tests passed\n"));

        // Sequential tests share one namespace, destroyed at the end.
        assert_eq!(cluster.count_calls(&["create", "namespace"]), 1);
        assert!(cluster.namespaces().is_empty());
        assert_eq!(scheduler.state().running, 0);
        assert_eq!(scheduler.state().completed, 2);
    }

    #[tokio::test]
    async fn test_missing_implementation_excluded_from_counts() {
        let cluster = Arc::new(MockCluster::new());
        let (sink, scheduler) = scheduler(cluster, 1);
        let registry = Registry::from_parts(["A1", "Ghost"], [TestCase::new("A1", pass)]);
        let filter = TestFilter::new(&["a1", "ghost"]).unwrap();

        let summary = scheduler.run(&registry, &filter).await.unwrap();

        assert_eq!(summary.missing, vec!["Ghost"]);
        assert_eq!((summary.passed, summary.total), (1, 1));
        assert_eq!(summary.exit_code(), 0);
        assert!(sink.contents().contains("Missing implementation for test \"Ghost\""));
    }

    #[tokio::test]
    async fn test_no_matches_fails_without_touching_cluster() {
        let cluster = Arc::new(MockCluster::new());
        let (sink, scheduler) = scheduler(cluster.clone(), 1);
        let registry = Registry::from_parts(["A1", "Ghost"], [TestCase::new("A1", pass)]);
        let filter = TestFilter::new(&["ghost"]).unwrap();

        let summary = scheduler.run(&registry, &filter).await.unwrap();

        assert!(summary.no_matches);
        assert_eq!(summary.exit_code(), 1);
        assert!(cluster.calls().is_empty());
        assert!(sink.contents().contains("didn't find any matches"));
    }

    #[tokio::test]
    async fn test_preflight_failure_is_fatal() {
        let cluster = Arc::new(MockCluster::new());
        cluster.clear_context();
        let (_sink, scheduler) = scheduler(cluster.clone(), 1);
        let registry = Registry::new([TestCase::new("A1", pass)]);

        let err = scheduler.run(&registry, &TestFilter::all()).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Preflight { ref output, .. } if output.contains("current-context")));
        assert_eq!(cluster.count_calls(&["create", "namespace"]), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let cluster = Arc::new(MockCluster::new());
        let (_sink, scheduler) = scheduler(cluster.clone(), 2);
        let registry = Registry::new([
            TestCase::new("S1", slow),
            TestCase::new("S2", slow),
            TestCase::new("S3", slow),
            TestCase::new("S4", slow),
        ]);

        let summary = scheduler.run(&registry, &TestFilter::all()).await.unwrap();

        assert_eq!((summary.passed, summary.total), (4, 4));
        assert_eq!(summary.peak_running, 2);
        assert!(cluster.count_calls(&["create", "namespace"]) <= 2);
        let names: Vec<_> = summary.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["S1", "S2", "S3", "S4"]);
    }

    static ACTIVE: AtomicUsize = AtomicUsize::new(0);
    static OVERLAPPED: AtomicBool = AtomicBool::new(false);

    fn tracked(exclusive: bool) {
        let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
        if exclusive && now > 1 {
            OVERLAPPED.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(30));
        if exclusive && ACTIVE.load(Ordering::SeqCst) > 1 {
            OVERLAPPED.store(true, Ordering::SeqCst);
        }
        ACTIVE.fetch_sub(1, Ordering::SeqCst);
    }

    fn shared_body(_: &mut TestContext) -> TestResult {
        tracked(false);
        Ok(())
    }

    fn exclusive_body(_: &mut TestContext) -> TestResult {
        tracked(true);
        Ok(())
    }

    #[tokio::test]
    async fn test_serialized_tests_run_alone() {
        let cluster = Arc::new(MockCluster::new());
        let (_sink, scheduler) = scheduler(cluster, 4);
        let registry = Registry::new([
            TestCase::new("N1", shared_body),
            TestCase::new("N2", shared_body),
            TestCase::new("X1", exclusive_body).serialized(),
            TestCase::new("X2", exclusive_body).serialized(),
            TestCase::new("N3", shared_body),
            TestCase::new("N4", shared_body),
        ]);

        let summary = scheduler.run(&registry, &TestFilter::all()).await.unwrap();

        assert_eq!((summary.passed, summary.total), (6, 6));
        assert!(!OVERLAPPED.load(Ordering::SeqCst), "serialized test overlapped");
    }

    #[tokio::test]
    async fn test_namespace_failure_fails_only_that_test() {
        let cluster = Arc::new(MockCluster::new());
        cluster.fail_namespace_creation("kcnamespace1");
        let (_sink, scheduler) = scheduler(cluster.clone(), 1);
        let registry = Registry::new([TestCase::new("A1", pass), TestCase::new("A2", pass)]);

        let summary = scheduler.run(&registry, &TestFilter::all()).await.unwrap();

        assert_eq!((summary.passed, summary.total), (1, 2));
        assert!(summary.tests[0].message.as_deref().unwrap().contains("kcnamespace1"));
        assert_eq!(summary.tests[1].namespace, "kcnamespace2");
        assert!(cluster.namespaces().is_empty());
    }

    #[tokio::test]
    async fn test_tainted_namespace_reported_and_not_reused() {
        let cluster = Arc::new(MockCluster::new());
        cluster.script(
            &["get", "all"],
            crate::runner::CommandOutput::new(0, "NAME\npod/stuck\n"),
        );
        let (_sink, scheduler) = scheduler(cluster.clone(), 1);
        let registry = Registry::new([TestCase::new("A1", pass), TestCase::new("A2", pass)]);

        let summary = scheduler.run(&registry, &TestFilter::all()).await.unwrap();

        // Cleanup problems never fail the test that used the namespace.
        assert_eq!((summary.passed, summary.total), (2, 2));
        assert_eq!(summary.tainted, vec!["kcnamespace1", "kcnamespace2"]);
        assert_eq!(summary.tests[1].namespace, "kcnamespace2");
    }

    #[tokio::test]
    async fn test_infrastructure_failure_stops_run_and_cleans_up() {
        let cluster = Arc::new(MockCluster::new());
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(1);
        config.exec.scratch_dir = Some(dir.path().join("missing"));
        let reporter = Arc::new(Reporter::new(MemorySink::new(), false));
        let scheduler = Scheduler::new(cluster.clone(), config, reporter).unwrap();
        let registry = Registry::new([TestCase::new("A1", pass), TestCase::new("A2", pass)]);

        let err = scheduler.run(&registry, &TestFilter::all()).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Exec(_)));
        assert!(cluster.namespaces().is_empty());
        let state = scheduler.state();
        assert!(state.halted);
        assert_eq!(state.running, 0);
        assert_eq!(state.completed, 0);
        assert_eq!(state.peak_running, 1);
    }

    #[tokio::test]
    async fn test_unstartable_cluster_command_stops_run() {
        let cluster = Arc::new(MockCluster::new());
        cluster.script(
            &["create", "namespace"],
            crate::runner::CommandOutput::new(
                crate::runner::SPAWN_FAILURE_CODE,
                "failed to run kubectl: No such file or directory",
            ),
        );
        let (sink, scheduler) = scheduler(cluster.clone(), 1);
        let registry = Registry::new([
            TestCase::new("A1", pass),
            TestCase::new("A2", pass),
            TestCase::new("A3", pass),
        ]);

        let err = scheduler.run(&registry, &TestFilter::all()).await.unwrap_err();

        assert!(matches!(
            err,
            SchedulerError::Exec(ExecError::ClusterCommand { ref test, .. }) if test == "A1"
        ));
        assert_eq!(cluster.count_calls(&["create", "namespace"]), 1);
        assert!(scheduler.state().halted);
        assert!(!sink.contents().contains("A2"));
    }

    #[test]
    fn test_rejects_bad_concurrency() {
        let reporter = Arc::new(Reporter::new(MemorySink::new(), false));
        for bad in [0, MAX_CONCURRENCY + 1] {
            let result = Scheduler::new(Arc::new(MockCluster::new()), config(bad), reporter.clone());
            assert!(matches!(result, Err(SchedulerError::InvalidConcurrency(n)) if n == bad));
        }
    }
}
