//! Execution engine for the Kubernetes conformance runner.
//!
//! Tests run concurrently inside namespaces drawn from a shared pool. Each
//! test gets a private working directory and output buffer; results are
//! collected by the scheduler and printed by the reporter.

pub mod config;
pub mod context;
pub mod exec;
pub mod logging;
pub mod mock_cluster;
pub mod poll;
pub mod pool;
pub mod query;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;

pub use config::{ConfigError, ConfigSource, EnvError, EnvParser, RunConfig, Sourced};
pub use context::{TestContext, TestFailure, TestResult};
pub use exec::{ExecError, ExecOptions, TestReport, run_test};
pub use logging::{LogConfig, LogFormat, LoggingError, init_logging};
pub use mock_cluster::MockCluster;
pub use poll::{DEFAULT_POLL_INTERVAL, PollError, PollOutcome, Poller, Probe};
pub use pool::{
    DestroyReport, NamespacePool, NamespaceState, NamespaceStatus, PoolConfig, PoolError,
    ReleaseOutcome,
};
pub use query::{Document, DocumentFormat, PathExpr, QueryError, json_value, yaml_value};
pub use registry::{FilterError, Registry, Selection, TestCase, TestFilter, TestFn};
pub use report::{MemorySink, Reporter, RunSummary, TestRecord};
pub use runner::{CommandOutput, CommandRunner, KubectlRunner};
pub use scheduler::{MAX_CONCURRENCY, Scheduler, SchedulerConfig, SchedulerError, SchedulerState};
