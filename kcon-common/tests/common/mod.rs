#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kcon_common::{
    ExecOptions, MemorySink, MockCluster, PoolConfig, Poller, Reporter, Scheduler,
    SchedulerConfig,
};
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kcon_common=debug")),
        )
        .try_init();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

pub fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "Expected to find '{needle}' in output, got: {haystack}"
    );
}

/// Scheduler config with millisecond-scale waits.
pub fn fast_config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        concurrency,
        exec: ExecOptions {
            poll_interval: Duration::from_millis(5),
            ..ExecOptions::default()
        },
        pool: PoolConfig {
            prefix: "kcnamespace".to_string(),
            verify: Poller::new(Duration::from_millis(300)).with_interval(Duration::from_millis(10)),
        },
    }
}

/// Scheduler over `cluster` whose report output lands in the returned sink.
pub fn scheduler(cluster: Arc<MockCluster>, concurrency: usize, verbose: bool) -> (MemorySink, Scheduler) {
    let sink = MemorySink::new();
    let reporter = Arc::new(Reporter::new(sink.clone(), verbose));
    let scheduler = Scheduler::new(cluster, fast_config(concurrency), reporter)
        .expect("valid scheduler config");
    (sink, scheduler)
}
