//! Kubernetes Conformance Runner
//!
//! Runs the built-in conformance suite against the cluster selected by the
//! current kubectl context, one namespace per test.

#![forbid(unsafe_code)]

mod suite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kcon_common::{
    KubectlRunner, LogConfig, Registry, Reporter, RunConfig, Scheduler, Sourced, TestFilter,
    init_logging,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "kcon")]
#[command(
    author,
    version,
    about = "Kubernetes Conformance Runner - run conformance tests against the current cluster"
)]
struct Cli {
    /// Only run tests whose names match one of these case-insensitive regular expressions
    patterns: Vec<String>,

    /// Enable verbose output (show output of passing tests and executed commands)
    #[arg(short, long)]
    verbose: bool,

    /// Maximum number of tests to run at once [env: KCON_CONCURRENCY] [default: 1]
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Cluster command to run [env: KCON_KUBECTL] [default: kubectl]
    #[arg(long)]
    kubectl: Option<String>,

    /// Prefix for generated namespace names [env: KCON_NAMESPACE_PREFIX] [default: kcnamespace]
    #[arg(long)]
    namespace_prefix: Option<String>,

    /// How long to wait for namespace cleanup, e.g. "90s" [env: KCON_CLEANUP_TIMEOUT_SECS] [default: 60s]
    #[arg(long, value_parser = humantime::parse_duration)]
    cleanup_timeout: Option<Duration>,

    /// Write a JSON summary of the run to this file
    #[arg(long)]
    results: Option<PathBuf>,

    /// List the registered tests and exit
    #[arg(long)]
    list: bool,

    /// With --list, print JSON instead of text
    #[arg(long, requires = "list")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let mut log_config = LogConfig::from_env("warn");
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    init_logging(&log_config)?;

    let registry = suite::registry();
    if cli.list {
        print_list(&registry, cli.json)?;
        return Ok(());
    }

    let filter = TestFilter::new(&cli.patterns)?;

    let mut config = RunConfig::from_env()?;
    config.concurrency.override_with(cli.concurrency);
    config.kubectl.override_with(cli.kubectl);
    config.namespace_prefix.override_with(cli.namespace_prefix);
    config.cleanup_timeout.override_with(cli.cleanup_timeout);
    if cli.verbose {
        config.verbose = Sourced::from_cli(true);
    }
    config.validate()?;
    config.log_sources();

    let runner = Arc::new(KubectlRunner::new(&config.kubectl.value));
    let reporter = Arc::new(Reporter::stdout(config.verbose.value));
    let scheduler = Scheduler::new(runner, config.scheduler_config(), reporter)?;

    info!(
        tests = registry.len(),
        concurrency = config.concurrency.value,
        "Kubernetes Conformance Runner starting"
    );
    let summary = scheduler.run(&registry, &filter).await?;

    if let Some(path) = &cli.results {
        summary
            .write_json(path)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        debug!(path = %path.display(), "Wrote results");
    }

    if !summary.tainted.is_empty() {
        eprintln!(
            "Warning: namespaces could not be cleaned: {}",
            summary.tainted.join(", ")
        );
    }
    if !summary.undeleted.is_empty() {
        eprintln!(
            "Warning: namespaces still present after shutdown: {}",
            summary.undeleted.join(", ")
        );
    }

    std::process::exit(summary.exit_code());
}

fn print_list(registry: &Registry, json: bool) -> Result<()> {
    let cases: Vec<_> = registry
        .names()
        .iter()
        .filter_map(|name| registry.get(name))
        .collect();

    if json {
        let entries: Vec<_> = cases
            .iter()
            .map(|case| {
                serde_json::json!({
                    "name": case.name,
                    "serialize": case.serialize,
                    "summary": case.summary,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let width = cases.iter().map(|case| case.name.len()).max().unwrap_or(0);
    for case in cases {
        let serial = if case.serialize { " [serial]" } else { "" };
        println!("{:width$}  {}{serial}", case.name, case.summary);
    }
    Ok(())
}
