//! Namespace pool.
//!
//! Every test runs inside its own namespace. Namespaces are created lazily,
//! swept after each test and handed to the next test that needs one; they
//! are only deleted from the cluster once, at shutdown.
//!
//! Per-namespace state machine:
//!
//! ```text
//! Creating -> InUse -> Cleaning -> Free -> InUse ...
//!                          \-> Tainted (cleanup not verified, never reused)
//! any -> Destroyed (deleted at shutdown)
//! ```
//!
//! The pool lock guards the entry list only and is never held across a
//! cluster command, so a slow `create namespace` does not hold up other
//! acquirers that can be served from the free list.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::poll::{Poller, Probe};
use crate::runner::{CommandRunner, SPAWN_FAILURE_CODE};

/// Default namespace name prefix.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "kcnamespace";

/// Default time allowed for cleanup and deletion verification.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Namespaced kinds swept between tests.
pub const CLEANUP_KINDS: &[&str] = &["deployments", "replicasets", "pods"];

/// Lifecycle state of one pooled namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
    /// Reserved; `create namespace` in flight.
    Creating,
    /// Held by a running test.
    InUse,
    /// Released; cleanup verification in progress.
    Cleaning,
    /// Available for the next acquirer.
    Free,
    /// Cleanup could not be verified; excluded from reuse.
    Tainted,
    /// Deleted from the cluster by `destroy_all`.
    Destroyed,
}

impl NamespaceState {
    /// Whether the entry is unavailable to acquirers.
    pub fn is_used(self) -> bool {
        self != Self::Free
    }
}

#[derive(Debug, Clone)]
struct NamespaceEntry {
    name: String,
    state: NamespaceState,
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<NamespaceEntry>,
    created: usize,
}

/// Errors from pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Can't create the {name:?} namespace: {output}")]
    CreateFailed { name: String, output: String },

    /// The cluster command could not be started at all.
    #[error("Can't run the cluster command to create {name:?}: {output}")]
    CommandUnavailable { name: String, output: String },

    #[error("Namespace {0:?} is not managed by this pool")]
    UnknownNamespace(String),

    #[error("Namespace {name:?} is not in use (state: {state:?})")]
    NotInUse { name: String, state: NamespaceState },
}

impl PoolError {
    /// Whether the failure affects every test rather than one.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::CommandUnavailable { .. })
    }
}

/// Outcome of releasing a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Cleanup verified; the namespace is free for reuse.
    Reclaimed,
    /// Cleanup not verified in time; the namespace is tainted.
    Tainted { reason: String },
}

/// Outcome of deleting every pooled namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    /// Namespaces confirmed gone.
    pub deleted: Vec<String>,
    /// Namespaces still present after the timeout, with the last diagnostic.
    pub failed: Vec<(String, String)>,
}

/// Snapshot of one pooled namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceStatus {
    pub name: String,
    pub state: NamespaceState,
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for generated namespace names.
    pub prefix: String,
    /// Poller used to verify cleanup and deletion.
    pub verify: Poller,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            verify: Poller::new(DEFAULT_CLEANUP_TIMEOUT),
        }
    }
}

/// Shared pool of test namespaces.
pub struct NamespacePool {
    runner: Arc<dyn CommandRunner>,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl NamespacePool {
    pub fn new(runner: Arc<dyn CommandRunner>, config: PoolConfig) -> Self {
        Self {
            runner,
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a free namespace, creating a new one if none is free.
    pub fn acquire(&self) -> Result<String, PoolError> {
        let name = {
            let mut inner = self.lock();
            if let Some(entry) = inner
                .entries
                .iter_mut()
                .find(|entry| entry.state == NamespaceState::Free)
            {
                entry.state = NamespaceState::InUse;
                debug!(namespace = %entry.name, "Reusing namespace");
                return Ok(entry.name.clone());
            }

            // Reserve the name before dropping the lock so no other acquirer
            // can derive it again.
            inner.created += 1;
            let name = format!("{}{}", self.config.prefix, inner.created);
            inner.entries.push(NamespaceEntry {
                name: name.clone(),
                state: NamespaceState::Creating,
            });
            name
        };

        info!(namespace = %name, "Creating new namespace");
        let out = self.runner.invoke(&["create", "namespace", name.as_str()]);

        let mut inner = self.lock();
        if !out.success() {
            inner.entries.retain(|entry| entry.name != name);
            warn!(namespace = %name, code = out.code, "Namespace creation failed");
            if out.code == SPAWN_FAILURE_CODE {
                return Err(PoolError::CommandUnavailable {
                    name,
                    output: out.output.trim().to_string(),
                });
            }
            return Err(PoolError::CreateFailed {
                name,
                output: out.output.trim().to_string(),
            });
        }
        if let Some(entry) = inner.entries.iter_mut().find(|entry| entry.name == name) {
            entry.state = NamespaceState::InUse;
        }
        Ok(name)
    }

    /// Sweep a namespace after its test and return it to the free list.
    ///
    /// If the sweep cannot be verified within the cleanup timeout the
    /// namespace is marked tainted and never handed out again. Neither
    /// outcome is an error for the test that used it.
    pub fn release(&self, name: &str) -> Result<ReleaseOutcome, PoolError> {
        self.transition(name, NamespaceState::Cleaning)?;

        info!(namespace = %name, "Cleaning namespace");
        for kind in CLEANUP_KINDS {
            // Best effort; verification below decides the outcome.
            let out = self.runner.invoke(&[
                "delete",
                *kind,
                "--all",
                "--force=true",
                "--now=true",
                "--namespace",
                name,
            ]);
            if !out.success() {
                debug!(namespace = %name, kind, output = %out.output.trim(), "Bulk delete reported failure");
            }
        }

        let outcome = self.config.verify.wait(|| {
            let out = self.runner.invoke(&["get", "all", "--namespace", name]);
            Probe::when(
                out.contains("No resources found"),
                format!("Didn't clean up all the way:\n{}", out.output.trim()),
            )
        });

        let mut inner = self.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|entry| entry.name == name)
            .ok_or_else(|| PoolError::UnknownNamespace(name.to_string()))?;

        if outcome.satisfied {
            entry.state = NamespaceState::Free;
            debug!(namespace = %name, attempts = outcome.attempts, "Namespace reclaimed");
            Ok(ReleaseOutcome::Reclaimed)
        } else {
            entry.state = NamespaceState::Tainted;
            let reason = outcome
                .last_error
                .unwrap_or_else(|| "cleanup not verified".to_string());
            warn!(namespace = %name, reason = %reason, "Namespace cleanup timed out; namespace tainted");
            Ok(ReleaseOutcome::Tainted { reason })
        }
    }

    fn transition(&self, name: &str, to: NamespaceState) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|entry| entry.name == name)
            .ok_or_else(|| PoolError::UnknownNamespace(name.to_string()))?;
        if entry.state != NamespaceState::InUse {
            return Err(PoolError::NotInUse {
                name: name.to_string(),
                state: entry.state,
            });
        }
        entry.state = to;
        Ok(())
    }

    /// Delete every namespace this pool ever created and confirm each is gone.
    ///
    /// Only called at shutdown, after all tests have finished. Deleted
    /// namespaces stay in the snapshot as [`NamespaceState::Destroyed`].
    pub fn destroy_all(&self) -> DestroyReport {
        let names: Vec<String> = self
            .lock()
            .entries
            .iter()
            .filter(|e| e.state != NamespaceState::Destroyed)
            .map(|e| e.name.clone())
            .collect();
        let mut report = DestroyReport::default();
        if names.is_empty() {
            return report;
        }

        info!(namespaces = ?names, "Deleting namespaces");
        let mut args = vec!["delete", "namespace", "--force=true"];
        args.extend(names.iter().map(String::as_str));
        let out = self.runner.invoke(&args);
        if !out.success() {
            debug!(code = out.code, output = %out.output.trim(), "Bulk namespace delete reported failure");
        }

        for name in &names {
            let outcome = self.config.verify.wait(|| {
                if !self.runner.invoke(&["get", "namespace", name.as_str()]).success() {
                    return Probe::ready();
                }
                let out = self
                    .runner
                    .invoke(&["delete", "namespace", "--force=true", name.as_str()]);
                Probe::pending(format!("it just won't go away!\n{}", out.output.trim()))
            });

            if outcome.satisfied {
                report.deleted.push(name.clone());
            } else {
                let reason = outcome.last_error.unwrap_or_default();
                warn!(namespace = %name, reason = %reason, "Error deleting namespace");
                report.failed.push((name.clone(), reason));
            }
        }

        let mut inner = self.lock();
        for entry in inner.entries.iter_mut() {
            if report.deleted.contains(&entry.name) {
                entry.state = NamespaceState::Destroyed;
            }
        }
        report
    }

    /// Current state of every pooled namespace, in creation order.
    pub fn snapshot(&self) -> Vec<NamespaceStatus> {
        self.lock()
            .entries
            .iter()
            .map(|entry| NamespaceStatus {
                name: entry.name.clone(),
                state: entry.state,
            })
            .collect()
    }

    /// Names of namespaces that could not be cleaned.
    pub fn tainted(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.state == NamespaceState::Tainted)
            .map(|entry| entry.name.clone())
            .collect()
    }
}
