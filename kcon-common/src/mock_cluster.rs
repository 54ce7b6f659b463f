//! In-memory cluster for tests.
//!
//! [`MockCluster`] implements [`CommandRunner`] by simulating the handful of
//! commands the engine itself issues (context lookup, namespace lifecycle,
//! bulk deletes, `get all`). Tests can seed objects, inject failures, add
//! latency, and inspect the recorded call log. It does not shell out.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::runner::{CommandOutput, CommandRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MockObject {
    kind: String,
    name: String,
}

#[derive(Debug, Default)]
struct MockState {
    context: Option<String>,
    namespaces: BTreeMap<String, Vec<MockObject>>,
    calls: Vec<Vec<String>>,
    scripted: Vec<(Vec<String>, CommandOutput)>,
    queued: Vec<(Vec<String>, CommandOutput)>,
    fail_create: HashSet<String>,
    sticky: HashSet<String>,
}

#[derive(Debug)]
pub struct MockCluster {
    state: Mutex<MockState>,
    latency: Duration,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// A healthy cluster with a current context and no namespaces.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                context: Some("mock-context".to_string()),
                ..MockState::default()
            }),
            latency: Duration::ZERO,
        }
    }

    /// Delay every command by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the current context so preflight fails.
    pub fn clear_context(&self) {
        self.state().context = None;
    }

    /// Make `create namespace <name>` fail.
    pub fn fail_namespace_creation(&self, name: &str) {
        self.state().fail_create.insert(name.to_string());
    }

    /// Objects in `namespace` survive bulk deletes, so cleanup never verifies.
    pub fn make_sticky(&self, namespace: &str) {
        self.state().sticky.insert(namespace.to_string());
    }

    /// Seed an object into an existing namespace.
    pub fn add_object(&self, namespace: &str, kind: &str, name: &str) -> bool {
        let mut state = self.state();
        match state.namespaces.get_mut(namespace) {
            Some(objects) => {
                objects.push(MockObject {
                    kind: singular(kind),
                    name: name.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Respond to any command whose arguments start with `prefix`.
    ///
    /// Scripted responses take precedence over the simulation.
    pub fn script(&self, prefix: &[&str], output: CommandOutput) {
        let prefix = prefix.iter().map(|s| s.to_string()).collect();
        self.state().scripted.push((prefix, output));
    }

    /// Respond once to the next command starting with `prefix`.
    ///
    /// Queued responses are used up in the order they were added and take
    /// precedence over [`script`](Self::script).
    pub fn script_once(&self, prefix: &[&str], output: CommandOutput) {
        let prefix = prefix.iter().map(|s| s.to_string()).collect();
        self.state().queued.push((prefix, output));
    }

    /// Names of namespaces that currently exist.
    pub fn namespaces(&self) -> Vec<String> {
        self.state().namespaces.keys().cloned().collect()
    }

    /// Number of objects left in `namespace`.
    pub fn object_count(&self, namespace: &str) -> usize {
        self.state()
            .namespaces
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Every command seen so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state().calls.clone()
    }

    /// Count recorded commands starting with `prefix`.
    pub fn count_calls(&self, prefix: &[&str]) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| starts_with(call, prefix))
            .count()
    }

    fn handle(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state();
        state.calls.push(args.to_vec());

        if let Some(pos) = state
            .queued
            .iter()
            .position(|(prefix, _)| args.starts_with(prefix))
        {
            return state.queued.remove(pos).1;
        }

        if let Some((_, output)) = state
            .scripted
            .iter()
            .find(|(prefix, _)| args.starts_with(prefix))
        {
            return output.clone();
        }

        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        let namespace = namespace_flag(&words);
        let positional: Vec<&str> = words
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, w)| {
                !w.starts_with('-') && !(*i > 0 && matches!(words[i - 1], "--namespace" | "-n"))
            })
            .map(|(_, w)| w)
            .collect();

        match positional.as_slice() {
            ["config", "current-context"] => match &state.context {
                Some(ctx) => CommandOutput::new(0, format!("{ctx}\n")),
                None => CommandOutput::new(1, "error: current-context is not set\n"),
            },
            ["create", "namespace", name] => {
                if state.fail_create.contains(*name) {
                    return CommandOutput::new(
                        1,
                        format!("Error from server (Forbidden): namespaces \"{name}\" is forbidden\n"),
                    );
                }
                if state.namespaces.contains_key(*name) {
                    return CommandOutput::new(
                        1,
                        format!("Error from server (AlreadyExists): namespaces \"{name}\" already exists\n"),
                    );
                }
                state.namespaces.insert(name.to_string(), Vec::new());
                CommandOutput::new(0, format!("namespace/{name} created\n"))
            }
            ["get", "namespace", name] => {
                if state.namespaces.contains_key(*name) {
                    CommandOutput::new(0, format!("NAME STATUS\n{name} Active\n"))
                } else {
                    CommandOutput::new(
                        1,
                        format!("Error from server (NotFound): namespaces \"{name}\" not found\n"),
                    )
                }
            }
            ["delete", "namespace", names @ ..] if !names.is_empty() => {
                let mut out = String::new();
                let mut code = 0;
                for name in names {
                    if state.namespaces.remove(*name).is_some() {
                        out.push_str(&format!("namespace \"{name}\" deleted\n"));
                    } else {
                        code = 1;
                        out.push_str(&format!(
                            "Error from server (NotFound): namespaces \"{name}\" not found\n"
                        ));
                    }
                }
                CommandOutput::new(code, out)
            }
            ["delete", kind] if words.contains(&"--all") => {
                let Some(ns) = namespace else {
                    return CommandOutput::new(1, "error: namespace required\n");
                };
                let sticky = state.sticky.contains(ns);
                let kind = singular(kind);
                match state.namespaces.get_mut(ns) {
                    Some(objects) => {
                        if !sticky {
                            objects.retain(|obj| obj.kind != kind);
                        }
                        CommandOutput::new(0, "")
                    }
                    None => CommandOutput::new(
                        1,
                        format!("Error from server (NotFound): namespaces \"{ns}\" not found\n"),
                    ),
                }
            }
            ["get", "all"] => {
                let ns = namespace.unwrap_or("default");
                match state.namespaces.get(ns) {
                    Some(objects) if objects.is_empty() => {
                        CommandOutput::new(0, format!("No resources found in {ns} namespace.\n"))
                    }
                    Some(objects) => {
                        let mut out = String::from("NAME\n");
                        for obj in objects {
                            out.push_str(&format!("{}/{}\n", obj.kind, obj.name));
                        }
                        CommandOutput::new(0, out)
                    }
                    None => CommandOutput::new(0, format!("No resources found in {ns} namespace.\n")),
                }
            }
            _ => CommandOutput::new(1, format!("mock cluster: unsupported command: {}\n", words.join(" "))),
        }
    }
}

impl CommandRunner for MockCluster {
    fn run(&self, args: &[String], _workdir: Option<&Path>) -> CommandOutput {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.handle(args)
    }
}

fn namespace_flag<'a>(words: &[&'a str]) -> Option<&'a str> {
    words.iter().enumerate().find_map(|(i, w)| {
        if let Some(value) = w.strip_prefix("--namespace=") {
            return Some(value);
        }
        if matches!(*w, "--namespace" | "-n") {
            return words.get(i + 1).copied();
        }
        None
    })
}

fn singular(kind: &str) -> String {
    let kind = kind.to_ascii_lowercase();
    kind.strip_suffix('s').map(str::to_string).unwrap_or(kind)
}

fn starts_with(call: &[String], prefix: &[&str]) -> bool {
    call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b)
}
