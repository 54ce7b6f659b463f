//! Cluster command invocation.
//!
//! The engine only depends on the request/response contract of the cluster
//! control command: arguments in, one exit code and one merged text blob out.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

/// Exit code reported when the command could not be spawned at all.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Outcome of one cluster command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (0 = success).
    pub code: i32,
    /// Standard output and standard error, merged.
    pub output: String,
}

impl CommandOutput {
    pub fn new(code: i32, output: impl Into<String>) -> Self {
        Self {
            code,
            output: output.into(),
        }
    }

    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Check if the merged output contains a pattern
    pub fn contains(&self, pattern: &str) -> bool {
        self.output.contains(pattern)
    }
}

/// Something that can run cluster control commands.
///
/// Implementations must be callable from many test tasks at once.
pub trait CommandRunner: Send + Sync {
    /// Run the command with `args`, optionally inside `workdir`.
    fn run(&self, args: &[String], workdir: Option<&Path>) -> CommandOutput;

    /// Convenience wrapper taking string slices.
    fn invoke(&self, args: &[&str]) -> CommandOutput {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&args, None)
    }
}

/// Runs the real `kubectl` (or a compatible program).
#[derive(Debug, Clone)]
pub struct KubectlRunner {
    program: PathBuf,
}

impl KubectlRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for KubectlRunner {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl CommandRunner for KubectlRunner {
    fn run(&self, args: &[String], workdir: Option<&Path>) -> CommandOutput {
        let command_line = mask_sensitive_args(&self.program.to_string_lossy(), args);
        debug!(command = %command_line, "Executing cluster command");

        let start = Instant::now();
        let mut cmd = Command::new(&self.program);
        cmd.args(args.iter().map(OsString::from))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command = %command_line, error = %err, "Failed to spawn cluster command");
                return CommandOutput::new(
                    SPAWN_FAILURE_CODE,
                    format!("failed to run {}: {err}", self.program.display()),
                );
            }
        };

        // Drain both pipes concurrently so neither can fill up and stall the child.
        let stderr_handle = child
            .stderr
            .take()
            .map(|mut stderr| thread::spawn(move || read_to_string(&mut stderr)));
        let stdout = child
            .stdout
            .take()
            .map(|mut stdout| read_to_string(&mut stdout))
            .unwrap_or_default();
        let stderr = stderr_handle
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default();

        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                warn!(command = %command_line, error = %err, "Failed to wait for cluster command");
                -1
            }
        };

        let mut output = stdout;
        output.push_str(&stderr);

        debug!(
            command = %command_line,
            code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Cluster command finished"
        );
        CommandOutput { code, output }
    }
}

fn read_to_string<R: Read>(reader: &mut R) -> String {
    let mut buffer = Vec::new();
    if reader.read_to_end(&mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).to_string()
    } else {
        String::new()
    }
}

const SENSITIVE_FLAGS: &[&str] = &["--token", "--password", "--client-key", "--username"];

/// Render a command line for logging with credential values replaced by `***`.
pub fn mask_sensitive_args(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    let mut mask_next = false;

    for arg in args {
        if mask_next {
            parts.push("***".to_string());
            mask_next = false;
            continue;
        }
        if let Some((flag, _)) = arg.split_once('=')
            && SENSITIVE_FLAGS.contains(&flag)
        {
            parts.push(format!("{flag}=***"));
            continue;
        }
        if SENSITIVE_FLAGS.contains(&arg.as_str()) {
            mask_next = true;
        }
        parts.push(arg.clone());
    }

    parts.join(" ")
}
