//! Shell command execution with bounded retries.
//!
//! Every command runs through `sh -c` with stderr folded into stdout, so callers see one combined stream in the
//! order the process wrote it.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A shell command line plus the context it runs in.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    line: String,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// Run once with inherited stdio, returning whether it exited 0.
    pub fn status(&self) -> io::Result<bool> {
        let mut cmd = self.to_command();
        cmd.stdin(Stdio::inherit());
        Ok(cmd.status()?.success())
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("exec 2>&1\n{}", self.line));
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// Result of running a command, possibly several times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Combined output of the last attempt
    pub output: String,
    pub succeeded: bool,
    /// Number of attempts actually made
    pub attempts: u32,
}

/// Run `command` up to `max_attempts` times, retrying immediately on non-zero exit.
///
/// Returns the first successful attempt, or the last failure once attempts are exhausted. A `max_attempts` of 0
/// is treated as 1. Failing to spawn `sh` at all counts as a failed attempt whose output is the spawn error.
#[tracing::instrument(skip_all, fields(command = %command.line, max_attempts = max_attempts))]
pub fn run(command: &ShellCommand, max_attempts: u32) -> CommandOutcome {
    let max_attempts = max_attempts.max(1);
    let mut last = CommandOutcome {
        output: String::new(),
        succeeded: false,
        attempts: 0,
    };

    for attempt in 1..=max_attempts {
        let (output, succeeded) = match command.to_command().output() {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                (text, out.status.success())
            }
            Err(e) => (format!("failed to spawn `{}`: {}", command.line, e), false),
        };

        last = CommandOutcome {
            output,
            succeeded,
            attempts: attempt,
        };
        if succeeded {
            break;
        }
        if attempt < max_attempts {
            tracing::debug!(attempt, "command failed, retrying");
        }
    }

    if !last.succeeded {
        tracing::warn!(attempts = last.attempts, "command failed on every attempt");
    }
    last
}

/// Build a command for `program args...` whose stderr is merged into its stdout pipe.
///
/// The program is `exec`ed by the shell, so the returned command's child *is* the program.
pub fn merged_output_command<I, S>(program: impl AsRef<OsStr>, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg("exec \"$0\" \"$@\" 2>&1").arg(program).args(args);
    cmd
}
