//! Test framework adapters.
//!
//! The child never patches the test framework it drives. Instead it talks to it through [`TestFramework`] and
//! picks one adapter per framework shape at startup by probing the resolved lock with [`probe_framework`].

use std::io;
use std::path::PathBuf;

use envmatrix_core::{InstrumentationMethod, RunOptions};

use crate::shell::ShellCommand;

/// Everything a framework adapter needs to run one environment's tests.
#[derive(Debug, Clone)]
pub struct ChildContext {
    pub suite: String,
    pub suite_dir: PathBuf,
    pub env_dir: PathBuf,
    pub index: usize,
    pub method: Option<InstrumentationMethod>,
    pub options: RunOptions,
    pub test_command: String,
    /// Environment variables activating the resolved dependency set.
    pub activation: Vec<(String, String)>,
}

/// Capability interface over one supported framework shape.
pub trait TestFramework {
    fn name(&self) -> &'static str;

    /// Command running the tests with the context's options applied.
    fn command(&self, ctx: &ChildContext) -> ShellCommand;

    /// Run the tests, streaming output to this process's stdout. Returns whether they passed.
    fn run(&self, ctx: &ChildContext) -> io::Result<bool> {
        self.command(ctx).status()
    }
}

/// Frameworks taking options as command-line arguments (`--name`, `--seed`, `--verbose`).
#[derive(Debug, Default)]
pub struct ArgsFramework;

impl TestFramework for ArgsFramework {
    fn name(&self) -> &'static str {
        "args"
    }

    fn command(&self, ctx: &ChildContext) -> ShellCommand {
        let mut line = ctx.test_command.clone();
        for arg in option_args(&ctx.options) {
            line.push(' ');
            line.push_str(&shell_quote(&arg));
        }
        base_command(ctx, line)
    }
}

/// Older frameworks that only read their options from the `TESTOPTS` environment variable.
#[derive(Debug, Default)]
pub struct LegacyEnvFramework;

impl TestFramework for LegacyEnvFramework {
    fn name(&self) -> &'static str {
        "legacy-env"
    }

    fn command(&self, ctx: &ChildContext) -> ShellCommand {
        let opts = option_args(&ctx.options);
        let command = base_command(ctx, ctx.test_command.clone());
        if opts.is_empty() {
            command
        } else {
            command.env("TESTOPTS", opts.join(" "))
        }
    }
}

fn base_command(ctx: &ChildContext, line: String) -> ShellCommand {
    let mut command = ShellCommand::new(line).current_dir(&ctx.suite_dir);
    for (key, value) in &ctx.activation {
        command = command.env(key.as_str(), value.as_str());
    }
    command
}

fn option_args(options: &RunOptions) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(filter) = &options.name_filter {
        args.push(format!("--name={filter}"));
    }
    if let Some(seed) = options.seed {
        args.push(format!("--seed={seed}"));
    }
    if options.verbose {
        args.push("--verbose".to_string());
    }
    args
}

/// Quote `arg` for `sh` unless it is made only of safe characters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '.' | '/' | ':' | ','));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Major version of `package` pinned in `lock`, if any.
///
/// Lock entries look like `    minitest (5.20.0)`.
pub fn locked_major_version(lock: &str, package: &str) -> Option<u64> {
    let prefix = format!("{package} (");
    lock.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .and_then(|rest| rest.split(|c: char| c == '.' || c == ')' || c == '-').next())
        .and_then(|major| major.trim().parse().ok())
}

/// Pick the adapter for the framework `package` as locked in `lock`.
///
/// Versions before 5 only read options from the environment; anything newer, or an unpinned framework, takes
/// them as arguments.
pub fn probe_framework(lock: &str, package: &str) -> Box<dyn TestFramework> {
    match locked_major_version(lock, package) {
        Some(major) if major < 5 => Box::new(LegacyEnvFramework),
        _ => Box::new(ArgsFramework),
    }
}
