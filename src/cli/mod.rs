//! CLI module for envmatrix
//!
//! ## Commands
//!
//! - `run [suite|all]` - Run the test matrix (default when no subcommand is given)
//! - `prime [suite|all]` - Resolve and cache every variant without running tests
//! - `list [suite|all]` - Print suites, their variants and instrumentation methods
//! - `clean [suite]` - Remove cached lock files
//! - `child` (hidden) - Entry point of the per-variant child process
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};
use envmatrix_core::{EnvFilter, RunOptions};

use crate::config::{MatrixConfig, ToolConfig};

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }

    /// Failure whose message carries the full `source()` chain of `err`.
    pub fn from_error(context: &str, err: &dyn Error) -> Self {
        let mut message = format!("Error: {context}: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(&format!("\n  caused by: {cause}"));
            source = cause.source();
        }
        Self::failure(message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Run a test suite across a matrix of dependency environments
#[derive(Parser, Debug)]
#[command(name = "envmatrix")]
#[command(version = VERSION)]
#[command(about = "Run a test suite across a matrix of dependency environments", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub layout: LayoutArgs,

    /// Arguments of the default `run` action
    #[command(flatten)]
    pub run: RunArgs,
}

/// Host layout, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    /// Directory containing one subdirectory per suite
    #[arg(long, global = true, value_name = "DIR", default_value = "test/multiverse/suites")]
    pub suites_dir: PathBuf,

    /// Directory where variant environments are materialized
    #[arg(long, global = true, value_name = "DIR", default_value = "target/envmatrix")]
    pub work_dir: PathBuf,

    /// Resolved-lock cache directory
    #[arg(long, global = true, value_name = "DIR", env = "ENVMATRIX_CACHE_DIR", default_value = "target/envmatrix-cache")]
    pub cache_dir: PathBuf,

    /// Runtime tag scoping the host-wide resolution lock
    #[arg(long, global = true, env = "ENVMATRIX_RUNTIME", default_value = "default")]
    pub runtime: String,

    /// Override the dependency installation command
    #[arg(long, global = true, value_name = "COMMAND", env = "ENVMATRIX_INSTALL_COMMAND")]
    pub install_command: Option<String>,

    /// Disable colors in the final report
    #[arg(long, global = true, env = "NO_COLOR", value_parser = FalseyValueParser::new())]
    pub no_color: bool,
}

impl LayoutArgs {
    /// Build the absolute host layout; children run in other directories.
    pub fn config(&self) -> CliResult<MatrixConfig> {
        let mut tool = ToolConfig::default();
        if let Some(command) = &self.install_command {
            tool.command = command.clone();
        }
        MatrixConfig::new()
            .with_suites_dir(&self.suites_dir)
            .with_work_dir(&self.work_dir)
            .with_cache_dir(&self.cache_dir)
            .with_runtime(&self.runtime)
            .with_tool(tool)
            .absolutize()
            .map_err(|e| CliError::from_error("cannot resolve working directories", &e))
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Suite to run, or `all`
    #[arg(value_name = "SUITE", default_value = "all")]
    pub suite: String,

    /// Only run the environment with this index or name
    #[arg(short, long = "env", value_name = "INDEX|NAME", env = "ENVMATRIX_ENV")]
    pub env: Option<EnvFilter>,

    /// Only run this instrumentation method
    #[arg(short, long, value_name = "METHOD", env = "ENVMATRIX_METHOD")]
    pub method: Option<String>,

    /// Only run tests whose name matches
    #[arg(short, long, value_name = "PATTERN")]
    pub name: Option<String>,

    /// Seed for test ordering
    #[arg(long)]
    pub seed: Option<u64>,

    /// Always resolve dependencies fresh
    #[arg(long)]
    pub no_cache: bool,

    /// Verbose output
    #[arg(short, long, env = "ENVMATRIX_VERBOSE", value_parser = FalseyValueParser::new())]
    pub verbose: bool,

    /// Debug mode: serial execution with live output
    #[arg(long)]
    pub debug: bool,

    /// Run variants one at a time
    #[arg(long, env = "ENVMATRIX_SERIALIZE", value_parser = FalseyValueParser::new())]
    pub serialize: bool,

    /// Skip variants not yet started once one fails
    #[arg(short = 'x', long)]
    pub fail_fast: bool,
}

impl RunArgs {
    pub fn options(&self) -> RunOptions {
        RunOptions::new()
            .with_verbose(self.verbose)
            .with_debug(self.debug)
            .with_seed(self.seed)
            .with_name_filter(self.name.clone())
            .with_cache(!self.no_cache)
            .with_env_filter(self.env.clone().unwrap_or_default())
            .with_method_filter(self.method.clone())
            .with_serialize(self.serialize)
            .with_fail_fast(self.fail_fast)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the test matrix
    Run(RunArgs),

    /// Resolve and cache every variant without running tests
    Prime {
        /// Suite to prime, or `all`
        #[arg(value_name = "SUITE", default_value = "all")]
        suite: String,
        /// Only prime the environment with this index or name
        #[arg(short, long = "env", value_name = "INDEX|NAME", env = "ENVMATRIX_ENV")]
        env: Option<EnvFilter>,
    },

    /// List suites, variants and instrumentation methods
    List {
        #[arg(value_name = "SUITE", default_value = "all")]
        suite: String,
    },

    /// Remove cached lock files
    Clean {
        /// Only clean this suite's entries
        #[arg(value_name = "SUITE")]
        suite: Option<String>,
    },

    /// Run one environment's tests (spawned by the matrix executor)
    #[command(hide = true)]
    Child {
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
        #[arg(long)]
        env: usize,
        #[arg(long, value_name = "JSON")]
        options: String,
        #[arg(long)]
        method: Option<String>,
    },
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    let layout = cli.layout;
    match cli.command {
        Some(Command::Run(args)) => commands::run_matrix(&layout, &args),
        Some(Command::Prime { suite, env }) => commands::prime(&layout, &suite, env.unwrap_or_default()),
        Some(Command::List { suite }) => commands::list(&layout, &suite),
        Some(Command::Clean { suite }) => commands::clean(&layout, suite.as_deref()),
        Some(Command::Child {
            dir,
            env,
            options,
            method,
        }) => commands::child(&dir, env, &options, method.as_deref()),
        None => commands::run_matrix(&layout, &cli.run),
    }
}

// ============================================================================
// Tests
// ============================================================================
