#![forbid(unsafe_code)]
//! Multi-environment test matrix executor
//!
//! Runs a test suite once per dependency-version combination ("variant"), each in its own resolved environment
//! and its own child process. Variants run serially or in parallel; resolved lock files are cached per manifest
//! content; all output is gathered into per-variant blocks and a final pass/fail report.
//!
//! ## Layout
//!
//! - [`shell`] - command execution with bounded retries
//! - [`collector`] - synchronized per-variant output buffers and reporting
//! - [`cache`] - content-addressed lock cache and the host-wide resolution lock
//! - [`descriptor`] - the `envfile.json` environment descriptor
//! - [`resolver`] - the per-variant resolution state machine
//! - [`launcher`] / [`child`] / [`framework`] - both sides of the child process boundary
//! - [`matrix`] - strategies, permutations and aggregation
//!
//! ## Panic Policy
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! A panic inside a variant task is reported as [`error::MatrixError::Task`] and aborts the run.

pub mod cache;
pub mod child;
pub mod cli;
pub mod collector;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod framework;
pub mod launcher;
pub mod matrix;
pub mod resolver;
pub mod shell;

pub use envmatrix_core::{
    EnvFilter, EnvKey, InstrumentationMethod, Outcome, RunOptions, VariantDescriptor, aggregate_exit_code,
};

pub use cache::{CacheKey, DependencyCache, ResolutionLock};
pub use collector::{MatrixSummary, OutputCollector, StreamMode};
pub use config::{MatrixConfig, ToolConfig};
pub use descriptor::{EnvironmentSource, Envfile, discover_suites};
pub use error::{ChildError, DescriptorError, MatrixError, MatrixResult, ResolutionError};
pub use launcher::{ChildLauncher, ChildRequest, ProcessLauncher};
pub use matrix::{MatrixExecutor, MatrixReport, Strategy, SuiteReport};
pub use resolver::{DependencyTool, EnvironmentState, Resolver, ShellDependencyTool};
pub use shell::{CommandOutcome, ShellCommand};
