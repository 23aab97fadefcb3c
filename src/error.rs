//! Error taxonomy for the matrix executor.
//!
//! - [`DescriptorError`]: configuration problems. Fatal for the whole run.
//! - [`ResolutionError`]: dependency installation failed for one variant. Contained and recorded.
//! - [`MatrixError`]: anything that escapes per-variant control flow and aborts the run.
//! - [`ChildError`]: the child could not start its tests. Surfaces as a failed pair in the parent.

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Malformed or missing environment descriptor.
#[derive(Debug, Error, Diagnostic)]
pub enum DescriptorError {
    #[error("no envfile found at {}", path.display())]
    #[diagnostic(
        code(envmatrix::descriptor::missing),
        help("each suite directory needs an envfile.json listing its environments")
    )]
    Missing { path: PathBuf },

    #[error("failed to read {}", path.display())]
    #[diagnostic(code(envmatrix::descriptor::io))]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed envfile {}", path.display())]
    #[diagnostic(
        code(envmatrix::descriptor::malformed),
        help("environments must be an array of null, strings, or {{\"name\", \"manifest\"}} objects")
    )]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("suite '{0}' not found")]
    #[diagnostic(code(envmatrix::descriptor::unknown_suite))]
    UnknownSuite(String),
}

/// Dependency resolution failed for one variant.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("dependency installation failed after {attempts} attempt(s)")]
    InstallFailed { attempts: u32, output: String },

    #[error("failed to prepare environment directory {}", path.display())]
    Layout {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire resolution lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResolutionError {
    /// Output captured from the failing tool invocation, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ResolutionError::InstallFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Errors that abort the matrix run.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("{hook} hook failed for suite '{suite}'")]
    Hook {
        suite: String,
        hook: &'static str,
        output: String,
    },

    #[error("environment task panicked: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors inside a child process, before or while running the tests.
#[derive(Debug, Error)]
pub enum ChildError {
    #[error("malformed options blob")]
    Options(#[source] serde_json::Error),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("environment {index} has no resolved lock at {}", path.display())]
    MissingLock { index: usize, path: PathBuf },

    #[error("failed to run tests: {0}")]
    Run(#[from] io::Error),
}

pub type MatrixResult<T> = Result<T, MatrixError>;
