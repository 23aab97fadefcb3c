//! Host layout and external-tool configuration.
//!
//! [`MatrixConfig`] describes where suites, working environments and the lock cache live, plus the contract with
//! the external dependency tool. Like `RunOptions`, it crosses into the child as part of the options blob.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the descriptor file inside each suite directory.
pub const ENVFILE_NAME: &str = "envfile.json";

/// Contract with the opaque dependency installation tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Shell command that installs the manifest in the current directory, writing the lock file.
    pub command: String,
    /// File name the manifest is written to.
    pub manifest_file: String,
    /// File name of the lock the tool produces.
    pub lock_file: String,
    /// How many times the install command is attempted before giving up.
    pub attempts: u32,
    /// Variable the tool reads to locate the manifest when activating an environment.
    pub activation_var: Option<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: "bundle install".to_string(),
            manifest_file: "Gemfile".to_string(),
            lock_file: "Gemfile.lock".to_string(),
            attempts: 3,
            activation_var: Some("BUNDLE_GEMFILE".to_string()),
        }
    }
}

/// Host layout for a matrix run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Directory containing one subdirectory per suite
    pub suites_dir: PathBuf,
    /// Directory where per-variant environments are materialized
    pub work_dir: PathBuf,
    /// Host-local resolved-lock cache
    pub cache_dir: PathBuf,
    /// Runtime/version tag scoping the host-wide resolution lock
    pub runtime: String,
    pub tool: ToolConfig,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            suites_dir: PathBuf::from("test/multiverse/suites"),
            work_dir: PathBuf::from("target/envmatrix"),
            cache_dir: PathBuf::from("target/envmatrix-cache"),
            runtime: "default".to_string(),
            tool: ToolConfig::default(),
        }
    }
}

impl MatrixConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suites_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.suites_dir = dir.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolConfig) -> Self {
        self.tool = tool;
        self
    }

    /// Resolve every directory against the current working directory.
    ///
    /// Children run inside their suite directory, so the paths they receive must not be relative.
    pub fn absolutize(mut self) -> io::Result<Self> {
        self.suites_dir = std::path::absolute(&self.suites_dir)?;
        self.work_dir = std::path::absolute(&self.work_dir)?;
        self.cache_dir = std::path::absolute(&self.cache_dir)?;
        Ok(self)
    }

    /// Directory holding a suite's tests and envfile.
    pub fn suite_dir(&self, suite: &str) -> PathBuf {
        self.suites_dir.join(suite)
    }

    /// Isolated environment directory for one (suite, method, variant) triple.
    pub fn env_dir(&self, suite: &str, method: Option<&str>, index: usize) -> PathBuf {
        let mut dir = self.work_dir.join(suite);
        if let Some(method) = method {
            dir = dir.join(method);
        }
        dir.join(format!("env-{index}"))
    }

    /// Lock file serializing resolution for this runtime across the host.
    pub fn resolution_lock_path(&self) -> PathBuf {
        self.cache_dir.join(format!("resolve-{}.lock", sanitize(&self.runtime)))
    }

    pub fn envfile_path(&self, suite: &str) -> PathBuf {
        self.suite_dir(suite).join(ENVFILE_NAME)
    }
}

fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Whether `path` looks like a suite directory.
pub fn is_suite_dir(path: &Path) -> bool {
    path.is_dir() && path.join(ENVFILE_NAME).is_file()
}
