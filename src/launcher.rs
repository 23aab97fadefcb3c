//! Child process launching.
//!
//! Each (variant, method) pair runs in its own process: the orchestrator re-invokes its own binary with the
//! hidden `child` subcommand, passing the suite directory, variant index, method and an options blob. The
//! child's stdout and stderr are merged into one pipe and forwarded chunk by chunk.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::Stdio;

use envmatrix_core::{InstrumentationMethod, RunOptions};
use serde::{Deserialize, Serialize};

use crate::config::MatrixConfig;
use crate::shell::merged_output_command;

/// Set on every child so the code under test leaves background harvesting to the tests.
pub const DISABLE_HARVEST_VAR: &str = "ENVMATRIX_DISABLE_HARVEST";
/// Set when the suite runs without the fake collector service.
pub const NO_FAKE_COLLECTOR_VAR: &str = "ENVMATRIX_NO_FAKE_COLLECTOR";
pub const ENV_INDEX_VAR: &str = "ENVMATRIX_ENV_INDEX";
pub const METHOD_VAR: &str = "ENVMATRIX_METHOD";
pub const VERBOSE_VAR: &str = "ENVMATRIX_VERBOSE";

/// Configuration handed to the child as a JSON blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildOptions {
    pub suite: String,
    pub options: RunOptions,
    pub config: MatrixConfig,
}

impl ChildOptions {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}

/// One child invocation.
#[derive(Debug, Clone)]
pub struct ChildRequest {
    pub suite: String,
    pub suite_dir: PathBuf,
    pub index: usize,
    pub method: Option<InstrumentationMethod>,
    pub options: RunOptions,
    pub config: MatrixConfig,
    pub omit_collector: bool,
}

impl ChildRequest {
    /// Arguments for the `child` subcommand.
    pub fn args(&self) -> io::Result<Vec<OsString>> {
        let blob = ChildOptions {
            suite: self.suite.clone(),
            options: self.options.clone(),
            config: self.config.clone(),
        }
        .encode()
        .map_err(io::Error::other)?;

        let mut args: Vec<OsString> = vec![
            "child".into(),
            "--dir".into(),
            self.suite_dir.clone().into_os_string(),
            "--env".into(),
            self.index.to_string().into(),
            "--options".into(),
            blob.into(),
        ];
        if let Some(method) = &self.method {
            args.push("--method".into());
            args.push(method.as_str().into());
        }
        Ok(args)
    }

    /// Environment variables set on the child process.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![(DISABLE_HARVEST_VAR, "1".to_string()), (ENV_INDEX_VAR, self.index.to_string())];
        if let Some(method) = &self.method {
            vars.push((METHOD_VAR, method.as_str().to_string()));
        }
        if self.omit_collector {
            vars.push((NO_FAKE_COLLECTOR_VAR, "1".to_string()));
        }
        if self.options.verbose {
            vars.push((VERBOSE_VAR, "1".to_string()));
        }
        vars
    }
}

/// Launches children and reports whether they passed.
pub trait ChildLauncher: Send + Sync {
    /// Run the child to completion, handing each chunk of its combined output to `on_output`.
    fn launch(&self, request: &ChildRequest, on_output: &mut dyn FnMut(&str)) -> io::Result<bool>;
}

impl<F> ChildLauncher for F
where
    F: Fn(&ChildRequest, &mut dyn FnMut(&str)) -> io::Result<bool> + Send + Sync,
{
    fn launch(&self, request: &ChildRequest, on_output: &mut dyn FnMut(&str)) -> io::Result<bool> {
        self(request, on_output)
    }
}

/// Launches children by re-invoking a program (normally this binary).
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl ChildLauncher for ProcessLauncher {
    fn launch(&self, request: &ChildRequest, on_output: &mut dyn FnMut(&str)) -> io::Result<bool> {
        let mut cmd = merged_output_command(&self.program, request.args()?);
        cmd.current_dir(&request.suite_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (key, value) in request.env_vars() {
            cmd.env(key, value);
        }

        tracing::debug!(suite = %request.suite, index = request.index, "launching child");
        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                on_output(&String::from_utf8_lossy(&line));
            }
        }
        Ok(child.wait()?.success())
    }
}
