//! Environment descriptors
//!
//! The executor consumes a suite's environments through the [`EnvironmentSource`] trait. The on-disk
//! implementation is [`Envfile`], a JSON document living next to the suite's tests:
//!
//! ```json
//! {
//!   "manifest_prelude": "source 'https://rubygems.org'",
//!   "instrumentation_methods": ["chain", "prepend"],
//!   "serialize": false,
//!   "condition": "command -v redis-server",
//!   "skip_message": "redis-server is not installed",
//!   "before_suite": "./script/start-db",
//!   "after_suite": "./script/stop-db",
//!   "test_command": "ruby -Itest test/run.rb",
//!   "environments": [
//!     "gem 'rack', '~> 3.0'",
//!     { "name": "rack-2", "manifest": "gem 'rack', '~> 2.2'" },
//!     null
//!   ]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use envmatrix_core::{InstrumentationMethod, VariantDescriptor};
use serde::Deserialize;

use crate::config::{ENVFILE_NAME, MatrixConfig, is_suite_dir};
use crate::error::DescriptorError;
use crate::shell::{self, ShellCommand};

/// Contract between the executor and whatever describes a suite's environments.
///
/// Hooks return the captured output as the error when they fail.
pub trait EnvironmentSource: Send + Sync {
    fn suite_name(&self) -> &str;

    /// Number of declared variants, skipped ones included.
    fn count(&self) -> usize;

    fn variant(&self, index: usize) -> Option<VariantDescriptor>;

    /// Variants in ascending index order.
    fn variants(&self) -> Vec<VariantDescriptor> {
        (0..self.count()).filter_map(|i| self.variant(i)).collect()
    }

    /// Whether the suite requires serial execution.
    fn serialize(&self) -> bool {
        false
    }

    /// Whether children should run without the fake collector service.
    fn omit_collector(&self) -> bool {
        false
    }

    /// Declared instrumentation methods. Empty means a single unnamed permutation.
    fn instrumentation_methods(&self) -> Vec<InstrumentationMethod> {
        Vec::new()
    }

    /// Skip predicate: `false` skips every variant of the suite.
    fn should_run(&self) -> bool {
        true
    }

    fn skip_message(&self) -> Option<String> {
        None
    }

    fn before_suite(&self) -> Result<(), String> {
        Ok(())
    }

    fn after_suite(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvironmentEntry {
    Manifest(String),
    Named {
        name: Option<String>,
        manifest: Option<String>,
    },
}

/// Parsed `envfile.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvfileSpec {
    #[serde(default)]
    environments: Vec<Option<EnvironmentEntry>>,
    #[serde(default)]
    pub manifest_prelude: Option<String>,
    #[serde(default)]
    pub instrumentation_methods: Vec<String>,
    #[serde(default)]
    pub serialize: bool,
    #[serde(default)]
    pub omit_collector: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub skip_message: Option<String>,
    #[serde(default)]
    pub before_suite: Option<String>,
    #[serde(default)]
    pub after_suite: Option<String>,
    /// Command the child runs inside the resolved environment.
    pub test_command: String,
    /// Package whose locked version selects the test framework adapter.
    #[serde(default = "default_framework_package")]
    pub framework_package: String,
}

fn default_framework_package() -> String {
    "minitest".to_string()
}

/// A suite's descriptor loaded from disk.
#[derive(Debug, Clone)]
pub struct Envfile {
    suite: String,
    suite_dir: PathBuf,
    spec: EnvfileSpec,
}

impl Envfile {
    /// Load `<suites_dir>/<suite>/envfile.json`.
    pub fn load(config: &MatrixConfig, suite: &str) -> Result<Self, DescriptorError> {
        Self::load_dir(suite, &config.suite_dir(suite))
    }

    /// Load the envfile of the suite living in `suite_dir`.
    pub fn load_dir(suite: &str, suite_dir: &Path) -> Result<Self, DescriptorError> {
        if !suite_dir.is_dir() {
            return Err(DescriptorError::UnknownSuite(suite.to_string()));
        }
        let path = suite_dir.join(ENVFILE_NAME);
        if !path.is_file() {
            return Err(DescriptorError::Missing { path });
        }
        let text = fs::read_to_string(&path).map_err(|source| DescriptorError::Read {
            path: path.clone(),
            source,
        })?;
        let spec = serde_json::from_str(&text).map_err(|source| DescriptorError::Malformed { path, source })?;
        Ok(Self {
            suite: suite.to_string(),
            suite_dir: suite_dir.to_path_buf(),
            spec,
        })
    }

    /// Build from an already-parsed JSON document.
    pub fn from_json(suite: &str, suite_dir: impl Into<PathBuf>, json: &str) -> Result<Self, DescriptorError> {
        let suite_dir = suite_dir.into();
        let spec = serde_json::from_str(json).map_err(|source| DescriptorError::Malformed {
            path: suite_dir.join(ENVFILE_NAME),
            source,
        })?;
        Ok(Self {
            suite: suite.to_string(),
            suite_dir,
            spec,
        })
    }

    pub fn spec(&self) -> &EnvfileSpec {
        &self.spec
    }

    fn run_hook(&self, hook: Option<&String>) -> Result<(), String> {
        let Some(line) = hook else {
            return Ok(());
        };
        let outcome = shell::run(&ShellCommand::new(line.as_str()).current_dir(&self.suite_dir), 1);
        if outcome.succeeded { Ok(()) } else { Err(outcome.output) }
    }
}

impl EnvironmentSource for Envfile {
    fn suite_name(&self) -> &str {
        &self.suite
    }

    fn count(&self) -> usize {
        self.spec.environments.len()
    }

    fn variant(&self, index: usize) -> Option<VariantDescriptor> {
        let entry = self.spec.environments.get(index)?;
        let (name, manifest) = match entry {
            None => (None, None),
            Some(EnvironmentEntry::Manifest(text)) => (None, Some(text.clone())),
            Some(EnvironmentEntry::Named { name, manifest }) => (name.clone(), manifest.clone()),
        };
        let manifest = manifest.filter(|m| !m.trim().is_empty()).map(|m| match &self.spec.manifest_prelude {
            Some(prelude) => format!("{}\n{}", prelude.trim_end(), m),
            None => m,
        });
        let mut variant = VariantDescriptor::new(index, manifest);
        variant.name = name;
        Some(variant)
    }

    fn serialize(&self) -> bool {
        self.spec.serialize
    }

    fn omit_collector(&self) -> bool {
        self.spec.omit_collector
    }

    fn instrumentation_methods(&self) -> Vec<InstrumentationMethod> {
        self.spec.instrumentation_methods.iter().map(InstrumentationMethod::new).collect()
    }

    fn should_run(&self) -> bool {
        match &self.spec.condition {
            None => true,
            Some(line) => shell::run(&ShellCommand::new(line.as_str()).current_dir(&self.suite_dir), 1).succeeded,
        }
    }

    fn skip_message(&self) -> Option<String> {
        self.spec.skip_message.clone()
    }

    fn before_suite(&self) -> Result<(), String> {
        self.run_hook(self.spec.before_suite.as_ref())
    }

    fn after_suite(&self) -> Result<(), String> {
        self.run_hook(self.spec.after_suite.as_ref())
    }
}

/// Suite names under `suites_dir`, sorted.
///
/// Hidden directories and directories without an envfile are ignored.
pub fn discover_suites(suites_dir: &Path) -> Vec<String> {
    let mut suites = Vec::new();
    if let Ok(entries) = fs::read_dir(suites_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.starts_with('.') && is_suite_dir(&path) {
                suites.push(name.to_string());
            }
        }
    }
    suites.sort();
    suites
}
