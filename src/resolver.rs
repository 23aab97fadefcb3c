//! Dependency resolution for one environment.
//!
//! ```text
//! PENDING ──▶ CACHED ──ok──────────────────────────────▶ INSTALLED
//!   │           │ fail (entry cleared)
//!   └─(miss)──▶ FRESH ──ok──(lock stored)──────────────▶ INSTALLED
//!                 │ fail + version mismatch (once)
//!                 └─▶ STALE PIN CLEARED ──ok────────────▶ INSTALLED
//!                                        └─fail────────▶ FAILED
//! ```
//!
//! All tool invocations for a resolution happen while holding the host-wide [`ResolutionLock`], because
//! concurrent native-extension builds corrupt each other.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use envmatrix_core::{InstrumentationMethod, VariantDescriptor};

use crate::cache::{CacheKey, DependencyCache, ResolutionLock};
use crate::config::{MatrixConfig, ToolConfig};
use crate::error::ResolutionError;
use crate::shell::{self, CommandOutcome, ShellCommand};

/// Section header of the resolver version pin inside a lock file.
pub const PIN_SECTION: &str = "BUNDLED WITH";

/// Output fragments meaning the lock was written by an incompatible resolver version.
const MISMATCH_MARKERS: &[&str] = &[PIN_SECTION, "You must use Bundler", "incompatible with the lockfile"];

/// The external dependency installation tool.
///
/// Implementations install the manifest found in `env_dir`, honoring a lock file there if one exists, and leave
/// the resolved lock behind on success.
pub trait DependencyTool: Send + Sync {
    fn install(&self, env_dir: &Path) -> CommandOutcome;
}

impl<F> DependencyTool for F
where
    F: Fn(&Path) -> CommandOutcome + Send + Sync,
{
    fn install(&self, env_dir: &Path) -> CommandOutcome {
        self(env_dir)
    }
}

/// Runs the configured install command through the shell, with retries.
#[derive(Debug, Clone)]
pub struct ShellDependencyTool {
    config: ToolConfig,
}

impl ShellDependencyTool {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }
}

impl DependencyTool for ShellDependencyTool {
    fn install(&self, env_dir: &Path) -> CommandOutcome {
        let command = ShellCommand::new(self.config.command.as_str())
            .current_dir(env_dir)
            .env("ENVMATRIX_MANIFEST", env_dir.join(&self.config.manifest_file).to_string_lossy());
        shell::run(&command, self.config.attempts)
    }
}

/// Install status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Pending,
    Installed { cache_hit: bool },
    Failed,
}

/// A transition taken while resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStep {
    /// Installed from a cached lock.
    Cached,
    /// The cached lock failed to install and was discarded.
    CacheDiscarded,
    /// Resolved from the bare manifest.
    Fresh,
    /// Retried after stripping a stale resolver version pin.
    StalePinCleared,
}

/// Derived state of one (suite, variant, method) environment.
#[derive(Debug, Clone)]
pub struct EnvironmentState {
    pub suite: String,
    pub index: usize,
    pub method: Option<InstrumentationMethod>,
    pub env_dir: PathBuf,
    pub manifest: String,
    pub key: CacheKey,
    /// Resolved lock content, once installed.
    pub lock: Option<String>,
    pub status: InstallStatus,
    pub steps: Vec<ResolveStep>,
}

impl EnvironmentState {
    pub fn new(
        config: &MatrixConfig,
        suite: &str,
        method: Option<&InstrumentationMethod>,
        variant: &VariantDescriptor,
    ) -> Self {
        let manifest = variant.manifest_text().to_string();
        Self {
            suite: suite.to_string(),
            index: variant.index,
            method: method.cloned(),
            env_dir: config.env_dir(suite, method.map(|m| m.as_str()), variant.index),
            key: CacheKey::new(suite, variant.index, &manifest),
            manifest,
            lock: None,
            status: InstallStatus::Pending,
            steps: Vec::new(),
        }
    }
}

/// Resolves environments through the cache, falling back to the tool.
#[derive(Clone)]
pub struct Resolver {
    cache: DependencyCache,
    tool: Arc<dyn DependencyTool>,
    tool_config: ToolConfig,
    lock_path: PathBuf,
}

impl Resolver {
    pub fn new(config: &MatrixConfig, tool: Arc<dyn DependencyTool>) -> Self {
        Self {
            cache: DependencyCache::new(&config.cache_dir),
            tool,
            tool_config: config.tool.clone(),
            lock_path: config.resolution_lock_path(),
        }
    }

    pub fn cache(&self) -> &DependencyCache {
        &self.cache
    }

    /// Materialize `state`'s environment directory and install its dependency set.
    #[tracing::instrument(skip_all, fields(suite = %state.suite, index = state.index))]
    pub fn resolve(&self, state: &mut EnvironmentState, use_cache: bool) -> Result<(), ResolutionError> {
        let result = self.resolve_inner(state, use_cache);
        state.status = match &result {
            Ok(cache_hit) => InstallStatus::Installed { cache_hit: *cache_hit },
            Err(_) => InstallStatus::Failed,
        };
        result.map(|_| ())
    }

    fn resolve_inner(&self, state: &mut EnvironmentState, use_cache: bool) -> Result<bool, ResolutionError> {
        let manifest_path = state.env_dir.join(&self.tool_config.manifest_file);
        let lock_file = state.env_dir.join(&self.tool_config.lock_file);
        let layout_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ResolutionError::Layout { path, source }
        };

        fs::create_dir_all(&state.env_dir).map_err(layout_err(&state.env_dir))?;
        fs::write(&manifest_path, &state.manifest).map_err(layout_err(&manifest_path))?;
        remove_if_exists(&lock_file).map_err(layout_err(&lock_file))?;

        let _guard = ResolutionLock::acquire(&self.lock_path).map_err(|source| ResolutionError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        let mut pin_retry_available = true;

        if use_cache {
            if let Some(cached) = self.cache.try_load(&state.key) {
                fs::write(&lock_file, &cached).map_err(layout_err(&lock_file))?;
                state.steps.push(ResolveStep::Cached);
                let outcome = self.install_with_recovery(state, &lock_file, &mut pin_retry_available);
                if outcome.succeeded {
                    tracing::info!("installed from cached lock");
                    let lock = read_lock(&lock_file).unwrap_or_else(|| cached.clone());
                    if lock != cached {
                        if let Err(e) = self.cache.store(&state.key, &lock) {
                            tracing::warn!(error = %e, "failed to refresh cached lock");
                        }
                    }
                    state.lock = Some(lock);
                    return Ok(true);
                }
                tracing::warn!("cached lock failed to install, retrying uncached");
                state.steps.push(ResolveStep::CacheDiscarded);
                if let Err(e) = self.cache.clear(&state.key) {
                    tracing::warn!(error = %e, "failed to clear cached lock");
                }
                remove_if_exists(&lock_file).map_err(layout_err(&lock_file))?;
            }
        }

        state.steps.push(ResolveStep::Fresh);
        let outcome = self.install_with_recovery(state, &lock_file, &mut pin_retry_available);
        if !outcome.succeeded {
            return Err(ResolutionError::InstallFailed {
                attempts: self.tool_config.attempts.max(1),
                output: outcome.output,
            });
        }

        let lock = read_lock(&lock_file);
        if use_cache {
            match &lock {
                Some(lock) => {
                    if let Err(e) = self.cache.store(&state.key, lock) {
                        tracing::warn!(error = %e, "failed to cache resolved lock");
                    }
                }
                None => tracing::warn!(path = %lock_file.display(), "tool produced no lock file, nothing cached"),
            }
        }
        state.lock = lock;
        Ok(false)
    }

    /// Run the tool; on a version-pin mismatch, strip the pin and run it once more.
    fn install_with_recovery(
        &self,
        state: &mut EnvironmentState,
        lock_file: &Path,
        pin_retry_available: &mut bool,
    ) -> CommandOutcome {
        let outcome = self.tool.install(&state.env_dir);
        if outcome.succeeded || !*pin_retry_available || !is_version_mismatch(&outcome.output) {
            return outcome;
        }
        let Some(lock) = read_lock(lock_file) else {
            return outcome;
        };

        *pin_retry_available = false;
        tracing::warn!("resolver version mismatch, discarding stale pin and retrying once");
        if let Err(e) = fs::write(lock_file, strip_version_pin(&lock)) {
            tracing::warn!(error = %e, "failed to rewrite lock without pin");
            return outcome;
        }
        state.steps.push(ResolveStep::StalePinCleared);
        self.tool.install(&state.env_dir)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_lock(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().filter(|lock| !lock.trim().is_empty())
}

/// Whether tool output reports a lock written by an incompatible resolver version.
pub fn is_version_mismatch(output: &str) -> bool {
    MISMATCH_MARKERS.iter().any(|marker| output.contains(marker))
}

/// Remove the resolver version pin section from a lock file.
pub fn strip_version_pin(lock: &str) -> String {
    let mut out = Vec::new();
    let mut in_pin = false;
    for line in lock.lines() {
        if line.trim_end() == PIN_SECTION {
            in_pin = true;
            continue;
        }
        if in_pin {
            if line.starts_with(' ') || line.trim().is_empty() {
                continue;
            }
            in_pin = false;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}
