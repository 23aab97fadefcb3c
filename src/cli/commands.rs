//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::path::Path;
use std::sync::Arc;

use envmatrix_core::{EnvFilter, RunOptions};

use crate::child::run_child;
use crate::collector::OutputCollector;
use crate::config::MatrixConfig;
use crate::descriptor::{EnvironmentSource, Envfile, discover_suites};
use crate::error::{DescriptorError, MatrixError};
use crate::launcher::ProcessLauncher;
use crate::matrix::{MatrixExecutor, MatrixReport};
use crate::resolver::{Resolver, ShellDependencyTool};

use super::{CliError, CliResult, ExitCode, LayoutArgs, RunArgs};

// ============================================================================
// Matrix commands
// ============================================================================

/// Run the test matrix for one suite or all of them.
pub fn run_matrix(layout: &LayoutArgs, args: &RunArgs) -> CliResult<ExitCode> {
    let config = layout.config()?;
    let options = args.options();
    let sources = load_sources(&config, &args.suite)?;

    let executor = executor(&config, options, layout.no_color)?;
    let report = block_on(executor.run_suites(sources))?;
    Ok(ExitCode(report.exit_code()))
}

/// Resolve and cache every selected variant without running tests.
pub fn prime(layout: &LayoutArgs, suite: &str, env: EnvFilter) -> CliResult<ExitCode> {
    let config = layout.config()?;
    let options = RunOptions::new().with_env_filter(env);
    let sources = load_sources(&config, suite)?;

    let executor = executor(&config, options, layout.no_color)?;
    let report = block_on(executor.prime_suites(sources))?;
    Ok(ExitCode(report.exit_code()))
}

/// Print suites, their variants and instrumentation methods.
pub fn list(layout: &LayoutArgs, suite: &str) -> CliResult<ExitCode> {
    let config = layout.config()?;
    for source in load_sources(&config, suite)? {
        print!("{}", describe_suite(source.as_ref()));
    }
    Ok(ExitCode::SUCCESS)
}

/// Remove cached lock files, for one suite or the whole cache.
pub fn clean(layout: &LayoutArgs, suite: Option<&str>) -> CliResult<ExitCode> {
    let config = layout.config()?;
    let resolver = Resolver::new(&config, Arc::new(ShellDependencyTool::new(config.tool.clone())));
    let removed = resolver
        .cache()
        .clean(suite)
        .map_err(|e| CliError::from_error("cache cleanup failed", &e))?;
    println!("Removed {removed} cached lock file(s) from {}", config.cache_dir.display());
    Ok(ExitCode::SUCCESS)
}

/// Child-side entry: run one environment's tests in this process.
pub fn child(dir: &Path, index: usize, blob: &str, method: Option<&str>) -> CliResult<ExitCode> {
    match run_child(dir, index, blob, method) {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) => Err(CliError::from_error("child failed to start tests", &e)),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Load the descriptor of `suite`, or of every discovered suite for `all`.
pub fn load_sources(config: &MatrixConfig, suite: &str) -> CliResult<Vec<Arc<dyn EnvironmentSource>>> {
    let names = if suite == "all" {
        let names = discover_suites(&config.suites_dir);
        if names.is_empty() {
            return Err(CliError::failure(format!(
                "Error: no suites found under {}",
                config.suites_dir.display()
            )));
        }
        names
    } else {
        if !config.suite_dir(suite).is_dir() {
            return Err(descriptor_error(DescriptorError::UnknownSuite(suite.to_string())));
        }
        vec![suite.to_string()]
    };

    names
        .iter()
        .map(|name| {
            Envfile::load(config, name)
                .map(|envfile| Arc::new(envfile) as Arc<dyn EnvironmentSource>)
                .map_err(descriptor_error)
        })
        .collect()
}

/// Human-readable listing of one suite.
pub fn describe_suite(source: &dyn EnvironmentSource) -> String {
    let mut out = source.suite_name().to_string();
    if source.serialize() {
        out.push_str(" (serial)");
    }
    out.push('\n');

    let methods = source.instrumentation_methods();
    if !methods.is_empty() {
        let names: Vec<&str> = methods.iter().map(|m| m.as_str()).collect();
        out.push_str(&format!("  methods: {}\n", names.join(", ")));
    }
    for variant in source.variants() {
        let status = if variant.is_skipped() { " (skipped)" } else { "" };
        out.push_str(&format!("  env {}{status}\n", variant.label()));
    }
    out
}

fn executor(config: &MatrixConfig, options: RunOptions, no_color: bool) -> CliResult<MatrixExecutor> {
    let launcher = ProcessLauncher::current_exe()
        .map_err(|e| CliError::from_error("cannot locate the envmatrix executable", &e))?;
    Ok(MatrixExecutor::new(
        config.clone(),
        options,
        Arc::new(ShellDependencyTool::new(config.tool.clone())),
        Arc::new(launcher),
        Arc::new(OutputCollector::stdout(!no_color)),
    ))
}

fn block_on<F>(future: F) -> CliResult<MatrixReport>
where
    F: std::future::Future<Output = Result<MatrixReport, MatrixError>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::from_error("failed to start async runtime", &e))?;
    runtime.block_on(future).map_err(matrix_error)
}

fn descriptor_error(err: DescriptorError) -> CliError {
    CliError::failure(format!("{:?}", miette::Report::new(err)))
}

fn matrix_error(err: MatrixError) -> CliError {
    match err {
        MatrixError::Descriptor(err) => descriptor_error(err),
        MatrixError::Hook { ref output, .. } => {
            let mut error = CliError::from_error("matrix run aborted", &err);
            if !output.trim().is_empty() {
                error.message.push('\n');
                error.message.push_str(output.trim_end());
            }
            error
        }
        err => CliError::from_error("matrix run aborted", &err),
    }
}
