//! Child-side entry point.
//!
//! Runs inside the process spawned for one (variant, method) pair. The parent has already resolved the
//! environment; the child activates it, picks a framework adapter and runs the suite's tests.

use std::fs;
use std::path::Path;

use envmatrix_core::InstrumentationMethod;

use crate::descriptor::Envfile;
use crate::error::ChildError;
use crate::framework::{ChildContext, probe_framework};
use crate::launcher::ChildOptions;

/// Run one environment's tests. Returns whether they passed.
#[tracing::instrument(skip_all, fields(suite_dir = %suite_dir.display(), index = index, method = ?method))]
pub fn run_child(suite_dir: &Path, index: usize, blob: &str, method: Option<&str>) -> Result<bool, ChildError> {
    let ChildOptions { suite, options, config } = ChildOptions::decode(blob).map_err(ChildError::Options)?;
    let envfile = Envfile::load_dir(&suite, suite_dir)?;

    let env_dir = config.env_dir(&suite, method, index);
    let lock_path = env_dir.join(&config.tool.lock_file);
    let lock = fs::read_to_string(&lock_path).map_err(|_| ChildError::MissingLock {
        index,
        path: lock_path.clone(),
    })?;

    let manifest_path = env_dir.join(&config.tool.manifest_file);
    let mut activation = vec![
        ("ENVMATRIX_MANIFEST".to_string(), manifest_path.to_string_lossy().into_owned()),
        ("ENVMATRIX_LOCKFILE".to_string(), lock_path.to_string_lossy().into_owned()),
    ];
    if let Some(var) = &config.tool.activation_var {
        activation.push((var.clone(), manifest_path.to_string_lossy().into_owned()));
    }

    let framework = probe_framework(&lock, &envfile.spec().framework_package);
    tracing::info!(framework = framework.name(), "running tests");

    let ctx = ChildContext {
        suite,
        suite_dir: suite_dir.to_path_buf(),
        env_dir,
        index,
        method: method.map(InstrumentationMethod::new),
        options,
        test_command: envfile.spec().test_command.clone(),
        activation,
    };
    Ok(framework.run(&ctx)?)
}
