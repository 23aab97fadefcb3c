//! Matrix executor
//!
//! Runs every selected (variant, instrumentation method) pair of a suite and aggregates the outcomes.
//!
//! Per variant: `PENDING → RESOLVING → RUNNING → {PASSED, FAILED}`, with `SKIPPED` for empty manifests, failed
//! suite conditions and fail-fast halts, and `UNRESOLVED` when dependency resolution fails.
//!
//! ## Strategies
//!
//! - **Serial**: variants run one at a time in index order with live output. Chosen by the suite's `serialize`
//!   flag, the serialize option, or debug mode.
//! - **Parallel**: one blocking task per variant, all launched together and joined before aggregation. Output is
//!   buffered per variant and flushed as one block when it finishes.
//!
//! Instrumentation methods always run one after another. A failing pair never cancels its siblings unless
//! fail-fast was requested, and even then running children are left to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use envmatrix_core::{EnvKey, InstrumentationMethod, Outcome, RunOptions, VariantDescriptor, aggregate_exit_code};
use tokio::task::JoinSet;

use crate::collector::{OutputCollector, StreamMode};
use crate::config::MatrixConfig;
use crate::descriptor::EnvironmentSource;
use crate::error::{MatrixError, MatrixResult};
use crate::launcher::{ChildLauncher, ChildRequest};
use crate::resolver::{DependencyTool, EnvironmentState, InstallStatus, Resolver};

/// How a suite's variants are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Serial,
    Parallel,
}

/// What to do with each variant once it is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Run,
    ResolveOnly,
}

/// Outcomes of one suite, ordered by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub suite: String,
    pub strategy: Strategy,
    pub outcomes: Vec<(EnvKey, Outcome)>,
}

impl SuiteReport {
    pub fn exit_code(&self) -> i32 {
        aggregate_exit_code(self.outcomes.iter().map(|(_, o)| o))
    }
}

/// Outcomes of a whole invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixReport {
    pub suites: Vec<SuiteReport>,
}

impl MatrixReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &(EnvKey, Outcome)> {
        self.suites.iter().flat_map(|s| s.outcomes.iter())
    }

    /// 0 iff no executed pair failed or went unresolved.
    pub fn exit_code(&self) -> i32 {
        aggregate_exit_code(self.outcomes().map(|(_, o)| o))
    }
}

struct ExecContext {
    config: MatrixConfig,
    options: RunOptions,
    resolver: Resolver,
    launcher: Arc<dyn ChildLauncher>,
    collector: Arc<OutputCollector>,
    halted: AtomicBool,
}

struct VariantJob {
    suite: String,
    method: Option<InstrumentationMethod>,
    variant: VariantDescriptor,
    omit_collector: bool,
    phase: Phase,
}

impl VariantJob {
    fn key(&self) -> EnvKey {
        EnvKey::for_method(&self.suite, self.method.as_ref(), self.variant.index)
    }
}

/// Orchestrates matrix runs. Cheap to clone.
#[derive(Clone)]
pub struct MatrixExecutor {
    ctx: Arc<ExecContext>,
}

impl MatrixExecutor {
    pub fn new(
        config: MatrixConfig,
        options: RunOptions,
        tool: Arc<dyn DependencyTool>,
        launcher: Arc<dyn ChildLauncher>,
        collector: Arc<OutputCollector>,
    ) -> Self {
        let resolver = Resolver::new(&config, tool);
        Self {
            ctx: Arc::new(ExecContext {
                config,
                options,
                resolver,
                launcher,
                collector,
                halted: AtomicBool::new(false),
            }),
        }
    }

    pub fn collector(&self) -> &Arc<OutputCollector> {
        &self.ctx.collector
    }

    pub fn strategy_for(&self, source: &dyn EnvironmentSource) -> Strategy {
        if self.ctx.options.forces_serial() || source.serialize() {
            Strategy::Serial
        } else {
            Strategy::Parallel
        }
    }

    /// Permutations to run: the declared methods, narrowed by the method filter.
    ///
    /// An undeclared filter falls back to every declared method with a warning. A suite declaring no methods runs
    /// a single unnamed permutation.
    pub fn methods_for(&self, source: &dyn EnvironmentSource) -> Vec<Option<InstrumentationMethod>> {
        let declared = source.instrumentation_methods();
        let filter = self.ctx.options.method_filter.as_deref();

        if declared.is_empty() {
            if let Some(filter) = filter {
                tracing::warn!(suite = source.suite_name(), filter, "suite declares no instrumentation methods");
            }
            return vec![None];
        }

        match filter {
            Some(filter) => match declared.iter().find(|m| m.as_str() == filter) {
                Some(method) => vec![Some(method.clone())],
                None => {
                    tracing::warn!(
                        suite = source.suite_name(),
                        filter,
                        "instrumentation method not declared, running all declared methods"
                    );
                    declared.into_iter().map(Some).collect()
                }
            },
            None => declared.into_iter().map(Some).collect(),
        }
    }

    /// Variants passing the environment filter, in index order.
    pub fn select_variants(&self, source: &dyn EnvironmentSource) -> Vec<VariantDescriptor> {
        let filter = &self.ctx.options.env_filter;
        let selected: Vec<_> = source.variants().into_iter().filter(|v| filter.matches(v)).collect();
        if selected.is_empty() && source.count() > 0 {
            tracing::warn!(suite = source.suite_name(), ?filter, "no environment matches the filter");
        }
        selected
    }

    /// Run every selected pair of one suite.
    #[tracing::instrument(skip_all, fields(suite = source.suite_name()))]
    pub async fn run_suite(&self, source: Arc<dyn EnvironmentSource>) -> MatrixResult<SuiteReport> {
        let suite = source.suite_name().to_string();
        let methods = self.methods_for(source.as_ref());
        let variants = self.select_variants(source.as_ref());
        let strategy = self.strategy_for(source.as_ref());

        let condition = Arc::clone(&source);
        if !blocking(move || condition.should_run()).await? {
            return Ok(self.skip_suite(&suite, source.as_ref(), &methods, &variants, strategy));
        }

        tracing::info!(?strategy, variants = variants.len(), methods = methods.len(), "running suite");
        let hooks = Arc::clone(&source);
        blocking(move || hooks.before_suite())
            .await?
            .map_err(|output| MatrixError::Hook {
                suite: suite.clone(),
                hook: "before_suite",
                output,
            })?;

        let mut outcomes = Vec::new();
        for method in &methods {
            let jobs = variants
                .iter()
                .map(|variant| VariantJob {
                    suite: suite.clone(),
                    method: method.clone(),
                    variant: variant.clone(),
                    omit_collector: source.omit_collector(),
                    phase: Phase::Run,
                })
                .collect();
            outcomes.extend(self.run_jobs(jobs, strategy).await?);
        }

        let hooks = Arc::clone(&source);
        blocking(move || hooks.after_suite())
            .await?
            .map_err(|output| MatrixError::Hook {
                suite: suite.clone(),
                hook: "after_suite",
                output,
            })?;

        Ok(SuiteReport {
            suite,
            strategy,
            outcomes,
        })
    }

    /// Run several suites one after another, then print the final report.
    ///
    /// A configuration error or panic in any suite aborts the run without a report.
    pub async fn run_suites(&self, sources: Vec<Arc<dyn EnvironmentSource>>) -> MatrixResult<MatrixReport> {
        let mut suites = Vec::new();
        for source in sources {
            suites.push(self.run_suite(source).await?);
        }
        self.ctx.collector.overall_report();
        Ok(MatrixReport { suites })
    }

    /// Resolve (and cache) every selected variant without running tests.
    #[tracing::instrument(skip_all, fields(suite = source.suite_name()))]
    pub async fn prime_suite(&self, source: Arc<dyn EnvironmentSource>) -> MatrixResult<SuiteReport> {
        let suite = source.suite_name().to_string();
        let jobs = self
            .select_variants(source.as_ref())
            .into_iter()
            .map(|variant| VariantJob {
                suite: suite.clone(),
                method: None,
                variant,
                omit_collector: source.omit_collector(),
                phase: Phase::ResolveOnly,
            })
            .collect();
        let outcomes = self.run_jobs(jobs, Strategy::Parallel).await?;
        Ok(SuiteReport {
            suite,
            strategy: Strategy::Parallel,
            outcomes,
        })
    }

    pub async fn prime_suites(&self, sources: Vec<Arc<dyn EnvironmentSource>>) -> MatrixResult<MatrixReport> {
        let mut suites = Vec::new();
        for source in sources {
            suites.push(self.prime_suite(source).await?);
        }
        self.ctx.collector.overall_report();
        Ok(MatrixReport { suites })
    }

    async fn run_jobs(&self, jobs: Vec<VariantJob>, strategy: Strategy) -> MatrixResult<Vec<(EnvKey, Outcome)>> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        match strategy {
            Strategy::Serial => {
                self.ctx.collector.set_mode(StreamMode::Live);
                for job in jobs {
                    let ctx = Arc::clone(&self.ctx);
                    outcomes.push(blocking(move || run_variant(&ctx, job)).await?);
                }
            }
            Strategy::Parallel => {
                self.ctx.collector.set_mode(StreamMode::Buffered);
                let mut set = JoinSet::new();
                for job in jobs {
                    let ctx = Arc::clone(&self.ctx);
                    set.spawn_blocking(move || run_variant(&ctx, job));
                }
                while let Some(joined) = set.join_next().await {
                    outcomes.push(joined.map_err(|e| MatrixError::Task(e.to_string()))?);
                }
                outcomes.sort_by(|a, b| a.0.cmp(&b.0));
            }
        }
        Ok(outcomes)
    }

    fn skip_suite(
        &self,
        suite: &str,
        source: &dyn EnvironmentSource,
        methods: &[Option<InstrumentationMethod>],
        variants: &[VariantDescriptor],
        strategy: Strategy,
    ) -> SuiteReport {
        let message = source
            .skip_message()
            .unwrap_or_else(|| "suite condition not met".to_string());
        tracing::warn!(suite, %message, "skipping suite");
        self.ctx.collector.notice(&format!("Skipping {suite}: {message}\n"));

        let mut outcomes = Vec::new();
        for method in methods {
            for variant in variants {
                let key = EnvKey::for_method(suite, method.as_ref(), variant.index);
                self.ctx.collector.record(&key, Outcome::Skipped);
                outcomes.push((key, Outcome::Skipped));
            }
        }
        SuiteReport {
            suite: suite.to_string(),
            strategy,
            outcomes,
        }
    }
}

async fn blocking<T, F>(f: F) -> MatrixResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MatrixError::Task(e.to_string()))
}

/// Drive one pair from PENDING to its terminal state.
fn run_variant(ctx: &ExecContext, job: VariantJob) -> (EnvKey, Outcome) {
    let key = job.key();
    let collector = &ctx.collector;

    let outcome = if job.variant.is_skipped() {
        collector.write(&key, &format!("Skipping {key}: empty manifest\n"));
        Outcome::Skipped
    } else if ctx.halted.load(Ordering::SeqCst) {
        collector.write(&key, &format!("Skipping {key}: halted after an earlier failure\n"));
        Outcome::Skipped
    } else {
        resolve_and_run(ctx, &job, &key)
    };

    if outcome.is_failure() && ctx.options.fail_fast {
        ctx.halted.store(true, Ordering::SeqCst);
    }
    tracing::info!(%key, %outcome, "environment finished");
    collector.record(&key, outcome);
    collector.suite_report(&key);
    (key, outcome)
}

fn resolve_and_run(ctx: &ExecContext, job: &VariantJob, key: &EnvKey) -> Outcome {
    let collector = &ctx.collector;
    let method_note = job.method.as_ref().map(|m| format!(" ({m})")).unwrap_or_default();
    collector.write(
        key,
        &format!("Running {} env {}{}\n", job.suite, job.variant.label(), method_note),
    );

    let mut state = EnvironmentState::new(&ctx.config, &job.suite, job.method.as_ref(), &job.variant);
    if let Err(e) = ctx.resolver.resolve(&mut state, ctx.options.use_cache) {
        let mut message = format!("Dependency resolution failed: {e}\n");
        if let Some(output) = e.output() {
            message.push_str(output);
        }
        collector.write(key, &message);
        return Outcome::Unresolved;
    }

    if ctx.options.verbose {
        collector.write(key, &format!("Resolution steps: {:?}\n", state.steps));
    }

    if job.phase == Phase::ResolveOnly {
        let source = match state.status {
            InstallStatus::Installed { cache_hit: true } => "cached lock",
            _ => "fresh resolution",
        };
        collector.write(key, &format!("Resolved from {source}\n"));
        return Outcome::Passed;
    }

    if ctx.halted.load(Ordering::SeqCst) {
        collector.write(key, "Halted after an earlier failure, tests not started\n");
        return Outcome::Skipped;
    }

    let request = ChildRequest {
        suite: job.suite.clone(),
        suite_dir: ctx.config.suite_dir(&job.suite),
        index: job.variant.index,
        method: job.method.clone(),
        options: ctx.options.clone(),
        config: ctx.config.clone(),
        omit_collector: job.omit_collector,
    };
    match ctx.launcher.launch(&request, &mut |chunk: &str| collector.write(key, chunk)) {
        Ok(true) => Outcome::Passed,
        Ok(false) => Outcome::Failed,
        Err(e) => {
            collector.write(key, &format!("Failed to launch child: {e}\n"));
            Outcome::Failed
        }
    }
}
