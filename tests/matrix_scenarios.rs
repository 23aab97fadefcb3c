//! End-to-end scenarios for the matrix executor
//!
//! Dependency installation and child processes are replaced by in-process fakes; the cache, the resolution
//! lock, the collector and the scheduling are the real ones.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use envmatrix::collector::MemorySink;
use envmatrix::{
    ChildLauncher, ChildRequest, CommandOutcome, DependencyTool, EnvFilter, EnvKey, EnvironmentSource,
    InstrumentationMethod, MatrixConfig, MatrixError, MatrixExecutor, Outcome, OutputCollector, RunOptions, Strategy,
    VariantDescriptor,
};

// =============================================================================
// Fakes
// =============================================================================

/// Writes a lock derived from the manifest. Manifests mentioning `BROKEN` never resolve.
#[derive(Default)]
struct FakeTool {
    installs: AtomicUsize,
    fresh: AtomicUsize,
}

impl DependencyTool for FakeTool {
    fn install(&self, env_dir: &Path) -> CommandOutcome {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let manifest = fs::read_to_string(env_dir.join("Gemfile")).unwrap_or_default();
        if manifest.contains("BROKEN") {
            return CommandOutcome {
                output: "Could not find gem 'BROKEN' in any of the sources\n".to_string(),
                succeeded: false,
                attempts: 3,
            };
        }
        let lock = env_dir.join("Gemfile.lock");
        if !lock.exists() {
            self.fresh.fetch_add(1, Ordering::SeqCst);
            fs::write(&lock, format!("LOCKED\n{manifest}\n")).unwrap();
        }
        CommandOutcome {
            output: "Bundle complete!\n".to_string(),
            succeeded: true,
            attempts: 1,
        }
    }
}

#[derive(Default)]
struct FakeLauncher {
    failing: HashSet<usize>,
    panic_on: Option<usize>,
    barrier: Option<Barrier>,
    launches: Mutex<Vec<(usize, Option<String>)>>,
}

impl FakeLauncher {
    fn failing(indices: &[usize]) -> Self {
        Self {
            failing: indices.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn launches(&self) -> Vec<(usize, Option<String>)> {
        self.launches.lock().unwrap().clone()
    }

    fn indices(&self) -> Vec<usize> {
        self.launches().into_iter().map(|(i, _)| i).collect()
    }
}

impl ChildLauncher for FakeLauncher {
    fn launch(&self, request: &ChildRequest, on_output: &mut dyn FnMut(&str)) -> io::Result<bool> {
        let method = request.method.as_ref().map(|m| m.as_str().to_string());
        self.launches.lock().unwrap().push((request.index, method));
        if self.panic_on == Some(request.index) {
            panic!("launcher exploded");
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait();
        }
        on_output(&format!("first line of env {}\n", request.index));
        thread::sleep(Duration::from_millis(5));
        on_output(&format!("last line of env {}\n", request.index));
        Ok(!self.failing.contains(&request.index))
    }
}

#[derive(Clone)]
struct MemorySuite {
    manifests: Vec<Option<String>>,
    methods: Vec<&'static str>,
    serialize: bool,
    run: bool,
    fail_before: bool,
    hooks: Arc<Mutex<Vec<&'static str>>>,
}

impl MemorySuite {
    fn new(manifests: &[Option<&str>]) -> Self {
        Self {
            manifests: manifests.iter().map(|m| m.map(str::to_string)).collect(),
            methods: Vec::new(),
            serialize: false,
            run: true,
            fail_before: false,
            hooks: Arc::default(),
        }
    }

    fn gems(count: usize) -> Self {
        let manifests: Vec<String> = (0..count).map(|i| format!("gem 'rack', '~> {i}.0'")).collect();
        let refs: Vec<Option<&str>> = manifests.iter().map(|m| Some(m.as_str())).collect();
        Self::new(&refs)
    }

    fn serial(mut self) -> Self {
        self.serialize = true;
        self
    }

    fn source(self) -> Arc<dyn EnvironmentSource> {
        Arc::new(self)
    }
}

impl EnvironmentSource for MemorySuite {
    fn suite_name(&self) -> &str {
        "rack"
    }

    fn count(&self) -> usize {
        self.manifests.len()
    }

    fn variant(&self, index: usize) -> Option<VariantDescriptor> {
        Some(VariantDescriptor::new(index, self.manifests.get(index)?.clone()))
    }

    fn serialize(&self) -> bool {
        self.serialize
    }

    fn instrumentation_methods(&self) -> Vec<InstrumentationMethod> {
        self.methods.iter().map(|m| InstrumentationMethod::new(*m)).collect()
    }

    fn should_run(&self) -> bool {
        self.run
    }

    fn skip_message(&self) -> Option<String> {
        Some("requires a running database".to_string())
    }

    fn before_suite(&self) -> Result<(), String> {
        self.hooks.lock().unwrap().push("before");
        if self.fail_before { Err("database not running\n".to_string()) } else { Ok(()) }
    }

    fn after_suite(&self) -> Result<(), String> {
        self.hooks.lock().unwrap().push("after");
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config: MatrixConfig,
    tool: Arc<FakeTool>,
    sink: MemorySink,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = MatrixConfig::new()
            .with_suites_dir(dir.path().join("suites"))
            .with_work_dir(dir.path().join("work"))
            .with_cache_dir(dir.path().join("cache"));
        Self {
            _dir: dir,
            config,
            tool: Arc::default(),
            sink: MemorySink::new(),
        }
    }

    fn executor(&self, options: RunOptions, launcher: &Arc<FakeLauncher>) -> MatrixExecutor {
        let launcher: Arc<dyn ChildLauncher> = launcher.clone();
        let tool: Arc<dyn DependencyTool> = self.tool.clone();
        MatrixExecutor::new(
            self.config.clone(),
            options,
            tool,
            launcher,
            Arc::new(OutputCollector::new(Box::new(self.sink.clone()), false)),
        )
    }

    fn fresh(&self) -> usize {
        self.tool.fresh.load(Ordering::SeqCst)
    }
}

fn outcomes(report: &envmatrix::SuiteReport) -> Vec<Outcome> {
    report.outcomes.iter().map(|(_, o)| *o).collect()
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn all_passing_variants_exit_zero() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let report = executor.run_suites(vec![MemorySuite::gems(3).source()]).await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(outcomes(&report.suites[0]), vec![Outcome::Passed; 3]);
    assert!(harness.sink.contents().contains("3 passed"));
}

#[tokio::test]
async fn one_failing_variant_exits_one() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::failing(&[1]));
    let executor = harness.executor(RunOptions::new(), &launcher);

    let report = executor.run_suites(vec![MemorySuite::gems(3).source()]).await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        outcomes(&report.suites[0]),
        vec![Outcome::Passed, Outcome::Failed, Outcome::Passed]
    );
    let output = harness.sink.contents();
    assert!(output.contains("====== failures ======"));
    assert!(output.contains("last line of env 1"));
}

#[tokio::test]
async fn empty_manifests_are_skipped_and_exit_zero() {
    for serialize in [false, true] {
        let harness = Harness::new();
        let launcher = Arc::new(FakeLauncher::default());
        let executor = harness.executor(RunOptions::new().with_serialize(serialize), &launcher);

        let suite = MemorySuite::new(&[None, Some(""), Some("   \n")]);
        let report = executor.run_suite(suite.source()).await.unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(outcomes(&report), vec![Outcome::Skipped; 3]);
        assert!(launcher.launches().is_empty());
        assert_eq!(harness.tool.installs.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolution_failure_is_contained_to_its_variant() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let suite = MemorySuite::new(&[Some("gem 'rack'"), Some("gem 'BROKEN'"), Some("gem 'json'")]);
    let report = executor.run_suite(suite.source()).await.unwrap();

    assert_eq!(report.strategy, Strategy::Parallel);
    assert_eq!(
        outcomes(&report),
        vec![Outcome::Passed, Outcome::Unresolved, Outcome::Passed]
    );
    assert_eq!(report.exit_code(), 1);

    let mut launched = launcher.indices();
    launched.sort();
    assert_eq!(launched, vec![0, 2]);

    let unresolved = executor.collector().output(&EnvKey::new("rack", 1));
    assert!(unresolved.contains("Dependency resolution failed"));
    assert!(unresolved.contains("Could not find gem 'BROKEN'"));
}

// =============================================================================
// Strategies
// =============================================================================

#[tokio::test]
async fn serial_execution_follows_index_order() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let report = executor.run_suite(MemorySuite::gems(5).serial().source()).await.unwrap();

    assert_eq!(report.strategy, Strategy::Serial);
    assert_eq!(launcher.indices(), vec![0, 1, 2, 3, 4]);

    let output = harness.sink.contents();
    let positions: Vec<usize> = (0..5)
        .map(|i| output.find(&format!("Running rack env {i}\n")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_strategy_launches_variants_together() {
    let harness = Harness::new();
    // Every child waits until all three are running.
    let launcher = Arc::new(FakeLauncher {
        barrier: Some(Barrier::new(3)),
        ..FakeLauncher::default()
    });
    let executor = harness.executor(RunOptions::new(), &launcher);

    let report = executor.run_suite(MemorySuite::gems(3).source()).await.unwrap();

    assert_eq!(report.strategy, Strategy::Parallel);
    assert_eq!(outcomes(&report), vec![Outcome::Passed; 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strategy_does_not_change_outcomes() {
    let manifests = [Some("gem 'a'"), Some("gem 'BROKEN'"), None, Some("gem 'b'"), Some("gem 'c'")];
    let mut results = Vec::new();
    for serialize in [true, false] {
        let harness = Harness::new();
        let launcher = Arc::new(FakeLauncher::failing(&[3]));
        let executor = harness.executor(RunOptions::new().with_serialize(serialize), &launcher);
        let report = executor.run_suite(MemorySuite::new(&manifests).source()).await.unwrap();
        results.push(report.outcomes);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(
        results[0].iter().map(|(_, o)| *o).collect::<Vec<_>>(),
        vec![
            Outcome::Passed,
            Outcome::Unresolved,
            Outcome::Skipped,
            Outcome::Failed,
            Outcome::Passed
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_output_blocks_stay_contiguous() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    executor.run_suite(MemorySuite::gems(6).source()).await.unwrap();

    let output = harness.sink.contents();
    for i in 0..6 {
        let block = format!("first line of env {i}\nlast line of env {i}\n");
        assert!(output.contains(&block), "env {i} output was interleaved:\n{output}");
    }
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn unchanged_manifests_reuse_cached_locks() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());

    let first = harness.executor(RunOptions::new(), &launcher);
    first.run_suite(MemorySuite::gems(3).source()).await.unwrap();
    assert_eq!(harness.fresh(), 3);

    let second = harness.executor(RunOptions::new(), &launcher);
    let report = second.run_suite(MemorySuite::gems(3).source()).await.unwrap();
    assert_eq!(outcomes(&report), vec![Outcome::Passed; 3]);
    assert_eq!(harness.fresh(), 3, "cached locks should be reused");

    // One changed character forces a fresh resolution for that variant only.
    let mut changed = MemorySuite::gems(3);
    changed.manifests[0] = Some("gem 'rack', '~> 0.1'".to_string());
    let third = harness.executor(RunOptions::new(), &launcher);
    third.run_suite(changed.source()).await.unwrap();
    assert_eq!(harness.fresh(), 4);
}

#[tokio::test]
async fn disabled_cache_always_resolves_fresh() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());

    for _ in 0..2 {
        let executor = harness.executor(RunOptions::new().with_cache(false), &launcher);
        executor.run_suite(MemorySuite::gems(2).source()).await.unwrap();
    }
    assert_eq!(harness.fresh(), 4);
}

#[tokio::test]
async fn prime_resolves_without_running_tests() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());

    let primer = harness.executor(RunOptions::new(), &launcher);
    let report = primer.prime_suites(vec![MemorySuite::gems(3).source()]).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(launcher.launches().is_empty());
    assert_eq!(harness.fresh(), 3);

    let runner = harness.executor(RunOptions::new(), &launcher);
    runner.run_suite(MemorySuite::gems(3).source()).await.unwrap();
    assert_eq!(harness.fresh(), 3);
}

// =============================================================================
// Instrumentation methods and filters
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instrumentation_methods_run_one_after_another() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let mut suite = MemorySuite::gems(3);
    suite.methods = vec!["chain", "prepend"];
    let report = executor.run_suite(suite.source()).await.unwrap();

    let methods: Vec<Option<String>> = launcher.launches().into_iter().map(|(_, m)| m).collect();
    let chain = Some("chain".to_string());
    let prepend = Some("prepend".to_string());
    assert_eq!(methods, vec![chain.clone(), chain, prepend.clone(), prepend.clone(), prepend]);
    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(report.outcomes[0].0.suite, "rack [chain]");
    assert_eq!(report.outcomes[3].0.suite, "rack [prepend]");
}

#[tokio::test]
async fn method_and_env_filters_narrow_the_matrix() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let options = RunOptions::new()
        .with_method_filter(Some("prepend".to_string()))
        .with_env_filter(EnvFilter::Index(1));
    let executor = harness.executor(options, &launcher);

    let mut suite = MemorySuite::gems(3);
    suite.methods = vec!["chain", "prepend"];
    executor.run_suite(suite.source()).await.unwrap();

    assert_eq!(launcher.launches(), vec![(1, Some("prepend".to_string()))]);
}

// =============================================================================
// Fail-slow / fail-fast
// =============================================================================

#[tokio::test]
async fn failures_do_not_stop_siblings_by_default() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::failing(&[0]));
    let executor = harness.executor(RunOptions::new(), &launcher);

    let report = executor.run_suite(MemorySuite::gems(3).serial().source()).await.unwrap();

    assert_eq!(
        outcomes(&report),
        vec![Outcome::Failed, Outcome::Passed, Outcome::Passed]
    );
}

#[tokio::test]
async fn fail_fast_skips_variants_not_yet_started() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::failing(&[0]));
    let executor = harness.executor(RunOptions::new().with_fail_fast(true), &launcher);

    let report = executor.run_suite(MemorySuite::gems(3).serial().source()).await.unwrap();

    assert_eq!(
        outcomes(&report),
        vec![Outcome::Failed, Outcome::Skipped, Outcome::Skipped]
    );
    assert_eq!(launcher.indices(), vec![0]);
    assert_eq!(report.exit_code(), 1);
}

// =============================================================================
// Suite lifecycle
// =============================================================================

#[tokio::test]
async fn unmet_condition_skips_the_whole_suite() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let mut suite = MemorySuite::gems(2);
    suite.run = false;
    let hooks = Arc::clone(&suite.hooks);
    let report = executor.run_suite(suite.source()).await.unwrap();

    assert_eq!(outcomes(&report), vec![Outcome::Skipped; 2]);
    assert_eq!(report.exit_code(), 0);
    assert!(launcher.launches().is_empty());
    assert!(hooks.lock().unwrap().is_empty());
    assert!(harness.sink.contents().contains("Skipping rack: requires a running database"));
}

#[tokio::test]
async fn hooks_wrap_the_variants() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let suite = MemorySuite::gems(2);
    let hooks = Arc::clone(&suite.hooks);
    executor.run_suite(suite.source()).await.unwrap();

    assert_eq!(*hooks.lock().unwrap(), vec!["before", "after"]);
}

#[tokio::test]
async fn failing_before_hook_aborts_the_suite() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher::default());
    let executor = harness.executor(RunOptions::new(), &launcher);

    let mut suite = MemorySuite::gems(2);
    suite.fail_before = true;
    let err = executor.run_suite(suite.source()).await.unwrap_err();

    assert!(matches!(
        err,
        MatrixError::Hook { hook: "before_suite", ref output, .. } if output.contains("database not running")
    ));
    assert!(launcher.launches().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_variant_task_aborts_the_run() {
    let harness = Harness::new();
    let launcher = Arc::new(FakeLauncher {
        panic_on: Some(1),
        ..FakeLauncher::default()
    });
    let executor = harness.executor(RunOptions::new(), &launcher);

    let err = executor.run_suites(vec![MemorySuite::gems(3).source()]).await.unwrap_err();
    assert!(matches!(err, MatrixError::Task(_)));
}
