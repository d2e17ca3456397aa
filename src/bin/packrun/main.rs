//! The binary entrypoint for `packrun`.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context as _};
use packrun::{
    analyzer::{self, NodeModulesResolver, ScriptReference},
    cache::LocalCacheBackend,
    config,
    diagnostic::Severity,
    executor::{Executor, ExecutorConfig, WorkerPool},
    fingerprint::PlatformInfo,
    manifest::{JsonManifestSource, ManifestSource, TomlManifestSource},
    path::AbsDirPath,
    runner::OutputSink,
    runtime::{ProcessRuntime, Runtime},
};
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "packrun", about = "Incremental script orchestrator", version = crate_version!())]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a script and everything it depends on.
    Run(RunArgs),

    /// Manage the local output cache.
    #[clap(subcommand)]
    Cache(CacheCommand),

    /// Debug information.
    #[clap(subcommand, hide(true))]
    Debug(DebugCommand),
}

#[derive(Clone, Debug, Args)]
struct RunArgs {
    /// The script to run, resolved against the package in the current
    /// directory.
    script: String,

    /// Extra arguments forwarded to the root script's command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra_args: Vec<String>,

    /// The runtime version recorded in the fingerprint, e.g. a language
    /// toolchain version. Defaults to this binary's own version since the
    /// core doesn't assume any particular ecosystem runtime.
    #[arg(long)]
    runtime_version: Option<String>,
}

#[derive(Clone, Debug, Subcommand)]
enum CacheCommand {
    /// Print the local cache directory.
    Show,
    /// Delete every script's local cache and persisted run state.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Debug, Subcommand)]
enum DebugCommand {
    /// Print the resolved DAG for a script as JSON, for tooling integration.
    Metadata {
        /// The script to analyze, resolved against the package in the
        /// current directory.
        script: String,
    },
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let logger = log::make_logger(std::io::stderr, top.color)?;

    let exit_code = match top.command {
        Command::Run(args) => {
            logger.init();
            run(args).await?
        }
        Command::Cache(cmd) => {
            logger.init();
            match cmd {
                CacheCommand::Show => cache_show().await?,
                CacheCommand::Reset { yes } => cache_reset(yes).await?,
            }
        }
        Command::Debug(DebugCommand::Metadata { script }) => {
            logger.init();
            debug_metadata(script).await?
        }
    };

    std::process::exit(exit_code);
}

/// Run `args.script`, returning the process exit code (spec §4.6/§7: 0 on
/// success, 1 on a reported failure, 130 if interrupted by SIGINT before
/// the run could finish).
async fn run(args: RunArgs) -> Result<i32> {
    let runtime: Arc<dyn Runtime> = Arc::new(ProcessRuntime::host());
    let cwd = runtime.current_dir();
    let cfg = config::resolve(runtime.as_ref()).context("resolve WIREIT_* configuration")?;

    let source = manifest_source(&cwd).await?;
    let root = ScriptReference {
        package_dir: cwd,
        name: args.script,
    };

    let dag = match analyzer::analyze(root, args.extra_args, source.as_ref(), &NodeModulesResolver).await {
        Ok(dag) => dag,
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                report_diagnostic(diagnostic);
            }
            return Ok(1);
        }
    };

    let cache: Option<Arc<dyn packrun::cache::CacheBackend>> = match cfg.cache {
        config::CacheMode::Local => Some(Arc::new(LocalCacheBackend)),
        config::CacheMode::None => None,
        config::CacheMode::Github => {
            tracing::warn!("WIREIT_CACHE=github has no backend in this build, caching disabled");
            None
        }
    };

    let runtime_version = args.runtime_version.unwrap_or_else(|| crate_version!().to_string());
    let executor = Executor::new(
        Arc::new(dag),
        ExecutorConfig {
            worker_pool: Arc::new(WorkerPool::new(cfg.parallelism)),
            cache,
            failure_mode: cfg.failures,
            platform: PlatformInfo::host(runtime.as_ref(), runtime_version),
            live_output: Arc::new(TerminalSink),
            failure_sink: Arc::new(TerminalFailureSink),
            runtime: runtime.clone(),
        },
    );

    tokio::select! {
        result = executor.run() => {
            match result {
                Ok(()) => Ok(0),
                Err(_failures) => Ok(1),
            }
        }
        _ = runtime.interrupted() => {
            executor.request_cancel();
            // Give already-running scripts a chance to exit from the SIGINT
            // before forcefully returning; a second Ctrl+C escalates.
            tokio::select! {
                _ = executor.run() => {}
                _ = runtime.interrupted() => executor.request_cancel(),
            }
            Ok(130)
        }
    }
}

async fn manifest_source(dir: &AbsDirPath) -> Result<Box<dyn ManifestSource>> {
    if tokio::fs::metadata(dir.join_str_file("package.json").as_std_path()).await.is_ok() {
        Ok(Box::new(JsonManifestSource))
    } else {
        Ok(Box::new(TomlManifestSource))
    }
}

fn report_diagnostic(diagnostic: &packrun::diagnostic::Diagnostic) {
    match diagnostic.severity {
        Severity::Error => tracing::error!("{}", diagnostic.message),
        Severity::Warning => tracing::warn!("{}", diagnostic.message),
    }
}

struct TerminalSink;

impl OutputSink for TerminalSink {
    fn on_stdout_line(&self, line: &[u8]) {
        println!("{}", String::from_utf8_lossy(line));
    }

    fn on_stderr_line(&self, line: &[u8]) {
        eprintln!("{}", String::from_utf8_lossy(line));
    }
}

struct TerminalFailureSink;

impl packrun::executor::FailureSink for TerminalFailureSink {
    fn on_failure(&self, reference: &packrun::analyzer::ScriptReference, failure: &packrun::error::ScriptFailure) {
        tracing::error!(script = %reference.canonical_string(), "{failure}");
    }
}

async fn cache_show() -> Result<i32> {
    let cache_path = packrun::fs::user_global_cache_path().await.context("get user global cache path")?;
    println!("{}", cache_path.as_str_lossy());
    Ok(0)
}

async fn cache_reset(yes: bool) -> Result<i32> {
    if !yes {
        println!("Re-run with --yes to delete every script's local cache and persisted run state under the current directory.");
        return Ok(0);
    }
    let cwd = AbsDirPath::current().context("get current directory")?;
    let mut removed = 0usize;
    for entry in walkdir::WalkDir::new(cwd.as_std_path()).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() && entry.file_name() == ".wireit" {
            if tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    println!("Removed {removed} cache director{}", if removed == 1 { "y" } else { "ies" });
    Ok(0)
}

/// Prints the resolved DAG reachable from `script` as JSON: every node's
/// command, dependencies, declared files/output, and whether it's a service.
/// Read-only, no side effects (no fingerprinting, caching, or execution).
async fn debug_metadata(script: String) -> Result<i32> {
    let runtime = ProcessRuntime::host();
    let cwd = runtime.current_dir();
    let source = manifest_source(&cwd).await?;
    let root = ScriptReference { package_dir: cwd, name: script };

    let dag = match analyzer::analyze(root, Vec::new(), source.as_ref(), &NodeModulesResolver).await {
        Ok(dag) => dag,
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                report_diagnostic(diagnostic);
            }
            return Ok(1);
        }
    };

    let mut scripts = serde_json::Map::new();
    for (reference, config) in &dag.nodes {
        scripts.insert(
            reference.canonical_string(),
            serde_json::json!({
                "command": config.command,
                "dependencies": config.dependencies.iter().map(|d| serde_json::json!({
                    "target": d.target.canonical_string(),
                    "cascade": d.cascade,
                })).collect::<Vec<_>>(),
                "files": config.files,
                "output": config.output,
                "service": config.service.is_some(),
                "packageLocks": config.package_locks,
            }),
        );
    }
    let metadata = serde_json::json!({
        "root": dag.root.canonical_string(),
        "scripts": scripts,
    });
    println!("{}", serde_json::to_string_pretty(&metadata).context("serialize metadata")?);
    Ok(0)
}
