#![warn(missing_docs)]

//! chartbox: screen chart option callbacks and run them in a V8 sandbox.

mod cli;

use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chartbox_config::ChartboxConfig;
use chartbox_sandbox::{
    release, revive_detailed, screener, series_callback_paths, ConfigTree, ContextId, ContextPool,
    OptionPath, SandboxConfig, SkippedPath,
};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::cli::{CallSpec, Cli, Commands, ReviveArgs};

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &chartbox_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(mb) = overrides.memory_limit_mb {
        config.memory_limit = mb.saturating_mul(1024 * 1024);
    }
    if let Some(secs) = overrides.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.reap_interval_secs {
        config.reap_interval = Duration::from_secs(secs);
    }
    if let Some(ms) = overrides.compile_timeout_ms {
        config.compile_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = overrides.invoke_timeout_ms {
        config.invoke_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = overrides.max_source_bytes {
        config.max_source_size = bytes;
    }
    if let Some(max) = overrides.max_contexts {
        config.max_contexts = max;
    }
    config
}

fn load_config() -> Result<ChartboxConfig> {
    match chartbox_config::find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            ChartboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(ChartboxConfig::default())
        }
    }
}

fn read_options(path: &Path) -> Result<ConfigTree> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read options from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read options from {}", path.display()))?
    };
    let value: Value = serde_json::from_str(&raw).context("options are not valid JSON")?;
    Ok(ConfigTree::from(value))
}

/// Result of one `--call`.
#[derive(Debug, Serialize)]
struct CallOutcome {
    path: OptionPath,
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// JSON report printed by `chartbox revive`.
#[derive(Debug, Serialize)]
struct ReviveOutput {
    context_ids: Vec<ContextId>,
    skipped: Vec<SkippedPath>,
    calls: Vec<CallOutcome>,
    released: usize,
    options: Value,
}

fn requested_paths(args: &ReviveArgs, tree: &ConfigTree) -> Vec<OptionPath> {
    let mut paths = args.paths.clone();
    if args.series {
        for path in series_callback_paths(tree) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

async fn drive(pool: &Arc<ContextPool>, args: &ReviveArgs) -> Result<ReviveOutput> {
    let mut tree = read_options(&args.options)?;
    let paths = requested_paths(args, &tree);
    tracing::info!(paths = paths.len(), "reviving callbacks");

    let report = revive_detailed(pool, &mut tree, &paths).await;

    let mut calls = Vec::with_capacity(args.calls.len());
    for CallSpec {
        path,
        args: call_args,
    } in &args.calls
    {
        let outcome = match tree.get_path(path).and_then(ConfigTree::as_callback) {
            Some(callback) => CallOutcome {
                path: path.clone(),
                result: callback.call(call_args).await,
                error: None,
            },
            None => CallOutcome {
                path: path.clone(),
                result: None,
                error: Some("no revived callback at path".into()),
            },
        };
        calls.push(outcome);
    }

    let released = release(pool, &report.context_ids).await;
    Ok(ReviveOutput {
        context_ids: report.context_ids,
        skipped: report.skipped,
        calls,
        released,
        options: tree.to_json(),
    })
}

/// Run `work` against the pool, then dispose the pool whether the work
/// finished, panicked or was interrupted by Ctrl-C.
async fn supervise<T, F>(
    pool: &Arc<ContextPool>,
    work: F,
    shutdown: impl Future<Output = ()>,
) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let mut task = tokio::spawn(work);
    let outcome = tokio::select! {
        joined = &mut task => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!("revival task panicked, disposing sandbox");
                Err(anyhow::anyhow!("revival task panicked"))
            }
            Err(e) => Err(anyhow::anyhow!("revival task failed: {e}")),
        },
        () = shutdown => {
            tracing::info!("received shutdown signal, disposing sandbox");
            task.abort();
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    // Every exit path tears the isolate down.
    pool.dispose_all().await;
    outcome
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn run_revive(config: SandboxConfig, args: ReviveArgs) -> Result<()> {
    // Starting V8 blocks; keep it off the async workers.
    let pool = tokio::task::spawn_blocking(move || ContextPool::new(config))
        .await
        .context("sandbox startup task failed")?
        .context("failed to start sandbox")?;

    let worker = Arc::clone(&pool);
    let output = supervise(&pool, async move { drive(&worker, &args).await }, ctrl_c()).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_screen(config: &SandboxConfig, source: &str) -> ExitCode {
    match screener::screen(source, Some(config.max_source_size)) {
        Ok(()) => {
            println!("accepted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("rejected: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    let sandbox_config = build_sandbox_config(&config.sandbox);

    match cli.command {
        Commands::Screen { source } => Ok(run_screen(&sandbox_config, &source)),
        Commands::Revive(args) => {
            run_revive(sandbox_config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
