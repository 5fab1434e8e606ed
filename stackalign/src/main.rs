//! Stackalign CLI.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use stackalign::task::{encode_result, execute_task};
use stackalign::{
    AlignOptions, AlignTask, AlignmentDriver, CancelToken, EngineConfig, ProcessRunner,
    ResultCache, Stack, SwimMirPrimitive, TaskQueue,
};

#[derive(Parser)]
#[command(name = "stackalign")]
#[command(about = "Align serial-section image stacks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Align one scale level of a stack and save the results into the stack file.
    Align {
        /// Stack file (YAML or JSON).
        #[arg(long)]
        stack: PathBuf,

        /// Scale level to align; 1 is full resolution.
        #[arg(long)]
        scale: u32,

        /// Recompute every section even when cached.
        #[arg(long)]
        ignore_cache: bool,

        /// First section index to align.
        #[arg(long)]
        start: Option<usize>,

        /// Last section index to align, inclusive.
        #[arg(long)]
        end: Option<usize>,

        /// Engine configuration file (YAML or JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log directory; defaults to `logs` next to the stack file.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Run one alignment task read as JSON from stdin. Used by `align` workers.
    RunTask {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Inspect or clear a durable result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete every cached entry.
    Clear {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print the number of cached entries.
    Stats {
        #[arg(long)]
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Align {
            stack,
            scale,
            ignore_cache,
            start,
            end,
            config,
            log_dir,
        } => {
            let range = (start.is_some() || end.is_some())
                .then(|| (start.unwrap_or(0), end.unwrap_or(usize::MAX)));
            let options = AlignOptions {
                scale,
                ignore_cache,
                range,
            };
            run_align(&stack, &options, config.as_deref(), log_dir)
        }
        Commands::RunTask { config } => run_task(config.as_deref()),
        Commands::Cache { action } => run_cache(action),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config: EngineConfig = match path {
        Some(path) => common::load_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate();
    Ok(config)
}

fn run_align(
    stack_path: &Path,
    options: &AlignOptions,
    config_path: Option<&Path>,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let log_dir = log_dir.unwrap_or_else(|| {
        stack_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("logs")
    });
    common::log_setup::setup_logging(config.log_level.as_deref().unwrap_or("info"), &log_dir)?;

    let mut stack = Stack::load(stack_path)
        .with_context(|| format!("Failed to load stack {}", stack_path.display()))?;
    info!(
        stack = %stack.name,
        sections = stack.len(),
        scale = options.scale,
        "aligning"
    );

    let exe = std::env::current_exe().context("Failed to locate the stackalign executable")?;
    let mut worker_args = vec!["run-task".to_string()];
    if let Some(path) = config_path {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        worker_args.push("--config".into());
        worker_args.push(path.display().to_string());
    }
    let runner = ProcessRunner::new(exe).with_args(worker_args);

    let cache = match &config.cache_dir {
        Some(dir) => ResultCache::open(dir)?,
        None => ResultCache::in_memory(),
    };
    let mut driver = AlignmentDriver::new(TaskQueue::new(runner, config.queue.clone()), cache);
    if let Some(output) = &config.output_dir {
        driver = driver.with_output_dir(output);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(async {
        let cancel = CancelToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling");
                    cancel.cancel();
                }
            }
        });
        let progress = |finished: usize, total: usize| info!(finished, total, "progress");
        driver.align(&mut stack, options, &cancel, &progress).await
    })?;

    stack
        .save(stack_path)
        .with_context(|| format!("Failed to save stack {}", stack_path.display()))?;

    println!(
        "scale {}: {} aligned, {} from cache, {} dispatched, {} failed",
        report.scale,
        report.succeeded.len(),
        report.cache_hits,
        report.dispatched,
        report.failed.len()
    );
    for failed in &report.failed {
        println!("  {} ({}): {}", failed.index, failed.name, failed.message);
    }

    if report.cancelled {
        bail!("Alignment cancelled");
    }
    if !report.failed.is_empty() {
        bail!("{} sections failed to align", report.failed.len());
    }
    Ok(())
}

fn run_task(config_path: Option<&Path>) -> anyhow::Result<()> {
    common::log_setup::setup_stderr_logging("warn")?;
    let config = load_config(config_path)?;

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read task from stdin")?;
    let task: AlignTask = serde_json::from_str(&input).context("Invalid task JSON")?;

    let primitive = SwimMirPrimitive::from_config(&config.primitive);
    let result = execute_task(&task, &primitive)
        .with_context(|| format!("Section {} failed", task.index))?;
    print!("{}", encode_result(&result)?);
    Ok(())
}

fn run_cache(action: CacheAction) -> anyhow::Result<()> {
    match action {
        CacheAction::Clear { dir } => {
            let removed = ResultCache::open(&dir)?.clear()?;
            println!("removed {removed} entries from {}", dir.display());
        }
        CacheAction::Stats { dir } => {
            let entries = ResultCache::open(&dir)?.len()?;
            println!("{}: {entries} entries", dir.display());
        }
    }
    Ok(())
}
