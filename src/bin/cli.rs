//! treesync command line front end
//!
//! Thin collaborator over the engine: trigger scans, print categorized
//! diffs in a stable line format, apply staged batches, and report engine
//! status.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use treesync::diff::{Category, DiffOptions, DiffResult};
use treesync::node::identifier::normalize_path;
use treesync::Engine;

#[derive(Parser)]
#[command(name = "treesync", about = "Bidirectional tree sync and diff engine")]
struct Cli {
    /// Engine data directory (defaults to the platform data dir)
    #[arg(long, env = "TREESYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "treesync=debug"
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a tree into the index
    Scan {
        /// Device kind: currently only "local"
        device: String,
        /// Subtree root to scan
        path: String,
    },
    /// Diff two tree roots and print the categorized node list
    Diff {
        left_root: String,
        right_root: String,
        /// Detect moves, duplicates and in-place updates by path
        #[arg(long)]
        compare_paths: bool,
        /// Use modify times to guess rename direction
        #[arg(long = "use-mtime")]
        use_mtime: bool,
    },
    /// Execute a staged op batch from a batch file
    Apply {
        /// Path to a batch file (JSON list of op specs)
        batch: PathBuf,
    },
    /// Print an engine summary
    Status,
}

/// One op in a batch file.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum OpSpec {
    Rm { path: String },
    Mkdir { path: String },
    Cp { src: String, dst: String },
    Mv { src: String, dst: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let engine = Engine::new(cli.data_dir.clone()).await?;

    let code = match cli.command {
        Commands::Scan { device, path } => scan(&engine, &device, &path).await?,
        Commands::Diff {
            left_root,
            right_root,
            compare_paths,
            use_mtime,
        } => {
            diff(
                &engine,
                &left_root,
                &right_root,
                DiffOptions {
                    compare_paths_also: compare_paths,
                    use_modify_times: use_mtime,
                    include_trashed: false,
                },
            )
            .await?
        }
        Commands::Apply { batch } => apply(&engine, &batch).await?,
        Commands::Status => status(&engine),
    };

    engine.shutdown().await;
    Ok(code)
}

async fn scan(engine: &Arc<Engine>, device: &str, path: &str) -> Result<ExitCode> {
    if device != "local" {
        return Err(anyhow!(
            "Only 'local' scans are available from the CLI; cloud trees load through a connected provider client"
        ));
    }
    let stats = engine.scan_local(path).await?;
    println!(
        "scanned {}: {} files, {} dirs, {} bytes ({} skipped)",
        normalize_path(path),
        stats.files,
        stats.dirs,
        stats.bytes,
        stats.skipped
    );
    Ok(ExitCode::SUCCESS)
}

async fn diff(
    engine: &Arc<Engine>,
    left_root: &str,
    right_root: &str,
    options: DiffOptions,
) -> Result<ExitCode> {
    // Make sure both roots are present in the index before diffing.
    engine.local_store_for_path(left_root).await.ok();
    engine.local_store_for_path(right_root).await.ok();

    let result = engine.diff_trees(left_root, right_root, options).await?;
    print_diff(&result);
    Ok(ExitCode::SUCCESS)
}

/// Stable line format: `<side>\t<CATEGORY>\t<path>[\tprev=..][\tghost]`,
/// left side first, paths sorted within each side.
fn print_diff(result: &DiffResult) {
    for (side_name, side) in [("left", &result.left), ("right", &result.right)] {
        let mut lines: Vec<String> = side
            .entries
            .iter()
            .filter(|entry| entry.category != Category::Unchanged)
            .map(|entry| {
                let mut line = format!(
                    "{side_name}\t{}\t{}",
                    entry.category.to_string().to_uppercase(),
                    entry.node.identifier.single_path()
                );
                if let Some(prev) = &entry.prev_path {
                    line.push_str(&format!("\tprev={prev}"));
                }
                if entry.ghost {
                    line.push_str("\tghost");
                }
                line
            })
            .collect();
        lines.sort();
        for line in lines {
            println!("{line}");
        }
    }
    eprintln!(
        "left: [{}]  right: [{}]",
        result.left.summary_string(),
        result.right.summary_string()
    );
}

async fn apply(engine: &Arc<Engine>, batch_path: &PathBuf) -> Result<ExitCode> {
    let json = std::fs::read_to_string(batch_path)
        .with_context(|| format!("reading batch file {batch_path:?}"))?;
    let specs: Vec<OpSpec> = serde_json::from_str(&json).context("parsing batch file")?;

    // The trees every op touches must be registered and scanned first.
    let mut batch = engine.new_batch();
    for spec in &specs {
        match spec {
            OpSpec::Rm { path } => {
                let store = engine.local_store_for_path(path).await?;
                let node = store
                    .node_for_path(path)
                    .ok_or_else(|| anyhow!("'{path}' is not in the index; scan first"))?;
                engine.stage_rm(&mut batch, node);
            }
            OpSpec::Mkdir { path } => {
                let store = engine.local_store_for_path(path).await?;
                engine
                    .stage_mkdir(&mut batch, store.device.uid, path)
                    .await?;
            }
            OpSpec::Cp { src, dst } => {
                let src_store = engine.local_store_for_path(src).await?;
                let dst_store = engine.local_store_for_path(dst).await?;
                let node = src_store
                    .node_for_path(src)
                    .ok_or_else(|| anyhow!("'{src}' is not in the index; scan first"))?;
                engine
                    .stage_cp(&mut batch, node, dst_store.device.uid, dst, false)
                    .await?;
            }
            OpSpec::Mv { src, dst } => {
                let src_store = engine.local_store_for_path(src).await?;
                let dst_store = engine.local_store_for_path(dst).await?;
                let node = src_store
                    .node_for_path(src)
                    .ok_or_else(|| anyhow!("'{src}' is not in the index; scan first"))?;
                engine
                    .stage_mv(&mut batch, node, dst_store.device.uid, dst, false)
                    .await?;
            }
        }
    }

    let total = batch.ops.len();
    let (completed, failed, pending) = engine.apply_batch(&batch).await?;
    println!("applied {completed}/{total} ops ({failed} failed, {pending} blocked)");

    if failed == 0 && pending == 0 {
        Ok(ExitCode::SUCCESS)
    } else if completed > 0 {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::from(1))
    }
}

fn status(engine: &Arc<Engine>) -> ExitCode {
    println!("{}", engine.summary().to_string().to_uppercase());
    ExitCode::SUCCESS
}
