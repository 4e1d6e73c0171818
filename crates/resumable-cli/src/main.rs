//! resumable CLI
//!
//! Inspect snapshots and export what is needed to reproduce a run.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use resumable::checkpoint::{upgrade, Snapshot};
use resumable::codec;
use resumable::store::LocalStore;

#[derive(Parser)]
#[command(name = "ckpt")]
#[command(version, about = "Inspect and export resumable training snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a snapshot: schema, counters, best result, provenance
    Inspect {
        /// Snapshot or final artifact
        path: PathBuf,
    },

    /// List parameter names and shapes
    Keys {
        /// Snapshot or final artifact
        path: PathBuf,

        /// Show names as a data-parallel model would see them
        #[arg(long)]
        parallel: bool,
    },

    /// Write the embedded run configuration as YAML
    ExportConfig {
        path: PathBuf,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the uncommitted diff captured at save time
    ExportDiff {
        path: PathBuf,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the exported artifacts
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { path } => inspect(&path)?,
        Commands::Keys { path, parallel } => keys(&path, parallel)?,
        Commands::ExportConfig { path, output } => export_config(&path, output.as_deref())?,
        Commands::ExportDiff { path, output } => export_diff(&path, output.as_deref())?,
    }

    Ok(())
}

fn read_snapshot(path: &Path) -> Result<(Snapshot, Value)> {
    let value = codec::read_value(&LocalStore, path)
        .with_context(|| format!("reading {}", path.display()))?;
    let snapshot = Snapshot::from_value(value.clone())
        .with_context(|| format!("{} is not a snapshot", path.display()))?;
    tracing::info!(path = %path.display(), tensors = snapshot.model.len(), "Read snapshot");
    Ok((snapshot, value))
}

fn inspect(path: &Path) -> Result<()> {
    let (snapshot, raw) = read_snapshot(path)?;
    let parameters_only = raw.get("model").is_none();

    println!("Snapshot: {}", path.display());
    if parameters_only {
        println!("  kind:              parameters only");
    } else {
        println!("  schema version:    {}", snapshot.schema_version);
        if !snapshot.library_version.is_empty() {
            println!("  library version:   {}", snapshot.library_version);
        }
        if snapshot.created_at > 0 {
            println!("  created at:        {}", snapshot.created_at);
        }
        println!("  current iteration: {}", snapshot.progress.current_iteration);
        println!("  current epoch:     {}", snapshot.progress.current_epoch);
        println!("  num updates:       {}", snapshot.progress.num_updates);
        println!("  best iteration:    {}", snapshot.best.best_iteration);
        println!("  best update:       {}", snapshot.best.best_update);
        match snapshot.best.best_metric_value {
            Some(value) => println!("  best metric:       {}", value),
            None => println!("  best metric:       -"),
        }
        println!(
            "  optimizer state:   {}",
            if snapshot.optimizer.is_some() { "yes" } else { "no" }
        );
    }

    let elements: usize = snapshot.model.values().map(|t| t.len()).sum();
    println!(
        "  parameters:        {} tensors, {} values",
        snapshot.model.len(),
        elements
    );

    if let Some(provenance) = &snapshot.provenance {
        println!("  git branch:        {}", provenance.branch);
        println!("  git commit:        {}", provenance.commit);
        if !provenance.diff.is_empty() {
            println!("  uncommitted diff:  {} lines", provenance.diff.lines().count());
        }
    }

    Ok(())
}

fn keys(path: &Path, parallel: bool) -> Result<()> {
    let (snapshot, _) = read_snapshot(path)?;
    let state = upgrade(snapshot.model, parallel);

    for (name, tensor) in &state {
        println!("{}\t{:?}", name, tensor.shape());
    }
    Ok(())
}

fn export_config(path: &Path, output: Option<&Path>) -> Result<()> {
    let (snapshot, _) = read_snapshot(path)?;
    if snapshot.config.is_null() {
        bail!("{} carries no run configuration", path.display());
    }

    let yaml = serde_yaml::to_string(&snapshot.config)?;
    write_output(output, &yaml)
}

fn export_diff(path: &Path, output: Option<&Path>) -> Result<()> {
    let (snapshot, _) = read_snapshot(path)?;
    let Some(provenance) = snapshot.provenance else {
        bail!("{} carries no git provenance", path.display());
    };

    if provenance.diff.is_empty() {
        tracing::warn!(commit = %provenance.commit, "Working tree was clean at save time");
    }
    write_output(output, &provenance.diff)?;

    if let Some(output) = output {
        eprintln!(
            "Check out {} on {} and apply with: patch -p0 < {}",
            provenance.commit,
            provenance.branch,
            output.display()
        );
    }
    Ok(())
}

fn write_output(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        }
        None => print!("{}", text),
    }
    Ok(())
}
