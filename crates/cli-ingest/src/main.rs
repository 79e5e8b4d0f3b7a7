use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use ingest::{
    config::IngestConfig,
    identity::{sha256_file, sha8},
    orphans::{cleanup, CleanupMode, CleanupRequest},
    refresh::{refresh, RefreshOptions},
    resurrect::resurrect,
    score::record_score,
    validate::validate,
    handoff::{handoff, HandoffRequest},
    FfprobeCommand, QualityScore,
};
use log::{info, warn, LevelFilter};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Clip vault ingest and catalog maintenance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage, validate and publish one downloaded asset
    Handoff {
        /// Downloaded file
        source: PathBuf,
        /// File name (or full path) the asset gets once validated
        #[arg(long)]
        final_name: PathBuf,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        segment_id: String,
        /// Full identity hash of the asset
        #[arg(long, conflicts_with = "identity_file")]
        identity: Option<String>,
        /// Hash this file (normally the paired audio track) to get the identity
        #[arg(long)]
        identity_file: Option<PathBuf>,
        /// Expected duration in seconds
        #[arg(long)]
        target_duration: Option<f64>,
    },
    /// Run the validation gates against a file without touching the catalog
    Validate {
        path: PathBuf,
        #[arg(long)]
        target_duration: Option<f64>,
    },
    /// Find unreferenced files and dangling entries (dry run by default)
    Cleanup {
        /// Move orphans into the quarantine directory
        #[arg(long, conflicts_with = "delete")]
        quarantine: bool,
        /// Delete orphans
        #[arg(long)]
        delete: bool,
        /// Move entries whose file is gone into dangling_items
        #[arg(long)]
        mark_dangling: bool,
        /// Only consider files older than this many hours
        #[arg(long)]
        older_than_hours: Option<f64>,
        #[arg(long)]
        keep_last_n: Option<usize>,
    },
    /// Restore dangling entries whose file came back (dry run by default)
    Resurrect {
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Accept file names without a sha8 suffix
        #[arg(long)]
        allow_missing_sha8: bool,
        /// Trusted root for restored paths
        #[arg(long)]
        state_root: Option<PathBuf>,
    },
    /// Re-probe final files whose modification time changed
    Refresh {
        /// Re-probe every tracked file
        #[arg(long)]
        force: bool,
    },
    /// Attach a quality score to a catalog entry
    Score {
        key: String,
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=10))]
        visual: u8,
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=10))]
        audio: u8,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        scorer: Option<String>,
    },
    /// Print the SHA-256 and sha8 of a file
    Hash { path: PathBuf },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to render report")?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let mut logger = env_logger::Builder::new();
    logger
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded
async fn run(args: Args) -> Result<bool> {
    let cfg = IngestConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let store = cfg.store();

    match args.command {
        Command::Handoff { source, final_name, run_id, segment_id, identity, identity_file, target_duration } => {
            let identity_sha256 = match (identity, identity_file) {
                (Some(identity), _) => identity,
                (None, Some(file)) => sha256_file(&file)?,
                (None, None) => bail!("either --identity or --identity-file is required"),
            };
            let final_path = if final_name.is_absolute() { final_name } else { cfg.final_dir.join(final_name) };
            let req = HandoffRequest { source, final_path, run_id, segment_id, identity_sha256, target_duration };

            let prober = FfprobeCommand::new(cfg.probe.clone());
            let result = handoff(&prober, &store, &req, &cfg.handoff_options()).await;
            print_json(&result)?;
            Ok(result.ok)
        }

        Command::Validate { path, target_duration } => {
            let prober = FfprobeCommand::new(cfg.probe.clone());
            let result = validate(&prober, &path, target_duration, &cfg.validation).await;
            print_json(&result)?;
            Ok(result.ok)
        }

        Command::Cleanup { quarantine, delete, mark_dangling, older_than_hours, keep_last_n } => {
            let mut filters = cfg.orphan_filters();
            filters.older_than = older_than_hours.map(|h| Duration::from_secs_f64(h.max(0.0) * 3600.0));
            if let Some(n) = keep_last_n {
                filters.keep_last_n = n;
            }
            let mode = CleanupMode::from_flags(quarantine, delete);
            let req = CleanupRequest {
                final_dir: cfg.final_dir.clone(),
                quarantine_dir: cfg.quarantine_dir.clone(),
                filters,
                mode,
                mark_dangling,
            };

            let report = cleanup(&store, &req)?;
            info!(
                "Cleanup ({}): {} orphan(s), {} reclaimed, {} dangling",
                mode.as_str(),
                report.counts.found,
                format_size(report.counts.bytes, DECIMAL),
                report.dangling_observed.len()
            );
            print_json(&report)?;
            Ok(report.counts.failed == 0)
        }

        Command::Resurrect { apply, limit, allow_missing_sha8, state_root } => {
            let mut opts = cfg.resurrect_options();
            opts.apply = apply;
            opts.allow_missing_sha8 = allow_missing_sha8;
            if let Some(limit) = limit {
                opts.limit = limit;
            }
            if state_root.is_some() {
                opts.state_root = state_root;
            }

            let stats = resurrect(&store, &opts).await?;
            print_json(&stats)?;
            Ok(true)
        }

        Command::Refresh { force } => {
            let prober = FfprobeCommand::new(cfg.probe.clone());
            let opts = RefreshOptions { force, extension: cfg.extension.clone() };
            let stats = refresh(&prober, &store, &cfg.final_dir, &opts).await?;
            if !stats.mismatches.is_empty() {
                warn!("{} file(s) carry a key recorded under another name", stats.mismatches.len());
            }
            print_json(&stats)?;
            Ok(stats.probe_failed == 0)
        }

        Command::Score { key, visual, audio, notes, scorer } => {
            let score = QualityScore { visual, audio, notes, scorer, scored_at: Utc::now() };
            record_score(&store, &key, score)?;
            print_json(&serde_json::json!({ "key": key, "visual": visual, "audio": audio }))?;
            Ok(true)
        }

        Command::Hash { path } => {
            let sha256 = sha256_file(&path)?;
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or_default();
            print_json(&serde_json::json!({
                "path": path,
                "sha256": sha256,
                "sha8": sha8(&sha256),
                "size": format_size(size, DECIMAL),
            }))?;
            Ok(true)
        }
    }
}
