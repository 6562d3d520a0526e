use anyhow::{bail, Context};
use clap::Parser;
use pdf_squeeze::batch::{print_report, BatchCompressor, CancelToken};
use pdf_squeeze::checkpoint::{CheckpointStore, RunStatus};
use pdf_squeeze::cli::{Args, Commands};
use pdf_squeeze::config::BatchConfig;
use pdf_squeeze::constants::{
    COMPRESSED_SIZE_PREFIX, COMPRESSION_RATIO_PREFIX, DEFAULT_CHECKPOINT_FILE, INFO_PREFIX,
    ORIGINAL_SIZE_PREFIX, SUCCESS_PREFIX, WARNING_PREFIX,
};
use pdf_squeeze::engine::{build_engine, compress_file};
use pdf_squeeze::outcome::Aggregate;
use pdf_squeeze::utils::{absolutize, format_file_size};
use pdf_squeeze::{logger, say};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, warn};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(args.quiet, args.verbose);

    match args.command {
        Commands::Batch(batch) => {
            let config = batch.to_config()?;
            let cancel = CancelToken::new();
            watch_ctrl_c(cancel.clone());

            say!("🚀 Starting batch compression...");
            let compressor = BatchCompressor::new(config)?
                .with_cancel_token(cancel)
                .hide_progress(batch.no_progress);
            let report = compressor.run()?;
            print_report(&report);
        }
        Commands::Compress {
            input,
            output,
            options,
        } => {
            let mut config = BatchConfig::default();
            options.apply(&mut config);
            config.validate()?;
            compress_single(&config, &input, &output)?;
        }
        Commands::Status { checkpoint } => {
            let path = checkpoint.unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_FILE));
            show_status(&CheckpointStore::new(absolutize(&path)));
        }
    }

    Ok(())
}

fn compress_single(config: &BatchConfig, input: &Path, output: &Path) -> anyhow::Result<()> {
    if !input.is_file() {
        bail!("Input file not found: {}", input.display());
    }
    let engine = build_engine(config)?;
    say!("📋 Compressing {} with {}", input.display(), engine.name());

    let result = compress_file(engine.as_ref(), input, output, config.min_savings_percent);
    if !result.output_written {
        bail!("Nothing written for {}: {}", input.display(), result.message);
    }

    say!("  {} {}", ORIGINAL_SIZE_PREFIX, format_file_size(result.original_size));
    say!("  {} {}", COMPRESSED_SIZE_PREFIX, format_file_size(result.final_size));
    match result.failure_category() {
        None => {
            say!("  {} {:.1}%", COMPRESSION_RATIO_PREFIX, result.ratio());
            say!("{} Saved to {}", SUCCESS_PREFIX, output.display());
        }
        Some(category) => {
            say!("{}  Original copied ({}): {}", WARNING_PREFIX, category, result.message);
        }
    }
    Ok(())
}

fn show_status(store: &CheckpointStore) {
    match store.status() {
        RunStatus::NotStarted => {
            println!("{} No batch in progress ({} not found)", INFO_PREFIX, store.path().display());
        }
        RunStatus::InProgress(state) => {
            println!("{} Batch in progress: {} files processed", INFO_PREFIX, state.processed_files.len());
            if let Some(first) = state.session.first_start {
                println!("  Started: {}", first.to_rfc3339());
            }
            if let Some(last) = state.last_update {
                println!("  Last checkpoint: {}", last.to_rfc3339());
            }
            println!("  Resumes: {}", state.session.resume_count);
            print_totals(&state.stats);
        }
        RunStatus::Completed(marker) => {
            println!(
                "{} Batch completed at {}: {} files processed",
                SUCCESS_PREFIX,
                marker.completed_at.to_rfc3339(),
                marker.state.processed_files.len()
            );
            print_totals(&marker.state.stats);
        }
    }
}

fn print_totals(stats: &Aggregate) {
    println!("  Compressed: {}", stats.total_compressed);
    println!("  Kept original: {}", stats.total_errors);
    println!(
        "  Space saved: {} ({:.1}%)",
        format_file_size(stats.space_saved_bytes),
        stats.overall_ratio()
    );
}

/// First Ctrl-C asks the batch to stop after in-flight files; a second one exits at once.
fn watch_ctrl_c(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("pdf-squeeze-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "Cannot install Ctrl-C handler");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("Interrupt received; finishing in-flight files, press Ctrl-C again to abort");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        })
        .context("failed to spawn signal thread");
    if let Err(err) = spawned {
        warn!(error = %err, "Ctrl-C will terminate without saving progress");
    }
}
