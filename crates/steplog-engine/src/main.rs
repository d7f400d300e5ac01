//! `steplog-replay`: re-run the live analysis over a persisted stream.
//!
//! ```text
//! steplog-replay [STREAM_FILE] [OUTPUT_DIR]
//! ```
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `$STEPLOG_CONFIG` or `steplog-config.yaml`
//! 2. Initialize structured logging (tracing), `RUST_LOG` overriding the
//!    configured level
//! 3. Resolve the stream file and output directory, arguments first
//! 4. Replay the stream through the step statistics
//! 5. Write the buckets and log the totals

mod error;

use std::path::{Path, PathBuf};

use steplog_analysis::output::JsonBucketSink;
use steplog_core::config::SteplogConfig;
use steplog_engine::replay;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if the configuration, the stream file or the output
/// directory cannot be used.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let (config, config_source) = load_config()?;

    // 2. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!(
        source = %config_source,
        mode = ?config.mode,
        target_events = ?config.analysis.target_events,
        filtered = config.analysis.filter.is_some(),
        "steplog-replay starting"
    );

    // 3. Resolve paths.
    let mut args = std::env::args_os().skip(1);
    let stream_path = args
        .next()
        .map_or_else(|| config.persistence.stream_path.clone(), PathBuf::from);
    let output_dir = args
        .next()
        .map_or_else(|| config.analysis.output_dir.clone(), PathBuf::from);

    // 4-5. Replay and write.
    let summary = run(&config, &stream_path, &output_dir)?;
    info!(
        events = summary.events,
        steps = summary.steps,
        queries = summary.queries,
        skipped = summary.skipped,
        output_dir = %output_dir.display(),
        "steplog-replay finished"
    );
    Ok(())
}

fn run(
    config: &SteplogConfig,
    stream_path: &Path,
    output_dir: &Path,
) -> Result<replay::ReplaySummary, EngineError> {
    let mut sink = JsonBucketSink::create(output_dir)?;
    let summary = replay::replay_file(stream_path, &config.analysis, &mut sink)?;
    Ok(summary)
}

/// Load the configuration, falling back to defaults when no file exists.
///
/// Returns the configuration and a description of where it came from.
fn load_config() -> Result<(SteplogConfig, String), EngineError> {
    let config_path = std::env::var_os("STEPLOG_CONFIG")
        .map_or_else(|| PathBuf::from("steplog-config.yaml"), PathBuf::from);
    if config_path.exists() {
        let config = SteplogConfig::from_file(&config_path)?;
        Ok((config, config_path.display().to_string()))
    } else {
        let mut config = SteplogConfig::default();
        config.apply_env_overrides();
        Ok((config, "defaults".to_owned()))
    }
}
