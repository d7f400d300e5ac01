//! Error types for the replay binary.

/// Top-level error for `steplog-replay`.
///
/// Each variant wraps a subsystem error so `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: steplog_core::config::ConfigError,
    },

    /// The output directory could not be prepared.
    #[error("output error: {source}")]
    Output {
        /// The underlying output error.
        #[from]
        source: steplog_analysis::output::OutputError,
    },

    /// Replaying the stream failed.
    #[error("replay error: {source}")]
    Replay {
        /// The underlying replay error.
        #[from]
        source: steplog_engine::replay::ReplayError,
    },
}
