use std::time::Duration;
use thiserror::Error;

/// Result type for relay pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while wiring, running, or draining a chain
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage is single-use and cannot be restarted once stopped
    #[error("Stage '{stage}' has already been stopped")]
    AlreadyStopped { stage: String },

    /// Upstream finished normally and every queued item has been drained
    #[error("End of stream")]
    EndOfStream,

    /// A stage aborted; queued items behind it were discarded
    #[error("Stage '{stage}' failed: {reason}")]
    StageFault { stage: String, reason: String },

    /// A blocking pop was interrupted by a stop request
    #[error("Blocking receive cancelled by stop request")]
    Cancelled,

    /// No item arrived within the requested wait
    #[error("No item available after {0:?}")]
    Timeout(Duration),

    /// Stage thread panicked and could not be joined cleanly
    #[error("Thread join error: {0}")]
    ThreadError(String),

    /// The OS refused to spawn a stage thread
    #[error("Failed to spawn stage thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Whether the error marks a normal, drained end of the stream
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PipelineError::EndOfStream)
    }
}
