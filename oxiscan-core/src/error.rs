use oxiscan_model::ToolKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("duplicate in-flight job for {domain}/{tool}")]
    DuplicateJob { domain: String, tool: ToolKind },

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("orchestrator halted by stop-all; reset required before new batches")]
    Halted,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;
