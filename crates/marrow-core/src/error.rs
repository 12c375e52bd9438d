//! Error types for Marrow

use thiserror::Error;

/// The main error type for Marrow operations
#[derive(Debug, Error)]
pub enum MarrowError {
    #[error("Bone not found: {0}")]
    BoneNotFound(String),

    #[error("Skeleton error: {0}")]
    SkeletonError(String),

    #[error("Weight count mismatch: expected {expected} vertices, got {got}")]
    WeightCountMismatch { expected: usize, got: usize },

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("Mesh error: {0}")]
    MeshError(String),
}

/// Result type alias for Marrow operations
pub type Result<T> = std::result::Result<T, MarrowError>;
