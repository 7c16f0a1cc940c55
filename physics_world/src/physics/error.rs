//! Error types for the physics world

use crate::config::ConfigError;
use thiserror::Error;

/// Errors returned by lifecycle, body and step operations
#[derive(Debug, Error)]
pub enum PhysicsError {
    #[error("physics world is not initialized")]
    NotInitialized,

    #[error("physics world is already initialized")]
    AlreadyInitialized,

    #[error("failed to create physics job pool: {0}")]
    JobSystem(String),

    #[error("body capacity of {capacity} exhausted")]
    BodyCapacityExhausted { capacity: usize },

    #[error("body handle is stale or was never issued")]
    InvalidHandle,

    #[error("body is already in the simulation")]
    BodyAlreadyAdded,

    #[error("body is not in the simulation")]
    BodyNotAdded,

    #[error("triangle meshes can only be used by static bodies")]
    UnsupportedShape,

    #[error("dynamic bodies cannot be placed on the non-moving layer")]
    LayerMotionMismatch,

    #[error("scratch allocator exhausted: requested {requested} bytes, {remaining} of {budget} remaining")]
    ScratchExhausted {
        requested: usize,
        remaining: usize,
        budget: usize,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl PhysicsError {
    /// Whether the error leaves the world unusable for the rest of its lifetime
    ///
    /// Lifecycle misuse, job pool creation and scratch exhaustion are fatal;
    /// the host decides whether to abort. Everything else is reported to the
    /// caller and the world keeps working.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PhysicsError::NotInitialized
                | PhysicsError::AlreadyInitialized
                | PhysicsError::JobSystem(_)
                | PhysicsError::ScratchExhausted { .. }
        )
    }
}

/// Errors from importing static geometry
#[derive(Debug, Error)]
pub enum MeshImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: vertex index {index} out of range ({vertex_count} vertices so far)")]
    IndexOutOfRange {
        line: usize,
        index: i64,
        vertex_count: usize,
    },

    #[error("OBJ load error: {0}")]
    Obj(#[from] tobj::LoadError),

    #[error("mesh has no triangles")]
    Empty,

    #[error("failed to create mesh body: {0}")]
    Body(#[from] PhysicsError),
}
