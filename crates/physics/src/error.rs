//! Error types for the physics facade

use std::fmt;
use thiserror::Error;

/// Kind of object a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    World,
    Body,
    Shape,
    Character,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::World => "world",
            HandleKind::Body => "body",
            HandleKind::Shape => "shape",
            HandleKind::Character => "character",
        };
        f.write_str(name)
    }
}

/// Errors reported by [`Physics`](crate::Physics) operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhysicsError {
    /// Handle was never issued, or its object has been destroyed
    #[error("invalid {kind} handle")]
    InvalidHandle { kind: HandleKind },

    #[error("shape type mismatch: expected {expected}, got {actual}")]
    ShapeTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("child index {index} out of range for compound with {len} children")]
    ChildIndexOutOfRange { index: usize, len: usize },

    #[error("shape is still held by {holders} owner(s)")]
    ShapeInUse { holders: usize },

    #[error("adding this child would make the compound contain itself")]
    ShapeCycle,

    #[error("body is still attached to a world")]
    BodyAttached,

    #[error("character is still attached to a world")]
    CharacterAttached,

    #[error("object is already attached to a world")]
    AlreadyAttached,

    #[error("object is not attached to this world")]
    NotAttached,

    #[error("world still has {bodies} bodies and {characters} characters attached")]
    WorldNotEmpty { bodies: usize, characters: usize },

    #[error("degenerate shape: {reason}")]
    DegenerateShape { reason: String },

    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f32 },

    #[error("index stride must be 1, 2 or 4 bytes, got {stride}")]
    InvalidIndexStride { stride: usize },

    #[error("vertex stride {stride} is smaller than a position (12 bytes)")]
    VertexStrideTooSmall { stride: usize },

    #[error("{buffer} buffer too small: need {expected} bytes, have {available}")]
    BufferTooSmall {
        buffer: &'static str,
        expected: usize,
        available: usize,
    },

    #[error("index {index} out of bounds for {vertex_count} vertices")]
    IndexOutOfBounds { index: u32, vertex_count: usize },

    #[error("index count {count} is not a multiple of 3")]
    IncompleteTriangle { count: usize },

    #[error("triangle mesh has no triangles")]
    EmptyMesh,

    #[error("invalid triangle mesh: {reason}")]
    InvalidMeshData { reason: String },
}

impl PhysicsError {
    pub(crate) fn invalid(kind: HandleKind) -> Self {
        PhysicsError::InvalidHandle { kind }
    }

    /// Rejects non-finite or non-positive dimensions
    pub(crate) fn check_positive(name: &'static str, value: f32) -> Result<f32> {
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(PhysicsError::InvalidParameter { name, value })
        }
    }
}

/// Result type for physics facade operations
pub type Result<T> = std::result::Result<T, PhysicsError>;
