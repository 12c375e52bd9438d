//! Marrow Core - Foundational types for the Marrow skin-weight engine
//!
//! This crate provides the types every other Marrow crate depends on:
//! - `BoneIndex` / `VertexIndex` index aliases and weight constants
//! - `WeightEditOperation`, `FalloffMode` and the other editing enums
//! - `BrushConfig` / `BrushSettings` configuration structs
//! - Error types and Result alias

mod config;
mod error;

pub use config::{
    BrushConfig, BrushSettings, FalloffMode, MirrorAxis, MirrorDirection, WeightEditOperation,
};
pub use error::{MarrowError, Result};

/// Index of a bone within the skeleton hierarchy.
pub type BoneIndex = usize;

/// Index of a vertex within the edited mesh.
pub type VertexIndex = usize;

/// The root bone is always the first entry of the skeleton.
pub const ROOT_BONE_INDEX: BoneIndex = 0;

/// Hard cap on the number of influences recorded per vertex.
pub const MAX_INFLUENCES_PER_VERTEX: usize = 12;

/// Weights at or below this value carry no meaningful influence.
/// Matches the smallest representable weight of a 16-bit quantized store.
pub const MINIMUM_WEIGHT_THRESHOLD: f32 = 1.0 / 65535.0;

/// Tolerance used when comparing weights for near-equality.
pub const WEIGHT_EPSILON: f32 = 1.0e-4;

/// Returns true if two weight values are equal within [`WEIGHT_EPSILON`].
pub fn nearly_equal(a: f32, b: f32) -> bool {
    (a - b).abs() <= WEIGHT_EPSILON
}
