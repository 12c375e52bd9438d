//! Skin-weight editing engine
//!
//! The center of Marrow: double-buffered weight storage with bounded
//! influence counts, brush-stroke editing with surface or volume
//! falloff, bulk operations (mirror, prune, average, normalize, hammer,
//! transfer) and an incremental skinning preview. Every mutation is
//! transactional and yields a reversible [`WeightsChange`] for the host
//! undo stack.
//!
//! Entry point is [`WeightEditSession`], generic over the host's mesh
//! through `marrow_mesh::EditableMesh`.

mod deformer;
mod edits;
mod mirror;
mod ops;
mod relax;
mod scheduler;
mod session;
mod store;

pub use deformer::Deformer;
pub use edits::{BoneWeightEdits, WeightEditBatch, WeightsChange};
pub use mirror::MirrorData;
pub use relax::{smooth_weights_at_vertex, truncate_and_normalize};
pub use scheduler::{InlineScheduler, TaskHandle, TaskScheduler, ThreadScheduler};
pub use session::{
    calculate_brush_falloff, calculate_brush_strength_to_use, BrushStamp, WeightEditSession,
};
pub use store::{normalize_vertex, Snapshot, VertexBoneWeight, VertexWeightStore, VertexWeights};
