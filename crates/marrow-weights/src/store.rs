//! Double-buffered per-vertex weight storage and normalized editing
//!
//! Weights live in two parallel snapshots. `pre_stroke` holds the state
//! before the current stroke and is the fixed basis every stamp is
//! computed against, so dragging back and forth never compounds.
//! `current` is the live state the deformer and viewport read. Between
//! strokes the snapshots are identical.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use glam::{Affine3A, Vec3};

use marrow_core::{
    nearly_equal, BoneIndex, MarrowError, Result, VertexIndex, MAX_INFLUENCES_PER_VERTEX,
    MINIMUM_WEIGHT_THRESHOLD, ROOT_BONE_INDEX,
};
use marrow_mesh::{EditableMesh, PointHashGrid};
use marrow_skeleton::Skeleton;

use crate::deformer::Deformer;
use crate::edits::WeightEditBatch;
use crate::scheduler::TaskScheduler;

/// A single bone influence on a vertex.
///
/// The reference-pose position of the vertex in the bone's space is
/// cached here so skinning is one transform per influence.
#[derive(Debug, Clone, Copy)]
pub struct VertexBoneWeight {
    pub bone: BoneIndex,
    pub position_in_bone_space: Vec3,
    pub weight: f32,
}

/// All influences on one vertex. At most `MAX_INFLUENCES_PER_VERTEX`.
pub type VertexWeights = Vec<VertexBoneWeight>;

/// Which weight snapshot to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    /// State at the start of the in-progress stroke.
    PreStroke,
    /// Live state, including stamps of the in-progress stroke.
    Current,
}

/// The engine's authoritative weight storage plus the deformation
/// preview it keeps in sync.
pub struct VertexWeightStore {
    pre_stroke_weights: Vec<VertexWeights>,
    current_weights: Vec<VertexWeights>,
    /// Strongest falloff each vertex has received in the current stroke.
    /// Overlapping stamps take the max instead of accumulating.
    max_falloff_per_vertex_this_stroke: Vec<f32>,
    /// Per bone, whether any vertex currently holds weight on it.
    is_bone_weighted: Vec<bool>,
    deformer: Deformer,
    parent_indices: Vec<Option<BoneIndex>>,
    root_first_child: Option<BoneIndex>,
}

impl VertexWeightStore {
    /// Build storage from per-vertex (bone, weight) pairs, one entry per
    /// mesh vertex.
    ///
    /// Influences on out-of-range bones are discarded. A vertex left
    /// with no influences is bound fully to the root. Vertices carrying
    /// more than the maximum influence count keep their largest.
    pub fn new(
        skeleton: &Skeleton,
        mesh: &impl EditableMesh,
        weights: &[Vec<(BoneIndex, f32)>],
    ) -> Result<Self> {
        if weights.len() != mesh.vertex_count() {
            return Err(MarrowError::WeightCountMismatch {
                expected: mesh.vertex_count(),
                got: weights.len(),
            });
        }

        let deformer = Deformer::new(skeleton, mesh);

        let mut current_weights: Vec<VertexWeights> = Vec::with_capacity(weights.len());
        for (vertex, influences) in weights.iter().enumerate() {
            let mut vertex_weights: VertexWeights = influences
                .iter()
                .filter(|&&(bone, _)| bone < skeleton.bone_count())
                .map(|&(bone, weight)| VertexBoneWeight {
                    bone,
                    position_in_bone_space: deformer.position_in_bone_space(vertex, bone),
                    weight,
                })
                .collect();

            if vertex_weights.is_empty() {
                vertex_weights.push(VertexBoneWeight {
                    bone: ROOT_BONE_INDEX,
                    position_in_bone_space: deformer
                        .position_in_bone_space(vertex, ROOT_BONE_INDEX),
                    weight: 1.0,
                });
            } else if vertex_weights.len() > MAX_INFLUENCES_PER_VERTEX {
                vertex_weights
                    .sort_by(|a, b| b.weight.total_cmp(&a.weight));
                vertex_weights.truncate(MAX_INFLUENCES_PER_VERTEX);
                normalize_vertex(&mut vertex_weights);
            }

            current_weights.push(vertex_weights);
        }

        let parent_indices: Vec<Option<BoneIndex>> = (0..skeleton.bone_count())
            .map(|bone| skeleton.parent_index(bone))
            .collect();
        let root_first_child = skeleton.direct_children(ROOT_BONE_INDEX).first().copied();

        let mut store = Self {
            pre_stroke_weights: current_weights.clone(),
            max_falloff_per_vertex_this_stroke: vec![0.0; current_weights.len()],
            current_weights,
            is_bone_weighted: vec![false; skeleton.bone_count()],
            deformer,
            parent_indices,
            root_first_child,
        };
        store.update_is_bone_weighted();
        Ok(store)
    }

    pub fn vertex_count(&self) -> usize {
        self.current_weights.len()
    }

    pub fn deformer(&self) -> &Deformer {
        &self.deformer
    }

    pub fn deformer_mut(&mut self) -> &mut Deformer {
        &mut self.deformer
    }

    pub fn vertex_weights(&self, vertex: VertexIndex, snapshot: Snapshot) -> &VertexWeights {
        match snapshot {
            Snapshot::PreStroke => &self.pre_stroke_weights[vertex],
            Snapshot::Current => &self.current_weights[vertex],
        }
    }

    pub fn weight_of_bone_on_vertex(
        &self,
        bone: BoneIndex,
        vertex: VertexIndex,
        snapshot: Snapshot,
    ) -> f32 {
        self.vertex_weights(vertex, snapshot)
            .iter()
            .find(|influence| influence.bone == bone)
            .map_or(0.0, |influence| influence.weight)
    }

    pub fn is_bone_weighted(&self, bone: BoneIndex) -> bool {
        self.is_bone_weighted.get(bone).copied().unwrap_or(false)
    }

    /// The bone that picks up weight shed by `bone` when a vertex has no
    /// other influence to absorb it. Parents absorb from children; the
    /// root sheds downward to its first child. A lone root returns
    /// itself.
    pub fn parent_bone_to_weight_to(&self, bone: BoneIndex) -> BoneIndex {
        match self.parent_indices.get(bone).copied().flatten() {
            Some(parent) => parent,
            None => self.root_first_child.unwrap_or(bone),
        }
    }

    /// Set one bone's weight on one vertex in the chosen snapshot,
    /// maintaining the influence list.
    ///
    /// An existing influence is overwritten in place. A new near-zero
    /// influence is not created. When the vertex is already at the
    /// influence limit, the smallest influence is evicted and the whole
    /// vertex renormalized.
    pub fn set_weight_of_bone_on_vertex(
        &mut self,
        bone: BoneIndex,
        vertex: VertexIndex,
        weight: f32,
        snapshot: Snapshot,
    ) {
        let position_in_bone_space = self.deformer.position_in_bone_space(vertex, bone);
        let vertex_weights = match snapshot {
            Snapshot::PreStroke => &mut self.pre_stroke_weights[vertex],
            Snapshot::Current => &mut self.current_weights[vertex],
        };

        if let Some(influence) = vertex_weights
            .iter_mut()
            .find(|influence| influence.bone == bone)
        {
            influence.weight = weight;
            self.deformer.set_vertex_needs_updated(vertex);
            return;
        }

        if weight <= MINIMUM_WEIGHT_THRESHOLD {
            return;
        }

        let new_influence = VertexBoneWeight {
            bone,
            position_in_bone_space,
            weight,
        };

        if vertex_weights.len() < MAX_INFLUENCES_PER_VERTEX {
            vertex_weights.push(new_influence);
        } else {
            // at the limit: evict the smallest influence, then restore
            // the unit sum across the whole vertex
            let smallest = vertex_weights
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.weight.total_cmp(&b.weight))
                .map(|(index, _)| index)
                .unwrap_or(0);
            vertex_weights[smallest] = new_influence;
            normalize_vertex(vertex_weights);
        }
        self.deformer.set_vertex_needs_updated(vertex);
    }

    /// Remove a bone's influence from a vertex in the chosen snapshot.
    pub fn remove_influence_from_vertex(
        &mut self,
        bone: BoneIndex,
        vertex: VertexIndex,
        snapshot: Snapshot,
    ) {
        let vertex_weights = match snapshot {
            Snapshot::PreStroke => &mut self.pre_stroke_weights[vertex],
            Snapshot::Current => &mut self.current_weights[vertex],
        };
        vertex_weights.retain(|influence| influence.bone != bone);
        self.deformer.set_vertex_needs_updated(vertex);
    }

    /// Add a brand-new influence with the given weight. Callers must
    /// ensure the bone is not already recorded and the vertex is under
    /// the influence limit; violations are dropped.
    pub fn add_new_influence_to_vertex(
        &mut self,
        vertex: VertexIndex,
        bone: BoneIndex,
        weight: f32,
        snapshot: Snapshot,
    ) {
        let position_in_bone_space = self.deformer.position_in_bone_space(vertex, bone);
        let vertex_weights = match snapshot {
            Snapshot::PreStroke => &mut self.pre_stroke_weights[vertex],
            Snapshot::Current => &mut self.current_weights[vertex],
        };
        let already_recorded = vertex_weights
            .iter()
            .any(|influence| influence.bone == bone);
        debug_assert!(!already_recorded);
        debug_assert!(vertex_weights.len() < MAX_INFLUENCES_PER_VERTEX);
        if already_recorded || vertex_weights.len() >= MAX_INFLUENCES_PER_VERTEX {
            return;
        }
        vertex_weights.push(VertexBoneWeight {
            bone,
            position_in_bone_space,
            weight,
        });
        self.deformer.set_vertex_needs_updated(vertex);
    }

    /// Record the edits needed to set `bone`'s weight on `vertex` to
    /// `new_weight_value` while keeping the vertex normalized, computed
    /// against the pre-stroke snapshot.
    ///
    /// The remainder is redistributed proportionally among the vertex's
    /// other influences. When there is nothing to redistribute to, it is
    /// split among recorded zero-weight influences, or failing that,
    /// redirected to the parent. Nothing is applied here; edits land in
    /// `batch`.
    pub fn edit_vertex_weight_and_normalize(
        &self,
        bone_to_hold: BoneIndex,
        vertex: VertexIndex,
        new_weight_value: f32,
        batch: &mut WeightEditBatch,
    ) {
        let new_weight_value = new_weight_value.clamp(0.0, 1.0);
        let old_held_weight = self.weight_of_bone_on_vertex(bone_to_hold, vertex, Snapshot::PreStroke);

        let mut sum_of_other_weights = 0.0f32;
        let mut other_influences: Vec<(BoneIndex, f32)> = Vec::new();
        let mut zero_weight_influences: Vec<BoneIndex> = Vec::new();
        for influence in &self.pre_stroke_weights[vertex] {
            if influence.bone == bone_to_hold {
                continue;
            }
            if influence.weight > MINIMUM_WEIGHT_THRESHOLD {
                sum_of_other_weights += influence.weight;
                other_influences.push((influence.bone, influence.weight));
            } else {
                zero_weight_influences.push(influence.bone);
            }
        }

        // full weight: everything else goes to zero
        if nearly_equal(new_weight_value, 1.0) {
            batch.merge_single_edit(bone_to_hold, vertex, old_held_weight, 1.0);
            for &(other_bone, other_weight) in &other_influences {
                batch.merge_single_edit(other_bone, vertex, other_weight, 0.0);
            }
            return;
        }

        if sum_of_other_weights <= MINIMUM_WEIGHT_THRESHOLD {
            // no other influence can absorb the remainder
            if !zero_weight_influences.is_empty() {
                let split = (1.0 - new_weight_value) / zero_weight_influences.len() as f32;
                batch.merge_single_edit(bone_to_hold, vertex, old_held_weight, new_weight_value);
                for &zero_bone in &zero_weight_influences {
                    batch.merge_single_edit(zero_bone, vertex, 0.0, split);
                }
            } else {
                let redirect_bone = self.parent_bone_to_weight_to(bone_to_hold);
                if redirect_bone == bone_to_hold {
                    // single-bone skeleton: the edit is forced to 1 but
                    // still recorded so strokes stay transactional
                    batch.merge_single_edit(bone_to_hold, vertex, old_held_weight, 1.0);
                } else {
                    batch.merge_single_edit(
                        bone_to_hold,
                        vertex,
                        old_held_weight,
                        new_weight_value,
                    );
                    batch.merge_single_edit(redirect_bone, vertex, 0.0, 1.0 - new_weight_value);
                }
            }
            return;
        }

        // proportional redistribution of the remainder
        let available = 1.0 - new_weight_value;
        batch.merge_single_edit(bone_to_hold, vertex, old_held_weight, new_weight_value);
        for &(other_bone, other_weight) in &other_influences {
            let new_other_weight =
                if available > MINIMUM_WEIGHT_THRESHOLD && sum_of_other_weights > 1e-8 {
                    (other_weight / sum_of_other_weights) * available
                } else {
                    0.0
                };
            batch.merge_single_edit(other_bone, vertex, other_weight, new_other_weight);
        }
    }

    /// Push a batch's new weights into the current snapshot. Pre-stroke
    /// stays untouched until `swap_after_change`. Weighted flags of the
    /// touched bones are refreshed so mid-stroke queries and the
    /// deformer's pose short-circuit see the live state.
    pub fn apply_edits_to_current_weights(&mut self, batch: &WeightEditBatch) {
        for edits in batch.per_bone.values() {
            for (&vertex, &new_weight) in &edits.new_weights {
                self.set_weight_of_bone_on_vertex(edits.bone, vertex, new_weight, Snapshot::Current);
            }
        }
        for &bone in batch.per_bone.keys() {
            self.recompute_bone_weighted_flag(bone);
        }
    }

    fn recompute_bone_weighted_flag(&mut self, bone: BoneIndex) {
        let weighted = self.current_weights.iter().any(|vertex_weights| {
            vertex_weights
                .iter()
                .any(|influence| influence.bone == bone && influence.weight > MINIMUM_WEIGHT_THRESHOLD)
        });
        if let Some(flag) = self.is_bone_weighted.get_mut(bone) {
            *flag = weighted;
        }
    }

    /// End-of-stroke commit: the current snapshot becomes the new
    /// pre-stroke basis and the per-stroke falloff memory resets.
    pub fn swap_after_change(&mut self) {
        self.pre_stroke_weights = self.current_weights.clone();
        self.max_falloff_per_vertex_this_stroke.fill(0.0);
    }

    /// Record a stamp's falloff on a vertex and return the strongest
    /// falloff the vertex has seen this stroke. Using the max keeps
    /// overlapping stamps from compounding.
    pub fn set_current_falloff_and_get_max_falloff_this_stroke(
        &mut self,
        vertex: VertexIndex,
        falloff: f32,
    ) -> f32 {
        let max = self.max_falloff_per_vertex_this_stroke[vertex].max(falloff);
        self.max_falloff_per_vertex_this_stroke[vertex] = max;
        max
    }

    /// Recompute which bones hold any weight, from the current snapshot.
    pub fn update_is_bone_weighted(&mut self) {
        self.is_bone_weighted.fill(false);
        for vertex_weights in &self.current_weights {
            for influence in vertex_weights {
                if influence.weight > MINIMUM_WEIGHT_THRESHOLD {
                    if let Some(flag) = self.is_bone_weighted.get_mut(influence.bone) {
                        *flag = true;
                    }
                }
            }
        }
    }

    fn is_valid_entry(&self, vertex: VertexIndex, bone: BoneIndex) -> bool {
        vertex < self.current_weights.len() && bone < self.is_bone_weighted.len()
    }

    /// Write weights from outside the stroke path (undo, redo, host
    /// sync). Both snapshots are updated so the store lands in a clean
    /// between-strokes state. Entries with out-of-range indices are
    /// skipped; host data is not trusted.
    pub fn external_update_weights(&mut self, bone: BoneIndex, values: &HashMap<VertexIndex, f32>) {
        for (&vertex, &weight) in values {
            if !self.is_valid_entry(vertex, bone) {
                continue;
            }
            self.set_weight_of_bone_on_vertex(bone, vertex, weight, Snapshot::Current);
            self.set_weight_of_bone_on_vertex(bone, vertex, weight, Snapshot::PreStroke);
        }
        self.update_is_bone_weighted();
    }

    /// Re-add previously pruned influences (with zero weight) to both
    /// snapshots, ahead of an undo writing their old weights back.
    /// Out-of-range entries are skipped.
    pub fn external_add_influences(&mut self, influences: &[(VertexIndex, BoneIndex)]) {
        for &(vertex, bone) in influences {
            if !self.is_valid_entry(vertex, bone) {
                continue;
            }
            self.add_new_influence_to_vertex(vertex, bone, 0.0, Snapshot::Current);
            self.add_new_influence_to_vertex(vertex, bone, 0.0, Snapshot::PreStroke);
        }
    }

    /// Physically remove influences from both snapshots. Out-of-range
    /// entries are skipped.
    pub fn external_remove_influences(&mut self, influences: &[(VertexIndex, BoneIndex)]) {
        for &(vertex, bone) in influences {
            if !self.is_valid_entry(vertex, bone) {
                continue;
            }
            self.remove_influence_from_vertex(bone, vertex, Snapshot::Current);
            self.remove_influence_from_vertex(bone, vertex, Snapshot::PreStroke);
        }
    }

    /// Current weights as plain (bone, weight) pairs for the host.
    pub fn export_current_weights(&self) -> Vec<Vec<(BoneIndex, f32)>> {
        self.current_weights
            .iter()
            .map(|vertex_weights| {
                vertex_weights
                    .iter()
                    .map(|influence| (influence.bone, influence.weight))
                    .collect()
            })
            .collect()
    }

    /// Recompute the deformation preview for dirty vertices in `pose`.
    pub fn update_deformation(
        &mut self,
        pose: &[Affine3A],
        mesh: &mut impl EditableMesh,
        vertex_grid: Option<&Arc<Mutex<PointHashGrid>>>,
        scheduler: &dyn TaskScheduler,
    ) {
        self.deformer.update_vertex_deformation(
            pose,
            &self.current_weights,
            &self.is_bone_weighted,
            mesh,
            vertex_grid,
            scheduler,
        );
    }

    /// Deform to the reference pose, so geodesic measurements along the
    /// surface are taken in a pose-independent state.
    pub fn set_to_ref_pose(
        &mut self,
        mesh: &mut impl EditableMesh,
        vertex_grid: Option<&Arc<Mutex<PointHashGrid>>>,
        scheduler: &dyn TaskScheduler,
    ) {
        self.deformer.set_to_ref_pose(
            &self.current_weights,
            &self.is_bone_weighted,
            mesh,
            vertex_grid,
            scheduler,
        );
    }
}

/// Scale a vertex's influences so they sum to one. An all-zero vertex is
/// left untouched.
pub fn normalize_vertex(vertex_weights: &mut VertexWeights) {
    let total: f32 = vertex_weights.iter().map(|influence| influence.weight).sum();
    if total > MINIMUM_WEIGHT_THRESHOLD {
        for influence in vertex_weights.iter_mut() {
            influence.weight /= total;
        }
    }
}
