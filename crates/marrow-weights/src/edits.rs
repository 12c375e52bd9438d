//! Sparse weight-edit batches and the reversible command built from them
//!
//! A batch records old/new weight pairs per (bone, vertex). Merging keeps
//! the earliest `old` and the latest `new`, so any number of intermediate
//! brush stamps collapses into a single (before-stroke, after-stroke)
//! delta per vertex per bone, the unit of undo/redo.

use std::collections::{HashMap, HashSet};

use marrow_core::{BoneIndex, VertexIndex};

use crate::store::VertexWeightStore;

/// Sparse modifications to vertex weights on a single bone.
#[derive(Debug, Clone, Default)]
pub struct BoneWeightEdits {
    pub bone: BoneIndex,
    pub old_weights: HashMap<VertexIndex, f32>,
    pub new_weights: HashMap<VertexIndex, f32>,
}

/// Sparse modifications to vertex weights across a set of bones, with
/// merge support. Accumulated over one stroke or one-shot operation.
#[derive(Debug, Clone, Default)]
pub struct WeightEditBatch {
    /// Map of bone indices to the weight edits made on that bone.
    pub per_bone: HashMap<BoneIndex, BoneWeightEdits>,
    /// Influences to physically remove (not merely zero) when applied.
    pub pruned_influences: Vec<(VertexIndex, BoneIndex)>,
}

impl WeightEditBatch {
    /// Record one weight edit. `new` always wins; `old` is kept only if
    /// no earlier edit recorded one (first-old, last-new).
    pub fn merge_single_edit(
        &mut self,
        bone: BoneIndex,
        vertex: VertexIndex,
        old_weight: f32,
        new_weight: f32,
    ) {
        let edits = self.per_bone.entry(bone).or_default();
        edits.bone = bone;
        edits.new_weights.insert(vertex, new_weight);
        edits.old_weights.entry(vertex).or_insert(old_weight);
    }

    /// Merge a whole per-bone sub-batch with the same first-old/last-new
    /// semantics.
    pub fn merge_edits(&mut self, other: &BoneWeightEdits) {
        let edits = self.per_bone.entry(other.bone).or_default();
        edits.bone = other.bone;
        for (&vertex, &new_weight) in &other.new_weights {
            edits.new_weights.insert(vertex, new_weight);
            edits
                .old_weights
                .entry(vertex)
                .or_insert_with(|| other.old_weights[&vertex]);
        }
    }

    /// Merge every bone sub-batch and pruned influence of `other`.
    pub fn merge_batch(&mut self, other: &WeightEditBatch) {
        for edits in other.per_bone.values() {
            self.merge_edits(edits);
        }
        self.pruned_influences
            .extend(other.pruned_influences.iter().copied());
    }

    /// Net weight change recorded for (bone, vertex); 0 if none.
    pub fn vertex_delta_from_edits(&self, bone: BoneIndex, vertex: VertexIndex) -> f32 {
        let Some(edits) = self.per_bone.get(&bone) else {
            return 0.0;
        };
        match edits.new_weights.get(&vertex) {
            Some(new_weight) => new_weight - edits.old_weights[&vertex],
            None => 0.0,
        }
    }

    /// Union of all vertices with a recorded new weight, across bones.
    pub fn edited_vertex_indices(&self, out: &mut HashSet<VertexIndex>) {
        for edits in self.per_bone.values() {
            out.extend(edits.new_weights.keys().copied());
        }
    }

    /// Record an influence to physically remove when the batch is
    /// applied (and restore when reverted).
    pub fn add_prune_bone_edit(&mut self, vertex: VertexIndex, bone: BoneIndex) {
        self.pruned_influences.push((vertex, bone));
    }

    pub fn is_empty(&self) -> bool {
        self.per_bone.is_empty() && self.pruned_influences.is_empty()
    }
}

/// A reversible skin-weight edit, ready for a host undo stack.
///
/// Built from the batch accumulated over one stroke or operation.
/// `apply` and `revert` write through the store's external-update path,
/// which updates both weight snapshots so the store is left in a clean
/// between-strokes state.
#[derive(Debug, Clone, Default)]
pub struct WeightsChange {
    edits: WeightEditBatch,
}

impl WeightsChange {
    pub fn from_batch(edits: WeightEditBatch) -> Self {
        Self { edits }
    }

    pub fn add_bone_weight_edits(&mut self, edits: &BoneWeightEdits) {
        self.edits.merge_edits(edits);
    }

    pub fn add_prune_bone_edit(&mut self, vertex: VertexIndex, bone: BoneIndex) {
        self.edits.add_prune_bone_edit(vertex, bone);
    }

    pub fn edits(&self) -> &WeightEditBatch {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Vertices this change touches, for visual refresh scheduling.
    pub fn edited_vertex_indices(&self, out: &mut HashSet<VertexIndex>) {
        self.edits.edited_vertex_indices(out);
    }

    /// Redo: push the new weights into the store, then remove pruned
    /// influences.
    pub fn apply(&self, store: &mut VertexWeightStore) {
        for edits in self.edits.per_bone.values() {
            store.external_update_weights(edits.bone, &edits.new_weights);
        }
        store.external_remove_influences(&self.edits.pruned_influences);
    }

    /// Undo: restore pruned influences first so the old weights have a
    /// recorded slot to land in, then push the old weights.
    pub fn revert(&self, store: &mut VertexWeightStore) {
        store.external_add_influences(&self.edits.pruned_influences);
        for edits in self.edits.per_bone.values() {
            store.external_update_weights(edits.bone, &edits.old_weights);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_first_old_and_last_new() {
        let mut batch = WeightEditBatch::default();
        batch.merge_single_edit(3, 7, 0.2, 0.5);
        batch.merge_single_edit(3, 7, 0.5, 0.8);

        let edits = &batch.per_bone[&3];
        assert_eq!(edits.old_weights[&7], 0.2);
        assert_eq!(edits.new_weights[&7], 0.8);
        assert!((batch.vertex_delta_from_edits(3, 7) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn merge_edits_applies_same_semantics_per_sub_batch() {
        let mut first = WeightEditBatch::default();
        first.merge_single_edit(1, 0, 0.1, 0.4);

        let mut second = BoneWeightEdits {
            bone: 1,
            ..Default::default()
        };
        second.old_weights.insert(0, 0.4);
        second.new_weights.insert(0, 0.9);
        second.old_weights.insert(5, 0.0);
        second.new_weights.insert(5, 0.3);

        first.merge_edits(&second);

        let edits = &first.per_bone[&1];
        assert_eq!(edits.old_weights[&0], 0.1);
        assert_eq!(edits.new_weights[&0], 0.9);
        assert_eq!(edits.old_weights[&5], 0.0);
        assert_eq!(edits.new_weights[&5], 0.3);
    }

    #[test]
    fn delta_is_zero_for_unrecorded_edits() {
        let mut batch = WeightEditBatch::default();
        batch.merge_single_edit(1, 0, 0.0, 1.0);

        assert_eq!(batch.vertex_delta_from_edits(2, 0), 0.0);
        assert_eq!(batch.vertex_delta_from_edits(1, 9), 0.0);
    }

    #[test]
    fn edited_vertices_union_across_bones() {
        let mut batch = WeightEditBatch::default();
        batch.merge_single_edit(0, 1, 0.0, 0.5);
        batch.merge_single_edit(0, 2, 0.0, 0.5);
        batch.merge_single_edit(4, 2, 1.0, 0.5);
        batch.merge_single_edit(4, 3, 1.0, 0.5);

        let mut vertices = HashSet::new();
        batch.edited_vertex_indices(&mut vertices);
        let mut sorted: Vec<_> = vertices.into_iter().collect();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2, 3]);
    }
}
