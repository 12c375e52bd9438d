//! One-shot bulk weight operations: mirror, prune, average, normalize,
//! hammer and transfer.
//!
//! Each operation acts on the selection (or the whole mesh when nothing
//! is selected), commits immediately as a single transaction and returns
//! a reversible `WeightsChange`, or `None` when nothing changed.

use std::collections::{HashMap, HashSet};

use marrow_core::{
    nearly_equal, BoneIndex, MarrowError, MirrorAxis, MirrorDirection, Result, VertexIndex,
    MINIMUM_WEIGHT_THRESHOLD, ROOT_BONE_INDEX,
};
use marrow_mesh::{geodesic_distances, EditableMesh, SeedPoint};

use crate::edits::{WeightEditBatch, WeightsChange};
use crate::relax::truncate_and_normalize;
use crate::session::WeightEditSession;
use crate::store::{Snapshot, VertexBoneWeight};

impl<M: EditableMesh> WeightEditSession<M> {
    /// Copy weights from one side of a symmetry plane to the other.
    ///
    /// Bones are paired by naming convention, vertices by reflected
    /// reference-pose position. A selection restricts the operation to
    /// the selected vertices and their mirror counterparts; check
    /// `all_vertices_mirrored` afterwards for unmatched targets.
    pub fn mirror_weights(
        &mut self,
        axis: MirrorAxis,
        direction: MirrorDirection,
    ) -> Option<WeightsChange> {
        let ref_positions = self.store().deformer().ref_pose_vertex_positions.clone();
        {
            let (mirror, skeleton, _) = self.mirror_parts();
            mirror.ensure_generated(skeleton, &ref_positions, axis, direction);
        }

        let selection = self.selection().to_vec();
        let mut targets: HashMap<VertexIndex, VertexIndex> = HashMap::new();
        if selection.is_empty() {
            targets.extend(self.mirror_data().vertex_pairs());
        } else {
            // selected vertices on either side act through their pairing
            for &vertex in &selection {
                if let Some(source) = self.mirror_data().source_for_target(vertex) {
                    targets.insert(vertex, source);
                }
                for target in self.mirror_data().targets_for_source(vertex) {
                    targets.insert(target, vertex);
                }
            }
        }

        let mut batch = WeightEditBatch::default();
        for (&target, &source) in &targets {
            let mut mirrored: HashMap<BoneIndex, f32> = HashMap::new();
            for influence in self.store().vertex_weights(source, Snapshot::Current) {
                if influence.weight <= MINIMUM_WEIGHT_THRESHOLD {
                    continue;
                }
                *mirrored
                    .entry(self.mirror_data().mirrored_bone(influence.bone))
                    .or_insert(0.0) += influence.weight;
            }

            // zero the target first; mirrored values then win as the
            // latest edit per bone
            for influence in self.store().vertex_weights(target, Snapshot::Current) {
                batch.merge_single_edit(influence.bone, target, influence.weight, 0.0);
            }
            for (&bone, &weight) in &mirrored {
                let old = self
                    .store()
                    .weight_of_bone_on_vertex(bone, target, Snapshot::Current);
                batch.merge_single_edit(bone, target, old, weight);
            }
        }

        self.apply_weight_edits_as_transaction(batch)
    }

    /// Drop influences at or below `threshold`, plus any influence on an
    /// explicitly named bone, and renormalize what remains. A vertex
    /// stripped of every influence falls back to full root weight.
    pub fn prune_weights(
        &mut self,
        threshold: f32,
        bones_to_prune: &[BoneIndex],
    ) -> Option<WeightsChange> {
        let explicit: HashSet<BoneIndex> = bones_to_prune.iter().copied().collect();
        let mut batch = WeightEditBatch::default();

        for vertex in self.vertices_to_edit() {
            let influences = self.store().vertex_weights(vertex, Snapshot::Current).clone();
            let (pruned, remaining): (Vec<&VertexBoneWeight>, Vec<&VertexBoneWeight>) = influences
                .iter()
                .partition(|influence| {
                    influence.weight <= threshold || explicit.contains(&influence.bone)
                });
            if pruned.is_empty() {
                continue;
            }

            if remaining.is_empty() {
                // everything went: bind to the root instead of leaving
                // the vertex weightless
                let mut old_root = 0.0;
                for influence in &pruned {
                    if influence.bone == ROOT_BONE_INDEX {
                        old_root = influence.weight;
                        continue;
                    }
                    batch.merge_single_edit(influence.bone, vertex, influence.weight, 0.0);
                    batch.add_prune_bone_edit(vertex, influence.bone);
                }
                batch.merge_single_edit(ROOT_BONE_INDEX, vertex, old_root, 1.0);
                continue;
            }

            for influence in &pruned {
                batch.merge_single_edit(influence.bone, vertex, influence.weight, 0.0);
                batch.add_prune_bone_edit(vertex, influence.bone);
            }

            let total: f32 = remaining.iter().map(|influence| influence.weight).sum();
            for influence in &remaining {
                let new_weight = if total > MINIMUM_WEIGHT_THRESHOLD {
                    influence.weight / total
                } else {
                    1.0 / remaining.len() as f32
                };
                batch.merge_single_edit(influence.bone, vertex, influence.weight, new_weight);
            }
        }

        self.apply_weight_edits_as_transaction(batch)
    }

    /// Blend every edited vertex toward the mean weight profile of the
    /// edited set. `strength` 1 assigns the average outright.
    pub fn average_weights(&mut self, strength: f32) -> Option<WeightsChange> {
        let vertices = self.vertices_to_edit();
        if vertices.is_empty() {
            return None;
        }
        let strength = strength.clamp(0.0, 1.0);

        let mut average: HashMap<BoneIndex, f32> = HashMap::new();
        let per_vertex = 1.0 / vertices.len() as f32;
        for &vertex in &vertices {
            for influence in self.store().vertex_weights(vertex, Snapshot::Current) {
                *average.entry(influence.bone).or_insert(0.0) += influence.weight * per_vertex;
            }
        }
        truncate_and_normalize(&mut average);

        let mut batch = WeightEditBatch::default();
        for &vertex in &vertices {
            let mut bones: HashSet<BoneIndex> = average.keys().copied().collect();
            let current: HashMap<BoneIndex, f32> = self
                .store()
                .vertex_weights(vertex, Snapshot::Current)
                .iter()
                .map(|influence| (influence.bone, influence.weight))
                .collect();
            bones.extend(current.keys().copied());

            if nearly_equal(strength, 1.0) {
                for bone in bones {
                    let old = current.get(&bone).copied().unwrap_or(0.0);
                    let new = average.get(&bone).copied().unwrap_or(0.0);
                    batch.merge_single_edit(bone, vertex, old, new);
                }
                continue;
            }

            let mut blended: HashMap<BoneIndex, f32> = bones
                .iter()
                .map(|&bone| {
                    let old = current.get(&bone).copied().unwrap_or(0.0);
                    let avg = average.get(&bone).copied().unwrap_or(0.0);
                    (bone, old * (1.0 - strength) + avg * strength)
                })
                .collect();
            truncate_and_normalize(&mut blended);
            for (&bone, &new) in &blended {
                let old = current.get(&bone).copied().unwrap_or(0.0);
                batch.merge_single_edit(bone, vertex, old, new);
            }
            // influences truncated away still need an explicit zero
            for (&bone, &old) in &current {
                if !blended.contains_key(&bone) {
                    batch.merge_single_edit(bone, vertex, old, 0.0);
                }
            }
        }

        self.apply_weight_edits_as_transaction(batch)
    }

    /// Restore the unit-sum invariant on every edited vertex, holding
    /// each vertex's first influence at its current value. Already
    /// normalized vertices are untouched, so the operation is
    /// idempotent.
    pub fn normalize_weights(&mut self) -> Option<WeightsChange> {
        let mut batch = WeightEditBatch::default();
        for vertex in self.vertices_to_edit() {
            let influences = self.store().vertex_weights(vertex, Snapshot::Current);
            if influences.is_empty() {
                batch.merge_single_edit(ROOT_BONE_INDEX, vertex, 0.0, 1.0);
                continue;
            }
            let total: f32 = influences.iter().map(|influence| influence.weight).sum();
            if nearly_equal(total, 1.0) {
                continue;
            }
            let held = influences[0];
            self.store()
                .edit_vertex_weight_and_normalize(held.bone, vertex, held.weight, &mut batch);
        }
        self.apply_weight_edits_as_transaction(batch)
    }

    /// Replace the weights of the selected vertices with those of their
    /// geodesically nearest unselected neighbor. The classic fix for a
    /// badly skinned patch: hammer it flat with its surroundings.
    ///
    /// Requires a selection; there is no meaningful whole-mesh variant.
    pub fn hammer_weights(&mut self) -> Option<WeightsChange> {
        let selection: HashSet<VertexIndex> = self.selection().iter().copied().collect();
        if selection.is_empty() {
            return None;
        }

        // measure along the surface in the reference pose
        self.settle_to_ref_pose();

        let mut seed_set: HashSet<VertexIndex> = HashSet::new();
        for &vertex in &selection {
            for &neighbor in self.mesh().vertex_neighbors(vertex) {
                if !selection.contains(&neighbor) {
                    seed_set.insert(neighbor);
                }
            }
        }
        if seed_set.is_empty() {
            return None;
        }
        let seeds: Vec<SeedPoint> = seed_set
            .into_iter()
            .map(|vertex| SeedPoint {
                vertex,
                initial_distance: 0.0,
            })
            .collect();
        let distances = geodesic_distances(self.mesh(), &seeds, f32::MAX);

        let mut batch = WeightEditBatch::default();
        for &vertex in &selection {
            let Some(source) = distances.nearest_seed(vertex) else {
                continue;
            };
            for influence in self.store().vertex_weights(vertex, Snapshot::Current) {
                batch.merge_single_edit(influence.bone, vertex, influence.weight, 0.0);
            }
            for influence in self.store().vertex_weights(source, Snapshot::Current) {
                let old = self
                    .store()
                    .weight_of_bone_on_vertex(influence.bone, vertex, Snapshot::Current);
                batch.merge_single_edit(influence.bone, vertex, old, influence.weight);
            }
        }

        let change = self.apply_weight_edits_as_transaction(batch);
        if change.is_some() {
            self.store_mut().deformer_mut().set_all_vertices_to_be_updated();
        }
        change
    }

    /// Adopt externally computed weights (e.g. from a transfer tool or
    /// an import), as one reversible transaction. `subset` limits the
    /// adoption to specific vertices; the full mesh otherwise.
    pub fn transfer_weights(
        &mut self,
        transferred: &[Vec<(BoneIndex, f32)>],
        subset: Option<&[VertexIndex]>,
    ) -> Result<Option<WeightsChange>> {
        if transferred.len() != self.store().vertex_count() {
            return Err(MarrowError::WeightCountMismatch {
                expected: self.store().vertex_count(),
                got: transferred.len(),
            });
        }
        let bone_count = self.skeleton().bone_count();
        for influences in transferred {
            if let Some(&(bone, _)) = influences.iter().find(|&&(bone, _)| bone >= bone_count) {
                return Err(MarrowError::TransferError(format!(
                    "weight refers to bone {bone}, but the skeleton has {bone_count} bones"
                )));
            }
        }

        let vertices: Vec<VertexIndex> = match subset {
            Some(subset) => subset
                .iter()
                .copied()
                .filter(|&vertex| vertex < transferred.len())
                .collect(),
            None => (0..transferred.len()).collect(),
        };

        let mut batch = WeightEditBatch::default();
        for vertex in vertices {
            for influence in self.store().vertex_weights(vertex, Snapshot::Current) {
                batch.merge_single_edit(influence.bone, vertex, influence.weight, 0.0);
            }
            if transferred[vertex].is_empty() {
                let old = self
                    .store()
                    .weight_of_bone_on_vertex(ROOT_BONE_INDEX, vertex, Snapshot::Current);
                batch.merge_single_edit(ROOT_BONE_INDEX, vertex, old, 1.0);
                continue;
            }
            for &(bone, weight) in &transferred[vertex] {
                let old = self
                    .store()
                    .weight_of_bone_on_vertex(bone, vertex, Snapshot::Current);
                batch.merge_single_edit(bone, vertex, old, weight);
            }
        }

        Ok(self.apply_weight_edits_as_transaction(batch))
    }
}
