//! The interactive weight-editing session: brush strokes, direct edits
//! and the transaction plumbing shared with the bulk operations.
//!
//! A stroke is transactional. `begin_stroke` opens an accumulating
//! change, every stamp merges into it (computed against the pre-stroke
//! snapshot so overlapping stamps never compound), and `end_stroke`
//! commits the snapshots and hands back one reversible `WeightsChange`
//! for the host undo stack.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use glam::{Affine3A, Vec3};

use marrow_core::{
    BoneIndex, FalloffMode, MarrowError, Result, VertexIndex, WeightEditOperation,
};
use marrow_core::{BrushSettings, ROOT_BONE_INDEX};
use marrow_mesh::{geodesic_distances, EditableMesh, PointHashGrid, SeedPoint};
use marrow_skeleton::Skeleton;

use crate::edits::{WeightEditBatch, WeightsChange};
use crate::mirror::MirrorData;
use crate::relax::smooth_weights_at_vertex;
use crate::scheduler::{TaskScheduler, ThreadScheduler};
use crate::store::{Snapshot, VertexWeightStore};

/// Smoothing passes per relax stamp.
const RELAX_ITERATIONS: usize = 3;
/// Per-pass damping keeping a full-strength relax stamp from fully
/// converging in one stamp.
const RELAX_PER_PASS: f32 = 0.95;
/// Surface searches run slightly past the radius so boundary vertices
/// settle to their true geodesic distance.
const SURFACE_SEARCH_SLACK: f32 = 1.5;

/// One application of the brush.
#[derive(Debug, Clone, Copy)]
pub struct BrushStamp {
    /// Stamp center on the surface, in mesh space.
    pub position: Vec3,
    /// Triangle under the stamp center; seeds the surface falloff search.
    pub triangle: usize,
    /// Radius override; the active brush config's radius when `None`.
    pub radius: Option<f32>,
}

pub struct WeightEditSession<M: EditableMesh> {
    mesh: M,
    skeleton: Skeleton,
    store: VertexWeightStore,
    mirror_data: MirrorData,
    pub settings: BrushSettings,
    scheduler: Box<dyn TaskScheduler>,
    /// Spatial index over deformed vertex positions, kept fresh by the
    /// deformer's background reindex task.
    vertex_grid: Arc<Mutex<PointHashGrid>>,
    active_change: Option<WeightsChange>,
    stroke_invert: bool,
    current_bone: Option<BoneIndex>,
    selected_vertices: Vec<VertexIndex>,
    vertices_needing_visual_update: HashSet<VertexIndex>,
}

impl<M: EditableMesh> WeightEditSession<M> {
    pub fn new(mesh: M, skeleton: Skeleton, weights: &[Vec<(BoneIndex, f32)>]) -> Result<Self> {
        Self::with_scheduler(mesh, skeleton, weights, Box::new(ThreadScheduler))
    }

    pub fn with_scheduler(
        mesh: M,
        skeleton: Skeleton,
        weights: &[Vec<(BoneIndex, f32)>],
        scheduler: Box<dyn TaskScheduler>,
    ) -> Result<Self> {
        let store = VertexWeightStore::new(&skeleton, &mesh, weights)?;

        let positions: Vec<Vec3> = (0..mesh.vertex_count())
            .map(|v| mesh.vertex_position(v))
            .collect();
        let cell_size = average_edge_length(&mesh).max(1e-3);
        let vertex_grid = Arc::new(Mutex::new(PointHashGrid::build(&positions, cell_size)));

        Ok(Self {
            mesh,
            skeleton,
            store,
            mirror_data: MirrorData::default(),
            settings: BrushSettings::default(),
            scheduler,
            vertex_grid,
            active_change: None,
            stroke_invert: false,
            current_bone: None,
            selected_vertices: Vec::new(),
            vertices_needing_visual_update: HashSet::new(),
        })
    }

    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    pub fn skeleton(&self) -> &Skeleton {
        &self.skeleton
    }

    pub fn store(&self) -> &VertexWeightStore {
        &self.store
    }

    pub fn current_bone(&self) -> Option<BoneIndex> {
        self.current_bone
    }

    pub fn set_current_bone(&mut self, name: &str) -> Result<BoneIndex> {
        let bone = self
            .skeleton
            .bone_index(name)
            .ok_or_else(|| MarrowError::BoneNotFound(name.to_string()))?;
        self.current_bone = Some(bone);
        Ok(bone)
    }

    pub fn set_current_bone_index(&mut self, bone: BoneIndex) -> Result<()> {
        if bone >= self.skeleton.bone_count() {
            return Err(MarrowError::BoneNotFound(format!("bone index {bone}")));
        }
        self.current_bone = Some(bone);
        Ok(())
    }

    pub fn selection(&self) -> &[VertexIndex] {
        &self.selected_vertices
    }

    pub fn set_selection(&mut self, vertices: Vec<VertexIndex>) {
        let vertex_count = self.mesh.vertex_count();
        self.selected_vertices = vertices;
        self.selected_vertices.retain(|&v| v < vertex_count);
    }

    pub fn clear_selection(&mut self) {
        self.selected_vertices.clear();
    }

    /// The vertex set bulk operations act on: the selection, or the
    /// whole mesh when nothing is selected.
    pub(crate) fn vertices_to_edit(&self) -> Vec<VertexIndex> {
        if self.selected_vertices.is_empty() {
            (0..self.mesh.vertex_count()).collect()
        } else {
            self.selected_vertices.clone()
        }
    }

    /// Advance the deformation preview to `pose` (component-space bone
    /// transforms). Call once per frame or whenever pose/weights change.
    pub fn tick(&mut self, pose: &[Affine3A]) {
        self.store.update_deformation(
            pose,
            &mut self.mesh,
            Some(&self.vertex_grid),
            self.scheduler.as_ref(),
        );
    }

    /// Vertices touched since the last call, for host visual refresh.
    pub fn take_vertices_needing_visual_update(&mut self) -> Vec<VertexIndex> {
        self.vertices_needing_visual_update.drain().collect()
    }

    pub fn export_weights(&self) -> Vec<Vec<(BoneIndex, f32)>> {
        self.store.export_current_weights()
    }

    pub fn get_influences(&self, vertex: VertexIndex) -> Vec<(BoneIndex, f32)> {
        self.store
            .vertex_weights(vertex, Snapshot::Current)
            .iter()
            .map(|influence| (influence.bone, influence.weight))
            .collect()
    }

    /// Mean current weight of `bone` over `vertices`; 0 for an empty set.
    pub fn average_weight_on_bone(&self, bone: BoneIndex, vertices: &[VertexIndex]) -> f32 {
        if vertices.is_empty() {
            return 0.0;
        }
        let total: f32 = vertices
            .iter()
            .map(|&v| self.store.weight_of_bone_on_vertex(bone, v, Snapshot::Current))
            .sum();
        total / vertices.len() as f32
    }

    pub fn vertices_affected_by_bone(&self, bone: BoneIndex) -> Vec<VertexIndex> {
        (0..self.store.vertex_count())
            .filter(|&v| {
                self.store.weight_of_bone_on_vertex(bone, v, Snapshot::Current)
                    > marrow_core::MINIMUM_WEIGHT_THRESHOLD
            })
            .collect()
    }

    // ---- stroke lifecycle ----

    pub fn begin_stroke(&mut self, invert: bool) {
        self.active_change = Some(WeightsChange::default());
        self.stroke_invert = invert;
    }

    pub fn stroke_in_progress(&self) -> bool {
        self.active_change.is_some()
    }

    /// Apply one brush stamp of the active operation at `stamp`.
    pub fn apply_stamp(&mut self, stamp: &BrushStamp) -> Result<()> {
        if self.active_change.is_none() {
            self.begin_stroke(false);
        }
        let operation = self.settings.operation;
        if operation != WeightEditOperation::Relax && self.current_bone.is_none() {
            return Err(MarrowError::BoneNotFound(
                "no bone selected for painting".to_string(),
            ));
        }

        let config = *self.settings.config();
        let radius = stamp.radius.unwrap_or(config.radius);
        if radius <= 0.0 {
            return Err(MarrowError::MeshError("brush radius must be positive".to_string()));
        }

        let roi = self.calculate_vertex_roi(stamp, radius, config.falloff, config.falloff_mode)?;
        if roi.is_empty() {
            return Ok(());
        }

        let strength =
            calculate_brush_strength_to_use(operation, config.strength, self.stroke_invert);

        if operation == WeightEditOperation::Relax {
            self.apply_relax_stamp(&roi, strength);
            return Ok(());
        }

        let bone = self.current_bone.unwrap_or(ROOT_BONE_INDEX);
        let mut batch = WeightEditBatch::default();
        for &(vertex, falloff) in &roi {
            // overlapping stamps within one stroke keep the peak falloff
            let use_falloff = self
                .store
                .set_current_falloff_and_get_max_falloff_this_stroke(vertex, falloff);
            let before = self
                .store
                .weight_of_bone_on_vertex(bone, vertex, Snapshot::PreStroke);
            let desired = stamp_new_value(operation, before, strength, use_falloff);
            self.store
                .edit_vertex_weight_and_normalize(bone, vertex, desired, &mut batch);
        }
        self.apply_weight_edits_mid_change(&batch);
        Ok(())
    }

    fn apply_relax_stamp(&mut self, roi: &[(VertexIndex, f32)], strength: f32) {
        for _ in 0..RELAX_ITERATIONS {
            let mut batch = WeightEditBatch::default();
            for &(vertex, falloff) in roi {
                let t = (falloff * strength * RELAX_PER_PASS).clamp(0.0, 1.0);
                let Some(smoothed) = smooth_weights_at_vertex(&self.store, &self.mesh, vertex, t)
                else {
                    continue;
                };
                // union of old and new influences, so dropped ones zero out
                let mut bones: HashSet<BoneIndex> = smoothed.keys().copied().collect();
                for influence in self.store.vertex_weights(vertex, Snapshot::Current) {
                    bones.insert(influence.bone);
                }
                for bone in bones {
                    let old = self
                        .store
                        .weight_of_bone_on_vertex(bone, vertex, Snapshot::PreStroke);
                    let new = smoothed.get(&bone).copied().unwrap_or(0.0);
                    batch.merge_single_edit(bone, vertex, old, new);
                }
            }
            // applied per pass so the next pass smooths the smoothed state
            self.apply_weight_edits_mid_change(&batch);
        }
    }

    /// Commit the stroke: snapshots swap and the accumulated change is
    /// returned for the host undo stack. `None` when nothing changed.
    pub fn end_stroke(&mut self) -> Option<WeightsChange> {
        let change = self.active_change.take()?;
        if change.is_empty() {
            return None;
        }
        self.store.swap_after_change();
        self.store.update_is_bone_weighted();
        Some(change)
    }

    /// Abandon the stroke, restoring every touched weight to its
    /// pre-stroke value.
    pub fn cancel_stroke(&mut self) {
        let Some(change) = self.active_change.take() else {
            return;
        };
        for edits in change.edits().per_bone.values() {
            for (&vertex, &old_weight) in &edits.old_weights {
                self.store
                    .set_weight_of_bone_on_vertex(edits.bone, vertex, old_weight, Snapshot::Current);
                self.vertices_needing_visual_update.insert(vertex);
            }
        }
        // current equals pre-stroke again; swapping just resets the
        // per-stroke falloff memory
        self.store.swap_after_change();
        self.store.update_is_bone_weighted();
    }

    /// Set, add to, scale or relax weights on explicit vertices with no
    /// brush involved. One immediate transaction.
    pub fn edit_weights_on_vertices(
        &mut self,
        bone: BoneIndex,
        value: f32,
        operation: WeightEditOperation,
        vertices: &[VertexIndex],
    ) -> Result<Option<WeightsChange>> {
        if bone >= self.skeleton.bone_count() {
            return Err(MarrowError::BoneNotFound(format!("bone index {bone}")));
        }

        let mut batch = WeightEditBatch::default();
        for &vertex in vertices {
            if vertex >= self.store.vertex_count() {
                continue;
            }
            if operation == WeightEditOperation::Relax {
                let t = value.clamp(0.0, 1.0);
                let Some(smoothed) = smooth_weights_at_vertex(&self.store, &self.mesh, vertex, t)
                else {
                    continue;
                };
                let mut bones: HashSet<BoneIndex> = smoothed.keys().copied().collect();
                for influence in self.store.vertex_weights(vertex, Snapshot::Current) {
                    bones.insert(influence.bone);
                }
                for b in bones {
                    let old = self.store.weight_of_bone_on_vertex(b, vertex, Snapshot::Current);
                    batch.merge_single_edit(b, vertex, old, smoothed.get(&b).copied().unwrap_or(0.0));
                }
                continue;
            }

            let before = self
                .store
                .weight_of_bone_on_vertex(bone, vertex, Snapshot::Current);
            let desired = match operation {
                WeightEditOperation::Add => before + value,
                WeightEditOperation::Replace => value,
                WeightEditOperation::Multiply => before * value,
                WeightEditOperation::RelativeScale => {
                    let target = if value >= 0.0 { 1.0 } else { 0.0 };
                    before + (target - before) * value.abs()
                }
                WeightEditOperation::Relax => unreachable!(),
            };
            self.store
                .edit_vertex_weight_and_normalize(bone, vertex, desired, &mut batch);
        }
        Ok(self.apply_weight_edits_as_transaction(batch))
    }

    /// Redo path for a change handed out earlier.
    pub fn apply_external_change(&mut self, change: &WeightsChange) {
        change.apply(&mut self.store);
        change.edited_vertex_indices(&mut self.vertices_needing_visual_update);
    }

    /// Undo path for a change handed out earlier.
    pub fn revert_external_change(&mut self, change: &WeightsChange) {
        change.revert(&mut self.store);
        change.edited_vertex_indices(&mut self.vertices_needing_visual_update);
    }

    // ---- internals shared with the bulk operations ----

    pub(crate) fn store_mut(&mut self) -> &mut VertexWeightStore {
        &mut self.store
    }

    pub(crate) fn mirror_data(&self) -> &MirrorData {
        &self.mirror_data
    }

    pub(crate) fn mirror_parts(&mut self) -> (&mut MirrorData, &Skeleton, &VertexWeightStore) {
        (&mut self.mirror_data, &self.skeleton, &self.store)
    }

    /// Whether the most recent mirror pass found a source for every
    /// target vertex. Hosts surface this as an asymmetry warning.
    pub fn all_vertices_mirrored(&self) -> bool {
        self.mirror_data.all_vertices_mirrored()
    }

    /// Deform to the reference pose before measuring along the surface.
    pub(crate) fn settle_to_ref_pose(&mut self) {
        self.store
            .set_to_ref_pose(&mut self.mesh, Some(&self.vertex_grid), self.scheduler.as_ref());
        self.store.deformer_mut().wait_for_pending_reindex();
    }

    /// Apply accumulated edits to the live snapshot and merge them into
    /// the open stroke change.
    fn apply_weight_edits_mid_change(&mut self, batch: &WeightEditBatch) {
        if batch.is_empty() {
            return;
        }
        self.store.apply_edits_to_current_weights(batch);
        batch.edited_vertex_indices(&mut self.vertices_needing_visual_update);
        if let Some(change) = &mut self.active_change {
            for edits in batch.per_bone.values() {
                change.add_bone_weight_edits(edits);
            }
            for &(vertex, bone) in &batch.pruned_influences {
                change.add_prune_bone_edit(vertex, bone);
            }
        }
    }

    /// One-shot commit used by the bulk operations: apply, physically
    /// remove pruned influences, swap snapshots and hand back the change.
    pub(crate) fn apply_weight_edits_as_transaction(
        &mut self,
        batch: WeightEditBatch,
    ) -> Option<WeightsChange> {
        if batch.is_empty() {
            return None;
        }
        self.store.apply_edits_to_current_weights(&batch);
        for &(vertex, bone) in &batch.pruned_influences {
            self.store
                .remove_influence_from_vertex(bone, vertex, Snapshot::Current);
        }
        batch.edited_vertex_indices(&mut self.vertices_needing_visual_update);
        self.store.swap_after_change();
        self.store.update_is_bone_weighted();
        Some(WeightsChange::from_batch(batch))
    }

    /// Vertices under the stamp with their falloff weights.
    fn calculate_vertex_roi(
        &self,
        stamp: &BrushStamp,
        radius: f32,
        falloff_amount: f32,
        mode: FalloffMode,
    ) -> Result<Vec<(VertexIndex, f32)>> {
        let mut roi = Vec::new();
        match mode {
            FalloffMode::Volume => {
                let mut found = Vec::new();
                // a panicked reindex task must not turn stamps into
                // silent no-ops; the grid data itself is still usable
                let grid = self
                    .vertex_grid
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                grid.find_points_in_ball(stamp.position, radius, &mut found);
                drop(grid);
                for vertex in found {
                    let distance = self.mesh.vertex_position(vertex).distance(stamp.position);
                    roi.push((
                        vertex,
                        calculate_brush_falloff(distance, radius, falloff_amount),
                    ));
                }
            }
            FalloffMode::Surface => {
                if stamp.triangle >= self.mesh.triangle_count() {
                    return Err(MarrowError::MeshError(format!(
                        "stamp triangle {} out of range",
                        stamp.triangle
                    )));
                }
                let seeds: Vec<SeedPoint> = self
                    .mesh
                    .triangle_vertices(stamp.triangle)
                    .into_iter()
                    .map(|vertex| SeedPoint {
                        vertex,
                        initial_distance: self
                            .mesh
                            .vertex_position(vertex)
                            .distance(stamp.position),
                    })
                    .collect();
                let distances =
                    geodesic_distances(&self.mesh, &seeds, radius * SURFACE_SEARCH_SLACK);
                for vertex in 0..self.mesh.vertex_count() {
                    let Some(distance) = distances.distance(vertex) else {
                        continue;
                    };
                    if distance <= radius {
                        roi.push((
                            vertex,
                            calculate_brush_falloff(distance, radius, falloff_amount),
                        ));
                    }
                }
            }
        }
        Ok(roi)
    }
}

/// Falloff weight for a vertex at `distance` from the stamp center.
///
/// `falloff_amount` in [0, 1] is the portion of the radius over which
/// the weight ramps down; inside the flat core the weight is 1, outside
/// it follows a smooth cubic.
pub fn calculate_brush_falloff(distance: f32, radius: f32, falloff_amount: f32) -> f32 {
    let flat_portion = (1.0 - falloff_amount).clamp(0.0, 1.0);
    let d = (distance / radius).clamp(0.0, 1.0);
    if d <= flat_portion {
        return 1.0;
    }
    let ramp = ((d - flat_portion) / (1.0 - flat_portion)).clamp(0.0, 1.0);
    let w = 1.0 - ramp * ramp;
    w * w * w
}

/// Effective strength for a stamp, folding stroke inversion into the
/// value each operation understands.
pub fn calculate_brush_strength_to_use(
    operation: WeightEditOperation,
    strength: f32,
    invert: bool,
) -> f32 {
    if !invert {
        return strength;
    }
    match operation {
        WeightEditOperation::Add | WeightEditOperation::RelativeScale => -strength,
        WeightEditOperation::Replace | WeightEditOperation::Relax => 1.0 - strength,
        WeightEditOperation::Multiply => 1.0 + strength,
    }
}

/// Target weight a stamp asks for, before normalization.
fn stamp_new_value(
    operation: WeightEditOperation,
    before: f32,
    strength: f32,
    falloff: f32,
) -> f32 {
    match operation {
        WeightEditOperation::Add => before + strength * falloff,
        WeightEditOperation::Replace => before + (strength - before) * falloff,
        WeightEditOperation::Multiply => before + (before * strength - before) * falloff,
        WeightEditOperation::RelativeScale => {
            let target = if strength >= 0.0 { 1.0 } else { 0.0 };
            before + (target - before) * (strength.abs() * falloff)
        }
        // relax stamps never reach here
        WeightEditOperation::Relax => before,
    }
}

fn average_edge_length<M: EditableMesh>(mesh: &M) -> f32 {
    let mut total = 0.0f32;
    let mut count = 0usize;
    for triangle in 0..mesh.triangle_count() {
        let [a, b, c] = mesh.triangle_vertices(triangle);
        let (pa, pb, pc) = (
            mesh.vertex_position(a),
            mesh.vertex_position(b),
            mesh.vertex_position(c),
        );
        total += pa.distance(pb) + pb.distance(pc) + pc.distance(pa);
        count += 3;
    }
    if count == 0 {
        1.0
    } else {
        total / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use marrow_core::{nearly_equal, MINIMUM_WEIGHT_THRESHOLD};
    use marrow_mesh::TriangleMesh;
    use marrow_skeleton::Bone;

    /// A strip of unit quads along X bound half to root, half to child.
    fn strip_session(quads: usize) -> WeightEditSession<TriangleMesh> {
        let skeleton = Skeleton::new(vec![
            Bone::new("root", None, Affine3A::IDENTITY),
            Bone::new(
                "child",
                Some(0),
                Affine3A::from_translation(Vec3::new(quads as f32, 0.0, 0.0)),
            ),
        ])
        .unwrap();

        let mut positions = Vec::new();
        for i in 0..=quads {
            positions.push(Vec3::new(i as f32, 0.0, 0.0));
            positions.push(Vec3::new(i as f32, 1.0, 0.0));
        }
        let mut triangles = Vec::new();
        for i in 0..quads {
            let a = i * 2;
            triangles.push([a, a + 2, a + 3]);
            triangles.push([a, a + 3, a + 1]);
        }
        let mesh = TriangleMesh::new(positions, triangles);

        let weights: Vec<Vec<(BoneIndex, f32)>> =
            (0..mesh.vertex_count()).map(|_| vec![(0, 1.0)]).collect();
        WeightEditSession::with_scheduler(
            mesh,
            skeleton,
            &weights,
            Box::new(crate::scheduler::InlineScheduler),
        )
        .unwrap()
    }

    fn weights_sum(session: &WeightEditSession<TriangleMesh>, vertex: VertexIndex) -> f32 {
        session.get_influences(vertex).iter().map(|&(_, w)| w).sum()
    }

    #[test]
    fn falloff_curve_is_flat_then_smooth() {
        // hard brush: full weight across the whole radius
        assert_eq!(calculate_brush_falloff(0.9, 1.0, 0.0), 1.0);
        // full falloff: 1 at the center, 0 at the rim
        assert_eq!(calculate_brush_falloff(0.0, 1.0, 1.0), 1.0);
        assert!(calculate_brush_falloff(1.0, 1.0, 1.0).abs() < 1e-6);
        let mid = calculate_brush_falloff(0.5, 1.0, 1.0);
        assert!(mid > 0.0 && mid < 1.0);
        // monotone decreasing along the ramp
        assert!(calculate_brush_falloff(0.3, 1.0, 1.0) > calculate_brush_falloff(0.6, 1.0, 1.0));
    }

    #[test]
    fn inverted_strength_per_operation() {
        use WeightEditOperation::*;
        assert_eq!(calculate_brush_strength_to_use(Add, 0.4, false), 0.4);
        assert_eq!(calculate_brush_strength_to_use(Add, 0.4, true), -0.4);
        assert_eq!(calculate_brush_strength_to_use(Replace, 0.4, true), 0.6);
        assert!(nearly_equal(
            calculate_brush_strength_to_use(Multiply, 0.4, true),
            1.4
        ));
        assert_eq!(calculate_brush_strength_to_use(Relax, 0.4, true), 0.6);
    }

    #[test]
    fn add_stamp_shifts_weight_and_keeps_vertices_normalized() {
        let mut session = strip_session(4);
        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Add;
        session.settings.config_mut().strength = 0.5;
        session.settings.config_mut().radius = 1.5;
        session.settings.config_mut().falloff = 1.0;

        session.begin_stroke(false);
        session
            .apply_stamp(&BrushStamp {
                position: Vec3::new(4.0, 0.5, 0.0),
                triangle: 6,
                radius: None,
            })
            .unwrap();
        let change = session.end_stroke().unwrap();
        assert!(!change.is_empty());

        // the vertex at the stamp center gained child weight
        let child_weight: f32 = session
            .get_influences(8)
            .iter()
            .filter(|&&(bone, _)| bone == 1)
            .map(|&(_, w)| w)
            .sum();
        assert!(child_weight > 0.3);
        for vertex in 0..session.mesh().vertex_count() {
            assert!(nearly_equal(weights_sum(&session, vertex), 1.0));
        }
    }

    #[test]
    fn overlapping_replace_stamps_do_not_compound() {
        let mut session = strip_session(4);
        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Replace;
        session.settings.replace.strength = 0.6;
        session.settings.replace.radius = 1.5;
        session.settings.replace.falloff = 1.0;

        let stamp = BrushStamp {
            position: Vec3::new(4.0, 0.5, 0.0),
            triangle: 6,
            radius: None,
        };
        session.begin_stroke(false);
        session.apply_stamp(&stamp).unwrap();
        let after_one = session.get_influences(8);
        session.apply_stamp(&stamp).unwrap();
        session.apply_stamp(&stamp).unwrap();
        let after_three = session.get_influences(8);
        session.end_stroke().unwrap();

        // identical stamps within one stroke are stable
        for (&(bone_a, weight_a), &(bone_b, weight_b)) in after_one.iter().zip(&after_three) {
            assert_eq!(bone_a, bone_b);
            assert!(nearly_equal(weight_a, weight_b));
        }
    }

    #[test]
    fn whole_stroke_is_one_reversible_change() {
        let mut session = strip_session(4);
        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Replace;
        session.settings.replace.strength = 1.0;
        session.settings.replace.radius = 1.2;
        session.settings.replace.falloff = 0.0;

        let before = session.export_weights();
        session.begin_stroke(false);
        for x in [1.0f32, 2.0, 3.0] {
            session
                .apply_stamp(&BrushStamp {
                    position: Vec3::new(x, 0.5, 0.0),
                    triangle: (x as usize - 1) * 2,
                    radius: None,
                })
                .unwrap();
        }
        let change = session.end_stroke().unwrap();

        session.revert_external_change(&change);
        let reverted = session.export_weights();
        for (vertex, influences) in before.iter().enumerate() {
            for &(bone, weight) in influences {
                let restored: f32 = reverted[vertex]
                    .iter()
                    .filter(|&&(b, _)| b == bone)
                    .map(|&(_, w)| w)
                    .sum();
                assert!(nearly_equal(restored, weight));
            }
        }

        session.apply_external_change(&change);
        let replayed = session.export_weights();
        for vertex in 0..replayed.len() {
            let sum: f32 = replayed[vertex].iter().map(|&(_, w)| w).sum();
            assert!(nearly_equal(sum, 1.0));
        }
    }

    #[test]
    fn cancel_stroke_restores_pre_stroke_weights() {
        let mut session = strip_session(3);
        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Replace;
        session.settings.replace.strength = 1.0;
        session.settings.replace.radius = 2.0;
        session.settings.replace.falloff = 0.0;

        session.begin_stroke(false);
        session
            .apply_stamp(&BrushStamp {
                position: Vec3::new(1.0, 0.5, 0.0),
                triangle: 0,
                radius: None,
            })
            .unwrap();
        assert!(session
            .get_influences(2)
            .iter()
            .any(|&(bone, weight)| bone == 1 && weight > 0.9));

        session.cancel_stroke();
        assert!(!session.stroke_in_progress());
        for vertex in 0..session.mesh().vertex_count() {
            let root_weight: f32 = session
                .get_influences(vertex)
                .iter()
                .filter(|&&(bone, _)| bone == 0)
                .map(|&(_, w)| w)
                .sum();
            assert!(nearly_equal(root_weight, 1.0));
        }
    }

    #[test]
    fn surface_falloff_does_not_cross_disconnected_patches() {
        // two disjoint triangles, near in space
        let skeleton = Skeleton::new(vec![
            Bone::new("root", None, Affine3A::IDENTITY),
            Bone::new("child", Some(0), Affine3A::from_translation(Vec3::X)),
        ])
        .unwrap();
        let mesh = TriangleMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.5, 1.0, 0.0),
                // second patch floating just above the first
                Vec3::new(0.0, 0.0, 0.2),
                Vec3::new(1.0, 0.0, 0.2),
                Vec3::new(0.5, 1.0, 0.2),
            ],
            vec![[0, 1, 2], [3, 4, 5]],
        );
        let weights: Vec<Vec<(BoneIndex, f32)>> = (0..6).map(|_| vec![(0, 1.0)]).collect();
        let mut session = WeightEditSession::with_scheduler(
            mesh,
            skeleton,
            &weights,
            Box::new(crate::scheduler::InlineScheduler),
        )
        .unwrap();

        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Replace;
        session.settings.replace.strength = 1.0;
        session.settings.replace.radius = 3.0;
        session.settings.replace.falloff = 0.0;

        session.begin_stroke(false);
        session
            .apply_stamp(&BrushStamp {
                position: Vec3::new(0.5, 0.3, 0.0),
                triangle: 0,
                radius: None,
            })
            .unwrap();
        session.end_stroke().unwrap();

        for vertex in 0..3 {
            assert!(session
                .get_influences(vertex)
                .iter()
                .any(|&(bone, weight)| bone == 1 && weight > 0.9));
        }
        // the floating patch is untouched despite being inside the radius
        for vertex in 3..6 {
            assert_eq!(session.get_influences(vertex), vec![(0, 1.0)]);
        }
    }

    #[test]
    fn volume_falloff_reaches_nearby_patches() {
        // volume mode measures straight-line distance, so a floating
        // patch inside the radius is painted too
        let skeleton = Skeleton::new(vec![
            Bone::new("root", None, Affine3A::IDENTITY),
            Bone::new("child", Some(0), Affine3A::from_translation(Vec3::X)),
        ])
        .unwrap();
        let mesh = TriangleMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.5, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 0.2),
                Vec3::new(1.0, 0.0, 0.2),
                Vec3::new(0.5, 1.0, 0.2),
            ],
            vec![[0, 1, 2], [3, 4, 5]],
        );
        let weights: Vec<Vec<(BoneIndex, f32)>> = (0..6).map(|_| vec![(0, 1.0)]).collect();
        let mut session = WeightEditSession::with_scheduler(
            mesh,
            skeleton,
            &weights,
            Box::new(crate::scheduler::InlineScheduler),
        )
        .unwrap();

        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Replace;
        session.settings.replace.strength = 1.0;
        session.settings.replace.radius = 3.0;
        session.settings.replace.falloff = 0.0;
        session.settings.replace.falloff_mode = FalloffMode::Volume;

        session.begin_stroke(false);
        session
            .apply_stamp(&BrushStamp {
                position: Vec3::new(0.5, 0.3, 0.0),
                triangle: 0,
                radius: None,
            })
            .unwrap();
        session.end_stroke().unwrap();

        for vertex in 0..6 {
            assert!(session
                .get_influences(vertex)
                .iter()
                .any(|&(bone, weight)| bone == 1 && weight > 0.9));
        }
    }

    #[test]
    fn volume_stamp_still_paints_after_grid_mutex_is_poisoned() {
        let mut session = strip_session(4);
        session.set_current_bone("child").unwrap();
        session.settings.operation = WeightEditOperation::Replace;
        session.settings.replace.strength = 1.0;
        session.settings.replace.radius = 1.5;
        session.settings.replace.falloff = 0.0;
        session.settings.replace.falloff_mode = FalloffMode::Volume;

        // a background task panicking while holding the grid lock must
        // not make subsequent stamps silent no-ops
        let grid = Arc::clone(&session.vertex_grid);
        let _ = std::thread::spawn(move || {
            let _guard = grid.lock().unwrap();
            panic!("background grid task failed");
        })
        .join();
        assert!(session.vertex_grid.is_poisoned());

        session.begin_stroke(false);
        session
            .apply_stamp(&BrushStamp {
                position: Vec3::new(4.0, 0.5, 0.0),
                triangle: 6,
                radius: None,
            })
            .unwrap();
        session.end_stroke().unwrap();

        assert!(session
            .get_influences(8)
            .iter()
            .any(|&(bone, weight)| bone == 1 && weight > 0.9));
    }

    #[test]
    fn relax_stamp_smooths_a_hard_boundary() {
        let mut session = strip_session(4);
        // paint a hard seam: right half fully on child
        session.set_current_bone("child").unwrap();
        let right_half: Vec<VertexIndex> = (6..10).collect();
        session
            .edit_weights_on_vertices(1, 1.0, WeightEditOperation::Replace, &right_half)
            .unwrap();

        session.settings.operation = WeightEditOperation::Relax;
        session.settings.relax.strength = 1.0;
        session.settings.relax.radius = 1.5;
        session.settings.relax.falloff = 0.0;

        session.begin_stroke(false);
        session
            .apply_stamp(&BrushStamp {
                position: Vec3::new(2.5, 0.5, 0.0),
                triangle: 4,
                radius: None,
            })
            .unwrap();
        session.end_stroke().unwrap();

        // seam vertices now hold intermediate weights, still normalized
        let seam = session.get_influences(6);
        let child_weight: f32 = seam
            .iter()
            .filter(|&&(bone, _)| bone == 1)
            .map(|&(_, w)| w)
            .sum();
        assert!(child_weight > MINIMUM_WEIGHT_THRESHOLD && child_weight < 1.0 - 1e-3);
        for vertex in 0..session.mesh().vertex_count() {
            assert!(nearly_equal(weights_sum(&session, vertex), 1.0));
        }
    }

    #[test]
    fn direct_replace_edit_is_exact_and_transactional() {
        let mut session = strip_session(2);
        let change = session
            .edit_weights_on_vertices(1, 0.25, WeightEditOperation::Replace, &[0, 1])
            .unwrap()
            .unwrap();

        for vertex in [0usize, 1] {
            let influences = session.get_influences(vertex);
            let child: f32 = influences
                .iter()
                .filter(|&&(b, _)| b == 1)
                .map(|&(_, w)| w)
                .sum();
            assert!(nearly_equal(child, 0.25));
            assert!(nearly_equal(weights_sum(&session, vertex), 1.0));
        }

        session.revert_external_change(&change);
        let influences = session.get_influences(0);
        let root: f32 = influences
            .iter()
            .filter(|&&(b, _)| b == 0)
            .map(|&(_, w)| w)
            .sum();
        let child: f32 = influences
            .iter()
            .filter(|&&(b, _)| b == 1)
            .map(|&(_, w)| w)
            .sum();
        assert!(nearly_equal(root, 1.0));
        assert!(nearly_equal(child, 0.0));
    }
}
