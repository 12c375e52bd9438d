//! Incremental skinning preview: recompute deformed positions for the
//! vertices whose weights changed, in the current skeleton pose.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use glam::{Affine3A, Vec3};
use rayon::prelude::*;

use marrow_core::{BoneIndex, VertexIndex};
use marrow_mesh::{EditableMesh, PointHashGrid, RenderUpdateMode};
use marrow_skeleton::Skeleton;

use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::store::VertexWeights;

/// Data required to preview skinning deformation while weights change.
///
/// Owns the reference-pose snapshot (vertex positions, pre-inverted
/// component-space bone transforms) and the dirty set of vertices whose
/// positions need recomputing.
pub struct Deformer {
    /// Position of every vertex in the reference pose.
    pub ref_pose_vertex_positions: Vec<Vec3>,
    /// Inverted component-space reference-pose transform of each bone.
    pub inv_cs_ref_pose: Vec<Affine3A>,
    /// Component-space reference pose, kept for ref-pose resets.
    cs_ref_pose: Vec<Affine3A>,
    /// Vertices requiring a deformation update.
    dirty_vertices: HashSet<VertexIndex>,
    /// Bone transforms used by the previous deformation update.
    previous_pose: Vec<Affine3A>,
    /// In-flight spatial-index refresh from the previous update.
    pending_reindex: Option<TaskHandle>,
}

impl Deformer {
    pub fn new(skeleton: &Skeleton, mesh: &impl EditableMesh) -> Self {
        let cs_ref_pose = skeleton.component_space_ref_pose();
        // pre-invert so evaluation is a single transform per influence
        let inv_cs_ref_pose: Vec<Affine3A> = cs_ref_pose.iter().map(|t| t.inverse()).collect();

        let ref_pose_vertex_positions: Vec<Vec3> = (0..mesh.vertex_count())
            .map(|v| mesh.vertex_position(v))
            .collect();

        let mut deformer = Self {
            ref_pose_vertex_positions,
            inv_cs_ref_pose,
            previous_pose: cs_ref_pose.clone(),
            cs_ref_pose,
            dirty_vertices: HashSet::new(),
            pending_reindex: None,
        };
        deformer.set_all_vertices_to_be_updated();
        deformer
    }

    /// Cached bone-space position for (vertex, bone), used when a new
    /// influence is recorded.
    pub fn position_in_bone_space(&self, vertex: VertexIndex, bone: BoneIndex) -> Vec3 {
        self.inv_cs_ref_pose[bone].transform_point3(self.ref_pose_vertex_positions[vertex])
    }

    pub fn bone_count(&self) -> usize {
        self.inv_cs_ref_pose.len()
    }

    pub fn set_vertex_needs_updated(&mut self, vertex: VertexIndex) {
        self.dirty_vertices.insert(vertex);
    }

    pub fn set_all_vertices_to_be_updated(&mut self) {
        self.dirty_vertices = (0..self.ref_pose_vertex_positions.len()).collect();
    }

    /// Deform the mesh to the reference pose. Used before geodesic
    /// measurements so path lengths are not distorted by the live pose.
    pub fn set_to_ref_pose(
        &mut self,
        current_weights: &[VertexWeights],
        is_bone_weighted: &[bool],
        mesh: &mut impl EditableMesh,
        vertex_grid: Option<&Arc<Mutex<PointHashGrid>>>,
        scheduler: &dyn TaskScheduler,
    ) {
        let ref_pose = self.cs_ref_pose.clone();
        self.update_vertex_deformation(
            &ref_pose,
            current_weights,
            is_bone_weighted,
            mesh,
            vertex_grid,
            scheduler,
        );
    }

    /// Recompute deformed positions for all dirty vertices using the
    /// given component-space pose.
    ///
    /// When no weights changed, a pose change on any *weighted* bone
    /// still dirties the whole mesh; unweighted bones are skipped so a
    /// waving unbound IK bone costs nothing.
    pub fn update_vertex_deformation(
        &mut self,
        pose: &[Affine3A],
        current_weights: &[VertexWeights],
        is_bone_weighted: &[bool],
        mesh: &mut impl EditableMesh,
        vertex_grid: Option<&Arc<Mutex<PointHashGrid>>>,
        scheduler: &dyn TaskScheduler,
    ) {
        if self.dirty_vertices.is_empty() {
            for (bone, transform) in pose.iter().enumerate() {
                if !is_bone_weighted.get(bone).copied().unwrap_or(false) {
                    continue;
                }
                // the caller's pose may carry more bones than the last one
                let changed = match self.previous_pose.get(bone) {
                    Some(previous) => !transform.abs_diff_eq(*previous, 1e-6),
                    None => true,
                };
                if changed {
                    self.set_all_vertices_to_be_updated();
                    break;
                }
            }
        }

        if self.dirty_vertices.is_empty() {
            return;
        }

        // per-vertex skinning is embarrassingly parallel: influences are
        // read-only and every vertex writes only its own slot
        let dirty: Vec<VertexIndex> = self.dirty_vertices.iter().copied().collect();
        let updates: Vec<(VertexIndex, Vec3)> = dirty
            .par_iter()
            .map(|&vertex| {
                let mut position = Vec3::ZERO;
                for influence in &current_weights[vertex] {
                    if influence.bone >= pose.len() {
                        continue;
                    }
                    position += pose[influence.bone]
                        .transform_point3(influence.position_in_bone_space)
                        * influence.weight;
                }
                (vertex, position)
            })
            .collect();

        // one batched write, one downstream notification
        mesh.apply_deferred_positions(&updates, RenderUpdateMode::FastPositions);

        // refresh the vertex spatial index off-thread; the previous
        // refresh must finish first since both touch the same grid
        if let Some(grid) = vertex_grid {
            if let Some(handle) = self.pending_reindex.take() {
                handle.wait();
            }
            let grid = Arc::clone(grid);
            self.pending_reindex = Some(scheduler.spawn(Box::new(move || {
                let mut grid = grid.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                grid.reinsert(&updates);
            })));
        }

        self.dirty_vertices.clear();
        self.previous_pose = pose.to_vec();
    }

    /// Block until the in-flight spatial-index refresh (if any) is done.
    pub fn wait_for_pending_reindex(&mut self) {
        if let Some(handle) = self.pending_reindex.take() {
            handle.wait();
        }
    }

    #[cfg(test)]
    pub(crate) fn dirty_vertex_count(&self) -> usize {
        self.dirty_vertices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::InlineScheduler;
    use crate::store::VertexBoneWeight;
    use glam::Vec3;
    use marrow_mesh::TriangleMesh;
    use marrow_skeleton::Bone;

    fn fixture() -> (Skeleton, TriangleMesh) {
        let skeleton = Skeleton::new(vec![
            Bone::new("root", None, Affine3A::IDENTITY),
            Bone::new(
                "child",
                Some(0),
                Affine3A::from_translation(Vec3::new(2.0, 0.0, 0.0)),
            ),
        ])
        .unwrap();
        let mesh = TriangleMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
        );
        (skeleton, mesh)
    }

    fn single_influence(deformer: &Deformer, vertex: usize, bone: usize) -> VertexWeights {
        vec![VertexBoneWeight {
            bone,
            position_in_bone_space: deformer.position_in_bone_space(vertex, bone),
            weight: 1.0,
        }]
    }

    #[test]
    fn ref_pose_deformation_reproduces_ref_positions() {
        let (skeleton, mut mesh) = fixture();
        let mut deformer = Deformer::new(&skeleton, &mesh);
        let weights: Vec<VertexWeights> = (0..3)
            .map(|v| single_influence(&deformer, v, if v == 1 { 1 } else { 0 }))
            .collect();

        let pose = skeleton.component_space_ref_pose();
        deformer.update_vertex_deformation(
            &pose,
            &weights,
            &[true, true],
            &mut mesh,
            None,
            &InlineScheduler,
        );

        assert!(mesh.vertex_position(0).abs_diff_eq(Vec3::ZERO, 1e-5));
        assert!(mesh
            .vertex_position(1)
            .abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-5));
        assert_eq!(deformer.dirty_vertex_count(), 0);
    }

    #[test]
    fn pose_change_on_weighted_bone_dirties_whole_mesh() {
        let (skeleton, mut mesh) = fixture();
        let mut deformer = Deformer::new(&skeleton, &mesh);
        let weights: Vec<VertexWeights> = (0..3)
            .map(|v| single_influence(&deformer, v, if v == 1 { 1 } else { 0 }))
            .collect();
        let is_weighted = [true, true];

        let ref_pose = skeleton.component_space_ref_pose();
        deformer.update_vertex_deformation(
            &ref_pose,
            &weights,
            &is_weighted,
            &mut mesh,
            None,
            &InlineScheduler,
        );

        // move the child bone up by 1
        let mut moved_pose = ref_pose.clone();
        moved_pose[1] = Affine3A::from_translation(Vec3::new(2.0, 1.0, 0.0));
        deformer.update_vertex_deformation(
            &moved_pose,
            &weights,
            &is_weighted,
            &mut mesh,
            None,
            &InlineScheduler,
        );

        assert!(mesh
            .vertex_position(1)
            .abs_diff_eq(Vec3::new(2.0, 1.0, 0.0), 1e-5));
        // root-bound vertices are unchanged
        assert!(mesh.vertex_position(0).abs_diff_eq(Vec3::ZERO, 1e-5));
    }

    #[test]
    fn unchanged_pose_with_empty_dirty_set_is_a_no_op() {
        let (skeleton, mut mesh) = fixture();
        let mut deformer = Deformer::new(&skeleton, &mesh);
        let weights: Vec<VertexWeights> = (0..3)
            .map(|v| single_influence(&deformer, v, 0))
            .collect();
        let pose = skeleton.component_space_ref_pose();

        deformer.update_vertex_deformation(
            &pose,
            &weights,
            &[true, false],
            &mut mesh,
            None,
            &InlineScheduler,
        );
        let revision = mesh.position_revision;

        deformer.update_vertex_deformation(
            &pose,
            &weights,
            &[true, false],
            &mut mesh,
            None,
            &InlineScheduler,
        );
        assert_eq!(mesh.position_revision, revision);
    }

    #[test]
    fn longer_pose_than_previous_update_is_handled() {
        let (skeleton, mut mesh) = fixture();
        let mut deformer = Deformer::new(&skeleton, &mesh);
        let weights: Vec<VertexWeights> = (0..3)
            .map(|v| single_influence(&deformer, v, 0))
            .collect();

        let pose = skeleton.component_space_ref_pose();
        deformer.update_vertex_deformation(
            &pose,
            &weights,
            &[true, true],
            &mut mesh,
            None,
            &InlineScheduler,
        );

        // the host appended a bone, so the next pose slice is longer
        let mut longer = pose.clone();
        longer.push(Affine3A::from_translation(Vec3::new(5.0, 0.0, 0.0)));
        deformer.update_vertex_deformation(
            &longer,
            &weights,
            &[true, true, true],
            &mut mesh,
            None,
            &InlineScheduler,
        );

        assert!(mesh.vertex_position(0).abs_diff_eq(Vec3::ZERO, 1e-5));
    }

    #[test]
    fn vertex_grid_is_refreshed_after_deformation() {
        let (skeleton, mut mesh) = fixture();
        let mut deformer = Deformer::new(&skeleton, &mesh);
        let weights: Vec<VertexWeights> = (0..3)
            .map(|v| single_influence(&deformer, v, 1))
            .collect();

        let grid = Arc::new(Mutex::new(PointHashGrid::build(mesh.positions(), 1.0)));

        // move the child bone far away; every vertex follows it
        let mut pose = skeleton.component_space_ref_pose();
        pose[1] = Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0));
        deformer.update_vertex_deformation(
            &pose,
            &weights,
            &[false, true],
            &mut mesh,
            Some(&grid),
            &InlineScheduler,
        );
        deformer.wait_for_pending_reindex();

        let mut found = Vec::new();
        grid.lock()
            .unwrap()
            .find_points_in_ball(Vec3::new(9.0, 0.5, 0.0), 3.0, &mut found);
        assert_eq!(found.len(), 3);
    }
}
