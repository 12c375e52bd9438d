//! Symmetry tables for mirroring weights across a plane
//!
//! Rebuilt lazily whenever the requested axis or direction changes.
//! Bones are paired by name convention; vertices are paired by searching
//! a hash grid around each vertex's reflected reference-pose position.

use std::collections::HashMap;

use glam::Vec3;

use marrow_core::{BoneIndex, MirrorAxis, MirrorDirection, VertexIndex};
use marrow_mesh::PointHashGrid;
use marrow_skeleton::Skeleton;

/// Grid resolution for reflected-position lookups, in mesh units.
const HASH_GRID_CELL_SIZE: f32 = 2.0;
/// Initial search ball radius, grown in steps of itself up to the cell
/// size before a vertex is declared unmatched.
const THRESHOLD_RADIUS: f32 = 0.1;

/// Lazily built bone and vertex symmetry maps for one (axis, direction).
#[derive(Debug, Default)]
pub struct MirrorData {
    initialized: bool,
    axis: Option<MirrorAxis>,
    direction: Option<MirrorDirection>,
    /// Source bone to its opposite-side counterpart (self-paired for
    /// center bones).
    bone_map: HashMap<BoneIndex, BoneIndex>,
    /// Target vertex to the source vertex it copies weights from.
    vertex_map: HashMap<VertexIndex, VertexIndex>,
    /// False when some target vertices found no source within tolerance.
    all_vertices_mirrored: bool,
}

impl MirrorData {
    /// Rebuild the tables if the axis or direction changed since last
    /// time. Reference-pose positions are used so the pairing is pose
    /// independent.
    pub fn ensure_generated(
        &mut self,
        skeleton: &Skeleton,
        ref_pose_positions: &[Vec3],
        axis: MirrorAxis,
        direction: MirrorDirection,
    ) {
        if self.initialized && self.axis == Some(axis) && self.direction == Some(direction) {
            return;
        }
        self.regenerate(skeleton, ref_pose_positions, axis, direction);
    }

    fn regenerate(
        &mut self,
        skeleton: &Skeleton,
        ref_pose_positions: &[Vec3],
        axis: MirrorAxis,
        direction: MirrorDirection,
    ) {
        self.bone_map.clear();
        self.vertex_map.clear();
        self.all_vertices_mirrored = true;

        for bone in 0..skeleton.bone_count() {
            self.bone_map.insert(bone, skeleton.mirrored_bone_index(bone));
        }

        let component = axis.component();
        let source_sign = match direction {
            MirrorDirection::PositiveToNegative => 1.0f32,
            MirrorDirection::NegativeToPositive => -1.0f32,
        };

        let grid = PointHashGrid::build(ref_pose_positions, HASH_GRID_CELL_SIZE);
        let mut candidates = Vec::new();
        for (target, &position) in ref_pose_positions.iter().enumerate() {
            // targets are on the destination side of the plane
            if position[component] * source_sign > 0.0 {
                continue;
            }
            let mut reflected = position;
            reflected[component] = -reflected[component];

            let mut best: Option<(VertexIndex, f32)> = None;
            let mut radius = THRESHOLD_RADIUS;
            while best.is_none() && radius <= HASH_GRID_CELL_SIZE {
                grid.find_points_in_ball(reflected, radius, &mut candidates);
                for &candidate in &candidates {
                    let distance_squared = ref_pose_positions[candidate].distance_squared(reflected);
                    if best.map_or(true, |(_, best_distance)| distance_squared < best_distance) {
                        best = Some((candidate, distance_squared));
                    }
                }
                radius += THRESHOLD_RADIUS;
            }

            match best {
                Some((source, _)) => {
                    self.vertex_map.insert(target, source);
                }
                None => self.all_vertices_mirrored = false,
            }
        }

        self.initialized = true;
        self.axis = Some(axis);
        self.direction = Some(direction);
    }

    pub fn mirrored_bone(&self, bone: BoneIndex) -> BoneIndex {
        self.bone_map.get(&bone).copied().unwrap_or(bone)
    }

    /// The source vertex whose weights `target` receives, if paired.
    pub fn source_for_target(&self, target: VertexIndex) -> Option<VertexIndex> {
        self.vertex_map.get(&target).copied()
    }

    /// All (target, source) vertex pairings.
    pub fn vertex_pairs(&self) -> impl Iterator<Item = (VertexIndex, VertexIndex)> + '_ {
        self.vertex_map.iter().map(|(&target, &source)| (target, source))
    }

    /// Targets whose source-side counterpart is `source`. Linear scan;
    /// only used to translate a source-side selection.
    pub fn targets_for_source(&self, source: VertexIndex) -> Vec<VertexIndex> {
        self.vertex_map
            .iter()
            .filter(|&(_, &s)| s == source)
            .map(|(&target, _)| target)
            .collect()
    }

    pub fn all_vertices_mirrored(&self) -> bool {
        self.all_vertices_mirrored
    }

    /// Drop the tables, forcing a rebuild on next use. Called when the
    /// reference data they were built from changes.
    pub fn invalidate(&mut self) {
        self.initialized = false;
    }
}
