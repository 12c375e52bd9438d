//! Neighbor-average weight smoothing used by the relax brush.

use std::collections::HashMap;

use marrow_core::{BoneIndex, VertexIndex, MAX_INFLUENCES_PER_VERTEX, MINIMUM_WEIGHT_THRESHOLD};
use marrow_mesh::EditableMesh;

use crate::store::{Snapshot, VertexWeightStore};

/// Blend a vertex's current weights toward the average of its edge
/// neighbors by `t` in [0, 1].
///
/// The blended result is truncated to the influence limit (keeping the
/// largest) and renormalized. Returns `None` for isolated vertices.
pub fn smooth_weights_at_vertex<M: EditableMesh + ?Sized>(
    store: &VertexWeightStore,
    mesh: &M,
    vertex: VertexIndex,
    t: f32,
) -> Option<HashMap<BoneIndex, f32>> {
    let neighbors = mesh.vertex_neighbors(vertex);
    if neighbors.is_empty() {
        return None;
    }

    let mut average: HashMap<BoneIndex, f32> = HashMap::new();
    let per_neighbor = 1.0 / neighbors.len() as f32;
    for &neighbor in neighbors {
        for influence in store.vertex_weights(neighbor, Snapshot::Current) {
            *average.entry(influence.bone).or_insert(0.0) += influence.weight * per_neighbor;
        }
    }

    // lerp current toward the neighbor average
    let mut blended: HashMap<BoneIndex, f32> = HashMap::new();
    for influence in store.vertex_weights(vertex, Snapshot::Current) {
        blended.insert(influence.bone, influence.weight * (1.0 - t));
    }
    for (&bone, &average_weight) in &average {
        *blended.entry(bone).or_insert(0.0) += average_weight * t;
    }

    truncate_and_normalize(&mut blended);
    Some(blended)
}

/// Cap a weight map at the influence limit, keeping the largest entries,
/// and rescale to a unit sum.
pub fn truncate_and_normalize(weights: &mut HashMap<BoneIndex, f32>) {
    if weights.len() > MAX_INFLUENCES_PER_VERTEX {
        let mut sorted: Vec<(BoneIndex, f32)> =
            weights.iter().map(|(&bone, &weight)| (bone, weight)).collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted.truncate(MAX_INFLUENCES_PER_VERTEX);
        weights.clear();
        weights.extend(sorted);
    }

    let total: f32 = weights.values().sum();
    if total > MINIMUM_WEIGHT_THRESHOLD {
        for weight in weights.values_mut() {
            *weight /= total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Affine3A, Vec3};
    use marrow_core::nearly_equal;
    use marrow_mesh::TriangleMesh;
    use marrow_skeleton::{Bone, Skeleton};

    fn fixture() -> (VertexWeightStore, TriangleMesh) {
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
            ],
            vec![[0, 1, 2]],
        );
        let store = VertexWeightStore::new(
            &skeleton,
            &mesh,
            &[vec![(0, 1.0)], vec![(1, 1.0)], vec![(0, 0.5), (1, 0.5)]],
        )
        .unwrap();
        (store, mesh)
    }

    #[test]
    fn full_strength_smoothing_matches_neighbor_average() {
        let (store, mesh) = fixture();
        // vertex 0 neighbors are 1 (bone1=1) and 2 (0.5/0.5);
        // average: bone0 0.25, bone1 0.75
        let smoothed = smooth_weights_at_vertex(&store, &mesh, 0, 1.0).unwrap();
        assert!(nearly_equal(smoothed[&0], 0.25));
        assert!(nearly_equal(smoothed[&1], 0.75));
    }

    #[test]
    fn partial_smoothing_stays_normalized() {
        let (store, mesh) = fixture();
        let smoothed = smooth_weights_at_vertex(&store, &mesh, 0, 0.3).unwrap();
        let total: f32 = smoothed.values().sum();
        assert!(nearly_equal(total, 1.0));
        // still dominated by the vertex's own full root binding
        assert!(smoothed[&0] > smoothed[&1]);
    }

    #[test]
    fn truncation_keeps_largest_influences() {
        let mut weights: HashMap<BoneIndex, f32> = (0..MAX_INFLUENCES_PER_VERTEX + 4)
            .map(|bone| (bone, (bone + 1) as f32))
            .collect();
        truncate_and_normalize(&mut weights);

        assert_eq!(weights.len(), MAX_INFLUENCES_PER_VERTEX);
        // the four smallest are gone
        for bone in 0..4 {
            assert!(!weights.contains_key(&bone));
        }
        let total: f32 = weights.values().sum();
        assert!(nearly_equal(total, 1.0));
    }
}
