//! Multi-source Dijkstra over mesh edges for geodesic distances

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use marrow_core::VertexIndex;

use crate::EditableMesh;

/// A Dijkstra seed: a vertex and the distance it starts with (nonzero
/// when the true source lies off-vertex, e.g. a brush-stamp center).
#[derive(Debug, Clone, Copy)]
pub struct SeedPoint {
    pub vertex: VertexIndex,
    pub initial_distance: f32,
}

/// Shortest-path results from a multi-source Dijkstra run.
#[derive(Debug, Default)]
pub struct GeodesicDistances {
    distance: HashMap<VertexIndex, f32>,
    nearest_seed: HashMap<VertexIndex, VertexIndex>,
}

impl GeodesicDistances {
    /// Geodesic distance to `vertex`, if it was reached within the
    /// search bound.
    pub fn distance(&self, vertex: VertexIndex) -> Option<f32> {
        self.distance.get(&vertex).copied()
    }

    /// The seed vertex whose shortest path reached `vertex` first.
    pub fn nearest_seed(&self, vertex: VertexIndex) -> Option<VertexIndex> {
        self.nearest_seed.get(&vertex).copied()
    }
}

struct HeapEntry {
    distance: f32,
    vertex: VertexIndex,
    seed: VertexIndex,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on distance
        other.distance.total_cmp(&self.distance)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shortest path lengths measured along mesh edges, from every seed to
/// every vertex reachable within `max_distance`.
pub fn geodesic_distances<M: EditableMesh + ?Sized>(
    mesh: &M,
    seeds: &[SeedPoint],
    max_distance: f32,
) -> GeodesicDistances {
    let mut result = GeodesicDistances::default();
    let mut queue = BinaryHeap::new();

    for seed in seeds {
        if seed.initial_distance > max_distance {
            continue;
        }
        let best = result
            .distance
            .get(&seed.vertex)
            .copied()
            .unwrap_or(f32::INFINITY);
        if seed.initial_distance < best {
            result.distance.insert(seed.vertex, seed.initial_distance);
            result.nearest_seed.insert(seed.vertex, seed.vertex);
            queue.push(HeapEntry {
                distance: seed.initial_distance,
                vertex: seed.vertex,
                seed: seed.vertex,
            });
        }
    }

    while let Some(entry) = queue.pop() {
        let settled = result.distance[&entry.vertex];
        if entry.distance > settled {
            continue; // stale entry
        }

        let position = mesh.vertex_position(entry.vertex);
        for &neighbor in mesh.vertex_neighbors(entry.vertex) {
            let edge_length = position.distance(mesh.vertex_position(neighbor));
            let candidate = entry.distance + edge_length;
            if candidate > max_distance {
                continue;
            }
            let best = result
                .distance
                .get(&neighbor)
                .copied()
                .unwrap_or(f32::INFINITY);
            if candidate < best {
                result.distance.insert(neighbor, candidate);
                result.nearest_seed.insert(neighbor, entry.seed);
                queue.push(HeapEntry {
                    distance: candidate,
                    vertex: neighbor,
                    seed: entry.seed,
                });
            }
        }
    }

    result
}
