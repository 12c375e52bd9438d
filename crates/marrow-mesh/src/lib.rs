//! Mesh access for the Marrow weight engine
//!
//! The weight engine treats the mesh as an external collaborator: it reads
//! topology and positions through `EditableMesh` and pushes recomputed
//! vertex positions back through a batched deferred-edit contract. This
//! crate also provides the spatial structures the engine queries:
//! a point hash grid for ball searches and multi-source Dijkstra for
//! geodesic distances along mesh edges.

mod dijkstra;
mod hash_grid;

pub use dijkstra::{geodesic_distances, GeodesicDistances, SeedPoint};
pub use hash_grid::PointHashGrid;

use glam::Vec3;
use marrow_core::VertexIndex;

/// How the host renderer should pick up a batch of position writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderUpdateMode {
    /// Positions only; attribute and topology caches stay valid.
    FastPositions,
    /// Full rebuild of render data.
    Full,
}

/// Read access to mesh topology plus the deferred-edit write contract.
///
/// `apply_deferred_positions` is the only mutating entry point: all vertex
/// writes for one deformation update arrive in a single batch, and the
/// implementation issues exactly one downstream update notification per
/// call, never one per vertex.
pub trait EditableMesh {
    fn vertex_count(&self) -> usize;
    fn vertex_position(&self, vertex: VertexIndex) -> Vec3;
    fn triangle_count(&self) -> usize;
    fn triangle_vertices(&self, triangle: usize) -> [VertexIndex; 3];
    /// Vertices sharing an edge with `vertex`.
    fn vertex_neighbors(&self, vertex: VertexIndex) -> &[VertexIndex];
    fn apply_deferred_positions(&mut self, updates: &[(VertexIndex, Vec3)], mode: RenderUpdateMode);
}

/// A plain indexed triangle mesh with precomputed vertex adjacency.
///
/// Serves as the concrete mesh for tests and standalone use; a host
/// application would instead implement `EditableMesh` over its own mesh
/// representation.
#[derive(Debug, Clone)]
pub struct TriangleMesh {
    positions: Vec<Vec3>,
    triangles: Vec<[VertexIndex; 3]>,
    neighbors: Vec<Vec<VertexIndex>>,
    /// Bumped once per deferred-edit batch, standing in for a render
    /// update notification.
    pub position_revision: u64,
}

impl TriangleMesh {
    pub fn new(positions: Vec<Vec3>, triangles: Vec<[VertexIndex; 3]>) -> Self {
        let mut neighbors: Vec<Vec<VertexIndex>> = vec![Vec::new(); positions.len()];
        for tri in &triangles {
            for i in 0..3 {
                let a = tri[i];
                let b = tri[(i + 1) % 3];
                if !neighbors[a].contains(&b) {
                    neighbors[a].push(b);
                }
                if !neighbors[b].contains(&a) {
                    neighbors[b].push(a);
                }
            }
        }
        Self {
            positions,
            triangles,
            neighbors,
            position_revision: 0,
        }
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }
}

impl EditableMesh for TriangleMesh {
    fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    fn vertex_position(&self, vertex: VertexIndex) -> Vec3 {
        self.positions[vertex]
    }

    fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    fn triangle_vertices(&self, triangle: usize) -> [VertexIndex; 3] {
        self.triangles[triangle]
    }

    fn vertex_neighbors(&self, vertex: VertexIndex) -> &[VertexIndex] {
        &self.neighbors[vertex]
    }

    fn apply_deferred_positions(&mut self, updates: &[(VertexIndex, Vec3)], _mode: RenderUpdateMode) {
        for &(vertex, position) in updates {
            if vertex < self.positions.len() {
                self.positions[vertex] = position;
            }
        }
        self.position_revision += 1;
    }
}
