//! Uniform spatial hash over a point set, for ball queries

use std::collections::HashMap;

use glam::Vec3;
use marrow_core::VertexIndex;

/// A uniform grid hashing point indices by cell, supporting ball queries
/// and incremental reinsertion of moved points.
#[derive(Debug, Clone)]
pub struct PointHashGrid {
    cell_size: f32,
    cells: HashMap<(i32, i32, i32), Vec<VertexIndex>>,
    points: Vec<Vec3>,
}

impl PointHashGrid {
    pub fn build(points: &[Vec3], cell_size: f32) -> Self {
        debug_assert!(cell_size > 0.0);
        let mut grid = Self {
            cell_size,
            cells: HashMap::new(),
            points: points.to_vec(),
        };
        for (index, &point) in points.iter().enumerate() {
            let key = grid.cell_key(point);
            grid.cells.entry(key).or_default().push(index);
        }
        grid
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    fn cell_key(&self, point: Vec3) -> (i32, i32, i32) {
        (
            (point.x / self.cell_size).floor() as i32,
            (point.y / self.cell_size).floor() as i32,
            (point.z / self.cell_size).floor() as i32,
        )
    }

    /// Collect indices of all points within `radius` of `center`.
    pub fn find_points_in_ball(&self, center: Vec3, radius: f32, out: &mut Vec<VertexIndex>) {
        out.clear();
        let radius_sq = radius * radius;
        let min = self.cell_key(center - Vec3::splat(radius));
        let max = self.cell_key(center + Vec3::splat(radius));
        for x in min.0..=max.0 {
            for y in min.1..=max.1 {
                for z in min.2..=max.2 {
                    let Some(indices) = self.cells.get(&(x, y, z)) else {
                        continue;
                    };
                    for &index in indices {
                        if self.points[index].distance_squared(center) <= radius_sq {
                            out.push(index);
                        }
                    }
                }
            }
        }
    }

    /// Move a batch of points to new positions, rehashing each into its
    /// new cell.
    pub fn reinsert(&mut self, updates: &[(VertexIndex, Vec3)]) {
        for &(index, position) in updates {
            if index >= self.points.len() {
                continue;
            }
            let old_key = self.cell_key(self.points[index]);
            let new_key = self.cell_key(position);
            self.points[index] = position;
            if old_key == new_key {
                continue;
            }
            if let Some(cell) = self.cells.get_mut(&old_key) {
                cell.retain(|&i| i != index);
                if cell.is_empty() {
                    self.cells.remove(&old_key);
                }
            }
            self.cells.entry(new_key).or_default().push(index);
        }
    }
}
