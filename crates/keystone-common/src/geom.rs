//! 3D geometry primitives for the spatial index.
//!
//! Boxes are axis-aligned with inclusive faces. A degenerate box with
//! `min == max` represents a point, which is how point data is stored in the
//! R-tree leaves.

use serde::{Deserialize, Serialize};

/// Axis-aligned 3D bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    /// Builds a box from two corners, normalizing so `min <= max` per axis.
    pub fn new(a: [f64; 3], b: [f64; 3]) -> Self {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = a[axis].min(b[axis]);
            max[axis] = a[axis].max(b[axis]);
        }
        Self { min, max }
    }

    /// Degenerate box covering a single point.
    pub fn point(p: [f64; 3]) -> Self {
        Self { min: p, max: p }
    }

    pub fn volume(&self) -> f64 {
        (self.max[0] - self.min[0])
            * (self.max[1] - self.min[1])
            * (self.max[2] - self.min[2])
    }

    /// Smallest box containing both `self` and `other`.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = self.min[axis].min(other.min[axis]);
            max[axis] = self.max[axis].max(other.max[axis]);
        }
        BoundingBox { min, max }
    }

    /// Volume growth required for `self` to also cover `other`.
    pub fn enlargement(&self, other: &BoundingBox) -> f64 {
        self.union(other).volume() - self.volume()
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| {
            self.min[axis] <= other.max[axis] && other.min[axis] <= self.max[axis]
        })
    }

    pub fn contains_point(&self, p: [f64; 3]) -> bool {
        (0..3).all(|axis| self.min[axis] <= p[axis] && p[axis] <= self.max[axis])
    }

    /// Exact equality of both corners, used for key matching on delete.
    pub fn same_extent(&self, other: &BoundingBox) -> bool {
        self.min == other.min && self.max == other.max
    }
}

/// Sphere query region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: [f64; 3],
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: [f64; 3], radius: f64) -> Self {
        Self { center, radius }
    }

    pub fn contains_point(&self, p: [f64; 3]) -> bool {
        let mut dist_sq = 0.0;
        for axis in 0..3 {
            let d = p[axis] - self.center[axis];
            dist_sq += d * d;
        }
        dist_sq <= self.radius * self.radius
    }

    /// True when the sphere touches the box: the box point nearest to the
    /// center (center clamped per axis) lies within the radius.
    pub fn intersects_box(&self, bbox: &BoundingBox) -> bool {
        let mut dist_sq = 0.0;
        for axis in 0..3 {
            let nearest = self.center[axis].clamp(bbox.min[axis], bbox.max[axis]);
            let d = self.center[axis] - nearest;
            dist_sq += d * d;
        }
        dist_sq <= self.radius * self.radius
    }
}
