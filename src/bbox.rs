//! Axis aligned bounding box.
//!
//! Adapted from `data_structures/bbox.rs`. Empty bounds use `+inf`/`-inf`
//! per spec §3, so an empty box unions correctly with anything.

use super::vector::{vec3f, Vec3f32};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min: Vec3f32,
    pub max: Vec3f32,
}

impl Default for Bbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Bbox {
    /// Create an empty bounding box.
    pub fn new() -> Bbox {
        Self {
            min: vec3f(f32::INFINITY, f32::INFINITY, f32::INFINITY),
            max: vec3f(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    pub fn from_points(points: &[Vec3f32]) -> Bbox {
        let mut bbox = Bbox::new();
        for &p in points {
            bbox.include_vertex(p);
        }
        bbox
    }

    /// Extend the bounding box to include the given vertex.
    pub fn include_vertex(&mut self, v: Vec3f32) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    /// Extend (union) the bounding box with another bounding box.
    pub fn include_bbox(&mut self, other: &Bbox) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Union of two bounding boxes without mutating either.
    pub fn union(&self, other: &Bbox) -> Bbox {
        let mut result = *self;
        result.include_bbox(other);
        result
    }

    pub fn center(&self) -> Vec3f32 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3f32 {
        self.max - self.min
    }

    pub fn extent_dim(&self, dim: u32) -> f32 {
        self.max[dim] - self.min[dim]
    }

    /// Surface area `S(b) = 2*(dx*dy + dy*dz + dx*dz)`. Returns 0 for an
    /// empty or degenerate box rather than a negative/NaN value.
    pub fn area(&self) -> f32 {
        let d = self.extent();
        if d.0 < 0.0 || d.1 < 0.0 || d.2 < 0.0 {
            return 0.0;
        }
        2.0 * (d.0 * d.1 + d.1 * d.2 + d.0 * d.2)
    }

    pub fn longest_axis(&self) -> u32 {
        let d = self.extent();
        if d.0 > d.1 {
            if d.0 > d.2 {
                0
            } else {
                2
            }
        } else if d.1 > d.2 {
            1
        } else {
            2
        }
    }

    pub fn max_extent(&self) -> f32 {
        self.extent_dim(self.longest_axis())
    }

    pub fn is_empty(&self) -> bool {
        self.min.0 > self.max.0 || self.min.1 > self.max.1 || self.min.2 > self.max.2
    }

    pub fn is_finite(&self) -> bool {
        let finite = |v: Vec3f32| v.0.is_finite() && v.1.is_finite() && v.2.is_finite();
        finite(self.min) && finite(self.max)
    }

    /// Position of `point` relative to the box, `(0,0,0)` at `min`, `(1,1,1)`
    /// at `max`. Used by the Morton generator (§4.6).
    pub fn offset(&self, point: Vec3f32) -> Vec3f32 {
        let mut o = point - self.min;
        if self.max.0 > self.min.0 {
            o.0 /= self.max.0 - self.min.0;
        }
        if self.max.1 > self.min.1 {
            o.1 /= self.max.1 - self.min.1;
        }
        if self.max.2 > self.min.2 {
            o.2 /= self.max.2 - self.min.2;
        }
        o
    }

    /// Componentwise intersection. May produce an empty (inverted) box if
    /// the two boxes don't overlap.
    pub fn intersect(&self, other: &Bbox) -> Bbox {
        Bbox {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Clip the box to a half-space `axis <= pos` (`upper == false`) or
    /// `axis >= pos` (`upper == true`). Used for the object-split variant of
    /// the spatial splitter's fallback path.
    pub fn clipped(&self, axis: u32, pos: f32, upper: bool) -> Bbox {
        let mut result = *self;
        if upper {
            result.min[axis] = result.min[axis].max(pos);
        } else {
            result.max[axis] = result.max[axis].min(pos);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_union_identity() {
        let mut a = Bbox::new();
        let b = Bbox::from_points(&[vec3f(0.0, 0.0, 0.0), vec3f(1.0, 2.0, 3.0)]);
        a.include_bbox(&b);
        assert_eq!(a.min, b.min);
        assert_eq!(a.max, b.max);
    }

    #[test]
    fn area_matches_formula() {
        let b = Bbox::from_points(&[vec3f(0.0, 0.0, 0.0), vec3f(2.0, 3.0, 4.0)]);
        assert_eq!(b.area(), 2.0 * (2.0 * 3.0 + 3.0 * 4.0 + 2.0 * 4.0));
    }

    #[test]
    fn longest_axis_picks_max_extent() {
        let b = Bbox::from_points(&[vec3f(0.0, 0.0, 0.0), vec3f(1.0, 5.0, 2.0)]);
        assert_eq!(b.longest_axis(), 1);
    }
}
