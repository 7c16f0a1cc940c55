//! Collision detection subsystem

pub mod broad_phase;
pub mod narrow_phase;

use glam::Vec3;

/// Contact information between two colliding bodies
///
/// Bodies are referenced by their index in the step's body array.
#[derive(Debug, Clone, Copy)]
pub struct Contact {
    pub body_a: usize,
    pub body_b: usize,
    /// World space contact point
    pub position: Vec3,
    /// Contact normal pointing from A to B
    pub normal: Vec3,
    /// Penetration depth
    pub penetration: f32,
    /// Tangent vector for friction (perpendicular to normal)
    pub tangent: Vec3,
    /// Bitangent vector for friction (perpendicular to normal and tangent)
    pub bitangent: Vec3,
}

impl Contact {
    pub fn new(body_a: usize, body_b: usize, position: Vec3, normal: Vec3, penetration: f32) -> Self {
        let (tangent, bitangent) = create_tangent_basis(normal);

        Self {
            body_a,
            body_b,
            position,
            normal,
            penetration,
            tangent,
            bitangent,
        }
    }

    /// Flip the contact (swap A and B)
    pub fn flipped(self) -> Self {
        Self::new(self.body_b, self.body_a, self.position, -self.normal, self.penetration)
    }
}

/// Create an orthonormal basis given a normal vector
fn create_tangent_basis(normal: Vec3) -> (Vec3, Vec3) {
    // Choose a vector that's not parallel to the normal
    let up = if normal.y.abs() < 0.9 { Vec3::Y } else { Vec3::X };

    let tangent = up.cross(normal).normalize_or_zero();
    let bitangent = normal.cross(tangent);

    (tangent, bitangent)
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Inverted box that any merge or expansion replaces
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn from_points(points: &[Vec3]) -> Self {
        let mut aabb = Self::EMPTY;
        for &point in points {
            aabb.expand_to_include(point);
        }
        aabb
    }

    /// Check if this AABB overlaps with another
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Expand this AABB to include a point
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow the box by a margin on every side
    pub fn expanded(&self, margin: f32) -> Aabb {
        Aabb {
            min: self.min - Vec3::splat(margin),
            max: self.max + Vec3::splat(margin),
        }
    }

    /// Bounds of this box after a rigid transform
    pub fn transformed(&self, position: glam::Vec3, rotation: glam::Quat) -> Aabb {
        let (min, max) = (self.min, self.max);
        let corners = [
            Vec3::new(min.x, min.y, min.z),
            Vec3::new(max.x, min.y, min.z),
            Vec3::new(min.x, max.y, min.z),
            Vec3::new(max.x, max.y, min.z),
            Vec3::new(min.x, min.y, max.z),
            Vec3::new(max.x, min.y, max.z),
            Vec3::new(min.x, max.y, max.z),
            Vec3::new(max.x, max.y, max.z),
        ];

        let mut aabb = Aabb::EMPTY;
        for corner in corners {
            aabb.expand_to_include(position + rotation * corner);
        }
        aabb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_aabb_overlap() {
        let aabb1 = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let aabb2 = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let aabb3 = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));

        assert!(aabb1.overlaps(&aabb2));
        assert!(aabb2.overlaps(&aabb1));
        assert!(!aabb1.overlaps(&aabb3));
        assert!(!aabb3.overlaps(&aabb1));
    }

    #[test]
    fn test_tangent_basis() {
        for normal in [Vec3::Y, Vec3::X, Vec3::new(0.3, -0.4, 0.866).normalize()] {
            let (tangent, bitangent) = create_tangent_basis(normal);

            assert!((normal.dot(tangent)).abs() < 1e-6);
            assert!((normal.dot(bitangent)).abs() < 1e-6);
            assert!((tangent.dot(bitangent)).abs() < 1e-6);
            assert!((tangent.length() - 1.0).abs() < 1e-5);
            assert!((bitangent.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_transformed_box_bounds() {
        let aabb = Aabb::from_center_half_extents(Vec3::ZERO, Vec3::new(1.0, 0.5, 0.5));
        let rotated = aabb.transformed(
            Vec3::new(10.0, 0.0, 0.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        assert!((rotated.center() - Vec3::new(10.0, 0.0, 0.0)).length() < 1e-5);
        assert!((rotated.half_extents() - Vec3::new(0.5, 0.5, 1.0)).length() < 1e-5);
    }

    #[test]
    fn test_flipped_contact() {
        let contact = Contact::new(0, 1, Vec3::ZERO, Vec3::Y, 0.1);
        let flipped = contact.flipped();
        assert_eq!(flipped.body_a, 1);
        assert_eq!(flipped.body_b, 0);
        assert_eq!(flipped.normal, -Vec3::Y);
    }
}
