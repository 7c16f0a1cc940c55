//! Collision shapes and physical materials
//!
//! Shapes are immutable once built and shared between bodies through
//! [`SharedShape`]. All dimensions are in simulation units.

use crate::physics::collision::Aabb;
use crate::physics::units::{length_to_physics, to_physics};
use glam::{Quat, Vec3};
use std::cmp::Ordering;
use std::sync::Arc;

/// Reference-counted shape handle; the shape is released with its last body
pub type SharedShape = Arc<Shape>;

/// Collision geometry
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Sphere { radius: f32 },
    /// Box with half-extents (width/2, height/2, depth/2)
    Box { half_extents: Vec3 },
    /// Static triangle soup
    TriangleMesh(TriangleMesh),
}

impl Shape {
    pub fn sphere(radius: f32) -> SharedShape {
        Arc::new(Shape::Sphere { radius })
    }

    pub fn cuboid(half_extents: Vec3) -> SharedShape {
        Arc::new(Shape::Box { half_extents })
    }

    pub fn triangle_mesh(mesh: TriangleMesh) -> SharedShape {
        Arc::new(Shape::TriangleMesh(mesh))
    }

    /// Get the AABB for this shape in local space
    pub fn local_aabb(&self) -> Aabb {
        match self {
            Shape::Sphere { radius } => Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(*radius)),
            Shape::Box { half_extents } => Aabb::from_center_half_extents(Vec3::ZERO, *half_extents),
            Shape::TriangleMesh(mesh) => mesh.bounds(),
        }
    }

    /// Get the AABB for this shape transformed by position and rotation
    pub fn world_aabb(&self, position: Vec3, rotation: Quat) -> Aabb {
        match self {
            // Spheres are rotation-invariant
            Shape::Sphere { radius } => Aabb::from_center_half_extents(position, Vec3::splat(*radius)),
            _ => self.local_aabb().transformed(position, rotation),
        }
    }

    /// Mass and principal inertia for a solid of the given density
    ///
    /// Triangle meshes have no volume and return `None`.
    pub fn mass_properties(&self, density: f32) -> Option<(f32, Vec3)> {
        match self {
            Shape::Sphere { radius } => {
                let mass = density * (4.0 / 3.0) * std::f32::consts::PI * radius.powi(3);
                Some((mass, Vec3::splat(0.4 * mass * radius * radius)))
            }
            Shape::Box { half_extents } => {
                let size = *half_extents * 2.0;
                let mass = density * size.x * size.y * size.z;
                let factor = mass / 12.0;
                Some((
                    mass,
                    Vec3::new(
                        factor * (size.y * size.y + size.z * size.z),
                        factor * (size.x * size.x + size.z * size.z),
                        factor * (size.x * size.x + size.y * size.y),
                    ),
                ))
            }
            Shape::TriangleMesh(_) => None,
        }
    }

    pub fn triangle_count(&self) -> usize {
        match self {
            Shape::TriangleMesh(mesh) => mesh.triangle_count(),
            _ => 0,
        }
    }

    pub fn is_mesh(&self) -> bool {
        matches!(self, Shape::TriangleMesh(_))
    }
}

/// Box shape from host-space half extents
pub fn box_shape(half_extents_host: Vec3) -> SharedShape {
    Shape::cuboid(to_physics(half_extents_host).abs())
}

/// Sphere shape from a host-space radius
pub fn sphere_shape(radius_host: f32) -> SharedShape {
    Shape::sphere(length_to_physics(radius_host))
}

/// Friction and restitution of a surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsMaterial {
    pub friction: f32,
    pub restitution: f32,
}

impl PhysicsMaterial {
    pub fn new(friction: f32, restitution: f32) -> Self {
        Self {
            friction,
            restitution,
        }
    }

    /// Geometric mean friction, maximum restitution
    pub fn combine(&self, other: &PhysicsMaterial) -> PhysicsMaterial {
        PhysicsMaterial {
            friction: (self.friction * other.friction).max(0.0).sqrt(),
            restitution: self.restitution.max(other.restitution),
        }
    }
}

impl Default for PhysicsMaterial {
    fn default() -> Self {
        Self {
            friction: 0.2,
            restitution: 0.0,
        }
    }
}

const LEAF_SIZE: usize = 4;
const BVH_STACK_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
struct BvhNode {
    bounds: Aabb,
    /// First entry in the triangle order for leaves
    first: u32,
    /// Triangle count; zero marks an inner node whose left child follows it
    count: u32,
    right: u32,
}

/// Immutable triangle soup with a bounding volume hierarchy
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleMesh {
    vertices: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
    order: Vec<u32>,
    nodes: Vec<BvhNode>,
}

impl TriangleMesh {
    /// Build a mesh; every index must reference an entry of `vertices`
    pub fn new(vertices: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> Self {
        let mut mesh = Self {
            vertices,
            triangles,
            order: Vec::new(),
            nodes: Vec::new(),
        };
        mesh.build_bvh();
        mesh
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    /// Corner positions of one triangle
    pub fn triangle(&self, index: usize) -> [Vec3; 3] {
        let [a, b, c] = self.triangles[index];
        [
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        ]
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map(|node| node.bounds).unwrap_or(Aabb {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        })
    }

    /// Call `f` with every triangle whose bounds overlap `aabb` (local space)
    pub fn for_each_overlapping(&self, aabb: &Aabb, mut f: impl FnMut(usize)) {
        if self.nodes.is_empty() {
            return;
        }
        // Median splits keep the tree depth under log2(triangles) + 1
        let mut stack = [0u32; BVH_STACK_DEPTH];
        let mut len = 1;
        while len > 0 {
            len -= 1;
            let index = stack[len];
            let node = &self.nodes[index as usize];
            if !node.bounds.overlaps(aabb) {
                continue;
            }
            if node.count > 0 {
                let start = node.first as usize;
                for &triangle in &self.order[start..start + node.count as usize] {
                    f(triangle as usize);
                }
            } else {
                stack[len] = index + 1;
                stack[len + 1] = node.right;
                len += 2;
            }
        }
    }

    fn build_bvh(&mut self) {
        if self.triangles.is_empty() {
            return;
        }
        let bounds: Vec<Aabb> = (0..self.triangles.len())
            .map(|i| Aabb::from_points(&self.triangle(i)))
            .collect();
        let centroids: Vec<Vec3> = bounds.iter().map(Aabb::center).collect();

        let mut order: Vec<u32> = (0..self.triangles.len() as u32).collect();
        let mut nodes = Vec::with_capacity(2 * self.triangles.len() / LEAF_SIZE + 1);
        build_node(&mut nodes, &mut order, 0, &bounds, &centroids);

        self.order = order;
        self.nodes = nodes;
    }
}

fn build_node(
    nodes: &mut Vec<BvhNode>,
    order: &mut [u32],
    offset: usize,
    bounds: &[Aabb],
    centroids: &[Vec3],
) -> u32 {
    let node_bounds = order
        .iter()
        .fold(Aabb::EMPTY, |acc, &t| acc.merge(&bounds[t as usize]));
    let index = nodes.len() as u32;

    if order.len() <= LEAF_SIZE {
        nodes.push(BvhNode {
            bounds: node_bounds,
            first: offset as u32,
            count: order.len() as u32,
            right: 0,
        });
        return index;
    }

    // Split at the median centroid along the widest axis
    let centroid_bounds = order.iter().fold(Aabb::EMPTY, |mut acc, &t| {
        acc.expand_to_include(centroids[t as usize]);
        acc
    });
    let extent = centroid_bounds.max - centroid_bounds.min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };

    nodes.push(BvhNode {
        bounds: node_bounds,
        first: 0,
        count: 0,
        right: 0,
    });

    let mid = order.len() / 2;
    order.select_nth_unstable_by(mid, |a, b| {
        centroids[*a as usize][axis]
            .partial_cmp(&centroids[*b as usize][axis])
            .unwrap_or(Ordering::Equal)
    });
    let (left, right) = order.split_at_mut(mid);
    build_node(nodes, left, offset, bounds, centroids);
    let right_index = build_node(nodes, right, offset + mid, bounds, centroids);
    nodes[index as usize].right = right_index;

    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_mesh(cells: u32) -> TriangleMesh {
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for z in 0..=cells {
            for x in 0..=cells {
                vertices.push(Vec3::new(x as f32, 0.0, z as f32));
            }
        }
        let row = cells + 1;
        for z in 0..cells {
            for x in 0..cells {
                let i = z * row + x;
                triangles.push([i, i + row, i + 1]);
                triangles.push([i + 1, i + row, i + row + 1]);
            }
        }
        TriangleMesh::new(vertices, triangles)
    }

    #[test]
    fn test_sphere_mass_properties() {
        let (mass, inertia) = Shape::Sphere { radius: 1.0 }.mass_properties(1.0).unwrap();
        let expected = (4.0 / 3.0) * std::f32::consts::PI;
        assert!((mass - expected).abs() < 1e-5);
        assert!((inertia.x - 0.4 * expected).abs() < 1e-5);
    }

    #[test]
    fn test_box_mass_properties() {
        let (mass, inertia) = Shape::Box {
            half_extents: Vec3::new(1.0, 2.0, 3.0),
        }
        .mass_properties(2.0)
        .unwrap();
        assert!((mass - 96.0).abs() < 1e-4);
        assert!((inertia.x - 96.0 / 12.0 * (16.0 + 36.0)).abs() < 1e-3);
    }

    #[test]
    fn test_mesh_has_no_mass() {
        let mesh = grid_mesh(1);
        assert!(Shape::TriangleMesh(mesh).mass_properties(1000.0).is_none());
    }

    #[test]
    fn test_bvh_query_matches_brute_force() {
        let mesh = grid_mesh(8);
        assert_eq!(mesh.triangle_count(), 128);

        let query = Aabb::new(Vec3::new(2.2, -0.1, 3.1), Vec3::new(3.8, 0.1, 4.9));
        let mut found = Vec::new();
        mesh.for_each_overlapping(&query, |t| found.push(t));
        found.sort_unstable();

        let expected: Vec<usize> = (0..mesh.triangle_count())
            .filter(|&t| Aabb::from_points(&mesh.triangle(t)).overlaps(&query))
            .collect();
        assert_eq!(found, expected);
        assert!(!found.is_empty());
    }

    #[test]
    fn test_mesh_bounds() {
        let mesh = grid_mesh(4);
        let bounds = mesh.bounds();
        assert_eq!(bounds.min, Vec3::ZERO);
        assert_eq!(bounds.max, Vec3::new(4.0, 0.0, 4.0));
    }

    #[test]
    fn test_host_shape_factory_converts_units() {
        let sphere = sphere_shape(39.370_08);
        match sphere.as_ref() {
            Shape::Sphere { radius } => assert!((radius - 1.0).abs() < 1e-4),
            other => panic!("unexpected shape {other:?}"),
        }

        // Host Z (up) becomes simulation Y
        let slab = box_shape(Vec3::new(100.0, 200.0, 10.0));
        match slab.as_ref() {
            Shape::Box { half_extents } => {
                assert!((*half_extents - Vec3::new(2.54, 0.254, 5.08)).length() < 1e-4)
            }
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_material_combine() {
        let ice = PhysicsMaterial::new(0.04, 0.1);
        let rubber = PhysicsMaterial::new(1.0, 0.8);
        let combined = ice.combine(&rubber);
        assert!((combined.friction - 0.2).abs() < 1e-6);
        assert_eq!(combined.restitution, 0.8);
    }
}
