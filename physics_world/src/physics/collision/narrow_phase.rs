//! Narrow phase collision detection for generating contact points

use super::{Aabb, Contact};
use crate::physics::shapes::{Shape, TriangleMesh};
use glam::{Quat, Vec3};
use std::cmp::Ordering;

/// Margin used when deciding whether a box corner lies inside another box
const CORNER_MARGIN: f32 = 1.0e-3;
/// Contacts closer than this with matching normals are merged
const MERGE_DISTANCE: f32 = 1.0e-3;

/// A shape placed in the world for one collision test
#[derive(Debug, Clone, Copy)]
pub struct CollisionObject<'a> {
    /// Index of the body in the step's body array
    pub index: usize,
    pub shape: &'a Shape,
    pub position: Vec3,
    pub rotation: Quat,
}

/// Test two shapes and append their contacts
///
/// Every contact normal points from `a` to `b`.
pub fn test_collision(a: &CollisionObject, b: &CollisionObject, contacts: &mut Vec<Contact>) {
    let start = contacts.len();
    match (a.shape, b.shape) {
        (Shape::Sphere { radius: radius_a }, Shape::Sphere { radius: radius_b }) => {
            contacts.extend(sphere_sphere_collision(a, *radius_a, b, *radius_b));
        }
        (Shape::Sphere { radius }, Shape::Box { half_extents }) => {
            contacts.extend(sphere_box_collision(a, *radius, b, *half_extents));
        }
        (Shape::Box { half_extents }, Shape::Sphere { radius }) => {
            contacts.extend(sphere_box_collision(b, *radius, a, *half_extents).map(Contact::flipped));
        }
        (Shape::Box { half_extents: extents_a }, Shape::Box { half_extents: extents_b }) => {
            box_box_collision(a, *extents_a, b, *extents_b, contacts);
        }
        (Shape::TriangleMesh(mesh), Shape::Sphere { radius }) => {
            mesh_sphere_collision(mesh, a, b, *radius, contacts);
        }
        (Shape::Sphere { radius }, Shape::TriangleMesh(mesh)) => {
            mesh_sphere_collision(mesh, b, a, *radius, contacts);
            flip_from(contacts, start);
        }
        (Shape::TriangleMesh(mesh), Shape::Box { half_extents }) => {
            mesh_box_collision(mesh, a, b, *half_extents, contacts);
        }
        (Shape::Box { half_extents }, Shape::TriangleMesh(mesh)) => {
            mesh_box_collision(mesh, b, a, *half_extents, contacts);
            flip_from(contacts, start);
        }
        // Meshes are static and never collide with each other
        (Shape::TriangleMesh(_), Shape::TriangleMesh(_)) => {}
    }
}

fn flip_from(contacts: &mut [Contact], start: usize) {
    for contact in &mut contacts[start..] {
        *contact = contact.flipped();
    }
}

/// Test collision between two spheres
fn sphere_sphere_collision(
    a: &CollisionObject,
    radius_a: f32,
    b: &CollisionObject,
    radius_b: f32,
) -> Option<Contact> {
    let delta = b.position - a.position;
    let distance_sq = delta.length_squared();
    let radius_sum = radius_a + radius_b;

    if distance_sq > radius_sum * radius_sum {
        return None;
    }

    let distance = distance_sq.sqrt();
    let normal = if distance > 0.0 {
        delta / distance
    } else {
        // Spheres are at the same position, use arbitrary normal
        Vec3::Y
    };

    let penetration = radius_sum - distance;
    let contact_point = a.position + normal * (radius_a - penetration * 0.5);

    Some(Contact::new(a.index, b.index, contact_point, normal, penetration))
}

/// Test collision between a sphere and a box; the normal points sphere to box
fn sphere_box_collision(
    sphere: &CollisionObject,
    sphere_radius: f32,
    cuboid: &CollisionObject,
    box_half_extents: Vec3,
) -> Option<Contact> {
    // Transform sphere to box's local space
    let local_sphere_pos = cuboid.rotation.conjugate() * (sphere.position - cuboid.position);

    // Find closest point on box to sphere center
    let closest = local_sphere_pos.clamp(-box_half_extents, box_half_extents);

    let delta = local_sphere_pos - closest;
    let distance_sq = delta.length_squared();

    if distance_sq > sphere_radius * sphere_radius {
        return None;
    }

    let distance = distance_sq.sqrt();
    let (local_normal, penetration) = if distance > 0.0 {
        (delta / distance, sphere_radius - distance)
    } else {
        // Sphere center is inside box, push out through the closest face
        let face_distances = [
            (
                box_half_extents.x - local_sphere_pos.x.abs(),
                Vec3::X * local_sphere_pos.x.signum(),
            ),
            (
                box_half_extents.y - local_sphere_pos.y.abs(),
                Vec3::Y * local_sphere_pos.y.signum(),
            ),
            (
                box_half_extents.z - local_sphere_pos.z.abs(),
                Vec3::Z * local_sphere_pos.z.signum(),
            ),
        ];
        let (depth, normal) = face_distances
            .into_iter()
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
            .unwrap_or((0.0, Vec3::Y));
        (normal, sphere_radius + depth)
    };

    // Normal out of the box, towards the sphere
    let world_normal = cuboid.rotation * local_normal;
    let contact_point = sphere.position - world_normal * sphere_radius;

    Some(Contact::new(
        sphere.index,
        cuboid.index,
        contact_point,
        -world_normal,
        penetration,
    ))
}

/// Test collision between two boxes using SAT (Separating Axis Theorem)
fn box_box_collision(
    a: &CollisionObject,
    extents_a: Vec3,
    b: &CollisionObject,
    extents_b: Vec3,
    contacts: &mut Vec<Contact>,
) {
    let axes_a = [a.rotation * Vec3::X, a.rotation * Vec3::Y, a.rotation * Vec3::Z];
    let axes_b = [b.rotation * Vec3::X, b.rotation * Vec3::Y, b.rotation * Vec3::Z];

    let center_delta = b.position - a.position;

    let mut min_penetration = f32::MAX;
    let mut best_axis = Vec3::ZERO;

    let mut candidate_axes = [Vec3::ZERO; 15];
    candidate_axes[..3].copy_from_slice(&axes_a);
    candidate_axes[3..6].copy_from_slice(&axes_b);
    for i in 0..3 {
        for j in 0..3 {
            candidate_axes[6 + i * 3 + j] = axes_a[i].cross(axes_b[j]);
        }
    }

    for axis in candidate_axes {
        if axis.length_squared() < 1e-6 {
            continue; // Parallel edges
        }
        let axis = axis.normalize();
        let Some((penetration, flip)) =
            test_separation_axis(axis, center_delta, extents_a, extents_b, &axes_a, &axes_b)
        else {
            return; // Separated along this axis
        };

        // Face axes win ties so resting boxes get a face normal
        if penetration < min_penetration - 1e-5 {
            min_penetration = penetration;
            best_axis = if flip { -axis } else { axis };
        }
    }

    let start = contacts.len();

    // Corners of B inside A, then corners of A inside B
    for corner in box_corners(b.position, &axes_b, extents_b) {
        if point_in_box(corner, a.position, &axes_a, extents_a) {
            push_merged(
                contacts,
                start,
                Contact::new(a.index, b.index, corner, best_axis, min_penetration),
            );
        }
    }
    for corner in box_corners(a.position, &axes_a, extents_a) {
        if point_in_box(corner, b.position, &axes_b, extents_b) {
            push_merged(
                contacts,
                start,
                Contact::new(a.index, b.index, corner, best_axis, min_penetration),
            );
        }
    }

    if contacts.len() == start {
        // Edge-edge: use the deepest points of both boxes
        let support_a = get_box_support_point(a.position, &axes_a, extents_a, best_axis);
        let support_b = get_box_support_point(b.position, &axes_b, extents_b, -best_axis);
        contacts.push(Contact::new(
            a.index,
            b.index,
            (support_a + support_b) * 0.5,
            best_axis,
            min_penetration,
        ));
    }
}

/// Test a separation axis for the SAT algorithm
fn test_separation_axis(
    axis: Vec3,
    center_delta: Vec3,
    extents_a: Vec3,
    extents_b: Vec3,
    axes_a: &[Vec3; 3],
    axes_b: &[Vec3; 3],
) -> Option<(f32, bool)> {
    let separation = center_delta.dot(axis);

    let radius_a = extents_a.x * axes_a[0].dot(axis).abs()
        + extents_a.y * axes_a[1].dot(axis).abs()
        + extents_a.z * axes_a[2].dot(axis).abs();

    let radius_b = extents_b.x * axes_b[0].dot(axis).abs()
        + extents_b.y * axes_b[1].dot(axis).abs()
        + extents_b.z * axes_b[2].dot(axis).abs();

    let penetration = radius_a + radius_b - separation.abs();

    if penetration < 0.0 {
        None
    } else {
        Some((penetration, separation < 0.0))
    }
}

/// Get the support point of a box in a given direction
fn get_box_support_point(center: Vec3, axes: &[Vec3; 3], extents: Vec3, direction: Vec3) -> Vec3 {
    let mut support = center;
    for (axis, extent) in axes.iter().zip(extents.to_array()) {
        if axis.dot(direction) > 0.0 {
            support += *axis * extent;
        } else {
            support -= *axis * extent;
        }
    }
    support
}

fn box_corners(center: Vec3, axes: &[Vec3; 3], extents: Vec3) -> [Vec3; 8] {
    let mut corners = [Vec3::ZERO; 8];
    for (i, corner) in corners.iter_mut().enumerate() {
        let sx = if i & 1 == 0 { -1.0 } else { 1.0 };
        let sy = if i & 2 == 0 { -1.0 } else { 1.0 };
        let sz = if i & 4 == 0 { -1.0 } else { 1.0 };
        *corner = center
            + axes[0] * (extents.x * sx)
            + axes[1] * (extents.y * sy)
            + axes[2] * (extents.z * sz);
    }
    corners
}

fn point_in_box(point: Vec3, center: Vec3, axes: &[Vec3; 3], extents: Vec3) -> bool {
    let d = point - center;
    axes.iter()
        .zip(extents.to_array())
        .all(|(axis, extent)| d.dot(*axis).abs() <= extent + CORNER_MARGIN)
}

/// Append a contact unless one with the same normal already sits there,
/// keeping the deeper of the two
fn push_merged(contacts: &mut Vec<Contact>, start: usize, contact: Contact) {
    for existing in &mut contacts[start..] {
        if existing.normal.dot(contact.normal) > 0.999
            && existing.position.distance_squared(contact.position) < MERGE_DISTANCE * MERGE_DISTANCE
        {
            if contact.penetration > existing.penetration {
                *existing = contact;
            }
            return;
        }
    }
    contacts.push(contact);
}

/// Closest point on triangle `abc` to `p`
pub fn closest_point_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Sphere against a static mesh; normals point mesh to sphere
fn mesh_sphere_collision(
    mesh: &TriangleMesh,
    mesh_object: &CollisionObject,
    sphere: &CollisionObject,
    radius: f32,
    contacts: &mut Vec<Contact>,
) {
    let inverse = mesh_object.rotation.conjugate();
    let center = inverse * (sphere.position - mesh_object.position);
    let query = Aabb::from_center_half_extents(center, Vec3::splat(radius));
    let start = contacts.len();

    mesh.for_each_overlapping(&query, |triangle| {
        let [a, b, c] = mesh.triangle(triangle);
        let face = (b - a).cross(c - a);
        if face.length_squared() < 1e-12 {
            return;
        }

        let closest = closest_point_on_triangle(center, a, b, c);
        let delta = center - closest;
        let distance_sq = delta.length_squared();
        if distance_sq > radius * radius {
            return;
        }

        let distance = distance_sq.sqrt();
        let local_normal = if distance > 1e-6 {
            delta / distance
        } else {
            let face = face.normalize();
            if face.dot(center - a) < 0.0 {
                -face
            } else {
                face
            }
        };

        let normal = mesh_object.rotation * local_normal;
        let contact = Contact::new(
            mesh_object.index,
            sphere.index,
            mesh_object.position + mesh_object.rotation * closest,
            normal,
            radius - distance,
        );

        // One contact per direction; shared edges report the same push
        match contacts[start..]
            .iter_mut()
            .find(|existing| existing.normal.dot(normal) > 0.999)
        {
            Some(existing) if contact.penetration > existing.penetration => *existing = contact,
            Some(_) => {}
            None => contacts.push(contact),
        }
    });
}

/// Box against a static mesh; normals point mesh to box
fn mesh_box_collision(
    mesh: &TriangleMesh,
    mesh_object: &CollisionObject,
    cuboid: &CollisionObject,
    half_extents: Vec3,
    contacts: &mut Vec<Contact>,
) {
    let inverse = mesh_object.rotation.conjugate();
    let center = inverse * (cuboid.position - mesh_object.position);
    let rotation = inverse * cuboid.rotation;
    let axes = [rotation * Vec3::X, rotation * Vec3::Y, rotation * Vec3::Z];
    let corners = box_corners(center, &axes, half_extents);
    let max_depth = half_extents.length() * 2.0;
    let query = Aabb::from_points(&corners);
    let start = contacts.len();

    let to_world = |contact: Contact| Contact::new(
        contact.body_a,
        contact.body_b,
        mesh_object.position + mesh_object.rotation * contact.position,
        mesh_object.rotation * contact.normal,
        contact.penetration,
    );

    mesh.for_each_overlapping(&query, |triangle| {
        let [a, b, c] = mesh.triangle(triangle);
        let face = (b - a).cross(c - a);
        if face.length_squared() < 1e-12 {
            return;
        }
        let mut normal = face.normalize();
        if normal.dot(center - a) < 0.0 {
            normal = -normal;
        }

        // Box corners below the triangle's plane and over its surface
        for corner in corners {
            let depth = -(corner - a).dot(normal);
            if depth <= 0.0 || depth > max_depth {
                continue;
            }
            let projected = corner + normal * depth;
            if closest_point_on_triangle(projected, a, b, c).distance_squared(projected) > 1e-8 {
                continue;
            }
            push_merged(
                contacts,
                start,
                to_world(Contact::new(
                    mesh_object.index,
                    cuboid.index,
                    projected,
                    normal,
                    depth,
                )),
            );
        }

        // Triangle corners poking into the box
        for vertex in [a, b, c] {
            let d = vertex - center;
            let local = Vec3::new(d.dot(axes[0]), d.dot(axes[1]), d.dot(axes[2]));
            let slack = half_extents - local.abs();
            if slack.min_element() < 0.0 {
                continue;
            }
            let (depth, face_axis) = [
                (slack.x, axes[0] * local.x.signum()),
                (slack.y, axes[1] * local.y.signum()),
                (slack.z, axes[2] * local.z.signum()),
            ]
            .into_iter()
            .min_by(|l, r| l.0.partial_cmp(&r.0).unwrap_or(Ordering::Equal))
            .unwrap_or((0.0, normal));
            push_merged(
                contacts,
                start,
                to_world(Contact::new(
                    mesh_object.index,
                    cuboid.index,
                    vertex,
                    -face_axis,
                    depth,
                )),
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(index: usize, shape: &Shape, position: Vec3) -> CollisionObject<'_> {
        CollisionObject {
            index,
            shape,
            position,
            rotation: Quat::IDENTITY,
        }
    }

    fn floor_mesh() -> Shape {
        Shape::TriangleMesh(TriangleMesh::new(
            vec![
                Vec3::new(-1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, 1.0),
                Vec3::new(-1.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 3, 2]],
        ))
    }

    #[test]
    fn test_sphere_sphere_collision() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let mut contacts = Vec::new();
        test_collision(
            &object(0, &sphere, Vec3::ZERO),
            &object(1, &sphere, Vec3::new(1.5, 0.0, 0.0)),
            &mut contacts,
        );

        assert_eq!(contacts.len(), 1);
        assert!((contacts[0].penetration - 0.5).abs() < 1e-6);
        assert!((contacts[0].normal - Vec3::X).length() < 1e-6);
    }

    #[test]
    fn test_sphere_box_normal_points_a_to_b() {
        let sphere = Shape::Sphere { radius: 1.0 };
        let cuboid = Shape::Box { half_extents: Vec3::ONE };
        let mut contacts = Vec::new();
        test_collision(
            &object(0, &sphere, Vec3::new(1.5, 0.0, 0.0)),
            &object(1, &cuboid, Vec3::ZERO),
            &mut contacts,
        );
        assert_eq!(contacts.len(), 1);
        assert!(contacts[0].penetration > 0.0);
        assert!((contacts[0].normal + Vec3::X).length() < 1e-6);

        contacts.clear();
        test_collision(
            &object(1, &cuboid, Vec3::ZERO),
            &object(0, &sphere, Vec3::new(1.5, 0.0, 0.0)),
            &mut contacts,
        );
        assert!((contacts[0].normal - Vec3::X).length() < 1e-6);
        assert_eq!(contacts[0].body_a, 1);
    }

    #[test]
    fn test_resting_boxes_get_face_contacts() {
        let floor = Shape::Box {
            half_extents: Vec3::new(5.0, 0.5, 5.0),
        };
        let crate_box = Shape::Box { half_extents: Vec3::splat(0.5) };
        let mut contacts = Vec::new();
        test_collision(
            &object(0, &floor, Vec3::ZERO),
            &object(1, &crate_box, Vec3::new(0.0, 0.99, 0.0)),
            &mut contacts,
        );

        assert_eq!(contacts.len(), 4);
        for contact in &contacts {
            assert!((contact.normal - Vec3::Y).length() < 1e-5);
            assert!((contact.penetration - 0.01).abs() < 1e-4);
        }
    }

    #[test]
    fn test_separated_boxes() {
        let cuboid = Shape::Box { half_extents: Vec3::splat(0.5) };
        let mut contacts = Vec::new();
        test_collision(
            &object(0, &cuboid, Vec3::ZERO),
            &object(1, &cuboid, Vec3::new(0.0, 1.5, 0.0)),
            &mut contacts,
        );
        assert!(contacts.is_empty());
    }

    #[test]
    fn test_sphere_on_mesh_single_contact() {
        let mesh = floor_mesh();
        let sphere = Shape::Sphere { radius: 0.5 };
        let mut contacts = Vec::new();
        // Straddles the shared diagonal of both triangles
        test_collision(
            &object(0, &mesh, Vec3::ZERO),
            &object(1, &sphere, Vec3::new(0.0, 0.45, 0.0)),
            &mut contacts,
        );
        assert_eq!(contacts.len(), 1);
        assert!((contacts[0].normal - Vec3::Y).length() < 1e-5);
        assert!((contacts[0].penetration - 0.05).abs() < 1e-5);

        contacts.clear();
        test_collision(
            &object(1, &sphere, Vec3::new(0.0, 0.45, 0.0)),
            &object(0, &mesh, Vec3::ZERO),
            &mut contacts,
        );
        assert!((contacts[0].normal + Vec3::Y).length() < 1e-5);
        assert_eq!(contacts[0].body_a, 1);
    }

    #[test]
    fn test_sphere_above_mesh() {
        let mesh = floor_mesh();
        let sphere = Shape::Sphere { radius: 0.5 };
        let mut contacts = Vec::new();
        test_collision(
            &object(0, &mesh, Vec3::ZERO),
            &object(1, &sphere, Vec3::new(0.3, 2.0, 0.3)),
            &mut contacts,
        );
        assert!(contacts.is_empty());
    }

    #[test]
    fn test_box_on_mesh() {
        let mesh = floor_mesh();
        let crate_box = Shape::Box { half_extents: Vec3::splat(0.25) };
        let mut contacts = Vec::new();
        test_collision(
            &object(0, &mesh, Vec3::ZERO),
            &object(1, &crate_box, Vec3::new(0.1, 0.24, -0.2)),
            &mut contacts,
        );
        assert_eq!(contacts.len(), 4);
        for contact in &contacts {
            assert!((contact.normal - Vec3::Y).length() < 1e-5);
            assert!((contact.penetration - 0.01).abs() < 1e-4);
        }
    }

    #[test]
    fn test_closest_point_regions() {
        let (a, b, c) = (Vec3::ZERO, Vec3::X, Vec3::Z);
        assert_eq!(closest_point_on_triangle(Vec3::new(-1.0, 0.0, -1.0), a, b, c), a);
        assert_eq!(closest_point_on_triangle(Vec3::new(2.0, 1.0, 0.0), a, b, c), b);
        let inside = closest_point_on_triangle(Vec3::new(0.25, 3.0, 0.25), a, b, c);
        assert!((inside - Vec3::new(0.25, 0.0, 0.25)).length() < 1e-6);
        let edge = closest_point_on_triangle(Vec3::new(0.5, 0.0, -1.0), a, b, c);
        assert!((edge - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-6);
    }
}
