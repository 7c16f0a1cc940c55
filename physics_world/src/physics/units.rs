//! Conversion between host space and simulation space
//!
//! The host uses inches with Z up (X forward, Y left). The simulation uses
//! meters with Y up. Host X maps to simulation X, host Z (up) to simulation
//! Y, and host Y to simulation -Z, which keeps both frames right-handed.

use glam::{Mat3, Quat, Vec3};

/// Meters per host unit (one inch)
pub const HOST_UNITS_TO_METERS: f32 = 0.0254;
pub const METERS_TO_HOST_UNITS: f32 = 1.0 / HOST_UNITS_TO_METERS;

/// Convert a host-space position or direction to simulation space
#[inline]
pub fn to_physics(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.z, -v.y) * HOST_UNITS_TO_METERS
}

/// Convert a simulation-space position or direction to host space
#[inline]
pub fn to_host(v: Vec3) -> Vec3 {
    Vec3::new(v.x, -v.z, v.y) * METERS_TO_HOST_UNITS
}

#[inline]
pub fn length_to_physics(length: f32) -> f32 {
    length * HOST_UNITS_TO_METERS
}

#[inline]
pub fn length_to_host(length: f32) -> f32 {
    length * METERS_TO_HOST_UNITS
}

/// Permute axes without rescaling, for angular velocities and unit normals
#[inline]
pub fn direction_to_physics(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.z, -v.y)
}

#[inline]
pub fn direction_to_host(v: Vec3) -> Vec3 {
    Vec3::new(v.x, -v.z, v.y)
}

/// Axis permutation only; a pure rotation since the scale drops out
fn host_basis() -> Quat {
    Quat::from_mat3(&Mat3::from_cols(Vec3::X, Vec3::NEG_Z, Vec3::Y))
}

/// Re-express a host-space rotation in simulation space
pub fn rotation_to_physics(q: Quat) -> Quat {
    let basis = host_basis();
    (basis * q * basis.conjugate()).normalize()
}

/// Re-express a simulation-space rotation in host space
pub fn rotation_to_host(q: Quat) -> Quat {
    let basis = host_basis();
    (basis.conjugate() * q * basis).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: Vec3, b: Vec3) -> bool {
        let scale = a.abs().max_element().max(b.abs().max_element()).max(1.0);
        (a - b).abs().max_element() <= 1e-4 * scale
    }

    #[test]
    fn test_round_trip() {
        let samples = [
            Vec3::ZERO,
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(-4096.0, 512.5, -0.125),
            Vec3::new(1.0e6, -3.0e5, 7.0e4),
            Vec3::new(1.0e-3, -2.0e-3, 5.0e-4),
        ];
        for v in samples {
            assert!(approx_eq(to_host(to_physics(v)), v), "round trip failed for {v:?}");
            assert!(approx_eq(to_physics(to_host(v)), v), "inverse round trip failed for {v:?}");
        }
    }

    #[test]
    fn test_up_axis_maps_to_vertical() {
        let up = to_physics(Vec3::new(0.0, 0.0, 100.0));
        assert!((up - Vec3::new(0.0, 2.54, 0.0)).length() < 1e-5);

        let forward = to_physics(Vec3::new(100.0, 0.0, 0.0));
        assert!((forward - Vec3::new(2.54, 0.0, 0.0)).length() < 1e-5);

        let left = to_physics(Vec3::new(0.0, 100.0, 0.0));
        assert!((left - Vec3::new(0.0, 0.0, -2.54)).length() < 1e-5);
    }

    #[test]
    fn test_scale_is_exact_reciprocal() {
        assert!((length_to_host(length_to_physics(39.0)) - 39.0).abs() < 1e-4);
        assert!((HOST_UNITS_TO_METERS * METERS_TO_HOST_UNITS - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rotation_matches_vector_mapping() {
        let host_rotation = Quat::from_rotation_z(0.7) * Quat::from_rotation_x(-0.3);
        let v = Vec3::new(10.0, -20.0, 30.0);

        let rotated_then_converted = to_physics(host_rotation * v);
        let converted_then_rotated = rotation_to_physics(host_rotation) * to_physics(v);
        assert!(approx_eq(rotated_then_converted, converted_then_rotated));

        let back = rotation_to_host(rotation_to_physics(host_rotation));
        assert!(back.dot(host_rotation).abs() > 1.0 - 1e-5);
    }

    #[test]
    fn test_direction_matches_rotation_basis() {
        let spin = Vec3::new(0.0, 0.0, 2.0);
        assert_eq!(direction_to_physics(spin), Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(direction_to_host(direction_to_physics(spin)), spin);
    }

    #[test]
    fn test_host_yaw_is_physics_yaw() {
        // Turning around host up is turning around simulation up
        let yaw = rotation_to_physics(Quat::from_rotation_z(1.0));
        let expected = Quat::from_rotation_y(1.0);
        assert!(yaw.dot(expected).abs() > 1.0 - 1e-5);
    }
}
