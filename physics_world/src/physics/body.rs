//! Body handles, creation settings and the stored body component

use crate::physics::layers::ObjectLayer;
use crate::physics::shapes::{PhysicsMaterial, SharedShape};
use glam::{Quat, Vec3};
use hecs::Entity;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Opaque identity of a body in a [`PhysicsWorld`](crate::physics::PhysicsWorld)
///
/// Handles are generational: once a body is destroyed its handle is
/// rejected with `InvalidHandle` even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHandle(Entity);

impl BodyHandle {
    pub(crate) fn from_entity(entity: Entity) -> Self {
        Self(entity)
    }

    pub(crate) fn entity(self) -> Entity {
        self.0
    }

    /// Stable key used to order bodies within a step
    pub(crate) fn sort_key(self) -> u64 {
        self.0.to_bits().get()
    }
}

impl PartialOrd for BodyHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BodyHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// How a body moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionType {
    /// Immovable; only takes part in collision
    Static,
    /// Integrated by the simulation
    Dynamic,
}

/// Whether a body starts simulating when added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Activate,
    /// Sleep until disturbed or explicitly activated
    DontActivate,
}

/// Everything needed to create a body; position, rotation and velocities
/// are in host space
#[derive(Debug, Clone)]
pub struct BodyCreationSettings {
    pub shape: SharedShape,
    pub position: Vec3,
    pub rotation: Quat,
    pub motion_type: MotionType,
    pub layer: ObjectLayer,
    pub linear_velocity: Vec3,
    /// Radians per second about host axes
    pub angular_velocity: Vec3,
    /// Falls back to the world's default material
    pub material: Option<PhysicsMaterial>,
    /// Overrides the mass derived from shape volume and density
    pub mass: Option<f32>,
    pub allow_sleeping: bool,
}

impl BodyCreationSettings {
    pub fn new(
        shape: SharedShape,
        position: Vec3,
        rotation: Quat,
        motion_type: MotionType,
        layer: ObjectLayer,
    ) -> Self {
        Self {
            shape,
            position,
            rotation,
            motion_type,
            layer,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            material: None,
            mass: None,
            allow_sleeping: true,
        }
    }

    /// Static body on the non-moving layer
    pub fn fixed(shape: SharedShape, position: Vec3, rotation: Quat) -> Self {
        Self::new(shape, position, rotation, MotionType::Static, ObjectLayer::NonMoving)
    }

    /// Dynamic body on the moving layer
    pub fn dynamic(shape: SharedShape, position: Vec3, rotation: Quat) -> Self {
        Self::new(shape, position, rotation, MotionType::Dynamic, ObjectLayer::Moving)
    }

    pub fn with_linear_velocity(mut self, velocity: Vec3) -> Self {
        self.linear_velocity = velocity;
        self
    }

    pub fn with_angular_velocity(mut self, velocity: Vec3) -> Self {
        self.angular_velocity = velocity;
        self
    }

    pub fn with_material(mut self, material: PhysicsMaterial) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_mass(mut self, mass: f32) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn with_allow_sleeping(mut self, allow_sleeping: bool) -> Self {
        self.allow_sleeping = allow_sleeping;
        self
    }
}

/// Body state stored in the world, in simulation space
#[derive(Debug, Clone)]
pub(crate) struct Body {
    pub shape: SharedShape,
    pub motion_type: MotionType,
    pub layer: ObjectLayer,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inv_mass: f32,
    /// Inverse principal inertia in body space
    pub inv_inertia_local: Vec3,
    pub material: PhysicsMaterial,
    pub allow_sleeping: bool,
    /// Added to the simulation (first phase of the two-phase lifecycle)
    pub in_simulation: bool,
    pub active: bool,
    /// Seconds spent below the sleep threshold
    pub sleep_timer: f32,
}

impl Body {
    pub fn is_dynamic(&self) -> bool {
        self.motion_type == MotionType::Dynamic
    }

    /// Mass in kilograms; infinite for static bodies
    pub fn mass(&self) -> f32 {
        if self.inv_mass > 0.0 {
            1.0 / self.inv_mass
        } else {
            f32::INFINITY
        }
    }
}

/// Inverse mass and inverse principal inertia for a dynamic body
pub(crate) fn inverse_mass_properties(
    shape: &SharedShape,
    density: f32,
    mass_override: Option<f32>,
) -> Option<(f32, Vec3)> {
    let (mass, inertia) = shape.mass_properties(density)?;
    let (mass, inertia) = match mass_override {
        Some(target) if mass > 0.0 => (target, inertia * (target / mass)),
        _ => (mass, inertia),
    };
    if mass <= 0.0 {
        return None;
    }
    let inv_inertia = Vec3::new(
        recip_or_zero(inertia.x),
        recip_or_zero(inertia.y),
        recip_or_zero(inertia.z),
    );
    Some((1.0 / mass, inv_inertia))
}

fn recip_or_zero(value: f32) -> f32 {
    if value > 0.0 {
        1.0 / value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::shapes::Shape;

    #[test]
    fn test_handles_order_by_entity() {
        let mut world = hecs::World::new();
        let a = BodyHandle::from_entity(world.spawn(()));
        let b = BodyHandle::from_entity(world.spawn(()));
        assert!(a < b);
        assert_eq!(a.entity(), a.0);
    }

    #[test]
    fn test_mass_override_scales_inertia() {
        let shape = Shape::sphere(0.5);
        let (inv_mass, inv_inertia) = inverse_mass_properties(&shape, 1000.0, Some(2.0)).unwrap();
        assert!((inv_mass - 0.5).abs() < 1e-6);
        // I = 0.4 * m * r^2 = 0.2
        assert!((inv_inertia.x - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_builder_defaults() {
        let settings = BodyCreationSettings::dynamic(Shape::sphere(1.0), Vec3::ZERO, Quat::IDENTITY)
            .with_linear_velocity(Vec3::X);
        assert_eq!(settings.layer, ObjectLayer::Moving);
        assert_eq!(settings.motion_type, MotionType::Dynamic);
        assert!(settings.allow_sleeping);
        assert_eq!(settings.linear_velocity, Vec3::X);
    }
}
