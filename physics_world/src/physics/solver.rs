//! Sequential impulse solver with sleeping
//!
//! Bodies are copied into a flat array at the start of each update, stepped
//! there, and written back once the whole update has succeeded.

use crate::config::PhysicsConfig;
use crate::physics::body::{Body, BodyHandle};
use crate::physics::collision::narrow_phase::CollisionObject;
use crate::physics::collision::{Aabb, Contact};
use crate::physics::layers::ObjectLayer;
use crate::physics::shapes::{PhysicsMaterial, SharedShape};
use glam::{Mat3, Quat, Vec3};
use rayon::prelude::*;

/// A body as seen by one update
#[derive(Debug, Clone)]
pub(crate) struct SolverBody {
    pub handle: BodyHandle,
    pub shape: SharedShape,
    pub layer: ObjectLayer,
    pub dynamic: bool,
    pub active: bool,
    pub allow_sleeping: bool,
    pub sleep_timer: f32,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inv_mass: f32,
    pub inv_inertia_local: Vec3,
    pub inv_inertia_world: Mat3,
    pub material: PhysicsMaterial,
    pub aabb: Aabb,
    /// Lives in the non-moving broad-phase group
    pub static_group: bool,
}

impl SolverBody {
    pub fn from_body(handle: BodyHandle, body: &Body, static_group: bool) -> Self {
        let mut solver_body = Self {
            handle,
            shape: body.shape.clone(),
            layer: body.layer,
            dynamic: body.is_dynamic(),
            active: body.active,
            allow_sleeping: body.allow_sleeping,
            sleep_timer: body.sleep_timer,
            position: body.position,
            rotation: body.rotation,
            linear_velocity: body.linear_velocity,
            angular_velocity: body.angular_velocity,
            inv_mass: body.inv_mass,
            inv_inertia_local: body.inv_inertia_local,
            inv_inertia_world: Mat3::ZERO,
            material: body.material,
            aabb: body.shape.world_aabb(body.position, body.rotation),
            static_group,
        };
        solver_body.update_inv_inertia_world();
        solver_body
    }

    /// Dynamic and awake
    #[inline]
    pub fn is_simulated(&self) -> bool {
        self.dynamic && self.active
    }

    pub fn update_inv_inertia_world(&mut self) {
        let rotation = Mat3::from_quat(self.rotation);
        self.inv_inertia_world =
            rotation * Mat3::from_diagonal(self.inv_inertia_local) * rotation.transpose();
    }

    pub fn refresh_aabb(&mut self, margin: f32) {
        self.aabb = self
            .shape
            .world_aabb(self.position, self.rotation)
            .expanded(margin);
    }

    pub fn collision_object(&self, index: usize) -> CollisionObject<'_> {
        CollisionObject {
            index,
            shape: self.shape.as_ref(),
            position: self.position,
            rotation: self.rotation,
        }
    }

    /// Moving fast enough to disturb a sleeping neighbour
    pub fn is_moving(&self, threshold: f32) -> bool {
        self.linear_velocity.length_squared() > threshold * threshold
            || self.angular_velocity.length_squared() > threshold * threshold
    }

    pub fn wake(&mut self) {
        self.active = true;
        self.sleep_timer = 0.0;
        self.update_inv_inertia_world();
    }

    /// Non-simulated bodies act as infinitely heavy
    fn effective_inverse_mass(&self) -> (f32, Mat3) {
        if self.is_simulated() {
            (self.inv_mass, self.inv_inertia_world)
        } else {
            (0.0, Mat3::ZERO)
        }
    }

    #[inline]
    fn velocity_at(&self, r: Vec3) -> Vec3 {
        self.linear_velocity + self.angular_velocity.cross(r)
    }
}

/// Apply gravity and damping, then clamp velocities
pub(crate) fn integrate_velocities(
    bodies: &mut [SolverBody],
    gravity: Vec3,
    config: &PhysicsConfig,
    dt: f32,
) {
    let linear_damping_factor = (1.0 - config.linear_damping * dt).max(0.0);
    let angular_damping_factor = (1.0 - config.angular_damping * dt).max(0.0);

    bodies
        .par_iter_mut()
        .filter(|body| body.is_simulated())
        .for_each(|body| {
            body.linear_velocity += gravity * dt;
            body.linear_velocity *= linear_damping_factor;
            body.angular_velocity *= angular_damping_factor;

            body.linear_velocity = body
                .linear_velocity
                .clamp_length_max(config.max_linear_velocity);
            body.angular_velocity = body
                .angular_velocity
                .clamp_length_max(config.max_angular_velocity);

            body.update_inv_inertia_world();
        });
}

/// Advance positions and rotations from the solved velocities
pub(crate) fn integrate_positions(bodies: &mut [SolverBody], dt: f32) {
    bodies
        .par_iter_mut()
        .filter(|body| body.is_simulated())
        .for_each(|body| {
            body.position += body.linear_velocity * dt;

            let omega = body.angular_velocity;
            let dq = Quat::from_xyzw(omega.x, omega.y, omega.z, 0.0) * body.rotation;
            body.rotation = (body.rotation + dq * (0.5 * dt)).normalize();
        });
}

/// Contact prepared for the velocity solver
#[derive(Debug, Clone)]
pub(crate) struct ContactConstraint {
    a: usize,
    b: usize,
    normal: Vec3,
    tangent: Vec3,
    bitangent: Vec3,
    r_a: Vec3,
    r_b: Vec3,
    inv_mass_a: f32,
    inv_mass_b: f32,
    inv_inertia_a: Mat3,
    inv_inertia_b: Mat3,
    normal_mass: f32,
    tangent_mass: f32,
    bitangent_mass: f32,
    velocity_bias: f32,
    friction: f32,
    normal_impulse: f32,
    tangent_impulse: f32,
    bitangent_impulse: f32,
}

impl ContactConstraint {
    fn effective_mass(&self, direction: Vec3) -> f32 {
        let ra_n = self.r_a.cross(direction);
        let rb_n = self.r_b.cross(direction);
        let k = self.inv_mass_a
            + self.inv_mass_b
            + (self.inv_inertia_a * ra_n).dot(ra_n)
            + (self.inv_inertia_b * rb_n).dot(rb_n);
        if k > 0.0 {
            1.0 / k
        } else {
            0.0
        }
    }
}

/// Build solver constraints for contacts involving at least one awake body
pub(crate) fn prepare_contacts(
    bodies: &[SolverBody],
    contacts: &[Contact],
    config: &PhysicsConfig,
    dt: f32,
    constraints: &mut Vec<ContactConstraint>,
) {
    for contact in contacts {
        let a = &bodies[contact.body_a];
        let b = &bodies[contact.body_b];
        if !a.is_simulated() && !b.is_simulated() {
            continue;
        }

        let (inv_mass_a, inv_inertia_a) = a.effective_inverse_mass();
        let (inv_mass_b, inv_inertia_b) = b.effective_inverse_mass();
        let r_a = contact.position - a.position;
        let r_b = contact.position - b.position;
        let material = a.material.combine(&b.material);

        let mut constraint = ContactConstraint {
            a: contact.body_a,
            b: contact.body_b,
            normal: contact.normal,
            tangent: contact.tangent,
            bitangent: contact.bitangent,
            r_a,
            r_b,
            inv_mass_a,
            inv_mass_b,
            inv_inertia_a,
            inv_inertia_b,
            normal_mass: 0.0,
            tangent_mass: 0.0,
            bitangent_mass: 0.0,
            velocity_bias: 0.0,
            friction: material.friction,
            normal_impulse: 0.0,
            tangent_impulse: 0.0,
            bitangent_impulse: 0.0,
        };
        constraint.normal_mass = constraint.effective_mass(contact.normal);
        constraint.tangent_mass = constraint.effective_mass(contact.tangent);
        constraint.bitangent_mass = constraint.effective_mass(contact.bitangent);

        // Baumgarte stabilization
        let mut bias = config.baumgarte / dt * (contact.penetration - config.penetration_slop).max(0.0);

        let approach = (b.velocity_at(r_b) - a.velocity_at(r_a)).dot(contact.normal);
        if approach < -config.restitution_threshold {
            bias = bias.max(-material.restitution * approach);
        }
        constraint.velocity_bias = bias;

        constraints.push(constraint);
    }
}

/// Iteratively resolve contact impulses
pub(crate) fn solve_contacts(
    bodies: &mut [SolverBody],
    constraints: &mut [ContactConstraint],
    iterations: u32,
) {
    for _ in 0..iterations {
        for constraint in constraints.iter_mut() {
            let (a, b) = pair_mut(bodies, constraint.a, constraint.b);
            solve_friction(a, b, constraint);
            solve_normal(a, b, constraint);
        }
    }
}

fn solve_normal(a: &mut SolverBody, b: &mut SolverBody, c: &mut ContactConstraint) {
    let relative = b.velocity_at(c.r_b) - a.velocity_at(c.r_a);
    let velocity_along_normal = relative.dot(c.normal);

    let lambda = c.normal_mass * (c.velocity_bias - velocity_along_normal);
    let accumulated = (c.normal_impulse + lambda).max(0.0);
    let delta = accumulated - c.normal_impulse;
    c.normal_impulse = accumulated;

    apply_impulse(a, b, c, c.normal * delta);
}

fn solve_friction(a: &mut SolverBody, b: &mut SolverBody, c: &mut ContactConstraint) {
    // Coulomb cone approximated per axis
    let max_friction = c.friction * c.normal_impulse;
    c.tangent_impulse = solve_tangent(
        a,
        b,
        c,
        c.tangent,
        c.tangent_mass,
        c.tangent_impulse,
        max_friction,
    );
    c.bitangent_impulse = solve_tangent(
        a,
        b,
        c,
        c.bitangent,
        c.bitangent_mass,
        c.bitangent_impulse,
        max_friction,
    );
}

#[allow(clippy::too_many_arguments)]
fn solve_tangent(
    a: &mut SolverBody,
    b: &mut SolverBody,
    c: &ContactConstraint,
    direction: Vec3,
    mass: f32,
    accumulated: f32,
    max_friction: f32,
) -> f32 {
    let relative = b.velocity_at(c.r_b) - a.velocity_at(c.r_a);
    let lambda = -mass * relative.dot(direction);
    let clamped = (accumulated + lambda).clamp(-max_friction, max_friction);
    apply_impulse(a, b, c, direction * (clamped - accumulated));
    clamped
}

fn apply_impulse(a: &mut SolverBody, b: &mut SolverBody, c: &ContactConstraint, impulse: Vec3) {
    a.linear_velocity -= impulse * c.inv_mass_a;
    a.angular_velocity -= c.inv_inertia_a * c.r_a.cross(impulse);
    b.linear_velocity += impulse * c.inv_mass_b;
    b.angular_velocity += c.inv_inertia_b * c.r_b.cross(impulse);
}

fn pair_mut(bodies: &mut [SolverBody], i: usize, j: usize) -> (&mut SolverBody, &mut SolverBody) {
    if i < j {
        let (left, right) = bodies.split_at_mut(j);
        (&mut left[i], &mut right[0])
    } else {
        let (left, right) = bodies.split_at_mut(i);
        (&mut right[0], &mut left[j])
    }
}

/// Put bodies to sleep once they have rested long enough
///
/// `fell_asleep` is called with each body that falls asleep during this sub-step.
pub(crate) fn update_sleep_state(
    bodies: &mut [SolverBody],
    config: &PhysicsConfig,
    dt: f32,
    mut fell_asleep: impl FnMut(BodyHandle),
) {
    let threshold = config.sleep_velocity_threshold;

    for body in bodies.iter_mut() {
        if !body.is_simulated() || !body.allow_sleeping {
            continue;
        }
        if body.is_moving(threshold) {
            body.sleep_timer = 0.0;
            continue;
        }

        body.sleep_timer += dt;
        if body.sleep_timer >= config.time_before_sleep {
            body.active = false;
            body.sleep_timer = 0.0;
            body.linear_velocity = Vec3::ZERO;
            body.angular_velocity = Vec3::ZERO;
            fell_asleep(body.handle);
        }
    }
}
