//! The physics world: body storage, host-space queries and the step pipeline
//!
//! Each `update` copies every body in the simulation into a flat array,
//! runs the configured number of collision sub-steps on it, and writes the
//! result back only when all of them succeeded. Listener events gathered
//! along the way are delivered afterwards on the calling thread.

use crate::config::PhysicsConfig;
use crate::physics::body::{
    inverse_mass_properties, Activation, Body, BodyCreationSettings, BodyHandle, MotionType,
};
use crate::physics::collision::broad_phase::{
    sweep_and_prune, BroadPhaseEntry, StaticBroadPhase, SweepBuffers,
};
use crate::physics::collision::{narrow_phase, Contact};
use crate::physics::error::PhysicsError;
use crate::physics::layers::{BroadPhaseLayer, LayerPolicy, ObjectLayer};
use crate::physics::listeners::{
    ActivationListener, ContactListener, ContactManifold, Listeners, PhysicsEvent,
};
use crate::physics::resources::ResourcePool;
use crate::physics::shapes::{PhysicsMaterial, SharedShape};
use crate::physics::solver::{self, ContactConstraint, SolverBody};
use crate::physics::units::{
    direction_to_host, direction_to_physics, rotation_to_host, rotation_to_physics, to_host,
    to_physics,
};
use crate::{physics_assert, physics_trace};
use glam::{Quat, Vec3};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

const NO_INDEX: u32 = u32::MAX;

type ContactKey = (BodyHandle, BodyHandle);

fn manifold_key(manifold: &ContactManifold) -> ContactKey {
    (manifold.body_a, manifold.body_b)
}

/// Summary of one `update`; pair and contact counts are summed over sub-steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    /// Number of completed updates including this one
    pub step: u64,
    pub active_bodies: usize,
    pub body_pairs: usize,
    pub contacts: usize,
    /// Pairs beyond `max_body_pairs`, not tested
    pub dropped_pairs: usize,
    /// Contacts beyond `max_contact_constraints`, not solved
    pub dropped_contacts: usize,
    pub scratch_bytes: usize,
    /// Listener callbacks that panicked
    pub listener_faults: usize,
}

/// Buffers reused by every update; sized at init
///
/// Each update charges what it puts in them to the scratch budget.
#[derive(Debug, Default)]
struct StepBuffers {
    bodies: Vec<SolverBody>,
    /// Entity slot to index in `bodies`
    step_index: Vec<u32>,
    entries: Vec<BroadPhaseEntry>,
    sweep: SweepBuffers,
    /// Never grows past `max_body_pairs`
    pairs: Vec<(usize, usize)>,
    /// Narrow-phase output, one list per pair; lists keep their capacity
    pair_contacts: Vec<Vec<Contact>>,
    contacts: Vec<Contact>,
    constraints: Vec<ContactConstraint>,
    /// Manifolds found this update, tagged with their sub-step
    touching: Vec<(u32, ContactManifold)>,
    /// Swapped with the world's contact set at commit
    next_contacts: Vec<ContactManifold>,
    events: Vec<PhysicsEvent>,
}

impl StepBuffers {
    fn with_capacity(config: &PhysicsConfig) -> Self {
        Self {
            bodies: Vec::with_capacity(config.max_bodies),
            step_index: Vec::with_capacity(config.max_bodies),
            entries: Vec::with_capacity(config.max_bodies),
            sweep: SweepBuffers::with_capacity(config.max_bodies),
            pairs: Vec::with_capacity(config.max_body_pairs),
            pair_contacts: Vec::with_capacity(config.max_body_pairs),
            contacts: Vec::with_capacity(config.max_contact_constraints),
            constraints: Vec::with_capacity(config.max_contact_constraints),
            touching: Vec::with_capacity(config.max_contact_constraints),
            next_contacts: Vec::with_capacity(config.max_contact_constraints),
            events: Vec::with_capacity(config.max_bodies),
        }
    }
}

/// The simulation instance owned by [`PhysicsSystem`](crate::physics::PhysicsSystem)
///
/// Positions, rotations and velocities crossing this API are in host space
/// and converted internally. None of these methods may be called while an
/// `update` is running; `&mut self` enforces that within one thread.
pub struct PhysicsWorld {
    config: PhysicsConfig,
    bodies: hecs::World,
    body_count: usize,
    /// Simulation space
    gravity: Vec3,
    layers: LayerPolicy,
    listeners: Listeners,
    resources: ResourcePool,
    static_bodies: StaticBroadPhase,
    /// Touching pairs, sorted by key
    contacts: Vec<ContactManifold>,
    step_count: u64,
    buffers: StepBuffers,
}

impl PhysicsWorld {
    /// Create a world with its own resource pool and the default policy and listeners
    pub fn new(config: PhysicsConfig) -> Result<Self, PhysicsError> {
        config.validate()?;
        let resources =
            ResourcePool::new(config.temp_allocator_bytes, config.resolved_worker_threads())?;
        Ok(Self::with_parts(
            config,
            resources,
            LayerPolicy::default(),
            Listeners::default(),
        ))
    }

    pub fn with_parts(
        config: PhysicsConfig,
        resources: ResourcePool,
        layers: LayerPolicy,
        listeners: Listeners,
    ) -> Self {
        let gravity = to_physics(Vec3::new(0.0, 0.0, -config.default_gravity));
        let buffers = StepBuffers::with_capacity(&config);

        info!(
            max_bodies = config.max_bodies,
            max_body_pairs = config.max_body_pairs,
            max_contact_constraints = config.max_contact_constraints,
            scratch_bytes = config.temp_allocator_bytes,
            "Physics world created"
        );

        Self {
            config,
            bodies: hecs::World::new(),
            body_count: 0,
            gravity,
            layers,
            listeners,
            resources,
            static_bodies: StaticBroadPhase::new(),
            contacts: Vec::new(),
            step_count: 0,
            buffers,
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn set_activation_listener(&mut self, listener: Box<dyn ActivationListener>) {
        self.listeners.activation = listener;
    }

    pub fn set_contact_listener(&mut self, listener: Box<dyn ContactListener>) {
        self.listeners.contact = listener;
    }

    /// Gravity in host units/s²
    pub fn gravity(&self) -> Vec3 {
        to_host(self.gravity)
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = to_physics(gravity);
        debug!(gravity = ?self.gravity, "Physics gravity set");
    }

    /// Updates completed so far
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Bodies created and not yet destroyed
    pub fn body_count(&self) -> usize {
        self.body_count
    }

    pub fn active_body_count(&self) -> usize {
        self.bodies
            .query::<&Body>()
            .iter()
            .filter(|(_, body)| body.active)
            .count()
    }

    /// Scratch bytes used by the busiest update so far
    pub fn scratch_high_water(&self) -> usize {
        self.resources.scratch.high_water()
    }

    pub fn worker_threads(&self) -> usize {
        self.resources.jobs.thread_count()
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.bodies.contains(handle.entity())
    }

    // ---- body lifecycle ----

    /// Create a body without adding it to the simulation
    pub fn create_body(
        &mut self,
        settings: &BodyCreationSettings,
    ) -> Result<BodyHandle, PhysicsError> {
        let dynamic = settings.motion_type == MotionType::Dynamic;
        if dynamic && settings.shape.is_mesh() {
            return Err(PhysicsError::UnsupportedShape);
        }
        if dynamic && self.in_static_group(settings.layer) {
            return Err(PhysicsError::LayerMotionMismatch);
        }
        if self.body_count >= self.config.max_bodies {
            warn!(capacity = self.config.max_bodies, "Body capacity exhausted");
            return Err(PhysicsError::BodyCapacityExhausted {
                capacity: self.config.max_bodies,
            });
        }

        let (inv_mass, inv_inertia_local) = if dynamic {
            inverse_mass_properties(&settings.shape, self.config.density, settings.mass)
                .ok_or(PhysicsError::UnsupportedShape)?
        } else {
            (0.0, Vec3::ZERO)
        };

        let body = Body {
            shape: settings.shape.clone(),
            motion_type: settings.motion_type,
            layer: settings.layer,
            position: to_physics(settings.position),
            rotation: rotation_to_physics(settings.rotation),
            linear_velocity: to_physics(settings.linear_velocity),
            angular_velocity: direction_to_physics(settings.angular_velocity),
            inv_mass,
            inv_inertia_local,
            material: settings.material.unwrap_or(PhysicsMaterial::new(
                self.config.default_friction,
                self.config.default_restitution,
            )),
            allow_sleeping: settings.allow_sleeping,
            in_simulation: false,
            active: false,
            sleep_timer: 0.0,
        };

        let entity = self.bodies.spawn((body,));
        self.body_count += 1;

        let handle = BodyHandle::from_entity(entity);
        physics_trace!(
            ?handle,
            motion = ?settings.motion_type,
            layer = ?settings.layer,
            "Body created"
        );
        Ok(handle)
    }

    /// Add a created body to the simulation
    pub fn add_body(&mut self, handle: BodyHandle, activation: Activation) -> Result<(), PhysicsError> {
        let (woke, static_bounds) = {
            let body = self
                .bodies
                .query_one_mut::<&mut Body>(handle.entity())
                .map_err(|_| PhysicsError::InvalidHandle)?;
            if body.in_simulation {
                return Err(PhysicsError::BodyAlreadyAdded);
            }
            body.in_simulation = true;

            let woke = body.is_dynamic() && activation == Activation::Activate;
            if woke {
                body.active = true;
                body.sleep_timer = 0.0;
            }
            let static_bounds = (self.layers.broad_phase_layer(body.layer)
                == BroadPhaseLayer::NonMoving)
                .then(|| body.shape.world_aabb(body.position, body.rotation));
            (woke, static_bounds)
        };

        if let Some(aabb) = static_bounds {
            self.static_bodies.insert(handle.entity(), aabb);
        }
        if woke {
            self.listeners.dispatch(&[PhysicsEvent::Activated(handle)]);
        }
        Ok(())
    }

    pub fn create_and_add_body(
        &mut self,
        settings: &BodyCreationSettings,
        activation: Activation,
    ) -> Result<BodyHandle, PhysicsError> {
        let handle = self.create_body(settings)?;
        self.add_body(handle, activation)?;
        Ok(handle)
    }

    /// Take a body out of the simulation; it keeps its state and can be re-added
    pub fn remove_body(&mut self, handle: BodyHandle) -> Result<(), PhysicsError> {
        {
            let body = self
                .bodies
                .query_one_mut::<&mut Body>(handle.entity())
                .map_err(|_| PhysicsError::InvalidHandle)?;
            if !body.in_simulation {
                return Err(PhysicsError::BodyNotAdded);
            }
            body.in_simulation = false;
            body.active = false;
            body.sleep_timer = 0.0;
        }

        self.static_bodies.remove(handle.entity());
        let events = self.drop_contacts(|key| key.0 == handle || key.1 == handle);
        self.listeners.dispatch(&events);
        Ok(())
    }

    /// Release a body; the handle is invalid afterwards
    ///
    /// A body still in the simulation is removed first.
    pub fn destroy_body(&mut self, handle: BodyHandle) -> Result<(), PhysicsError> {
        let in_simulation = self.body(handle)?.in_simulation;
        if in_simulation {
            self.remove_body(handle)?;
        }
        self.bodies
            .despawn(handle.entity())
            .map_err(|_| PhysicsError::InvalidHandle)?;
        self.body_count -= 1;

        physics_trace!(?handle, "Body destroyed");
        Ok(())
    }

    /// Remove and destroy every body; the world stays usable
    pub fn unload_all(&mut self) {
        let events = self.drop_contacts(|_| true);
        self.listeners.dispatch(&events);

        let count = self.body_count;
        // Despawn individually so generations advance and old handles stay invalid
        let entities: Vec<hecs::Entity> = self.bodies.iter().map(|body| body.entity()).collect();
        for entity in entities {
            let _ = self.bodies.despawn(entity);
        }
        self.static_bodies.clear();
        self.body_count = 0;

        info!(bodies = count, "Unloaded all physics bodies");
    }

    /// Sort the non-moving broad-phase group; call after bulk static inserts
    pub fn optimize_broad_phase(&mut self) {
        self.static_bodies.optimize();
        info!(static_bodies = self.static_bodies.len(), "Broad phase optimized");
    }

    pub fn is_broad_phase_optimized(&self) -> bool {
        self.static_bodies.is_optimized()
    }

    /// Tear down and hand back the listeners for a later world
    pub(crate) fn shutdown(mut self) -> Listeners {
        self.unload_all();
        info!(steps = self.step_count, "Physics world destroyed");
        self.listeners
    }

    // ---- queries ----

    pub fn position(&self, handle: BodyHandle) -> Result<Vec3, PhysicsError> {
        Ok(to_host(self.body(handle)?.position))
    }

    /// Move a body; wakes it if it is dynamic and asleep
    pub fn set_position(&mut self, handle: BodyHandle, position: Vec3) -> Result<(), PhysicsError> {
        let position = to_physics(position);
        self.modify(handle, true, |body| body.position = position)
    }

    pub fn rotation(&self, handle: BodyHandle) -> Result<Quat, PhysicsError> {
        Ok(rotation_to_host(self.body(handle)?.rotation))
    }

    pub fn set_rotation(&mut self, handle: BodyHandle, rotation: Quat) -> Result<(), PhysicsError> {
        let rotation = rotation_to_physics(rotation);
        self.modify(handle, true, |body| body.rotation = rotation)
    }

    /// Linear velocity in host units per second
    pub fn linear_velocity(&self, handle: BodyHandle) -> Result<Vec3, PhysicsError> {
        Ok(to_host(self.body(handle)?.linear_velocity))
    }

    /// Set the velocity of a dynamic body; a non-zero velocity wakes it
    pub fn set_linear_velocity(
        &mut self,
        handle: BodyHandle,
        velocity: Vec3,
    ) -> Result<(), PhysicsError> {
        let velocity = to_physics(velocity);
        self.set_velocity(handle, velocity != Vec3::ZERO, |body| {
            body.linear_velocity = velocity
        })
    }

    /// Angular velocity in radians per second about host axes
    pub fn angular_velocity(&self, handle: BodyHandle) -> Result<Vec3, PhysicsError> {
        Ok(direction_to_host(self.body(handle)?.angular_velocity))
    }

    pub fn set_angular_velocity(
        &mut self,
        handle: BodyHandle,
        velocity: Vec3,
    ) -> Result<(), PhysicsError> {
        let velocity = direction_to_physics(velocity);
        self.set_velocity(handle, velocity != Vec3::ZERO, |body| {
            body.angular_velocity = velocity
        })
    }

    /// Wake a sleeping dynamic body
    pub fn activate(&mut self, handle: BodyHandle) -> Result<(), PhysicsError> {
        self.modify(handle, true, |_| {})
    }

    /// Put a dynamic body to sleep immediately
    pub fn deactivate(&mut self, handle: BodyHandle) -> Result<(), PhysicsError> {
        let was_active = {
            let body = self
                .bodies
                .query_one_mut::<&mut Body>(handle.entity())
                .map_err(|_| PhysicsError::InvalidHandle)?;
            let was_active = body.active;
            body.active = false;
            body.sleep_timer = 0.0;
            body.linear_velocity = Vec3::ZERO;
            body.angular_velocity = Vec3::ZERO;
            was_active
        };

        if was_active {
            self.listeners.dispatch(&[PhysicsEvent::Deactivated(handle)]);
        }
        Ok(())
    }

    pub fn is_active(&self, handle: BodyHandle) -> Result<bool, PhysicsError> {
        Ok(self.body(handle)?.active)
    }

    /// Whether the body is in the simulation (added and not removed)
    pub fn is_added(&self, handle: BodyHandle) -> Result<bool, PhysicsError> {
        Ok(self.body(handle)?.in_simulation)
    }

    pub fn motion_type(&self, handle: BodyHandle) -> Result<MotionType, PhysicsError> {
        Ok(self.body(handle)?.motion_type)
    }

    pub fn layer(&self, handle: BodyHandle) -> Result<ObjectLayer, PhysicsError> {
        Ok(self.body(handle)?.layer)
    }

    pub fn shape(&self, handle: BodyHandle) -> Result<SharedShape, PhysicsError> {
        Ok(self.body(handle)?.shape.clone())
    }

    /// Mass in kilograms; infinite for static bodies
    pub fn mass(&self, handle: BodyHandle) -> Result<f32, PhysicsError> {
        Ok(self.body(handle)?.mass())
    }

    /// Contact pairs touching after the last update
    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    fn body(&self, handle: BodyHandle) -> Result<hecs::Ref<'_, Body>, PhysicsError> {
        self.bodies
            .get::<&Body>(handle.entity())
            .map_err(|_| PhysicsError::InvalidHandle)
    }

    fn in_static_group(&self, layer: ObjectLayer) -> bool {
        self.layers.broad_phase_layer(layer) == BroadPhaseLayer::NonMoving
    }

    fn set_velocity(
        &mut self,
        handle: BodyHandle,
        wake: bool,
        apply: impl FnOnce(&mut Body),
    ) -> Result<(), PhysicsError> {
        let dynamic = self.body(handle)?.is_dynamic();
        physics_assert!(dynamic, "velocity set on static body {:?}", handle);
        if !dynamic {
            return Ok(());
        }
        self.modify(handle, wake, apply)
    }

    /// Apply a change to one body, wake it if asked, and keep the static
    /// broad phase in sync
    fn modify(
        &mut self,
        handle: BodyHandle,
        wake: bool,
        apply: impl FnOnce(&mut Body),
    ) -> Result<(), PhysicsError> {
        let (woke, static_bounds) = {
            let body = self
                .bodies
                .query_one_mut::<&mut Body>(handle.entity())
                .map_err(|_| PhysicsError::InvalidHandle)?;
            apply(body);

            let woke = wake && body.is_dynamic() && body.in_simulation && !body.active;
            if woke {
                body.active = true;
                body.sleep_timer = 0.0;
            }
            let static_bounds = (body.in_simulation
                && self.layers.broad_phase_layer(body.layer) == BroadPhaseLayer::NonMoving)
                .then(|| body.shape.world_aabb(body.position, body.rotation));
            (woke, static_bounds)
        };

        if let Some(aabb) = static_bounds {
            self.static_bodies.update(handle.entity(), aabb);
        }
        if woke {
            self.listeners.dispatch(&[PhysicsEvent::Activated(handle)]);
        }
        Ok(())
    }

    fn drop_contacts(&mut self, mut matches: impl FnMut(&ContactKey) -> bool) -> Vec<PhysicsEvent> {
        let mut events = Vec::new();
        self.contacts.retain(|manifold| {
            let key = manifold_key(manifold);
            if matches(&key) {
                events.push(PhysicsEvent::ContactRemoved(key.0, key.1));
                false
            } else {
                true
            }
        });
        events
    }

    // ---- stepping ----

    /// Advance the simulation by one fixed timestep
    ///
    /// Runs `collision_steps` sub-steps. On error the world is left as it
    /// was before the call.
    pub fn update(&mut self) -> Result<StepStats, PhysicsError> {
        let mut buffers = std::mem::take(&mut self.buffers);
        let result = match self.run_step(&mut buffers) {
            Ok(mut stats) => {
                stats.listener_faults = self.listeners.dispatch(&buffers.events);
                Ok(stats)
            }
            Err(err) => {
                error!(error = %err, step = self.step_count + 1, "Physics step failed");
                Err(err)
            }
        };
        self.buffers = buffers;
        result
    }

    fn run_step(&mut self, buffers: &mut StepBuffers) -> Result<StepStats, PhysicsError> {
        self.resources.scratch.reset();
        buffers.events.clear();
        buffers.touching.clear();
        self.gather_bodies(buffers)?;

        let dt = self.config.sub_step();
        let mut stats = StepStats {
            step: self.step_count + 1,
            ..Default::default()
        };

        for sub_step in 0..self.config.collision_steps {
            self.sub_step(buffers, sub_step, dt, &mut stats)?;
        }

        // Latest sub-step first, then keep one manifold per pair
        buffers.touching.sort_unstable_by(|(step_a, a), (step_b, b)| {
            manifold_key(a)
                .cmp(&manifold_key(b))
                .then(step_b.cmp(step_a))
        });
        buffers
            .touching
            .dedup_by(|(_, next), (_, kept)| manifold_key(next) == manifold_key(kept));

        // Every old or new contact can yield one event
        let bound = buffers.touching.len() + self.contacts.len();
        self.resources.scratch.reserve::<ContactManifold>(bound)?;
        self.resources.scratch.reserve::<PhysicsEvent>(bound)?;

        // Nothing below can fail; commit
        self.update_contacts(buffers);
        self.write_back(&buffers.bodies);
        self.step_count += 1;

        stats.active_bodies = buffers.bodies.iter().filter(|b| b.is_simulated()).count();
        stats.scratch_bytes = self.resources.scratch.used();

        physics_trace!(
            step = stats.step,
            active = stats.active_bodies,
            pairs = stats.body_pairs,
            contacts = stats.contacts,
            "Physics step complete"
        );
        Ok(stats)
    }

    /// Copy every body in the simulation into the step array, ordered by handle
    fn gather_bodies(&mut self, buffers: &mut StepBuffers) -> Result<(), PhysicsError> {
        let layers = &self.layers;
        let scratch = &mut self.resources.scratch;
        scratch.reserve::<SolverBody>(self.body_count)?;

        buffers.bodies.clear();
        buffers.bodies.extend(
            self.bodies
                .query::<&Body>()
                .iter()
                .filter(|(_, body)| body.in_simulation)
                .map(|(entity, body)| {
                    let static_group =
                        layers.broad_phase_layer(body.layer) == BroadPhaseLayer::NonMoving;
                    SolverBody::from_body(BodyHandle::from_entity(entity), body, static_group)
                }),
        );
        buffers.bodies.sort_unstable_by_key(|body| body.handle.sort_key());

        let slots = buffers
            .bodies
            .iter()
            .map(|body| body.handle.entity().id() as usize + 1)
            .max()
            .unwrap_or(0);
        scratch.reserve::<u32>(slots)?;
        buffers.step_index.clear();
        buffers.step_index.resize(slots, NO_INDEX);
        for (index, body) in buffers.bodies.iter().enumerate() {
            buffers.step_index[body.handle.entity().id() as usize] = index as u32;
        }
        Ok(())
    }

    fn sub_step(
        &mut self,
        buffers: &mut StepBuffers,
        sub_step: u32,
        dt: f32,
        stats: &mut StepStats,
    ) -> Result<(), PhysicsError> {
        let StepBuffers {
            bodies,
            step_index,
            entries,
            sweep,
            pairs,
            pair_contacts,
            contacts,
            constraints,
            touching,
            events,
            ..
        } = buffers;
        let config = &self.config;
        let layers = &self.layers;
        let statics = &self.static_bodies;
        let gravity = self.gravity;
        let jobs = &self.resources.jobs;
        let scratch = &mut self.resources.scratch;

        // Velocities and bounds
        jobs.install(|| {
            solver::integrate_velocities(bodies, gravity, config, dt);
            bodies
                .par_iter_mut()
                .for_each(|body| body.refresh_aabb(config.penetration_slop));
        });

        // Broad phase: moving group against itself
        scratch.reserve::<BroadPhaseEntry>(bodies.len())?;
        entries.clear();
        entries.extend(
            bodies
                .iter()
                .enumerate()
                .filter(|(_, body)| !body.static_group)
                .map(|(index, body)| BroadPhaseEntry {
                    body: index,
                    aabb: body.aabb,
                }),
        );

        // Pairs past capacity are counted, never stored
        let pair_capacity = config.max_body_pairs;
        scratch.reserve::<(usize, usize)>(pair_capacity)?;
        pairs.clear();
        let mut dropped_pairs = 0;
        let mut keep_pair = |pair: (usize, usize)| {
            if pairs.len() < pair_capacity {
                pairs.push(pair);
            } else {
                dropped_pairs += 1;
            }
        };

        let entry_list: &[BroadPhaseEntry] = entries;
        sweep_and_prune(
            entry_list,
            sweep,
            scratch,
            |i, j| {
                let a = &bodies[entry_list[i].body];
                let b = &bodies[entry_list[j].body];
                (a.is_simulated() || b.is_simulated()) && layers.pair_allowed(a.layer, b.layer)
            },
            |i, j| keep_pair((entry_list[i].body, entry_list[j].body)),
        )?;

        // Awake bodies against the non-moving group
        for (index, body) in bodies.iter().enumerate() {
            if body.static_group || !body.is_simulated() {
                continue;
            }
            statics.query(&body.aabb, |entity| {
                let other = step_index
                    .get(entity.id() as usize)
                    .copied()
                    .unwrap_or(NO_INDEX);
                if other == NO_INDEX {
                    return;
                }
                let other = other as usize;
                physics_assert!(
                    bodies[other].handle.entity() == entity,
                    "static broad phase out of sync for {:?}",
                    entity
                );
                if layers.pair_allowed(body.layer, bodies[other].layer) {
                    keep_pair((index.min(other), index.max(other)));
                }
            });
        }
        pairs.sort_unstable();

        if dropped_pairs > 0 {
            stats.dropped_pairs += dropped_pairs;
            warn!(
                dropped = dropped_pairs,
                capacity = pair_capacity,
                "Body pair capacity exceeded; extra pairs dropped"
            );
        }
        stats.body_pairs += pairs.len();

        // Narrow phase into one reused list per pair, in pair order
        let pair_count = pairs.len();
        scratch.reserve::<Vec<Contact>>(pair_count)?;
        if pair_contacts.len() < pair_count {
            pair_contacts.resize_with(pair_count, Vec::new);
        }
        let solver_bodies: &[SolverBody] = bodies;
        let pair_list: &[(usize, usize)] = pairs;
        jobs.install(|| {
            pair_contacts[..pair_count]
                .par_iter_mut()
                .zip(pair_list.par_iter())
                .for_each(|(found, &(i, j))| {
                    found.clear();
                    narrow_phase::test_collision(
                        &solver_bodies[i].collision_object(i),
                        &solver_bodies[j].collision_object(j),
                        found,
                    );
                });
        });
        let found: usize = pair_contacts[..pair_count].iter().map(Vec::len).sum();
        scratch.reserve::<Contact>(found)?;

        let contact_capacity = config.max_contact_constraints;
        scratch.reserve::<Contact>(found.min(contact_capacity))?;
        contacts.clear();
        for list in &pair_contacts[..pair_count] {
            let room = contact_capacity - contacts.len();
            contacts.extend_from_slice(&list[..list.len().min(room)]);
        }
        if found > contact_capacity {
            let dropped = found - contact_capacity;
            stats.dropped_contacts += dropped;
            warn!(
                dropped,
                capacity = contact_capacity,
                "Contact constraint capacity exceeded; extra contacts dropped"
            );
        }
        stats.contacts += contacts.len();

        // Moving bodies wake sleeping ones they touch; at most one per contact
        scratch.reserve::<PhysicsEvent>(contacts.len())?;
        for contact in contacts.iter() {
            for (sleeper, mover) in [
                (contact.body_a, contact.body_b),
                (contact.body_b, contact.body_a),
            ] {
                if bodies[sleeper].dynamic
                    && !bodies[sleeper].active
                    && bodies[mover].is_simulated()
                    && bodies[mover].is_moving(config.sleep_velocity_threshold)
                {
                    bodies[sleeper].wake();
                    events.push(PhysicsEvent::Activated(bodies[sleeper].handle));
                }
            }
        }

        // Solve and integrate
        scratch.reserve::<ContactConstraint>(contacts.len())?;
        constraints.clear();
        solver::prepare_contacts(bodies, contacts, config, dt, constraints);
        solver::solve_contacts(bodies, constraints, config.solver_iterations);
        jobs.install(|| solver::integrate_positions(bodies, dt));

        scratch.reserve::<PhysicsEvent>(bodies.len())?;
        solver::update_sleep_state(bodies, config, dt, |handle| {
            events.push(PhysicsEvent::Deactivated(handle))
        });

        // One manifold per touching pair, deepest point wins; a pair's
        // contacts are adjacent
        scratch.reserve::<(u32, ContactManifold)>(contacts.len())?;
        let first_new = touching.len();
        for contact in contacts.iter() {
            let key = (bodies[contact.body_a].handle, bodies[contact.body_b].handle);
            let same_pair = touching.len() > first_new
                && touching
                    .last()
                    .is_some_and(|(_, manifold)| manifold_key(manifold) == key);
            if same_pair {
                if let Some((_, manifold)) = touching.last_mut() {
                    manifold.point_count += 1;
                    if contact.penetration > manifold.penetration {
                        manifold.point = contact.position;
                        manifold.normal = contact.normal;
                        manifold.penetration = contact.penetration;
                    }
                }
            } else {
                touching.push((
                    sub_step,
                    ContactManifold {
                        body_a: key.0,
                        body_b: key.1,
                        point: contact.position,
                        normal: contact.normal,
                        penetration: contact.penetration,
                        point_count: 1,
                    },
                ));
            }
        }

        Ok(())
    }

    /// Turn this update's touching pairs into added/persisted/removed events
    ///
    /// Pairs whose bodies are both asleep or static keep their contact
    /// without events until one of them wakes up.
    fn update_contacts(&mut self, buffers: &mut StepBuffers) {
        let StepBuffers {
            bodies,
            step_index,
            touching,
            next_contacts,
            events,
            ..
        } = buffers;
        let previous = &self.contacts;
        let known = |key: &ContactKey| {
            previous
                .binary_search_by(|manifold| manifold_key(manifold).cmp(key))
                .is_ok()
        };

        next_contacts.clear();
        for (_, manifold) in touching.iter() {
            if known(&manifold_key(manifold)) {
                events.push(PhysicsEvent::ContactPersisted(*manifold));
            } else {
                events.push(PhysicsEvent::ContactAdded(*manifold));
            }
            next_contacts.push(*manifold);
        }

        let idle = |handle: BodyHandle| {
            step_index
                .get(handle.entity().id() as usize)
                .filter(|&&index| index != NO_INDEX)
                .map(|&index| !bodies[index as usize].is_simulated())
                .unwrap_or(false)
        };
        let still_touching = |key: &ContactKey| {
            touching
                .binary_search_by(|(_, manifold)| manifold_key(manifold).cmp(key))
                .is_ok()
        };
        for manifold in previous.iter() {
            let key = manifold_key(manifold);
            if still_touching(&key) {
                continue;
            }
            if idle(key.0) && idle(key.1) {
                next_contacts.push(*manifold);
            } else {
                events.push(PhysicsEvent::ContactRemoved(key.0, key.1));
            }
        }

        next_contacts.sort_unstable_by_key(manifold_key);
        std::mem::swap(&mut self.contacts, next_contacts);
    }

    fn write_back(&mut self, bodies: &[SolverBody]) {
        for solver_body in bodies.iter().filter(|body| body.dynamic) {
            if let Ok(body) = self
                .bodies
                .query_one_mut::<&mut Body>(solver_body.handle.entity())
            {
                body.position = solver_body.position;
                body.rotation = solver_body.rotation;
                body.linear_velocity = solver_body.linear_velocity;
                body.angular_velocity = solver_body.angular_velocity;
                body.active = solver_body.active;
                body.sleep_timer = solver_body.sleep_timer;
            }
        }
    }
}

impl std::fmt::Debug for PhysicsWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsWorld")
            .field("bodies", &self.body_count)
            .field("gravity", &self.gravity)
            .field("step_count", &self.step_count)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::shapes::{box_shape, sphere_shape, Shape};

    fn small_world(max_bodies: usize) -> PhysicsWorld {
        PhysicsWorld::new(PhysicsConfig {
            max_bodies,
            worker_threads: Some(2),
            ..Default::default()
        })
        .unwrap()
    }

    fn falling_sphere(height: f32) -> BodyCreationSettings {
        BodyCreationSettings::dynamic(sphere_shape(10.0), Vec3::new(0.0, 0.0, height), Quat::IDENTITY)
    }

    fn floor() -> BodyCreationSettings {
        BodyCreationSettings::fixed(
            box_shape(Vec3::new(1000.0, 1000.0, 10.0)),
            Vec3::new(0.0, 0.0, -10.0),
            Quat::IDENTITY,
        )
    }

    #[test]
    fn test_two_phase_lifecycle() {
        let mut world = small_world(8);
        let handle = world.create_body(&falling_sphere(100.0)).unwrap();
        assert_eq!(world.body_count(), 1);
        assert!(!world.is_added(handle).unwrap());

        world.add_body(handle, Activation::Activate).unwrap();
        assert!(world.is_active(handle).unwrap());
        assert!(matches!(
            world.add_body(handle, Activation::Activate),
            Err(PhysicsError::BodyAlreadyAdded)
        ));

        world.remove_body(handle).unwrap();
        assert!(matches!(world.remove_body(handle), Err(PhysicsError::BodyNotAdded)));

        world.destroy_body(handle).unwrap();
        assert_eq!(world.body_count(), 0);
        assert!(!world.contains(handle));
        assert!(matches!(world.position(handle), Err(PhysicsError::InvalidHandle)));
    }

    #[test]
    fn test_stale_handle_rejected_after_slot_reuse() {
        let mut world = small_world(8);
        let old = world.create_body(&falling_sphere(0.0)).unwrap();
        world.destroy_body(old).unwrap();
        let new = world.create_body(&falling_sphere(0.0)).unwrap();
        assert_ne!(old, new);
        assert!(matches!(world.is_active(old), Err(PhysicsError::InvalidHandle)));
        assert!(world.contains(new));
    }

    #[test]
    fn test_creation_rules() {
        let mut world = small_world(8);
        let mesh = Shape::triangle_mesh(crate::physics::shapes::TriangleMesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Z],
            vec![[0, 1, 2]],
        ));
        let dynamic_mesh = BodyCreationSettings::dynamic(mesh, Vec3::ZERO, Quat::IDENTITY);
        assert!(matches!(
            world.create_body(&dynamic_mesh),
            Err(PhysicsError::UnsupportedShape)
        ));

        let mut misplaced = falling_sphere(0.0);
        misplaced.layer = ObjectLayer::NonMoving;
        assert!(matches!(
            world.create_body(&misplaced),
            Err(PhysicsError::LayerMotionMismatch)
        ));
        assert_eq!(world.body_count(), 0);
    }

    #[test]
    fn test_host_space_round_trip() {
        let mut world = small_world(8);
        let handle = world
            .create_and_add_body(&falling_sphere(0.0), Activation::DontActivate)
            .unwrap();
        let target = Vec3::new(120.0, -64.0, 300.0);
        world.set_position(handle, target).unwrap();
        assert!((world.position(handle).unwrap() - target).length() < 1e-3);
        // Moving a sleeping body wakes it
        assert!(world.is_active(handle).unwrap());
    }

    #[test]
    fn test_sphere_lands_on_floor() {
        let mut world = small_world(8);
        world.create_and_add_body(&floor(), Activation::DontActivate).unwrap();
        let sphere = world
            .create_and_add_body(&falling_sphere(40.0), Activation::Activate)
            .unwrap();
        world.optimize_broad_phase();

        let mut saw_contact = false;
        for _ in 0..300 {
            let stats = world.update().unwrap();
            saw_contact |= stats.contacts > 0;
        }

        assert!(saw_contact);
        let z = world.position(sphere).unwrap().z;
        // Radius 10 resting on a floor whose top is at 0
        assert!((z - 10.0).abs() < 1.0, "sphere rests at z = {z}");
        assert_eq!(world.contact_count(), 1);
    }

    #[test]
    fn test_static_bodies_never_pair() {
        let mut world = small_world(8);
        world.create_and_add_body(&floor(), Activation::Activate).unwrap();
        world.create_and_add_body(&floor(), Activation::Activate).unwrap();
        let stats = world.update().unwrap();
        assert_eq!(stats.body_pairs, 0);
        assert_eq!(stats.active_bodies, 0);
    }

    #[test]
    fn test_pair_capacity_drops_extra_pairs() {
        let mut world = PhysicsWorld::new(PhysicsConfig {
            max_body_pairs: 1,
            worker_threads: Some(1),
            default_gravity: 0.0,
            ..Default::default()
        })
        .unwrap();
        // Three overlapping spheres give three pairs
        for x in [0.0, 5.0, 10.0] {
            let settings = BodyCreationSettings::dynamic(
                sphere_shape(10.0),
                Vec3::new(x, 0.0, 0.0),
                Quat::IDENTITY,
            );
            world.create_and_add_body(&settings, Activation::Activate).unwrap();
        }

        let stats = world.update().unwrap();
        assert_eq!(stats.body_pairs, 1);
        assert_eq!(stats.dropped_pairs, 2);
    }

    #[test]
    fn test_contact_capacity_drops_extra_contacts() {
        let mut world = PhysicsWorld::new(PhysicsConfig {
            max_contact_constraints: 1,
            worker_threads: Some(1),
            ..Default::default()
        })
        .unwrap();
        world.create_and_add_body(&floor(), Activation::DontActivate).unwrap();
        // Sunk half an inch into the floor so all four bottom corners touch
        let cube = BodyCreationSettings::dynamic(
            box_shape(Vec3::splat(6.0)),
            Vec3::new(0.0, 0.0, 5.5),
            Quat::IDENTITY,
        );
        let cube = world.create_and_add_body(&cube, Activation::Activate).unwrap();

        let stats = world.update().unwrap();
        assert_eq!(stats.body_pairs, 1);
        assert_eq!(stats.contacts, 1);
        assert!(stats.dropped_contacts >= 3, "{stats:?}");
        assert_eq!(world.contact_count(), 1);
        assert!(world.is_active(cube).unwrap());
    }

    #[test]
    fn test_unload_all_keeps_world_usable() {
        let mut world = small_world(4);
        for height in [10.0, 50.0, 90.0] {
            world
                .create_and_add_body(&falling_sphere(height), Activation::Activate)
                .unwrap();
        }
        world.update().unwrap();
        world.unload_all();
        assert_eq!(world.body_count(), 0);
        assert_eq!(world.active_body_count(), 0);

        world
            .create_and_add_body(&falling_sphere(10.0), Activation::Activate)
            .unwrap();
        world.update().unwrap();
        assert_eq!(world.body_count(), 1);
    }

    #[test]
    fn test_handles_stay_invalid_after_unload_all() {
        let mut world = small_world(4);
        let old = world
            .create_and_add_body(&falling_sphere(10.0), Activation::Activate)
            .unwrap();
        world.unload_all();

        let new = world
            .create_and_add_body(&falling_sphere(50.0), Activation::Activate)
            .unwrap();
        assert_ne!(old, new);
        assert!(!world.contains(old));
        assert!(matches!(world.position(old), Err(PhysicsError::InvalidHandle)));
        assert!(matches!(world.destroy_body(old), Err(PhysicsError::InvalidHandle)));
        assert!(world.contains(new));
        assert_eq!(world.body_count(), 1);
    }
}
