//! World lifecycle: `init`, one `update` per host tick, `cleanup`

use crate::config::{CvarSource, PhysicsConfig};
use crate::physics::body::{Activation, BodyCreationSettings, BodyHandle};
use crate::physics::error::{MeshImportError, PhysicsError};
use crate::physics::layers::LayerPolicy;
use crate::physics::listeners::{ActivationListener, ContactListener, Listeners};
use crate::physics::resources::ResourcePool;
use crate::physics::shapes::{Shape, SharedShape};
use crate::physics::units::{length_to_host, to_host};
use crate::physics::world::{PhysicsWorld, StepStats};
use glam::{Quat, Vec3};
use std::path::Path;
use tracing::{error, info};

/// Where the system is in its lifecycle
#[derive(Debug, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initialized(Box<PhysicsWorld>),
    /// Only observed while `cleanup` is tearing the world down
    ShuttingDown,
}

/// Owner of the single physics world
///
/// Drives `init → update (once per fixed tick) → cleanup`. Listeners
/// registered before `init` are handed to the world when it is created and
/// returned when it is destroyed.
#[derive(Debug)]
pub struct PhysicsSystem {
    config: PhysicsConfig,
    listeners: Option<Listeners>,
    state: LifecycleState,
}

impl PhysicsSystem {
    pub fn new(config: PhysicsConfig) -> Self {
        Self {
            config,
            listeners: None,
            state: LifecycleState::Uninitialized,
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, LifecycleState::Initialized(_))
    }

    pub fn set_activation_listener(&mut self, listener: Box<dyn ActivationListener>) {
        match &mut self.state {
            LifecycleState::Initialized(world) => world.set_activation_listener(listener),
            _ => self.listeners.get_or_insert_with(Listeners::default).activation = listener,
        }
    }

    pub fn set_contact_listener(&mut self, listener: Box<dyn ContactListener>) {
        match &mut self.state {
            LifecycleState::Initialized(world) => world.set_contact_listener(listener),
            _ => self.listeners.get_or_insert_with(Listeners::default).contact = listener,
        }
    }

    /// Create the resource pool, layer policy and world, and read gravity
    pub fn init(&mut self, cvars: &dyn CvarSource) -> Result<(), PhysicsError> {
        if !matches!(self.state, LifecycleState::Uninitialized) {
            error!("Physics init called twice");
            return Err(PhysicsError::AlreadyInitialized);
        }
        self.config.validate()?;

        let resources = ResourcePool::new(
            self.config.temp_allocator_bytes,
            self.config.resolved_worker_threads(),
        )?;
        let listeners = self.listeners.take().unwrap_or_default();
        let mut world = PhysicsWorld::with_parts(
            self.config.clone(),
            resources,
            LayerPolicy::default(),
            listeners,
        );

        let gravity = cvars
            .cvar_float(&self.config.gravity_cvar)
            .unwrap_or(self.config.default_gravity);
        world.set_gravity(Vec3::new(0.0, 0.0, -gravity));

        if self.config.seed_demo_bodies {
            seed_demo_scene(&mut world)?;
        }

        info!(
            gravity,
            workers = world.worker_threads(),
            timestep = self.config.fixed_timestep,
            "Physics initialized"
        );
        self.state = LifecycleState::Initialized(Box::new(world));
        Ok(())
    }

    /// Step the world by one fixed timestep
    pub fn update(&mut self) -> Result<StepStats, PhysicsError> {
        match &mut self.state {
            LifecycleState::Initialized(world) => world.update(),
            _ => {
                error!("Physics update called while not initialized");
                Err(PhysicsError::NotInitialized)
            }
        }
    }

    /// Destroy every body, the world and its resources
    pub fn cleanup(&mut self) -> Result<(), PhysicsError> {
        match std::mem::replace(&mut self.state, LifecycleState::ShuttingDown) {
            LifecycleState::Initialized(world) => {
                self.listeners = Some(world.shutdown());
                self.state = LifecycleState::Uninitialized;
                info!("Physics cleaned up");
                Ok(())
            }
            other => {
                self.state = other;
                error!("Physics cleanup called while not initialized");
                Err(PhysicsError::NotInitialized)
            }
        }
    }

    pub fn world(&self) -> Result<&PhysicsWorld, PhysicsError> {
        match &self.state {
            LifecycleState::Initialized(world) => Ok(world.as_ref()),
            _ => Err(PhysicsError::NotInitialized),
        }
    }

    pub fn world_mut(&mut self) -> Result<&mut PhysicsWorld, PhysicsError> {
        match &mut self.state {
            LifecycleState::Initialized(world) => Ok(world.as_mut()),
            _ => Err(PhysicsError::NotInitialized),
        }
    }

    pub fn import_static_mesh(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(BodyHandle, SharedShape), MeshImportError> {
        self.world_mut()?.import_static_mesh(path)
    }

    /// Drop every body while keeping the world (level change)
    pub fn unload_all(&mut self) -> Result<(), PhysicsError> {
        self.world_mut()?.unload_all();
        Ok(())
    }
}

/// Spawn the test scene: a wide static floor and a sphere falling onto it
///
/// Returns `(floor, sphere)`.
pub fn seed_demo_scene(world: &mut PhysicsWorld) -> Result<(BodyHandle, BodyHandle), PhysicsError> {
    let floor = BodyCreationSettings::fixed(
        Shape::cuboid(Vec3::new(100.0, 1.0, 100.0)),
        to_host(Vec3::new(0.0, -1.0, 0.0)),
        Quat::IDENTITY,
    );
    let floor = world.create_and_add_body(&floor, Activation::DontActivate)?;

    let sphere = BodyCreationSettings::dynamic(
        Shape::sphere(0.5),
        to_host(Vec3::new(0.0, 2.0, 0.0)),
        Quat::IDENTITY,
    )
    .with_linear_velocity(Vec3::new(0.0, 0.0, -length_to_host(5.0)));
    let sphere = world.create_and_add_body(&sphere, Activation::Activate)?;

    world.optimize_broad_phase();
    info!(?floor, ?sphere, "Seeded demo scene");
    Ok((floor, sphere))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> PhysicsConfig {
        PhysicsConfig {
            worker_threads: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_update_requires_init() {
        let mut system = PhysicsSystem::new(config());
        let err = system.update().unwrap_err();
        assert!(matches!(err, PhysicsError::NotInitialized));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_init_update_cleanup() {
        let mut system = PhysicsSystem::new(config());
        system.init(&()).unwrap();
        assert!(system.is_initialized());
        assert!(matches!(system.init(&()), Err(PhysicsError::AlreadyInitialized)));

        let stats = system.update().unwrap();
        assert_eq!(stats.step, 1);

        system.cleanup().unwrap();
        assert!(matches!(system.state(), LifecycleState::Uninitialized));
        assert!(matches!(system.update(), Err(PhysicsError::NotInitialized)));
        assert!(matches!(system.cleanup(), Err(PhysicsError::NotInitialized)));

        // A fresh world after cleanup
        system.init(&()).unwrap();
        assert_eq!(system.world().unwrap().step_count(), 0);
    }

    #[test]
    fn test_gravity_from_cvar() {
        let mut cvars = HashMap::new();
        cvars.insert("sv_gravity".to_string(), 600.0);

        let mut system = PhysicsSystem::new(config());
        system.init(&cvars).unwrap();
        let gravity = system.world().unwrap().gravity();
        assert!((gravity - Vec3::new(0.0, 0.0, -600.0)).length() < 1e-2);
    }

    #[test]
    fn test_default_gravity_without_cvar() {
        let mut system = PhysicsSystem::new(config());
        system.init(&()).unwrap();
        let gravity = system.world().unwrap().gravity();
        assert!((gravity.z + 800.0).abs() < 1e-2);
    }

    #[test]
    fn test_demo_scene_seeding() {
        let mut system = PhysicsSystem::new(PhysicsConfig {
            seed_demo_bodies: true,
            ..config()
        });
        system.init(&()).unwrap();
        let world = system.world().unwrap();
        assert_eq!(world.body_count(), 2);
        assert_eq!(world.active_body_count(), 1);
        assert!(world.is_broad_phase_optimized());
    }
}
