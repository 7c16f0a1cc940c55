//! Rigid-body simulation and its host-facing integration layer

pub mod body;
pub mod collision;
pub mod error;
pub mod layers;
pub mod lifecycle;
pub mod listeners;
pub mod mesh_import;
pub mod resources;
pub mod shapes;
mod solver;
pub mod units;
pub mod world;

pub use body::{Activation, BodyCreationSettings, BodyHandle, MotionType};
pub use error::{MeshImportError, PhysicsError};
pub use layers::{can_collide, BroadPhaseLayer, LayerPolicy, ObjectLayer};
pub use lifecycle::{seed_demo_scene, LifecycleState, PhysicsSystem};
pub use listeners::{
    ActivationListener, ContactListener, ContactManifold, LoggingActivationListener,
    LoggingContactListener,
};
pub use shapes::{box_shape, sphere_shape, PhysicsMaterial, Shape, SharedShape, TriangleMesh};
pub use units::{to_host, to_physics};
pub use world::{PhysicsWorld, StepStats};
