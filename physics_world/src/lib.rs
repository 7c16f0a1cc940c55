//! Rigid-body physics world for a fixed-tick host simulation
//!
//! This crate owns the physics world lifecycle, converts between the host's
//! coordinate system and the simulation's, builds bodies and shapes, imports
//! static level geometry and steps the simulation once per host tick.

pub mod config;
pub mod diagnostics;
pub mod physics;

// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{CvarSource, PhysicsConfig};
    pub use crate::physics::{
        Activation, BodyCreationSettings, BodyHandle, MotionType, ObjectLayer, PhysicsError,
        PhysicsSystem, PhysicsWorld, Shape, SharedShape, StepStats,
    };
    pub use glam::{Quat, Vec3};
}

/// Initialize logging for the physics world and its host
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
