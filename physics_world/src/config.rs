//! Configuration types for the physics world

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Errors that can occur while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid physics config: {0}")]
    Invalid(String),
}

/// Tunables for the physics world, fixed when the world is initialized
///
/// Capacities and the scratch budget are never resized after `init`.
/// Lengths and velocities are in simulation units (meters, seconds) unless
/// the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Simulated time advanced by one `update` call
    pub fixed_timestep: f32,
    /// Collision sub-steps per `update`
    pub collision_steps: u32,
    /// Maximum number of bodies the world can hold
    pub max_bodies: usize,
    /// Maximum candidate pairs the broad phase keeps per sub-step
    pub max_body_pairs: usize,
    /// Maximum contact constraints the solver keeps per sub-step
    pub max_contact_constraints: usize,
    /// Scratch memory budget per `update`, in bytes
    pub temp_allocator_bytes: usize,
    /// Worker thread count; `None` derives it from hardware concurrency
    pub worker_threads: Option<usize>,
    /// Gravity magnitude in host units/s², used when the cvar is not set
    pub default_gravity: f32,
    /// Host cvar holding the gravity magnitude
    pub gravity_cvar: String,
    /// Velocity solver iterations per sub-step
    pub solver_iterations: u32,
    /// Fraction of penetration corrected per sub-step
    pub baumgarte: f32,
    /// Penetration allowed before correction kicks in
    pub penetration_slop: f32,
    /// Approach speed below which contacts do not bounce
    pub restitution_threshold: f32,
    /// Speed below which a body counts as resting
    pub sleep_velocity_threshold: f32,
    /// Seconds a body must rest before it falls asleep
    pub time_before_sleep: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub max_linear_velocity: f32,
    pub max_angular_velocity: f32,
    /// Friction for bodies created without an explicit material
    pub default_friction: f32,
    /// Restitution for bodies created without an explicit material
    pub default_restitution: f32,
    /// Density used to derive dynamic body mass, kg/m³
    pub density: f32,
    /// Spawn the demo floor and sphere during `init`
    pub seed_demo_bodies: bool,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: 1.0 / 100.0,
            collision_steps: 1,
            max_bodies: 4096,
            max_body_pairs: 2048,
            max_contact_constraints: 2048,
            temp_allocator_bytes: 10 * 1024 * 1024,
            worker_threads: None,
            default_gravity: 800.0,
            gravity_cvar: "sv_gravity".to_string(),
            solver_iterations: 8,
            baumgarte: 0.2,
            penetration_slop: 0.005,
            restitution_threshold: 1.0,
            sleep_velocity_threshold: 0.03,
            time_before_sleep: 0.5,
            linear_damping: 0.05,
            angular_damping: 0.05,
            max_linear_velocity: 500.0,
            max_angular_velocity: 47.0,
            default_friction: 0.2,
            default_restitution: 0.0,
            density: 1000.0,
            seed_demo_bodies: false,
        }
    }
}

impl PhysicsConfig {
    /// Parse a config from JSON text; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading physics config");
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check that the capacities and step parameters are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_timestep > 0.0) || !self.fixed_timestep.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "fixed_timestep must be positive, got {}",
                self.fixed_timestep
            )));
        }
        if self.collision_steps == 0 {
            return Err(ConfigError::Invalid(
                "collision_steps must be at least 1".to_string(),
            ));
        }
        if self.max_bodies == 0 || self.max_body_pairs == 0 || self.max_contact_constraints == 0 {
            return Err(ConfigError::Invalid(
                "body, pair and contact capacities must be non-zero".to_string(),
            ));
        }
        if self.temp_allocator_bytes == 0 {
            return Err(ConfigError::Invalid(
                "temp_allocator_bytes must be non-zero".to_string(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "worker_threads must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker count for the job pool
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            let hardware = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            hardware.saturating_sub(1).max(1)
        })
    }

    /// Length of one collision sub-step
    pub fn sub_step(&self) -> f32 {
        self.fixed_timestep / self.collision_steps as f32
    }
}

/// Read access to the host's console variables
pub trait CvarSource {
    /// Look up a numeric cvar
    fn cvar_float(&self, name: &str) -> Option<f32>;
}

impl CvarSource for HashMap<String, f32> {
    fn cvar_float(&self, name: &str) -> Option<f32> {
        self.get(name).copied()
    }
}

/// A host without console variables
impl CvarSource for () {
    fn cvar_float(&self, _name: &str) -> Option<f32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PhysicsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.temp_allocator_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_bodies, 4096);
        assert!(config.resolved_worker_threads() >= 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PhysicsConfig::from_json_str(r#"{ "max_bodies": 16, "collision_steps": 2 }"#)
            .unwrap();
        assert_eq!(config.max_bodies, 16);
        assert_eq!(config.collision_steps, 2);
        assert_eq!(config.max_body_pairs, 2048);
        assert!((config.sub_step() - 0.005).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = PhysicsConfig::from_json_str(r#"{ "collision_steps": 0 }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = PhysicsConfig::from_json_str(r#"{ "fixed_timestep": -1.0 }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = PhysicsConfig::from_json_str("not json");
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_explicit_worker_threads() {
        let config = PhysicsConfig {
            worker_threads: Some(3),
            ..Default::default()
        };
        assert_eq!(config.resolved_worker_threads(), 3);
    }

    #[test]
    fn test_cvar_lookup() {
        let mut cvars = HashMap::new();
        cvars.insert("sv_gravity".to_string(), 600.0);
        assert_eq!(cvars.cvar_float("sv_gravity"), Some(600.0));
        assert_eq!(cvars.cvar_float("sv_maxspeed"), None);
        assert_eq!(().cvar_float("sv_gravity"), None);
    }
}
