//! Collision layers and the filtering policy between them
//!
//! Every object layer maps to exactly one broad-phase layer. The broad phase
//! keeps one spatial structure per broad-phase layer, and the pair filters
//! below are consulted before any narrow-phase test. All lookups are table
//! reads; they run on every broad-phase pass.

use serde::{Deserialize, Serialize};

/// Logical layer an object belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectLayer {
    /// Static geometry
    NonMoving = 0,
    /// Everything that can move
    Moving = 1,
}

impl ObjectLayer {
    pub const COUNT: usize = 2;
    pub const ALL: [ObjectLayer; Self::COUNT] = [ObjectLayer::NonMoving, ObjectLayer::Moving];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Coarse spatial partition used by the broad phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BroadPhaseLayer {
    NonMoving = 0,
    Moving = 1,
}

/// Maps object layers onto broad-phase layers
pub trait BroadPhaseLayerInterface: Send + Sync {
    fn broad_phase_layer(&self, layer: ObjectLayer) -> BroadPhaseLayer;
}

/// Decides whether an object layer is tested against a broad-phase layer
pub trait ObjectVsBroadPhaseLayerFilter: Send + Sync {
    fn should_collide(&self, layer: ObjectLayer, broad_phase_layer: BroadPhaseLayer) -> bool;
}

/// Decides whether two object layers are tested in the narrow phase
pub trait ObjectLayerPairFilter: Send + Sync {
    fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool;
}

/// Default mapping: one broad-phase layer per object layer
#[derive(Debug, Clone)]
pub struct BroadPhaseLayerMap {
    table: [BroadPhaseLayer; ObjectLayer::COUNT],
}

impl BroadPhaseLayerMap {
    pub fn new() -> Self {
        let mut table = [BroadPhaseLayer::Moving; ObjectLayer::COUNT];
        table[ObjectLayer::NonMoving.index()] = BroadPhaseLayer::NonMoving;
        table[ObjectLayer::Moving.index()] = BroadPhaseLayer::Moving;
        Self { table }
    }
}

impl Default for BroadPhaseLayerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadPhaseLayerInterface for BroadPhaseLayerMap {
    #[inline]
    fn broad_phase_layer(&self, layer: ObjectLayer) -> BroadPhaseLayer {
        self.table[layer.index()]
    }
}

/// Static geometry never collides with other static geometry
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectVsBroadPhaseFilter;

impl ObjectVsBroadPhaseLayerFilter for ObjectVsBroadPhaseFilter {
    #[inline]
    fn should_collide(&self, layer: ObjectLayer, broad_phase_layer: BroadPhaseLayer) -> bool {
        match layer {
            ObjectLayer::NonMoving => broad_phase_layer == BroadPhaseLayer::Moving,
            ObjectLayer::Moving => true,
        }
    }
}

/// Pairwise object layer filter
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectPairFilter;

impl ObjectLayerPairFilter for ObjectPairFilter {
    #[inline]
    fn should_collide(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        can_collide(a, b)
    }
}

/// Whether two object layers are eligible for narrow-phase testing
#[inline]
pub fn can_collide(a: ObjectLayer, b: ObjectLayer) -> bool {
    !(a == ObjectLayer::NonMoving && b == ObjectLayer::NonMoving)
}

/// The three filtering singletons the world is built with
pub struct LayerPolicy {
    pub broad_phase: Box<dyn BroadPhaseLayerInterface>,
    pub object_vs_broad_phase: Box<dyn ObjectVsBroadPhaseLayerFilter>,
    pub object_pair: Box<dyn ObjectLayerPairFilter>,
}

impl LayerPolicy {
    #[inline]
    pub fn broad_phase_layer(&self, layer: ObjectLayer) -> BroadPhaseLayer {
        self.broad_phase.broad_phase_layer(layer)
    }

    /// Both filters must agree before a pair reaches the narrow phase
    #[inline]
    pub fn pair_allowed(&self, a: ObjectLayer, b: ObjectLayer) -> bool {
        self.object_vs_broad_phase
            .should_collide(a, self.broad_phase_layer(b))
            && self.object_pair.should_collide(a, b)
    }
}

impl Default for LayerPolicy {
    fn default() -> Self {
        Self {
            broad_phase: Box::new(BroadPhaseLayerMap::new()),
            object_vs_broad_phase: Box::new(ObjectVsBroadPhaseFilter),
            object_pair: Box::new(ObjectPairFilter),
        }
    }
}

impl std::fmt::Debug for LayerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerPolicy").finish_non_exhaustive()
    }
}
