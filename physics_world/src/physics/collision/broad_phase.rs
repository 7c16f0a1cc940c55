//! Broad phase collision detection
//!
//! Bodies on the moving broad-phase layer are swept and pruned every step.
//! Bodies on the non-moving layer live in a cached list that only changes
//! when static geometry is added, moved or removed; `optimize` sorts it so
//! queries can stop early.

use super::Aabb;
use crate::physics::error::PhysicsError;
use crate::physics::resources::ScratchAllocator;
use glam::Vec3;
use hecs::Entity;
use std::cmp::Ordering;

/// Entry for broad phase collision detection
#[derive(Debug, Clone, Copy)]
pub struct BroadPhaseEntry {
    /// Index of the body in the step's body array
    pub body: usize,
    pub aabb: Aabb,
}

/// Axis for sweep and prune
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
    Z,
}

/// Endpoint for sweep and prune
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    value: f32,
    index: usize,
    is_min: bool,
}

/// Endpoint and active lists reused by every sweep
#[derive(Debug, Default)]
pub struct SweepBuffers {
    endpoints: Vec<Endpoint>,
    active: Vec<usize>,
}

impl SweepBuffers {
    pub fn with_capacity(entries: usize) -> Self {
        Self {
            endpoints: Vec::with_capacity(entries * 2),
            active: Vec::with_capacity(entries),
        }
    }
}

/// Find overlapping entry pairs using sweep and prune
///
/// Every overlapping pair of entry indices `(i, j)` with `i < j` that
/// `filter` accepts is passed to `on_pair` once. The endpoint and active
/// lists are charged to `scratch` before they are filled.
pub fn sweep_and_prune(
    entries: &[BroadPhaseEntry],
    buffers: &mut SweepBuffers,
    scratch: &mut ScratchAllocator,
    mut filter: impl FnMut(usize, usize) -> bool,
    mut on_pair: impl FnMut(usize, usize),
) -> Result<(), PhysicsError> {
    if entries.len() < 2 {
        return Ok(());
    }
    scratch.reserve::<Endpoint>(entries.len() * 2)?;
    scratch.reserve::<usize>(entries.len())?;

    // Sort along the axis with the highest variance
    let axis = determine_best_axis(entries);

    let SweepBuffers { endpoints, active } = buffers;
    fill_endpoints(endpoints, entries, axis);
    // Min endpoints first on ties so touching boxes are reported
    endpoints.sort_unstable_by(|a, b| {
        a.value
            .partial_cmp(&b.value)
            .unwrap_or(Ordering::Equal)
            .then(b.is_min.cmp(&a.is_min))
            .then(a.index.cmp(&b.index))
    });

    active.clear();
    for endpoint in endpoints.iter() {
        if endpoint.is_min {
            for &active_index in active.iter() {
                let min_index = active_index.min(endpoint.index);
                let max_index = active_index.max(endpoint.index);
                if entries[active_index].aabb.overlaps(&entries[endpoint.index].aabb)
                    && filter(min_index, max_index)
                {
                    on_pair(min_index, max_index);
                }
            }
            active.push(endpoint.index);
        } else {
            active.retain(|&idx| idx != endpoint.index);
        }
    }

    Ok(())
}

/// Determine the best axis for sweep and prune based on variance
fn determine_best_axis(entries: &[BroadPhaseEntry]) -> Axis {
    let mut mean = Vec3::ZERO;
    let mut variance = Vec3::ZERO;

    for entry in entries {
        mean += entry.aabb.center();
    }
    mean /= entries.len() as f32;

    for entry in entries {
        let diff = entry.aabb.center() - mean;
        variance += diff * diff;
    }

    if variance.x > variance.y && variance.x > variance.z {
        Axis::X
    } else if variance.y > variance.z {
        Axis::Y
    } else {
        Axis::Z
    }
}

fn fill_endpoints(endpoints: &mut Vec<Endpoint>, entries: &[BroadPhaseEntry], axis: Axis) {
    endpoints.clear();

    for (index, entry) in entries.iter().enumerate() {
        let (min_val, max_val) = match axis {
            Axis::X => (entry.aabb.min.x, entry.aabb.max.x),
            Axis::Y => (entry.aabb.min.y, entry.aabb.max.y),
            Axis::Z => (entry.aabb.min.z, entry.aabb.max.z),
        };

        endpoints.push(Endpoint {
            value: min_val,
            index,
            is_min: true,
        });
        endpoints.push(Endpoint {
            value: max_val,
            index,
            is_min: false,
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct StaticEntry {
    entity: Entity,
    aabb: Aabb,
}

/// Cached bounds of everything on the non-moving broad-phase layer
#[derive(Debug, Default)]
pub struct StaticBroadPhase {
    entries: Vec<StaticEntry>,
    sorted: bool,
}

impl StaticBroadPhase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_optimized(&self) -> bool {
        self.sorted || self.entries.len() < 2
    }

    pub fn insert(&mut self, entity: Entity, aabb: Aabb) {
        self.entries.push(StaticEntry { entity, aabb });
        self.sorted = false;
    }

    pub fn remove(&mut self, entity: Entity) -> bool {
        let before = self.entries.len();
        // Order is preserved so a sorted list stays sorted
        self.entries.retain(|entry| entry.entity != entity);
        self.entries.len() != before
    }

    pub fn update(&mut self, entity: Entity, aabb: Aabb) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.entity == entity) {
            entry.aabb = aabb;
            self.sorted = false;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.sorted = false;
    }

    /// Sort entries by their minimum X so queries can stop early
    pub fn optimize(&mut self) {
        self.entries.sort_by(|a, b| {
            a.aabb
                .min
                .x
                .partial_cmp(&b.aabb.min.x)
                .unwrap_or(Ordering::Equal)
        });
        self.sorted = true;
    }

    /// Call `f` with every static entity whose bounds overlap `aabb`
    pub fn query(&self, aabb: &Aabb, mut f: impl FnMut(Entity)) {
        let candidates = if self.sorted {
            let end = self
                .entries
                .partition_point(|entry| entry.aabb.min.x <= aabb.max.x);
            &self.entries[..end]
        } else {
            &self.entries[..]
        };

        for entry in candidates {
            if entry.aabb.overlaps(aabb) {
                f(entry.entity);
            }
        }
    }
}
