//! Activation and contact observers
//!
//! Events are collected while a step runs and delivered on the simulation
//! thread once the parallel work has joined, in a deterministic order.
//! A panicking callback is caught and logged; the step carries on.

use crate::physics::body::BodyHandle;
use glam::Vec3;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, trace};

/// Contact geometry handed to contact callbacks, in simulation space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactManifold {
    pub body_a: BodyHandle,
    pub body_b: BodyHandle,
    /// Deepest contact point
    pub point: Vec3,
    /// Normal pointing from A to B
    pub normal: Vec3,
    pub penetration: f32,
    /// Number of contact points between the pair
    pub point_count: usize,
}

/// Notified when a dynamic body wakes up or falls asleep
pub trait ActivationListener: Send {
    fn on_body_activated(&self, body: BodyHandle);
    fn on_body_deactivated(&self, body: BodyHandle);
}

/// Notified when two bodies start touching, keep touching, or separate
pub trait ContactListener: Send {
    fn on_contact_added(&self, manifold: &ContactManifold);
    fn on_contact_persisted(&self, manifold: &ContactManifold);
    fn on_contact_removed(&self, body_a: BodyHandle, body_b: BodyHandle);
}

/// Default activation listener; logs transitions
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActivationListener;

impl ActivationListener for LoggingActivationListener {
    fn on_body_activated(&self, body: BodyHandle) {
        debug!(target: "physics", ?body, "Body activated");
    }

    fn on_body_deactivated(&self, body: BodyHandle) {
        debug!(target: "physics", ?body, "Body went to sleep");
    }
}

/// Default contact listener; logs contacts without reacting to them
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingContactListener;

impl ContactListener for LoggingContactListener {
    fn on_contact_added(&self, manifold: &ContactManifold) {
        debug!(
            target: "physics",
            body_a = ?manifold.body_a,
            body_b = ?manifold.body_b,
            penetration = manifold.penetration,
            "Contact added"
        );
    }

    fn on_contact_persisted(&self, manifold: &ContactManifold) {
        trace!(
            target: "physics",
            body_a = ?manifold.body_a,
            body_b = ?manifold.body_b,
            "Contact persisted"
        );
    }

    fn on_contact_removed(&self, body_a: BodyHandle, body_b: BodyHandle) {
        debug!(target: "physics", ?body_a, ?body_b, "Contact removed");
    }
}

/// Event recorded during a step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhysicsEvent {
    Activated(BodyHandle),
    Deactivated(BodyHandle),
    ContactAdded(ContactManifold),
    ContactPersisted(ContactManifold),
    ContactRemoved(BodyHandle, BodyHandle),
}

/// The two listeners registered with a world
pub struct Listeners {
    pub activation: Box<dyn ActivationListener>,
    pub contact: Box<dyn ContactListener>,
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            activation: Box::new(LoggingActivationListener),
            contact: Box::new(LoggingContactListener),
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").finish_non_exhaustive()
    }
}

impl Listeners {
    /// Deliver events in order; returns how many callbacks panicked
    pub fn dispatch(&self, events: &[PhysicsEvent]) -> usize {
        events
            .iter()
            .filter(|event| !self.dispatch_one(event))
            .count()
    }

    fn dispatch_one(&self, event: &PhysicsEvent) -> bool {
        match event {
            PhysicsEvent::Activated(body) => guarded("activation", "activated", || {
                self.activation.on_body_activated(*body)
            }),
            PhysicsEvent::Deactivated(body) => guarded("activation", "deactivated", || {
                self.activation.on_body_deactivated(*body)
            }),
            PhysicsEvent::ContactAdded(manifold) => guarded("contact", "added", || {
                self.contact.on_contact_added(manifold)
            }),
            PhysicsEvent::ContactPersisted(manifold) => guarded("contact", "persisted", || {
                self.contact.on_contact_persisted(manifold)
            }),
            PhysicsEvent::ContactRemoved(a, b) => guarded("contact", "removed", || {
                self.contact.on_contact_removed(*a, *b)
            }),
        }
    }
}

/// Run a callback, containing any panic; returns false if it panicked
fn guarded(listener: &'static str, event: &'static str, callback: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                target: "physics",
                listener,
                event,
                reason = panic_message(payload.as_ref()),
                "Physics listener panicked; event dropped"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Exploding;

    impl ActivationListener for Exploding {
        fn on_body_activated(&self, _body: BodyHandle) {
            panic!("listener failure");
        }

        fn on_body_deactivated(&self, _body: BodyHandle) {}
    }

    struct Counting(Arc<AtomicUsize>);

    impl ContactListener for Counting {
        fn on_contact_added(&self, _manifold: &ContactManifold) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn on_contact_persisted(&self, _manifold: &ContactManifold) {}

        fn on_contact_removed(&self, _body_a: BodyHandle, _body_b: BodyHandle) {
            self.0.fetch_add(10, Ordering::SeqCst);
        }
    }

    fn handles() -> (BodyHandle, BodyHandle) {
        let mut world = hecs::World::new();
        (
            BodyHandle::from_entity(world.spawn(())),
            BodyHandle::from_entity(world.spawn(())),
        )
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let (a, b) = handles();
        let count = Arc::new(AtomicUsize::new(0));
        let listeners = Listeners {
            activation: Box::new(Exploding),
            contact: Box::new(Counting(count.clone())),
        };

        let manifold = ContactManifold {
            body_a: a,
            body_b: b,
            point: Vec3::ZERO,
            normal: Vec3::Y,
            penetration: 0.01,
            point_count: 1,
        };
        let events = [
            PhysicsEvent::Activated(a),
            PhysicsEvent::ContactAdded(manifold),
            PhysicsEvent::ContactRemoved(a, b),
        ];

        assert_eq!(listeners.dispatch(&events), 1);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_default_listeners_log_only() {
        let (a, _) = handles();
        let listeners = Listeners::default();
        let events = [PhysicsEvent::Activated(a), PhysicsEvent::Deactivated(a)];
        assert_eq!(listeners.dispatch(&events), 0);
    }
}
