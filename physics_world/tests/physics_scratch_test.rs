//! Scratch budget tests

use physics_world::physics::{box_shape, sphere_shape};
use physics_world::prelude::*;

fn falling_ball() -> BodyCreationSettings {
    BodyCreationSettings::dynamic(sphere_shape(5.0), Vec3::new(0.0, 0.0, 200.0), Quat::IDENTITY)
}

#[test]
fn test_exhausted_budget_fails_step_without_side_effects() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut world = PhysicsWorld::new(PhysicsConfig {
        temp_allocator_bytes: 16,
        worker_threads: Some(1),
        ..Default::default()
    })
    .unwrap();
    let ball = world.create_and_add_body(&falling_ball(), Activation::Activate).unwrap();
    let start = world.position(ball).unwrap();

    let err = world.update().unwrap_err();
    assert!(matches!(err, PhysicsError::ScratchExhausted { budget: 16, .. }));
    assert!(err.is_fatal());

    assert_eq!(world.step_count(), 0);
    assert_eq!(world.position(ball).unwrap(), start);
    assert_eq!(world.linear_velocity(ball).unwrap(), Vec3::ZERO);
}

#[test]
fn test_budget_is_reset_every_update() {
    let mut world = PhysicsWorld::new(PhysicsConfig {
        worker_threads: Some(1),
        ..Default::default()
    })
    .unwrap();
    world.create_and_add_body(&falling_ball(), Activation::Activate).unwrap();

    let first = world.update().unwrap();
    for _ in 0..50 {
        let stats = world.update().unwrap();
        // Usage does not accumulate across updates
        assert_eq!(stats.scratch_bytes, first.scratch_bytes);
    }
    assert!(first.scratch_bytes > 0);
    assert_eq!(world.scratch_high_water(), first.scratch_bytes);
}

fn first_update(ball_height: f32, budget: usize) -> (PhysicsWorld, Result<StepStats, PhysicsError>) {
    let mut world = PhysicsWorld::new(PhysicsConfig {
        temp_allocator_bytes: budget,
        worker_threads: Some(1),
        ..Default::default()
    })
    .unwrap();
    let floor = BodyCreationSettings::fixed(
        box_shape(Vec3::new(500.0, 500.0, 10.0)),
        Vec3::new(0.0, 0.0, -10.0),
        Quat::IDENTITY,
    );
    world.create_and_add_body(&floor, Activation::DontActivate).unwrap();
    let ball = BodyCreationSettings::dynamic(
        sphere_shape(5.0),
        Vec3::new(0.0, 0.0, ball_height),
        Quat::IDENTITY,
    );
    world.create_and_add_body(&ball, Activation::Activate).unwrap();
    let result = world.update();
    (world, result)
}

#[test]
fn test_contact_work_is_charged() {
    let (_, airborne) = first_update(200.0, 1024 * 1024);
    let airborne = airborne.unwrap();
    // Radius 5 at height 4 sinks an inch into the floor
    let (_, touching) = first_update(4.0, 1024 * 1024);
    let touching = touching.unwrap();
    assert_eq!(airborne.body_pairs, 0);
    assert_eq!(touching.body_pairs, 1);
    assert!(touching.contacts > 0);
    assert!(touching.scratch_bytes > airborne.scratch_bytes);

    // A budget that fits the airborne step cannot hold the contact
    let (world, result) = first_update(4.0, airborne.scratch_bytes);
    assert!(matches!(result, Err(PhysicsError::ScratchExhausted { .. })));
    assert_eq!(world.step_count(), 0);
    assert_eq!(world.contact_count(), 0);
}
