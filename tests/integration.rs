//! Integration tests for the gravity character.
//!
//! These tests run the full plugin on a headless app and step `FixedUpdate`.
//! Each test produces PROOF through explicit position/mode/event checks.

use bevy::prelude::*;
use bevy::time::Virtual;
use msg_gravity_character::math::up_axis;
use msg_gravity_character::prelude::*;

/// Create a minimal test app with the analytic scene backend.
fn create_test_app() -> App {
    let mut app = App::new();

    app.add_plugins(MinimalPlugins);
    app.add_plugins(TransformPlugin);
    app.add_plugins(GravityCharacterPlugin::<SceneBackend>::default());
    app.insert_resource(Time::<Fixed>::from_hz(60.0));

    app.finish();
    app.cleanup();
    app
}

/// Spawn a ground plane whose surface passes through `position`.
fn spawn_ground(app: &mut App, position: Vec3) -> Entity {
    app.world_mut()
        .spawn((
            Transform::from_translation(position),
            SceneShape::Plane { normal: Vec3::Y },
        ))
        .id()
}

/// Spawn a character with default config.
fn spawn_character(app: &mut App, position: Vec3) -> Entity {
    spawn_character_with_config(app, position, ControllerConfig::default())
}

/// Spawn a character with custom config.
fn spawn_character_with_config(app: &mut App, position: Vec3, config: ControllerConfig) -> Entity {
    app.world_mut()
        .spawn((
            Transform::from_translation(position),
            CharacterController::with_mode(MovementMode::Falling),
            CapsuleShape::default(),
            config,
            MovementIntent::default(),
            GravityField::default(),
            MovementEvents::default(),
        ))
        .id()
}

/// Run one physics step.
fn tick(app: &mut App) {
    let timestep = std::time::Duration::from_secs_f64(1.0 / 60.0);
    app.world_mut()
        .resource_mut::<Time<Virtual>>()
        .advance_by(timestep);
    app.update();
    app.world_mut().run_schedule(bevy::prelude::FixedUpdate);
    app.update();
}

/// Run the app for N physics frames.
fn run_frames(app: &mut App, frames: usize) {
    for _ in 0..frames {
        tick(app);
    }
}

/// Run exactly one `FixedUpdate` without advancing virtual time.
fn fixed_step(app: &mut App) {
    app.world_mut().run_schedule(bevy::prelude::FixedUpdate);
}

fn controller(app: &App, entity: Entity) -> &CharacterController {
    app.world().get::<CharacterController>(entity).unwrap()
}

fn translation(app: &App, entity: Entity) -> Vec3 {
    app.world().get::<Transform>(entity).unwrap().translation
}

// ==================== Landing Tests ====================

mod landing {
    use super::*;

    #[test]
    fn falling_character_lands_on_ground() {
        let mut app = create_test_app();

        spawn_ground(&mut app, Vec3::ZERO);
        let character = spawn_character(&mut app, Vec3::new(0.0, 300.0, 0.0));

        run_frames(&mut app, 120);

        let mode = controller(&app, character).movement_mode();
        let position = translation(&app, character);
        println!("PROOF: mode={:?}, position={:?}", mode, position);

        // PROOF: capsule rests on the floor, half height plus the floor gap above it
        assert_eq!(mode, MovementMode::Walking);
        assert!(
            position.y > 88.0 && position.y < 92.5,
            "Capsule should rest just above the floor: {}",
            position.y
        );
    }

    #[test]
    fn grounded_marker_follows_landing() {
        let mut app = create_test_app();

        spawn_ground(&mut app, Vec3::ZERO);
        let character = spawn_character(&mut app, Vec3::new(0.0, 300.0, 0.0));

        tick(&mut app);
        let airborne = app.world().get::<Airborne>(character).is_some();

        run_frames(&mut app, 120);
        let grounded = app.world().get::<Grounded>(character).is_some();
        let still_airborne = app.world().get::<Airborne>(character).is_some();

        println!(
            "PROOF: airborne_at_start={}, grounded_after_landing={}, airborne_after_landing={}",
            airborne, grounded, still_airborne
        );
        assert!(airborne, "Falling character should carry Airborne");
        assert!(grounded, "Landed character should carry Grounded");
        assert!(!still_airborne, "Landed character should lose Airborne");
    }

    #[test]
    fn fall_time_matches_free_fall() {
        let mut app = create_test_app();
        let dt = 1.0 / 60.0;
        let gravity = 980.0;

        spawn_ground(&mut app, Vec3::ZERO);
        // Resting height is half height plus the floor gap; start 50 above it.
        let character = spawn_character(&mut app, Vec3::new(0.0, 90.15 + 50.0, 0.0));

        let mut landed_at = None;
        let mut landings = 0;
        for frame in 1..=90 {
            fixed_step(&mut app);
            let events = app.world().get::<MovementEvents>(character).unwrap();
            let landed = events.count(|e| {
                matches!(
                    e,
                    MovementEvent::MovementModeChanged {
                        previous: MovementMode::Falling,
                        current: MovementMode::Walking,
                    }
                )
            });
            landings += landed;
            if landed > 0 && landed_at.is_none() {
                landed_at = Some(frame as f32 * dt);
            }
        }

        let expected = (2.0_f32 * 50.0 / gravity).sqrt();
        let velocity = controller(&app, character).velocity;
        println!(
            "PROOF: landed_t={:?}, expected_t={}, falling_to_walking={}, velocity={:?}",
            landed_at, expected, landings, velocity
        );

        // PROOF: lands within a couple of fixed steps of the free-fall time, exactly once, at rest
        let landed_at = landed_at.expect("character should land");
        assert!(
            (landed_at - expected).abs() <= 2.0 * dt,
            "Landing time {} should be close to {}",
            landed_at,
            expected
        );
        assert_eq!(landings, 1, "Falling -> Walking should happen exactly once");
        assert!(velocity.y.abs() < 1e-3, "Vertical velocity should be zero after landing");
        assert_eq!(controller(&app, character).movement_mode(), MovementMode::Walking);
    }

    #[test]
    fn ditch_between_unwalkable_walls_lands() {
        let mut app = create_test_app();

        // Two 60 degree slopes meeting at the origin; neither is walkable.
        let slope = 60.0_f32.to_radians();
        app.world_mut().spawn((
            Transform::IDENTITY,
            SceneShape::Plane {
                normal: Vec3::new(slope.sin(), slope.cos(), 0.0),
            },
        ));
        app.world_mut().spawn((
            Transform::IDENTITY,
            SceneShape::Plane {
                normal: Vec3::new(-slope.sin(), slope.cos(), 0.0),
            },
        ));
        let character = spawn_character(&mut app, Vec3::new(0.0, 400.0, 0.0));

        for _ in 0..240 {
            fixed_step(&mut app);
        }

        let mode = controller(&app, character).movement_mode();
        let position = translation(&app, character);
        let velocity = controller(&app, character).velocity;
        println!("PROOF: mode={:?}, position={:?}, velocity={:?}", mode, position, velocity);

        // PROOF: the capsule settles in the ditch instead of sliding back and forth
        // Lower sphere touches both slopes at y = radius / cos(60) = 68, center 54 above that.
        assert_eq!(mode, MovementMode::Walking);
        assert!(
            position.y > 115.0 && position.y < 130.0,
            "Capsule should rest in the ditch: {}",
            position.y
        );
        assert!(position.x.abs() < 1.0, "Capsule should stay centered: {}", position.x);
        assert!(velocity.length() < 1.0, "Capsule should be at rest: {:?}", velocity);
    }
}

// ==================== Movement Tests ====================

mod movement {
    use super::*;

    #[test]
    fn walk_intent_moves_character_along_ground() {
        let mut app = create_test_app();

        spawn_ground(&mut app, Vec3::ZERO);
        let config = ControllerConfig::default().with_max_walk_speed(300.0);
        let character = spawn_character_with_config(&mut app, Vec3::new(0.0, 91.0, 0.0), config);
        run_frames(&mut app, 10);

        let start = translation(&app, character);
        app.world_mut()
            .get_mut::<MovementIntent>(character)
            .unwrap()
            .set_input(Vec3::Z);
        run_frames(&mut app, 60);

        let end = translation(&app, character);
        let velocity = controller(&app, character).velocity;
        println!("PROOF: start={:?}, end={:?}, velocity={:?}", start, end, velocity);

        // PROOF: moved forward, stayed on the floor and never exceeded max speed
        assert!(end.z - start.z > 100.0, "Character should walk along +Z");
        assert!((end.y - start.y).abs() < 1.0, "Character should stay on the floor");
        assert!(velocity.length() <= 300.0 + 1.0, "Speed should be capped: {}", velocity.length());
    }

    #[test]
    fn jump_leaves_ground_and_lands_again() {
        let mut app = create_test_app();

        spawn_ground(&mut app, Vec3::ZERO);
        let character = spawn_character(&mut app, Vec3::new(0.0, 91.0, 0.0));
        run_frames(&mut app, 10);
        let rest_height = translation(&app, character).y;

        app.world_mut()
            .get_mut::<MovementIntent>(character)
            .unwrap()
            .set_jump_pressed(true);
        run_frames(&mut app, 6);
        app.world_mut()
            .get_mut::<MovementIntent>(character)
            .unwrap()
            .set_jump_pressed(false);
        let jump_height = translation(&app, character).y;
        let mode_in_air = controller(&app, character).movement_mode();

        run_frames(&mut app, 120);
        let landed_height = translation(&app, character).y;
        let mode_after = controller(&app, character).movement_mode();

        println!(
            "PROOF: rest={}, in_air={} ({:?}), landed={} ({:?})",
            rest_height, jump_height, mode_in_air, landed_height, mode_after
        );
        assert!(jump_height > rest_height + 10.0, "Jump should lift the character");
        assert_eq!(mode_in_air, MovementMode::Falling);
        assert_eq!(mode_after, MovementMode::Walking);
        assert!((landed_height - rest_height).abs() < 1.0);
    }
}

// ==================== Step Up Tests ====================

mod walking {
    use super::*;

    const LEDGE_X: f32 = 300.0;

    /// Walk towards a box ledge of the given height and return where the
    /// character ends up.
    fn walk_toward_ledge(height: f32) -> (Vec3, MovementMode) {
        let mut app = create_test_app();

        spawn_ground(&mut app, Vec3::ZERO);
        app.world_mut().spawn((
            Transform::from_xyz(LEDGE_X + 500.0, height - 500.0, 0.0),
            SceneShape::Cuboid {
                half_extents: Vec3::splat(500.0),
            },
        ));
        let character = spawn_character(&mut app, Vec3::new(0.0, 91.0, 0.0));
        for _ in 0..10 {
            fixed_step(&mut app);
        }

        app.world_mut()
            .get_mut::<MovementIntent>(character)
            .unwrap()
            .set_input(Vec3::X);
        for _ in 0..120 {
            fixed_step(&mut app);
        }

        (translation(&app, character), controller(&app, character).movement_mode())
    }

    #[test]
    fn step_up_respects_max_step_height() {
        let max_step = ControllerConfig::default().max_step_height;
        let radius = CapsuleShape::default().radius;

        for height in [30.0, max_step - 1.0] {
            let (position, mode) = walk_toward_ledge(height);
            println!("PROOF: ledge={}, position={:?}, mode={:?}", height, position, mode);

            // PROOF: ledges up to max_step_height are climbed
            assert_eq!(mode, MovementMode::Walking);
            assert!(position.x > LEDGE_X, "Character should climb a {} ledge", height);
            assert!(
                (position.y - (height + 90.15)).abs() < 2.5,
                "Character should stand on top of the ledge: {}",
                position.y
            );
        }

        let (position, mode) = walk_toward_ledge(60.0);
        println!("PROOF: ledge=60, position={:?}, mode={:?}", position, mode);

        // PROOF: a ledge above max_step_height blocks without penetration
        assert_eq!(mode, MovementMode::Walking);
        assert!(
            position.x + radius <= LEDGE_X + 0.5,
            "Capsule should stop at the ledge face: {}",
            position.x
        );
        assert!((position.y - 90.15).abs() < 2.5, "Character should stay on the floor: {}", position.y);
    }
}

// ==================== Gravity Tests ====================

mod gravity {
    use super::*;

    #[test]
    fn point_gravity_reorients_capsule_on_planet() {
        let mut app = create_test_app();

        app.world_mut()
            .spawn((Transform::IDENTITY, SceneShape::Ball { radius: 500.0 }));
        let character = spawn_character(&mut app, Vec3::new(800.0, 0.0, 0.0));
        app.world_mut().entity_mut(character).insert((
            GravityField::point(Vec3::ZERO),
            OrientationConfig::follow_gravity(),
        ));

        run_frames(&mut app, 180);

        let position = translation(&app, character);
        let rotation = app.world().get::<Transform>(character).unwrap().rotation;
        let up = up_axis(rotation);
        let mode = controller(&app, character).movement_mode();
        println!("PROOF: position={:?}, up={:?}, mode={:?}", position, up, mode);

        // PROOF: the capsule stands on the side of the planet with its up axis pointing away from it
        assert_eq!(mode, MovementMode::Walking);
        assert!(up.x > 0.99, "Capsule up should point away from the planet: {:?}", up);
        assert!(
            position.x > 585.0 && position.x < 595.0,
            "Capsule should rest on the planet surface: {}",
            position.x
        );
    }

    #[test]
    fn gravity_change_is_reported_once() {
        let mut app = create_test_app();

        let character = spawn_character(&mut app, Vec3::new(0.0, 5000.0, 0.0));
        tick(&mut app);

        app.world_mut()
            .get_mut::<GravityField>(character)
            .unwrap()
            .set_fixed_direction(Vec3::X);
        app.world_mut().run_schedule(FixedUpdate);

        let events = app.world().get::<MovementEvents>(character).unwrap();
        let changes = events.count(|e| matches!(e, MovementEvent::GravityChanged { .. }));
        let velocity = controller(&app, character).velocity;
        println!("PROOF: gravity_changed_events={}, velocity={:?}", changes, velocity);

        assert_eq!(changes, 1, "GravityChanged should be queued once per change");
        assert!(velocity.x > 0.0, "Fall velocity should follow the new gravity");
    }
}

// ==================== Volume Tests ====================

mod volumes {
    use super::*;

    #[test]
    fn falling_into_water_starts_swimming() {
        let mut app = create_test_app();

        spawn_ground(&mut app, Vec3::new(0.0, -2000.0, 0.0));
        app.world_mut().spawn((
            Transform::IDENTITY,
            PhysicsVolume::water(Vec3::new(2000.0, 300.0, 2000.0)),
        ));
        let character = spawn_character(&mut app, Vec3::new(0.0, 500.0, 0.0));

        let mut saw_swimming = false;
        let mut saw_submerged = false;
        for _ in 0..120 {
            tick(&mut app);
            saw_swimming |= controller(&app, character).is_swimming();
            saw_submerged |= app.world().get::<Submerged>(character).is_some();
        }

        println!("PROOF: swimming={}, submerged_marker={}", saw_swimming, saw_submerged);
        assert!(saw_swimming, "Entering water should switch to swimming");
        assert!(saw_submerged, "Swimming character should carry Submerged");
    }

    #[test]
    fn projectile_follows_volume_gravity() {
        let mut app = create_test_app();

        app.world_mut().spawn((
            Transform::IDENTITY,
            PhysicsVolume::new(Vec3::splat(10_000.0)).with_gravity(GravityField::fixed(Vec3::X)),
        ));
        let projectile = app
            .world_mut()
            .spawn((Transform::IDENTITY, GravityProjectile::new(Vec3::ZERO)))
            .id();

        run_frames(&mut app, 30);

        let position = translation(&app, projectile);
        println!("PROOF: projectile position={:?}", position);
        assert!(position.x > 10.0, "Projectile should accelerate along the volume's gravity");
        assert!(position.y.abs() < 1e-3, "World gravity should not apply inside the volume");
    }
}

// ==================== Rapier Tests ====================

#[cfg(feature = "rapier3d")]
mod rapier {
    use super::*;
    use bevy_rapier3d::prelude::*;
    use msg_gravity_character::rapier::Rapier3dCharacterBundle;

    fn create_rapier_app() -> App {
        let mut app = App::new();

        app.add_plugins(MinimalPlugins);
        app.add_plugins(TransformPlugin);
        app.add_plugins(RapierPhysicsPlugin::<NoUserData>::default());
        app.add_plugins(GravityCharacterPlugin::<Rapier3dBackend>::default());
        app.insert_resource(Time::<Fixed>::from_hz(60.0));

        app.finish();
        app.cleanup();
        app
    }

    #[test]
    fn character_lands_on_rapier_ground() {
        let mut app = create_rapier_app();

        let transform = Transform::from_xyz(0.0, -50.0, 0.0);
        app.world_mut().spawn((
            transform,
            GlobalTransform::from(transform),
            RigidBody::Fixed,
            Collider::cuboid(2000.0, 50.0, 2000.0),
        ));
        let character = app
            .world_mut()
            .spawn((
                Transform::from_xyz(0.0, 300.0, 0.0),
                Rapier3dCharacterBundle::default(),
            ))
            .id();
        app.world_mut()
            .get_mut::<CharacterController>(character)
            .unwrap()
            .request_movement_mode(MovementMode::Falling);

        run_frames(&mut app, 120);

        let mode = controller(&app, character).movement_mode();
        let position = translation(&app, character);
        println!("PROOF: rapier mode={:?}, position={:?}", mode, position);
        assert_eq!(mode, MovementMode::Walking);
        assert!(
            position.y > 85.0 && position.y < 95.0,
            "Capsule should rest on the Rapier ground: {}",
            position.y
        );
    }
}
