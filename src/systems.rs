//! Core character systems.
//!
//! These systems extract every character into a [`CharacterAgent`], run one
//! movement step per fixed tick and write the results back. They are
//! generic over the physics backend so the same step runs against Rapier or
//! the analytic scene.

use bevy::prelude::*;

use crate::backend::{CharacterPhysicsBackend, WorldBodies};
use crate::collision::CapsuleShape;
use crate::config::{ControllerConfig, InteractionConfig, OrientationConfig, SimulationTuning};
use crate::events::MovementEvents;
use crate::gravity::{GravityField, WorldGravity, WorldGravitySources};
use crate::intent::MovementIntent;
use crate::movement::{AgentSettings, CharacterAgent, CharacterMover, EnvironmentSnapshot};
use crate::projectile::GravityProjectile;
use crate::replication::{ClientPrediction, ReplicatedMovement};
use crate::state::{Airborne, CharacterController, Grounded, Submerged};
use crate::volume::{gravity_at, volume_at, VolumeGravityBody};

/// A character extracted from the ECS for one step.
struct Extracted {
    agent: CharacterAgent,
    settings: AgentSettings,
    has_intent: bool,
    replicated: Option<ReplicatedMovement>,
    prediction: Option<ClientPrediction>,
}

/// Run one movement step for every character.
///
/// Queued replication input is applied first: snapshots for proxies, then
/// server corrections for predicting clients. After the step, predicting
/// clients record the move and authorities capture a snapshot. Events in
/// [`MovementEvents`] are those of the latest step only.
pub fn simulate_characters<B: CharacterPhysicsBackend>(world: &mut World) {
    let dt = B::get_fixed_timestep(world);
    let world_gravity = world.get_resource::<WorldGravity>().copied().unwrap_or_default();
    let snapshot = EnvironmentSnapshot::gather(world);

    let mut extracted: Vec<Extracted> = world
        .query::<(
            Entity,
            &Transform,
            &CharacterController,
            Option<&CapsuleShape>,
            Option<&GravityField>,
            Option<&MovementIntent>,
            Option<&ControllerConfig>,
            Option<&OrientationConfig>,
            Option<&InteractionConfig>,
            Option<&SimulationTuning>,
            Option<&ReplicatedMovement>,
            Option<&ClientPrediction>,
        )>()
        .iter(world)
        .map(
            |(entity, transform, controller, shape, gravity, intent, config, orientation, interaction, tuning, replicated, prediction)| {
                let agent = CharacterAgent {
                    intent: intent.cloned().unwrap_or_default(),
                    ..CharacterAgent::new(
                        entity,
                        transform.translation,
                        transform.rotation,
                        shape.copied().unwrap_or_default(),
                    )
                    .with_controller(controller.clone())
                    .with_gravity(gravity.cloned().unwrap_or_default())
                };
                Extracted {
                    agent,
                    settings: AgentSettings {
                        config: config.cloned().unwrap_or_default(),
                        orientation: orientation.copied().unwrap_or_default(),
                        interaction: interaction.copied().unwrap_or_default(),
                        tuning: tuning.copied().unwrap_or_default(),
                    },
                    has_intent: intent.is_some(),
                    replicated: replicated.cloned(),
                    prediction: prediction.cloned(),
                }
            },
        )
        .collect();

    if extracted.is_empty() {
        return;
    }

    B::with_collision(world, |world, query| {
        let sources = WorldGravitySources::new(world, query);
        let bodies = WorldBodies::<B>::new(world);
        let env = snapshot.env(world_gravity, &sources, &bodies);

        for character in &mut extracted {
            let include_gravity = !character.settings.orientation.disable_gravity_replication;
            let mut mover = CharacterMover::new(query, env, &character.settings, &mut character.agent);

            if let Some(replicated) = character.replicated.as_mut() {
                if let Some(Err(error)) = replicated.apply_incoming(&mut mover) {
                    debug!("dropped snapshot for {:?}: {}", mover.agent.entity, error);
                }
            }
            if let Some(prediction) = character.prediction.as_mut() {
                prediction.apply_incoming(&mut mover);
            }

            mover.tick(dt);

            if let Some(prediction) = character.prediction.as_mut() {
                prediction.record(&character.agent, dt);
            }
            if let Some(replicated) = character.replicated.as_mut() {
                if replicated.is_authority() {
                    replicated.capture(&character.agent, include_gravity);
                }
            }
        }
    });

    for character in extracted {
        let Extracted {
            mut agent,
            has_intent,
            replicated,
            prediction,
            ..
        } = character;
        let impulses = std::mem::take(&mut agent.impulses);

        if let Ok(mut entity) = world.get_entity_mut(agent.entity) {
            if let Some(mut transform) = entity.get_mut::<Transform>() {
                transform.translation = agent.location;
                transform.rotation = agent.rotation;
            }
            entity.insert((agent.controller, agent.gravity, agent.shape, agent.events));
            if has_intent {
                entity.insert(agent.intent);
            }
            if let Some(replicated) = replicated {
                entity.insert(replicated);
            }
            if let Some(prediction) = prediction {
                entity.insert(prediction);
            }
        }

        for impulse in impulses {
            B::apply_physics_impulse(world, impulse);
        }
    }
}

/// Apply the gravity of their volume to simulated [`VolumeGravityBody`]
/// entities, or world gravity outside volumes.
///
/// The engine's own gravity should be disabled on these bodies.
pub fn apply_volume_gravity<B: CharacterPhysicsBackend>(world: &mut World) {
    let world_gravity = world.get_resource::<WorldGravity>().copied().unwrap_or_default();
    let snapshot = EnvironmentSnapshot::gather(world);
    let bodies: Vec<(Entity, Vec3)> = world
        .query_filtered::<(Entity, &Transform), With<VolumeGravityBody>>()
        .iter(world)
        .map(|(entity, transform)| (entity, transform.translation))
        .collect();
    if bodies.is_empty() {
        return;
    }

    let forces: Vec<(Entity, Vec3, Vec3)> = B::with_collision(world, |world, query| {
        let sources = WorldGravitySources::new(world, query);
        bodies
            .iter()
            .filter(|(entity, _)| B::is_simulating(world, *entity))
            .map(|&(entity, location)| {
                let gravity = gravity_at(&snapshot.volumes, location, &sources, &world_gravity);
                (entity, gravity * B::get_mass(world, entity), location)
            })
            .collect()
    });

    for (entity, force, location) in forces {
        B::apply_force_at(world, entity, force, location);
    }
}

/// Fly every [`GravityProjectile`] for one fixed step.
pub fn move_projectiles<B: CharacterPhysicsBackend>(world: &mut World) {
    let dt = B::get_fixed_timestep(world);
    let world_gravity = world.get_resource::<WorldGravity>().copied().unwrap_or_default();
    let snapshot = EnvironmentSnapshot::gather(world);
    let projectiles: Vec<(Entity, Vec3)> = world
        .query_filtered::<(Entity, &Transform), With<GravityProjectile>>()
        .iter(world)
        .map(|(entity, transform)| (entity, transform.translation))
        .collect();
    if projectiles.is_empty() {
        return;
    }

    let samples: Vec<(Entity, Vec3, Option<Entity>)> = B::with_collision(world, |world, query| {
        let sources = WorldGravitySources::new(world, query);
        projectiles
            .iter()
            .map(|&(entity, location)| {
                let gravity = gravity_at(&snapshot.volumes, location, &sources, &world_gravity);
                let volume = volume_at(&snapshot.volumes, location).map(|v| v.entity);
                (entity, gravity, volume)
            })
            .collect()
    });

    for (entity, gravity, volume) in samples {
        let Ok(mut entity_mut) = world.get_entity_mut(entity) else {
            continue;
        };
        let displacement = match entity_mut.get_mut::<GravityProjectile>() {
            Some(mut projectile) => {
                projectile.current_volume = volume;
                projectile.step(gravity, dt)
            }
            None => continue,
        };
        if let Some(mut transform) = entity_mut.get_mut::<Transform>() {
            transform.translation += displacement;
        }
    }
}

/// Sync state marker components from the movement mode.
pub fn sync_state_markers(
    mut commands: Commands,
    q_controllers: Query<(
        Entity,
        &CharacterController,
        Has<Grounded>,
        Has<Airborne>,
        Has<Submerged>,
    )>,
) {
    for (entity, controller, has_grounded, has_airborne, has_submerged) in &q_controllers {
        let grounded = controller.is_moving_on_ground();
        let airborne = controller.is_falling() || controller.is_flying();
        let submerged = controller.is_swimming();

        let mut entity_commands = commands.entity(entity);
        if grounded && !has_grounded {
            entity_commands.insert(Grounded);
        } else if !grounded && has_grounded {
            entity_commands.remove::<Grounded>();
        }

        if airborne && !has_airborne {
            entity_commands.insert(Airborne);
        } else if !airborne && has_airborne {
            entity_commands.remove::<Airborne>();
        }

        if submerged && !has_submerged {
            entity_commands.insert(Submerged);
        } else if !submerged && has_submerged {
            entity_commands.remove::<Submerged>();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{ClientAdjustment, MovementSnapshot};
    use crate::scene::{SceneBackend, SceneBody, SceneCollision, SceneShape};
    use crate::state::MovementMode;
    use crate::volume::PhysicsVolume;

    fn create_world() -> World {
        let mut world = World::new();
        world.insert_resource(Time::<Fixed>::from_hz(60.0));
        world.insert_resource(WorldGravity::default());
        world
    }

    fn spawn_floor(world: &mut World) -> Entity {
        world
            .spawn((Transform::IDENTITY, SceneShape::Plane { normal: Vec3::Y }))
            .id()
    }

    fn spawn_character(world: &mut World, location: Vec3) -> Entity {
        world
            .spawn((
                Transform::from_translation(location),
                CharacterController::default(),
                CapsuleShape::default(),
                MovementIntent::default(),
            ))
            .id()
    }

    fn step(world: &mut World) {
        let scene = SceneCollision::from_world(world);
        world.insert_resource(scene);
        simulate_characters::<SceneBackend>(world);
    }

    // ==================== Simulation Tests ====================

    #[test]
    fn character_falls_and_lands() {
        let mut world = create_world();
        spawn_floor(&mut world);
        let character = spawn_character(&mut world, Vec3::new(0.0, 150.0, 0.0));
        world
            .get_mut::<CharacterController>(character)
            .unwrap()
            .request_movement_mode(MovementMode::Falling);

        for _ in 0..120 {
            step(&mut world);
        }

        let controller = world.get::<CharacterController>(character).unwrap();
        let transform = world.get::<Transform>(character).unwrap();
        assert_eq!(controller.movement_mode(), MovementMode::Walking);
        assert!((transform.translation.y - 90.15).abs() < 0.5, "y = {}", transform.translation.y);
        assert!(world.get::<GravityField>(character).is_some());
        assert!(world.get::<MovementEvents>(character).is_some());
    }

    #[test]
    fn intent_moves_walking_character() {
        let mut world = create_world();
        spawn_floor(&mut world);
        let character = spawn_character(&mut world, Vec3::new(0.0, 90.15, 0.0));
        world
            .get_mut::<CharacterController>(character)
            .unwrap()
            .request_movement_mode(MovementMode::Walking);
        world.get_mut::<MovementIntent>(character).unwrap().set_input(Vec3::X);

        for _ in 0..30 {
            step(&mut world);
        }

        let transform = world.get::<Transform>(character).unwrap();
        assert!(transform.translation.x > 50.0, "x = {}", transform.translation.x);
    }

    #[test]
    fn prediction_records_every_step() {
        let mut world = create_world();
        spawn_floor(&mut world);
        let character = spawn_character(&mut world, Vec3::new(0.0, 90.15, 0.0));
        world.entity_mut(character).insert(ClientPrediction::new());

        for _ in 0..3 {
            step(&mut world);
        }
        let prediction = world.get::<ClientPrediction>(character).unwrap();
        assert_eq!(prediction.moves.len(), 3);

        let first = prediction.moves.iter().next().unwrap().timestamp;
        world
            .get_mut::<ClientPrediction>(character)
            .unwrap()
            .receive(ClientAdjustment::good_move(first));
        step(&mut world);
        assert_eq!(world.get::<ClientPrediction>(character).unwrap().moves.len(), 3);
    }

    #[test]
    fn authority_captures_and_proxy_follows() {
        let mut world = create_world();
        spawn_floor(&mut world);
        let authority = spawn_character(&mut world, Vec3::new(0.0, 300.0, 0.0));
        world.entity_mut(authority).insert(ReplicatedMovement::authority());
        world
            .get_mut::<CharacterController>(authority)
            .unwrap()
            .request_movement_mode(MovementMode::Falling);
        let proxy = spawn_character(&mut world, Vec3::new(500.0, 300.0, 0.0));
        world.entity_mut(proxy).insert(ReplicatedMovement::proxy());

        step(&mut world);
        let snapshot: MovementSnapshot = {
            let mut replicated = world.get_mut::<ReplicatedMovement>(authority).unwrap();
            assert!(replicated.take_dirty());
            replicated.snapshot().cloned().unwrap()
        };
        world.despawn(authority);
        world.get_mut::<ReplicatedMovement>(proxy).unwrap().receive(snapshot.clone());
        step(&mut world);

        let proxy_controller = world.get::<CharacterController>(proxy).unwrap();
        assert_eq!(proxy_controller.movement_mode(), MovementMode::Falling);
        assert_eq!(world.get::<ReplicatedMovement>(proxy).unwrap().version(), snapshot.version);
        let x = world.get::<Transform>(proxy).unwrap().translation.x;
        assert!(x.abs() < 1.0, "proxy x = {}", x);
    }

    // ==================== Volume Gravity Tests ====================

    #[test]
    fn volume_gravity_pushes_bodies() {
        let mut world = create_world();
        world.spawn((
            Transform::IDENTITY,
            PhysicsVolume::new(Vec3::splat(100.0)).with_gravity(GravityField::fixed(Vec3::X)),
        ));
        let inside = world
            .spawn((Transform::IDENTITY, SceneBody::simulating(2.0), VolumeGravityBody))
            .id();
        let outside = world
            .spawn((
                Transform::from_xyz(500.0, 0.0, 0.0),
                SceneBody::simulating(1.0),
                VolumeGravityBody,
            ))
            .id();
        let kinematic = world
            .spawn((Transform::IDENTITY, SceneBody::kinematic(), VolumeGravityBody))
            .id();

        apply_volume_gravity::<SceneBackend>(&mut world);

        let inside_force = world.get::<SceneBody>(inside).unwrap().force();
        assert!(inside_force.x > 0.0 && inside_force.y.abs() < 1e-3, "force {:?}", inside_force);
        assert_eq!(world.get::<SceneBody>(outside).unwrap().force(), Vec3::NEG_Y * 980.0);
        assert_eq!(world.get::<SceneBody>(kinematic).unwrap().force(), Vec3::ZERO);
    }

    #[test]
    fn projectiles_use_volume_gravity() {
        let mut world = create_world();
        let volume = world
            .spawn((
                Transform::IDENTITY,
                PhysicsVolume::new(Vec3::splat(1000.0)).with_gravity(GravityField::fixed(Vec3::X)),
            ))
            .id();
        let projectile = world
            .spawn((Transform::IDENTITY, GravityProjectile::default()))
            .id();

        move_projectiles::<SceneBackend>(&mut world);

        let state = world.get::<GravityProjectile>(projectile).unwrap();
        assert_eq!(state.current_volume, Some(volume));
        assert!(state.velocity.x > 0.0);
        assert!(world.get::<Transform>(projectile).unwrap().translation.x > 0.0);
    }

    // ==================== Marker Tests ====================

    fn controller_in(mode: MovementMode) -> CharacterController {
        CharacterController {
            movement_mode: mode,
            ..default()
        }
    }

    #[test]
    fn markers_follow_movement_mode() {
        let mut app = App::new();
        app.add_systems(Update, sync_state_markers);
        let character = app.world_mut().spawn(controller_in(MovementMode::Walking)).id();

        app.update();
        assert!(app.world().get::<Grounded>(character).is_some());
        assert!(app.world().get::<Airborne>(character).is_none());
        assert!(app.world().get::<Submerged>(character).is_none());

        *app.world_mut().get_mut::<CharacterController>(character).unwrap() = controller_in(MovementMode::Swimming);
        app.update();
        assert!(app.world().get::<Grounded>(character).is_none());
        assert!(app.world().get::<Submerged>(character).is_some());
    }

    #[test]
    fn pending_mode_reaches_markers_after_a_step() {
        let mut world = create_world();
        spawn_floor(&mut world);
        let character = spawn_character(&mut world, Vec3::new(0.0, 90.15, 0.0));
        world
            .get_mut::<CharacterController>(character)
            .unwrap()
            .request_movement_mode(MovementMode::Walking);

        step(&mut world);
        assert_eq!(
            world.get::<CharacterController>(character).unwrap().movement_mode(),
            MovementMode::Walking
        );

        let mut app = App::new();
        app.add_systems(Update, sync_state_markers);
        let controller = world.get::<CharacterController>(character).unwrap().clone();
        let marked = app.world_mut().spawn(controller).id();
        app.update();
        assert!(app.world().get::<Grounded>(marked).is_some());
    }
}
