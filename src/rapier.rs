//! Rapier3D physics backend implementation.
//!
//! This module provides the physics backend for Bevy Rapier3D.
//! Enable with the `rapier3d` feature.
//!
//! Collision queries go through the default [`RapierContext`]: capsule
//! sweeps are shape casts, line traces are ray casts and overlaps are
//! intersection tests. Characters are kinematic; their capsule is moved by
//! the movement step and Rapier only sees the result.

use bevy::ecs::system::SystemState;
use bevy::prelude::*;
use bevy_rapier3d::prelude::*;

use crate::backend::CharacterPhysicsBackend;
use crate::collision::{CapsuleShape, CollisionQuery, HitResult};
use crate::config::ControllerConfig;
use crate::events::MovementEvents;
use crate::gravity::GravityField;
use crate::intent::MovementIntent;
use crate::math::{KINDA_SMALL_NUMBER, SMALL_NUMBER};
use crate::scene::SceneCollision;
use crate::state::CharacterController;
use crate::GravityCharacterSet;

/// Rapier3D physics backend for the gravity character.
///
/// Impulses go through [`ExternalImpulse`]. Forces are accumulated per
/// fixed step and handed to [`ExternalForce`] at the end of it, so forces
/// set by other code are preserved.
pub struct Rapier3dBackend;

/// Cached system state for reading the Rapier context from exclusive
/// systems.
#[derive(Resource)]
struct RapierQueryState(SystemState<ReadRapierContext<'static, 'static>>);

impl CharacterPhysicsBackend for Rapier3dBackend {
    fn plugin() -> impl Plugin {
        Rapier3dBackendPlugin
    }

    fn with_collision<R>(world: &mut World, f: impl FnOnce(&World, &dyn CollisionQuery) -> R) -> R {
        if !world.contains_resource::<RapierQueryState>() {
            let state = SystemState::<ReadRapierContext>::new(world);
            world.insert_resource(RapierQueryState(state));
        }
        world.resource_scope(|world, mut state: Mut<RapierQueryState>| {
            let world: &World = world;
            let rapier_context = state.0.get(world);
            let Ok(context) = rapier_context.single() else {
                warn_once!("no Rapier context; character collision queries see an empty world");
                return f(world, &SceneCollision::default());
            };
            f(world, &RapierCollision { world, context: &context })
        })
    }

    fn is_simulating(world: &World, entity: Entity) -> bool {
        matches!(world.get::<RigidBody>(entity), Some(RigidBody::Dynamic))
    }

    fn is_movable(world: &World, entity: Entity) -> bool {
        matches!(
            world.get::<RigidBody>(entity),
            Some(RigidBody::Dynamic | RigidBody::KinematicPositionBased | RigidBody::KinematicVelocityBased)
        )
    }

    fn get_mass(world: &World, entity: Entity) -> f32 {
        world
            .get::<ReadMassProperties>(entity)
            .map(|props| props.mass)
            .filter(|&mass| mass > 0.0 && mass.is_finite())
            .unwrap_or(1.0)
    }

    fn get_body_velocity(world: &World, entity: Entity) -> Vec3 {
        world
            .get::<Velocity>(entity)
            .map(|v| v.linvel)
            .unwrap_or(Vec3::ZERO)
    }

    fn get_body_angular_velocity(world: &World, entity: Entity) -> Vec3 {
        world
            .get::<Velocity>(entity)
            .map(|v| v.angvel)
            .unwrap_or(Vec3::ZERO)
    }

    fn get_half_extents(world: &World, entity: Entity) -> Option<Vec3> {
        let collider = world.get::<Collider>(entity)?;
        if let Some(cuboid) = collider.as_cuboid() {
            Some(cuboid.half_extents())
        } else if let Some(ball) = collider.as_ball() {
            Some(Vec3::splat(ball.radius()))
        } else {
            None
        }
    }

    fn apply_impulse_at(world: &mut World, entity: Entity, impulse: Vec3, point: Vec3) {
        let center = center_of_mass(world, entity);
        let mass = Self::get_mass(world, entity);
        if let Some(mut ext_impulse) = world.get_mut::<ExternalImpulse>(entity) {
            let at_point = ExternalImpulse::at_point(impulse, point, center);
            ext_impulse.impulse += at_point.impulse;
            ext_impulse.torque_impulse += at_point.torque_impulse;
        } else if let Some(mut vel) = world.get_mut::<Velocity>(entity) {
            // Fallback: apply as velocity change if no ExternalImpulse component
            vel.linvel += impulse / mass;
        }
    }

    fn apply_force_at(world: &mut World, entity: Entity, force: Vec3, point: Vec3) {
        let center = center_of_mass(world, entity);
        let at_point = ExternalForce::at_point(force, point, center);
        let Ok(mut entity_mut) = world.get_entity_mut(entity) else {
            return;
        };
        match entity_mut.get_mut::<AccumulatedForces>() {
            Some(mut forces) => {
                forces.force += at_point.force;
                forces.torque += at_point.torque;
            }
            None => {
                entity_mut.insert(AccumulatedForces {
                    force: at_point.force,
                    torque: at_point.torque,
                    ..default()
                });
            }
        }
    }

    fn set_body_velocity(world: &mut World, entity: Entity, velocity: Vec3) {
        if let Some(mut vel) = world.get_mut::<Velocity>(entity) {
            vel.linvel = velocity;
        }
    }
}

fn center_of_mass(world: &World, entity: Entity) -> Vec3 {
    let translation = world
        .get::<GlobalTransform>(entity)
        .map(|t| t.translation())
        .or_else(|| world.get::<Transform>(entity).map(|t| t.translation))
        .unwrap_or(Vec3::ZERO);
    let local_center = world
        .get::<ReadMassProperties>(entity)
        .map(|props| props.local_center_of_mass)
        .unwrap_or(Vec3::ZERO);
    translation + local_center
}

/// Forces queued by the movement step for one body.
///
/// `applied` remembers what was handed to Rapier last step so it can be
/// taken back out of [`ExternalForce`] without touching other forces.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct AccumulatedForces {
    pub force: Vec3,
    pub torque: Vec3,
    applied_force: Vec3,
    applied_torque: Vec3,
}

/// Plugin that sets up Rapier3D-specific systems for the gravity character.
pub struct Rapier3dBackendPlugin;

impl Plugin for Rapier3dBackendPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(
            FixedUpdate,
            clear_accumulated_forces.in_set(GravityCharacterSet::Preparation),
        );
        app.add_systems(
            FixedUpdate,
            apply_accumulated_forces.in_set(GravityCharacterSet::Finalize),
        );
    }
}

/// Take last step's forces back out of [`ExternalForce`].
pub fn clear_accumulated_forces(mut q: Query<(&mut AccumulatedForces, Option<&mut ExternalForce>)>) {
    for (mut forces, ext_force) in &mut q {
        if let Some(mut ext_force) = ext_force {
            ext_force.force -= forces.applied_force;
            ext_force.torque -= forces.applied_torque;
        }
        forces.applied_force = Vec3::ZERO;
        forces.applied_torque = Vec3::ZERO;
    }
}

/// Hand this step's forces to Rapier.
pub fn apply_accumulated_forces(
    mut commands: Commands,
    mut q: Query<(Entity, &mut AccumulatedForces, Option<&mut ExternalForce>)>,
) {
    for (entity, mut forces, ext_force) in &mut q {
        let (force, torque) = (forces.force, forces.torque);
        match ext_force {
            Some(mut ext_force) => {
                ext_force.force += force;
                ext_force.torque += torque;
            }
            None => {
                commands.entity(entity).insert(ExternalForce { force, torque });
            }
        }
        forces.applied_force = force;
        forces.applied_torque = torque;
        forces.force = Vec3::ZERO;
        forces.torque = Vec3::ZERO;
    }
}

// ==================== Collision Queries ====================

/// [`CollisionQuery`] over a Rapier context.
struct RapierCollision<'a, 'c> {
    world: &'a World,
    context: &'a RapierContext<'c>,
}

fn capsule_collider(shape: CapsuleShape) -> Collider {
    Collider::capsule_y(shape.segment_half_length(), shape.radius)
}

fn query_filter<'f>(ignore: Option<Entity>) -> QueryFilter<'f> {
    let filter = QueryFilter::default().exclude_sensors();
    match ignore {
        Some(entity) => filter.exclude_rigid_body(entity).exclude_collider(entity),
        None => filter,
    }
}

/// Deepest point of the capsule along `-normal`.
fn capsule_support(center: Vec3, rotation: Quat, shape: CapsuleShape, normal: Vec3) -> Vec3 {
    let (a, b) = shape.segment(center, rotation);
    let (da, db) = (a.dot(normal), b.dot(normal));
    let axis_point = if (da - db).abs() <= SMALL_NUMBER {
        (a + b) * 0.5
    } else if da < db {
        a
    } else {
        b
    };
    axis_point - normal * shape.radius
}

impl RapierCollision<'_, '_> {
    fn collider_pose(&self, entity: Entity) -> Option<(&Collider, Vec3, Quat)> {
        let collider = self.world.get::<Collider>(entity)?;
        let transform = self.world.get::<GlobalTransform>(entity)?.compute_transform();
        Some((collider, transform.translation, transform.rotation))
    }

    /// Depth and push-out normal of a capsule overlapping `entity`, sampled
    /// at the segment end points and midpoint.
    fn penetration(&self, entity: Entity, center: Vec3, rotation: Quat, shape: CapsuleShape) -> Option<(f32, Vec3)> {
        let (collider, translation, collider_rotation) = self.collider_pose(entity)?;
        let (a, b) = shape.segment(center, rotation);
        [a, (a + b) * 0.5, b]
            .into_iter()
            .filter_map(|point| {
                let projection = collider.project_point(translation, collider_rotation, point, false);
                let offset = point - projection.point;
                let distance = offset.length();
                if distance <= SMALL_NUMBER {
                    return None;
                }
                let (depth, normal) = if projection.is_inside {
                    (shape.radius + distance, -offset / distance)
                } else {
                    (shape.radius - distance, offset / distance)
                };
                Some((depth, normal))
            })
            .max_by(|x, y| x.0.total_cmp(&y.0))
            .filter(|(depth, _)| *depth > 0.0)
    }
}

impl CollisionQuery for RapierCollision<'_, '_> {
    fn sweep_capsule(
        &self,
        start: Vec3,
        end: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> HitResult {
        let delta = end - start;
        let distance = delta.length();
        let collider = capsule_collider(shape);
        let filter = query_filter(ignore);
        let mut result = HitResult::miss(start, end);

        if distance <= SMALL_NUMBER {
            let mut overlapping = None;
            self.context
                .intersect_shape(start, rotation, &*collider.raw, filter, |entity| {
                    overlapping = Some(entity);
                    false
                });
            let Some(entity) = overlapping else {
                return result;
            };
            let (depth, normal) = self
                .penetration(entity, start, rotation, shape)
                .unwrap_or((SMALL_NUMBER, Vec3::Y));
            result.blocking_hit = true;
            result.start_penetrating = true;
            result.time = 0.0;
            result.distance = 0.0;
            result.location = start;
            result.normal = normal;
            result.impact_normal = normal;
            result.impact_point = capsule_support(start, rotation, shape, normal);
            result.penetration_depth = depth;
            result.entity = Some(entity);
            return result;
        }

        let direction = delta / distance;
        let options = ShapeCastOptions {
            max_time_of_impact: distance,
            stop_at_penetration: false,
            compute_impact_geometry_on_penetration: true,
            ..default()
        };
        let Some((entity, hit)) = self
            .context
            .cast_shape(start, rotation, direction, &*collider.raw, options, filter)
        else {
            return result;
        };

        let normal = hit
            .details
            .map(|d| d.normal1.normalize_or_zero())
            .filter(|n| *n != Vec3::ZERO)
            .unwrap_or(-direction);
        let penetrating = hit.time_of_impact <= KINDA_SMALL_NUMBER;

        result.blocking_hit = true;
        result.entity = Some(entity);
        result.time = (hit.time_of_impact / distance).clamp(0.0, 1.0);
        result.distance = distance * result.time;
        result.location = start + delta * result.time;
        result.normal = normal;
        result.impact_normal = normal;
        result.impact_point = capsule_support(result.location, rotation, shape, normal);

        if penetrating {
            let (depth, push) = self
                .penetration(entity, start, rotation, shape)
                .unwrap_or((SMALL_NUMBER, normal));
            result.start_penetrating = true;
            result.penetration_depth = depth;
            result.normal = push;
            result.impact_normal = push;
        }
        result
    }

    fn line_trace(&self, start: Vec3, end: Vec3, ignore: Option<Entity>) -> HitResult {
        let delta = end - start;
        let distance = delta.length();
        let mut result = HitResult::miss(start, end);
        if distance <= SMALL_NUMBER {
            return result;
        }
        let direction = delta / distance;
        let Some((entity, intersection)) =
            self.context
                .cast_ray_and_get_normal(start, direction, distance, true, query_filter(ignore))
        else {
            return result;
        };

        result.blocking_hit = true;
        result.entity = Some(entity);
        result.time = (intersection.time_of_impact / distance).clamp(0.0, 1.0);
        result.distance = intersection.time_of_impact;
        result.location = intersection.point;
        result.impact_point = intersection.point;
        result.normal = intersection.normal;
        result.impact_normal = intersection.normal;
        result.start_penetrating = intersection.time_of_impact <= 0.0;
        result
    }

    fn overlap_capsule(&self, location: Vec3, rotation: Quat, shape: CapsuleShape, ignore: Option<Entity>) -> bool {
        let mut found = false;
        self.context.intersect_shape(
            location,
            rotation,
            &*capsule_collider(shape).raw,
            query_filter(ignore),
            |_| {
                found = true;
                false
            },
        );
        found
    }

    fn overlapping_entities(
        &self,
        location: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> Vec<Entity> {
        let mut entities = Vec::new();
        self.context.intersect_shape(
            location,
            rotation,
            &*capsule_collider(shape).raw,
            query_filter(ignore),
            |entity| {
                entities.push(entity);
                true
            },
        );
        entities
    }

    fn closest_point(&self, entity: Entity, point: Vec3) -> Option<Vec3> {
        let (collider, translation, rotation) = self.collider_pose(entity)?;
        Some(collider.project_point(translation, rotation, point, true).point)
    }
}

// ==================== Bundle ====================

/// Bundle for creating a gravity character with Rapier3D physics.
///
/// The character is a kinematic capsule: the movement step moves it and
/// Rapier pushes dynamic bodies out of its way. The collider is built from
/// the [`CapsuleShape`].
///
/// # Example
///
/// ```ignore
/// use bevy::prelude::*;
/// use msg_gravity_character::prelude::*;
/// use msg_gravity_character::rapier::Rapier3dCharacterBundle;
///
/// fn spawn_player(mut commands: Commands) {
///     commands.spawn((
///         Transform::from_xyz(0.0, 200.0, 0.0),
///         Rapier3dCharacterBundle::new(CapsuleShape::default()).with_config(ControllerConfig::player()),
///     ));
/// }
/// ```
#[derive(Bundle)]
pub struct Rapier3dCharacterBundle {
    pub controller: CharacterController,
    pub config: ControllerConfig,
    pub shape: CapsuleShape,
    pub gravity: GravityField,
    pub intent: MovementIntent,
    pub events: MovementEvents,
    pub rigid_body: RigidBody,
    pub collider: Collider,
    pub velocity: Velocity,
}

impl Default for Rapier3dCharacterBundle {
    fn default() -> Self {
        Self::new(CapsuleShape::default())
    }
}

impl Rapier3dCharacterBundle {
    pub fn new(shape: CapsuleShape) -> Self {
        Self {
            controller: CharacterController::new(),
            config: ControllerConfig::default(),
            shape,
            gravity: GravityField::default(),
            intent: MovementIntent::default(),
            events: MovementEvents::default(),
            rigid_body: RigidBody::KinematicPositionBased,
            collider: capsule_collider(shape),
            velocity: Velocity::default(),
        }
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_gravity(mut self, gravity: GravityField) -> Self {
        self.gravity = gravity;
        self
    }
}
