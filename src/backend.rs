//! Physics backend abstraction.
//!
//! This module defines the trait that physics backends must implement
//! to work with the gravity character. The backend answers collision
//! queries for the movement step and applies the impulses and forces the
//! step produces for simulated bodies. This allows easy swapping between
//! physics engines (Rapier3D, the analytic scene, custom, etc.).

use bevy::prelude::*;

use crate::collision::CollisionQuery;
use crate::impact::PhysicsImpulse;
use crate::state::CharacterController;

/// Trait for physics backend implementations.
///
/// All functions are static and operate on the [`World`], so systems stay
/// generic over the backend. Only [`with_collision`](Self::with_collision)
/// and the body velocity functions are required.
///
/// # Example
///
/// ```rust
/// use bevy::prelude::*;
/// use msg_gravity_character::prelude::*;
///
/// let mut world = World::new();
/// world.insert_resource(SceneCollision::new());
/// let blocked = SceneBackend::with_collision(&mut world, |_world, query| {
///     query.line_trace(Vec3::Y, Vec3::NEG_Y, None).blocking_hit
/// });
/// assert!(!blocked);
/// ```
pub trait CharacterPhysicsBackend: 'static + Send + Sync {
    /// Returns the plugin that sets up this backend.
    fn plugin() -> impl Plugin;

    /// Run `f` with read access to the world and its collision queries.
    ///
    /// Takes the world mutably so backends can keep cached query state in
    /// it; `f` only sees it read-only.
    fn with_collision<R>(world: &mut World, f: impl FnOnce(&World, &dyn CollisionQuery) -> R) -> R;

    /// Whether the entity is a body moved by the physics simulation.
    fn is_simulating(world: &World, entity: Entity) -> bool;

    /// Whether the entity may move between steps, so characters standing on
    /// it follow it.
    fn is_movable(world: &World, entity: Entity) -> bool {
        Self::is_simulating(world, entity)
    }

    /// Get the mass of a body.
    fn get_mass(_world: &World, _entity: Entity) -> f32 {
        // Default implementation returns 1.0 (no scaling)
        1.0
    }

    /// Get the linear velocity of a body.
    fn get_body_velocity(world: &World, entity: Entity) -> Vec3;

    /// Get the angular velocity of a body, in radians per second.
    fn get_body_angular_velocity(_world: &World, _entity: Entity) -> Vec3 {
        Vec3::ZERO
    }

    /// Half size of the body's bounding box, if known.
    fn get_half_extents(_world: &World, _entity: Entity) -> Option<Vec3> {
        None
    }

    /// Apply an impulse at a world point.
    fn apply_impulse_at(world: &mut World, entity: Entity, impulse: Vec3, point: Vec3);

    /// Apply a force at a world point for the next physics step.
    fn apply_force_at(world: &mut World, entity: Entity, force: Vec3, point: Vec3);

    /// Overwrite the linear velocity of a body.
    fn set_body_velocity(world: &mut World, entity: Entity, velocity: Vec3);

    /// Get the fixed timestep delta time.
    fn get_fixed_timestep(world: &World) -> f32 {
        world
            .get_resource::<Time<Fixed>>()
            .map(|t| t.delta_secs())
            .filter(|&d| d > 0.0)
            .unwrap_or(1.0 / 60.0)
    }

    /// Apply a push queued by the movement step.
    fn apply_physics_impulse(world: &mut World, impulse: PhysicsImpulse) {
        match impulse {
            PhysicsImpulse::ImpulseAt { entity, impulse, point } => Self::apply_impulse_at(world, entity, impulse, point),
            PhysicsImpulse::Impulse { entity, impulse } => {
                let point = world
                    .get::<Transform>(entity)
                    .map_or(Vec3::ZERO, |t| t.translation);
                Self::apply_impulse_at(world, entity, impulse, point);
            }
            PhysicsImpulse::ForceAt { entity, force, point } => Self::apply_force_at(world, entity, force, point),
            PhysicsImpulse::SetLinearVelocity { entity, velocity } => Self::set_body_velocity(world, entity, velocity),
        }
    }
}

/// Empty plugin for backends that don't need additional setup.
pub struct NoOpBackendPlugin;

impl Plugin for NoOpBackendPlugin {
    fn build(&self, _app: &mut App) {}
}

/// Read access to other bodies for the movement step.
pub trait BodyQuery {
    /// Whether the entity is another character.
    fn is_character(&self, entity: Entity) -> bool;

    /// Whether the entity may move, so it can carry characters.
    fn is_movable(&self, entity: Entity) -> bool;

    /// Whether the entity is simulated by the physics engine.
    fn is_simulating(&self, _entity: Entity) -> bool {
        false
    }

    fn transform(&self, entity: Entity) -> Option<Transform>;

    fn linear_velocity(&self, entity: Entity) -> Vec3;

    fn angular_velocity(&self, entity: Entity) -> Vec3;

    fn mass(&self, _entity: Entity) -> f32 {
        1.0
    }

    /// Half size of the bounding box.
    fn half_extents(&self, _entity: Entity) -> Option<Vec3> {
        None
    }
}

/// A world without bodies: everything is static geometry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBodies;

impl BodyQuery for NoBodies {
    fn is_character(&self, _entity: Entity) -> bool {
        false
    }

    fn is_movable(&self, _entity: Entity) -> bool {
        false
    }

    fn transform(&self, _entity: Entity) -> Option<Transform> {
        None
    }

    fn linear_velocity(&self, _entity: Entity) -> Vec3 {
        Vec3::ZERO
    }

    fn angular_velocity(&self, _entity: Entity) -> Vec3 {
        Vec3::ZERO
    }
}

/// [`BodyQuery`] over the ECS world through a backend.
pub struct WorldBodies<'w, B: CharacterPhysicsBackend> {
    world: &'w World,
    _marker: std::marker::PhantomData<B>,
}

impl<'w, B: CharacterPhysicsBackend> WorldBodies<'w, B> {
    pub fn new(world: &'w World) -> Self {
        Self {
            world,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<B: CharacterPhysicsBackend> BodyQuery for WorldBodies<'_, B> {
    fn is_character(&self, entity: Entity) -> bool {
        self.world.get::<CharacterController>(entity).is_some()
    }

    fn is_movable(&self, entity: Entity) -> bool {
        B::is_movable(self.world, entity)
    }

    fn is_simulating(&self, entity: Entity) -> bool {
        B::is_simulating(self.world, entity)
    }

    fn transform(&self, entity: Entity) -> Option<Transform> {
        // Local transforms are authoritative inside the fixed step; the
        // propagated one lags a frame behind.
        self.world
            .get::<Transform>(entity)
            .copied()
            .or_else(|| self.world.get::<GlobalTransform>(entity).map(|t| t.compute_transform()))
    }

    fn linear_velocity(&self, entity: Entity) -> Vec3 {
        B::get_body_velocity(self.world, entity)
    }

    fn angular_velocity(&self, entity: Entity) -> Vec3 {
        B::get_body_angular_velocity(self.world, entity)
    }

    fn mass(&self, entity: Entity) -> f32 {
        B::get_mass(self.world, entity)
    }

    fn half_extents(&self, entity: Entity) -> Option<Vec3> {
        B::get_half_extents(self.world, entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{SceneBackend, SceneBody};

    fn create_world() -> World {
        let mut world = World::new();
        world.insert_resource(Time::<Fixed>::from_hz(60.0));
        world
    }

    #[test]
    fn fixed_timestep_falls_back_before_first_step() {
        let world = create_world();
        assert!((SceneBackend::get_fixed_timestep(&world) - 1.0 / 60.0).abs() < 1e-6);
    }

    #[test]
    fn world_bodies_read_backend_state() {
        let mut world = create_world();
        let body = world
            .spawn((
                Transform::from_xyz(1.0, 2.0, 3.0),
                SceneBody::simulating(5.0).with_velocity(Vec3::X * 4.0),
            ))
            .id();
        let character = world.spawn(CharacterController::default()).id();

        let bodies = WorldBodies::<SceneBackend>::new(&world);
        assert!(bodies.is_simulating(body));
        assert!(bodies.is_movable(body));
        assert_eq!(bodies.mass(body), 5.0);
        assert_eq!(bodies.linear_velocity(body), Vec3::X * 4.0);
        assert_eq!(bodies.transform(body).map(|t| t.translation), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert!(bodies.is_character(character));
        assert!(!bodies.is_character(body));
    }

    #[test]
    fn queued_impulses_reach_the_body() {
        let mut world = create_world();
        let body = world
            .spawn((Transform::from_xyz(0.0, 0.0, 0.0), SceneBody::simulating(2.0)))
            .id();

        SceneBackend::apply_physics_impulse(
            &mut world,
            PhysicsImpulse::Impulse {
                entity: body,
                impulse: Vec3::X * 10.0,
            },
        );
        assert_eq!(SceneBackend::get_body_velocity(&world, body), Vec3::X * 5.0);

        SceneBackend::apply_physics_impulse(
            &mut world,
            PhysicsImpulse::SetLinearVelocity {
                entity: body,
                velocity: Vec3::ZERO,
            },
        );
        assert_eq!(SceneBackend::get_body_velocity(&world, body), Vec3::ZERO);
    }

    #[test]
    fn no_bodies_is_static() {
        let mut world = World::new();
        let entity = world.spawn_empty().id();
        assert!(!NoBodies.is_movable(entity));
        assert!(!NoBodies.is_simulating(entity));
        assert_eq!(NoBodies.mass(entity), 1.0);
    }
}
