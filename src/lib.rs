//! # `msg_gravity_character`
//!
//! A capsule character movement core for arbitrary gravity, with physics
//! backend abstraction.
//!
//! This crate provides a kinematic character that:
//! - Walks, falls, swims, flies and runs custom modes along any gravity direction
//! - Resolves gravity from fixed vectors, points, boxes, splines and collision geometry
//! - Keeps its capsule upright relative to gravity and to the floor it stands on
//! - Steps up ledges, perches on edges and rides moving bases
//! - Reacts to physics volumes (water, local gravity, terminal velocity)
//! - Pushes simulated bodies it touches
//! - Carries snapshots, saved moves and corrections for networked play
//! - Abstracts the physics backend (Rapier3D and an analytic scene included)
//!
//! ## Architecture
//!
//! Each fixed step runs in [`GravityCharacterSet`] order:
//! 1. **Preparation**: the backend syncs its collision state
//! 2. **Gravity**: simulated bodies receive the gravity of their volume
//! 3. **Simulation**: every character runs one movement step
//! 4. **Interaction**: projectiles integrate under volume gravity
//! 5. **Finalize**: forces are handed to the physics engine and state markers update
//!
//! ## Usage
//!
//! ```rust
//! use bevy::prelude::*;
//! use msg_gravity_character::prelude::*;
//!
//! // Components for a walking character under point gravity
//! let controller = CharacterController::new();
//! let config = ControllerConfig::player();
//! let mut gravity = GravityField::default();
//! gravity.set_point_direction(Vec3::ZERO);
//! let intent = MovementIntent::default();
//!
//! // These can be spawned with a Transform and a CapsuleShape
//! ```

use bevy::prelude::*;

pub mod backend;
pub mod collision;
pub mod config;
pub mod detection;
pub mod events;
pub mod gravity;
pub mod impact;
pub mod intent;
pub mod math;
pub mod movement;
pub mod orientation;
pub mod projectile;
pub mod replication;
pub mod scene;
pub mod state;
pub mod systems;
pub mod volume;

#[cfg(feature = "rapier3d")]
pub mod rapier;

pub mod prelude {
    //! Convenient re-exports for common usage.

    pub use crate::backend::{BodyQuery, CharacterPhysicsBackend, NoBodies};
    pub use crate::collision::{CapsuleShape, CollisionQuery, HitResult};
    pub use crate::config::{ControllerConfig, InteractionConfig, OrientationConfig, SimulationTuning};
    pub use crate::detection::{FloorResult, WalkableSlopeOverride};
    pub use crate::events::{MovementEvent, MovementEvents};
    pub use crate::gravity::{
        GravityBounds, GravityField, GravityMode, GravitySpline, NoGravitySources, WorldGravity,
    };
    pub use crate::impact::PhysicsImpulse;
    pub use crate::intent::MovementIntent;
    pub use crate::movement::{
        AgentSettings, CharacterAgent, CharacterMover, CustomMovement, CustomMovementModes, EnvironmentSnapshot,
    };
    pub use crate::projectile::GravityProjectile;
    pub use crate::replication::{
        ClientAdjustment, ClientPrediction, CorrectionError, GravitySnapshot, MovementSnapshot, ReplicatedMovement,
        SavedMove, SavedMoves, ServerMoveCheck, SnapshotError,
    };
    pub use crate::scene::{SceneBackend, SceneBodies, SceneBody, SceneCollision, SceneShape};
    pub use crate::state::{Airborne, CharacterController, GroundMovementMode, Grounded, MovementMode, Submerged};
    pub use crate::volume::{PhysicsVolume, VolumeGravityBody};
    pub use crate::{GravityCharacterPlugin, GravityCharacterSet};

    #[cfg(feature = "rapier3d")]
    pub use crate::rapier::Rapier3dBackend;
}

/// Ordering of the character systems inside `FixedUpdate`.
#[derive(SystemSet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GravityCharacterSet {
    /// Backend bookkeeping before anything moves.
    Preparation,
    /// Volume gravity for simulated bodies.
    Gravity,
    /// The character movement step.
    Simulation,
    /// Projectiles and other bodies reacting to the step.
    Interaction,
    /// Hand results to the physics engine and update markers.
    Finalize,
}

/// Main plugin for the gravity character system.
///
/// This plugin is generic over a physics backend `B` which provides the actual
/// physics operations (shape casts, impulses, etc.).
///
/// # Type Parameters
/// - `B`: The physics backend implementation (e.g., `Rapier3dBackend`)
///
/// # Examples
///
/// With Rapier3D backend:
/// ```rust,no_run
/// use bevy::prelude::*;
/// use bevy_rapier3d::prelude::*;
/// use msg_gravity_character::prelude::*;
///
/// App::new()
///     .add_plugins(DefaultPlugins)
///     .add_plugins(RapierPhysicsPlugin::<NoUserData>::default())
///     .add_plugins(GravityCharacterPlugin::<Rapier3dBackend>::default())
///     .run();
/// ```
pub struct GravityCharacterPlugin<B: backend::CharacterPhysicsBackend> {
    _marker: std::marker::PhantomData<B>,
}

impl<B: backend::CharacterPhysicsBackend> Default for GravityCharacterPlugin<B> {
    fn default() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<B: backend::CharacterPhysicsBackend> Plugin for GravityCharacterPlugin<B> {
    fn build(&self, app: &mut App) {
        // Register core types
        app.register_type::<state::CharacterController>();
        app.register_type::<state::Grounded>();
        app.register_type::<state::Airborne>();
        app.register_type::<state::Submerged>();
        app.register_type::<config::ControllerConfig>();
        app.register_type::<config::OrientationConfig>();
        app.register_type::<config::InteractionConfig>();
        app.register_type::<config::SimulationTuning>();
        app.register_type::<collision::CapsuleShape>();
        app.register_type::<intent::MovementIntent>();
        app.register_type::<gravity::WorldGravity>();
        app.register_type::<gravity::GravityField>();
        app.register_type::<gravity::GravityBounds>();
        app.register_type::<gravity::GravitySpline>();
        app.register_type::<volume::PhysicsVolume>();
        app.register_type::<volume::VolumeGravityBody>();
        app.register_type::<projectile::GravityProjectile>();

        app.init_resource::<gravity::WorldGravity>();
        app.init_resource::<movement::CustomMovementModes>();

        app.configure_sets(
            FixedUpdate,
            (
                GravityCharacterSet::Preparation,
                GravityCharacterSet::Gravity,
                GravityCharacterSet::Simulation,
                GravityCharacterSet::Interaction,
                GravityCharacterSet::Finalize,
            )
                .chain(),
        );

        // Add the physics backend plugin
        app.add_plugins(B::plugin());

        app.add_systems(
            FixedUpdate,
            systems::apply_volume_gravity::<B>.in_set(GravityCharacterSet::Gravity),
        );
        app.add_systems(
            FixedUpdate,
            systems::simulate_characters::<B>.in_set(GravityCharacterSet::Simulation),
        );
        app.add_systems(
            FixedUpdate,
            systems::move_projectiles::<B>.in_set(GravityCharacterSet::Interaction),
        );
        app.add_systems(
            FixedUpdate,
            systems::sync_state_markers.in_set(GravityCharacterSet::Finalize),
        );
    }
}
