//! Movement state machine.
//!
//! A [`CharacterMover`] borrows one [`CharacterAgent`] for one tick and runs
//! the physics of its current [`MovementMode`]. Everything the step needs
//! from the outside world comes in through [`MovementEnv`]: gravity sources,
//! body state, physics volumes, per-surface slope overrides and custom
//! movement modes. Collision goes through a [`CollisionQuery`].
//!
//! The mover never touches the ECS. Notifications are pushed into the
//! agent's [`MovementEvents`] and impulses for other bodies into
//! [`CharacterAgent::impulses`], both drained by the owner after the tick.
//!
//! ## Usage
//!
//! ```rust
//! use bevy::prelude::*;
//! use msg_gravity_character::prelude::*;
//!
//! let mut world = World::new();
//! let ground = world.spawn_empty().id();
//! let entity = world.spawn_empty().id();
//!
//! let scene = SceneCollision::new().with_plane(ground, Vec3::ZERO, Vec3::Y);
//! let snapshot = EnvironmentSnapshot::default();
//! let env = snapshot.env(WorldGravity::default(), &NoGravitySources, &NoBodies);
//! let settings = AgentSettings::default();
//!
//! let mut agent = CharacterAgent::new(entity, Vec3::new(0.0, 200.0, 0.0), Quat::IDENTITY, CapsuleShape::default());
//! for _ in 0..120 {
//!     CharacterMover::new(&scene, env, &settings, &mut agent).tick(1.0 / 60.0);
//! }
//! assert_eq!(agent.controller.movement_mode(), MovementMode::Walking);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bevy::prelude::*;

use crate::backend::BodyQuery;
use crate::collision::{pull_back_hit, CapsuleShape, CollisionQuery, HitResult};
use crate::config::{ControllerConfig, InteractionConfig, OrientationConfig, SimulationTuning};
use crate::detection::{WalkableSlopeOverride, BRAKE_TO_STOP_VELOCITY, MIN_TICK_TIME};
use crate::events::{MovementEvent, MovementEvents};
use crate::gravity::{GravityField, GravitySourceProvider, WorldGravity};
use crate::impact::PhysicsImpulse;
use crate::intent::MovementIntent;
use crate::math::{plane_project, up_axis, KINDA_SMALL_NUMBER, SMALL_NUMBER};
use crate::state::{CharacterController, MovementMode};
use crate::volume::{PhysicsVolume, VolumeInfo};

mod base;
mod crouch;
mod falling;
mod flying;
mod jump;
mod modes;
mod slide;
mod swimming;
mod walking;

/// Distance kept between a penetrating capsule and the surface it is pushed
/// out of.
const PENETRATION_PULLBACK_DISTANCE: f32 = 0.125;
/// Maximum depenetration against other characters.
const MAX_DEPENETRATION_WITH_PAWN: f32 = 100.0;
/// Maximum depenetration against everything else.
const MAX_DEPENETRATION_WITH_GEOMETRY: f32 = 500.0;
/// Inflation of the overlap test run before teleporting out of penetration.
const PENETRATION_OVERLAP_CHECK_INFLATION: f32 = 0.1;
/// Velocity may exceed the speed limit by this factor before it is braked.
const OVER_VELOCITY_PERCENT: f32 = 1.01;

/// One character's state, extracted from the ECS for a tick.
#[derive(Debug, Clone)]
pub struct CharacterAgent {
    pub entity: Entity,
    /// Capsule center.
    pub location: Vec3,
    pub rotation: Quat,
    pub shape: CapsuleShape,
    pub controller: CharacterController,
    pub gravity: GravityField,
    pub intent: MovementIntent,
    pub events: MovementEvents,
    /// Impulses and forces for other bodies, applied after the tick.
    pub impulses: Vec<PhysicsImpulse>,
}

impl CharacterAgent {
    pub fn new(entity: Entity, location: Vec3, rotation: Quat, shape: CapsuleShape) -> Self {
        Self {
            entity,
            location,
            rotation,
            shape,
            controller: CharacterController::new(),
            gravity: GravityField::default(),
            intent: MovementIntent::default(),
            events: MovementEvents::default(),
            impulses: Vec::new(),
        }
    }

    pub fn with_controller(mut self, controller: CharacterController) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_gravity(mut self, gravity: GravityField) -> Self {
        self.gravity = gravity;
        self
    }

    /// Capsule up axis.
    #[inline]
    pub fn up(&self) -> Vec3 {
        up_axis(self.rotation)
    }
}

/// Configuration components of one agent.
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub config: ControllerConfig,
    pub orientation: OrientationConfig,
    pub interaction: InteractionConfig,
    pub tuning: SimulationTuning,
}

impl AgentSettings {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            ..default()
        }
    }

    pub fn with_orientation(mut self, orientation: OrientationConfig) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_interaction(mut self, interaction: InteractionConfig) -> Self {
        self.interaction = interaction;
        self
    }

    pub fn with_tuning(mut self, tuning: SimulationTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

/// Physics of a [`MovementMode::Custom`] sub-mode.
///
/// Implementations drive the mover directly. They get the same building
/// blocks as the built-in modes (`safe_move`, `slide_along_surface`,
/// `calc_velocity`, `find_floor`...) and may switch modes through
/// [`CharacterMover::set_movement_mode`].
pub trait CustomMovement: Send + Sync + 'static {
    fn phys_custom(&self, mover: &mut CharacterMover<'_>, sub_mode: u8, delta_time: f32, iterations: u32);
}

/// Registered custom movement modes, keyed by sub-mode.
#[derive(Resource, Clone, Default)]
pub struct CustomMovementModes {
    modes: HashMap<u8, Arc<dyn CustomMovement>>,
}

impl fmt::Debug for CustomMovementModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.modes.keys().collect();
        keys.sort();
        f.debug_struct("CustomMovementModes").field("sub_modes", &keys).finish()
    }
}

impl CustomMovementModes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the physics of a sub-mode, replacing any previous one.
    pub fn register(&mut self, sub_mode: u8, movement: impl CustomMovement) -> &mut Self {
        self.modes.insert(sub_mode, Arc::new(movement));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, sub_mode: u8, movement: impl CustomMovement) -> Self {
        self.register(sub_mode, movement);
        self
    }

    pub fn get(&self, sub_mode: u8) -> Option<Arc<dyn CustomMovement>> {
        self.modes.get(&sub_mode).cloned()
    }
}

/// Owned copy of the world data a movement step reads.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSnapshot {
    pub volumes: Vec<VolumeInfo>,
    pub slope_overrides: HashMap<Entity, WalkableSlopeOverride>,
    pub custom: CustomMovementModes,
}

impl EnvironmentSnapshot {
    /// Collect volumes, slope overrides and custom modes from the world.
    pub fn gather(world: &mut World) -> Self {
        let volumes = world
            .query::<(Entity, &PhysicsVolume, &Transform)>()
            .iter(world)
            .map(|(entity, volume, transform)| VolumeInfo::new(entity, transform.translation, volume.clone()))
            .collect();

        let slope_overrides = world
            .query::<(Entity, &WalkableSlopeOverride)>()
            .iter(world)
            .map(|(entity, slope)| (entity, *slope))
            .collect();

        let custom = world
            .get_resource::<CustomMovementModes>()
            .cloned()
            .unwrap_or_default();

        Self {
            volumes,
            slope_overrides,
            custom,
        }
    }

    /// Builder: add a volume centered at `center`.
    pub fn with_volume(mut self, entity: Entity, center: Vec3, volume: PhysicsVolume) -> Self {
        self.volumes.push(VolumeInfo::new(entity, center, volume));
        self
    }

    /// Builder: override the walkable slope of one surface.
    pub fn with_slope_override(mut self, entity: Entity, slope: WalkableSlopeOverride) -> Self {
        self.slope_overrides.insert(entity, slope);
        self
    }

    /// Builder: set the custom movement modes.
    pub fn with_custom_modes(mut self, custom: CustomMovementModes) -> Self {
        self.custom = custom;
        self
    }

    pub fn env<'a>(
        &'a self,
        world_gravity: WorldGravity,
        sources: &'a dyn GravitySourceProvider,
        bodies: &'a dyn BodyQuery,
    ) -> MovementEnv<'a> {
        MovementEnv {
            world_gravity,
            sources,
            bodies,
            volumes: &self.volumes,
            slope_overrides: &self.slope_overrides,
            custom: &self.custom,
        }
    }
}

/// Read-only world access for a movement step.
#[derive(Clone, Copy)]
pub struct MovementEnv<'a> {
    pub world_gravity: WorldGravity,
    pub sources: &'a dyn GravitySourceProvider,
    pub bodies: &'a dyn BodyQuery,
    pub volumes: &'a [VolumeInfo],
    pub slope_overrides: &'a HashMap<Entity, WalkableSlopeOverride>,
    pub custom: &'a CustomMovementModes,
}

/// Runs one agent's movement for one tick.
pub struct CharacterMover<'a> {
    pub(crate) query: &'a dyn CollisionQuery,
    pub(crate) env: MovementEnv<'a>,
    pub config: &'a ControllerConfig,
    pub orientation: &'a OrientationConfig,
    pub interaction: &'a InteractionConfig,
    pub tuning: &'a SimulationTuning,
    pub agent: &'a mut CharacterAgent,
    /// Temporarily accept any surface walkable relative to the capsule.
    pub(crate) land_on_any_surface: bool,
    /// Set while a replicated movement mode is applied.
    pub(crate) applying_network_mode: bool,
    pub(crate) jump_apex_attempts: u32,
}

impl<'a> CharacterMover<'a> {
    pub fn new(
        query: &'a dyn CollisionQuery,
        env: MovementEnv<'a>,
        settings: &'a AgentSettings,
        agent: &'a mut CharacterAgent,
    ) -> Self {
        Self {
            query,
            env,
            config: &settings.config,
            orientation: &settings.orientation,
            interaction: &settings.interaction,
            tuning: &settings.tuning,
            agent,
            land_on_any_surface: false,
            applying_network_mode: false,
            jump_apex_attempts: 0,
        }
    }

    // ==================== Accessors ====================

    /// Capsule up axis.
    #[inline]
    pub fn up(&self) -> Vec3 {
        up_axis(self.agent.rotation)
    }

    /// Gravity direction at the agent location. See [`GravityField::direction`].
    pub fn gravity_direction(&self, avoid_zero: bool) -> Vec3 {
        self.agent
            .gravity
            .direction(self.agent.location, avoid_zero, &self.env.world_gravity)
    }

    /// Gravity acceleration at the agent location.
    pub fn gravity(&self) -> Vec3 {
        self.agent.gravity.gravity(self.agent.location, &self.env.world_gravity)
    }

    pub fn gravity_magnitude(&self) -> f32 {
        self.agent.gravity.magnitude(&self.env.world_gravity)
    }

    /// Refresh gravity targets after the gravity configuration changed
    /// mid-step.
    pub(crate) fn refresh_gravity(&mut self) {
        let location = self.agent.location;
        self.agent.gravity.resample(location, self.env.sources);
    }

    #[inline]
    pub fn movement_mode(&self) -> MovementMode {
        self.agent.controller.movement_mode
    }

    #[inline]
    pub fn is_moving_on_ground(&self) -> bool {
        self.movement_mode().is_moving_on_ground()
    }

    #[inline]
    pub fn is_walking(&self) -> bool {
        self.movement_mode() == MovementMode::Walking
    }

    #[inline]
    pub fn is_falling(&self) -> bool {
        self.movement_mode().is_falling()
    }

    #[inline]
    pub fn is_swimming(&self) -> bool {
        self.movement_mode().is_swimming()
    }

    #[inline]
    pub fn is_flying(&self) -> bool {
        self.movement_mode().is_flying()
    }

    pub fn land_on_any_surface(&self) -> bool {
        self.config.land_on_any_surface || self.land_on_any_surface
    }

    pub fn can_ever_swim(&self) -> bool {
        self.config.can_swim
    }

    /// Speed limit of the current mode.
    pub fn max_speed(&self) -> f32 {
        match self.movement_mode() {
            MovementMode::Walking | MovementMode::NavWalking => {
                if self.agent.controller.is_crouched {
                    self.config.max_walk_speed_crouched
                } else {
                    self.config.max_walk_speed
                }
            }
            MovementMode::Falling => self.config.max_walk_speed,
            MovementMode::Swimming => self.config.max_swim_speed,
            MovementMode::Flying => self.config.max_fly_speed,
            MovementMode::Custom(_) => self.config.max_custom_movement_speed,
            MovementMode::None => 0.0,
        }
    }

    pub fn max_acceleration(&self) -> f32 {
        self.config.max_acceleration
    }

    /// Deceleration applied without input in the current mode.
    pub fn max_braking_deceleration(&self) -> f32 {
        match self.movement_mode() {
            MovementMode::Walking | MovementMode::NavWalking => self.config.braking_deceleration_walking,
            MovementMode::Falling => self.config.braking_deceleration_falling,
            MovementMode::Swimming => self.config.braking_deceleration_swimming,
            MovementMode::Flying => self.config.braking_deceleration_flying,
            MovementMode::Custom(_) | MovementMode::None => 0.0,
        }
    }

    /// Highest jump apex reachable under the current gravity.
    pub fn max_jump_height(&self) -> f32 {
        self.config.max_jump_height(self.gravity_magnitude())
    }

    /// Highest jump apex including the extra height from holding jump.
    pub fn max_jump_height_with_jump_time(&self) -> f32 {
        let height = self.max_jump_height();
        if self.config.jump_max_hold_time > 0.0 {
            height + self.config.jump_z_velocity * self.config.jump_max_hold_time
        } else {
            height
        }
    }

    /// Physics volume the agent is inside, if any.
    pub fn physics_volume(&self) -> Option<&'a VolumeInfo> {
        let env = self.env;
        let current = self.agent.controller.current_volume?;
        env.volumes.iter().find(|v| v.entity == current)
    }

    pub fn fluid_friction(&self) -> f32 {
        self.physics_volume()
            .map_or(self.config.default_fluid_friction, |v| v.volume.fluid_friction)
    }

    pub fn terminal_velocity(&self) -> f32 {
        self.physics_volume()
            .map_or(self.config.terminal_velocity, |v| v.volume.terminal_velocity)
    }

    pub fn is_in_water(&self) -> bool {
        self.physics_volume().is_some_and(|v| v.volume.water)
    }

    /// Queue a movement event.
    pub fn notify(&mut self, event: MovementEvent) {
        self.agent.events.push(event);
    }

    // ==================== Tick ====================

    /// Advance the agent by `delta_time`.
    ///
    /// Resamples gravity, applies pending requests and input, runs the mode
    /// physics and turns gravity changes into events.
    pub fn tick(&mut self, delta_time: f32) {
        if !(delta_time >= MIN_TICK_TIME) {
            return;
        }
        self.refresh_gravity();
        self.agent.controller.elapsed += delta_time;
        if self.agent.controller.standing_half_height <= 0.0 {
            self.agent.controller.standing_half_height = self.agent.shape.half_height;
        }

        if let Some(request) = self.agent.controller.pending_teleport.take() {
            self.teleport_to(request.location, request.rotation);
        }
        if let Some(mode) = self.agent.controller.pending_mode.take() {
            self.set_movement_mode(mode);
        }

        self.update_jump_input();
        self.check_jump_input(delta_time);

        let input = self.constrain_input_acceleration(self.agent.intent.effective_input());
        self.agent.controller.acceleration = self.scale_input_acceleration(input);

        self.perform_movement(delta_time);

        if self.interaction.enable_physics_interaction {
            self.apply_downward_force(delta_time);
            self.apply_repulsion_force(delta_time);
            self.update_touching_bodies();
        }

        self.flush_gravity_changes();
        if self.tuning.diagnose_nan {
            self.diagnose_nan();
        }
    }

    /// Run the movement of one tick after input has been processed.
    pub fn perform_movement(&mut self, delta_time: f32) {
        if self.movement_mode() == MovementMode::None {
            self.agent.controller.clear_accumulated_forces();
            return;
        }

        self.maybe_update_based_movement(delta_time);

        let old_location = self.agent.location;
        let old_velocity = self.agent.controller.velocity;

        self.apply_accumulated_forces(delta_time);
        self.update_crouch_before_movement();

        if self.movement_mode() == MovementMode::NavWalking && self.agent.controller.wants_to_leave_nav_walking {
            self.try_to_leave_nav_walking();
        }

        self.handle_pending_launch();
        self.agent.controller.clear_accumulated_forces();

        self.clear_jump_input(delta_time);
        self.jump_apex_attempts = 0;

        self.start_new_physics(delta_time, 0);

        self.update_crouch_after_movement();
        self.physics_rotation(delta_time);
        self.on_movement_updated(delta_time, old_location, old_velocity);
        self.save_base_location();
    }

    /// Dispatch to the physics of the current mode.
    pub fn start_new_physics(&mut self, delta_time: f32, iterations: u32) {
        if delta_time < MIN_TICK_TIME || iterations >= self.tuning.max_simulation_iterations {
            return;
        }
        trace!(
            "start physics {:?} dt={} iteration={}",
            self.movement_mode(),
            delta_time,
            iterations
        );
        match self.movement_mode() {
            MovementMode::None => {}
            MovementMode::Walking => self.phys_walking(delta_time, iterations),
            MovementMode::NavWalking => self.phys_nav_walking(delta_time, iterations),
            MovementMode::Falling => self.phys_falling(delta_time, iterations),
            MovementMode::Swimming => self.phys_swimming(delta_time, iterations),
            MovementMode::Flying => self.phys_flying(delta_time, iterations),
            MovementMode::Custom(sub_mode) => self.phys_custom(sub_mode, delta_time, iterations),
        }
    }

    /// Length of the next sub-step.
    pub fn simulation_time_step(&self, remaining_time: f32, iterations: u32) -> f32 {
        let max_step = self.tuning.max_simulation_time_step;
        let mut remaining = remaining_time;
        if remaining > max_step {
            if iterations < self.tuning.max_simulation_iterations {
                remaining = max_step.min(remaining * 0.5);
            }
            // The last iteration uses up all remaining time.
        }
        remaining.max(MIN_TICK_TIME)
    }

    // ==================== Input ====================

    /// Input restricted to the planes the current mode can move in.
    pub fn constrain_input_acceleration(&self, input: Vec3) -> Vec3 {
        if self.is_moving_on_ground() || self.is_falling() {
            plane_project(input, self.up())
        } else {
            input
        }
    }

    /// Input scaled to an acceleration, with its length clamped to 1.
    pub fn scale_input_acceleration(&self, input: Vec3) -> Vec3 {
        self.max_acceleration() * input.clamp_length_max(1.0)
    }

    fn analog_input_modifier(&self) -> f32 {
        let max_accel = self.max_acceleration();
        let acceleration = self.agent.controller.acceleration;
        if max_accel > 0.0 && acceleration.length_squared() > 0.0 {
            (acceleration.length() / max_accel).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn is_exceeding_max_speed(&self, max_speed: f32) -> bool {
        let max_speed = max_speed.max(0.0) * OVER_VELOCITY_PERCENT;
        self.agent.controller.velocity.length_squared() > max_speed * max_speed
    }

    // ==================== Velocity ====================

    /// Update velocity from acceleration, friction and braking.
    ///
    /// `friction` also controls how fast velocity turns towards the input.
    /// With `fluid` set, friction additionally damps the whole velocity.
    pub fn calc_velocity(&mut self, delta_time: f32, friction: f32, fluid: bool, braking_deceleration: f32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }
        let friction = friction.max(0.0);
        let max_accel = self.max_acceleration();
        let max_speed = self.max_speed();

        let requested = self.apply_requested_move(delta_time, max_accel, max_speed, friction);
        let (requested_acceleration, requested_speed) = requested.unwrap_or((Vec3::ZERO, 0.0));

        let max_input_speed = max_speed * self.analog_input_modifier();
        let max_speed = requested_speed.max(max_input_speed);

        let acceleration = self.agent.controller.acceleration;
        let zero_acceleration = acceleration == Vec3::ZERO;
        let over_max = self.is_exceeding_max_speed(max_speed);

        if (zero_acceleration && requested.is_none()) || over_max {
            let old_velocity = self.agent.controller.velocity;
            let braking_friction = if self.config.use_separate_braking_friction {
                self.config.braking_friction
            } else {
                friction
            };
            self.apply_velocity_braking(delta_time, braking_friction, braking_deceleration);

            // Braking never takes velocity below the limit it started above.
            let velocity = self.agent.controller.velocity;
            if over_max && velocity.length_squared() < max_speed * max_speed && acceleration.dot(old_velocity) > 0.0 {
                self.agent.controller.velocity = old_velocity.normalize_or_zero() * max_speed;
            }
        } else if !zero_acceleration {
            let velocity = self.agent.controller.velocity;
            let accel_dir = acceleration.normalize_or_zero();
            let speed = velocity.length();
            self.agent.controller.velocity =
                velocity - (velocity - accel_dir * speed) * (delta_time * friction).min(1.0);
        }

        if fluid {
            self.agent.controller.velocity *= 1.0 - (friction * delta_time).min(1.0);
        }

        if !zero_acceleration {
            let limit = if self.is_exceeding_max_speed(max_input_speed) {
                self.agent.controller.velocity.length()
            } else {
                max_input_speed
            };
            let velocity = self.agent.controller.velocity + acceleration * delta_time;
            self.agent.controller.velocity = velocity.clamp_length_max(limit);
        }

        if requested.is_some() {
            let limit = if self.is_exceeding_max_speed(requested_speed) {
                self.agent.controller.velocity.length()
            } else {
                requested_speed
            };
            let velocity = self.agent.controller.velocity + requested_acceleration * delta_time;
            self.agent.controller.velocity = velocity.clamp_length_max(limit);
        }
    }

    /// Follow a requested velocity. Returns the acceleration and speed to
    /// apply on top of input, or `None` when nothing was requested.
    pub fn apply_requested_move(
        &mut self,
        delta_time: f32,
        max_acceleration: f32,
        max_speed: f32,
        friction: f32,
    ) -> Option<(Vec3, f32)> {
        let request = self.agent.controller.requested_move?;
        let mut requested_velocity = request.velocity;
        if self.is_moving_on_ground() {
            requested_velocity = plane_project(requested_velocity, self.up());
        }
        let speed_sq = requested_velocity.length_squared();
        if speed_sq < KINDA_SMALL_NUMBER {
            return None;
        }

        let requested_speed = speed_sq.sqrt();
        let move_dir = requested_velocity / requested_speed;
        let requested_speed = if request.force_max_speed {
            max_speed
        } else {
            max_speed.min(requested_speed)
        };
        let move_velocity = move_dir * requested_speed;

        let velocity = self.agent.controller.velocity;
        let limit = requested_speed * OVER_VELOCITY_PERCENT;
        let mut new_acceleration = Vec3::ZERO;
        if self.config.request_move_use_acceleration && velocity.length_squared() < limit * limit {
            let speed = velocity.length();
            let turned = velocity - (velocity - move_dir * speed) * (delta_time * friction).min(1.0);
            self.agent.controller.velocity = turned;
            new_acceleration = ((move_velocity - turned) / delta_time).clamp_length_max(max_acceleration);
        } else {
            // Decelerate instantly rather than slide past the destination.
            self.agent.controller.velocity = move_velocity;
        }

        Some((new_acceleration, requested_speed))
    }

    /// Slow down with friction and constant deceleration, sub-stepped for
    /// consistent results at low frame rates.
    pub fn apply_velocity_braking(&mut self, delta_time: f32, friction: f32, braking_deceleration: f32) {
        let old_velocity = self.agent.controller.velocity;
        if old_velocity == Vec3::ZERO || delta_time < MIN_TICK_TIME {
            return;
        }

        let friction = (friction * self.config.braking_friction_factor.max(0.0)).max(0.0);
        let braking_deceleration = braking_deceleration.max(0.0);
        let zero_friction = friction == 0.0;
        let zero_braking = braking_deceleration == 0.0;
        if zero_friction && zero_braking {
            return;
        }

        let max_time_step = self.config.braking_sub_step_time.clamp(1.0 / 75.0, 1.0 / 20.0);
        let reverse_accel = if zero_braking {
            Vec3::ZERO
        } else {
            -braking_deceleration * old_velocity.normalize_or_zero()
        };

        let mut velocity = old_velocity;
        let mut remaining = delta_time;
        while remaining >= MIN_TICK_TIME {
            // Constant deceleration needs no sub-steps.
            let dt = if remaining > max_time_step && !zero_friction {
                max_time_step.min(remaining * 0.5)
            } else {
                remaining
            };
            remaining -= dt;

            velocity += (-friction * velocity + reverse_accel) * dt;

            if velocity.dot(old_velocity) <= 0.0 {
                self.agent.controller.velocity = Vec3::ZERO;
                return;
            }
        }

        let speed_sq = velocity.length_squared();
        if speed_sq <= KINDA_SMALL_NUMBER
            || (!zero_braking && speed_sq <= BRAKE_TO_STOP_VELOCITY * BRAKE_TO_STOP_VELOCITY)
        {
            velocity = Vec3::ZERO;
        }
        self.agent.controller.velocity = velocity;
    }

    // ==================== Moving ====================

    /// Move the capsule by `delta`, sweeping when `sweep` is set.
    ///
    /// A blocked sweep stops a little short of the contact. A sweep that
    /// starts in penetration does not move the capsule.
    pub fn move_updated(&mut self, delta: Vec3, rotation: Quat, sweep: bool) -> HitResult {
        let start = self.agent.location;
        let end = start + delta;

        if delta.length_squared() <= SMALL_NUMBER {
            self.agent.rotation = rotation;
            return HitResult::miss(start, start);
        }

        if !sweep {
            self.agent.location = end;
            self.agent.rotation = rotation;
            self.update_physics_volume();
            return HitResult::miss(start, end);
        }

        let mut hit = self
            .query
            .sweep_capsule(start, end, rotation, self.agent.shape, Some(self.agent.entity));
        self.agent.rotation = rotation;

        if hit.start_penetrating {
            hit.time = 0.0;
            hit.location = start;
            return hit;
        }

        if hit.blocking_hit {
            pull_back_hit(&mut hit, start, end);
            self.agent.location = hit.location;
        } else {
            self.agent.location = end;
        }
        self.update_physics_volume();

        if hit.blocking_hit {
            self.on_blocking_hit(&hit);
        }
        hit
    }

    /// [`move_updated`](Self::move_updated) that first tries to resolve an
    /// initial penetration and then retries the move.
    pub fn safe_move(&mut self, delta: Vec3, rotation: Quat, sweep: bool) -> HitResult {
        let mut hit = self.move_updated(delta, rotation, sweep);
        if hit.start_penetrating {
            let adjustment = self.penetration_adjustment(&hit);
            if self.resolve_penetration(adjustment, &hit, rotation) {
                hit = self.move_updated(delta, rotation, sweep);
            }
        }
        hit
    }

    /// Displacement that pushes the capsule out of a penetration.
    pub fn penetration_adjustment(&self, hit: &HitResult) -> Vec3 {
        if !hit.start_penetrating {
            return Vec3::ZERO;
        }
        let depth = if hit.penetration_depth > 0.0 {
            hit.penetration_depth
        } else {
            PENETRATION_PULLBACK_DISTANCE
        };
        let max = if hit.entity.is_some_and(|e| self.env.bodies.is_character(e)) {
            MAX_DEPENETRATION_WITH_PAWN
        } else {
            MAX_DEPENETRATION_WITH_GEOMETRY
        };
        (hit.normal * (depth + PENETRATION_PULLBACK_DISTANCE)).clamp_length_max(max)
    }

    /// Try to move out of a penetration. Returns whether the capsule moved.
    pub fn resolve_penetration(&mut self, adjustment: Vec3, hit: &HitResult, rotation: Quat) -> bool {
        if adjustment == Vec3::ZERO {
            return false;
        }

        let inflated = CapsuleShape::new(
            self.agent.shape.radius + PENETRATION_OVERLAP_CHECK_INFLATION,
            self.agent.shape.half_height + PENETRATION_OVERLAP_CHECK_INFLATION,
        );
        let encroached = self.query.overlap_capsule(
            hit.trace_start + adjustment,
            rotation,
            inflated,
            Some(self.agent.entity),
        );
        if !encroached {
            self.move_updated(adjustment, rotation, false);
            self.agent.controller.just_teleported = true;
            debug!("resolved penetration by {:?}", adjustment);
            return true;
        }

        let mut moved = self.try_move(adjustment, rotation);
        if !moved {
            let sweep_out = self.last_sweep_hit(adjustment, rotation);
            if sweep_out.start_penetrating {
                let second = self.penetration_adjustment(&sweep_out);
                let combined = adjustment + second;
                if second != adjustment && combined != Vec3::ZERO {
                    moved = self.try_move(combined, rotation);
                }
            }
        }
        if !moved {
            let move_delta = hit.trace_end - hit.trace_start;
            if move_delta != Vec3::ZERO {
                moved = self.try_move(adjustment + move_delta, rotation);
            }
        }

        self.agent.controller.just_teleported |= moved;
        moved
    }

    /// Sweep-move and report whether the capsule changed location.
    fn try_move(&mut self, delta: Vec3, rotation: Quat) -> bool {
        let before = self.agent.location;
        self.move_updated(delta, rotation, true);
        before.distance_squared(self.agent.location) > SMALL_NUMBER
    }

    fn last_sweep_hit(&self, delta: Vec3, rotation: Quat) -> HitResult {
        let start = self.agent.location;
        self.query
            .sweep_capsule(start, start + delta, rotation, self.agent.shape, Some(self.agent.entity))
    }

    /// Report unwalkable surfaces hit while moving.
    fn on_blocking_hit(&mut self, hit: &HitResult) {
        if !self.config.trigger_unwalkable_hits {
            return;
        }
        let now = self.agent.controller.elapsed;
        if now - self.agent.controller.last_unwalkable_hit_time >= MIN_TICK_TIME
            && !self.is_walkable(hit)
            && (hit.trace_end - hit.trace_start).dot(hit.impact_normal) < -KINDA_SMALL_NUMBER
        {
            self.agent.controller.last_unwalkable_hit_time = now;
            self.notify(MovementEvent::UnwalkableHit { hit: *hit });
        }
    }

    /// React to a blocking hit: tell path followers and push simulated
    /// bodies.
    pub fn handle_impact(&mut self, hit: &HitResult) {
        self.notify(MovementEvent::MoveBlocked { hit: *hit });
        if self.interaction.enable_physics_interaction {
            let gravity = if self.is_falling() { self.gravity() } else { Vec3::ZERO };
            let acceleration = self.agent.controller.acceleration + gravity;
            let velocity = self.agent.controller.velocity;
            self.apply_impact_physics_forces(hit, acceleration, velocity);
        }
    }

    // ==================== Forces ====================

    /// Fold queued impulses and forces into velocity. Enough upward momentum
    /// lifts a grounded character off the floor.
    pub fn apply_accumulated_forces(&mut self, delta_time: f32) {
        let impulse = self.agent.controller.pending_impulse;
        let force = self.agent.controller.pending_force;

        if (impulse != Vec3::ZERO || force != Vec3::ZERO) && self.is_moving_on_ground() {
            let total = impulse + force * delta_time + self.gravity() * delta_time;
            if total.dot(self.up()) > SMALL_NUMBER {
                self.set_movement_mode(MovementMode::Falling);
            }
        }

        self.agent.controller.velocity += impulse + force * delta_time;
        self.agent.controller.pending_impulse = Vec3::ZERO;
        self.agent.controller.pending_force = Vec3::ZERO;
    }

    /// Apply a queued launch. Returns whether one was applied.
    pub fn handle_pending_launch(&mut self) -> bool {
        let Some(launch) = self.agent.controller.pending_launch.take() else {
            return false;
        };

        let gravity_dir = self.gravity_direction(true);
        let current = self.agent.controller.velocity;
        let mut velocity = launch.velocity;
        if !launch.planar_override {
            velocity += plane_project(current, gravity_dir);
        }
        if !launch.vertical_override {
            velocity += gravity_dir * current.dot(gravity_dir);
        }
        if velocity == Vec3::ZERO {
            return false;
        }

        debug!("launched with {:?}", velocity);
        self.agent.controller.velocity = velocity;
        self.set_movement_mode(MovementMode::Falling);
        self.agent.controller.force_next_floor_check = true;
        true
    }

    // ==================== Bookkeeping ====================

    fn flush_gravity_changes(&mut self) {
        let changes: Vec<_> = self.agent.gravity.drain_changes().collect();
        for change in changes {
            self.notify(MovementEvent::GravityChanged {
                old_mode: change.old_mode,
                new_mode: change.new_mode,
            });
        }
    }

    fn diagnose_nan(&mut self) {
        let controller = &mut self.agent.controller;
        if !controller.velocity.is_finite() || !controller.acceleration.is_finite() {
            warn!(
                "non-finite movement state on {:?}: velocity {:?}, acceleration {:?}",
                self.agent.entity, controller.velocity, controller.acceleration
            );
            controller.velocity = Vec3::ZERO;
            controller.acceleration = Vec3::ZERO;
        }
        if !self.agent.location.is_finite() {
            warn!("non-finite location on {:?}", self.agent.entity);
        }
    }
}
