//! Controller configuration components.
//!
//! Every tunable lives in one of these components so that agents with
//! different settings can be simulated side by side. Defaults reproduce a
//! conventional third-person character measured in centimeters.

use bevy::prelude::*;

use crate::math::ParallelThresholds;
use crate::state::MovementMode;

/// Movement tuning for a character.
#[derive(Component, Reflect, Debug, Clone)]
#[reflect(Component)]
pub struct ControllerConfig {
    // === Walking ===
    /// Maximum ground speed.
    pub max_walk_speed: f32,
    /// Maximum ground speed while crouched.
    pub max_walk_speed_crouched: f32,
    /// Maximum acceleration produced by full input.
    pub max_acceleration: f32,
    /// Friction while walking. Also turns velocity towards the input.
    pub ground_friction: f32,
    /// Deceleration when walking without input.
    pub braking_deceleration_walking: f32,
    /// Multiplier applied to the friction used while braking.
    pub braking_friction_factor: f32,
    /// Friction used while braking when `use_separate_braking_friction` is set.
    pub braking_friction: f32,
    pub use_separate_braking_friction: bool,
    /// Sub-step length used while integrating braking, clamped to
    /// `[1/75, 1/20]`.
    pub braking_sub_step_time: f32,
    /// Minimum `normal · up` for a surface to be walkable.
    pub walkable_floor_z: f32,
    /// Maximum height the character steps up without jumping.
    pub max_step_height: f32,
    pub can_walk_off_ledges: bool,
    pub can_walk_off_ledges_when_crouching: bool,
    /// Keep ground speed horizontal on ramps instead of following the ramp.
    pub maintain_horizontal_ground_velocity: bool,
    /// Extra depth probed below `max_step_height` when looking for a ledge.
    pub ledge_check_threshold: f32,
    /// Distance from the capsule edge within which the character may perch.
    pub perch_radius_threshold: f32,
    /// Extra floor distance accepted when perching.
    pub perch_additional_height: f32,

    // === Jumping and falling ===
    /// Upward speed given by a jump.
    pub jump_z_velocity: f32,
    /// Fraction of `jump_z_velocity` used when bouncing off a pawn.
    pub jump_off_jump_z_factor: f32,
    /// How long holding jump keeps applying the jump velocity.
    pub jump_max_hold_time: f32,
    /// Jumps allowed before landing.
    pub jump_max_count: u32,
    /// Lateral control while falling, from 0 to 1.
    pub air_control: f32,
    /// Multiplier on `air_control` when lateral speed is below the threshold.
    pub air_control_boost_multiplier: f32,
    pub air_control_boost_velocity_threshold: f32,
    /// Lateral friction while falling.
    pub falling_lateral_friction: f32,
    pub braking_deceleration_falling: f32,
    /// Apply gravity while the jump hold time is active.
    pub apply_gravity_while_jumping: bool,
    /// Speed limit along gravity when no physics volume overrides it.
    pub terminal_velocity: f32,
    /// Landing also accepts surfaces that are only walkable relative to the
    /// capsule up axis, not to gravity.
    pub land_on_any_surface: bool,

    // === Swimming ===
    pub max_swim_speed: f32,
    /// 1 is neutral, above 1 floats, below 1 sinks.
    pub buoyancy: f32,
    pub braking_deceleration_swimming: f32,
    /// Speed given when jumping out of water.
    pub out_of_water_z: f32,
    /// Pitch above the horizon the input must reach to jump out of water, in
    /// degrees.
    pub jump_out_of_water_pitch: f32,
    /// Maximum ledge height climbed when jumping out of water.
    pub max_out_of_water_step_height: f32,
    /// Fluid friction used when no physics volume provides one.
    pub default_fluid_friction: f32,

    // === Flying and custom ===
    pub max_fly_speed: f32,
    pub braking_deceleration_flying: f32,
    pub max_custom_movement_speed: f32,

    // === Crouching ===
    pub can_crouch: bool,
    pub crouched_half_height: f32,

    // === Modes and capabilities ===
    pub can_jump: bool,
    pub can_swim: bool,
    pub can_fly: bool,
    /// Mode entered when landing or spawning on ground.
    pub default_land_movement_mode: MovementMode,
    /// Mode entered when spawning in water.
    pub default_water_movement_mode: MovementMode,

    // === Path following ===
    /// Accelerate towards requested velocities instead of setting them.
    pub request_move_use_acceleration: bool,

    // === Movement base ===
    pub impart_base_velocity_planar: bool,
    pub impart_base_velocity_vertical: bool,
    pub impart_base_angular_velocity: bool,

    // === Misc ===
    pub mass: f32,
    /// Report unwalkable surfaces hit while moving.
    pub trigger_unwalkable_hits: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_walk_speed: 600.0,
            max_walk_speed_crouched: 300.0,
            max_acceleration: 2048.0,
            ground_friction: 8.0,
            braking_deceleration_walking: 2048.0,
            braking_friction_factor: 2.0,
            braking_friction: 0.0,
            use_separate_braking_friction: false,
            braking_sub_step_time: 1.0 / 33.0,
            walkable_floor_z: 0.71,
            max_step_height: 45.0,
            can_walk_off_ledges: true,
            can_walk_off_ledges_when_crouching: false,
            maintain_horizontal_ground_velocity: true,
            ledge_check_threshold: 4.0,
            perch_radius_threshold: 0.0,
            perch_additional_height: 40.0,

            jump_z_velocity: 420.0,
            jump_off_jump_z_factor: 0.5,
            jump_max_hold_time: 0.0,
            jump_max_count: 1,
            air_control: 0.05,
            air_control_boost_multiplier: 2.0,
            air_control_boost_velocity_threshold: 25.0,
            falling_lateral_friction: 0.0,
            braking_deceleration_falling: 0.0,
            apply_gravity_while_jumping: true,
            terminal_velocity: 4000.0,
            land_on_any_surface: false,

            max_swim_speed: 300.0,
            buoyancy: 1.0,
            braking_deceleration_swimming: 0.0,
            out_of_water_z: 420.0,
            jump_out_of_water_pitch: 11.25,
            max_out_of_water_step_height: 40.0,
            default_fluid_friction: 0.3,

            max_fly_speed: 600.0,
            braking_deceleration_flying: 0.0,
            max_custom_movement_speed: 600.0,

            can_crouch: false,
            crouched_half_height: 40.0,

            can_jump: true,
            can_swim: true,
            can_fly: true,
            default_land_movement_mode: MovementMode::Walking,
            default_water_movement_mode: MovementMode::Swimming,

            request_move_use_acceleration: true,

            impart_base_velocity_planar: true,
            impart_base_velocity_vertical: true,
            impart_base_angular_velocity: true,

            mass: 100.0,
            trigger_unwalkable_hits: false,
        }
    }
}

impl ControllerConfig {
    /// Responsive settings for a player-controlled character.
    pub fn player() -> Self {
        Self {
            air_control: 0.35,
            jump_z_velocity: 700.0,
            jump_max_hold_time: 0.2,
            braking_deceleration_falling: 1500.0,
            can_crouch: true,
            ..default()
        }
    }

    /// Settings for AI-driven characters following paths.
    pub fn ai() -> Self {
        Self {
            max_walk_speed: 450.0,
            can_walk_off_ledges: false,
            can_crouch: true,
            request_move_use_acceleration: true,
            ..default()
        }
    }

    /// Builder: set the walkable slope as an angle in degrees.
    pub fn with_walkable_floor_angle(mut self, degrees: f32) -> Self {
        self.set_walkable_floor_angle(degrees);
        self
    }

    /// Builder: set max walk speed.
    pub fn with_max_walk_speed(mut self, speed: f32) -> Self {
        self.max_walk_speed = speed.max(0.0);
        self
    }

    /// Builder: set max step height.
    pub fn with_max_step_height(mut self, height: f32) -> Self {
        self.max_step_height = height.max(0.0);
        self
    }

    /// Builder: set jump velocity.
    pub fn with_jump_z_velocity(mut self, velocity: f32) -> Self {
        self.jump_z_velocity = velocity.max(0.0);
        self
    }

    /// Builder: set air control.
    pub fn with_air_control(mut self, air_control: f32) -> Self {
        self.air_control = air_control.max(0.0);
        self
    }

    /// Builder: keep ground velocity horizontal on ramps.
    pub fn with_maintain_horizontal_ground_velocity(mut self, maintain: bool) -> Self {
        self.maintain_horizontal_ground_velocity = maintain;
        self
    }

    /// Builder: allow or forbid walking off ledges.
    pub fn with_can_walk_off_ledges(mut self, can: bool) -> Self {
        self.can_walk_off_ledges = can;
        self
    }

    /// Builder: set perch threshold and extra height.
    pub fn with_perch(mut self, radius_threshold: f32, additional_height: f32) -> Self {
        self.perch_radius_threshold = radius_threshold.max(0.0);
        self.perch_additional_height = additional_height.max(0.0);
        self
    }

    /// Builder: enable crouching with the given half-height.
    pub fn with_crouch(mut self, crouched_half_height: f32) -> Self {
        self.can_crouch = true;
        self.crouched_half_height = crouched_half_height.max(0.0);
        self
    }

    /// Builder: report unwalkable surfaces hit while moving.
    pub fn with_unwalkable_hits(mut self, trigger: bool) -> Self {
        self.trigger_unwalkable_hits = trigger;
        self
    }

    /// Walkable slope as an angle in degrees.
    pub fn walkable_floor_angle(&self) -> f32 {
        self.walkable_floor_z.clamp(-1.0, 1.0).acos().to_degrees()
    }

    /// Set the walkable slope from an angle in degrees, clamped to `[0, 90]`.
    pub fn set_walkable_floor_angle(&mut self, degrees: f32) {
        let degrees = degrees.clamp(0.0, 90.0);
        self.walkable_floor_z = degrees.to_radians().cos().max(0.0);
    }

    /// Set the walkable slope directly from the cosine, clamped to `[0, 1]`.
    pub fn set_walkable_floor_z(&mut self, z: f32) {
        self.walkable_floor_z = z.clamp(0.0, 1.0);
    }

    /// Gravity-aligned `(jump velocity)² / (2g)`.
    pub fn max_jump_height(&self, gravity_magnitude: f32) -> f32 {
        if gravity_magnitude > crate::math::KINDA_SMALL_NUMBER {
            self.jump_z_velocity * self.jump_z_velocity / (2.0 * gravity_magnitude)
        } else {
            0.0
        }
    }
}

/// How the capsule and its gravity follow floors and gravity changes.
#[derive(Component, Reflect, Debug, Clone, Copy)]
#[reflect(Component)]
pub struct OrientationConfig {
    /// While grounded, gravity follows the base the character stands on.
    pub align_gravity_to_base: bool,
    /// While grounded, the capsule up axis follows the floor normal.
    pub align_component_to_floor: bool,
    /// The capsule up axis follows the opposite of gravity.
    pub align_component_to_gravity: bool,
    /// Rotate around the capsule center even when grounded.
    pub always_rotate_around_center: bool,
    /// Rotate ground velocity along with the capsule.
    pub rotate_velocity_on_ground: bool,
    /// Leaving a physics volume for the default one restores default gravity.
    pub revert_to_default_gravity: bool,
    /// Skip gravity snapshots for replication.
    pub disable_gravity_replication: bool,
    /// Turn the capsule about its up axis towards the acceleration.
    pub orient_rotation_to_movement: bool,
    /// Turn rate used by `orient_rotation_to_movement`, in degrees per second.
    /// Negative turns instantly.
    pub rotation_rate: f32,
    thresholds: ParallelThresholds,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            align_gravity_to_base: false,
            align_component_to_floor: false,
            align_component_to_gravity: false,
            always_rotate_around_center: false,
            rotate_velocity_on_ground: false,
            revert_to_default_gravity: false,
            disable_gravity_replication: false,
            orient_rotation_to_movement: false,
            rotation_rate: 360.0,
            thresholds: ParallelThresholds::default(),
        }
    }
}

impl OrientationConfig {
    /// Capsule follows gravity, the setting used on planets and inside
    /// gravity volumes.
    pub fn follow_gravity() -> Self {
        Self {
            align_component_to_gravity: true,
            rotate_velocity_on_ground: true,
            ..default()
        }
    }

    /// Capsule and gravity follow the floor, for walking on walls.
    pub fn follow_floor() -> Self {
        Self {
            align_gravity_to_base: true,
            align_component_to_floor: true,
            align_component_to_gravity: true,
            ..default()
        }
    }

    /// Builder: face the direction of movement, turning at `degrees_per_second`.
    pub fn with_orient_to_movement(mut self, degrees_per_second: f32) -> Self {
        self.orient_rotation_to_movement = true;
        self.rotation_rate = degrees_per_second;
        self
    }

    /// Builder: set the parallel tolerance angle in degrees.
    pub fn with_threshold_parallel_angle(mut self, degrees: f32) -> Self {
        self.set_threshold_parallel_angle(degrees);
        self
    }

    /// Set the tolerance angle, clamped to `[0.25, 1.0]` degrees.
    pub fn set_threshold_parallel_angle(&mut self, degrees: f32) {
        self.thresholds = ParallelThresholds::from_angle(degrees);
    }

    pub fn threshold_parallel_angle(&self) -> f32 {
        self.thresholds.angle
    }

    #[inline]
    pub fn thresholds(&self) -> &ParallelThresholds {
        &self.thresholds
    }
}

/// Impulses and forces exchanged with simulated bodies.
#[derive(Component, Reflect, Debug, Clone, Copy)]
#[reflect(Component)]
pub struct InteractionConfig {
    pub enable_physics_interaction: bool,
    pub touch_force_scaled_to_mass: bool,
    pub push_force_scaled_to_mass: bool,
    pub push_force_using_z_offset: bool,
    pub scale_push_force_to_velocity: bool,
    /// Multiplier on the weight applied to simulated floors.
    pub standing_downward_force_scale: f32,
    /// Impulse factor when pushing a resting body.
    pub initial_push_force_factor: f32,
    /// Force factor when pushing a moving body.
    pub push_force_factor: f32,
    /// Offset of the push point along the capsule axis, as a fraction of the
    /// half-height.
    pub push_force_point_z_offset_factor: f32,
    pub touch_force_factor: f32,
    /// Non-positive disables the lower clamp.
    pub min_touch_force: f32,
    /// Non-positive disables the upper clamp.
    pub max_touch_force: f32,
    /// Force pushing overlapping bodies away.
    pub repulsion_force: f32,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            enable_physics_interaction: true,
            touch_force_scaled_to_mass: true,
            push_force_scaled_to_mass: false,
            push_force_using_z_offset: false,
            scale_push_force_to_velocity: true,
            standing_downward_force_scale: 1.0,
            initial_push_force_factor: 500.0,
            push_force_factor: 750_000.0,
            push_force_point_z_offset_factor: -0.75,
            touch_force_factor: 1.0,
            min_touch_force: -1.0,
            max_touch_force: 250.0,
            repulsion_force: 2.5,
        }
    }
}

impl InteractionConfig {
    /// No forces exchanged with simulated bodies.
    pub fn disabled() -> Self {
        Self {
            enable_physics_interaction: false,
            ..default()
        }
    }
}

/// Integration limits.
#[derive(Component, Reflect, Debug, Clone, Copy)]
#[reflect(Component)]
pub struct SimulationTuning {
    /// Insert a sub-step at the exact apex of a jump.
    pub force_jump_peak_substep: bool,
    pub max_jump_apex_attempts_per_simulation: u32,
    /// Longest single sub-step.
    pub max_simulation_time_step: f32,
    /// Sub-steps allowed per mode step before the rest of the tick is used up
    /// in one go.
    pub max_simulation_iterations: u32,
    /// Check velocity for NaN after each step and log a warning.
    pub diagnose_nan: bool,
}

impl Default for SimulationTuning {
    fn default() -> Self {
        Self {
            force_jump_peak_substep: true,
            max_jump_apex_attempts_per_simulation: 2,
            max_simulation_time_step: 0.05,
            max_simulation_iterations: 8,
            diagnose_nan: cfg!(debug_assertions),
        }
    }
}

impl SimulationTuning {
    /// Builder: toggle the jump apex sub-step.
    pub fn with_jump_peak_substep(mut self, enabled: bool) -> Self {
        self.force_jump_peak_substep = enabled;
        self
    }

    /// Builder: set sub-step limits.
    pub fn with_limits(mut self, max_time_step: f32, max_iterations: u32) -> Self {
        self.max_simulation_time_step = max_time_step.clamp(0.0005, 1.0);
        self.max_simulation_iterations = max_iterations.clamp(1, 25);
        self
    }
}
