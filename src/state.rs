//! Movement modes and per-character runtime state.
//!
//! [`CharacterController`] is the central hub for a character's movement
//! state. It holds RESULT state written by the movement step: velocity,
//! modes, the last floor query and pending external requests.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::detection::FloorResult;

/// Physics mode a character is simulated in.
#[derive(Reflect, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MovementMode {
    /// No movement; velocity is zeroed.
    #[default]
    None,
    Walking,
    /// Walking constrained to a navigation surface.
    NavWalking,
    Falling,
    Swimming,
    Flying,
    /// User-defined mode with a sub-mode id.
    Custom(u8),
}

impl MovementMode {
    /// Walking or NavWalking.
    #[inline]
    pub fn is_moving_on_ground(self) -> bool {
        matches!(self, MovementMode::Walking | MovementMode::NavWalking)
    }

    #[inline]
    pub fn is_falling(self) -> bool {
        self == MovementMode::Falling
    }

    #[inline]
    pub fn is_swimming(self) -> bool {
        self == MovementMode::Swimming
    }

    #[inline]
    pub fn is_flying(self) -> bool {
        self == MovementMode::Flying
    }

    /// Index used on the wire.
    fn index(self) -> u8 {
        match self {
            MovementMode::None => 0,
            MovementMode::Walking => 1,
            MovementMode::NavWalking => 2,
            MovementMode::Falling => 3,
            MovementMode::Swimming => 4,
            MovementMode::Flying => 5,
            MovementMode::Custom(_) => 6,
        }
    }

    fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => MovementMode::None,
            1 => MovementMode::Walking,
            2 => MovementMode::NavWalking,
            3 => MovementMode::Falling,
            4 => MovementMode::Swimming,
            5 => MovementMode::Flying,
            _ => return None,
        })
    }
}

/// Ground mode remembered across non-ground modes.
#[derive(Reflect, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GroundMovementMode {
    #[default]
    Walking,
    NavWalking,
}

impl From<GroundMovementMode> for MovementMode {
    fn from(mode: GroundMovementMode) -> Self {
        match mode {
            GroundMovementMode::Walking => MovementMode::Walking,
            GroundMovementMode::NavWalking => MovementMode::NavWalking,
        }
    }
}

/// Bits used by the mode index before the ground flag.
const GROUND_SHIFT: u8 = 3;
/// Packed values from here on encode custom sub-modes.
const CUSTOM_MODE_THRESHOLD: u8 = 2 * (1 << GROUND_SHIFT);

/// Packs a movement mode and ground mode into one byte.
///
/// Non-custom modes store the mode index in the low bits and the ground mode
/// in the bit above. Custom modes store `16 + sub_mode`.
pub fn pack_movement_mode(mode: MovementMode, ground: GroundMovementMode) -> u8 {
    match mode {
        MovementMode::Custom(sub) => CUSTOM_MODE_THRESHOLD.saturating_add(sub),
        other => {
            let ground_bit = match ground {
                GroundMovementMode::Walking => 0,
                GroundMovementMode::NavWalking => 1,
            };
            other.index() | (ground_bit << GROUND_SHIFT)
        }
    }
}

/// Inverse of [`pack_movement_mode`]. Unknown indices decode to `None`.
pub fn unpack_movement_mode(packed: u8) -> (MovementMode, GroundMovementMode) {
    if packed >= CUSTOM_MODE_THRESHOLD {
        return (
            MovementMode::Custom(packed - CUSTOM_MODE_THRESHOLD),
            GroundMovementMode::Walking,
        );
    }
    let index = packed & ((1 << GROUND_SHIFT) - 1);
    let ground = if (packed >> GROUND_SHIFT) & 1 == 1 {
        GroundMovementMode::NavWalking
    } else {
        GroundMovementMode::Walking
    };
    (MovementMode::from_index(index).unwrap_or_default(), ground)
}

/// Jump bookkeeping.
#[derive(Reflect, Debug, Clone, Copy, Default, PartialEq)]
pub struct JumpState {
    /// Jump input is active. Set on the rising edge of the intent and
    /// released once the hold time is used up.
    pub pressed: bool,
    /// A jump was performed on the previous tick and is still being held.
    pub was_jumping: bool,
    /// Jumps performed since the last landing.
    pub current_count: u32,
    /// Time left during which holding jump keeps pushing.
    pub force_time_remaining: f32,
    /// How long jump has been held.
    pub key_hold_time: f32,
    /// Report the apex of the current jump.
    pub notify_apex: bool,
}

/// Pending launch.
///
/// Unless overridden, the planar and vertical parts of the velocity at the
/// time the launch is applied are added to `velocity`.
#[derive(Reflect, Debug, Clone, Copy, PartialEq)]
pub struct LaunchRequest {
    pub velocity: Vec3,
    pub planar_override: bool,
    pub vertical_override: bool,
}

/// Velocity requested by a path follower.
#[derive(Reflect, Debug, Clone, Copy, PartialEq)]
pub struct RequestedMove {
    pub velocity: Vec3,
    /// Move at max speed regardless of the requested magnitude.
    pub force_max_speed: bool,
}

/// Pending teleport.
#[derive(Reflect, Debug, Clone, Copy, PartialEq)]
pub struct TeleportRequest {
    pub location: Vec3,
    pub rotation: Option<Quat>,
}

/// Central runtime state of a character.
#[derive(Component, Reflect, Debug, Clone)]
#[reflect(Component)]
pub struct CharacterController {
    /// Current velocity.
    pub velocity: Vec3,
    /// Acceleration derived from input on the last step.
    pub acceleration: Vec3,
    pub(crate) movement_mode: MovementMode,
    pub(crate) ground_mode: GroundMovementMode,
    /// Result of the last floor query.
    #[reflect(ignore)]
    pub floor: FloorResult,
    /// Entity the character stands on.
    pub movement_base: Option<Entity>,
    pub(crate) base_location: Vec3,
    pub(crate) base_rotation: Quat,
    pub(crate) pending_impulse: Vec3,
    pub(crate) pending_force: Vec3,
    pub(crate) pending_launch: Option<LaunchRequest>,
    pub(crate) pending_mode: Option<MovementMode>,
    pub(crate) pending_teleport: Option<TeleportRequest>,
    pub(crate) requested_move: Option<RequestedMove>,
    pub(crate) just_teleported: bool,
    pub(crate) force_next_floor_check: bool,
    pub is_crouched: bool,
    /// Half-height restored when standing up. Taken from the capsule on
    /// the first step when zero.
    pub standing_half_height: f32,
    /// Crouching keeps the capsule bottom in place instead of its center.
    pub(crate) crouch_maintains_base_location: bool,
    pub(crate) wants_to_leave_nav_walking: bool,
    pub jump: JumpState,
    pub(crate) last_unwalkable_hit_time: f32,
    /// Physics volume the character is in.
    pub current_volume: Option<Entity>,
    /// Simulated time, advanced by every step.
    pub(crate) elapsed: f32,
    /// State of the random stream used to nudge characters out of ditches.
    pub(crate) random_seed: u32,
    /// Simulated bodies touching the capsule on the last step.
    #[reflect(ignore)]
    pub(crate) touching: Vec<Entity>,
}

impl Default for CharacterController {
    fn default() -> Self {
        Self {
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            movement_mode: MovementMode::None,
            ground_mode: GroundMovementMode::Walking,
            floor: FloorResult::default(),
            movement_base: None,
            base_location: Vec3::ZERO,
            base_rotation: Quat::IDENTITY,
            pending_impulse: Vec3::ZERO,
            pending_force: Vec3::ZERO,
            pending_launch: None,
            pending_mode: None,
            pending_teleport: None,
            requested_move: None,
            just_teleported: false,
            force_next_floor_check: true,
            is_crouched: false,
            standing_half_height: 0.0,
            crouch_maintains_base_location: false,
            wants_to_leave_nav_walking: false,
            jump: JumpState::default(),
            last_unwalkable_hit_time: -1.0,
            current_volume: None,
            elapsed: 0.0,
            random_seed: 0x2545_f491,
            touching: Vec::new(),
        }
    }
}

impl CharacterController {
    /// Create a controller that starts falling and picks its mode on the
    /// first step.
    pub fn new() -> Self {
        Self {
            pending_mode: Some(MovementMode::Falling),
            ..default()
        }
    }

    /// Create a controller that starts in the given mode.
    pub fn with_mode(mode: MovementMode) -> Self {
        Self {
            pending_mode: Some(mode),
            ..default()
        }
    }

    #[inline]
    pub fn movement_mode(&self) -> MovementMode {
        self.movement_mode
    }

    #[inline]
    pub fn ground_mode(&self) -> GroundMovementMode {
        self.ground_mode
    }

    #[inline]
    pub fn is_moving_on_ground(&self) -> bool {
        self.movement_mode.is_moving_on_ground()
    }

    #[inline]
    pub fn is_falling(&self) -> bool {
        self.movement_mode.is_falling()
    }

    #[inline]
    pub fn is_swimming(&self) -> bool {
        self.movement_mode.is_swimming()
    }

    #[inline]
    pub fn is_flying(&self) -> bool {
        self.movement_mode.is_flying()
    }

    /// Switch mode at the start of the next step.
    pub fn request_movement_mode(&mut self, mode: MovementMode) {
        self.pending_mode = Some(mode);
    }

    /// Launch on the next step and start falling.
    ///
    /// `planar_override` replaces the velocity across gravity instead of
    /// adding to it, `vertical_override` does the same along gravity.
    pub fn launch(&mut self, velocity: Vec3, planar_override: bool, vertical_override: bool) {
        self.pending_launch = Some(LaunchRequest {
            velocity,
            planar_override,
            vertical_override,
        });
    }

    /// Queue an instantaneous velocity change.
    pub fn add_impulse(&mut self, impulse: Vec3, velocity_change: bool, mass: f32) {
        if impulse == Vec3::ZERO {
            return;
        }
        if velocity_change {
            self.pending_impulse += impulse;
        } else if mass > crate::math::SMALL_NUMBER {
            self.pending_impulse += impulse / mass;
        }
    }

    /// Queue a force applied over the next step.
    pub fn add_force(&mut self, force: Vec3, mass: f32) {
        if force != Vec3::ZERO && mass > crate::math::SMALL_NUMBER {
            self.pending_force += force / mass;
        }
    }

    /// Drop queued impulses and forces.
    pub fn clear_accumulated_forces(&mut self) {
        self.pending_impulse = Vec3::ZERO;
        self.pending_force = Vec3::ZERO;
        self.pending_launch = None;
    }

    /// Move to `location` on the next step and re-evaluate the floor.
    pub fn teleport(&mut self, location: Vec3, rotation: Option<Quat>) {
        self.pending_teleport = Some(TeleportRequest { location, rotation });
    }

    /// Ask to move with the given velocity, as a path follower does.
    pub fn request_direct_move(&mut self, velocity: Vec3, force_max_speed: bool) {
        self.requested_move = Some(RequestedMove {
            velocity,
            force_max_speed,
        });
    }

    /// Stop following a requested velocity.
    pub fn clear_requested_move(&mut self) {
        self.requested_move = None;
    }

    /// Make the next step run a floor query even if one was just done.
    pub fn force_floor_check(&mut self) {
        self.force_next_floor_check = true;
    }

    /// Base the character currently stands on.
    pub fn ground_entity(&self) -> Option<Entity> {
        self.movement_base
    }

    /// Time of the last unwalkable hit report, negative if none.
    pub fn last_unwalkable_hit_time(&self) -> f32 {
        self.last_unwalkable_hit_time
    }

    /// Leave NavWalking for the land mode on the next step.
    pub fn leave_nav_walking(&mut self) {
        self.wants_to_leave_nav_walking = true;
    }

    /// Seed the stream used for ditch nudges, for reproducible runs.
    pub fn with_random_seed(mut self, seed: u32) -> Self {
        self.random_seed = seed;
        self
    }

    /// Next value of the random stream in `[0, 1)`.
    pub(crate) fn next_random(&mut self) -> f32 {
        self.random_seed = self
            .random_seed
            .wrapping_mul(196_314_165)
            .wrapping_add(907_633_515);
        (self.random_seed >> 8) as f32 / (1u32 << 24) as f32
    }
}

/// Marker component indicating the character is walking on a floor.
///
/// Added and removed automatically from the movement mode.
#[derive(Component, Reflect, Debug, Clone, Copy, Default)]
#[reflect(Component)]
pub struct Grounded;

/// Marker component indicating the character is falling.
///
/// Mutually exclusive with [`Grounded`].
#[derive(Component, Reflect, Debug, Clone, Copy, Default)]
#[reflect(Component)]
pub struct Airborne;

/// Marker component indicating the character is swimming.
#[derive(Component, Reflect, Debug, Clone, Copy, Default)]
#[reflect(Component)]
pub struct Submerged;
