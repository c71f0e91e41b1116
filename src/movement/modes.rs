//! Mode transitions, landing and teleporting.

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::HitResult;
use crate::detection::MAX_FLOOR_DIST;
use crate::events::MovementEvent;
use crate::state::{unpack_movement_mode, GroundMovementMode, MovementMode};

/// Extra clearance probed above the capsule when looking for a free spot.
const TELEPORT_SPOT_STEPS: u32 = 4;

impl CharacterMover<'_> {
    /// Change mode and react to the change. Pushes one
    /// [`MovementEvent::MovementModeChanged`] per actual change.
    pub fn set_movement_mode(&mut self, mode: MovementMode) {
        let previous = self.movement_mode();
        if previous == mode {
            return;
        }
        self.agent.controller.movement_mode = mode;

        if !self.on_movement_mode_changed(previous) {
            // Leaving NavWalking failed; the previous mode stays without notice.
            self.agent.controller.movement_mode = previous;
            return;
        }

        if !self.agent.controller.jump.pressed || !self.is_falling() {
            self.reset_jump_state();
        }

        debug!("movement mode {:?} -> {:?}", previous, self.movement_mode());
        self.notify(MovementEvent::MovementModeChanged {
            previous,
            current: self.movement_mode(),
        });
    }

    /// Remember the ground mode used when landing. Other modes are ignored.
    pub fn set_ground_movement_mode(&mut self, mode: MovementMode) {
        self.agent.controller.ground_mode = match mode {
            MovementMode::Walking => GroundMovementMode::Walking,
            MovementMode::NavWalking => GroundMovementMode::NavWalking,
            _ => return,
        };
    }

    /// Returns `false` when the change must be undone.
    fn on_movement_mode_changed(&mut self, previous: MovementMode) -> bool {
        let mode = self.movement_mode();

        if mode == MovementMode::NavWalking {
            self.set_ground_movement_mode(mode);
            let up = self.up();
            let velocity = self.agent.controller.velocity;
            self.agent.controller.velocity = velocity - up * velocity.dot(up);
        } else if previous == MovementMode::NavWalking
            && (mode == self.config.default_land_movement_mode || mode == MovementMode::Walking)
            && !self.try_to_leave_nav_walking()
        {
            return false;
        }

        if mode == MovementMode::Walking {
            self.agent.controller.crouch_maintains_base_location = true;
            self.set_ground_movement_mode(mode);

            let saved = self.land_on_any_surface;
            self.land_on_any_surface = saved || self.applying_network_mode;
            let location = self.agent.location;
            self.agent.controller.floor = self.find_floor(location, None);
            self.land_on_any_surface = saved;

            let desired_up = self.desired_up_axis();
            self.update_component_rotation(desired_up, self.orientation.always_rotate_around_center, false);
            self.adjust_floor_height();
            self.set_base_from_floor();
            self.maintain_horizontal_ground_velocity();
        } else {
            self.agent.controller.floor.clear();
            self.agent.controller.crouch_maintains_base_location = false;

            let desired_up = self.desired_up_axis();
            self.update_component_rotation(desired_up, true, false);

            if mode == MovementMode::Falling {
                self.agent.controller.velocity += self.imparted_movement_base_velocity();
                if previous != MovementMode::Falling {
                    self.notify(MovementEvent::StartedFalling);
                }
            }

            self.set_base(None);

            if mode == MovementMode::None {
                self.agent.controller.velocity = Vec3::ZERO;
                self.agent.controller.acceleration = Vec3::ZERO;
                self.reset_jump_state();
                self.agent.controller.clear_accumulated_forces();
            }
        }
        true
    }

    /// Apply a replicated, packed movement mode.
    pub fn apply_network_movement_mode(&mut self, packed: u8) {
        if self.movement_mode() == MovementMode::None {
            return;
        }
        let (mode, ground) = unpack_movement_mode(packed);
        self.applying_network_mode = true;
        self.agent.controller.ground_mode = ground;
        self.set_movement_mode(mode);
        self.applying_network_mode = false;
    }

    /// Water mode when submerged, otherwise the land mode. Falls when the
    /// land mode is walking but no floor is found.
    pub fn set_default_movement_mode(&mut self) {
        if self.can_ever_swim() && self.is_in_water() {
            self.set_movement_mode(self.config.default_water_movement_mode);
        } else if self.movement_mode() != self.config.default_land_movement_mode {
            let saved_velocity = self.agent.controller.velocity;
            self.set_movement_mode(self.config.default_land_movement_mode);

            if self.is_walking() && self.agent.controller.movement_base.is_none() {
                self.agent.controller.velocity = saved_velocity;
                self.set_movement_mode(MovementMode::Falling);
            }
        }
    }

    /// Leave NavWalking for regular walking if the capsule fits.
    pub fn try_to_leave_nav_walking(&mut self) -> bool {
        let spot = self.find_teleport_spot(self.agent.location, self.agent.rotation);
        let succeeded = spot.is_some();
        if let Some(spot) = spot {
            let delta = spot - self.agent.location;
            let rotation = self.agent.rotation;
            self.move_updated(delta, rotation, false);
        }

        if self.movement_mode() == MovementMode::NavWalking && succeeded {
            let land = match self.config.default_land_movement_mode {
                MovementMode::NavWalking => MovementMode::Walking,
                other => other,
            };
            self.set_movement_mode(land);
        }

        self.agent.controller.wants_to_leave_nav_walking = !succeeded;
        succeeded
    }

    /// Nearest free location at or above `location` along the capsule up
    /// axis.
    pub fn find_teleport_spot(&self, location: Vec3, rotation: Quat) -> Option<Vec3> {
        let up = crate::math::up_axis(rotation);
        let step = self.agent.shape.radius * 0.5;
        (0..=TELEPORT_SPOT_STEPS)
            .map(|i| location + up * (i as f32 * step))
            .find(|candidate| {
                !self
                    .query
                    .overlap_capsule(*candidate, rotation, self.agent.shape, Some(self.agent.entity))
            })
    }

    /// Teleport to `location`, keeping the capsule up axis unless a rotation
    /// is given. Refuses locations where the capsule does not fit.
    pub fn teleport_to(&mut self, location: Vec3, rotation: Option<Quat>) -> bool {
        let rotation = rotation.unwrap_or(self.agent.rotation);
        let Some(spot) = self.find_teleport_spot(location, rotation) else {
            warn!("teleport of {:?} to {:?} blocked", self.agent.entity, location);
            return false;
        };
        let delta = spot - self.agent.location;
        self.move_updated(delta, rotation, false);
        self.on_teleported();
        true
    }

    /// Re-evaluate floor and mode after the capsule was moved without
    /// sweeping.
    pub fn on_teleported(&mut self) {
        self.agent.controller.just_teleported = true;
        self.update_floor_from_adjustment();

        let old_base = self.agent.controller.movement_base;
        let floor = self.agent.controller.floor;
        let up = self.up();
        let new_base = if old_base.is_some()
            && floor.is_walkable_floor()
            && floor.floor_dist <= MAX_FLOOR_DIST
            && self.agent.controller.velocity.dot(up) <= 0.0
        {
            floor.hit.entity
        } else {
            self.agent.controller.floor.clear();
            None
        };

        let mode = self.movement_mode();
        let was_falling = mode == MovementMode::Falling;
        let was_swimming = mode == self.config.default_water_movement_mode || mode == MovementMode::Swimming;

        if self.can_ever_swim() && self.is_in_water() {
            if !was_swimming {
                self.set_movement_mode(self.config.default_water_movement_mode);
            }
        } else if !self.agent.controller.floor.is_walkable_floor() || (old_base.is_some() && new_base.is_none()) {
            if !was_falling && mode != MovementMode::Flying && !matches!(mode, MovementMode::Custom(_)) {
                self.set_movement_mode(MovementMode::Falling);
            }
        } else if new_base.is_some() {
            if was_swimming {
                self.set_movement_mode(self.config.default_land_movement_mode);
            } else if was_falling {
                let hit = self.agent.controller.floor.hit;
                self.process_landed(&hit, 0.0, 0);
            }
        }

        self.save_base_location();
    }

    /// Refresh the floor after an external move, if the character is based.
    pub fn update_floor_from_adjustment(&mut self) {
        if self.agent.controller.movement_base.is_some() {
            let location = self.agent.location;
            self.agent.controller.floor = self.find_floor(location, None);
        } else {
            self.agent.controller.floor.clear();
        }
    }

    /// Touch down after falling and continue the tick in the new mode.
    pub fn process_landed(&mut self, hit: &HitResult, remaining_time: f32, iterations: u32) {
        self.notify(MovementEvent::Landed { hit: *hit });
        if self.is_falling() {
            self.set_post_landed_physics(hit);
        }
        self.start_new_physics(remaining_time, iterations);
    }

    /// Pick the mode after landing and push what was landed on.
    pub fn set_post_landed_physics(&mut self, hit: &HitResult) {
        if self.can_ever_swim() && self.is_in_water() {
            self.set_movement_mode(MovementMode::Swimming);
            return;
        }

        let gravity = if self.is_falling() { self.gravity() } else { Vec3::ZERO };
        let pre_impact_acceleration = self.agent.controller.acceleration + gravity;
        let pre_impact_velocity = self.agent.controller.velocity;

        match self.config.default_land_movement_mode {
            MovementMode::Walking | MovementMode::NavWalking | MovementMode::Falling => {
                let ground = self.agent.controller.ground_mode.into();
                self.set_movement_mode(ground);
            }
            _ => self.set_default_movement_mode(),
        }

        if self.interaction.enable_physics_interaction {
            self.apply_impact_physics_forces(hit, pre_impact_acceleration, pre_impact_velocity);
        }
    }
}
