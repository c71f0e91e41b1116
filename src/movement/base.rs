//! Movement base tracking.
//!
//! While walking, the character stands on the entity under its floor. Moving
//! bases carry the character along, and their velocity is imparted when the
//! character leaves them.

use bevy::prelude::*;

use super::CharacterMover;
use crate::math::{plane_project, KINDA_SMALL_NUMBER};

impl CharacterMover<'_> {
    /// Change the movement base. Standing on another character bounces off
    /// it.
    pub fn set_base(&mut self, base: Option<Entity>) {
        if self.agent.controller.movement_base == base {
            return;
        }
        self.agent.controller.movement_base = base;
        self.save_base_location();

        if let Some(base) = base {
            trace!("{:?} now based on {:?}", self.agent.entity, base);
            if self.movement_mode() != crate::state::MovementMode::None && self.env.bodies.is_character(base) {
                self.jump_off();
            }
        }
    }

    /// Base on the current floor if it is walkable, otherwise clear the base.
    pub fn set_base_from_floor(&mut self) {
        let floor = self.agent.controller.floor;
        if floor.is_walkable_floor() {
            self.set_base(floor.hit.entity);
        } else {
            self.set_base(None);
        }
    }

    /// Remember where the base is, to follow it on the next step.
    pub fn save_base_location(&mut self) {
        let Some(base) = self.agent.controller.movement_base else {
            return;
        };
        if let Some(transform) = self.env.bodies.transform(base) {
            self.agent.controller.base_location = transform.translation;
            self.agent.controller.base_rotation = transform.rotation;
        }
    }

    pub fn maybe_update_based_movement(&mut self, delta_time: f32) {
        let Some(base) = self.agent.controller.movement_base else {
            return;
        };
        if self.env.bodies.is_movable(base) {
            self.update_based_movement(delta_time);
        }
    }

    /// Follow the base's motion since the last saved base location.
    pub fn update_based_movement(&mut self, _delta_time: f32) {
        let Some(base) = self.agent.controller.movement_base else {
            return;
        };
        let Some(transform) = self.env.bodies.transform(base) else {
            // The base is gone.
            self.set_base(None);
            return;
        };

        let old_location = self.agent.controller.base_location;
        let old_rotation = self.agent.controller.base_rotation;
        let new_location = transform.translation;
        let new_rotation = transform.rotation;

        let rotation_changed = !old_rotation.abs_diff_eq(new_rotation, 1.0e-8);
        if !rotation_changed && old_location == new_location {
            return;
        }

        let mut final_rotation = self.agent.rotation;
        if rotation_changed {
            let delta_rotation = new_rotation * old_rotation.inverse();
            final_rotation = (delta_rotation * final_rotation).normalize();
        }

        // Follow the base at the capsule bottom, not its center.
        let up = self.up();
        let base_offset = up * self.agent.shape.half_height;
        let location = self.agent.location;
        let local = old_rotation.inverse() * (location - base_offset - old_location);
        let new_world = new_location + new_rotation * local + base_offset;
        let mut delta = new_world - location;

        let base_move = new_location - old_location;
        if !rotation_changed && plane_project(base_move, up).length_squared() <= KINDA_SMALL_NUMBER * KINDA_SMALL_NUMBER {
            // Vertical base motion only.
            delta = up * delta.dot(up);
        }

        let expected = location + delta;
        self.move_updated(delta, final_rotation, true);
        if !(self.agent.location - expected).abs_diff_eq(Vec3::ZERO, KINDA_SMALL_NUMBER) {
            trace!("{:?} could not follow its base", self.agent.entity);
        }

        self.agent.controller.base_location = new_location;
        self.agent.controller.base_rotation = new_rotation;
    }

    /// Velocity of the base at the capsule bottom, restricted to the parts
    /// enabled in the configuration.
    pub fn imparted_movement_base_velocity(&self) -> Vec3 {
        let Some(base) = self.agent.controller.movement_base else {
            return Vec3::ZERO;
        };
        if !self.env.bodies.is_movable(base) {
            return Vec3::ZERO;
        }

        let mut base_velocity = self.env.bodies.linear_velocity(base);
        if self.config.impart_base_angular_velocity {
            if let Some(transform) = self.env.bodies.transform(base) {
                let bottom = self.agent.location - self.up() * self.agent.shape.half_height;
                let radial = bottom - transform.translation;
                base_velocity += self.env.bodies.angular_velocity(base).cross(radial);
            }
        }

        let up = self.up();
        let mut result = Vec3::ZERO;
        if self.config.impart_base_velocity_planar {
            result += plane_project(base_velocity, up);
        }
        if self.config.impart_base_velocity_vertical {
            result += up * base_velocity.dot(up);
        }
        result
    }
}
