//! Crouching.
//!
//! Crouching shrinks the capsule to `crouched_half_height`. Standing back up
//! only happens when the full capsule fits.

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::CapsuleShape;
use crate::detection::MIN_FLOOR_DIST;
use crate::math::KINDA_SMALL_NUMBER;

impl CharacterMover<'_> {
    /// Crouching is enabled and the mode allows it.
    pub fn can_crouch_in_current_state(&self) -> bool {
        self.config.can_crouch && (self.is_falling() || self.is_moving_on_ground())
    }

    pub(crate) fn update_crouch_before_movement(&mut self) {
        let wants_to_crouch = self.agent.intent.crouch_pressed;
        let crouched = self.agent.controller.is_crouched;
        if crouched && (!wants_to_crouch || !self.can_crouch_in_current_state()) {
            self.uncrouch();
        } else if !crouched && wants_to_crouch && self.can_crouch_in_current_state() {
            self.crouch();
        }
    }

    pub(crate) fn update_crouch_after_movement(&mut self) {
        if self.agent.controller.is_crouched && !self.can_crouch_in_current_state() {
            self.uncrouch();
        }
    }

    fn standing_half_height(&self) -> f32 {
        let standing = self.agent.controller.standing_half_height;
        if standing > 0.0 {
            standing
        } else {
            self.agent.shape.half_height
        }
    }

    /// Shrink the capsule. Returns whether the character is crouched.
    pub fn crouch(&mut self) -> bool {
        if !self.can_crouch_in_current_state() {
            return false;
        }
        let standing = self.standing_half_height();
        self.agent.controller.standing_half_height = standing;

        let old = self.agent.shape;
        let crouched_half_height = self.config.crouched_half_height.max(old.radius);
        if old.half_height == crouched_half_height {
            self.agent.controller.is_crouched = true;
            return true;
        }

        let shape = CapsuleShape::new(old.radius, crouched_half_height);
        let adjust = old.half_height - crouched_half_height;
        let up = self.up();

        if crouched_half_height > old.half_height {
            // Crouched capsule taller than the current one.
            let location = self.agent.location - up * adjust;
            if self
                .query
                .overlap_capsule(location, self.agent.rotation, shape, Some(self.agent.entity))
            {
                return false;
            }
        }

        self.agent.shape = shape;
        if self.agent.controller.crouch_maintains_base_location {
            let rotation = self.agent.rotation;
            self.move_updated(-up * adjust, rotation, true);
        }

        self.agent.controller.is_crouched = true;
        self.agent.controller.force_next_floor_check = true;
        debug!("{:?} crouched", self.agent.entity);
        true
    }

    /// Grow back to the standing capsule if it fits. Returns whether the
    /// character is standing.
    pub fn uncrouch(&mut self) -> bool {
        let standing = self.standing_half_height();
        let current = self.agent.shape;
        let adjust = standing - current.half_height;
        let location = self.agent.location;
        let rotation = self.agent.rotation;
        let up = self.up();
        let ignore = Some(self.agent.entity);

        let sweep_inflation = KINDA_SMALL_NUMBER * 10.0;
        let standing_shape = CapsuleShape::new(current.radius, standing + sweep_inflation);

        let mut encroached;
        if !self.agent.controller.crouch_maintains_base_location {
            // Grow around the center.
            encroached = self.query.overlap_capsule(location, rotation, standing_shape, ignore);
            if encroached && adjust > 0.0 {
                // Drop a short capsule to the floor and try to stand from there.
                let short = CapsuleShape::sphere(current.radius);
                let trace_dist = current.half_height - current.radius;
                let hit = self.query.sweep_capsule(location, location - up * trace_dist, rotation, short, ignore);
                if !hit.start_penetrating {
                    let distance_to_base = hit.time * trace_dist + short.half_height;
                    let new_location = location
                        + up * (-distance_to_base + standing_shape.half_height + sweep_inflation + MIN_FLOOR_DIST * 0.5);
                    encroached = self.query.overlap_capsule(new_location, rotation, standing_shape, ignore);
                    if !encroached {
                        self.move_updated(new_location - location, rotation, false);
                    }
                }
            }
        } else {
            // Grow upwards, keeping the capsule bottom in place.
            let mut standing_location = location + up * (standing_shape.half_height - current.half_height);
            encroached = self.query.overlap_capsule(standing_location, rotation, standing_shape, ignore);
            if encroached && self.is_moving_on_ground() {
                // Something barely overhead: try closer to the floor.
                let min_floor_dist = KINDA_SMALL_NUMBER * 10.0;
                let floor = self.agent.controller.floor;
                if floor.blocking_hit && floor.floor_dist > min_floor_dist {
                    standing_location -= up * (floor.floor_dist - min_floor_dist);
                    encroached = self.query.overlap_capsule(standing_location, rotation, standing_shape, ignore);
                }
            }
            if !encroached {
                self.move_updated(standing_location - location, rotation, false);
                self.agent.controller.force_next_floor_check = true;
            }
        }

        if encroached {
            trace!("{:?} cannot stand up", self.agent.entity);
            return false;
        }

        self.agent.shape = CapsuleShape::new(current.radius, standing);
        self.agent.controller.is_crouched = false;
        debug!("{:?} stood up", self.agent.entity);
        true
    }
}
