//! Flying, custom modes and smooth moves.

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::HitResult;
use crate::detection::{StepDownResult, MIN_TICK_TIME};
use crate::state::MovementMode;

impl CharacterMover<'_> {
    /// Flying physics. Low obstacles are stepped over relative to the
    /// capsule axis.
    pub fn phys_flying(&mut self, delta_time: f32, _iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        let friction = 0.5 * self.fluid_friction();
        self.calc_velocity(delta_time, friction, true, self.max_braking_deceleration());

        self.agent.controller.just_teleported = false;
        let mut old_location = self.agent.location;
        let adjusted = self.agent.controller.velocity * delta_time;
        let rotation = self.agent.rotation;
        let mut hit = self.safe_move(adjusted, rotation, true);

        if hit.time < 1.0 && hit.blocking_hit {
            let capsule_down = -self.up();
            let up_down = capsule_down.dot(self.agent.controller.velocity.normalize_or_zero());

            let mut stepped_up = false;
            if self.can_fly_step_up(&hit, up_down) {
                let step_start = self.agent.location.dot(capsule_down);
                stepped_up = self.step_up(capsule_down, adjusted * (1.0 - hit.time), &hit, None);
                if stepped_up {
                    let climbed = self.agent.location.dot(capsule_down) - step_start;
                    old_location += capsule_down * climbed;
                }
            }

            if !stepped_up {
                self.handle_impact(&hit);
                self.slide_along_surface(adjusted, 1.0 - hit.time, hit.normal, &mut hit, true);
            }
        }

        if !self.agent.controller.just_teleported {
            self.agent.controller.velocity = (self.agent.location - old_location) / delta_time;
        }
    }

    /// Side hits with mostly lateral movement may be stepped over.
    fn can_fly_step_up(&self, hit: &HitResult, up_down: f32) -> bool {
        hit.impact_normal.dot(self.up()).abs() < 0.2 && up_down < 0.5 && up_down > -0.2 && self.can_step_up(hit)
    }

    /// Run the registered physics of a custom sub-mode. Unregistered
    /// sub-modes do not move.
    pub fn phys_custom(&mut self, sub_mode: u8, delta_time: f32, iterations: u32) {
        match self.env.custom.get(sub_mode) {
            Some(movement) => movement.phys_custom(self, sub_mode, delta_time, iterations),
            None => trace!("no physics registered for custom mode {}", sub_mode),
        }
    }

    /// Move by `velocity` without integrating it: along the floor when
    /// grounded, otherwise a swept move that slides along what it hits.
    pub fn move_smooth(&mut self, velocity: Vec3, delta_time: f32, step_down: Option<&mut StepDownResult>) {
        if let MovementMode::Custom(sub_mode) = self.movement_mode() {
            self.phys_custom(sub_mode, delta_time, 0);
            return;
        }
        if self.is_moving_on_ground() {
            self.move_along_floor(velocity, delta_time, step_down);
            return;
        }

        let delta = velocity * delta_time;
        if delta == Vec3::ZERO {
            return;
        }

        let rotation = self.agent.rotation;
        let mut hit = self.safe_move(delta, rotation, true);
        if !hit.is_valid_blocking_hit() {
            return;
        }

        let mut stepped_up = false;
        if self.is_flying() {
            let capsule_down = -self.up();
            let up_down = capsule_down.dot(delta.normalize_or_zero());
            if self.can_fly_step_up(&hit, up_down) {
                stepped_up = self.step_up(capsule_down, delta * (1.0 - hit.time), &hit, step_down);
            }
        }
        if !stepped_up {
            self.slide_along_surface(delta, 1.0 - hit.time, hit.normal, &mut hit, false);
        }
    }
}
