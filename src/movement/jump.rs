//! Jump input and jump physics.

use bevy::prelude::*;

use super::CharacterMover;
use crate::math::plane_project;
use crate::state::MovementMode;

/// Fraction of the max speed used when bouncing off another character.
const JUMP_OFF_SPEED_FACTOR: f32 = 0.85;

impl CharacterMover<'_> {
    /// Turn edges of the jump intent into presses and releases.
    pub(crate) fn update_jump_input(&mut self) {
        let pressed = self.agent.intent.jump_pressed;
        let previous = self.agent.intent.jump_pressed_prev;
        if pressed && !previous {
            self.jump();
        } else if !pressed && previous {
            self.stop_jumping();
        }
        self.agent.intent.jump_pressed_prev = pressed;
    }

    /// Press jump. The jump happens on the next input check.
    pub fn jump(&mut self) {
        let jump = &mut self.agent.controller.jump;
        jump.pressed = true;
        jump.key_hold_time = 0.0;
    }

    /// Release jump.
    pub fn stop_jumping(&mut self) {
        self.agent.controller.jump.pressed = false;
        self.reset_jump_state();
    }

    /// Forget jump input. The jump count survives while falling.
    pub fn reset_jump_state(&mut self) {
        let falling = self.is_falling();
        let jump = &mut self.agent.controller.jump;
        jump.pressed = false;
        jump.was_jumping = false;
        jump.key_hold_time = 0.0;
        jump.force_time_remaining = 0.0;
        if !falling {
            jump.current_count = 0;
        }
    }

    /// Jump if the input asks for it and the character may.
    pub fn check_jump_input(&mut self, _delta_time: f32) {
        if !self.agent.controller.jump.pressed {
            return;
        }

        // Jumping while already falling uses up the first jump.
        if self.agent.controller.jump.current_count == 0 && self.is_falling() {
            self.agent.controller.jump.current_count += 1;
        }

        let did_jump = self.can_jump() && self.do_jump();
        let jump = &mut self.agent.controller.jump;
        if did_jump && !jump.was_jumping {
            jump.current_count += 1;
            jump.force_time_remaining = self.config.jump_max_hold_time;
            debug!("jump {} of {}", jump.current_count, self.config.jump_max_count);
        }
        jump.was_jumping = did_jump;
    }

    /// Account for time spent holding jump.
    pub fn clear_jump_input(&mut self, delta_time: f32) {
        let max_hold_time = self.config.jump_max_hold_time;
        let jump = &mut self.agent.controller.jump;
        if jump.pressed {
            jump.key_hold_time += delta_time;
            // A held key stays pressed until the hold time is used up.
            if jump.key_hold_time >= max_hold_time {
                jump.pressed = false;
            }
        } else {
            jump.force_time_remaining = 0.0;
            jump.was_jumping = false;
        }
    }

    /// Whether a jump is allowed right now.
    pub fn can_jump(&self) -> bool {
        if self.agent.controller.is_crouched || !self.can_attempt_jump() {
            return false;
        }

        let jump = &self.agent.controller.jump;
        let max_count = self.config.jump_max_count;
        let max_hold_time = self.config.jump_max_hold_time;
        if !jump.was_jumping || max_hold_time <= 0.0 {
            if jump.current_count == 0 && self.is_falling() {
                jump.current_count + 1 < max_count
            } else {
                jump.current_count < max_count
            }
        } else {
            let key_held = jump.pressed && jump.key_hold_time < max_hold_time;
            key_held
                && (jump.current_count < max_count
                    || (jump.was_jumping && jump.current_count == max_count))
        }
    }

    /// Jumping is enabled, crouching is not requested and the mode allows it.
    pub fn can_attempt_jump(&self) -> bool {
        self.config.can_jump
            && !self.agent.intent.crouch_pressed
            && (self.is_moving_on_ground() || self.is_falling())
    }

    /// Apply the jump velocity along the capsule up axis and start falling.
    pub fn do_jump(&mut self) -> bool {
        if !self.config.can_jump {
            return false;
        }
        let up = self.up();
        let velocity = self.agent.controller.velocity;
        let vertical = velocity.dot(up).max(self.config.jump_z_velocity);
        self.agent.controller.velocity = plane_project(velocity, up) + up * vertical;
        self.agent.controller.jump.notify_apex = true;
        self.set_movement_mode(MovementMode::Falling);
        true
    }

    /// Bounce off a base the character cannot stand on, such as another
    /// character.
    pub fn jump_off(&mut self) {
        let max_speed = self.max_speed() * JUMP_OFF_SPEED_FACTOR;
        let direction = self.best_direction_off_base();
        let up = self.up();

        let velocity = self.agent.controller.velocity + direction * max_speed;
        let mut planar = plane_project(velocity, up);
        if planar.length() > max_speed {
            planar = plane_project(velocity.normalize_or_zero() * max_speed, up);
        }

        self.agent.controller.velocity =
            planar + up * (self.config.jump_z_velocity * self.config.jump_off_jump_z_factor);
        self.set_movement_mode(MovementMode::Falling);
    }

    /// Random direction away from the base, tilted up.
    fn best_direction_off_base(&mut self) -> Vec3 {
        let angle = self.agent.controller.next_random() * std::f32::consts::TAU;
        let local = Vec3::new(angle.cos(), 0.5, angle.sin()).normalize();
        self.agent.rotation * local
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;

    // ==================== CanJump Tests ====================

    #[test]
    fn single_jump_allowed_on_ground_only() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut mover = fixture.mover(&mut agent);
        assert!(mover.can_jump());

        mover.set_movement_mode(MovementMode::Falling);
        // The first jump is spent when falling without jumping.
        assert!(!mover.can_jump());
    }

    #[test]
    fn double_jump_while_falling() {
        let fixture = Fixture::flat().with_config(|c| c.jump_max_count = 2);
        let mut agent = fixture.walking_agent();
        let mut mover = fixture.mover(&mut agent);
        mover.set_movement_mode(MovementMode::Falling);
        assert!(mover.can_jump());
    }

    #[test]
    fn crouched_cannot_jump() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.controller.is_crouched = true;
        let mover = fixture.mover(&mut agent);
        assert!(!mover.can_jump());
    }

    // ==================== DoJump Tests ====================

    #[test]
    fn jump_sets_vertical_speed_along_capsule_up() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::new(100.0, 0.0, 0.0);
        let mut mover = fixture.mover(&mut agent);

        assert!(mover.do_jump());
        assert_eq!(mover.movement_mode(), MovementMode::Falling);
        assert_eq!(mover.agent.controller.velocity, Vec3::new(100.0, 420.0, 0.0));
    }

    #[test]
    fn jump_keeps_faster_upward_speed() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::Y * 1000.0;
        let mut mover = fixture.mover(&mut agent);
        mover.do_jump();
        assert_eq!(mover.agent.controller.velocity.y, 1000.0);
    }

    #[test]
    fn jump_input_counts_once_per_press() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.intent.jump_pressed = true;
        let mut mover = fixture.mover(&mut agent);

        mover.update_jump_input();
        mover.check_jump_input(1.0 / 60.0);
        mover.clear_jump_input(1.0 / 60.0);
        assert_eq!(mover.agent.controller.jump.current_count, 1);
        assert!(!mover.agent.controller.jump.pressed);

        // Still held: no new edge, no new jump.
        mover.update_jump_input();
        mover.check_jump_input(1.0 / 60.0);
        assert_eq!(mover.agent.controller.jump.current_count, 1);
    }

    #[test]
    fn reset_keeps_count_while_falling() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut mover = fixture.mover(&mut agent);
        mover.agent.controller.jump.current_count = 1;
        mover.set_movement_mode(MovementMode::Falling);
        mover.reset_jump_state();
        assert_eq!(mover.agent.controller.jump.current_count, 1);
    }

    #[test]
    fn jump_off_bounces_up_and_out() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut mover = fixture.mover(&mut agent);
        mover.jump_off();
        let velocity = mover.agent.controller.velocity;
        assert_eq!(mover.movement_mode(), MovementMode::Falling);
        assert!((velocity.y - 210.0).abs() < 1e-3);
        assert!(Vec3::new(velocity.x, 0.0, velocity.z).length() <= 600.0 * 0.85 + 1e-3);
    }
}
