//! Movement intent component.
//!
//! Intents represent what player input or AI wants the character to do. The
//! movement step reads them every tick and turns them into acceleration,
//! jumps and crouches.

use bevy::prelude::*;

/// Desired movement of one character.
///
/// The input direction is in world space. Its length is the analog amount
/// (clamped to 1), further scaled by `speed`. While walking or falling only
/// the part across the capsule up axis is used.
///
/// # Example
///
/// ```rust
/// use bevy::prelude::*;
/// use msg_gravity_character::prelude::*;
///
/// let mut intent = MovementIntent::new();
/// intent.set_input(Vec3::new(2.0, 0.0, 0.0));
/// assert_eq!(intent.input, Vec3::X);
/// assert!(intent.is_moving());
///
/// intent.set_speed(0.5);
/// assert_eq!(intent.effective_input(), Vec3::X * 0.5);
///
/// intent.clear();
/// assert!(!intent.is_moving());
/// ```
#[derive(Component, Reflect, Debug, Clone)]
#[reflect(Component)]
pub struct MovementIntent {
    /// Desired movement direction, length at most 1.
    pub input: Vec3,
    /// Speed multiplier (0.0 to 1.0).
    pub speed: f32,
    /// Whether the jump action is held.
    ///
    /// Set this every frame from your input source. A change from `false`
    /// to `true` presses jump; holding it extends the jump up to
    /// `jump_max_hold_time`.
    pub jump_pressed: bool,
    /// Previous tick's `jump_pressed`, for edge detection.
    pub(crate) jump_pressed_prev: bool,
    /// Whether the character wants to crouch.
    pub crouch_pressed: bool,
    /// Where the character is looking. Used to jump out of water.
    pub look_direction: Vec3,
}

impl Default for MovementIntent {
    fn default() -> Self {
        Self {
            input: Vec3::ZERO,
            speed: 1.0,
            jump_pressed: false,
            jump_pressed_prev: false,
            crouch_pressed: false,
            look_direction: Vec3::NEG_Z,
        }
    }
}

impl MovementIntent {
    /// Create a new empty movement intent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the desired direction. Longer vectors are clamped to length 1.
    pub fn set_input(&mut self, direction: Vec3) {
        self.input = if direction.is_finite() {
            direction.clamp_length_max(1.0)
        } else {
            Vec3::ZERO
        };
    }

    /// Set the speed multiplier (0.0 to 1.0).
    pub fn set_speed(&mut self, multiplier: f32) {
        self.speed = multiplier.clamp(0.0, 1.0);
    }

    /// Input with the speed multiplier applied.
    pub fn effective_input(&self) -> Vec3 {
        self.input * self.speed
    }

    /// Check if there is movement input.
    pub fn is_moving(&self) -> bool {
        self.input.length_squared() > 1.0e-6
    }

    /// Clear the movement input. Jump and crouch are left alone.
    pub fn clear(&mut self) {
        self.input = Vec3::ZERO;
    }

    /// Set the jump state. Call this every frame with the current state.
    pub fn set_jump_pressed(&mut self, pressed: bool) {
        self.jump_pressed = pressed;
    }

    /// Check if jump is currently held.
    pub fn is_jump_pressed(&self) -> bool {
        self.jump_pressed
    }

    /// Set the crouch state.
    pub fn set_crouch_pressed(&mut self, pressed: bool) {
        self.crouch_pressed = pressed;
    }

    /// Set the look direction. Zero directions are ignored.
    pub fn set_look_direction(&mut self, direction: Vec3) {
        let direction = direction.normalize_or_zero();
        if direction != Vec3::ZERO {
            self.look_direction = direction;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== MovementIntent Tests ====================

    #[test]
    fn movement_intent_new() {
        let intent = MovementIntent::new();
        assert_eq!(intent.input, Vec3::ZERO);
        assert_eq!(intent.speed, 1.0);
        assert!(!intent.jump_pressed);
        assert!(!intent.jump_pressed_prev);
        assert!(!intent.crouch_pressed);
    }

    #[test]
    fn movement_intent_input_is_clamped() {
        let mut intent = MovementIntent::new();
        intent.set_input(Vec3::new(0.3, 0.0, 0.4));
        assert_eq!(intent.input, Vec3::new(0.3, 0.0, 0.4));

        intent.set_input(Vec3::new(0.0, 0.0, -5.0));
        assert!((intent.input.length() - 1.0).abs() < 1e-6);

        intent.set_input(Vec3::new(f32::NAN, 0.0, 0.0));
        assert_eq!(intent.input, Vec3::ZERO);
    }

    #[test]
    fn movement_intent_speed_multiplier() {
        let mut intent = MovementIntent::new();
        intent.set_input(Vec3::Z);
        intent.set_speed(0.25);
        assert_eq!(intent.effective_input(), Vec3::Z * 0.25);

        intent.set_speed(2.0);
        assert_eq!(intent.speed, 1.0);
        intent.set_speed(-1.0);
        assert_eq!(intent.speed, 0.0);
    }

    #[test]
    fn movement_intent_is_moving() {
        let mut intent = MovementIntent::new();
        assert!(!intent.is_moving());

        intent.set_input(Vec3::X * 0.5);
        assert!(intent.is_moving());

        intent.set_input(Vec3::X * 0.0001);
        assert!(!intent.is_moving());
    }

    #[test]
    fn movement_intent_clear_keeps_buttons() {
        let mut intent = MovementIntent::new();
        intent.set_input(Vec3::X);
        intent.set_jump_pressed(true);
        intent.set_crouch_pressed(true);

        intent.clear();
        assert!(!intent.is_moving());
        assert!(intent.is_jump_pressed());
        assert!(intent.crouch_pressed);
    }

    #[test]
    fn movement_intent_look_direction_ignores_zero() {
        let mut intent = MovementIntent::new();
        intent.set_look_direction(Vec3::new(0.0, 3.0, 4.0));
        assert!((intent.look_direction - Vec3::new(0.0, 0.6, 0.8)).length() < 1e-6);

        intent.set_look_direction(Vec3::ZERO);
        assert!((intent.look_direction - Vec3::new(0.0, 0.6, 0.8)).length() < 1e-6);
    }
}
