//! Projectiles under oriented gravity.
//!
//! A [`GravityProjectile`] flies ballistically under the gravity of the
//! physics volume it is in, or world gravity outside volumes. With
//! `follow_gravity_direction` its velocity turns with the gravity direction,
//! so a shot fired around a planet keeps its trajectory relative to the
//! ground.

use bevy::prelude::*;

use crate::math::{find_between_normals, ParallelThresholds};

/// Ballistic motion under oriented gravity.
#[derive(Component, Reflect, Debug, Clone)]
#[reflect(Component)]
pub struct GravityProjectile {
    pub velocity: Vec3,
    /// Multiplier on the gravity the projectile is in.
    pub gravity_scale: f32,
    /// Rotate the velocity when the gravity direction changes.
    pub follow_gravity_direction: bool,
    /// Speed limit, zero for none.
    pub max_speed: f32,
    /// Volume the projectile was in on the last step.
    pub current_volume: Option<Entity>,
    pending_acceleration: Vec3,
    old_gravity_direction: Vec3,
}

impl Default for GravityProjectile {
    fn default() -> Self {
        Self::new(Vec3::ZERO)
    }
}

impl GravityProjectile {
    pub fn new(velocity: Vec3) -> Self {
        Self {
            velocity,
            gravity_scale: 1.0,
            follow_gravity_direction: false,
            max_speed: 0.0,
            current_volume: None,
            pending_acceleration: Vec3::ZERO,
            old_gravity_direction: Vec3::ZERO,
        }
    }

    pub fn with_gravity_scale(mut self, scale: f32) -> Self {
        self.gravity_scale = scale;
        self
    }

    pub fn with_follow_gravity_direction(mut self, follow: bool) -> Self {
        self.follow_gravity_direction = follow;
        self
    }

    pub fn with_max_speed(mut self, max_speed: f32) -> Self {
        self.max_speed = max_speed.max(0.0);
        self
    }

    /// Extra acceleration applied on the next step only.
    pub fn add_acceleration(&mut self, acceleration: Vec3) {
        self.pending_acceleration += acceleration;
    }

    /// Gravity direction seen on the last step.
    pub fn gravity_direction(&self) -> Vec3 {
        self.old_gravity_direction
    }

    /// Turn the velocity from the previous gravity direction to `direction`.
    ///
    /// Nearly identical directions leave it alone. Opposite directions have
    /// no unique rotation, so the trajectory is reversed instead.
    pub fn follow_gravity(&mut self, direction: Vec3, thresholds: &ParallelThresholds) {
        let mut direction = direction;
        let old = self.old_gravity_direction;
        if direction != Vec3::ZERO && old != Vec3::ZERO {
            if thresholds.coincident(direction, old) {
                return;
            }
            if thresholds.opposite(direction, old) {
                self.velocity = -self.velocity;
                direction = -old;
            } else {
                self.velocity = find_between_normals(old, direction) * self.velocity;
            }
        }
        self.old_gravity_direction = direction;
    }

    /// Integrate one step under `gravity` and return the displacement.
    pub fn step(&mut self, gravity: Vec3, delta_time: f32) -> Vec3 {
        if self.follow_gravity_direction {
            self.follow_gravity(gravity.normalize_or_zero(), &ParallelThresholds::default());
        }

        let acceleration = gravity * self.gravity_scale + self.pending_acceleration;
        self.pending_acceleration = Vec3::ZERO;

        let old_velocity = self.velocity;
        let mut velocity = old_velocity + acceleration * delta_time;
        if self.max_speed > 0.0 {
            velocity = velocity.clamp_length_max(self.max_speed);
        }
        self.velocity = velocity;

        // Trapezoidal rule keeps constant-gravity arcs exact.
        (old_velocity + velocity) * (0.5 * delta_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    // ==================== Integration Tests ====================

    #[test]
    fn falls_like_a_stone() {
        let mut projectile = GravityProjectile::default();
        let mut position = Vec3::ZERO;
        for _ in 0..60 {
            position += projectile.step(Vec3::NEG_Y * 980.0, 1.0 / 60.0);
        }
        assert_relative_eq!(position.y, -490.0, epsilon = 1e-1);
        assert_relative_eq!(projectile.velocity.y, -980.0, epsilon = 1e-2);
    }

    #[test]
    fn gravity_scale_and_speed_limit_apply() {
        let mut projectile = GravityProjectile::new(Vec3::X * 100.0)
            .with_gravity_scale(0.5)
            .with_max_speed(150.0);
        projectile.step(Vec3::NEG_Y * 980.0, 1.0);
        assert_relative_eq!(projectile.velocity.length(), 150.0, epsilon = 1e-3);
    }

    #[test]
    fn pending_acceleration_lasts_one_step() {
        let mut projectile = GravityProjectile::default();
        projectile.add_acceleration(Vec3::X * 60.0);
        projectile.step(Vec3::ZERO, 1.0 / 60.0);
        projectile.step(Vec3::ZERO, 1.0 / 60.0);
        assert_relative_eq!(projectile.velocity.x, 1.0, epsilon = 1e-5);
    }

    // ==================== Follow Gravity Tests ====================

    #[rstest]
    #[case(Vec3::NEG_X, Vec3::new(0.0, -100.0, 0.0))]
    #[case(Vec3::Y, Vec3::new(-100.0, 0.0, 0.0))]
    fn velocity_turns_with_gravity(#[case] new_direction: Vec3, #[case] expected: Vec3) {
        let thresholds = ParallelThresholds::default();
        let mut projectile = GravityProjectile::new(Vec3::X * 100.0);
        projectile.follow_gravity(Vec3::NEG_Y, &thresholds);
        assert_eq!(projectile.velocity, Vec3::X * 100.0);

        projectile.follow_gravity(new_direction, &thresholds);
        assert_relative_eq!(projectile.velocity.x, expected.x, epsilon = 1e-3);
        assert_relative_eq!(projectile.velocity.y, expected.y, epsilon = 1e-3);
        assert_eq!(projectile.gravity_direction(), new_direction);
    }

    #[test]
    fn unchanged_gravity_keeps_velocity() {
        let thresholds = ParallelThresholds::default();
        let mut projectile = GravityProjectile::new(Vec3::new(3.0, 4.0, 0.0));
        projectile.follow_gravity(Vec3::NEG_Y, &thresholds);
        projectile.follow_gravity(Vec3::NEG_Y, &thresholds);
        assert_eq!(projectile.velocity, Vec3::new(3.0, 4.0, 0.0));
    }

    #[test]
    fn step_follows_gravity_when_enabled() {
        let mut projectile = GravityProjectile::new(Vec3::X * 100.0).with_follow_gravity_direction(true);
        projectile.step(Vec3::ZERO, 1.0 / 60.0);
        projectile.step(Vec3::NEG_Y * 980.0, 1.0 / 60.0);
        let speed_before = projectile.velocity.length();
        projectile.step(Vec3::NEG_X * 980.0, 1.0 / 60.0);
        assert!(projectile.velocity.y < -90.0, "velocity {:?}", projectile.velocity);
        assert!(projectile.velocity.length() > speed_before * 0.9);
    }
}
