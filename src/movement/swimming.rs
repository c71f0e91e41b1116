//! Swimming physics.
//!
//! Vertical quantities are measured against gravity: buoyancy cancels part
//! of gravity depending on how deep the capsule is immersed, and the
//! character may climb out at low ledges.

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::HitResult;
use crate::detection::MIN_TICK_TIME;
use crate::math::{plane_project, KINDA_SMALL_NUMBER};
use crate::state::MovementMode;

/// Vertical speed given to a character entering water, for a smooth bob.
const SWIM_BOB_SPEED: f32 = -80.0;

impl CharacterMover<'_> {
    /// Swimming physics.
    pub fn phys_swimming(&mut self, delta_time: f32, mut iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        let gravity_dir = self.gravity_direction(true);
        let up = -gravity_dir;
        let depth = self.immersion_depth();
        let net_buoyancy = self.config.buoyancy * depth;
        let original_accel_up = self.agent.controller.acceleration.dot(up);
        let mut limited_up_accel = false;

        let velocity_up = self.agent.controller.velocity.dot(up);
        let max_swim_speed = self.config.max_swim_speed;
        if velocity_up > 0.33 * max_swim_speed && net_buoyancy != 0.0 {
            // Damp upward speed near the surface.
            let damped = (0.33 * max_swim_speed).max(velocity_up * depth * depth);
            self.set_vertical_velocity(up, damped);
        } else if depth < 0.65 {
            limited_up_accel = original_accel_up > 0.0;
            let acceleration = self.agent.controller.acceleration;
            self.agent.controller.acceleration =
                plane_project(acceleration, up) + up * original_accel_up.min(0.1);
        }

        iterations += 1;
        let mut old_location = self.agent.location;
        self.agent.controller.just_teleported = false;

        let friction = 0.5 * self.fluid_friction() * depth;
        self.calc_velocity(delta_time, friction, true, self.max_braking_deceleration());
        let gravity = self.gravity();
        self.agent.controller.velocity += gravity * delta_time * (1.0 - net_buoyancy);

        let mut adjusted = self.agent.controller.velocity * delta_time;
        let mut hit = HitResult::miss(old_location, old_location + adjusted);
        let remaining_time = delta_time * self.swim(adjusted, &mut hit);

        // Leaving the water may have changed the mode.
        if !self.is_swimming() {
            self.start_new_physics(remaining_time, iterations);
            return;
        }

        if hit.time < 1.0 && hit.blocking_hit {
            self.handle_impact(&hit);

            if limited_up_accel && self.agent.controller.velocity.dot(up) >= 0.0 {
                // Against an obstacle at the surface: allow swimming up.
                self.agent.controller.velocity += up * (original_accel_up * delta_time);
                adjusted = self.agent.controller.velocity * (1.0 - hit.time) * delta_time;
                self.swim(adjusted, &mut hit);
                if !self.is_swimming() {
                    self.start_new_physics(remaining_time, iterations);
                    return;
                }
            }

            let velocity_dir = self.agent.controller.velocity.normalize_or_zero();
            let up_down = gravity_dir.dot(velocity_dir);

            let mut stepped_up = false;
            if hit.impact_normal.dot(up).abs() < 0.2 && up_down < 0.5 && up_down > -0.2 && self.can_step_up(&hit) {
                let step_start = self.agent.location.dot(up);
                let real_velocity = self.agent.controller.velocity;
                // Moving up: keeps the step from counting as leaving the
                // water downwards.
                self.set_vertical_velocity(up, 1.0);
                stepped_up = self.step_up(gravity_dir, adjusted * (1.0 - hit.time), &hit, None);
                if stepped_up {
                    if !self.is_swimming() {
                        self.start_new_physics(remaining_time, iterations);
                        return;
                    }
                    let climbed = self.agent.location.dot(up) - step_start;
                    old_location += up * climbed;
                }
                self.agent.controller.velocity = real_velocity;
            }

            if !stepped_up {
                self.slide_along_surface(adjusted, 1.0 - hit.time, hit.normal, &mut hit, true);
            }
        }

        let moved_time = delta_time - remaining_time;
        if !self.agent.controller.just_teleported && moved_time > KINDA_SMALL_NUMBER {
            let water_jump = !self.is_in_water();
            let velocity_up = self.agent.controller.velocity.dot(up);
            let velocity = (self.agent.location - old_location) / moved_time;
            self.agent.controller.velocity = velocity;
            if water_jump {
                self.set_vertical_velocity(up, velocity_up);
            }
        }

        if !self.is_in_water() && self.is_swimming() {
            self.set_movement_mode(MovementMode::Falling);
        }

        if !self.is_swimming() {
            self.start_new_physics(remaining_time, iterations);
        }
    }

    fn set_vertical_velocity(&mut self, up: Vec3, speed: f32) {
        let velocity = self.agent.controller.velocity;
        self.agent.controller.velocity = plane_project(velocity, up) + up * speed;
    }

    /// Move by `delta` while swimming. When the move leaves the water the
    /// capsule is pulled back to the water line. Returns the fraction of the
    /// move spent out of water.
    pub fn swim(&mut self, delta: Vec3, hit: &mut HitResult) -> f32 {
        let start = self.agent.location;
        let rotation = self.agent.rotation;
        let mut air_time = 0.0;
        *hit = self.safe_move(delta, rotation, true);

        if !self.is_in_water() {
            let location = self.agent.location;
            let end = self.find_water_line(start, location);
            let desired_dist = delta.length();
            if end != location && desired_dist > KINDA_SMALL_NUMBER {
                air_time = (end - location).length() / desired_dist;
                if (location - start).dot(end - location) > 0.0 {
                    air_time = 0.0;
                }
                *hit = self.safe_move(end - location, rotation, true);
            }
        }
        air_time
    }

    /// Switch into swimming after falling into water during a sub-step
    /// from `old_location` with `old_velocity`.
    pub fn start_swimming(
        &mut self,
        old_location: Vec3,
        old_velocity: Vec3,
        time_tick: f32,
        mut remaining_time: f32,
        iterations: u32,
    ) {
        if time_tick > 0.0 {
            // Velocity when entering the water, from the average over the tick.
            let average = (self.agent.location - old_location) / time_tick;
            let velocity = 2.0 * average - old_velocity;
            self.agent.controller.velocity = velocity.clamp_length_max(self.terminal_velocity().abs());
        }

        let location = self.agent.location;
        let end = self.find_water_line(location, old_location);
        if end != location {
            let actual_dist = (location - old_location).length();
            if actual_dist > KINDA_SMALL_NUMBER {
                remaining_time += time_tick * (end - location).length() / actual_dist;
            }
            let rotation = self.agent.rotation;
            self.move_updated(end - location, rotation, true);
        }

        let up = -self.gravity_direction(true);
        let velocity_up = self.agent.controller.velocity.dot(up);
        if velocity_up > 2.0 * SWIM_BOB_SPEED && velocity_up < 0.0 {
            let speed = self.agent.controller.velocity.length();
            self.set_vertical_velocity(up, SWIM_BOB_SPEED - speed * 0.7);
        }

        if remaining_time >= MIN_TICK_TIME && iterations < self.tuning.max_simulation_iterations {
            self.phys_swimming(remaining_time, iterations);
        }
    }

    /// Direction to jump out of water, when the character looks up far
    /// enough and is not sinking.
    pub fn should_jump_out_of_water(&self) -> Option<Vec3> {
        let gravity_dir = self.gravity_direction(true);
        if self.agent.controller.velocity.dot(gravity_dir) >= 0.0 {
            return None;
        }
        let look = self.agent.intent.look_direction.normalize_or_zero();
        let pitch_limit = (self.config.jump_out_of_water_pitch + 90.0).to_radians().cos();
        (look.dot(gravity_dir) < pitch_limit).then_some(look)
    }

    /// Whether a low ledge in `check_direction` can be climbed onto from the
    /// water. Returns the direction into the wall.
    pub fn check_water_jump(&self, check_direction: Vec3) -> Option<Vec3> {
        let gravity_dir = self.gravity_direction(true);
        let check_direction = plane_project(check_direction, gravity_dir).normalize_or_zero();
        if check_direction == Vec3::ZERO {
            return None;
        }

        let radius = self.agent.shape.radius;
        let location = self.agent.location;
        let ignore = Some(self.agent.entity);
        let check_point = location + check_direction * (1.2 * radius);
        let hit = self
            .query
            .sweep_capsule(location, check_point, self.agent.rotation, self.agent.shape, ignore);
        if !hit.blocking_hit || hit.entity.is_some_and(|e| self.env.bodies.is_character(e)) {
            return None;
        }

        // The wall is low enough when nothing blocks just above the step
        // height, or what blocks is a floor.
        let wall_normal = -hit.impact_normal;
        let start = location - gravity_dir * self.config.max_out_of_water_step_height;
        let end = start + wall_normal * (3.2 * radius);
        let ledge = self.query.line_trace(start, end, ignore);
        (!ledge.blocking_hit || self.is_walkable(&ledge)).then_some(wall_normal)
    }

    /// Leave the water with the out-of-water vertical speed.
    pub fn jump_out_of_water(&mut self, wall_normal: Vec3) {
        debug!("{:?} jumps out of water at {:?}", self.agent.entity, wall_normal);
        self.agent.controller.velocity = self.out_of_water_velocity();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use crate::events::MovementEvent;
    use crate::volume::PhysicsVolume;

    /// Water filling the space below y = 0, above a floor at y = -1000.
    fn pool() -> Fixture {
        Fixture::empty().with_scene(|scene, entities| {
            scene.with_plane(entities[0], Vec3::new(0.0, -1000.0, 0.0), Vec3::Y)
        })
        .with_snapshot(|snapshot, entities| {
            snapshot.with_volume(entities[1], Vec3::new(0.0, -500.0, 0.0), PhysicsVolume::water(Vec3::new(2000.0, 500.0, 2000.0)))
        })
    }

    // ==================== Water Entry Tests ====================

    #[test]
    fn falling_into_water_starts_swimming() {
        let fixture = pool();
        let mut agent = fixture.agent_at(Vec3::Y * 200.0);
        fixture.mover(&mut agent).set_movement_mode(MovementMode::Falling);
        for _ in 0..60 {
            fixture.mover(&mut agent).tick(1.0 / 60.0);
        }
        assert_eq!(agent.controller.movement_mode(), MovementMode::Swimming);
        assert_eq!(agent.controller.current_volume, Some(fixture.spare(1)));
    }

    #[test]
    fn water_without_swimming_reports_unable_to_move() {
        let fixture = pool().with_config(|c| c.can_swim = false);
        let mut agent = fixture.agent_at(Vec3::Y * 50.0);
        fixture.mover(&mut agent).set_movement_mode(MovementMode::Falling);
        for _ in 0..30 {
            fixture.mover(&mut agent).tick(1.0 / 60.0);
        }
        assert!(agent.events.iter().any(|e| matches!(e, MovementEvent::UnableToMove)));
        assert_ne!(agent.controller.movement_mode(), MovementMode::Swimming);
    }

    // ==================== Immersion Tests ====================

    #[test]
    fn immersion_depth_tracks_surface() {
        let fixture = pool();
        let mut agent = fixture.agent_at(Vec3::new(0.0, -300.0, 0.0));
        let mut mover = fixture.mover(&mut agent);
        mover.update_physics_volume();
        assert_eq!(mover.immersion_depth(), 1.0);

        let rotation = mover.agent.rotation;
        mover.move_updated(Vec3::Y * 300.0, rotation, false);
        // Capsule center right at the surface: half immersed.
        assert!((mover.immersion_depth() - 0.5).abs() < 0.01);
    }

    #[test]
    fn immersion_depth_is_zero_on_land() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mover = fixture.mover(&mut agent);
        assert_eq!(mover.immersion_depth(), 0.0);
    }

    // ==================== PhysSwimming Tests ====================

    #[test]
    fn buoyant_character_does_not_sink() {
        let fixture = pool();
        let mut agent = fixture.agent_at(Vec3::new(0.0, -300.0, 0.0));
        fixture.mover(&mut agent).update_physics_volume();
        assert_eq!(agent.controller.movement_mode(), MovementMode::Swimming);

        for _ in 0..60 {
            fixture.mover(&mut agent).tick(1.0 / 60.0);
        }
        assert!((agent.location.y + 300.0).abs() < 1.0, "drifted to {}", agent.location.y);
    }

    #[test]
    fn swimming_moves_with_input() {
        let fixture = pool();
        let mut agent = fixture.agent_at(Vec3::new(0.0, -300.0, 0.0));
        fixture.mover(&mut agent).update_physics_volume();
        agent.intent.set_input(Vec3::X);
        for _ in 0..60 {
            fixture.mover(&mut agent).tick(1.0 / 60.0);
        }
        assert!(agent.location.x > 100.0);
        assert!(agent.controller.velocity.length() <= 300.0 * 1.01);
    }

    #[test]
    fn swimming_up_stops_at_surface() {
        let fixture = pool();
        let mut agent = fixture.agent_at(Vec3::new(0.0, -200.0, 0.0));
        fixture.mover(&mut agent).update_physics_volume();
        agent.intent.set_input(Vec3::Y);
        for _ in 0..240 {
            fixture.mover(&mut agent).tick(1.0 / 60.0);
        }
        // Bobbing at the surface, never launched out of the water.
        assert!(agent.location.y < 60.0, "rose to {}", agent.location.y);
        assert!(agent.location.y > -100.0, "stayed at {}", agent.location.y);
    }

    // ==================== Water Jump Tests ====================

    #[test]
    fn low_ledge_allows_water_jump() {
        let fixture = pool().with_scene(|scene, entities| {
            // Pool wall ending level with the water surface.
            scene.with_box(entities[2], Vec3::new(1100.0, -500.0, 0.0), Quat::IDENTITY, Vec3::new(1000.0, 500.0, 1000.0))
        });
        let mut agent = fixture.agent_at(Vec3::new(60.0, -30.0, 0.0));
        let mover = fixture.mover(&mut agent);
        let wall = mover.check_water_jump(Vec3::X);
        assert!(wall.is_some_and(|n| n.x > 0.9));
    }

    #[test]
    fn high_wall_blocks_water_jump() {
        let fixture = pool().with_scene(|scene, entities| {
            scene.with_box(entities[2], Vec3::new(1100.0, 0.0, 0.0), Quat::IDENTITY, Vec3::new(1000.0, 1000.0, 1000.0))
        });
        let mut agent = fixture.agent_at(Vec3::new(60.0, -30.0, 0.0));
        let mover = fixture.mover(&mut agent);
        assert!(mover.check_water_jump(Vec3::X).is_none());
    }

    #[test]
    fn looking_up_wants_water_jump() {
        let fixture = pool();
        let mut agent = fixture.agent_at(Vec3::new(0.0, -30.0, 0.0));
        agent.controller.velocity = Vec3::Y * 50.0;
        agent.intent.set_look_direction(Vec3::new(1.0, 0.5, 0.0));
        assert!(fixture.mover(&mut agent).should_jump_out_of_water().is_some());

        agent.intent.set_look_direction(Vec3::new(1.0, -0.1, 0.0));
        assert!(fixture.mover(&mut agent).should_jump_out_of_water().is_none());
    }
}
