//! Falling physics.
//!
//! Falling integrates gravity along the resolved gravity direction. Input
//! only acts across gravity, scaled by air control. Vertical and lateral
//! parts are measured against gravity, not the capsule axis.

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::HitResult;
use crate::detection::{MIN_TICK_TIME, VERTICAL_SLOPE_NORMAL_Z};
use crate::events::MovementEvent;
use crate::math::{plane_project, KINDA_SMALL_NUMBER};

/// Sub-steps shorter than this never receive an apex sub-step.
const APEX_TIME_MINIMUM: f32 = 1.0e-4;

impl CharacterMover<'_> {
    /// Falling physics.
    pub fn phys_falling(&mut self, delta_time: f32, mut iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        let gravity_dir = self.gravity_direction(true);
        let fall_acceleration = plane_project(self.falling_lateral_acceleration(delta_time), gravity_dir);
        let has_limited_air_control = self.should_limit_air_control(fall_acceleration);

        let mut remaining_time = delta_time;
        while remaining_time >= MIN_TICK_TIME && iterations < self.tuning.max_simulation_iterations {
            iterations += 1;
            let mut time_tick = self.simulation_time_step(remaining_time, iterations);
            remaining_time -= time_tick;

            let old_location = self.agent.location;
            let rotation = self.agent.rotation;
            self.agent.controller.just_teleported = false;

            let old_velocity = self.agent.controller.velocity;
            let max_decel = self.max_braking_deceleration();
            let gravity_dir = self.gravity_direction(true);

            // Lateral velocity from air control.
            self.agent.controller.velocity =
                self.lateral_velocity_after(time_tick, old_velocity, fall_acceleration, max_decel, gravity_dir);

            let gravity = self.gravity();
            let mut gravity_time = time_tick;
            let mut ending_jump_force = false;
            let force_time = self.agent.controller.jump.force_time_remaining;
            if force_time > 0.0 {
                let jump_force_time = force_time.min(time_tick);
                gravity_time = if self.config.apply_gravity_while_jumping {
                    time_tick
                } else {
                    (time_tick - jump_force_time).max(0.0)
                };
                self.agent.controller.jump.force_time_remaining -= jump_force_time;
                if self.agent.controller.jump.force_time_remaining <= 0.0 {
                    self.reset_jump_state();
                    ending_jump_force = true;
                }
            }

            let velocity = self.agent.controller.velocity;
            self.agent.controller.velocity = self.new_fall_velocity(velocity, gravity, gravity_time);

            // Sub-step to the exact apex so the top of the arc is not cut
            // off by the frame rate.
            let old_up_speed = -old_velocity.dot(gravity_dir);
            let new_up_speed = -self.agent.controller.velocity.dot(gravity_dir);
            if self.tuning.force_jump_peak_substep
                && old_up_speed > 0.0
                && new_up_speed <= 0.0
                && self.jump_apex_attempts < self.tuning.max_jump_apex_attempts_per_simulation
            {
                let derived_accel = (self.agent.controller.velocity - old_velocity) / time_tick;
                let derived_up = -derived_accel.dot(gravity_dir);
                if derived_up.abs() > SMALL_ACCEL {
                    let time_to_apex = -old_up_speed / derived_up;
                    if (APEX_TIME_MINIMUM..time_tick).contains(&time_to_apex) {
                        let apex_velocity = old_velocity + derived_accel * time_to_apex;
                        self.agent.controller.velocity = plane_project(apex_velocity, gravity_dir);
                        remaining_time += time_tick - time_to_apex;
                        time_tick = time_to_apex;
                        iterations -= 1;
                        self.jump_apex_attempts += 1;
                    }
                }
            }

            if self.agent.controller.jump.notify_apex && self.agent.controller.velocity.dot(gravity_dir) >= 0.0 {
                self.agent.controller.jump.notify_apex = false;
                self.notify(MovementEvent::JumpApex);
            }

            // Midpoint integration.
            let velocity = self.agent.controller.velocity;
            let mut adjusted = (old_velocity + velocity) * 0.5 * time_tick;
            if ending_jump_force && !self.config.apply_gravity_while_jumping {
                let non_gravity_time = (time_tick - gravity_time).max(0.0);
                adjusted = old_velocity * non_gravity_time + (old_velocity + velocity) * 0.5 * gravity_time;
            }

            let mut hit = self.safe_move(adjusted, rotation, true);

            let mut last_move_time_slice = time_tick;
            let mut sub_time_tick_remaining = time_tick * (1.0 - hit.time);

            if self.is_swimming() {
                remaining_time += sub_time_tick_remaining;
                self.start_swimming(old_location, old_velocity, time_tick, remaining_time, iterations);
                return;
            }

            if hit.blocking_hit {
                let location = self.agent.location;
                if self.is_valid_landing_spot(location, &hit) {
                    remaining_time += sub_time_tick_remaining;
                    self.process_landed(&hit, remaining_time, iterations);
                    return;
                }

                // Deflect using the final velocity so the slide carries the
                // whole gravity effect.
                adjusted = self.agent.controller.velocity * time_tick;

                if !hit.start_penetrating && self.should_check_for_valid_landing_spot(&hit) {
                    let location = self.agent.location;
                    let floor = self.find_floor(location, None);
                    if floor.is_walkable_floor() && self.is_valid_landing_spot(location, &floor.hit) {
                        remaining_time += sub_time_tick_remaining;
                        self.process_landed(&floor.hit, remaining_time, iterations);
                        return;
                    }
                }

                self.handle_impact(&hit);
                if !self.is_falling() {
                    return;
                }

                let mut velocity_no_air_control = old_velocity;
                let mut air_control_accel = self.agent.controller.acceleration;
                if has_limited_air_control {
                    // Velocity without any acceleration.
                    let lateral = self.lateral_velocity_after(time_tick, old_velocity, Vec3::ZERO, max_decel, gravity_dir);
                    velocity_no_air_control = self.new_fall_velocity(lateral, gravity, gravity_time);

                    air_control_accel = (self.agent.controller.velocity - velocity_no_air_control) / time_tick;
                    let air_control_delta_v =
                        self.limit_air_control(air_control_accel, &hit, false) * last_move_time_slice;
                    adjusted = (velocity_no_air_control + air_control_delta_v) * last_move_time_slice;
                }

                let old_hit_normal = hit.normal;
                let old_hit_impact_normal = hit.impact_normal;
                let mut delta = self.compute_slide_vector(adjusted, 1.0 - hit.time, old_hit_normal, &hit);

                if sub_time_tick_remaining > KINDA_SMALL_NUMBER && !self.agent.controller.just_teleported {
                    self.agent.controller.velocity = delta / sub_time_tick_remaining;
                }

                if sub_time_tick_remaining > KINDA_SMALL_NUMBER && delta.dot(adjusted) > 0.0 {
                    hit = self.safe_move(delta, rotation, true);

                    if hit.blocking_hit {
                        // Second wall.
                        last_move_time_slice = sub_time_tick_remaining;
                        sub_time_tick_remaining *= 1.0 - hit.time;

                        let location = self.agent.location;
                        if self.is_valid_landing_spot(location, &hit) {
                            remaining_time += sub_time_tick_remaining;
                            self.process_landed(&hit, remaining_time, iterations);
                            return;
                        }

                        self.handle_impact(&hit);
                        if !self.is_falling() {
                            return;
                        }

                        let gravity_up = -gravity_dir;
                        if has_limited_air_control && hit.normal.dot(gravity_up) > VERTICAL_SLOPE_NORMAL_Z {
                            let last_move_no_air_control = velocity_no_air_control * last_move_time_slice;
                            delta = self.compute_slide_vector(last_move_no_air_control, 1.0, old_hit_normal, &hit);
                        }

                        self.two_wall_adjust(&mut delta, &hit, old_hit_normal);

                        if has_limited_air_control {
                            let air_control_delta_v =
                                self.limit_air_control(air_control_accel, &hit, false) * sub_time_tick_remaining;
                            // Never back into the first wall.
                            if air_control_delta_v.dot(old_hit_normal) > 0.0 {
                                delta += air_control_delta_v * sub_time_tick_remaining;
                            }
                        }

                        if sub_time_tick_remaining > KINDA_SMALL_NUMBER && !self.agent.controller.just_teleported {
                            self.agent.controller.velocity = delta / sub_time_tick_remaining;
                        }

                        // Straddling two slopes, neither of them walkable.
                        let ditch = old_hit_impact_normal.dot(gravity_up) > 0.0
                            && hit.impact_normal.dot(gravity_up) > 0.0
                            && delta.dot(gravity_up).abs() <= KINDA_SMALL_NUMBER
                            && hit.impact_normal.dot(old_hit_impact_normal) < 0.0;

                        hit = self.safe_move(delta, rotation, true);
                        if hit.time == 0.0 {
                            // Stuck: try a side step.
                            let mut side_delta = plane_project(old_hit_normal + hit.impact_normal, gravity_dir)
                                .normalize_or_zero();
                            if side_delta.abs_diff_eq(Vec3::ZERO, KINDA_SMALL_NUMBER) {
                                side_delta = gravity_up.cross(old_hit_normal).normalize_or_zero();
                            }
                            hit = self.safe_move(side_delta, rotation, true);
                        }

                        let location = self.agent.location;
                        if ditch || self.is_valid_landing_spot(location, &hit) || hit.time == 0.0 {
                            self.process_landed(&hit, 0.0, iterations);
                            return;
                        } else if self.perch_radius_threshold() > 0.0
                            && hit.time == 1.0
                            && old_hit_impact_normal.dot(gravity_up) >= self.config.walkable_floor_z
                        {
                            // A virtual ditch within the perch radius.
                            let moved = self.agent.location - old_location;
                            let vertical_moved = moved.dot(gravity_up).abs();
                            let planar_moved_sq = plane_project(moved, gravity_dir).length_squared();
                            if vertical_moved <= 0.2 * time_tick && planar_moved_sq <= 4.0 * time_tick {
                                self.nudge_out_of_ditch(gravity_dir);
                                let delta = self.agent.controller.velocity * time_tick;
                                self.safe_move(delta, rotation, true);
                            }
                        }
                    }
                }
            }

            let velocity = self.agent.controller.velocity;
            if plane_project(velocity, gravity_dir).length_squared() <= KINDA_SMALL_NUMBER * 10.0 {
                self.agent.controller.velocity = gravity_dir * velocity.dot(gravity_dir);
            }
        }
    }

    /// Velocity after applying lateral `acceleration` for `time_tick`,
    /// keeping the part of `velocity` along gravity.
    fn lateral_velocity_after(
        &mut self,
        time_tick: f32,
        velocity: Vec3,
        acceleration: Vec3,
        max_decel: f32,
        gravity_dir: Vec3,
    ) -> Vec3 {
        let saved_acceleration = self.agent.controller.acceleration;
        self.agent.controller.acceleration = acceleration;
        self.agent.controller.velocity = plane_project(velocity, gravity_dir);
        self.calc_velocity(time_tick, self.config.falling_lateral_friction, false, max_decel);
        self.agent.controller.acceleration = saved_acceleration;
        plane_project(self.agent.controller.velocity, gravity_dir) + gravity_dir * velocity.dot(gravity_dir)
    }

    fn nudge_out_of_ditch(&mut self, gravity_dir: Vec3) {
        let max_speed = self.max_speed();
        let (a, b) = (
            self.agent.controller.next_random() - 0.5,
            self.agent.controller.next_random() - 0.5,
        );
        let basis = Quat::from_rotation_arc(Vec3::NEG_Y, gravity_dir);
        let nudge = basis * Vec3::new(a, 0.0, b) * (0.25 * max_speed);
        let up_speed = (self.config.jump_z_velocity * 0.25).max(1.0);
        let planar = plane_project(self.agent.controller.velocity + nudge, gravity_dir);
        self.agent.controller.velocity = planar - gravity_dir * up_speed;
    }

    /// Input acceleration available while falling, across gravity.
    pub fn falling_lateral_acceleration(&self, delta_time: f32) -> Vec3 {
        let gravity_dir = self.gravity_direction(true);
        let fall_acceleration = plane_project(self.agent.controller.acceleration, gravity_dir);
        if fall_acceleration.length_squared() > 0.0 {
            let air_control = self.air_control(delta_time, self.config.air_control, gravity_dir);
            return (fall_acceleration * air_control).clamp_length_max(self.max_acceleration());
        }
        fall_acceleration
    }

    /// Air control, boosted while lateral speed is low.
    fn air_control(&self, _delta_time: f32, air_control: f32, gravity_dir: Vec3) -> f32 {
        if air_control == 0.0 {
            return 0.0;
        }
        let threshold = self.config.air_control_boost_velocity_threshold;
        let lateral_speed_sq = plane_project(self.agent.controller.velocity, gravity_dir).length_squared();
        if self.config.air_control_boost_multiplier > 0.0 && lateral_speed_sq < threshold * threshold {
            (self.config.air_control_boost_multiplier * air_control).min(1.0)
        } else {
            air_control
        }
    }

    fn should_limit_air_control(&self, fall_acceleration: Vec3) -> bool {
        fall_acceleration.length_squared() > 0.0
    }

    /// Keep air control from pushing into walls, which could lift the
    /// character.
    pub fn limit_air_control(&mut self, fall_acceleration: Vec3, hit: &HitResult, check_landing_spot: bool) -> Vec3 {
        let gravity_dir = self.gravity_direction(true);
        let mut result = fall_acceleration;
        if hit.is_valid_blocking_hit() && hit.normal.dot(-gravity_dir) > VERTICAL_SLOPE_NORMAL_Z {
            if (!check_landing_spot || !self.is_valid_landing_spot(hit.location, hit))
                && fall_acceleration.dot(hit.normal) < 0.0
            {
                let planar_normal = plane_project(hit.normal, gravity_dir).normalize_or_zero();
                result = plane_project(fall_acceleration, planar_normal);
            }
        } else if hit.start_penetrating {
            // Only out of the penetration.
            return if result.dot(hit.normal) > 0.0 { result } else { Vec3::ZERO };
        }
        result
    }

    /// Apply gravity for `delta_time`, limiting the speed along gravity to
    /// the terminal velocity.
    pub fn new_fall_velocity(&self, initial_velocity: Vec3, gravity: Vec3, delta_time: f32) -> Vec3 {
        let mut result = initial_velocity;
        if delta_time > 0.0 {
            result += gravity * delta_time;

            let terminal_limit = self.terminal_velocity().abs();
            if result.length_squared() > terminal_limit * terminal_limit {
                let gravity_dir = gravity.normalize_or_zero();
                if result.dot(gravity_dir) > terminal_limit {
                    result = plane_project(result, gravity_dir) + gravity_dir * terminal_limit;
                }
            }
        }
        result
    }
}

/// Derived accelerations below this count as zero.
const SMALL_ACCEL: f32 = 1.0e-4;
