//! Walking along floors: ramps, steps, ledges and floor height.

use std::f32::consts::FRAC_PI_2;

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::HitResult;
use crate::detection::{
    is_within_edge_tolerance, FloorResult, StepDownResult, MAX_FLOOR_DIST, MAX_STEP_SIDE_Z, MIN_FLOOR_DIST,
    MIN_TICK_TIME,
};
use crate::events::MovementEvent;
use crate::math::{plane_project, KINDA_SMALL_NUMBER};
use crate::state::MovementMode;

/// Location, rotation and volume saved before a tentative move.
#[derive(Debug, Clone, Copy)]
struct SavedPlacement {
    location: Vec3,
    rotation: Quat,
    volume: Option<Entity>,
}

impl CharacterMover<'_> {
    fn save_placement(&self) -> SavedPlacement {
        SavedPlacement {
            location: self.agent.location,
            rotation: self.agent.rotation,
            volume: self.agent.controller.current_volume,
        }
    }

    fn restore_placement(&mut self, saved: SavedPlacement) {
        self.agent.location = saved.location;
        self.agent.rotation = saved.rotation;
        self.agent.controller.current_volume = saved.volume;
    }

    /// Walking physics.
    pub fn phys_walking(&mut self, delta_time: f32, mut iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }

        self.agent.controller.just_teleported = false;
        let mut checked_fall = false;
        let mut tried_ledge_move = false;
        let mut remaining_time = delta_time;

        while remaining_time >= MIN_TICK_TIME && iterations < self.tuning.max_simulation_iterations {
            iterations += 1;
            self.agent.controller.just_teleported = false;
            let time_tick = self.simulation_time_step(remaining_time, iterations);
            remaining_time -= time_tick;

            let old_base = self.agent.controller.movement_base;
            let previous_base_location = old_base
                .and_then(|b| self.env.bodies.transform(b))
                .map_or(Vec3::ZERO, |t| t.translation);
            let old_location = self.agent.location;
            let old_floor = self.agent.controller.floor;

            self.maintain_horizontal_ground_velocity();
            let old_velocity = self.agent.controller.velocity;
            let up = self.up();
            self.agent.controller.acceleration = plane_project(self.agent.controller.acceleration, up);

            self.calc_velocity(
                time_tick,
                self.config.ground_friction,
                false,
                self.max_braking_deceleration(),
            );

            let move_velocity = self.agent.controller.velocity;
            let delta = move_velocity * time_tick;
            let zero_delta = delta.abs_diff_eq(Vec3::ZERO, KINDA_SMALL_NUMBER);
            let mut step_down = StepDownResult::default();

            if zero_delta {
                remaining_time = 0.0;
            } else {
                self.move_along_floor(move_velocity, time_tick, Some(&mut step_down));

                if self.is_falling() {
                    // Stepped or was pushed off the ground mid-move.
                    let desired_dist = delta.length();
                    if desired_dist > KINDA_SMALL_NUMBER {
                        let actual_dist = plane_project(self.agent.location - old_location, self.up()).length();
                        remaining_time += time_tick * (1.0 - (actual_dist / desired_dist).min(1.0));
                    }
                    self.start_new_physics(remaining_time, iterations);
                    return;
                } else if self.is_swimming() {
                    self.start_swimming(old_location, old_velocity, time_tick, remaining_time, iterations);
                    return;
                }
            }

            self.agent.controller.floor = if step_down.computed_floor {
                step_down.floor
            } else {
                let location = self.agent.location;
                self.find_floor(location, None)
            };

            let check_ledges = !self.can_walk_off_ledges();
            if check_ledges && !self.agent.controller.floor.is_walkable_floor() {
                let new_delta = if tried_ledge_move {
                    Vec3::ZERO
                } else {
                    self.get_ledge_move(old_location, delta, -self.up())
                };

                if new_delta != Vec3::ZERO {
                    self.revert_move(old_location, old_base, previous_base_location, &old_floor, false);
                    tried_ledge_move = true;
                    self.agent.controller.velocity = new_delta / time_tick;
                    remaining_time += time_tick;
                    continue;
                }

                let must_jump = zero_delta || old_base.is_none();
                let floor_hit = self.agent.controller.floor.hit;
                if (must_jump || !checked_fall)
                    && self.check_fall(&old_floor, &floor_hit, delta, old_location, remaining_time, time_tick, iterations, must_jump)
                {
                    return;
                }

                self.revert_move(old_location, old_base, previous_base_location, &old_floor, true);
                break;
            }

            if self.agent.controller.floor.is_walkable_floor() {
                self.adjust_floor_height();
                let base = self.agent.controller.floor.hit.entity;
                self.set_base(base);
            } else if self.agent.controller.floor.hit.start_penetrating && remaining_time <= 0.0 {
                // The floor sweep started in penetration: pop out instead of
                // moving down.
                let mut hit = self.agent.controller.floor.hit;
                hit.trace_end = hit.trace_start + self.up() * MAX_FLOOR_DIST;
                let adjustment = self.penetration_adjustment(&hit);
                let rotation = self.agent.rotation;
                self.resolve_penetration(adjustment, &hit, rotation);
                self.agent.controller.force_next_floor_check = true;
            }

            if self.is_swimming() {
                let velocity = self.agent.controller.velocity;
                self.start_swimming(old_location, velocity, time_tick, remaining_time, iterations);
                return;
            }

            let floor = self.agent.controller.floor;
            if !floor.is_walkable_floor() && !floor.hit.start_penetrating {
                let must_jump = self.agent.controller.just_teleported || zero_delta || old_base.is_none();
                if (must_jump || !checked_fall)
                    && self.check_fall(&old_floor, &floor.hit, delta, old_location, remaining_time, time_tick, iterations, must_jump)
                {
                    return;
                }
                checked_fall = true;
            }

            if self.is_moving_on_ground() && !self.agent.controller.just_teleported && time_tick >= MIN_TICK_TIME {
                // Velocity reflects the actual move.
                self.agent.controller.velocity = (self.agent.location - old_location) / time_tick;
                self.maintain_horizontal_ground_velocity();
            }

            if self.agent.location == old_location {
                break;
            }
        }

        if self.is_moving_on_ground() {
            self.maintain_horizontal_ground_velocity();
        }
    }

    /// Walking constrained to the navigation surface below the capsule.
    ///
    /// The capsule is swept across the surface and then snapped onto it with
    /// a line trace. Losing the surface hands over to regular walking.
    pub fn phys_nav_walking(&mut self, delta_time: f32, iterations: u32) {
        if delta_time < MIN_TICK_TIME {
            return;
        }
        let _ = iterations;
        self.agent.controller.just_teleported = false;

        let up = self.up();
        self.agent.controller.acceleration = plane_project(self.agent.controller.acceleration, up);
        self.agent.controller.velocity = plane_project(self.agent.controller.velocity, up);
        self.calc_velocity(
            delta_time,
            self.config.ground_friction,
            false,
            self.max_braking_deceleration(),
        );

        let old_location = self.agent.location;
        let delta = plane_project(self.agent.controller.velocity, up) * delta_time;
        if delta != Vec3::ZERO {
            let rotation = self.agent.rotation;
            let mut hit = self.safe_move(delta, rotation, true);
            if hit.is_valid_blocking_hit() {
                self.handle_impact(&hit);
                self.slide_along_surface(delta, 1.0 - hit.time, hit.normal, &mut hit, true);
            }
        }

        let Some(surface) = self.project_to_nav_surface(self.agent.location) else {
            self.set_movement_mode(MovementMode::Walking);
            return;
        };
        let target = surface.impact_point + up * (self.agent.shape.half_height + (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5);
        let rotation = self.agent.rotation;
        self.move_updated(target - self.agent.location, rotation, false);
        let floor_dist = (self.agent.location - surface.impact_point).dot(up) - self.agent.shape.half_height;
        self.agent.controller.floor.set_from_sweep(surface, floor_dist, true);

        if !self.agent.controller.just_teleported {
            self.agent.controller.velocity = plane_project((self.agent.location - old_location) / delta_time, up);
        }
    }

    /// Surface below `location` within step range.
    fn project_to_nav_surface(&self, location: Vec3) -> Option<HitResult> {
        let up = self.up();
        let reach = self.config.max_step_height + MAX_FLOOR_DIST;
        let start = location + up * reach;
        let end = location - up * (self.agent.shape.half_height + reach);
        let hit = self.query.line_trace(start, end, Some(self.agent.entity));
        (hit.is_valid_blocking_hit() && self.is_walkable(&hit)).then_some(hit)
    }

    /// Move along the current floor, stepping up barriers and sliding along
    /// walls.
    pub fn move_along_floor(
        &mut self,
        velocity: Vec3,
        delta_time: f32,
        mut step_down: Option<&mut StepDownResult>,
    ) {
        if !self.agent.controller.floor.is_walkable_floor() {
            return;
        }

        let up = self.up();
        let delta = plane_project(velocity, up) * delta_time;
        let floor = self.agent.controller.floor;
        let mut ramp_vector = self.compute_ground_movement_delta(delta, &floor.hit, floor.line_trace);
        let rotation = self.agent.rotation;
        let mut hit = self.safe_move(ramp_vector, rotation, true);

        if hit.start_penetrating {
            // Deflect off the penetration instead of hitching.
            self.handle_impact(&hit);
            self.slide_along_surface(delta, 1.0, hit.normal, &mut hit, true);
            if hit.start_penetrating {
                warn!("{:?} stuck in geometry", self.agent.entity);
                self.notify(MovementEvent::StuckInGeometry { hit });
            }
            return;
        }

        if !hit.is_valid_blocking_hit() {
            return;
        }

        let mut percent_applied = hit.time;
        if hit.time > 0.0 && hit.normal.dot(up) > KINDA_SMALL_NUMBER && self.is_walkable(&hit) {
            // Another walkable ramp.
            let remaining = 1.0 - percent_applied;
            ramp_vector = self.compute_ground_movement_delta(delta * remaining, &hit, false);
            hit = self.safe_move(ramp_vector, rotation, true);
            percent_applied = (percent_applied + hit.time * remaining).clamp(0.0, 1.0);
        }

        if !hit.is_valid_blocking_hit() {
            return;
        }

        let on_own_base = hit.entity.is_some() && self.agent.controller.movement_base == hit.entity;
        if self.can_step_up(&hit) || on_own_base {
            let pre_step_location = self.agent.location;
            let stepped = self.step_up(-up, delta * (1.0 - percent_applied), &hit, step_down.as_deref_mut());
            if !stepped {
                self.handle_impact(&hit);
                self.slide_along_surface(delta, 1.0 - percent_applied, hit.normal, &mut hit, true);
            } else if !self.config.maintain_horizontal_ground_velocity {
                // Step height must not leak into the velocity.
                self.agent.controller.just_teleported = true;
                let step_time = (1.0 - percent_applied) * delta_time;
                if step_time >= KINDA_SMALL_NUMBER {
                    let velocity = (self.agent.location - pre_step_location) / step_time;
                    self.agent.controller.velocity = plane_project(velocity, up);
                }
            }
        } else if hit.entity.is_some() {
            self.handle_impact(&hit);
            self.slide_along_surface(delta, 1.0 - percent_applied, hit.normal, &mut hit, true);
        }
    }

    /// Turn a planar move into a move along the ramp `ramp_hit`.
    ///
    /// The move is projected along the capsule up axis, so its planar part is
    /// kept. Unless ground velocity is kept horizontal, the result is
    /// rescaled to the length of `delta`.
    pub fn compute_ground_movement_delta(&self, delta: Vec3, ramp_hit: &HitResult, hit_from_line_trace: bool) -> Vec3 {
        let floor_normal = ramp_hit.impact_normal;
        let up = self.up();
        let floor_up = floor_normal.dot(up);
        let contact_up = ramp_hit.normal.dot(up);

        if floor_up < 1.0 - KINDA_SMALL_NUMBER
            && floor_up > KINDA_SMALL_NUMBER
            && contact_up > KINDA_SMALL_NUMBER
            && !hit_from_line_trace
            && self.is_walkable(ramp_hit)
        {
            let ramp = delta - up * (floor_normal.dot(delta) / floor_up);
            if self.config.maintain_horizontal_ground_velocity {
                return ramp;
            }
            return ramp.normalize_or_zero() * delta.length();
        }
        delta
    }

    /// Remove the velocity component along the capsule up axis, optionally
    /// keeping the speed.
    pub fn maintain_horizontal_ground_velocity(&mut self) {
        let up = self.up();
        let velocity = self.agent.controller.velocity;
        self.agent.controller.velocity = if self.config.maintain_horizontal_ground_velocity {
            plane_project(velocity, up)
        } else {
            plane_project(velocity, up).normalize_or_zero() * velocity.length()
        };
    }

    /// Keep the capsule between [`MIN_FLOOR_DIST`] and [`MAX_FLOOR_DIST`]
    /// above a walkable floor.
    pub fn adjust_floor_height(&mut self) {
        let floor = self.agent.controller.floor;
        if !floor.is_walkable_floor() {
            return;
        }

        let mut old_floor_dist = floor.floor_dist;
        if floor.line_trace {
            if old_floor_dist < MIN_FLOOR_DIST && floor.line_dist >= MIN_FLOOR_DIST {
                // Climbing here would scale unwalkable walls.
                trace!("floor height adjustment aborted by line trace");
                return;
            }
            old_floor_dist = floor.line_dist;
        }

        if !(MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&old_floor_dist) {
            let avg_floor_dist = (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5;
            let move_dist = avg_floor_dist - old_floor_dist;
            let up = self.up();
            let initial_location = self.agent.location;
            let rotation = self.agent.rotation;

            let hit = self.safe_move(up * move_dist, rotation, true);
            trace!("adjust floor height {} (hit {})", move_dist, hit.blocking_hit);

            if !hit.is_valid_blocking_hit() {
                self.agent.controller.floor.floor_dist += move_dist;
            } else if move_dist > 0.0 {
                self.agent.controller.floor.floor_dist += (initial_location - self.agent.location).dot(up);
            } else {
                let floor_dist = (hit.location - self.agent.location).dot(up);
                self.agent.controller.floor.floor_dist = floor_dist;
                if self.is_walkable(&hit) {
                    self.agent.controller.floor.set_from_sweep(hit, floor_dist, true);
                }
            }

            self.agent.controller.just_teleported |=
                !self.config.maintain_horizontal_ground_velocity || old_floor_dist < 0.0;
            self.agent.controller.force_next_floor_check = true;
        }
    }

    pub fn can_walk_off_ledges(&self) -> bool {
        if !self.config.can_walk_off_ledges_when_crouching && self.agent.controller.is_crouched {
            return false;
        }
        self.config.can_walk_off_ledges
    }

    /// Whether the hit can be stepped onto. Other characters cannot.
    pub fn can_step_up(&self, hit: &HitResult) -> bool {
        if !hit.is_valid_blocking_hit() || self.is_falling() {
            return false;
        }
        !hit.entity.is_some_and(|e| self.env.bodies.is_character(e))
    }

    /// Climb the barrier `hit` while moving by `delta`.
    ///
    /// Moves up by the step height, forward, then back down. Any failed
    /// stage restores the starting placement and returns `false`.
    pub fn step_up(
        &mut self,
        gravity_dir: Vec3,
        delta: Vec3,
        hit: &HitResult,
        step_down: Option<&mut StepDownResult>,
    ) -> bool {
        if !self.can_step_up(hit) || self.config.max_step_height <= 0.0 {
            return false;
        }

        let saved = self.save_placement();
        let old_location = self.agent.location;
        let radius = self.agent.shape.radius;
        let half_height = self.agent.shape.half_height;
        let capsule_down = -self.up();
        let max_step_height = self.config.max_step_height;

        let bottom = old_location + capsule_down * half_height;
        let top = old_location - capsule_down * (half_height - radius).max(0.0);
        let segment = top - bottom;

        // The top of the capsule hit something.
        if (hit.impact_point - bottom).dot(segment) / segment.length_squared() > 1.0 {
            return false;
        }

        let mut step_travel_up = max_step_height;
        let mut step_travel_down = step_travel_up;
        let step_side_z = -hit.impact_normal.dot(gravity_dir);
        let mut initial_floor_base = old_location + capsule_down * half_height;
        let mut floor_point = initial_floor_base;

        let floor = self.agent.controller.floor;
        if self.is_moving_on_ground() && floor.is_walkable_floor() {
            // The capsule hovers above the floor; measure from the contact.
            let floor_dist = floor.distance_to_floor().max(0.0);
            initial_floor_base += capsule_down * floor_dist;
            step_travel_up = (step_travel_up - floor_dist).max(0.0);
            step_travel_down = max_step_height + MAX_FLOOR_DIST * 2.0;

            let hit_vertical_face = !is_within_edge_tolerance(hit.location, capsule_down, radius, hit.impact_point);
            if !floor.line_trace && !hit_vertical_face {
                floor_point = floor.hit.impact_point;
            } else {
                floor_point += capsule_down * floor.floor_dist;
            }
        }

        // Impact below the floor contact.
        if (hit.impact_point - initial_floor_base).dot(top - initial_floor_base) <= 0.0 {
            return false;
        }

        let rotation = self.agent.rotation;

        let sweep_up = self.move_updated(gravity_dir * -step_travel_up, rotation, true);
        if sweep_up.start_penetrating {
            self.restore_placement(saved);
            return false;
        }

        let mut forward = self.move_updated(delta, rotation, true);
        if forward.blocking_hit {
            if forward.start_penetrating {
                self.restore_placement(saved);
                return false;
            }

            if sweep_up.blocking_hit {
                self.handle_impact(&sweep_up);
            }
            self.handle_impact(&forward);

            let forward_time = forward.time;
            let slide_amount = self.slide_along_surface(delta, 1.0 - forward.time, forward.normal, &mut forward, true);
            if self.is_falling() || (forward_time == 0.0 && slide_amount == 0.0) {
                self.restore_placement(saved);
                return false;
            }
        }

        let down = self.move_updated(gravity_dir * step_travel_down, rotation, true);
        if down.start_penetrating {
            self.restore_placement(saved);
            return false;
        }

        let mut result = StepDownResult::default();
        if down.is_valid_blocking_hit() {
            let delta_z = (floor_point - down.impact_point).dot(capsule_down);
            if delta_z > max_step_height {
                trace!("step up rejected: {} too high", delta_z);
                self.restore_placement(saved);
                return false;
            }

            if !self.is_walkable(&down) {
                let normal_towards_me = delta.dot(down.impact_normal) < 0.0;
                let ends_higher = (old_location - down.location).dot(capsule_down) > 0.0;
                if normal_towards_me || ends_higher {
                    self.restore_placement(saved);
                    return false;
                }
            }

            if !is_within_edge_tolerance(down.location, capsule_down, radius, down.impact_point) {
                self.restore_placement(saved);
                return false;
            }

            if delta_z > 0.0 && !self.can_step_up(&down) {
                self.restore_placement(saved);
                return false;
            }

            if step_down.is_some() {
                let location = self.agent.location;
                result.floor = self.find_floor(location, Some(&down));

                // Stepping up a real step requires a floor to perch on.
                if (old_location - down.location).dot(capsule_down) > 0.0
                    && !result.floor.blocking_hit
                    && step_side_z < MAX_STEP_SIDE_Z
                {
                    self.restore_placement(saved);
                    return false;
                }
                result.computed_floor = true;
            }
        }

        if let Some(out) = step_down {
            *out = result;
        }
        self.agent.controller.just_teleported |= !self.config.maintain_horizontal_ground_velocity;
        true
    }

    /// Whether a side step from `old_location` leads to a walkable floor.
    pub fn check_ledge_direction(&self, old_location: Vec3, side_step: Vec3, gravity_dir: Vec3) -> bool {
        let side_dest = old_location + side_step;
        let rotation = self.agent.rotation;
        let shape = self.agent.shape;
        let ignore = Some(self.agent.entity);

        let mut result = self.query.sweep_capsule(old_location, side_dest, rotation, shape, ignore);
        if !result.blocking_hit || self.is_walkable(&result) {
            if !result.blocking_hit {
                let down = side_dest + gravity_dir * (self.config.max_step_height + self.config.ledge_check_threshold);
                result = self.query.sweep_capsule(side_dest, down, rotation, shape, ignore);
            }
            if result.time < 1.0 && self.is_walkable(&result) {
                return true;
            }
        }
        false
    }

    /// Sideways move that keeps the character on a floor, or zero.
    pub fn get_ledge_move(&self, old_location: Vec3, delta: Vec3, gravity_dir: Vec3) -> Vec3 {
        if delta == Vec3::ZERO {
            return Vec3::ZERO;
        }

        let side = Quat::from_axis_angle(gravity_dir, FRAC_PI_2) * plane_project(delta, gravity_dir);
        if self.check_ledge_direction(old_location, side, gravity_dir) {
            return side;
        }
        let side = -side;
        if self.check_ledge_direction(old_location, side, gravity_dir) {
            return side;
        }
        Vec3::ZERO
    }

    /// Start falling with the time left in this tick.
    pub fn start_falling(
        &mut self,
        iterations: u32,
        mut remaining_time: f32,
        time_tick: f32,
        delta: Vec3,
        sub_location: Vec3,
    ) {
        let desired_dist = delta.length();
        if desired_dist < KINDA_SMALL_NUMBER {
            remaining_time = 0.0;
        } else {
            let actual_dist = (self.agent.location - sub_location).length();
            remaining_time += time_tick * (1.0 - (actual_dist / desired_dist).min(1.0));
        }

        if self.is_moving_on_ground() {
            self.set_movement_mode(MovementMode::Falling);
        }
        self.start_new_physics(remaining_time, iterations);
    }

    /// Walk off the ledge if allowed. Returns `true` when falling took over
    /// the rest of the tick.
    #[allow(clippy::too_many_arguments)]
    pub fn check_fall(
        &mut self,
        old_floor: &FloorResult,
        _hit: &HitResult,
        delta: Vec3,
        old_location: Vec3,
        remaining_time: f32,
        time_tick: f32,
        iterations: u32,
        must_jump: bool,
    ) -> bool {
        if must_jump || self.can_walk_off_ledges() {
            self.handle_walking_off_ledge(old_floor.hit.impact_normal, old_location);
            if self.is_moving_on_ground() {
                self.start_falling(iterations, remaining_time, time_tick, delta, old_location);
            }
            return true;
        }
        false
    }

    fn handle_walking_off_ledge(&mut self, previous_floor_normal: Vec3, previous_location: Vec3) {
        self.notify(MovementEvent::WalkedOffLedge {
            previous_floor_normal,
            previous_location,
        });
    }

    /// Undo a move. A base that cannot have moved is restored with its floor.
    pub fn revert_move(
        &mut self,
        old_location: Vec3,
        old_base: Option<Entity>,
        previous_base_location: Vec3,
        old_floor: &FloorResult,
        fail_move: bool,
    ) {
        let delta = old_location - self.agent.location;
        let rotation = self.agent.rotation;
        self.move_updated(delta, rotation, false);
        self.agent.controller.just_teleported = false;

        let base_unchanged = old_base.is_some_and(|base| {
            !self.env.bodies.is_movable(base)
                || self
                    .env
                    .bodies
                    .transform(base)
                    .is_some_and(|t| t.translation == previous_base_location)
        });
        if base_unchanged {
            self.agent.controller.floor = *old_floor;
            self.set_base(old_base);
        } else {
            self.set_base(None);
        }

        if fail_move {
            self.agent.controller.velocity = Vec3::ZERO;
            self.agent.controller.acceleration = Vec3::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_hit(normal: Vec3) -> HitResult {
        HitResult {
            blocking_hit: true,
            time: 0.5,
            normal,
            impact_normal: normal,
            ..HitResult::miss(Vec3::ZERO, -Vec3::Y)
        }
    }

    // ==================== Ground Delta Tests ====================

    #[test]
    fn ramp_delta_keeps_planar_part() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mover = fixture.mover(&mut agent);
        let normal = Vec3::new(-0.5, 1.0, 0.0).normalize();
        let delta = mover.compute_ground_movement_delta(Vec3::X * 10.0, &ramp_hit(normal), false);

        assert_relative_eq!(delta.x, 10.0, epsilon = 1e-4);
        assert_relative_eq!(delta.y, 5.0, epsilon = 1e-4);
        assert!(delta.dot(normal).abs() < 1e-4);
    }

    #[test]
    fn ramp_delta_keeps_speed_when_not_horizontal() {
        let fixture = Fixture::flat().with_config(|c| c.maintain_horizontal_ground_velocity = false);
        let mut agent = fixture.walking_agent();
        let mover = fixture.mover(&mut agent);
        let normal = Vec3::new(-0.5, 1.0, 0.0).normalize();
        let delta = mover.compute_ground_movement_delta(Vec3::X * 10.0, &ramp_hit(normal), false);
        assert_relative_eq!(delta.length(), 10.0, epsilon = 1e-4);
        assert!(delta.y > 0.0);
    }

    #[test]
    fn line_trace_floor_is_not_projected() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mover = fixture.mover(&mut agent);
        let normal = Vec3::new(-0.5, 1.0, 0.0).normalize();
        let delta = mover.compute_ground_movement_delta(Vec3::X * 10.0, &ramp_hit(normal), true);
        assert_eq!(delta, Vec3::X * 10.0);
    }

    // ==================== Floor Height Tests ====================

    #[test]
    fn floor_height_is_pulled_into_band() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.location.y += 1.5;
        let mut mover = fixture.mover(&mut agent);
        let location = mover.agent.location;
        mover.agent.controller.floor = mover.find_floor(location, None);
        mover.adjust_floor_height();

        let floor_dist = mover.agent.location.y - 88.0;
        assert!((MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&floor_dist), "floor dist {floor_dist}");
        assert!(mover.agent.controller.force_next_floor_check);
    }

    #[test]
    fn horizontal_velocity_drops_vertical() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::new(3.0, 4.0, 0.0);
        let mut mover = fixture.mover(&mut agent);
        mover.maintain_horizontal_ground_velocity();
        assert_eq!(mover.agent.controller.velocity, Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn horizontal_velocity_can_keep_speed() {
        let fixture = Fixture::flat().with_config(|c| c.maintain_horizontal_ground_velocity = false);
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::new(3.0, 4.0, 0.0);
        let mut mover = fixture.mover(&mut agent);
        mover.maintain_horizontal_ground_velocity();
        assert_relative_eq!(mover.agent.controller.velocity.x, 5.0, epsilon = 1e-5);
    }

    // ==================== Walking Tests ====================

    #[test]
    fn walking_moves_at_speed() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::X * 600.0;
        agent.controller.acceleration = Vec3::X * 2048.0;
        let mut mover = fixture.mover(&mut agent);
        mover.phys_walking(0.1, 0);

        assert_eq!(mover.movement_mode(), MovementMode::Walking);
        assert_relative_eq!(mover.agent.location.x, 60.0, epsilon = 0.5);
    }

    #[test]
    fn step_up_climbs_low_step() {
        let fixture = Fixture::flat().with_scene(|scene, entities| {
            scene.with_box(entities[0], Vec3::new(250.0, 10.0, 0.0), Quat::IDENTITY, Vec3::new(200.0, 10.0, 500.0))
        });
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::X * 600.0;
        agent.controller.acceleration = Vec3::X * 2048.0;

        for _ in 0..30 {
            fixture.mover(&mut agent).phys_walking(1.0 / 60.0, 0);
        }
        assert_eq!(agent.controller.movement_mode(), MovementMode::Walking);
        assert!(agent.location.y > 88.0 + 15.0, "y = {}", agent.location.y);
    }

    #[test]
    fn wall_taller_than_step_blocks() {
        let fixture = Fixture::flat().with_scene(|scene, entities| {
            scene.with_box(entities[0], Vec3::new(100.0, 50.0, 0.0), Quat::IDENTITY, Vec3::new(50.0, 50.0, 500.0))
        });
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::X * 600.0;
        agent.controller.acceleration = Vec3::X * 2048.0;

        for _ in 0..30 {
            fixture.mover(&mut agent).phys_walking(1.0 / 60.0, 0);
        }
        assert!(agent.location.x < 50.0 - 34.0 + 1.0, "x = {}", agent.location.x);
        assert!(agent.location.y < 88.0 + MAX_FLOOR_DIST + 1.0);
    }

    #[test]
    fn walking_off_ledge_starts_falling() {
        let fixture = Fixture::empty().with_scene(|scene, entities| {
            scene.with_box(entities[0], Vec3::new(0.0, -10.0, 0.0), Quat::IDENTITY, Vec3::new(100.0, 10.0, 100.0))
        });
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::X * 600.0;
        agent.controller.acceleration = Vec3::X * 2048.0;
        agent.events.clear();

        for _ in 0..30 {
            fixture.mover(&mut agent).phys_walking(1.0 / 60.0, 0);
            if agent.controller.is_falling() {
                break;
            }
        }
        assert_eq!(agent.controller.movement_mode(), MovementMode::Falling);
        assert_eq!(agent.events.count(|e| matches!(e, MovementEvent::WalkedOffLedge { .. })), 1);
    }

    #[test]
    fn ledge_check_keeps_character_on_platform() {
        let fixture = Fixture::empty()
            .with_config(|c| c.can_walk_off_ledges = false)
            .with_scene(|scene, entities| {
                scene.with_box(entities[0], Vec3::new(0.0, -10.0, 0.0), Quat::IDENTITY, Vec3::new(100.0, 10.0, 100.0))
            });
        let mut agent = fixture.walking_agent();

        for _ in 0..60 {
            agent.controller.acceleration = Vec3::X * 2048.0;
            fixture.mover(&mut agent).phys_walking(1.0 / 60.0, 0);
        }
        assert_eq!(agent.controller.movement_mode(), MovementMode::Walking);
        assert!(agent.location.x < 100.0 + 34.0);
    }
}
