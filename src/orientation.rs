//! Capsule orientation.
//!
//! The capsule up axis follows either the opposite of gravity or the floor
//! normal, depending on [`OrientationConfig`](crate::config::OrientationConfig).
//! Rotations are applied without sweeping; when rotating around the capsule
//! center a short sphere sweep keeps the capsule out of the floor, otherwise
//! the bottom hemisphere stays planted.

use bevy::prelude::*;

use crate::events::MovementEvent;
use crate::gravity::GravityMode;
use crate::math::{find_between_normals, make_from_up_quat, plane_project, up_axis, KINDA_SMALL_NUMBER};
use crate::movement::CharacterMover;
use crate::state::MovementMode;

/// Below this angle, in radians, two rotations count as equal.
const ROTATION_TOLERANCE: f32 = 1.0e-3;

impl CharacterMover<'_> {
    /// Up axis the capsule should have right now.
    ///
    /// The floor normal when aligning to the floor while grounded, otherwise
    /// the opposite of gravity when aligning to gravity, otherwise the
    /// current up axis. Axes within the parallel tolerance of world up snap
    /// to exactly world up.
    pub fn desired_up_axis(&self) -> Vec3 {
        let floor_normal = self.agent.controller.floor.hit.impact_normal;
        let desired = if self.orientation.align_component_to_floor
            && self.is_moving_on_ground()
            && floor_normal != Vec3::ZERO
        {
            floor_normal
        } else if self.orientation.align_component_to_gravity {
            -self.gravity_direction(true)
        } else {
            self.up()
        };

        if desired.y == 1.0 || self.thresholds().coincident(desired, Vec3::Y) {
            Vec3::Y
        } else {
            desired
        }
    }

    /// Rotate the capsule so its up axis becomes `desired_up`.
    ///
    /// Returns `false` without moving when the axes are already within the
    /// parallel tolerance. With `around_center` unset the capsule turns around
    /// its bottom hemisphere. With `rotate_velocity` set, velocity is turned
    /// by the same arc so no speed is lost.
    pub fn update_component_rotation(&mut self, desired_up: Vec3, around_center: bool, rotate_velocity: bool) -> bool {
        let rotation = self.agent.rotation;
        let current_up = up_axis(rotation);
        let desired_up = desired_up.normalize_or_zero();
        if desired_up == Vec3::ZERO || self.thresholds().coincident(desired_up, current_up) {
            return false;
        }

        let shape = self.agent.shape;
        let sphere_height = shape.segment_half_length();
        let mut delta = Vec3::ZERO;
        if sphere_height > 0.0 {
            if around_center {
                // Slide the capsule away from whatever the new bottom would sink into.
                let start = self.agent.location;
                let end = start - desired_up * sphere_height;
                let hit = self.query.sweep_sphere(start, end, shape.radius, Some(self.agent.entity));
                if hit.blocking_hit {
                    delta = desired_up * (sphere_height * (1.0 - hit.time));
                }
            } else {
                delta = (desired_up - current_up) * sphere_height;
            }
        }

        let thresholds = *self.thresholds();
        let new_rotation = make_from_up_quat(desired_up, rotation, &thresholds);
        self.safe_move(delta, new_rotation, false);

        let velocity = self.agent.controller.velocity;
        if rotate_velocity && velocity != Vec3::ZERO {
            self.agent.controller.velocity = find_between_normals(current_up, desired_up) * velocity;
        }

        let new_up = up_axis(new_rotation);
        trace!("{:?} up axis {:?} -> {:?}", self.agent.entity, current_up, new_up);
        self.notify(MovementEvent::OrientationChanged {
            old_up: current_up,
            new_up,
        });
        true
    }

    /// Rotate the capsule to `new_up` around its center and refresh the
    /// floor.
    ///
    /// A grounded character without a walkable floor afterwards starts
    /// falling; an airborne one that ends up on a walkable floor lands on it.
    /// `force_find_floor` queries the floor even in the air and accepts any
    /// surface walkable relative to the capsule.
    pub fn set_component_up(&mut self, new_up: Vec3, force_find_floor: bool) -> bool {
        let on_ground = self.is_moving_on_ground();
        let rotate_velocity = self.orientation.rotate_velocity_on_ground && on_ground;
        let rotated = self.update_component_rotation(new_up, true, rotate_velocity);
        if !rotated || !(force_find_floor || on_ground) {
            return rotated;
        }

        let saved = self.land_on_any_surface;
        self.land_on_any_surface = saved || force_find_floor;
        let location = self.agent.location;
        self.agent.controller.floor = self.find_floor(location, None);
        self.land_on_any_surface = saved;

        if !self.agent.controller.floor.is_walkable_floor() {
            if on_ground {
                self.set_movement_mode(MovementMode::Falling);
            }
        } else {
            self.adjust_floor_height();
            self.set_base_from_floor();
            if !on_ground {
                let hit = self.agent.controller.floor.hit;
                self.notify(MovementEvent::Landed { hit });
                self.set_post_landed_physics(&hit);
            }
        }
        rotated
    }

    /// `rotation` with its up axis replaced by the capsule's, keeping its
    /// forward direction as far as possible.
    pub fn constrain_rotation(&self, rotation: Quat) -> Quat {
        let current = self.agent.rotation;
        if current.angle_between(rotation) < ROTATION_TOLERANCE {
            return current;
        }
        let up = self.up();
        if up == Vec3::Y {
            // Keep the yaw only.
            let (yaw, _, _) = rotation.to_euler(EulerRot::YXZ);
            return Quat::from_rotation_y(yaw);
        }
        make_from_up_quat(up, rotation, self.thresholds())
    }

    /// Turn the capsule about its up axis towards the acceleration, at most
    /// `rotation_rate` degrees per second.
    pub fn physics_rotation(&mut self, delta_time: f32) {
        if !self.orientation.orient_rotation_to_movement {
            return;
        }

        let up = self.up();
        let direction = plane_project(self.agent.controller.acceleration, up);
        if direction.length_squared() < KINDA_SMALL_NUMBER {
            return;
        }

        let current = self.agent.rotation;
        let target = Transform::IDENTITY.looking_to(direction, up).rotation;
        let desired = self.constrain_rotation(target);
        let angle = current.angle_between(desired);
        if angle < ROTATION_TOLERANCE {
            return;
        }

        let rate = self.orientation.rotation_rate;
        let new_rotation = if rate < 0.0 {
            desired
        } else {
            let alpha = (rate.to_radians() * delta_time / angle).min(1.0);
            current.slerp(desired, alpha).normalize()
        };
        self.move_updated(Vec3::ZERO, new_rotation, false);
    }

    /// Point gravity at the base the character stands on.
    fn update_gravity_from_base(&mut self) {
        if !self.orientation.align_gravity_to_base || !self.is_moving_on_ground() {
            return;
        }

        let floor = self.agent.controller.floor.hit;
        let gravity = &mut self.agent.gravity;
        let changed = match (gravity.mode(), floor.entity) {
            (GravityMode::Fixed, _) if floor.impact_normal != Vec3::ZERO => {
                gravity.set_fixed_direction(-floor.impact_normal)
            }
            (GravityMode::Point, Some(base)) => gravity.set_point_direction_from_source(base),
            (GravityMode::Box, Some(base)) => gravity.set_box_direction_from_source(base),
            (GravityMode::Collision, Some(base)) => gravity.set_collision_direction(base),
            _ => false,
        };
        if changed {
            self.refresh_gravity();
        }
    }

    /// Bring gravity and the capsule up axis in line after a move.
    pub fn on_movement_updated(&mut self, _delta_time: f32, _old_location: Vec3, _old_velocity: Vec3) {
        self.update_gravity_from_base();

        let on_ground = self.is_moving_on_ground();
        let desired_up = self.desired_up_axis();
        self.update_component_rotation(
            desired_up,
            self.orientation.always_rotate_around_center || !on_ground,
            self.orientation.rotate_velocity_on_ground && on_ground,
        );
    }
}
