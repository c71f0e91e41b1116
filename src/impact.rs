//! Physical interaction with simulated bodies.
//!
//! The movement step only decides what to push and how hard. Pushes are
//! queued on the agent as [`PhysicsImpulse`] values and handed to the
//! physics backend once the step is over.

use bevy::prelude::*;

use crate::math::{closest_point_on_segment, plane_project, project_point_on_plane, KINDA_SMALL_NUMBER};
use crate::movement::CharacterMover;

/// Distance below which a body next to the capsule is stopped instead of
/// pushed away.
const STOP_BODY_DISTANCE: f32 = 2.5;

/// Repulsion reaches this multiple of the capsule radius.
const REPULSION_RADIUS_FACTOR: f32 = 1.2;

/// Extra radius used to detect bodies touching the capsule.
const TOUCH_INFLATION: f32 = 1.0;

/// A push for another body, applied by the backend after the step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhysicsImpulse {
    /// Impulse applied at a world point.
    ImpulseAt { entity: Entity, impulse: Vec3, point: Vec3 },
    /// Impulse through the center of mass.
    Impulse { entity: Entity, impulse: Vec3 },
    /// Force applied at a world point for one physics step.
    ForceAt { entity: Entity, force: Vec3, point: Vec3 },
    /// Overwrite the linear velocity.
    SetLinearVelocity { entity: Entity, velocity: Vec3 },
}

impl PhysicsImpulse {
    /// Body the push is for.
    pub fn entity(&self) -> Entity {
        match *self {
            Self::ImpulseAt { entity, .. }
            | Self::Impulse { entity, .. }
            | Self::ForceAt { entity, .. }
            | Self::SetLinearVelocity { entity, .. } => entity,
        }
    }
}

impl CharacterMover<'_> {
    fn queue_impulse(&mut self, impulse: PhysicsImpulse) {
        trace!("{:?} queues {:?}", self.agent.entity, impulse);
        self.agent.impulses.push(impulse);
    }

    /// Push a simulated body that blocked the capsule.
    ///
    /// Resting bodies get an impulse, moving ones a force, both along the
    /// reversed impact normal.
    pub fn apply_impact_physics_forces(&mut self, hit: &crate::collision::HitResult, acceleration: Vec3, velocity: Vec3) {
        if !self.interaction.enable_physics_interaction || !hit.blocking_hit {
            return;
        }
        let Some(entity) = hit.entity else {
            return;
        };
        let bodies = self.env.bodies;
        if !bodies.is_simulating(entity) {
            return;
        }

        let interaction = *self.interaction;
        let mut point = hit.impact_point;
        if interaction.push_force_using_z_offset {
            if let (Some(transform), Some(extents)) = (bodies.transform(entity), bodies.half_extents(entity)) {
                if extents != Vec3::ZERO {
                    let up = self.up();
                    point = project_point_on_plane(point, transform.translation, up)
                        + up * (extents.dot(up).abs() * interaction.push_force_point_z_offset_factor);
                }
            }
        }

        let body_velocity = bodies.linear_velocity(entity);
        let resting = body_velocity.length_squared() <= KINDA_SMALL_NUMBER;
        let virtual_velocity = if acceleration == Vec3::ZERO {
            velocity
        } else {
            acceleration.normalize_or_zero() * self.max_speed()
        };

        let mut modifier = 1.0;
        if interaction.scale_push_force_to_velocity && !resting {
            let dot = body_velocity.dot(virtual_velocity);
            if dot > 0.0 && dot < 1.0 {
                modifier *= dot;
            }
        }
        if interaction.push_force_scaled_to_mass {
            modifier *= bodies.mass(entity).max(1.0);
        }

        let push = -hit.impact_normal * modifier;
        if resting {
            self.queue_impulse(PhysicsImpulse::ImpulseAt {
                entity,
                impulse: push * interaction.initial_push_force_factor,
                point,
            });
        } else {
            self.queue_impulse(PhysicsImpulse::ForceAt {
                entity,
                force: push * interaction.push_force_factor,
                point,
            });
        }
    }

    /// Knock a simulated body that started touching the capsule.
    pub fn capsule_touched(&mut self, other: Entity) {
        if !self.interaction.enable_physics_interaction {
            return;
        }
        let bodies = self.env.bodies;
        if !bodies.is_simulating(other) {
            return;
        }
        let Some(transform) = bodies.transform(other) else {
            return;
        };

        let up = self.up();
        let planar_velocity = plane_project(self.agent.controller.velocity, up);
        let toward = plane_project(transform.translation - self.agent.location, up) + up * 0.25;
        let direction = ((toward.normalize_or_zero() + planar_velocity.normalize_or_zero()) * 0.5).normalize_or_zero();

        let interaction = *self.interaction;
        let mut factor = interaction.touch_force_factor;
        if interaction.touch_force_scaled_to_mass {
            factor *= bodies.mass(other);
        }
        let min = if interaction.min_touch_force > 0.0 {
            interaction.min_touch_force
        } else {
            f32::MIN
        };
        let max = if interaction.max_touch_force > 0.0 {
            interaction.max_touch_force
        } else {
            f32::MAX
        };
        let strength = (planar_velocity.length() * factor).clamp(min, max);

        self.queue_impulse(PhysicsImpulse::Impulse {
            entity: other,
            impulse: direction * strength,
        });
    }

    /// Call [`capsule_touched`](Self::capsule_touched) for bodies that began
    /// touching the capsule since the previous step.
    pub fn update_touching_bodies(&mut self) {
        let shape = crate::collision::CapsuleShape::new(
            self.agent.shape.radius + TOUCH_INFLATION,
            self.agent.shape.half_height + TOUCH_INFLATION,
        );
        let touching = self.query.overlapping_entities(
            self.agent.location,
            self.agent.rotation,
            shape,
            Some(self.agent.entity),
        );
        let previous = std::mem::take(&mut self.agent.controller.touching);
        for &entity in touching.iter().filter(|e| !previous.contains(e)) {
            self.capsule_touched(entity);
        }
        self.agent.controller.touching = touching;
    }

    /// Put the character's weight on a simulated floor.
    pub fn apply_downward_force(&mut self, _delta_time: f32) {
        let scale = self.interaction.standing_downward_force_scale;
        let floor = self.agent.controller.floor.hit;
        if scale == 0.0 || !floor.is_valid_blocking_hit() {
            return;
        }
        let Some(base) = floor.entity else {
            return;
        };
        let gravity = self.gravity();
        if !self.env.bodies.is_simulating(base) || gravity == Vec3::ZERO {
            return;
        }

        self.queue_impulse(PhysicsImpulse::ForceAt {
            entity: base,
            force: gravity * self.config.mass * scale,
            point: floor.impact_point,
        });
    }

    /// Push simulated bodies out of the capsule. Bodies resting right
    /// against its surface are stopped instead.
    pub fn apply_repulsion_force(&mut self, delta_time: f32) {
        let repulsion = self.interaction.repulsion_force;
        if repulsion <= 0.0 {
            return;
        }
        let overlaps = self.query.overlapping_entities(
            self.agent.location,
            self.agent.rotation,
            self.agent.shape,
            Some(self.agent.entity),
        );
        if overlaps.is_empty() {
            return;
        }

        let bodies = self.env.bodies;
        let shape = self.agent.shape;
        let location = self.agent.location;
        let capsule_down = -self.up();
        let (bottom, top) = shape.segment(location, self.agent.rotation);
        let repulsion_radius = shape.radius * REPULSION_RADIUS_FACTOR;
        let strength = repulsion * self.config.mass;

        for entity in overlaps {
            if !bodies.is_simulating(entity) {
                continue;
            }
            let Some(transform) = bodies.transform(entity) else {
                continue;
            };
            let body_location = transform.translation;
            let body_velocity = bodies.linear_velocity(entity);

            // Surface point of the capsule facing the body.
            let axis_point = closest_point_on_segment(bottom, top, body_location);
            let offset = body_location - axis_point;
            let inside = offset.length() <= shape.radius;
            let hit_location = if inside {
                body_location
            } else {
                axis_point + offset.normalize_or_zero() * shape.radius
            };

            let distance_now = plane_project(hit_location - body_location, capsule_down).length_squared();
            let distance_later =
                plane_project(hit_location - (body_location + body_velocity * delta_time), capsule_down).length_squared();

            if !inside && distance_now < STOP_BODY_DISTANCE {
                self.queue_impulse(PhysicsImpulse::SetLinearVelocity {
                    entity,
                    velocity: Vec3::ZERO,
                });
            } else if distance_later <= distance_now || inside {
                let force_center = if inside {
                    axis_point
                } else {
                    location + capsule_down * (hit_location - location).dot(capsule_down)
                };
                let away = body_location - force_center;
                if away.length() > repulsion_radius {
                    continue;
                }
                self.queue_impulse(PhysicsImpulse::ForceAt {
                    entity,
                    force: away.normalize_or_zero() * strength,
                    point: body_location,
                });
            }
        }
    }
}
