//! Sliding along blocking surfaces.

use bevy::prelude::*;

use super::CharacterMover;
use crate::collision::HitResult;
use crate::detection::MIN_FLOOR_DIST;
use crate::math::{plane_project, KINDA_SMALL_NUMBER};

/// Floors with `normal · up` at or above `1 - FLAT_FLOOR_EPSILON` count as
/// flat.
const FLAT_FLOOR_EPSILON: f32 = 1.0e-5;

impl CharacterMover<'_> {
    /// Slide the remaining `time` of `delta` along `normal`, adjusting once
    /// more if a second wall is hit. Returns the fraction of the slide
    /// applied; `hit` holds the last hit.
    pub fn slide_along_surface(
        &mut self,
        delta: Vec3,
        time: f32,
        normal: Vec3,
        hit: &mut HitResult,
        handle_impact: bool,
    ) -> f32 {
        if !hit.blocking_hit {
            return 0.0;
        }

        let mut normal = normal;
        if self.is_moving_on_ground() {
            let up = self.up();
            let dot = normal.dot(up);
            if dot > 0.0 {
                // Never pushed up an unwalkable surface.
                if !self.is_walkable(hit) {
                    normal = plane_project(normal, up).normalize_or_zero();
                }
            } else if dot < -KINDA_SMALL_NUMBER {
                // Hits on the upper capsule never push down into the floor.
                let floor = &self.agent.controller.floor;
                if floor.floor_dist < MIN_FLOOR_DIST && floor.blocking_hit {
                    let floor_normal = floor.hit.normal;
                    let floor_opposed = delta.dot(floor_normal) < 0.0
                        && floor_normal.dot(up) < 1.0 - FLAT_FLOOR_EPSILON;
                    if floor_opposed {
                        normal = floor_normal;
                    }
                    normal = plane_project(normal, up).normalize_or_zero();
                }
            }
        }

        let old_hit_normal = normal;
        let mut slide_delta = self.compute_slide_vector(delta, time, normal, hit);
        if slide_delta.dot(delta) <= 0.0 {
            return 0.0;
        }

        let rotation = self.agent.rotation;
        *hit = self.safe_move(slide_delta, rotation, true);
        let first_hit_percent = hit.time;
        let mut percent_applied = first_hit_percent;

        if hit.is_valid_blocking_hit() {
            if handle_impact {
                self.handle_impact(hit);
            }

            self.two_wall_adjust(&mut slide_delta, hit, old_hit_normal);

            if !slide_delta.abs_diff_eq(Vec3::ZERO, 1.0e-3) && slide_delta.dot(delta) > 0.0 {
                *hit = self.safe_move(slide_delta, rotation, true);
                percent_applied += hit.time * (1.0 - first_hit_percent);
                if handle_impact && hit.blocking_hit {
                    self.handle_impact(hit);
                }
            }
        }

        percent_applied.clamp(0.0, 1.0)
    }

    /// `delta` projected onto the surface, scaled by `time`. While falling
    /// the result never climbs higher than `delta` would have.
    pub fn compute_slide_vector(&self, delta: Vec3, time: f32, normal: Vec3, hit: &HitResult) -> Vec3 {
        let result = plane_project(delta, normal) * time;
        if self.is_falling() {
            self.handle_slope_boosting(result, delta, time, normal, hit)
        } else {
            result
        }
    }

    /// Adjust a slide that hit a second surface.
    pub fn two_wall_adjust(&self, delta: &mut Vec3, hit: &HitResult, old_hit_normal: Vec3) {
        let in_delta = *delta;
        let hit_normal = hit.normal;

        if old_hit_normal.dot(hit_normal) <= 0.0 {
            // Corner of 90° or less: move along the crease.
            let crease = hit_normal.cross(old_hit_normal).normalize_or_zero();
            let mut adjusted = crease * (in_delta.dot(crease) * (1.0 - hit.time));
            if in_delta.dot(adjusted) < 0.0 {
                adjusted = -adjusted;
            }
            *delta = adjusted;
        } else {
            let mut adjusted = self.compute_slide_vector(in_delta, 1.0 - hit.time, hit_normal, hit);
            if adjusted.dot(in_delta) <= 0.0 {
                adjusted = Vec3::ZERO;
            } else if (hit_normal.dot(old_hit_normal) - 1.0).abs() < KINDA_SMALL_NUMBER {
                // Same wall again: nudge away from it.
                adjusted += hit_normal * 0.01;
            }
            *delta = adjusted;
        }

        if !self.is_moving_on_ground() {
            return;
        }

        let up = self.up();
        let delta_up = delta.dot(up);
        if delta_up > 0.0 {
            let hit_up = hit.normal.dot(up);
            if hit_up > KINDA_SMALL_NUMBER && (hit_up >= self.config.walkable_floor_z || self.is_walkable(hit)) {
                // Keep the planar speed while sliding up a walkable surface.
                let time = 1.0 - hit.time;
                let scaled = delta.normalize_or_zero() * in_delta.length();
                let mut adjusted = (plane_project(in_delta, up) + up * (scaled.dot(up) / hit_up)) * time;

                let adjusted_up = adjusted.dot(up);
                if adjusted_up > self.config.max_step_height {
                    adjusted *= self.config.max_step_height / adjusted_up;
                }
                *delta = adjusted;
            } else {
                *delta = plane_project(*delta, up);
            }
        } else if delta_up < 0.0 {
            let floor = &self.agent.controller.floor;
            if floor.floor_dist < MIN_FLOOR_DIST && floor.blocking_hit {
                *delta = plane_project(*delta, up);
            }
        }
    }

    /// Limit a falling slide to the height `delta` was heading for.
    pub fn handle_slope_boosting(
        &self,
        slide_result: Vec3,
        delta: Vec3,
        time: f32,
        normal: Vec3,
        _hit: &HitResult,
    ) -> Vec3 {
        let up = self.up();
        let mut result = slide_result;
        let dot = result.dot(up);

        if dot > 0.0 {
            let z_limit = delta.dot(up) * time;
            if dot - z_limit > KINDA_SMALL_NUMBER {
                if z_limit > 0.0 {
                    // Rescale the whole vector so it does not turn back into
                    // the impact.
                    result *= z_limit / dot;
                } else {
                    result = Vec3::ZERO;
                }

                let remainder = plane_project(slide_result - result, up);
                let planar_normal = plane_project(normal, up).normalize_or_zero();
                result += plane_project(remainder, planar_normal);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use crate::state::MovementMode;

    fn wall_hit(normal: Vec3, time: f32) -> HitResult {
        HitResult {
            blocking_hit: true,
            time,
            normal,
            impact_normal: normal,
            ..HitResult::miss(Vec3::ZERO, Vec3::X)
        }
    }

    // ==================== ComputeSlideVector Tests ====================

    #[test]
    fn slide_vector_is_tangent() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mover = fixture.mover(&mut agent);
        let normal = Vec3::new(-1.0, 0.0, 1.0).normalize();
        let slide = mover.compute_slide_vector(Vec3::X * 10.0, 0.5, normal, &wall_hit(normal, 0.5));
        assert!(slide.dot(normal).abs() < 1e-5);
        assert!((slide.length() - 10.0 * 0.5 * std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-4);
    }

    #[test]
    fn falling_slide_does_not_boost_up() {
        let fixture = Fixture::flat();
        let mut agent = fixture.agent_at(Vec3::Y * 500.0);
        let mut mover = fixture.mover(&mut agent);
        mover.set_movement_mode(MovementMode::Falling);

        let normal = Vec3::new(-1.0, 1.0, 0.0).normalize();
        let delta = Vec3::new(10.0, -1.0, 0.0);
        let slide = mover.compute_slide_vector(delta, 1.0, normal, &wall_hit(normal, 0.0));
        assert!(slide.y <= 1e-4);
    }

    // ==================== TwoWallAdjust Tests ====================

    #[test]
    fn corner_moves_along_crease() {
        let fixture = Fixture::flat();
        let mut agent = fixture.agent_at(Vec3::Y * 500.0);
        let mut mover = fixture.mover(&mut agent);
        mover.set_movement_mode(MovementMode::Flying);

        let mut delta = Vec3::new(1.0, 1.0, 1.0);
        let hit = wall_hit(-Vec3::Z, 0.0);
        mover.two_wall_adjust(&mut delta, &hit, -Vec3::X);
        // Crease of the two walls runs along Y.
        assert!(delta.x.abs() < 1e-5 && delta.z.abs() < 1e-5);
        assert!(delta.y > 0.0);
    }

    #[test]
    fn walking_never_climbs_unwalkable_wall() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mover = fixture.mover(&mut agent);

        let steep = Vec3::new(-1.0, 0.3, 0.0).normalize();
        let mut delta = Vec3::new(5.0, 5.0, 0.0);
        mover.two_wall_adjust(&mut delta, &wall_hit(steep, 0.0), Vec3::Z);
        assert!(delta.y.abs() < 1e-4);
    }
}
