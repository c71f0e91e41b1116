//! Floor and ledge detection.
//!
//! Floor queries sweep a slightly shrunk capsule down the capsule axis and
//! fall back to a line trace when the sweep is inconclusive. Walkability is
//! measured against the capsule up axis and, while falling, against gravity.

use bevy::prelude::*;

use crate::collision::{CapsuleShape, HitResult};
use crate::math::{ParallelThresholds, KINDA_SMALL_NUMBER};
use crate::movement::CharacterMover;

/// Lower bound of the distance kept between the capsule and the floor.
pub const MIN_FLOOR_DIST: f32 = 1.9;
/// Upper bound of the distance kept between the capsule and the floor.
pub const MAX_FLOOR_DIST: f32 = 2.4;
/// Hits closer than this to the capsule rim are rejected by floor sweeps.
pub const SWEEP_EDGE_REJECT_DISTANCE: f32 = 0.15;
/// Maximum `normal · up` of the side of a step.
pub const MAX_STEP_SIDE_Z: f32 = 0.08;
/// Walls with `|normal · up|` below this count as vertical.
pub const VERTICAL_SLOPE_NORMAL_Z: f32 = 0.001;
/// Speed below which braking stops the character.
pub const BRAKE_TO_STOP_VELOCITY: f32 = 10.0;
/// Sub-steps shorter than this are not simulated.
pub const MIN_TICK_TIME: f32 = 1.0e-6;

/// Result of a floor query.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FloorResult {
    /// A blocking hit was found below the capsule.
    pub blocking_hit: bool,
    /// The hit is a floor the character can stand on.
    pub walkable_floor: bool,
    /// The hit came from the line trace fallback.
    pub line_trace: bool,
    /// Distance from the capsule bottom to the sweep hit.
    pub floor_dist: f32,
    /// Distance from the capsule bottom to the line trace hit.
    pub line_dist: f32,
    pub hit: HitResult,
}

impl FloorResult {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn set_from_sweep(&mut self, hit: HitResult, sweep_floor_dist: f32, walkable: bool) {
        self.blocking_hit = hit.is_valid_blocking_hit();
        self.walkable_floor = walkable;
        self.line_trace = false;
        self.floor_dist = sweep_floor_dist;
        self.line_dist = 0.0;
        self.hit = hit;
    }

    /// Take the normal of a line trace hit while keeping the sweep location.
    pub fn set_from_line_trace(
        &mut self,
        hit: HitResult,
        sweep_floor_dist: f32,
        line_dist: f32,
        walkable: bool,
    ) {
        if self.hit.blocking_hit && hit.blocking_hit {
            let sweep = self.hit;
            self.hit = hit;
            self.hit.time = sweep.time;
            self.hit.impact_point = sweep.impact_point;
            self.hit.location = sweep.location;
            self.hit.trace_start = sweep.trace_start;
            self.hit.trace_end = sweep.trace_end;

            self.line_trace = true;
            self.floor_dist = sweep_floor_dist;
            self.line_dist = line_dist;
            self.walkable_floor = walkable;
        }
    }

    #[inline]
    pub fn is_walkable_floor(&self) -> bool {
        self.blocking_hit && self.walkable_floor
    }

    /// Distance to the floor from whichever query produced the result.
    #[inline]
    pub fn distance_to_floor(&self) -> f32 {
        if self.line_trace {
            self.line_dist
        } else {
            self.floor_dist
        }
    }
}

/// Floor found while stepping up, reused to skip a redundant query.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepDownResult {
    pub computed_floor: bool,
    pub floor: FloorResult,
}

/// Per-surface change of the walkable slope.
#[derive(Component, Reflect, Debug, Clone, Copy, PartialEq, Default)]
#[reflect(Component)]
pub enum WalkableSlopeOverride {
    #[default]
    Default,
    /// Surfaces up to this angle in degrees are walkable.
    IncreaseWalkable(f32),
    /// Surfaces steeper than this angle in degrees are unwalkable.
    DecreaseWalkable(f32),
    Unwalkable,
}

impl WalkableSlopeOverride {
    pub fn modify_walkable_floor_z(self, walkable_floor_z: f32) -> f32 {
        match self {
            WalkableSlopeOverride::Default => walkable_floor_z,
            WalkableSlopeOverride::IncreaseWalkable(angle) => {
                walkable_floor_z.min(angle.to_radians().cos())
            }
            WalkableSlopeOverride::DecreaseWalkable(angle) => {
                walkable_floor_z.max(angle.to_radians().cos())
            }
            WalkableSlopeOverride::Unwalkable => f32::MAX,
        }
    }
}

/// Whether `impact_point` lies inside the capsule radius shrunk by
/// [`SWEEP_EDGE_REJECT_DISTANCE`], measured perpendicular to the capsule axis.
pub fn is_within_edge_tolerance(
    capsule_location: Vec3,
    capsule_down: Vec3,
    capsule_radius: f32,
    impact_point: Vec3,
) -> bool {
    let dist_from_center_sq = (capsule_location
        + capsule_down * (impact_point - capsule_location).dot(capsule_down)
        - impact_point)
        .length_squared();
    let reduced_radius = (SWEEP_EDGE_REJECT_DISTANCE + KINDA_SMALL_NUMBER)
        .max(capsule_radius - SWEEP_EDGE_REJECT_DISTANCE);
    dist_from_center_sq < reduced_radius * reduced_radius
}

/// Walkability of a surface normal against the capsule up axis.
///
/// When `gravity_up` is given the normal must also face away from gravity by
/// the same threshold.
pub fn is_walkable_normal(
    impact_normal: Vec3,
    capsule_up: Vec3,
    walkable_floor_z: f32,
    gravity_up: Option<Vec3>,
) -> bool {
    let up_dot = impact_normal.dot(capsule_up);
    if up_dot < KINDA_SMALL_NUMBER || up_dot < walkable_floor_z {
        return false;
    }
    gravity_up.is_none_or(|g| impact_normal.dot(g) >= walkable_floor_z)
}

impl CharacterMover<'_> {
    /// Walkable threshold for the surface hit, after its slope override.
    pub fn walkable_floor_z_for(&self, hit: &HitResult) -> f32 {
        let base = self.config.walkable_floor_z;
        hit.entity
            .and_then(|e| self.env.slope_overrides.get(&e))
            .map_or(base, |o| o.modify_walkable_floor_z(base))
    }

    /// Whether the hit surface can be stood on.
    pub fn is_walkable(&self, hit: &HitResult) -> bool {
        if !hit.is_valid_blocking_hit() {
            return false;
        }
        let gravity_up = (!self.land_on_any_surface() && self.is_falling())
            .then(|| -self.gravity_direction(false));
        is_walkable_normal(
            hit.impact_normal,
            self.up(),
            self.walkable_floor_z_for(hit),
            gravity_up,
        )
    }

    /// Perch threshold, never negative.
    pub fn perch_radius_threshold(&self) -> f32 {
        self.config.perch_radius_threshold.max(0.0)
    }

    /// Radius of the capsule used for perch queries.
    pub fn valid_perch_radius(&self) -> f32 {
        let radius = self.agent.shape.radius;
        (radius - self.perch_radius_threshold()).clamp(0.11, radius.max(0.11))
    }

    /// Measures the distance from the capsule bottom to the floor.
    ///
    /// `sweep_distance` must not be shorter than `line_distance`; a violating
    /// call logs a warning and returns an empty result.
    pub fn compute_floor_dist(
        &self,
        capsule_location: Vec3,
        line_distance: f32,
        sweep_distance: f32,
        sweep_radius: f32,
        downward_sweep: Option<&HitResult>,
    ) -> FloorResult {
        trace!("compute floor dist at {:?}", capsule_location);
        let mut floor = FloorResult::default();

        let CapsuleShape {
            radius: pawn_radius,
            half_height: pawn_half_height,
        } = self.agent.shape;
        let capsule_down = -self.up();
        let entity = Some(self.agent.entity);

        let mut skip_sweep = false;
        if let Some(downward) = downward_sweep.filter(|h| h.is_valid_blocking_hit()) {
            let sweep_dir = (downward.trace_end - downward.trace_start).normalize_or_zero();
            if self.thresholds().coincident(sweep_dir, capsule_down)
                && is_within_edge_tolerance(
                    downward.location,
                    capsule_down,
                    pawn_radius,
                    downward.impact_point,
                )
            {
                skip_sweep = true;
                let walkable = self.is_walkable(downward);
                let floor_dist = (capsule_location - downward.location).length();
                floor.set_from_sweep(*downward, floor_dist, walkable);
                if walkable {
                    return floor;
                }
            }
        }

        if sweep_distance < line_distance {
            warn!(
                "floor query with sweep distance {} shorter than line distance {}",
                sweep_distance, line_distance
            );
            return FloorResult::default();
        }

        let max_penetration_adjust = MAX_FLOOR_DIST.max(pawn_radius);

        if !skip_sweep && sweep_distance > 0.0 && sweep_radius > 0.0 {
            // A shorter capsule avoids odd results when starting on a surface.
            const SHRINK_SCALE: f32 = 0.9;
            const SHRINK_SCALE_OVERLAP: f32 = 0.1;
            let mut shrink_height = (pawn_half_height - pawn_radius) * (1.0 - SHRINK_SCALE);
            let mut trace_dist = sweep_distance + shrink_height;
            let mut shape = CapsuleShape::new(sweep_radius, pawn_half_height - shrink_height);

            let mut hit = self.query.sweep_capsule(
                capsule_location,
                capsule_location + capsule_down * trace_dist,
                self.agent.rotation,
                shape,
                entity,
            );

            if hit.blocking_hit {
                if hit.start_penetrating
                    || !is_within_edge_tolerance(
                        capsule_location,
                        capsule_down,
                        shape.radius,
                        hit.impact_point,
                    )
                {
                    let radius = (shape.radius - SWEEP_EDGE_REJECT_DISTANCE - KINDA_SMALL_NUMBER).max(0.0);
                    if radius > KINDA_SMALL_NUMBER {
                        shrink_height = (pawn_half_height - pawn_radius) * (1.0 - SHRINK_SCALE_OVERLAP);
                        trace_dist = sweep_distance + shrink_height;
                        shape = CapsuleShape::new(radius, (pawn_half_height - shrink_height).max(radius));
                        hit = self.query.sweep_capsule(
                            capsule_location,
                            capsule_location + capsule_down * trace_dist,
                            self.agent.rotation,
                            shape,
                            entity,
                        );
                    }
                }

                // Negative distances let the height adjustment pull out of
                // penetrations.
                let sweep_result = (hit.time * trace_dist - shrink_height).max(-max_penetration_adjust);
                floor.set_from_sweep(hit, sweep_result, false);
                if hit.is_valid_blocking_hit() && self.is_walkable(&hit) && sweep_result <= sweep_distance {
                    floor.walkable_floor = true;
                    return floor;
                }
            }
        }

        // The line trace only runs when the sweep found something or got
        // stuck in penetration.
        if !floor.blocking_hit && !floor.hit.start_penetrating {
            floor.floor_dist = sweep_distance;
            return floor;
        }

        if line_distance > 0.0 {
            let shrink_height = pawn_half_height;
            let trace_dist = line_distance + shrink_height;
            let hit = self.query.line_trace(
                capsule_location,
                capsule_location + capsule_down * trace_dist,
                entity,
            );

            if hit.blocking_hit && hit.time > 0.0 {
                let line_result = (hit.time * trace_dist - shrink_height).max(-max_penetration_adjust);
                floor.blocking_hit = true;
                if line_result <= line_distance && self.is_walkable(&hit) {
                    let floor_dist = floor.floor_dist;
                    floor.set_from_line_trace(hit, floor_dist, line_result, true);
                    return floor;
                }
            }
        }

        floor.walkable_floor = false;
        floor
    }

    /// Looks for a floor below `capsule_location`, perching on edges when the
    /// configuration allows it.
    pub fn find_floor(&mut self, capsule_location: Vec3, downward_sweep: Option<&HitResult>) -> FloorResult {
        let height_check_adjust = if self.is_moving_on_ground() {
            MAX_FLOOR_DIST + KINDA_SMALL_NUMBER
        } else {
            -MAX_FLOOR_DIST
        };
        let trace_dist = MAX_FLOOR_DIST.max(self.config.max_step_height + height_check_adjust);

        self.agent.controller.force_next_floor_check = false;
        let mut floor = self.compute_floor_dist(
            capsule_location,
            trace_dist,
            trace_dist,
            self.agent.shape.radius,
            downward_sweep,
        );

        if floor.blocking_hit && !floor.line_trace && self.should_compute_perch_result(&floor.hit, true) {
            let mut max_perch_floor_dist = trace_dist;
            if self.is_moving_on_ground() {
                max_perch_floor_dist += self.config.perch_additional_height.max(0.0);
            }

            match self.compute_perch_result(self.valid_perch_radius(), &floor.hit, max_perch_floor_dist) {
                Some(perch) => {
                    // Keep the height adjustment from lifting past the perch
                    // distance.
                    let avg_floor_dist = (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5;
                    let move_up_dist = avg_floor_dist - floor.floor_dist;
                    if move_up_dist + perch.floor_dist >= max_perch_floor_dist {
                        floor.floor_dist = avg_floor_dist;
                    }

                    if !floor.walkable_floor {
                        let floor_dist = floor.floor_dist;
                        floor.set_from_line_trace(perch.hit, floor_dist, floor_dist.max(MIN_FLOOR_DIST), true);
                    }
                }
                None => floor.walkable_floor = false,
            }
        }

        floor
    }

    /// Whether a falling hit is a spot the character can land on.
    pub fn is_valid_landing_spot(&mut self, capsule_location: Vec3, hit: &HitResult) -> bool {
        if !hit.blocking_hit {
            return false;
        }
        let capsule_down = -self.up();

        if !hit.start_penetrating {
            if !self.is_walkable(hit) {
                return false;
            }

            let CapsuleShape { radius, half_height } = self.agent.shape;
            let bottom = hit.location + capsule_down * (half_height - radius).max(0.0);
            let top = hit.location - capsule_down;
            let segment = top - bottom;
            let alpha = (hit.impact_point - bottom).dot(segment) / segment.length_squared();

            // Above the lower hemisphere, as when sliding down a wall.
            if alpha >= 0.0 {
                return false;
            }

            if !is_within_edge_tolerance(hit.location, capsule_down, radius, hit.impact_point) {
                return false;
            }
        } else if hit.normal.dot(capsule_down) > -KINDA_SMALL_NUMBER {
            // Penetration next to a vertical or overhanging wall.
            return false;
        }

        self.find_floor(capsule_location, Some(hit)).is_walkable_floor()
    }

    /// Whether the lower capsule hit an edge with a possibly walkable top.
    pub fn should_check_for_valid_landing_spot(&self, hit: &HitResult) -> bool {
        let up = self.up();
        hit.normal.dot(up) > KINDA_SMALL_NUMBER
            && !hit.normal.abs_diff_eq(hit.impact_normal, KINDA_SMALL_NUMBER)
            && is_within_edge_tolerance(self.agent.location, -up, self.agent.shape.radius, hit.impact_point)
    }

    pub fn should_compute_perch_result(&self, hit: &HitResult, check_radius: bool) -> bool {
        if !hit.is_valid_blocking_hit() {
            return false;
        }
        if self.perch_radius_threshold() <= SWEEP_EDGE_REJECT_DISTANCE {
            return false;
        }
        if check_radius {
            let down = -self.up();
            let dist_from_center_sq =
                (hit.location + down * (hit.impact_point - hit.location).dot(down) - hit.impact_point)
                    .length_squared();
            let perch_radius = self.valid_perch_radius();
            if dist_from_center_sq <= perch_radius * perch_radius {
                return false;
            }
        }
        true
    }

    /// Floor found by a narrower capsule standing at `hit.location`, if it is
    /// walkable and within `max_floor_dist`.
    pub fn compute_perch_result(
        &self,
        test_radius: f32,
        hit: &HitResult,
        max_floor_dist: f32,
    ) -> Option<FloorResult> {
        if max_floor_dist <= 0.0 {
            return None;
        }
        let CapsuleShape { radius, half_height } = self.agent.shape;
        let down = -self.up();

        let hit_above_base = (hit.location + down * (hit.impact_point - hit.location).dot(down)
            - (hit.location + down * half_height))
            .length();
        let perch_line_dist = (max_floor_dist - hit_above_base).max(0.0);
        let perch_sweep_dist = max_floor_dist.max(0.0);

        let perch = self.compute_floor_dist(
            hit.location,
            perch_line_dist,
            perch_sweep_dist + radius,
            test_radius,
            None,
        );

        (perch.is_walkable_floor() && hit_above_base + perch.floor_dist <= max_floor_dist).then_some(perch)
    }

    pub(crate) fn thresholds(&self) -> &ParallelThresholds {
        self.orientation.thresholds()
    }
}
