//! Collision query contract.
//!
//! The movement code never talks to a physics engine directly. It asks a
//! [`CollisionQuery`] for sweeps, traces and overlaps, all of which are
//! synchronous and read-only.

use bevy::prelude::*;

use crate::math::up_axis;

/// Capsule dimensions. `half_height` includes the hemisphere, so the
/// capsule's inner segment has half-length `half_height - radius`.
#[derive(Component, Reflect, Debug, Clone, Copy, PartialEq)]
#[reflect(Component)]
pub struct CapsuleShape {
    pub radius: f32,
    pub half_height: f32,
}

impl Default for CapsuleShape {
    fn default() -> Self {
        Self {
            radius: 34.0,
            half_height: 88.0,
        }
    }
}

impl CapsuleShape {
    pub fn new(radius: f32, half_height: f32) -> Self {
        let radius = radius.max(0.0);
        Self {
            radius,
            half_height: half_height.max(radius),
        }
    }

    /// A sphere of the given radius.
    pub fn sphere(radius: f32) -> Self {
        Self::new(radius, radius)
    }

    /// Half-length of the inner segment.
    #[inline]
    pub fn segment_half_length(&self) -> f32 {
        (self.half_height - self.radius).max(0.0)
    }

    /// Inner segment end points for a capsule centered at `center`.
    pub fn segment(&self, center: Vec3, rotation: Quat) -> (Vec3, Vec3) {
        let offset = up_axis(rotation) * self.segment_half_length();
        (center - offset, center + offset)
    }
}

/// Outcome of a sweep or a trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitResult {
    /// The query stopped at geometry.
    pub blocking_hit: bool,
    /// The shape already overlapped geometry at the start of the query.
    pub start_penetrating: bool,
    /// Fraction of the query travelled before the hit, in `[0, 1]`.
    pub time: f32,
    /// Distance travelled before the hit.
    pub distance: f32,
    /// Shape center at the time of the hit.
    pub location: Vec3,
    /// Contact point on the hit surface.
    pub impact_point: Vec3,
    /// Normal of the swept shape at the contact point.
    pub normal: Vec3,
    /// Normal of the hit surface at the contact point.
    pub impact_normal: Vec3,
    pub trace_start: Vec3,
    pub trace_end: Vec3,
    /// Overlap depth along `normal` when `start_penetrating`.
    pub penetration_depth: f32,
    pub entity: Option<Entity>,
}

impl Default for HitResult {
    fn default() -> Self {
        Self::miss(Vec3::ZERO, Vec3::ZERO)
    }
}

impl HitResult {
    /// A query that reached its end without touching anything.
    pub fn miss(start: Vec3, end: Vec3) -> Self {
        Self {
            blocking_hit: false,
            start_penetrating: false,
            time: 1.0,
            distance: start.distance(end),
            location: end,
            impact_point: end,
            normal: Vec3::ZERO,
            impact_normal: Vec3::ZERO,
            trace_start: start,
            trace_end: end,
            penetration_depth: 0.0,
            entity: None,
        }
    }

    /// A blocking hit without initial penetration.
    pub fn is_valid_blocking_hit(&self) -> bool {
        self.blocking_hit && !self.start_penetrating
    }

    /// Resets to a miss, keeping the trace end points.
    pub fn reset(&mut self, time: f32) {
        *self = Self::miss(self.trace_start, self.trace_end);
        self.time = time;
    }
}

/// Read-only world queries consumed by the movement code.
///
/// Implementations exclude `ignore` from every query and skip sensors. A
/// sweep that starts inside geometry it is moving away from must ignore that
/// geometry and report what lies beyond it.
pub trait CollisionQuery {
    /// Sweeps a capsule from `start` to `end` and returns the first blocking
    /// hit, or a miss.
    fn sweep_capsule(
        &self,
        start: Vec3,
        end: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> HitResult;

    /// Casts a ray from `start` to `end`.
    fn line_trace(&self, start: Vec3, end: Vec3, ignore: Option<Entity>) -> HitResult;

    /// Whether the capsule placed at `location` intersects geometry.
    fn overlap_capsule(
        &self,
        location: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> bool;

    /// Entities whose collision overlaps the capsule.
    fn overlapping_entities(
        &self,
        location: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> Vec<Entity>;

    /// Closest point on the collision geometry of `entity` to `point`.
    /// Returns `point` itself when it lies inside, `None` when the entity has
    /// no collision.
    fn closest_point(&self, entity: Entity, point: Vec3) -> Option<Vec3>;

    /// Sweeps a sphere from `start` to `end`.
    fn sweep_sphere(&self, start: Vec3, end: Vec3, radius: f32, ignore: Option<Entity>) -> HitResult {
        self.sweep_capsule(start, end, Quat::IDENTITY, CapsuleShape::sphere(radius), ignore)
    }
}

/// Normal of a capsule surface facing `point`.
///
/// Used by backends that only report the surface normal of a contact.
pub fn capsule_normal_toward(center: Vec3, rotation: Quat, shape: CapsuleShape, point: Vec3) -> Vec3 {
    let (a, b) = shape.segment(center, rotation);
    let axis_point = crate::math::closest_point_on_segment(a, b, point);
    (axis_point - point).normalize_or_zero()
}

/// Moves a sweep hit back along the sweep so the shape rests a little short
/// of the contact.
pub fn pull_back_hit(hit: &mut HitResult, start: Vec3, end: Vec3) {
    let dist = start.distance(end);
    if dist > crate::math::KINDA_SMALL_NUMBER {
        let desired_time_back = 0.1_f32.clamp(0.1 / dist, 1.0 / dist) + 0.001;
        hit.time = (hit.time - desired_time_back).clamp(0.0, 1.0);
        hit.location = start.lerp(end, hit.time);
        hit.distance = dist * hit.time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capsule_shape_segment() {
        let shape = CapsuleShape::new(10.0, 30.0);
        let (a, b) = shape.segment(Vec3::ZERO, Quat::IDENTITY);
        assert_eq!(a, Vec3::new(0.0, -20.0, 0.0));
        assert_eq!(b, Vec3::new(0.0, 20.0, 0.0));
    }

    #[test]
    fn capsule_half_height_never_below_radius() {
        let shape = CapsuleShape::new(10.0, 4.0);
        assert_eq!(shape.half_height, 10.0);
        assert_eq!(shape.segment_half_length(), 0.0);
    }

    #[test]
    fn miss_is_not_blocking() {
        let hit = HitResult::miss(Vec3::ZERO, Vec3::X * 10.0);
        assert!(!hit.is_valid_blocking_hit());
        assert_eq!(hit.time, 1.0);
        assert_eq!(hit.distance, 10.0);
    }

    #[test]
    fn start_penetrating_is_not_valid() {
        let mut hit = HitResult::miss(Vec3::ZERO, Vec3::X);
        hit.blocking_hit = true;
        hit.start_penetrating = true;
        assert!(!hit.is_valid_blocking_hit());
    }

    #[test]
    fn pull_back_moves_hit_towards_start() {
        let mut hit = HitResult::miss(Vec3::ZERO, Vec3::X * 100.0);
        hit.blocking_hit = true;
        hit.time = 0.5;
        pull_back_hit(&mut hit, Vec3::ZERO, Vec3::X * 100.0);
        assert!(hit.time < 0.5);
        assert!(hit.location.x < 50.0);
    }

    #[test]
    fn capsule_normal_points_from_contact_to_axis() {
        let shape = CapsuleShape::new(10.0, 30.0);
        let n = capsule_normal_toward(Vec3::ZERO, Quat::IDENTITY, shape, Vec3::new(0.0, -30.0, 0.0));
        assert_eq!(n, Vec3::Y);
    }
}
