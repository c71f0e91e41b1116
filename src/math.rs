//! Orientation and vector helpers.
//!
//! Every direction test in the controller goes through [`ParallelThresholds`]
//! so that "parallel" and "orthogonal" share one tolerance per agent.

use bevy::prelude::*;

/// Values below this are treated as zero for lengths and dot products.
pub const KINDA_SMALL_NUMBER: f32 = 1.0e-4;

/// Values below this are treated as zero for squared lengths.
pub const SMALL_NUMBER: f32 = 1.0e-8;

/// Local X axis of a rotation.
#[inline]
pub fn axis_x(rotation: Quat) -> Vec3 {
    rotation * Vec3::X
}

/// Local Y axis of a rotation.
#[inline]
pub fn axis_y(rotation: Quat) -> Vec3 {
    rotation * Vec3::Y
}

/// Local Z axis of a rotation.
#[inline]
pub fn axis_z(rotation: Quat) -> Vec3 {
    rotation * Vec3::Z
}

/// The capsule "up" axis (local +Y).
#[inline]
pub fn up_axis(rotation: Quat) -> Vec3 {
    axis_y(rotation)
}

/// Cosine thresholds derived from a tolerance angle in degrees.
#[derive(Reflect, Debug, Clone, Copy, PartialEq)]
pub struct ParallelThresholds {
    /// Tolerance angle in degrees, clamped to `[0.25, 1.0]`.
    pub angle: f32,
    /// Vectors are parallel when `|a·b| >= parallel_cos`.
    pub parallel_cos: f32,
    /// Vectors are orthogonal when `|a·b| <= orthogonal_cos`.
    pub orthogonal_cos: f32,
}

impl Default for ParallelThresholds {
    fn default() -> Self {
        Self::from_angle(1.0)
    }
}

impl ParallelThresholds {
    pub const MIN_ANGLE: f32 = 0.25;
    pub const MAX_ANGLE: f32 = 1.0;

    pub fn from_angle(angle: f32) -> Self {
        let angle = angle.clamp(Self::MIN_ANGLE, Self::MAX_ANGLE);
        Self {
            angle,
            parallel_cos: angle.to_radians().cos(),
            orthogonal_cos: (90.0 - angle).to_radians().cos(),
        }
    }

    /// Angle between the vectors is close to 0°.
    #[inline]
    pub fn coincident(&self, a: Vec3, b: Vec3) -> bool {
        a.dot(b) >= self.parallel_cos
    }

    /// Angle between the vectors is close to 180°.
    #[inline]
    pub fn opposite(&self, a: Vec3, b: Vec3) -> bool {
        a.dot(b) <= -self.parallel_cos
    }

    /// Angle between the vectors is close to 0° or 180°.
    #[inline]
    pub fn parallel(&self, a: Vec3, b: Vec3) -> bool {
        a.dot(b).abs() >= self.parallel_cos
    }

    /// Angle between the vectors is close to 90°.
    #[inline]
    pub fn orthogonal(&self, a: Vec3, b: Vec3) -> bool {
        a.dot(b).abs() <= self.orthogonal_cos
    }
}

/// Builds a rotation whose up axis is `up`, keeping as much of `rotation` as
/// possible.
///
/// When the current up axis is not parallel to `up` the shortest arc between
/// them is prepended to `rotation`. When they are anti-parallel the shortest
/// arc is ambiguous, so the basis is rebuilt from `up` and the current X
/// axis instead.
pub fn make_from_up_quat(up: Vec3, rotation: Quat, thresholds: &ParallelThresholds) -> Quat {
    let current_up = up_axis(rotation);
    if !thresholds.parallel(current_up, up) {
        return (find_between_normals(current_up, up) * rotation).normalize();
    }

    let x = axis_x(rotation);
    let z = x.cross(up).normalize_or_zero();
    if z == Vec3::ZERO {
        return Quat::from_rotation_arc(Vec3::Y, up);
    }
    let x = up.cross(z);
    Quat::from_mat3(&Mat3::from_cols(x, up, z)).normalize()
}

/// Shortest rotation taking unit vector `from` onto unit vector `to`.
#[inline]
pub fn find_between_normals(from: Vec3, to: Vec3) -> Quat {
    Quat::from_rotation_arc(from, to)
}

/// Removes the component of `v` along the unit `normal`.
#[inline]
pub fn plane_project(v: Vec3, normal: Vec3) -> Vec3 {
    v - normal * v.dot(normal)
}

/// Projects `point` onto the plane through `base` with unit `normal`.
#[inline]
pub fn project_point_on_plane(point: Vec3, base: Vec3, normal: Vec3) -> Vec3 {
    point - normal * (point - base).dot(normal)
}

/// Closest point to `point` on the infinite line through `a` and `b`.
pub fn closest_point_on_line(a: Vec3, b: Vec3, point: Vec3) -> Vec3 {
    let dir = b - a;
    let len_sq = dir.length_squared();
    if len_sq < SMALL_NUMBER {
        return a;
    }
    a + dir * ((point - a).dot(dir) / len_sq)
}

/// Closest point to `point` on the segment `[a, b]`.
pub fn closest_point_on_segment(a: Vec3, b: Vec3, point: Vec3) -> Vec3 {
    let dir = b - a;
    let len_sq = dir.length_squared();
    if len_sq < SMALL_NUMBER {
        return a;
    }
    a + dir * ((point - a).dot(dir) / len_sq).clamp(0.0, 1.0)
}

/// Closest point to `point` inside the axis-aligned box `origin ± extent`.
#[inline]
pub fn closest_point_on_box(origin: Vec3, extent: Vec3, point: Vec3) -> Vec3 {
    let extent = extent.abs();
    point.clamp(origin - extent, origin + extent)
}

/// Closest points between segments `[p1, q1]` and `[p2, q2]` as
/// `(on_first, on_second)`.
pub fn closest_points_between_segments(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> (Vec3, Vec3) {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    let (s, t) = if a <= SMALL_NUMBER && e <= SMALL_NUMBER {
        (0.0, 0.0)
    } else if a <= SMALL_NUMBER {
        (0.0, (f / e).clamp(0.0, 1.0))
    } else {
        let c = d1.dot(r);
        if e <= SMALL_NUMBER {
            ((-c / a).clamp(0.0, 1.0), 0.0)
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let mut s = if denom > SMALL_NUMBER {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };
    (p1 + d1 * s, p2 + d2 * t)
}

/// Twist part of `rotation` about the unit `axis`.
pub fn twist_about(rotation: Quat, axis: Vec3) -> Quat {
    let v = Vec3::new(rotation.x, rotation.y, rotation.z);
    let projected = axis * v.dot(axis);
    let twist = Quat::from_xyzw(projected.x, projected.y, projected.z, rotation.w);
    if twist.length_squared() < SMALL_NUMBER {
        Quat::IDENTITY
    } else {
        twist.normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // ==================== Threshold Tests ====================

    #[test]
    fn thresholds_clamp_angle() {
        assert_eq!(ParallelThresholds::from_angle(5.0).angle, 1.0);
        assert_eq!(ParallelThresholds::from_angle(0.0).angle, 0.25);
    }

    #[test]
    fn thresholds_precompute_cosines() {
        let t = ParallelThresholds::from_angle(1.0);
        assert_relative_eq!(t.parallel_cos, 1.0_f32.to_radians().cos());
        assert_relative_eq!(t.orthogonal_cos, 89.0_f32.to_radians().cos());
    }

    #[test]
    fn classification_of_vectors() {
        let t = ParallelThresholds::default();
        assert!(t.coincident(Vec3::Y, Vec3::Y));
        assert!(t.opposite(Vec3::Y, Vec3::NEG_Y));
        assert!(t.parallel(Vec3::Y, Vec3::NEG_Y));
        assert!(!t.coincident(Vec3::Y, Vec3::NEG_Y));
        assert!(t.orthogonal(Vec3::Y, Vec3::X));
        assert!(!t.orthogonal(Vec3::Y, Vec3::new(0.3, 1.0, 0.0).normalize()));
    }

    // ==================== Rotation Tests ====================

    #[test]
    fn make_from_up_keeps_up() {
        let t = ParallelThresholds::default();
        let up = Vec3::new(1.0, 1.0, 0.0).normalize();
        let q = make_from_up_quat(up, Quat::IDENTITY, &t);
        assert_relative_eq!(up_axis(q).dot(up), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn make_from_up_handles_flip() {
        let t = ParallelThresholds::default();
        let q = make_from_up_quat(Vec3::NEG_Y, Quat::IDENTITY, &t);
        assert_relative_eq!(up_axis(q).dot(Vec3::NEG_Y), 1.0, epsilon = 1e-5);
        // The X axis survives the flip.
        assert_relative_eq!(axis_x(q).dot(Vec3::X), 1.0, epsilon = 1e-5);
        assert!(!q.is_nan());
    }

    #[test]
    fn twist_extracts_rotation_about_axis() {
        let yaw = Quat::from_rotation_y(0.5);
        let pitch = Quat::from_rotation_x(0.3);
        let twist = twist_about(yaw * pitch, Vec3::Y);
        let (axis, _) = twist.to_axis_angle();
        assert_relative_eq!(axis.dot(Vec3::Y).abs(), 1.0, epsilon = 1e-4);
    }

    // ==================== Projection Tests ====================

    #[test]
    fn closest_points_on_line_and_segment() {
        let a = Vec3::ZERO;
        let b = Vec3::X;
        let p = Vec3::new(3.0, 2.0, 0.0);
        assert_eq!(closest_point_on_line(a, b, p), Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(closest_point_on_segment(a, b, p), Vec3::X);
    }

    #[test]
    fn closest_point_on_box_clamps() {
        let p = closest_point_on_box(Vec3::ZERO, Vec3::ONE, Vec3::new(5.0, 0.5, -3.0));
        assert_eq!(p, Vec3::new(1.0, 0.5, -1.0));
    }

    #[test]
    fn segment_pair_closest_points() {
        let (a, b) = closest_points_between_segments(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 1.0),
            Vec3::new(0.0, 1.0, 1.0),
        );
        assert_relative_eq!(a.distance(Vec3::ZERO), 0.0, epsilon = 1e-6);
        assert_relative_eq!(b.distance(Vec3::Z), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn plane_projection_removes_normal_component() {
        let v = plane_project(Vec3::new(1.0, 2.0, 3.0), Vec3::Y);
        assert_eq!(v, Vec3::new(1.0, 0.0, 3.0));
        let p = project_point_on_plane(Vec3::new(1.0, 5.0, 0.0), Vec3::new(0.0, 2.0, 0.0), Vec3::Y);
        assert_eq!(p, Vec3::new(1.0, 2.0, 0.0));
    }
}
