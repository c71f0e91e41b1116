//! Gravity resolver.
//!
//! A [`GravityField`] describes how gravity is computed around a character
//! (or a physics volume): a fixed direction, towards a point, line, spline,
//! plane, box or collision surface, with a signed scale.
//!
//! Resolution is two-phase. [`GravityField::resample`] refreshes the cached
//! targets that depend on other entities (their location, bounds, spline or
//! collision) and is called once per tick by the owner. Every query after
//! that ([`GravityField::gravity`], [`GravityField::direction`],
//! [`GravityField::magnitude`]) is pure and can be called from any number of
//! readers.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::collision::CollisionQuery;
use crate::math::{
    closest_point_on_box, closest_point_on_line, closest_point_on_segment,
    project_point_on_plane, SMALL_NUMBER,
};

/// World gravity along the world Y axis.
#[derive(Resource, Reflect, Debug, Clone, Copy, PartialEq)]
#[reflect(Resource)]
pub struct WorldGravity {
    /// Signed acceleration along +Y, negative pulls down.
    pub gravity_y: f32,
}

impl Default for WorldGravity {
    fn default() -> Self {
        Self { gravity_y: -980.0 }
    }
}

impl WorldGravity {
    pub fn new(gravity_y: f32) -> Self {
        Self { gravity_y }
    }

    /// Vertical direction used when a gravity direction degenerates to zero.
    ///
    /// The sign follows world gravity times the sign of `scale`; a zero
    /// world gravity counts as pulling down.
    pub fn fallback_direction(&self, scale: f32) -> Vec3 {
        let world_sign = if self.gravity_y > 0.0 { 1.0 } else { -1.0 };
        let scale_sign = if scale < 0.0 { -1.0 } else { 1.0 };
        Vec3::Y * (world_sign * scale_sign)
    }
}

/// How the gravity direction is computed.
#[derive(
    Reflect, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum GravityMode {
    /// A stored unit direction.
    #[default]
    Fixed,
    /// Along the tangent of a spline at its nearest point.
    SplineTangent,
    /// Towards a point.
    Point,
    /// Towards the nearest point of an infinite line.
    Line,
    /// Towards the nearest point of a segment.
    Segment,
    /// Towards the nearest point of a spline.
    Spline,
    /// Towards a plane.
    Plane,
    /// Towards the plane described by the nearest spline sample.
    SplinePlane,
    /// Towards the nearest point of an axis-aligned box.
    Box,
    /// Towards the nearest point of an entity's collision.
    Collision,
}

/// One gravity configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GravityChanged {
    pub old_mode: GravityMode,
    pub new_mode: GravityMode,
}

/// Targets refreshed by [`GravityField::resample`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResampledTarget {
    #[default]
    None,
    Point(Vec3),
    Box { origin: Vec3, extent: Vec3 },
    Spline(GravitySpline),
    Collision(Option<Vec3>),
}

/// Capabilities a gravity source entity may expose.
pub trait GravitySourceProvider {
    /// Current world location of the source.
    fn source_location(&self, source: Entity) -> Option<Vec3>;

    /// World-space bounds of the source as `(origin, half_extent)`.
    fn source_bounds(&self, source: Entity) -> Option<(Vec3, Vec3)>;

    /// World-space spline of the source.
    fn source_spline(&self, source: Entity) -> Option<GravitySpline>;

    /// Closest point on the source's collision to `point`.
    fn closest_point_on_collision(&self, source: Entity, point: Vec3) -> Option<Vec3>;
}

/// Provider with no sources, for fields that only use stored vectors.
pub struct NoGravitySources;

impl GravitySourceProvider for NoGravitySources {
    fn source_location(&self, _source: Entity) -> Option<Vec3> {
        None
    }

    fn source_bounds(&self, _source: Entity) -> Option<(Vec3, Vec3)> {
        None
    }

    fn source_spline(&self, _source: Entity) -> Option<GravitySpline> {
        None
    }

    fn closest_point_on_collision(&self, _source: Entity, _point: Vec3) -> Option<Vec3> {
        None
    }
}

/// Reads gravity sources from ECS components and the collision query.
pub struct WorldGravitySources<'w> {
    pub world: &'w World,
    pub query: &'w dyn CollisionQuery,
}

impl<'w> WorldGravitySources<'w> {
    pub fn new(world: &'w World, query: &'w dyn CollisionQuery) -> Self {
        Self { world, query }
    }

    fn transform(&self, entity: Entity) -> Option<Transform> {
        self.world.get::<Transform>(entity).copied().or_else(|| {
            self.world
                .get::<GlobalTransform>(entity)
                .map(|t| t.compute_transform())
        })
    }
}

impl GravitySourceProvider for WorldGravitySources<'_> {
    fn source_location(&self, source: Entity) -> Option<Vec3> {
        self.transform(source).map(|t| t.translation)
    }

    fn source_bounds(&self, source: Entity) -> Option<(Vec3, Vec3)> {
        let location = self.source_location(source)?;
        if let Some(bounds) = self.world.get::<GravityBounds>(source) {
            return Some((location + bounds.offset, bounds.half_extents));
        }
        self.world
            .get::<crate::volume::PhysicsVolume>(source)
            .map(|volume| (location, volume.half_extents))
    }

    fn source_spline(&self, source: Entity) -> Option<GravitySpline> {
        let spline = self.world.get::<GravitySpline>(source)?;
        let transform = self.transform(source).unwrap_or_default();
        Some(spline.transformed(&transform))
    }

    fn closest_point_on_collision(&self, source: Entity, point: Vec3) -> Option<Vec3> {
        self.query.closest_point(source, point)
    }
}

/// Gravity configuration with its cached targets.
#[derive(Component, Reflect, Debug, Clone)]
#[reflect(Component)]
pub struct GravityField {
    mode: GravityMode,
    vector_a: Vec3,
    vector_b: Vec3,
    source: Option<Entity>,
    scale: f32,
    #[reflect(ignore)]
    resampled: ResampledTarget,
    version: u32,
    dirty: bool,
    #[reflect(ignore)]
    changes: Vec<GravityChanged>,
}

impl Default for GravityField {
    fn default() -> Self {
        Self {
            mode: GravityMode::Fixed,
            vector_a: Vec3::NEG_Y,
            vector_b: Vec3::ZERO,
            source: None,
            scale: 1.0,
            resampled: ResampledTarget::None,
            version: 0,
            dirty: false,
            changes: Vec::new(),
        }
    }
}

impl GravityField {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed gravity along `direction`.
    pub fn fixed(direction: Vec3) -> Self {
        let mut field = Self::default();
        field.set_fixed_direction(direction);
        field.clear_changes();
        field
    }

    /// Gravity towards `point`.
    pub fn point(point: Vec3) -> Self {
        let mut field = Self::default();
        field.set_point_direction(point);
        field.clear_changes();
        field
    }

    /// Builder: set the scale.
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    #[inline]
    pub fn mode(&self) -> GravityMode {
        self.mode
    }

    #[inline]
    pub fn vector_a(&self) -> Vec3 {
        self.vector_a
    }

    #[inline]
    pub fn vector_b(&self) -> Vec3 {
        self.vector_b
    }

    #[inline]
    pub fn source(&self) -> Option<Entity> {
        self.source
    }

    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Incremented on every change.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Changed since the last [`take_dirty`](Self::take_dirty).
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Takes the queued change notifications.
    pub fn drain_changes(&mut self) -> impl Iterator<Item = GravityChanged> + '_ {
        self.changes.drain(..)
    }

    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }

    pub fn resampled(&self) -> &ResampledTarget {
        &self.resampled
    }

    /// A field with the given configuration and no change history.
    pub(crate) fn from_parts(
        mode: GravityMode,
        vector_a: Vec3,
        vector_b: Vec3,
        source: Option<Entity>,
        scale: f32,
    ) -> Self {
        Self {
            mode,
            vector_a,
            vector_b,
            source,
            scale,
            ..default()
        }
    }

    fn apply(&mut self, mode: GravityMode, a: Vec3, b: Vec3, source: Option<Entity>) -> bool {
        if self.mode == mode && self.vector_a == a && self.vector_b == b && self.source == source {
            return false;
        }
        let old_mode = self.mode;
        self.mode = mode;
        self.vector_a = a;
        self.vector_b = b;
        self.source = source;
        self.resampled = ResampledTarget::None;
        self.mark_changed();
        self.changes.push(GravityChanged {
            old_mode,
            new_mode: mode,
        });
        debug!("gravity changed from {:?} to {:?}", old_mode, mode);
        true
    }

    fn mark_changed(&mut self) {
        self.version = self.version.wrapping_add(1);
        self.dirty = true;
    }

    /// Fixed gravity along `direction`. Zero directions are ignored.
    pub fn set_fixed_direction(&mut self, direction: Vec3) -> bool {
        let direction = direction.normalize_or_zero();
        if direction == Vec3::ZERO {
            return false;
        }
        self.apply(GravityMode::Fixed, direction, Vec3::ZERO, None)
    }

    /// Gravity along the tangent of `source`'s spline.
    pub fn set_spline_tangent_direction(&mut self, source: Entity) -> bool {
        self.apply(GravityMode::SplineTangent, Vec3::ZERO, Vec3::ZERO, Some(source))
    }

    /// Gravity towards a fixed point.
    pub fn set_point_direction(&mut self, point: Vec3) -> bool {
        self.apply(GravityMode::Point, point, Vec3::ZERO, None)
    }

    /// Gravity towards the location of `source`.
    pub fn set_point_direction_from_source(&mut self, source: Entity) -> bool {
        self.apply(GravityMode::Point, Vec3::ZERO, Vec3::ZERO, Some(source))
    }

    /// Gravity towards an infinite line. Identical end points are ignored.
    pub fn set_line_direction(&mut self, start: Vec3, end: Vec3) -> bool {
        if start.distance_squared(end) < SMALL_NUMBER {
            return false;
        }
        self.apply(GravityMode::Line, start, end, None)
    }

    /// Gravity towards a segment. Identical end points are ignored.
    pub fn set_segment_direction(&mut self, start: Vec3, end: Vec3) -> bool {
        if start.distance_squared(end) < SMALL_NUMBER {
            return false;
        }
        self.apply(GravityMode::Segment, start, end, None)
    }

    /// Gravity towards `source`'s spline.
    pub fn set_spline_direction(&mut self, source: Entity) -> bool {
        self.apply(GravityMode::Spline, Vec3::ZERO, Vec3::ZERO, Some(source))
    }

    /// Gravity towards a plane. Zero normals are ignored.
    pub fn set_plane_direction(&mut self, base: Vec3, normal: Vec3) -> bool {
        let normal = normal.normalize_or_zero();
        if normal == Vec3::ZERO {
            return false;
        }
        self.apply(GravityMode::Plane, base, normal, None)
    }

    /// Gravity towards the plane of the nearest sample of `source`'s spline.
    pub fn set_spline_plane_direction(&mut self, source: Entity) -> bool {
        self.apply(GravityMode::SplinePlane, Vec3::ZERO, Vec3::ZERO, Some(source))
    }

    /// Gravity towards the box `origin ± extent`.
    pub fn set_box_direction(&mut self, origin: Vec3, extent: Vec3) -> bool {
        self.apply(GravityMode::Box, origin, extent.abs(), None)
    }

    /// Gravity towards the bounds of `source`.
    pub fn set_box_direction_from_source(&mut self, source: Entity) -> bool {
        self.apply(GravityMode::Box, Vec3::ZERO, Vec3::ZERO, Some(source))
    }

    /// Gravity towards the collision of `source`.
    pub fn set_collision_direction(&mut self, source: Entity) -> bool {
        self.apply(GravityMode::Collision, Vec3::ZERO, Vec3::ZERO, Some(source))
    }

    /// Set the scale. Marks the field dirty without a mode notification.
    pub fn set_gravity_scale(&mut self, scale: f32) -> bool {
        if self.scale == scale || !scale.is_finite() {
            return false;
        }
        self.scale = scale;
        self.mark_changed();
        true
    }

    /// Copy another field's configuration through the setters, so that no-op
    /// copies stay silent. Spline modes without a source use `fallback_source`.
    pub fn copy_configuration(&mut self, other: &GravityField, fallback_source: Option<Entity>) -> bool {
        let spline_source = other.source.or(fallback_source);
        let changed = match other.mode {
            GravityMode::Fixed => self.set_fixed_direction(other.vector_a),
            GravityMode::SplineTangent => spline_source
                .map(|s| self.set_spline_tangent_direction(s))
                .unwrap_or(false),
            GravityMode::Point => match other.source {
                Some(s) => self.set_point_direction_from_source(s),
                None => self.set_point_direction(other.vector_a),
            },
            GravityMode::Line => self.set_line_direction(other.vector_a, other.vector_b),
            GravityMode::Segment => self.set_segment_direction(other.vector_a, other.vector_b),
            GravityMode::Spline => spline_source
                .map(|s| self.set_spline_direction(s))
                .unwrap_or(false),
            GravityMode::Plane => self.set_plane_direction(other.vector_a, other.vector_b),
            GravityMode::SplinePlane => spline_source
                .map(|s| self.set_spline_plane_direction(s))
                .unwrap_or(false),
            GravityMode::Box => match other.source {
                Some(s) => self.set_box_direction_from_source(s),
                None => self.set_box_direction(other.vector_a, other.vector_b),
            },
            GravityMode::Collision => other
                .source
                .map(|s| self.set_collision_direction(s))
                .unwrap_or(false),
        };
        let scaled = self.set_gravity_scale(other.scale);
        changed || scaled
    }

    /// Refresh the targets that depend on other entities. `location` is the
    /// agent location used for collision closest-point queries.
    ///
    /// A source that cannot be resolved keeps the last resolved target, so
    /// gravity does not vanish while its source is briefly missing.
    pub fn resample(&mut self, location: Vec3, provider: &dyn GravitySourceProvider) {
        let Some(source) = self.source else {
            self.resampled = ResampledTarget::None;
            return;
        };
        let target = match self.mode {
            GravityMode::SplineTangent | GravityMode::Spline | GravityMode::SplinePlane => {
                provider.source_spline(source).map(ResampledTarget::Spline)
            }
            GravityMode::Point => provider.source_location(source).map(ResampledTarget::Point),
            GravityMode::Box => provider
                .source_bounds(source)
                .map(|(origin, extent)| ResampledTarget::Box { origin, extent }),
            GravityMode::Collision => provider
                .closest_point_on_collision(source, location)
                .map(|p| ResampledTarget::Collision(Some(p))),
            _ => Some(ResampledTarget::None),
        };
        match target {
            Some(target) => self.resampled = target,
            None => trace!("gravity source {:?} unresolved; keeping last target", source),
        }
    }

    /// Unnormalized, unsigned vector from `location` towards gravity.
    fn target_vector(&self, location: Vec3) -> Vec3 {
        match self.mode {
            GravityMode::Fixed => self.vector_a,
            GravityMode::SplineTangent => self
                .spline_sample(location)
                .map(|s| s.tangent)
                .unwrap_or(Vec3::ZERO),
            GravityMode::Point => {
                let target = match (&self.resampled, self.source) {
                    (ResampledTarget::Point(p), _) => *p,
                    (_, None) => self.vector_a,
                    _ => return Vec3::ZERO,
                };
                target - location
            }
            GravityMode::Line => closest_point_on_line(self.vector_a, self.vector_b, location) - location,
            GravityMode::Segment => {
                closest_point_on_segment(self.vector_a, self.vector_b, location) - location
            }
            GravityMode::Spline => self
                .spline_sample(location)
                .map(|s| s.position - location)
                .unwrap_or(Vec3::ZERO),
            GravityMode::Plane => {
                project_point_on_plane(location, self.vector_a, self.vector_b) - location
            }
            GravityMode::SplinePlane => self
                .spline_sample(location)
                .map(|s| project_point_on_plane(location, s.position, s.up) - location)
                .unwrap_or(Vec3::ZERO),
            GravityMode::Box => {
                let (origin, extent) = match (&self.resampled, self.source) {
                    (ResampledTarget::Box { origin, extent }, _) => (*origin, *extent),
                    (_, None) => (self.vector_a, self.vector_b),
                    _ => return Vec3::ZERO,
                };
                closest_point_on_box(origin, extent, location) - location
            }
            GravityMode::Collision => match &self.resampled {
                ResampledTarget::Collision(Some(p)) => *p - location,
                _ => Vec3::ZERO,
            },
        }
    }

    fn spline_sample(&self, location: Vec3) -> Option<SplineSample> {
        match &self.resampled {
            ResampledTarget::Spline(spline) => spline.nearest(location),
            _ => None,
        }
    }

    /// Normalized gravity direction at `location`, signed by the scale.
    ///
    /// With a zero scale the direction is zero unless `avoid_zero` is set, in
    /// which case the unsigned direction is returned. When the direction
    /// degenerates and `avoid_zero` is set, the world fallback axis is used.
    pub fn direction(&self, location: Vec3, avoid_zero: bool, world: &WorldGravity) -> Vec3 {
        if self.scale == 0.0 && !avoid_zero {
            return Vec3::ZERO;
        }
        let sign = if self.scale < 0.0 { -1.0 } else { 1.0 };
        let direction = self.target_vector(location).normalize_or_zero() * sign;
        if direction == Vec3::ZERO && avoid_zero {
            return world.fallback_direction(self.scale);
        }
        direction
    }

    /// Gravity magnitude, `|world gravity × scale|`.
    pub fn magnitude(&self, world: &WorldGravity) -> f32 {
        (world.gravity_y * self.scale).abs()
    }

    /// Gravity acceleration at `location`.
    pub fn gravity(&self, location: Vec3, world: &WorldGravity) -> Vec3 {
        let magnitude = self.magnitude(world);
        if magnitude == 0.0 {
            return Vec3::ZERO;
        }
        self.direction(location, false, world) * magnitude
    }
}

/// Axis-aligned bounds used as a box gravity source.
#[derive(Component, Reflect, Debug, Clone, Copy, PartialEq)]
#[reflect(Component)]
pub struct GravityBounds {
    pub half_extents: Vec3,
    /// Center offset from the entity's translation.
    pub offset: Vec3,
}

impl GravityBounds {
    pub fn new(half_extents: Vec3) -> Self {
        Self {
            half_extents: half_extents.abs(),
            offset: Vec3::ZERO,
        }
    }
}

/// Control point of a [`GravitySpline`].
#[derive(Reflect, Debug, Clone, Copy, PartialEq)]
pub struct SplinePoint {
    pub position: Vec3,
    /// Surface normal carried by the point, used by spline-plane gravity.
    pub up: Vec3,
}

/// Nearest-point query result on a spline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplineSample {
    pub position: Vec3,
    /// Unit tangent, zero for single-point splines.
    pub tangent: Vec3,
    pub up: Vec3,
}

/// Polyline spline used as a gravity source, in the owner's local space.
#[derive(Component, Reflect, Debug, Clone, PartialEq, Default)]
#[reflect(Component)]
pub struct GravitySpline {
    pub points: Vec<SplinePoint>,
    pub closed: bool,
}

impl GravitySpline {
    /// Spline through `positions`, every point with a +Y up vector.
    pub fn from_positions(positions: impl IntoIterator<Item = Vec3>) -> Self {
        Self {
            points: positions
                .into_iter()
                .map(|position| SplinePoint {
                    position,
                    up: Vec3::Y,
                })
                .collect(),
            closed: false,
        }
    }

    pub fn with_points(points: Vec<SplinePoint>) -> Self {
        Self {
            points,
            closed: false,
        }
    }

    /// Builder: connect the last point back to the first.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    /// Copy of this spline moved into world space.
    pub fn transformed(&self, transform: &Transform) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| SplinePoint {
                    position: transform.transform_point(p.position),
                    up: (transform.rotation * p.up).normalize_or_zero(),
                })
                .collect(),
            closed: self.closed,
        }
    }

    fn segments(&self) -> impl Iterator<Item = (&SplinePoint, &SplinePoint)> {
        let closing = if self.closed && self.points.len() > 2 {
            self.points.last().zip(self.points.first())
        } else {
            None
        };
        self.points.windows(2).map(|w| (&w[0], &w[1])).chain(closing)
    }

    /// Nearest sample to `point`, `None` for an empty spline.
    pub fn nearest(&self, point: Vec3) -> Option<SplineSample> {
        if self.points.len() == 1 {
            let only = self.points[0];
            return Some(SplineSample {
                position: only.position,
                tangent: Vec3::ZERO,
                up: only.up,
            });
        }

        let mut best: Option<(f32, SplineSample)> = None;
        for (a, b) in self.segments() {
            let dir = b.position - a.position;
            let len_sq = dir.length_squared();
            let t = if len_sq < SMALL_NUMBER {
                0.0
            } else {
                ((point - a.position).dot(dir) / len_sq).clamp(0.0, 1.0)
            };
            let position = a.position + dir * t;
            let dist_sq = position.distance_squared(point);
            if best.as_ref().is_none_or(|(d, _)| dist_sq < *d) {
                let up = a.up.lerp(b.up, t).normalize_or(a.up);
                best = Some((
                    dist_sq,
                    SplineSample {
                        position,
                        tangent: dir.normalize_or_zero(),
                        up,
                    },
                ));
            }
        }
        best.map(|(_, sample)| sample)
    }
}
