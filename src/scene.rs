//! Analytic collision scene and lightweight body backend.
//!
//! [`SceneCollision`] answers every [`CollisionQuery`] exactly against a
//! small set of planes, oriented boxes, spheres and character capsules. It
//! needs no physics engine, which makes it the backend of choice for
//! headless servers, replays and tests.
//!
//! [`SceneBackend`] exposes the scene through [`CharacterPhysicsBackend`].
//! Bodies are described by [`SceneBody`] and integrated as point masses
//! without contacts; [`SceneShape`] gives entities collision.

use std::collections::{HashMap, HashSet};

use bevy::prelude::*;

use crate::backend::{BodyQuery, CharacterPhysicsBackend};
use crate::collision::{CapsuleShape, CollisionQuery, HitResult};
use crate::math::{closest_point_on_segment, closest_points_between_segments, SMALL_NUMBER};
use crate::state::CharacterController;
use crate::GravityCharacterSet;

/// Separation at which a sweep counts as touching.
const CONTACT_TOLERANCE: f32 = 1.0e-3;
/// Overlap below this depth is treated as touching, not penetrating.
const PENETRATION_TOLERANCE: f32 = 1.0e-4;
/// Distances within this band of the minimum count as equally close.
const PLATEAU_TOLERANCE: f32 = 1.0e-4;
/// Newton steps of the conservative advancement.
const MAX_ADVANCE_ITERATIONS: usize = 64;
/// A sweep that stalls within this distance still reports a hit.
const GRAZE_TOLERANCE: f32 = 1.0e-2;
const SEARCH_ITERATIONS: usize = 48;
const INV_GOLDEN_RATIO: f32 = 0.618_034;

// ==================== Shapes ====================

/// Geometry of one scene collider, in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColliderShape {
    /// Half-space below the plane through `point`.
    Plane { point: Vec3, normal: Vec3 },
    Box {
        center: Vec3,
        rotation: Quat,
        half_extents: Vec3,
    },
    Sphere { center: Vec3, radius: f32 },
    Capsule {
        center: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
    },
}

/// Closest approach between a segment and a collider surface.
#[derive(Debug, Clone, Copy)]
struct Proximity {
    /// Signed distance from the segment to the surface, negative inside.
    distance: f32,
    surface: Vec3,
    /// Unit normal from the surface towards the segment.
    normal: Vec3,
}

impl ColliderShape {
    /// Proximity of the segment `[a, b]`. A point is a degenerate segment.
    fn proximity(&self, a: Vec3, b: Vec3) -> Proximity {
        match *self {
            Self::Plane { point, normal } => {
                let da = (a - point).dot(normal);
                let db = (b - point).dot(normal);
                let (nearest, distance) = if da <= db + PLATEAU_TOLERANCE { (a, da) } else { (b, db) };
                Proximity {
                    distance,
                    surface: nearest - normal * distance,
                    normal,
                }
            }
            Self::Sphere { center, radius } => {
                let nearest = closest_point_on_segment(a, b, center);
                sphere_proximity(nearest, center, radius)
            }
            Self::Capsule { center, rotation, shape } => {
                let (c0, c1) = shape.segment(center, rotation);
                let (nearest, axis) = closest_points_between_segments(a, b, c0, c1);
                sphere_proximity(nearest, axis, shape.radius)
            }
            Self::Box {
                center,
                rotation,
                half_extents,
            } => {
                let inverse = rotation.inverse();
                let la = inverse * (a - center);
                let lb = inverse * (b - center);
                let t = segment_minimum(la, lb, |p| box_point(p, half_extents).0);
                let (distance, surface, normal) = box_point(la.lerp(lb, t), half_extents);
                Proximity {
                    distance,
                    surface: center + rotation * surface,
                    normal: rotation * normal,
                }
            }
        }
    }

    /// Normal of the hit surface. On box edges and corners this is the face
    /// most opposed to the motion.
    fn impact_normal(&self, proximity: &Proximity, direction: Vec3) -> Vec3 {
        let Self::Box {
            center,
            rotation,
            half_extents,
        } = *self
        else {
            return proximity.normal;
        };
        let local = rotation.inverse() * (proximity.surface - center);
        let mut best: Option<(f32, Vec3)> = None;
        let mut faces = 0;
        for axis in 0..3 {
            if local[axis].abs() < half_extents[axis] - CONTACT_TOLERANCE {
                continue;
            }
            faces += 1;
            let mut face = Vec3::ZERO;
            face[axis] = local[axis].signum();
            let face = rotation * face;
            let facing = face.dot(direction);
            if best.map_or(true, |(f, _)| facing < f) {
                best = Some((facing, face));
            }
        }
        match best {
            Some((_, face)) if faces >= 2 && direction != Vec3::ZERO => face,
            _ => proximity.normal,
        }
    }
}

fn sphere_proximity(point: Vec3, center: Vec3, radius: f32) -> Proximity {
    let offset = point - center;
    let length = offset.length();
    let normal = if length > SMALL_NUMBER { offset / length } else { Vec3::Y };
    Proximity {
        distance: length - radius,
        surface: center + normal * radius,
        normal,
    }
}

/// Signed distance of a local point to a box centered at the origin, with
/// the closest surface point and the outward normal there.
fn box_point(p: Vec3, half_extents: Vec3) -> (f32, Vec3, Vec3) {
    let q = p.abs() - half_extents;
    if q.max_element() > 0.0 {
        let clamped = p.clamp(-half_extents, half_extents);
        let offset = p - clamped;
        let length = offset.length();
        return (length, clamped, offset / length);
    }
    let axis = if q.x >= q.y && q.x >= q.z {
        0
    } else if q.y >= q.z {
        1
    } else {
        2
    };
    let sign = if p[axis] >= 0.0 { 1.0 } else { -1.0 };
    let mut surface = p;
    surface[axis] = sign * half_extents[axis];
    let mut normal = Vec3::ZERO;
    normal[axis] = sign;
    (q[axis], surface, normal)
}

/// Parameter in `[0, 1]` minimising the convex `f` along `[a, b]`. Ties
/// resolve towards `a`.
fn segment_minimum(a: Vec3, b: Vec3, f: impl Fn(Vec3) -> f32) -> f32 {
    if a.distance_squared(b) <= SMALL_NUMBER {
        return 0.0;
    }
    let eval = |t: f32| f(a.lerp(b, t));

    let (mut lo, mut hi) = (0.0_f32, 1.0_f32);
    let mut c = hi - INV_GOLDEN_RATIO * (hi - lo);
    let mut d = lo + INV_GOLDEN_RATIO * (hi - lo);
    let (mut fc, mut fd) = (eval(c), eval(d));
    for _ in 0..SEARCH_ITERATIONS {
        if fc <= fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - INV_GOLDEN_RATIO * (hi - lo);
            fc = eval(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + INV_GOLDEN_RATIO * (hi - lo);
            fd = eval(d);
        }
    }

    let mut best = 0.5 * (lo + hi);
    let mut best_value = eval(best);
    let end_value = eval(1.0);
    if end_value < best_value {
        best = 1.0;
        best_value = end_value;
    }

    // Leftmost parameter within the plateau around the minimum.
    let threshold = best_value + PLATEAU_TOLERANCE;
    if eval(0.0) <= threshold {
        return 0.0;
    }
    let (mut outside, mut inside) = (0.0_f32, best);
    for _ in 0..SEARCH_ITERATIONS {
        let mid = 0.5 * (outside + inside);
        if eval(mid) <= threshold {
            inside = mid;
        } else {
            outside = mid;
        }
    }
    inside
}

// ==================== Scene ====================

#[derive(Debug, Clone, Copy)]
struct SceneCollider {
    entity: Entity,
    shape: ColliderShape,
}

/// Contact found by a sweep against a single collider.
#[derive(Debug, Clone, Copy)]
struct Contact {
    time: f32,
    proximity: Proximity,
    penetration: Option<f32>,
}

impl Contact {
    fn precedes(&self, other: &Contact) -> bool {
        match (self.penetration, other.penetration) {
            (Some(depth), Some(other_depth)) => depth > other_depth,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.time < other.time,
        }
    }
}

/// Exact collision queries against analytic shapes.
///
/// # Example
///
/// ```rust
/// use bevy::prelude::*;
/// use msg_gravity_character::prelude::*;
///
/// let mut world = World::new();
/// let ground = world.spawn_empty().id();
/// let scene = SceneCollision::new().with_plane(ground, Vec3::ZERO, Vec3::Y);
///
/// let hit = scene.line_trace(Vec3::Y * 100.0, Vec3::NEG_Y * 100.0, None);
/// assert!(hit.blocking_hit);
/// assert_eq!(hit.entity, Some(ground));
/// ```
#[derive(Resource, Debug, Clone, Default)]
pub struct SceneCollision {
    colliders: Vec<SceneCollider>,
}

impl SceneCollision {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collider for `entity`. An entity may own several colliders.
    pub fn insert(&mut self, entity: Entity, shape: ColliderShape) {
        let shape = match shape {
            ColliderShape::Plane { point, normal } => ColliderShape::Plane {
                point,
                normal: normal.normalize_or(Vec3::Y),
            },
            ColliderShape::Box {
                center,
                rotation,
                half_extents,
            } => ColliderShape::Box {
                center,
                rotation: rotation.normalize(),
                half_extents: half_extents.abs(),
            },
            other => other,
        };
        self.colliders.push(SceneCollider { entity, shape });
    }

    /// Remove every collider of `entity`.
    pub fn remove(&mut self, entity: Entity) {
        self.colliders.retain(|c| c.entity != entity);
    }

    pub fn clear(&mut self) {
        self.colliders.clear();
    }

    pub fn len(&self) -> usize {
        self.colliders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colliders.is_empty()
    }

    pub fn with_plane(mut self, entity: Entity, point: Vec3, normal: Vec3) -> Self {
        self.insert(entity, ColliderShape::Plane { point, normal });
        self
    }

    pub fn with_box(mut self, entity: Entity, center: Vec3, rotation: Quat, half_extents: Vec3) -> Self {
        self.insert(
            entity,
            ColliderShape::Box {
                center,
                rotation,
                half_extents,
            },
        );
        self
    }

    pub fn with_sphere(mut self, entity: Entity, center: Vec3, radius: f32) -> Self {
        self.insert(
            entity,
            ColliderShape::Sphere {
                center,
                radius: radius.max(0.0),
            },
        );
        self
    }

    pub fn with_capsule(mut self, entity: Entity, center: Vec3, rotation: Quat, shape: CapsuleShape) -> Self {
        self.insert(entity, ColliderShape::Capsule { center, rotation, shape });
        self
    }

    fn candidates(&self, ignore: Option<Entity>) -> impl Iterator<Item = &SceneCollider> {
        self.colliders.iter().filter(move |c| Some(c.entity) != ignore)
    }

    /// Sweep the segment `[a, b]` inflated by `radius` along `delta`.
    fn sweep(&self, a: Vec3, b: Vec3, radius: f32, delta: Vec3, ignore: Option<Entity>) -> Option<(Contact, &SceneCollider)> {
        let mut best: Option<(Contact, &SceneCollider)> = None;
        for collider in self.candidates(ignore) {
            let Some(contact) = advance(&collider.shape, a, b, radius, delta) else {
                continue;
            };
            if best.as_ref().map_or(true, |(current, _)| contact.precedes(current)) {
                best = Some((contact, collider));
            }
        }
        best
    }

    fn hit_result(
        &self,
        start: Vec3,
        end: Vec3,
        found: Option<(Contact, &SceneCollider)>,
    ) -> HitResult {
        let Some((contact, collider)) = found else {
            return HitResult::miss(start, end);
        };
        let delta = end - start;
        let direction = delta.normalize_or_zero();
        HitResult {
            blocking_hit: true,
            start_penetrating: contact.penetration.is_some(),
            time: contact.time,
            distance: delta.length() * contact.time,
            location: start + delta * contact.time,
            impact_point: contact.proximity.surface,
            normal: contact.proximity.normal,
            impact_normal: collider.shape.impact_normal(&contact.proximity, direction),
            trace_start: start,
            trace_end: end,
            penetration_depth: contact.penetration.unwrap_or(0.0),
            entity: Some(collider.entity),
        }
    }

    /// Build the scene from [`SceneShape`] entities and character capsules.
    pub fn from_world(world: &mut World) -> Self {
        let mut scene = Self::new();
        let mut shapes = world.query::<(Entity, &SceneShape, &Transform)>();
        for (entity, shape, transform) in shapes.iter(world) {
            scene.insert(entity, shape.collider(transform));
        }
        let mut characters = world.query_filtered::<(Entity, &CapsuleShape, &Transform), With<CharacterController>>();
        for (entity, shape, transform) in characters.iter(world) {
            scene.insert(
                entity,
                ColliderShape::Capsule {
                    center: transform.translation,
                    rotation: transform.rotation,
                    shape: *shape,
                },
            );
        }
        scene
    }
}

/// Conservative advancement of a swept segment towards one collider.
fn advance(shape: &ColliderShape, a: Vec3, b: Vec3, radius: f32, delta: Vec3) -> Option<Contact> {
    let initial = shape.proximity(a, b);
    let separation = initial.distance - radius;
    if separation < -PENETRATION_TOLERANCE {
        // Moving out of the overlap: look past this collider.
        if delta.dot(initial.normal) >= 0.0 {
            return None;
        }
        return Some(Contact {
            time: 0.0,
            proximity: initial,
            penetration: Some(-separation),
        });
    }

    let mut time = 0.0;
    let mut proximity = initial;
    for _ in 0..MAX_ADVANCE_ITERATIONS {
        let separation = proximity.distance - radius;
        let closing = -delta.dot(proximity.normal);
        if closing <= 0.0 {
            return None;
        }
        if separation <= CONTACT_TOLERANCE {
            return Some(Contact {
                time,
                proximity,
                penetration: None,
            });
        }
        time += separation / closing;
        if time > 1.0 {
            return None;
        }
        proximity = shape.proximity(a + delta * time, b + delta * time);
    }

    (proximity.distance - radius <= GRAZE_TOLERANCE).then_some(Contact {
        time,
        proximity,
        penetration: None,
    })
}

impl CollisionQuery for SceneCollision {
    fn sweep_capsule(
        &self,
        start: Vec3,
        end: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> HitResult {
        let (a, b) = shape.segment(start, rotation);
        let found = self.sweep(a, b, shape.radius, end - start, ignore);
        self.hit_result(start, end, found)
    }

    fn line_trace(&self, start: Vec3, end: Vec3, ignore: Option<Entity>) -> HitResult {
        let found = self.sweep(start, start, 0.0, end - start, ignore);
        self.hit_result(start, end, found)
    }

    fn overlap_capsule(&self, location: Vec3, rotation: Quat, shape: CapsuleShape, ignore: Option<Entity>) -> bool {
        let (a, b) = shape.segment(location, rotation);
        self.candidates(ignore)
            .any(|c| c.shape.proximity(a, b).distance - shape.radius < -PENETRATION_TOLERANCE)
    }

    fn overlapping_entities(
        &self,
        location: Vec3,
        rotation: Quat,
        shape: CapsuleShape,
        ignore: Option<Entity>,
    ) -> Vec<Entity> {
        let (a, b) = shape.segment(location, rotation);
        let mut entities = Vec::new();
        for collider in self.candidates(ignore) {
            if collider.shape.proximity(a, b).distance - shape.radius < -PENETRATION_TOLERANCE
                && !entities.contains(&collider.entity)
            {
                entities.push(collider.entity);
            }
        }
        entities
    }

    fn closest_point(&self, entity: Entity, point: Vec3) -> Option<Vec3> {
        self.colliders
            .iter()
            .filter(|c| c.entity == entity)
            .map(|c| c.shape.proximity(point, point))
            .min_by(|x, y| x.distance.total_cmp(&y.distance))
            .map(|p| if p.distance <= 0.0 { point } else { p.surface })
    }
}

// ==================== Components ====================

/// Collision of an entity in the analytic scene, placed by its
/// [`Transform`]. Scale is ignored.
#[derive(Component, Reflect, Debug, Clone, Copy, PartialEq)]
#[reflect(Component)]
pub enum SceneShape {
    /// Half-space below the plane through the origin with the local normal.
    Plane { normal: Vec3 },
    Cuboid { half_extents: Vec3 },
    Ball { radius: f32 },
}

impl SceneShape {
    pub fn collider(&self, transform: &Transform) -> ColliderShape {
        match *self {
            Self::Plane { normal } => ColliderShape::Plane {
                point: transform.translation,
                normal: transform.rotation * normal,
            },
            Self::Cuboid { half_extents } => ColliderShape::Box {
                center: transform.translation,
                rotation: transform.rotation,
                half_extents,
            },
            Self::Ball { radius } => ColliderShape::Sphere {
                center: transform.translation,
                radius,
            },
        }
    }
}

/// A body moved by the scene backend.
///
/// Bodies are point masses: impulses and forces only change linear
/// velocity, and nothing collides with them except characters.
#[derive(Component, Reflect, Debug, Clone, Copy, PartialEq)]
#[reflect(Component)]
pub struct SceneBody {
    pub linear_velocity: Vec3,
    /// Radians per second.
    pub angular_velocity: Vec3,
    pub mass: f32,
    /// Responds to impulses and forces. Kinematic bodies only follow their
    /// velocity.
    pub simulating: bool,
    pub half_extents: Option<Vec3>,
    #[reflect(ignore)]
    force: Vec3,
}

impl Default for SceneBody {
    fn default() -> Self {
        Self::kinematic()
    }
}

impl SceneBody {
    /// A body that moves with its velocity and ignores pushes.
    pub fn kinematic() -> Self {
        Self {
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass: 1.0,
            simulating: false,
            half_extents: None,
            force: Vec3::ZERO,
        }
    }

    /// A body pushed around by impulses and forces.
    pub fn simulating(mass: f32) -> Self {
        Self {
            mass: mass.max(SMALL_NUMBER),
            simulating: true,
            ..Self::kinematic()
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.linear_velocity = velocity;
        self
    }

    pub fn with_angular_velocity(mut self, angular_velocity: Vec3) -> Self {
        self.angular_velocity = angular_velocity;
        self
    }

    pub fn with_half_extents(mut self, half_extents: Vec3) -> Self {
        self.half_extents = Some(half_extents);
        self
    }

    /// Force accumulated for the next integration.
    pub fn force(&self) -> Vec3 {
        self.force
    }

    /// Advance `transform` by `delta_time` and consume the accumulated force.
    pub fn integrate(&mut self, transform: &mut Transform, delta_time: f32) {
        if self.simulating {
            self.linear_velocity += self.force / self.mass * delta_time;
        }
        self.force = Vec3::ZERO;
        transform.translation += self.linear_velocity * delta_time;
        if self.angular_velocity != Vec3::ZERO {
            transform.rotation = (Quat::from_scaled_axis(self.angular_velocity * delta_time) * transform.rotation).normalize();
        }
    }
}

// ==================== Backend ====================

/// Backend over [`SceneCollision`] and [`SceneBody`].
pub struct SceneBackend;

impl CharacterPhysicsBackend for SceneBackend {
    fn plugin() -> impl Plugin {
        ScenePhysicsPlugin
    }

    fn with_collision<R>(world: &mut World, f: impl FnOnce(&World, &dyn CollisionQuery) -> R) -> R {
        let world: &World = world;
        match world.get_resource::<SceneCollision>() {
            Some(scene) => f(world, scene),
            None => f(world, &SceneCollision::default()),
        }
    }

    fn is_simulating(world: &World, entity: Entity) -> bool {
        world.get::<SceneBody>(entity).is_some_and(|b| b.simulating)
    }

    fn is_movable(world: &World, entity: Entity) -> bool {
        world.get::<SceneBody>(entity).is_some()
    }

    fn get_mass(world: &World, entity: Entity) -> f32 {
        world.get::<SceneBody>(entity).map_or(1.0, |b| b.mass)
    }

    fn get_body_velocity(world: &World, entity: Entity) -> Vec3 {
        world
            .get::<SceneBody>(entity)
            .map_or(Vec3::ZERO, |b| b.linear_velocity)
    }

    fn get_body_angular_velocity(world: &World, entity: Entity) -> Vec3 {
        world
            .get::<SceneBody>(entity)
            .map_or(Vec3::ZERO, |b| b.angular_velocity)
    }

    fn get_half_extents(world: &World, entity: Entity) -> Option<Vec3> {
        world.get::<SceneBody>(entity).and_then(|b| b.half_extents)
    }

    fn apply_impulse_at(world: &mut World, entity: Entity, impulse: Vec3, _point: Vec3) {
        if let Some(mut body) = world.get_mut::<SceneBody>(entity) {
            if body.simulating {
                let mass = body.mass;
                body.linear_velocity += impulse / mass;
            }
        }
    }

    fn apply_force_at(world: &mut World, entity: Entity, force: Vec3, _point: Vec3) {
        if let Some(mut body) = world.get_mut::<SceneBody>(entity) {
            if body.simulating {
                body.force += force;
            }
        }
    }

    fn set_body_velocity(world: &mut World, entity: Entity, velocity: Vec3) {
        if let Some(mut body) = world.get_mut::<SceneBody>(entity) {
            body.linear_velocity = velocity;
        }
    }
}

/// Keeps [`SceneCollision`] in sync with the world and integrates
/// [`SceneBody`] entities.
pub struct ScenePhysicsPlugin;

impl Plugin for ScenePhysicsPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<SceneCollision>();
        app.register_type::<SceneShape>();
        app.register_type::<SceneBody>();
        app.add_systems(
            FixedUpdate,
            sync_scene_collision.in_set(GravityCharacterSet::Preparation),
        );
        app.add_systems(
            FixedUpdate,
            integrate_scene_bodies.in_set(GravityCharacterSet::Finalize),
        );
    }
}

/// Rebuild [`SceneCollision`] from the current transforms.
pub fn sync_scene_collision(world: &mut World) {
    let scene = SceneCollision::from_world(world);
    world.insert_resource(scene);
}

/// Move scene bodies by their velocity for one fixed step.
pub fn integrate_scene_bodies(world: &mut World) {
    let dt = SceneBackend::get_fixed_timestep(world);
    let mut bodies = world.query::<(&mut Transform, &mut SceneBody)>();
    for (mut transform, mut body) in bodies.iter_mut(world) {
        body.integrate(&mut transform, dt);
    }
}

// ==================== Body Table ====================

#[derive(Debug, Clone, Copy)]
struct BodyState {
    transform: Transform,
    linear_velocity: Vec3,
    angular_velocity: Vec3,
    mass: f32,
    movable: bool,
    simulating: bool,
    half_extents: Option<Vec3>,
}

impl Default for BodyState {
    fn default() -> Self {
        Self {
            transform: Transform::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass: 1.0,
            movable: false,
            simulating: false,
            half_extents: None,
        }
    }
}

/// [`BodyQuery`] over an explicit table, for driving movers without an ECS
/// world.
#[derive(Debug, Clone, Default)]
pub struct SceneBodies {
    bodies: HashMap<Entity, BodyState>,
    characters: HashSet<Entity>,
}

impl SceneBodies {
    pub fn new() -> Self {
        Self::default()
    }

    /// A body that never moves.
    pub fn set_static(&mut self, entity: Entity, transform: Transform) {
        let state = self.bodies.entry(entity).or_default();
        state.transform = transform;
        state.linear_velocity = Vec3::ZERO;
        state.movable = false;
        state.simulating = false;
    }

    /// A kinematic body at `transform` moving with `velocity`.
    pub fn set_movable(&mut self, entity: Entity, transform: Transform, velocity: Vec3) {
        let state = self.bodies.entry(entity).or_default();
        state.transform = transform;
        state.linear_velocity = velocity;
        state.movable = true;
        state.simulating = false;
    }

    /// A simulated body that can be pushed.
    pub fn set_simulating(&mut self, entity: Entity, transform: Transform, velocity: Vec3, mass: f32) {
        let state = self.bodies.entry(entity).or_default();
        state.transform = transform;
        state.linear_velocity = velocity;
        state.mass = mass.max(SMALL_NUMBER);
        state.movable = true;
        state.simulating = true;
    }

    pub fn set_angular_velocity(&mut self, entity: Entity, angular_velocity: Vec3) {
        self.bodies.entry(entity).or_default().angular_velocity = angular_velocity;
    }

    pub fn set_half_extents(&mut self, entity: Entity, half_extents: Vec3) {
        self.bodies.entry(entity).or_default().half_extents = Some(half_extents);
    }

    /// Mark `entity` as another character.
    pub fn set_character(&mut self, entity: Entity) {
        self.characters.insert(entity);
    }

    pub fn remove(&mut self, entity: Entity) {
        self.bodies.remove(&entity);
        self.characters.remove(&entity);
    }
}

impl BodyQuery for SceneBodies {
    fn is_character(&self, entity: Entity) -> bool {
        self.characters.contains(&entity)
    }

    fn is_movable(&self, entity: Entity) -> bool {
        self.bodies.get(&entity).is_some_and(|b| b.movable)
    }

    fn is_simulating(&self, entity: Entity) -> bool {
        self.bodies.get(&entity).is_some_and(|b| b.simulating)
    }

    fn transform(&self, entity: Entity) -> Option<Transform> {
        self.bodies.get(&entity).map(|b| b.transform)
    }

    fn linear_velocity(&self, entity: Entity) -> Vec3 {
        self.bodies.get(&entity).map_or(Vec3::ZERO, |b| b.linear_velocity)
    }

    fn angular_velocity(&self, entity: Entity) -> Vec3 {
        self.bodies.get(&entity).map_or(Vec3::ZERO, |b| b.angular_velocity)
    }

    fn mass(&self, entity: Entity) -> f32 {
        self.bodies.get(&entity).map_or(1.0, |b| b.mass)
    }

    fn half_extents(&self, entity: Entity) -> Option<Vec3> {
        self.bodies.get(&entity).and_then(|b| b.half_extents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entities(count: usize) -> Vec<Entity> {
        let mut world = World::new();
        (0..count).map(|_| world.spawn_empty().id()).collect()
    }

    fn capsule() -> CapsuleShape {
        CapsuleShape::new(10.0, 30.0)
    }

    // ==================== Sweep Tests ====================

    #[test]
    fn capsule_lands_on_plane() {
        let e = entities(1);
        let scene = SceneCollision::new().with_plane(e[0], Vec3::ZERO, Vec3::Y);
        let hit = scene.sweep_capsule(Vec3::Y * 100.0, Vec3::ZERO, Quat::IDENTITY, capsule(), None);

        assert!(hit.is_valid_blocking_hit());
        assert_eq!(hit.entity, Some(e[0]));
        assert_relative_eq!(hit.location.y, 30.0, epsilon = 1e-2);
        assert_relative_eq!(hit.time, 0.7, epsilon = 1e-3);
        assert_eq!(hit.normal, Vec3::Y);
        assert_relative_eq!(hit.impact_point.y, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn capsule_stops_at_box_face() {
        let e = entities(1);
        let scene = SceneCollision::new().with_box(e[0], Vec3::new(100.0, 0.0, 0.0), Quat::IDENTITY, Vec3::splat(50.0));
        let hit = scene.sweep_capsule(Vec3::ZERO, Vec3::X * 100.0, Quat::IDENTITY, capsule(), None);

        assert!(hit.is_valid_blocking_hit());
        assert_relative_eq!(hit.location.x, 40.0, epsilon = 1e-2);
        assert_relative_eq!(hit.normal.x, -1.0, epsilon = 1e-4);
        assert_relative_eq!(hit.impact_point.x, 50.0, epsilon = 1e-3);
    }

    #[test]
    fn flat_contact_resolves_towards_capsule_bottom() {
        let e = entities(1);
        let scene = SceneCollision::new().with_box(e[0], Vec3::new(100.0, 0.0, 0.0), Quat::IDENTITY, Vec3::splat(200.0));
        let hit = scene.sweep_capsule(Vec3::new(-300.0, 0.0, 0.0), Vec3::ZERO, Quat::IDENTITY, capsule(), None);
        assert!(hit.is_valid_blocking_hit());
        assert_relative_eq!(hit.impact_point.y, -20.0, epsilon = 1e-2);
    }

    #[test]
    fn box_edge_reports_face_against_motion() {
        let e = entities(1);
        // Step with its top at y = 20.
        let scene = SceneCollision::new().with_box(e[0], Vec3::new(100.0, 10.0, 0.0), Quat::IDENTITY, Vec3::new(50.0, 10.0, 50.0));
        let hit = scene.sweep_capsule(Vec3::new(0.0, 45.0, 0.0), Vec3::new(100.0, 45.0, 0.0), Quat::IDENTITY, capsule(), None);

        assert!(hit.is_valid_blocking_hit());
        assert_relative_eq!(hit.location.x, 50.0 - 75.0_f32.sqrt(), epsilon = 1e-2);
        assert_relative_eq!(hit.impact_point.x, 50.0, epsilon = 1e-2);
        assert_relative_eq!(hit.impact_point.y, 20.0, epsilon = 1e-2);
        assert_relative_eq!(hit.impact_normal.x, -1.0, epsilon = 1e-4);
        assert!(hit.normal.y > 0.0 && hit.normal.x < 0.0);
    }

    #[test]
    fn sphere_is_hit_head_on() {
        let e = entities(1);
        let scene = SceneCollision::new().with_sphere(e[0], Vec3::new(100.0, 0.0, 0.0), 20.0);
        let hit = scene.sweep_sphere(Vec3::ZERO, Vec3::X * 200.0, 10.0, None);
        assert!(hit.is_valid_blocking_hit());
        assert_relative_eq!(hit.location.x, 70.0, epsilon = 1e-2);
        assert_relative_eq!(hit.impact_point.x, 80.0, epsilon = 1e-2);
    }

    #[test]
    fn grazing_sweep_misses() {
        let e = entities(1);
        let scene = SceneCollision::new().with_sphere(e[0], Vec3::new(100.0, 40.0, 0.0), 20.0);
        let hit = scene.sweep_sphere(Vec3::ZERO, Vec3::X * 200.0, 10.0, None);
        assert!(!hit.blocking_hit);
        assert_eq!(hit.time, 1.0);
    }

    #[test]
    fn ignored_entity_is_skipped() {
        let e = entities(2);
        let scene = SceneCollision::new()
            .with_sphere(e[0], Vec3::X * 50.0, 10.0)
            .with_sphere(e[1], Vec3::X * 150.0, 10.0);
        let hit = scene.sweep_sphere(Vec3::ZERO, Vec3::X * 200.0, 5.0, Some(e[0]));
        assert_eq!(hit.entity, Some(e[1]));
    }

    #[test]
    fn earliest_collider_wins() {
        let e = entities(2);
        let scene = SceneCollision::new()
            .with_sphere(e[0], Vec3::X * 150.0, 10.0)
            .with_sphere(e[1], Vec3::X * 50.0, 10.0);
        let hit = scene.sweep_sphere(Vec3::ZERO, Vec3::X * 200.0, 5.0, None);
        assert_eq!(hit.entity, Some(e[1]));
    }

    // ==================== Penetration Tests ====================

    #[test]
    fn start_penetration_reports_depth() {
        let e = entities(1);
        let scene = SceneCollision::new().with_plane(e[0], Vec3::ZERO, Vec3::Y);
        let hit = scene.sweep_capsule(Vec3::Y * 25.0, Vec3::Y * 15.0, Quat::IDENTITY, capsule(), None);

        assert!(hit.blocking_hit);
        assert!(hit.start_penetrating);
        assert_eq!(hit.time, 0.0);
        assert_relative_eq!(hit.penetration_depth, 5.0, epsilon = 1e-3);
        assert_eq!(hit.normal, Vec3::Y);
    }

    #[test]
    fn moving_out_of_penetration_is_free() {
        let e = entities(2);
        let scene = SceneCollision::new()
            .with_plane(e[0], Vec3::ZERO, Vec3::Y)
            .with_sphere(e[1], Vec3::new(0.0, 200.0, 0.0), 10.0);
        let hit = scene.sweep_capsule(Vec3::Y * 25.0, Vec3::Y * 300.0, Quat::IDENTITY, capsule(), None);

        assert!(!hit.start_penetrating);
        assert_eq!(hit.entity, Some(e[1]));
        assert_relative_eq!(hit.location.y, 160.0, epsilon = 1e-2);
    }

    // ==================== Trace And Overlap Tests ====================

    #[test]
    fn line_trace_hits_rotated_box() {
        let e = entities(1);
        let rotation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_4);
        let scene = SceneCollision::new().with_box(e[0], Vec3::ZERO, rotation, Vec3::splat(10.0));
        let hit = scene.line_trace(Vec3::Y * 100.0, Vec3::NEG_Y * 100.0, None);

        assert!(hit.is_valid_blocking_hit());
        assert_relative_eq!(hit.impact_point.y, 10.0 * std::f32::consts::SQRT_2, epsilon = 1e-2);
    }

    #[test]
    fn overlap_detects_intersection_only() {
        let e = entities(1);
        let scene = SceneCollision::new().with_sphere(e[0], Vec3::X * 15.0, 10.0);
        assert!(scene.overlap_capsule(Vec3::ZERO, Quat::IDENTITY, capsule(), None));
        assert!(!scene.overlap_capsule(Vec3::X * -10.0, Quat::IDENTITY, capsule(), None));
        assert!(!scene.overlap_capsule(Vec3::ZERO, Quat::IDENTITY, capsule(), Some(e[0])));
        assert_eq!(scene.overlapping_entities(Vec3::ZERO, Quat::IDENTITY, capsule(), None), vec![e[0]]);
    }

    #[test]
    fn closest_point_on_surface_or_inside() {
        let e = entities(2);
        let scene = SceneCollision::new().with_box(e[0], Vec3::ZERO, Quat::IDENTITY, Vec3::splat(10.0));
        assert_eq!(scene.closest_point(e[0], Vec3::new(30.0, 5.0, 0.0)), Some(Vec3::new(10.0, 5.0, 0.0)));
        assert_eq!(scene.closest_point(e[0], Vec3::new(1.0, 2.0, 3.0)), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(scene.closest_point(e[1], Vec3::ZERO), None);
    }

    #[test]
    fn other_characters_block_sweeps() {
        let e = entities(1);
        let scene = SceneCollision::new().with_capsule(e[0], Vec3::X * 100.0, Quat::IDENTITY, capsule());
        let hit = scene.sweep_capsule(Vec3::ZERO, Vec3::X * 100.0, Quat::IDENTITY, capsule(), None);
        assert!(hit.is_valid_blocking_hit());
        assert_relative_eq!(hit.location.x, 80.0, epsilon = 1e-2);
    }

    // ==================== Body Tests ====================

    #[test]
    fn scene_shapes_sync_from_world() {
        let mut world = World::new();
        let ground = world
            .spawn((Transform::default(), SceneShape::Plane { normal: Vec3::Y }))
            .id();
        let character = world
            .spawn((
                Transform::from_xyz(0.0, 50.0, 0.0),
                CapsuleShape::default(),
                CharacterController::default(),
            ))
            .id();
        sync_scene_collision(&mut world);

        let scene = world.resource::<SceneCollision>();
        assert_eq!(scene.len(), 2);
        let hit = scene.line_trace(Vec3::new(0.0, 500.0, 0.0), Vec3::new(0.0, -10.0, 0.0), None);
        assert_eq!(hit.entity, Some(character));
        let hit = scene.line_trace(Vec3::new(0.0, 500.0, 0.0), Vec3::new(0.0, -10.0, 0.0), Some(character));
        assert_eq!(hit.entity, Some(ground));
    }

    #[test]
    fn simulated_body_integrates_force() {
        let mut body = SceneBody::simulating(2.0).with_velocity(Vec3::X);
        let mut transform = Transform::default();
        body.force = Vec3::Y * 4.0;
        body.integrate(&mut transform, 0.5);

        assert_eq!(body.linear_velocity, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(transform.translation, Vec3::new(0.5, 0.5, 0.0));
        assert_eq!(body.force(), Vec3::ZERO);
    }

    #[test]
    fn kinematic_body_ignores_pushes() {
        let mut world = World::new();
        let body = world.spawn(SceneBody::kinematic().with_velocity(Vec3::X)).id();
        SceneBackend::apply_impulse_at(&mut world, body, Vec3::Y * 100.0, Vec3::ZERO);
        assert_eq!(SceneBackend::get_body_velocity(&world, body), Vec3::X);
        assert!(SceneBackend::is_movable(&world, body));
        assert!(!SceneBackend::is_simulating(&world, body));
    }

    #[test]
    fn body_table_answers_queries() {
        let e = entities(2);
        let mut bodies = SceneBodies::new();
        bodies.set_simulating(e[0], Transform::from_xyz(1.0, 0.0, 0.0), Vec3::Y, 3.0);
        bodies.set_character(e[1]);

        assert!(bodies.is_simulating(e[0]));
        assert!(bodies.is_movable(e[0]));
        assert_eq!(bodies.mass(e[0]), 3.0);
        assert!(bodies.is_character(e[1]));
        assert!(!bodies.is_movable(e[1]));
        bodies.remove(e[0]);
        assert_eq!(bodies.transform(e[0]), None);
    }
}
