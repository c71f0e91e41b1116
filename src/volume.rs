//! Physics volumes.
//!
//! A [`PhysicsVolume`] is an axis-aligned box around its entity's
//! translation. Characters whose capsule center is inside it use its fluid
//! friction and terminal velocity, swim when it is water, and take over its
//! gravity configuration on entry.

use bevy::prelude::*;

use crate::events::MovementEvent;
use crate::gravity::{GravityField, GravitySourceProvider, WorldGravity};
use crate::math::plane_project;
use crate::movement::CharacterMover;
use crate::state::MovementMode;

/// Offset used to place a character just inside or outside a water surface.
const WATER_LINE_OFFSET: f32 = 0.1;

/// A region that changes how characters move inside it.
#[derive(Component, Reflect, Debug, Clone)]
#[reflect(Component)]
pub struct PhysicsVolume {
    /// Half size of the box, centered on the entity translation.
    pub half_extents: Vec3,
    /// The highest priority wins where volumes overlap.
    pub priority: i32,
    /// Characters swim inside water volumes.
    pub water: bool,
    pub fluid_friction: f32,
    /// Speed limit along gravity.
    pub terminal_velocity: f32,
    /// Gravity copied into characters entering the volume.
    pub gravity: Option<GravityField>,
    /// Launch velocity applied to walking characters on entry.
    pub fall_velocity: Vec3,
    /// Leaving this volume for no volume restores default gravity.
    pub revert_gravity_on_exit: bool,
}

impl Default for PhysicsVolume {
    fn default() -> Self {
        Self {
            half_extents: Vec3::splat(500.0),
            priority: 0,
            water: false,
            fluid_friction: 0.3,
            terminal_velocity: 4000.0,
            gravity: None,
            fall_velocity: Vec3::ZERO,
            revert_gravity_on_exit: false,
        }
    }
}

impl PhysicsVolume {
    pub fn new(half_extents: Vec3) -> Self {
        Self {
            half_extents,
            ..default()
        }
    }

    /// A water volume.
    pub fn water(half_extents: Vec3) -> Self {
        Self {
            half_extents,
            water: true,
            fluid_friction: 2.0,
            ..default()
        }
    }

    /// Builder: gravity applied to characters entering the volume.
    pub fn with_gravity(mut self, gravity: GravityField) -> Self {
        self.gravity = Some(gravity);
        self
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_terminal_velocity(mut self, terminal_velocity: f32) -> Self {
        self.terminal_velocity = terminal_velocity;
        self
    }

    pub fn with_fall_velocity(mut self, fall_velocity: Vec3) -> Self {
        self.fall_velocity = fall_velocity;
        self
    }

    pub fn with_revert_gravity_on_exit(mut self, revert: bool) -> Self {
        self.revert_gravity_on_exit = revert;
        self
    }
}

/// Marks a simulated body that takes the gravity of the volume it is in.
#[derive(Component, Reflect, Debug, Clone, Copy, Default)]
#[reflect(Component)]
pub struct VolumeGravityBody;

/// A volume placed in the world.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub entity: Entity,
    pub center: Vec3,
    pub volume: PhysicsVolume,
}

impl VolumeInfo {
    pub fn new(entity: Entity, center: Vec3, volume: PhysicsVolume) -> Self {
        Self {
            entity,
            center,
            volume,
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.volume.half_extents
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.volume.half_extents
    }

    pub fn contains(&self, point: Vec3) -> bool {
        let local = (point - self.center).abs();
        local.cmple(self.volume.half_extents).all()
    }

    /// Fraction along `start..end` where the segment enters the box. `None`
    /// when it starts inside or never enters.
    pub fn segment_entry(&self, start: Vec3, end: Vec3) -> Option<f32> {
        if self.contains(start) {
            return None;
        }
        let delta = end - start;
        let (min, max) = (self.min(), self.max());
        let mut t_enter = 0.0f32;
        let mut t_exit = 1.0f32;
        for axis in 0..3 {
            let (s, d) = (start[axis], delta[axis]);
            if d.abs() < f32::EPSILON {
                if s < min[axis] || s > max[axis] {
                    return None;
                }
                continue;
            }
            let t0 = (min[axis] - s) / d;
            let t1 = (max[axis] - s) / d;
            t_enter = t_enter.max(t0.min(t1));
            t_exit = t_exit.min(t0.max(t1));
            if t_enter > t_exit {
                return None;
            }
        }
        Some(t_enter)
    }

    /// How deep a capsule of `half_height` at `location` is immersed, with
    /// "down" along `gravity_dir`. 1 when the capsule top is inside, 0 when
    /// the capsule does not reach the volume.
    pub fn immersion(&self, location: Vec3, half_height: f32, gravity_dir: Vec3) -> f32 {
        if half_height <= 0.0 {
            return 1.0;
        }
        let top = location - gravity_dir * half_height;
        let bottom = location + gravity_dir * half_height;
        if self.contains(top) {
            return 1.0;
        }
        self.segment_entry(top, bottom).map_or(0.0, |t| 1.0 - t)
    }

    /// Gravity acceleration inside the volume at `location`. Volumes without
    /// their own gravity use world gravity.
    pub fn gravity_at(&self, location: Vec3, sources: &dyn GravitySourceProvider, world: &WorldGravity) -> Vec3 {
        match &self.volume.gravity {
            Some(field) => {
                let mut field = field.clone();
                field.resample(location, sources);
                field.gravity(location, world)
            }
            None => Vec3::Y * world.gravity_y,
        }
    }
}

/// Gravity at `location`: that of the volume containing it, or world gravity.
pub fn gravity_at(
    volumes: &[VolumeInfo],
    location: Vec3,
    sources: &dyn GravitySourceProvider,
    world: &WorldGravity,
) -> Vec3 {
    volume_at(volumes, location).map_or(Vec3::Y * world.gravity_y, |v| v.gravity_at(location, sources, world))
}

/// Volume containing `point` with the highest priority. Earlier volumes win
/// ties.
pub fn volume_at(volumes: &[VolumeInfo], point: Vec3) -> Option<&VolumeInfo> {
    volumes
        .iter()
        .filter(|v| v.contains(point))
        .fold(None, |best: Option<&VolumeInfo>, v| match best {
            Some(b) if b.volume.priority >= v.volume.priority => Some(b),
            _ => Some(v),
        })
}

impl CharacterMover<'_> {
    /// Re-evaluate the volume the capsule center is in.
    pub fn update_physics_volume(&mut self) {
        let env = self.env;
        let new = volume_at(env.volumes, self.agent.location);
        let new_entity = new.map(|v| v.entity);
        if new_entity == self.agent.controller.current_volume {
            return;
        }
        let old = self.physics_volume();
        self.agent.controller.current_volume = new_entity;
        trace!("{:?} entered volume {:?}", self.agent.entity, new_entity);
        self.physics_volume_changed(old, new);
    }

    /// React to entering `new` after leaving `old`.
    pub fn physics_volume_changed(&mut self, old: Option<&VolumeInfo>, new: Option<&VolumeInfo>) {
        match new {
            Some(info) => {
                if let Some(gravity) = &info.volume.gravity {
                    if self.agent.gravity.copy_configuration(gravity, Some(info.entity)) {
                        self.refresh_gravity();
                    }
                }
            }
            None => {
                let revert = self.orientation.revert_to_default_gravity
                    || old.is_some_and(|v| v.volume.revert_gravity_on_exit);
                if revert {
                    let down = self.env.world_gravity.fallback_direction(1.0);
                    if self.agent.gravity.set_fixed_direction(down) {
                        self.refresh_gravity();
                    }
                }
            }
        }

        if let Some(info) = new {
            if info.volume.fall_velocity != Vec3::ZERO && self.is_moving_on_ground() {
                self.agent.controller.launch(info.volume.fall_velocity, false, false);
            }
        }

        if new.is_some_and(|v| v.volume.water) {
            if !self.can_ever_swim() {
                self.notify(MovementEvent::UnableToMove);
            } else if !self.is_swimming() {
                self.set_movement_mode(MovementMode::Swimming);
            }
        } else if self.is_swimming() {
            self.set_movement_mode(MovementMode::Falling);

            // Climbing out of the water at a ledge.
            let up = -self.gravity_direction(true);
            let acceleration = self.agent.controller.acceleration;
            if acceleration.dot(up) > 0.0 {
                if let Some(jump_dir) = self.should_jump_out_of_water() {
                    if jump_dir.dot(acceleration) > 0.0 {
                        if let Some(wall_normal) = self.check_water_jump(jump_dir) {
                            self.jump_out_of_water(wall_normal);
                        }
                    }
                }
            }
        }
    }

    /// Immersion of the capsule in the current volume. 0 outside water.
    pub fn immersion_depth(&self) -> f32 {
        let Some(info) = self.physics_volume().filter(|v| v.volume.water) else {
            return 0.0;
        };
        if self.config.buoyancy == 0.0 {
            return 1.0;
        }
        let gravity_dir = self.gravity_direction(true);
        info.immersion(self.agent.location, self.agent.shape.half_height, gravity_dir)
    }

    /// Point on the water surface between `in_water` and `out_of_water`,
    /// nudged towards the side of the current volume. `out_of_water` when
    /// no water surface lies between them.
    pub fn find_water_line(&self, in_water: Vec3, out_of_water: Vec3) -> Vec3 {
        let env = self.env;
        let dir = (in_water - out_of_water).normalize_or_zero();
        let current = self.agent.controller.current_volume;

        let surface = env
            .volumes
            .iter()
            .filter(|v| v.volume.water)
            .filter_map(|v| v.segment_entry(out_of_water, in_water).map(|t| (t, v)))
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match surface {
            Some((t, info)) => {
                let point = out_of_water.lerp(in_water, t);
                if Some(info.entity) == current {
                    point + dir * WATER_LINE_OFFSET
                } else {
                    point - dir * WATER_LINE_OFFSET
                }
            }
            None => out_of_water,
        }
    }

    /// Velocity along gravity after leaving the water, keeping the part
    /// across it.
    pub(crate) fn out_of_water_velocity(&self) -> Vec3 {
        let gravity_dir = self.gravity_direction(true);
        plane_project(self.agent.controller.velocity, gravity_dir) - gravity_dir * self.config.out_of_water_z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entities() -> (Entity, Entity) {
        let mut world = World::new();
        (world.spawn_empty().id(), world.spawn_empty().id())
    }

    fn water_box() -> VolumeInfo {
        VolumeInfo::new(entities().0, Vec3::new(0.0, -500.0, 0.0), PhysicsVolume::water(Vec3::splat(500.0)))
    }

    // ==================== VolumeInfo Tests ====================

    #[test]
    fn contains_is_inclusive() {
        let water = water_box();
        assert!(water.contains(Vec3::ZERO));
        assert!(water.contains(Vec3::new(0.0, -1.0, 0.0)));
        assert!(!water.contains(Vec3::new(0.0, 1.0, 0.0)));
    }

    #[test]
    fn segment_entry_finds_surface() {
        let water = water_box();
        let t = water.segment_entry(Vec3::new(0.0, 100.0, 0.0), Vec3::new(0.0, -100.0, 0.0));
        assert_relative_eq!(t.unwrap_or(-1.0), 0.5);
    }

    #[test]
    fn segment_entry_misses_parallel_segment() {
        let water = water_box();
        assert!(water
            .segment_entry(Vec3::new(-1000.0, 10.0, 0.0), Vec3::new(1000.0, 10.0, 0.0))
            .is_none());
    }

    #[test]
    fn immersion_is_linear_across_capsule() {
        let water = water_box();
        let down = Vec3::NEG_Y;
        assert_relative_eq!(water.immersion(Vec3::new(0.0, -200.0, 0.0), 88.0, down), 1.0);
        assert_relative_eq!(water.immersion(Vec3::new(0.0, 44.0, 0.0), 88.0, down), 0.25, epsilon = 1e-4);
        assert_relative_eq!(water.immersion(Vec3::new(0.0, 200.0, 0.0), 88.0, down), 0.0);
    }

    #[test]
    fn immersion_follows_gravity() {
        // Sideways gravity: the surface is the +X face.
        let water = VolumeInfo::new(entities().0, Vec3::new(-500.0, 0.0, 0.0), PhysicsVolume::water(Vec3::splat(500.0)));
        let depth = water.immersion(Vec3::ZERO, 88.0, Vec3::NEG_X);
        assert_relative_eq!(depth, 0.5, epsilon = 1e-4);
    }

    #[test]
    fn highest_priority_volume_wins() {
        let (a, b) = entities();
        let low = VolumeInfo::new(a, Vec3::ZERO, PhysicsVolume::new(Vec3::splat(100.0)));
        let high = VolumeInfo::new(
            b,
            Vec3::ZERO,
            PhysicsVolume::new(Vec3::splat(50.0)).with_priority(3),
        );
        let volumes = [low, high];
        assert_eq!(volume_at(&volumes, Vec3::ZERO).map(|v| v.entity), Some(b));
        assert_eq!(volume_at(&volumes, Vec3::splat(80.0)).map(|v| v.entity), Some(a));
        assert!(volume_at(&volumes, Vec3::splat(200.0)).is_none());
    }

    // ==================== Volume Gravity Tests ====================

    #[test]
    fn volume_gravity_overrides_world() {
        let (a, b) = entities();
        let world = WorldGravity::default();
        let sideways = VolumeInfo::new(
            a,
            Vec3::ZERO,
            PhysicsVolume::new(Vec3::splat(100.0)).with_gravity(GravityField::fixed(Vec3::X)),
        );
        let plain = VolumeInfo::new(b, Vec3::X * 1000.0, PhysicsVolume::new(Vec3::splat(100.0)));
        let volumes = [sideways, plain];
        let sources = crate::gravity::NoGravitySources;

        let inside = gravity_at(&volumes, Vec3::ZERO, &sources, &world);
        assert_relative_eq!(inside.x, 980.0, epsilon = 1e-3);
        assert_relative_eq!(inside.y, 0.0, epsilon = 1e-3);
        assert_eq!(gravity_at(&volumes, Vec3::X * 1000.0, &sources, &world), Vec3::NEG_Y * 980.0);
        assert_eq!(gravity_at(&volumes, Vec3::splat(5000.0), &sources, &world), Vec3::NEG_Y * 980.0);
    }
}
