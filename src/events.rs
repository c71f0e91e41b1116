//! Movement notifications.
//!
//! The movement step never calls back into user code. It pushes
//! [`MovementEvent`]s into the character's [`MovementEvents`] queue, which
//! the owner drains after the step. Every event is pushed once per actual
//! change; no-op requests push nothing.

use bevy::prelude::*;

use crate::collision::HitResult;
use crate::gravity::GravityMode;
use crate::state::MovementMode;

/// Something that happened during a movement step.
#[derive(Debug, Clone, PartialEq)]
pub enum MovementEvent {
    /// Gravity configuration changed.
    GravityChanged {
        old_mode: GravityMode,
        new_mode: GravityMode,
    },
    /// Movement mode changed.
    MovementModeChanged {
        previous: MovementMode,
        current: MovementMode,
    },
    /// Touched down on a walkable floor.
    Landed { hit: HitResult },
    /// Vertical velocity crossed zero during a jump.
    JumpApex,
    /// Hit a surface that cannot be walked on.
    UnwalkableHit { hit: HitResult },
    /// Started falling from the ground.
    StartedFalling,
    /// Movement was blocked by an obstacle. Path followers react to this.
    MoveBlocked { hit: HitResult },
    /// Entered a mode the character cannot use, such as water without
    /// swimming.
    UnableToMove,
    /// Walked off a ledge.
    WalkedOffLedge {
        previous_floor_normal: Vec3,
        previous_location: Vec3,
    },
    /// Could not resolve an initial penetration.
    StuckInGeometry { hit: HitResult },
    /// Capsule up axis changed.
    OrientationChanged { old_up: Vec3, new_up: Vec3 },
    /// A server correction was applied.
    ClientCorrectionReceived {
        location: Vec3,
        velocity: Vec3,
        mode: MovementMode,
    },
}

/// Queue of movement events for one character.
#[derive(Component, Debug, Clone, Default)]
pub struct MovementEvents {
    events: Vec<MovementEvent>,
}

impl MovementEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: MovementEvent) {
        trace!("movement event: {:?}", event);
        self.events.push(event);
    }

    /// Take every queued event.
    pub fn drain(&mut self) -> impl Iterator<Item = MovementEvent> + '_ {
        self.events.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MovementEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of queued events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&MovementEvent) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(e)).count()
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = MovementEvent>) {
        self.events.extend(events);
    }
}
