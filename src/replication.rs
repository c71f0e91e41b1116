//! Replication of character movement.
//!
//! The core does not own a transport. It exposes the state a transport
//! needs and applies the state a transport delivers:
//!
//! - [`MovementSnapshot`]: the complete replicated state of one character,
//!   versioned. [`ReplicatedMovement`] captures snapshots on the authority
//!   and applies them on simulated proxies, rejecting stale ones.
//! - [`SavedMoves`]: the client's unacknowledged predicted moves.
//! - [`ClientAdjustment`]: a server correction. The client applies it with
//!   [`CharacterMover::apply_client_adjustment`], which replays the pending
//!   moves on top of the corrected state.
//! - [`ServerMoveCheck`]: compares a client's reported move with the
//!   server's result and produces the adjustment to send back.

use std::collections::VecDeque;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BodyQuery;
use crate::events::MovementEvent;
use crate::gravity::{GravityField, GravityMode};
use crate::math::{make_from_up_quat, up_axis};
use crate::movement::{CharacterAgent, CharacterMover};
use crate::state::{pack_movement_mode, unpack_movement_mode, MovementMode};

/// Squared distance between client and server locations that still counts
/// as agreement.
pub const MAX_POSITION_ERROR_SQUARED: f32 = 3.0;

/// Saved moves kept before the oldest are dropped.
pub const MAX_SAVED_MOVES: usize = 96;

/// Why a server correction could not be applied.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CorrectionError {
    #[error("movement base {0:?} of a base-relative correction is unknown")]
    UnresolvedBase(Entity),
    #[error("no saved move with timestamp {timestamp}")]
    UnknownMove { timestamp: f32 },
    #[error("correction contains non-finite values")]
    NonFinite,
}

/// Why a replicated snapshot was rejected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot version {received} is not newer than {current}")]
    Stale { received: u32, current: u32 },
    #[error("snapshot contains non-finite values")]
    NonFinite,
}

// ==================== Snapshots ====================

/// Replicated gravity configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GravitySnapshot {
    pub mode: GravityMode,
    pub vector_a: Vec3,
    pub vector_b: Vec3,
    pub source: Option<Entity>,
    pub scale: f32,
}

impl GravitySnapshot {
    pub fn capture(field: &GravityField) -> Self {
        Self {
            mode: field.mode(),
            vector_a: field.vector_a(),
            vector_b: field.vector_b(),
            source: field.source(),
            scale: field.scale(),
        }
    }

    /// Copy this configuration into `field`. Returns whether anything
    /// changed.
    pub fn apply_to(&self, field: &mut GravityField) -> bool {
        let incoming = GravityField::from_parts(self.mode, self.vector_a, self.vector_b, self.source, self.scale);
        field.copy_configuration(&incoming, None)
    }
}

/// Complete replicated movement state of one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementSnapshot {
    pub version: u32,
    /// Capsule center.
    pub location: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    /// See [`pack_movement_mode`].
    pub packed_mode: u8,
    pub movement_base: Option<Entity>,
    /// Absent when gravity replication is disabled.
    pub gravity: Option<GravitySnapshot>,
}

impl MovementSnapshot {
    pub fn capture(agent: &CharacterAgent, version: u32, include_gravity: bool) -> Self {
        let controller = &agent.controller;
        Self {
            version,
            location: agent.location,
            rotation: agent.rotation,
            velocity: controller.velocity,
            packed_mode: pack_movement_mode(controller.movement_mode(), controller.ground_mode()),
            movement_base: controller.movement_base,
            gravity: include_gravity.then(|| GravitySnapshot::capture(&agent.gravity)),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.location.is_finite()
            && self.rotation.is_finite()
            && self.velocity.is_finite()
            && self.gravity.is_none_or(|g| g.vector_a.is_finite() && g.vector_b.is_finite() && g.scale.is_finite())
    }

    /// Same state, ignoring the version.
    fn same_state(&self, other: &Self) -> bool {
        self.location == other.location
            && self.rotation == other.rotation
            && self.velocity == other.velocity
            && self.packed_mode == other.packed_mode
            && self.movement_base == other.movement_base
            && self.gravity == other.gravity
    }
}

/// Replication state of one character.
///
/// On the authority, [`capture`](Self::capture) records a new snapshot
/// whenever the state changed and marks it dirty for the transport. On a
/// proxy, snapshots handed to [`receive`](Self::receive) are applied before
/// the next movement step; only snapshots newer than the last one applied
/// are accepted.
#[derive(Component, Debug, Clone, Default)]
pub struct ReplicatedMovement {
    authority: bool,
    snapshot: Option<MovementSnapshot>,
    incoming: Option<MovementSnapshot>,
    dirty: bool,
}

impl ReplicatedMovement {
    /// State is simulated here and captured for others.
    pub fn authority() -> Self {
        Self {
            authority: true,
            ..default()
        }
    }

    /// State comes from the authority.
    pub fn proxy() -> Self {
        Self::default()
    }

    pub fn is_authority(&self) -> bool {
        self.authority
    }

    /// Last captured or applied snapshot.
    pub fn snapshot(&self) -> Option<&MovementSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn version(&self) -> u32 {
        self.snapshot.as_ref().map_or(0, |s| s.version)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, returning its previous value.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Record the agent's state. Returns whether it changed since the last
    /// capture; unchanged state keeps the version.
    pub fn capture(&mut self, agent: &CharacterAgent, include_gravity: bool) -> bool {
        let next = self.version().wrapping_add(1);
        let snapshot = MovementSnapshot::capture(agent, next, include_gravity);
        if self.snapshot.as_ref().is_some_and(|s| s.same_state(&snapshot)) {
            return false;
        }
        self.snapshot = Some(snapshot);
        self.dirty = true;
        true
    }

    /// Queue a snapshot from the transport. Of several queued snapshots the
    /// newest wins.
    pub fn receive(&mut self, snapshot: MovementSnapshot) {
        if self.incoming.as_ref().is_some_and(|s| s.version >= snapshot.version) {
            return;
        }
        self.incoming = Some(snapshot);
    }

    /// Apply the queued snapshot, if any.
    pub fn apply_incoming(&mut self, mover: &mut CharacterMover) -> Option<Result<(), SnapshotError>> {
        let snapshot = self.incoming.take()?;
        Some(self.apply(snapshot, mover))
    }

    /// Apply a snapshot received from the authority.
    pub fn apply(&mut self, snapshot: MovementSnapshot, mover: &mut CharacterMover) -> Result<(), SnapshotError> {
        if !snapshot.is_finite() {
            return Err(SnapshotError::NonFinite);
        }
        if let Some(current) = &self.snapshot {
            if snapshot.version <= current.version {
                return Err(SnapshotError::Stale {
                    received: snapshot.version,
                    current: current.version,
                });
            }
        }
        mover.apply_snapshot(&snapshot);
        self.snapshot = Some(snapshot);
        Ok(())
    }
}

// ==================== Saved Moves ====================

/// One predicted client move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavedMove {
    pub timestamp: f32,
    pub delta_time: f32,
    /// Input direction with the speed multiplier applied.
    pub input: Vec3,
    pub jump_pressed: bool,
    pub crouch_pressed: bool,
    /// Capsule center after the move.
    pub location: Vec3,
    pub packed_mode: u8,
    pub movement_base: Option<Entity>,
}

impl SavedMove {
    /// Record the move the agent just made.
    pub fn capture(agent: &CharacterAgent, timestamp: f32, delta_time: f32) -> Self {
        let controller = &agent.controller;
        Self {
            timestamp,
            delta_time,
            input: agent.intent.effective_input(),
            jump_pressed: agent.intent.jump_pressed,
            crouch_pressed: agent.intent.crouch_pressed,
            location: agent.location,
            packed_mode: pack_movement_mode(controller.movement_mode(), controller.ground_mode()),
            movement_base: controller.movement_base,
        }
    }
}

/// Moves the server has not acknowledged yet, oldest first.
#[derive(Component, Debug, Clone)]
pub struct SavedMoves {
    moves: VecDeque<SavedMove>,
    capacity: usize,
}

impl Default for SavedMoves {
    fn default() -> Self {
        Self::with_capacity(MAX_SAVED_MOVES)
    }
}

impl SavedMoves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            moves: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a move, dropping the oldest when full.
    pub fn push(&mut self, saved: SavedMove) {
        if self.moves.len() == self.capacity {
            self.moves.pop_front();
        }
        self.moves.push_back(saved);
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn clear(&mut self) {
        self.moves.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SavedMove> {
        self.moves.iter()
    }

    pub fn find(&self, timestamp: f32) -> Option<&SavedMove> {
        self.moves.iter().find(|m| m.timestamp == timestamp)
    }

    /// Drop the move with `timestamp` and everything older. Returns the
    /// acknowledged move, or `None` if no move has that timestamp.
    pub fn acknowledge(&mut self, timestamp: f32) -> Option<SavedMove> {
        let index = self.moves.iter().position(|m| m.timestamp == timestamp)?;
        let acked = self.moves[index];
        self.moves.drain(..=index);
        Some(acked)
    }
}

/// Client-side prediction state: the clock, the moves not yet acknowledged
/// and the server responses waiting to be applied.
#[derive(Component, Debug, Clone, Default)]
pub struct ClientPrediction {
    pub moves: SavedMoves,
    clock: f32,
    incoming: VecDeque<ClientAdjustment>,
}

impl ClientPrediction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated time of the last recorded move.
    pub fn clock(&self) -> f32 {
        self.clock
    }

    /// Save the move the agent just made and return its timestamp.
    pub fn record(&mut self, agent: &CharacterAgent, delta_time: f32) -> f32 {
        self.clock += delta_time;
        self.moves.push(SavedMove::capture(agent, self.clock, delta_time));
        self.clock
    }

    /// Queue a server response from the transport.
    pub fn receive(&mut self, adjustment: ClientAdjustment) {
        self.incoming.push_back(adjustment);
    }

    pub fn has_incoming(&self) -> bool {
        !self.incoming.is_empty()
    }

    /// Apply one server response. See
    /// [`CharacterMover::apply_client_adjustment`].
    pub fn apply_correction(
        &mut self,
        mover: &mut CharacterMover,
        adjustment: &ClientAdjustment,
    ) -> Result<usize, CorrectionError> {
        mover.apply_client_adjustment(adjustment, &mut self.moves)
    }

    /// Apply every queued response in arrival order. Failed corrections are
    /// logged and skipped.
    pub fn apply_incoming(&mut self, mover: &mut CharacterMover) {
        while let Some(adjustment) = self.incoming.pop_front() {
            if let Err(error) = self.apply_correction(mover, &adjustment) {
                debug!("dropped correction for {:?}: {}", mover.agent.entity, error);
            }
        }
    }
}

// ==================== Corrections ====================

/// Server response to a client move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientAdjustment {
    /// Timestamp of the client move this answers.
    pub timestamp: f32,
    /// Capsule center, relative to the base location when
    /// `base_relative_position` is set.
    pub location: Vec3,
    pub velocity: Vec3,
    /// Capsule up axis.
    pub up_axis: Vec3,
    pub packed_mode: u8,
    pub movement_base: Option<Entity>,
    pub base_relative_position: bool,
    /// The move was fine; only acknowledge it.
    pub ack_good_move: bool,
}

impl ClientAdjustment {
    /// Acknowledge the move at `timestamp` without correcting anything.
    pub fn good_move(timestamp: f32) -> Self {
        Self {
            timestamp,
            location: Vec3::ZERO,
            velocity: Vec3::ZERO,
            up_axis: Vec3::Y,
            packed_mode: 0,
            movement_base: None,
            base_relative_position: false,
            ack_good_move: true,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.location.is_finite() && self.velocity.is_finite() && self.up_axis.is_finite()
    }
}

/// A client's report of one move, as received by the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientMoveReport {
    pub timestamp: f32,
    /// Capsule center after the move, relative to the base location when
    /// the base is movable.
    pub location: Vec3,
    pub movement_base: Option<Entity>,
    pub packed_mode: u8,
}

/// Server-side validation of client moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerMoveCheck {
    pub max_position_error_squared: f32,
    /// Also correct clients that report a different movement mode.
    pub check_movement_mode: bool,
}

impl Default for ServerMoveCheck {
    fn default() -> Self {
        Self {
            max_position_error_squared: MAX_POSITION_ERROR_SQUARED,
            check_movement_mode: true,
        }
    }
}

impl ServerMoveCheck {
    /// Whether the client's result disagrees with the server's `agent`.
    pub fn client_error(&self, agent: &CharacterAgent, bodies: &dyn BodyQuery, report: &ClientMoveReport) -> bool {
        let mut client_location = report.location;
        if let Some(base) = report.movement_base {
            if bodies.is_movable(base) {
                if let Some(transform) = bodies.transform(base) {
                    client_location += transform.translation;
                }
            }
        }
        if agent.location.distance_squared(client_location) > self.max_position_error_squared {
            return true;
        }
        let controller = &agent.controller;
        self.check_movement_mode
            && report.packed_mode != pack_movement_mode(controller.movement_mode(), controller.ground_mode())
    }

    /// Compare the client's move with the server's result in `agent` and
    /// build the response.
    pub fn verify_client_move(
        &self,
        agent: &CharacterAgent,
        bodies: &dyn BodyQuery,
        report: &ClientMoveReport,
    ) -> ClientAdjustment {
        if !self.client_error(agent, bodies, report) {
            return ClientAdjustment::good_move(report.timestamp);
        }

        let controller = &agent.controller;
        let base = controller.movement_base;
        let base_translation = base
            .filter(|&b| bodies.is_movable(b))
            .and_then(|b| bodies.transform(b))
            .map(|t| t.translation);
        debug!(
            "correcting {:?} at {}: server {:?}, client {:?}",
            agent.entity, report.timestamp, agent.location, report.location
        );

        ClientAdjustment {
            timestamp: report.timestamp,
            location: agent.location - base_translation.unwrap_or(Vec3::ZERO),
            velocity: controller.velocity,
            up_axis: up_axis(agent.rotation),
            packed_mode: pack_movement_mode(controller.movement_mode(), controller.ground_mode()),
            movement_base: base,
            base_relative_position: base_translation.is_some(),
            ack_good_move: false,
        }
    }
}

impl CharacterMover<'_> {
    /// Apply a server response and replay the moves made since.
    ///
    /// Good moves are only acknowledged. A correction snaps the agent to
    /// the server state and replays every newer saved move, returning how
    /// many were replayed. Corrections relative to a base that does not
    /// exist locally are ignored; absolute ones fall back to basing on the
    /// floor found at the corrected location.
    pub fn apply_client_adjustment(
        &mut self,
        adjustment: &ClientAdjustment,
        moves: &mut SavedMoves,
    ) -> Result<usize, CorrectionError> {
        if adjustment.ack_good_move {
            moves.acknowledge(adjustment.timestamp);
            return Ok(0);
        }
        if !adjustment.is_finite() {
            return Err(CorrectionError::NonFinite);
        }

        let base_transform = adjustment.movement_base.map(|b| (b, self.env.bodies.transform(b)));
        let unresolved_base = match base_transform {
            Some((base, None)) => Some(base),
            _ => None,
        };
        if let Some(base) = unresolved_base {
            if adjustment.base_relative_position {
                warn!(
                    "ignoring correction for {:?}: base {:?} is unknown",
                    self.agent.entity, base
                );
                return Err(CorrectionError::UnresolvedBase(base));
            }
        }

        if moves.acknowledge(adjustment.timestamp).is_none() {
            return Err(CorrectionError::UnknownMove {
                timestamp: adjustment.timestamp,
            });
        }

        let mut location = adjustment.location;
        if adjustment.base_relative_position {
            if let Some((_, Some(transform))) = base_transform {
                location += transform.translation;
            }
        }

        let (mode, _) = unpack_movement_mode(adjustment.packed_mode);
        self.notify(MovementEvent::ClientCorrectionReceived {
            location,
            velocity: adjustment.velocity,
            mode,
        });

        let mut rotation = self.agent.rotation;
        let new_up = adjustment.up_axis.normalize_or_zero();
        if new_up != Vec3::ZERO && !self.thresholds().coincident(new_up, up_axis(rotation)) {
            rotation = make_from_up_quat(new_up, rotation, self.thresholds());
        }
        let delta = location - self.agent.location;
        self.move_updated(delta, rotation, false);
        self.agent.controller.velocity = adjustment.velocity;

        let previous_base = self.agent.controller.movement_base;
        self.apply_network_movement_mode(adjustment.packed_mode);

        let final_base = if unresolved_base.is_some() {
            if previous_base.is_some() {
                let floor = self.find_floor(location, None);
                if floor.is_walkable_floor() {
                    floor.hit.entity
                } else {
                    None
                }
            } else {
                None
            }
        } else {
            adjustment.movement_base
        };
        self.set_base(final_base);
        self.update_floor_from_adjustment();
        self.agent.controller.just_teleported = true;
        self.save_base_location();

        Ok(self.replay_saved_moves(moves))
    }

    /// Run every saved move again from the current state, updating the
    /// stored results.
    pub fn replay_saved_moves(&mut self, moves: &mut SavedMoves) -> usize {
        let live_intent = self.agent.intent.clone();
        let mut replayed = 0;
        for saved in moves.moves.iter_mut() {
            let intent = &mut self.agent.intent;
            intent.input = saved.input;
            intent.speed = 1.0;
            intent.jump_pressed = saved.jump_pressed;
            intent.crouch_pressed = saved.crouch_pressed;

            self.tick(saved.delta_time);

            let controller = &self.agent.controller;
            saved.location = self.agent.location;
            saved.packed_mode = pack_movement_mode(controller.movement_mode(), controller.ground_mode());
            saved.movement_base = controller.movement_base;
            replayed += 1;
        }
        self.agent.intent = live_intent;
        replayed
    }

    /// Take over the complete state of a snapshot, as a simulated proxy.
    pub fn apply_snapshot(&mut self, snapshot: &MovementSnapshot) {
        let delta = snapshot.location - self.agent.location;
        self.move_updated(delta, snapshot.rotation.normalize(), false);
        self.agent.controller.velocity = snapshot.velocity;

        if let Some(gravity) = &snapshot.gravity {
            if gravity.apply_to(&mut self.agent.gravity) {
                self.refresh_gravity();
            }
        }

        if self.movement_mode() == MovementMode::None {
            let (mode, _) = unpack_movement_mode(snapshot.packed_mode);
            self.set_movement_mode(mode);
        } else {
            self.apply_network_movement_mode(snapshot.packed_mode);
        }
        self.set_base(snapshot.movement_base);
        self.update_floor_from_adjustment();
        self.agent.controller.just_teleported = true;
        self.save_base_location();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::tests::{Fixture, STANDING_HEIGHT};
    use crate::state::GroundMovementMode;

    fn walking_packed() -> u8 {
        pack_movement_mode(MovementMode::Walking, GroundMovementMode::Walking)
    }

    fn falling_packed() -> u8 {
        pack_movement_mode(MovementMode::Falling, GroundMovementMode::Walking)
    }

    fn saved_move(timestamp: f32, input: Vec3) -> SavedMove {
        SavedMove {
            timestamp,
            delta_time: 1.0 / 60.0,
            input,
            jump_pressed: false,
            crouch_pressed: false,
            location: Vec3::ZERO,
            packed_mode: 0,
            movement_base: None,
        }
    }

    fn correction(timestamp: f32, location: Vec3, base: Option<Entity>, relative: bool) -> ClientAdjustment {
        ClientAdjustment {
            timestamp,
            location,
            velocity: Vec3::ZERO,
            up_axis: Vec3::Y,
            packed_mode: walking_packed(),
            movement_base: base,
            base_relative_position: relative,
            ack_good_move: false,
        }
    }

    // ==================== Snapshot Tests ====================

    #[test]
    fn capture_versions_only_changes() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut replicated = ReplicatedMovement::authority();

        assert!(replicated.capture(&agent, true));
        assert_eq!(replicated.version(), 1);
        assert!(replicated.take_dirty());

        assert!(!replicated.capture(&agent, true));
        assert_eq!(replicated.version(), 1);
        assert!(!replicated.is_dirty());

        agent.controller.velocity = Vec3::X * 10.0;
        assert!(replicated.capture(&agent, true));
        assert_eq!(replicated.version(), 2);
        assert!(replicated.is_dirty());
    }

    #[test]
    fn gravity_can_be_left_out() {
        let fixture = Fixture::flat();
        let agent = fixture.walking_agent();
        let snapshot = MovementSnapshot::capture(&agent, 1, false);
        assert!(snapshot.gravity.is_none());
        assert_eq!(snapshot.packed_mode, walking_packed());
        assert_eq!(snapshot.movement_base, Some(fixture.ground));
    }

    #[test]
    fn proxy_applies_newer_snapshots_only() {
        let fixture = Fixture::flat();
        let mut source = fixture.walking_agent();
        source.location.x = 50.0;
        source.controller.velocity = Vec3::X * 100.0;
        let mut gravity = GravityField::new();
        gravity.set_point_direction(Vec3::new(50.0, -5000.0, 0.0));
        source.gravity = gravity;

        let snapshot = MovementSnapshot::capture(&source, 3, true);

        let mut proxy = fixture.agent_at(Vec3::new(0.0, 500.0, 0.0));
        let mut replicated = ReplicatedMovement::proxy();
        replicated
            .apply(snapshot.clone(), &mut fixture.mover(&mut proxy))
            .expect("fresh snapshot");

        assert_eq!(proxy.location.x, 50.0);
        assert!((proxy.location.y - source.location.y).abs() < 0.5, "location {:?}", proxy.location);
        assert_eq!(proxy.controller.velocity, Vec3::X * 100.0);
        assert_eq!(proxy.controller.movement_mode(), MovementMode::Walking);
        assert_eq!(proxy.controller.movement_base, Some(fixture.ground));
        assert_eq!(proxy.gravity.mode(), GravityMode::Point);
        assert!(proxy.controller.just_teleported);

        let result = replicated.apply(snapshot, &mut fixture.mover(&mut proxy));
        assert_eq!(result, Err(SnapshotError::Stale { received: 3, current: 3 }));
    }

    #[test]
    fn non_finite_snapshot_is_rejected() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut snapshot = MovementSnapshot::capture(&agent, 1, true);
        snapshot.velocity = Vec3::NAN;

        let mut replicated = ReplicatedMovement::proxy();
        let result = replicated.apply(snapshot, &mut fixture.mover(&mut agent));
        assert_eq!(result, Err(SnapshotError::NonFinite));
        assert_eq!(replicated.version(), 0);
    }

    // ==================== Saved Move Tests ====================

    #[test]
    fn acknowledge_drops_older_moves() {
        let mut moves = SavedMoves::new();
        for i in 1..=4 {
            moves.push(saved_move(i as f32 * 0.1, Vec3::ZERO));
        }

        let acked = moves.acknowledge(0.2).map(|m| m.timestamp);
        assert_eq!(acked, Some(0.2));
        assert_eq!(moves.len(), 2);
        assert!(moves.find(0.1).is_none());
        assert!(moves.acknowledge(0.2).is_none());
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let mut moves = SavedMoves::with_capacity(2);
        moves.push(saved_move(1.0, Vec3::ZERO));
        moves.push(saved_move(2.0, Vec3::ZERO));
        moves.push(saved_move(3.0, Vec3::ZERO));
        let timestamps: Vec<f32> = moves.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![2.0, 3.0]);
    }

    // ==================== Correction Tests ====================

    #[test]
    fn good_move_is_only_acknowledged() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let start = agent.location;
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));
        moves.push(saved_move(0.2, Vec3::ZERO));

        let replayed = fixture
            .mover(&mut agent)
            .apply_client_adjustment(&ClientAdjustment::good_move(0.1), &mut moves);
        assert_eq!(replayed, Ok(0));
        assert_eq!(moves.len(), 1);
        assert_eq!(agent.location, start);
    }

    #[test]
    fn correction_replays_pending_moves() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.location.x = 200.0;
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));
        moves.push(saved_move(0.2, Vec3::X));
        moves.push(saved_move(0.3, Vec3::X));

        let adjustment = correction(0.1, Vec3::new(10.0, STANDING_HEIGHT, 0.0), Some(fixture.ground), false);
        let mut bodies = fixture.bodies.clone();
        bodies.set_static(fixture.ground, Transform::IDENTITY);
        let env = fixture.snapshot.env(fixture.world_gravity, &crate::gravity::NoGravitySources, &bodies);
        let replayed = CharacterMover::new(&fixture.scene, env, &fixture.settings, &mut agent)
            .apply_client_adjustment(&adjustment, &mut moves);

        assert_eq!(replayed, Ok(2));
        assert_eq!(moves.len(), 2);
        assert!(agent.location.x > 10.0 && agent.location.x < 20.0, "location {:?}", agent.location);
        assert_eq!(agent.controller.movement_base, Some(fixture.ground));
        assert_eq!(moves.iter().last().map(|m| m.location), Some(agent.location));
        assert!(agent.events.iter().any(|e| matches!(
            e,
            MovementEvent::ClientCorrectionReceived { mode: MovementMode::Walking, .. }
        )));
        assert_eq!(agent.intent.input, Vec3::ZERO);
    }

    #[test]
    fn relative_correction_on_unknown_base_is_ignored() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));
        let unknown = fixture.spare(0);

        let result = fixture.mover(&mut agent).apply_client_adjustment(
            &correction(0.1, Vec3::new(500.0, 0.0, 0.0), Some(unknown), true),
            &mut moves,
        );
        assert_eq!(result, Err(CorrectionError::UnresolvedBase(unknown)));
        assert_eq!(moves.len(), 1);
        assert_eq!(agent.location.x, 0.0);
    }

    #[test]
    fn absolute_correction_on_unknown_base_uses_floor() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));
        let unknown = fixture.spare(0);

        let result = fixture.mover(&mut agent).apply_client_adjustment(
            &correction(0.1, Vec3::new(30.0, STANDING_HEIGHT, 0.0), Some(unknown), false),
            &mut moves,
        );
        assert_eq!(result, Ok(0));
        assert_eq!(agent.location.x, 30.0);
        assert_eq!(agent.controller.movement_base, Some(fixture.ground));
    }

    #[test]
    fn relative_correction_adds_base_location() {
        let fixture = Fixture::flat();
        let platform = fixture.spare(1);
        let mut bodies = fixture.bodies.clone();
        bodies.set_movable(platform, Transform::from_xyz(100.0, 0.0, 0.0), Vec3::ZERO);
        let mut agent = fixture.walking_agent();
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));

        let mut adjustment = correction(0.1, Vec3::new(5.0, 300.0, 0.0), Some(platform), true);
        adjustment.packed_mode = falling_packed();
        let env = fixture.snapshot.env(fixture.world_gravity, &crate::gravity::NoGravitySources, &bodies);
        let result = CharacterMover::new(&fixture.scene, env, &fixture.settings, &mut agent)
            .apply_client_adjustment(&adjustment, &mut moves);

        assert_eq!(result, Ok(0));
        assert_eq!(agent.location, Vec3::new(105.0, 300.0, 0.0));
        assert_eq!(agent.controller.movement_mode(), MovementMode::Falling);
    }

    #[test]
    fn unknown_timestamp_is_rejected() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));

        let result = fixture
            .mover(&mut agent)
            .apply_client_adjustment(&correction(0.5, Vec3::ZERO, None, false), &mut moves);
        assert_eq!(result, Err(CorrectionError::UnknownMove { timestamp: 0.5 }));
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn correction_turns_capsule_to_new_up() {
        let fixture = Fixture::empty();
        let mut agent = fixture.agent_at(Vec3::ZERO);
        fixture.mover(&mut agent).set_movement_mode(MovementMode::Flying);
        let mut moves = SavedMoves::new();
        moves.push(saved_move(0.1, Vec3::ZERO));

        let mut adjustment = correction(0.1, Vec3::ZERO, None, false);
        adjustment.up_axis = Vec3::X;
        adjustment.packed_mode = pack_movement_mode(MovementMode::Flying, GroundMovementMode::Walking);
        let result = fixture.mover(&mut agent).apply_client_adjustment(&adjustment, &mut moves);

        assert_eq!(result, Ok(0));
        assert!(agent.up().dot(Vec3::X) > 0.999, "up {:?}", agent.up());
    }

    #[test]
    fn queued_snapshots_keep_the_newest() {
        let fixture = Fixture::flat();
        let mut source = fixture.walking_agent();
        let older = MovementSnapshot::capture(&source, 4, false);
        source.location.x = 70.0;
        let newer = MovementSnapshot::capture(&source, 5, false);

        let mut agent = fixture.walking_agent();
        let mut replicated = ReplicatedMovement::proxy();
        replicated.receive(newer);
        replicated.receive(older);
        let result = replicated.apply_incoming(&mut fixture.mover(&mut agent));

        assert_eq!(result, Some(Ok(())));
        assert_eq!(agent.location.x, 70.0);
        assert_eq!(replicated.version(), 5);
        assert!(replicated.apply_incoming(&mut fixture.mover(&mut agent)).is_none());
    }

    #[test]
    fn prediction_records_and_corrects() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        let start = agent.location;
        let mut prediction = ClientPrediction::new();
        let first = prediction.record(&agent, 0.5);
        prediction.record(&agent, 0.5);
        assert_eq!(first, 0.5);
        assert_eq!(prediction.clock(), 1.0);

        prediction.receive(ClientAdjustment::good_move(first));
        prediction.receive(correction(9.0, Vec3::ZERO, None, false));
        assert!(prediction.has_incoming());
        prediction.apply_incoming(&mut fixture.mover(&mut agent));

        assert!(!prediction.has_incoming());
        assert_eq!(prediction.moves.len(), 1);
        assert_eq!(agent.location, start);
    }

    // ==================== Server Check Tests ====================

    #[test]
    fn matching_client_move_is_acknowledged() {
        let fixture = Fixture::flat();
        let agent = fixture.walking_agent();
        let report = ClientMoveReport {
            timestamp: 1.0,
            location: agent.location + Vec3::X,
            movement_base: Some(fixture.ground),
            packed_mode: walking_packed(),
        };

        let adjustment = ServerMoveCheck::default().verify_client_move(&agent, &fixture.bodies, &report);
        assert!(adjustment.ack_good_move);
        assert_eq!(adjustment.timestamp, 1.0);
    }

    #[test]
    fn diverged_client_gets_server_state() {
        let fixture = Fixture::flat();
        let mut agent = fixture.walking_agent();
        agent.controller.velocity = Vec3::X * 50.0;
        let report = ClientMoveReport {
            timestamp: 2.0,
            location: agent.location + Vec3::X * 10.0,
            movement_base: Some(fixture.ground),
            packed_mode: walking_packed(),
        };

        let adjustment = ServerMoveCheck::default().verify_client_move(&agent, &fixture.bodies, &report);
        assert!(!adjustment.ack_good_move);
        assert_eq!(adjustment.location, agent.location);
        assert_eq!(adjustment.velocity, Vec3::X * 50.0);
        assert_eq!(adjustment.movement_base, Some(fixture.ground));
        assert!(!adjustment.base_relative_position);
        assert_eq!(adjustment.packed_mode, walking_packed());
    }

    #[test]
    fn mode_mismatch_is_an_error() {
        let fixture = Fixture::flat();
        let agent = fixture.walking_agent();
        let report = ClientMoveReport {
            timestamp: 3.0,
            location: agent.location,
            movement_base: Some(fixture.ground),
            packed_mode: falling_packed(),
        };

        let check = ServerMoveCheck::default();
        assert!(check.client_error(&agent, &fixture.bodies, &report));
        let lenient = ServerMoveCheck {
            check_movement_mode: false,
            ..default()
        };
        assert!(!lenient.client_error(&agent, &fixture.bodies, &report));
    }

    #[test]
    fn movable_base_gives_relative_correction() {
        let fixture = Fixture::flat();
        let platform = fixture.spare(2);
        let mut bodies = fixture.bodies.clone();
        bodies.set_movable(platform, Transform::from_xyz(0.0, 0.0, 40.0), Vec3::ZERO);
        let mut agent = fixture.walking_agent();
        agent.controller.movement_base = Some(platform);
        let report = ClientMoveReport {
            timestamp: 4.0,
            location: Vec3::new(90.0, 0.0, 0.0),
            movement_base: Some(platform),
            packed_mode: walking_packed(),
        };

        let adjustment = ServerMoveCheck::default().verify_client_move(&agent, &bodies, &report);
        assert!(!adjustment.ack_good_move);
        assert!(adjustment.base_relative_position);
        assert_eq!(adjustment.location, agent.location - Vec3::new(0.0, 0.0, 40.0));
    }
}
