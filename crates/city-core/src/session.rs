//! Turn-based session over a shared city: who is connected, whose move is
//! pending, and what every participant gets told when something changes.

use std::collections::HashSet;

use contracts::{
    MoveRecord, MoveRejected, MoveSubmission, OutboundEvent, SessionConfig, SessionStatus,
    TotalAgents, TurnNotice, SCHEMA_VERSION_V1,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::city::{CityError, CityModel, InvalidMoveError};
use crate::clock::utc_timestamp_now;
use crate::io::{MoveLog, Outbox};

// ---------------------------------------------------------------------------
// Registry and turn state
// ---------------------------------------------------------------------------

/// Participants in first-join order, which is also the turn order.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    order: Vec<String>,
    known: HashSet<String>,
}

impl ParticipantRegistry {
    /// Returns `true` when the id was not registered before.
    pub fn insert(&mut self, participant_id: &str) -> bool {
        if !self.known.insert(participant_id.to_string()) {
            return false;
        }
        self.order.push(participant_id.to_string());
        true
    }

    pub fn get(&self, position: usize) -> Option<&str> {
        self.order.get(position).map(String::as_str)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.known.contains(participant_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnState {
    /// Nobody has been handed a turn yet.
    #[default]
    NotStarted,
    Active {
        position: usize,
        participant_id: String,
        /// `None` when the city was empty at the draw.
        from_idx: Option<usize>,
    },
}

impl TurnState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Active { position, .. } => Some(*position),
            Self::NotStarted => None,
        }
    }

    pub fn participant_id(&self) -> Option<&str> {
        match self {
            Self::Active { participant_id, .. } => Some(participant_id),
            Self::NotStarted => None,
        }
    }

    pub fn from_idx(&self) -> Option<usize> {
        match self {
            Self::Active { from_idx, .. } => *from_idx,
            Self::NotStarted => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Move outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveRejection {
    #[error("block indices ({from_idx}, {to_idx}) must lie in [0, {total_blocks})")]
    OutOfRange {
        from_idx: i64,
        to_idx: i64,
        total_blocks: usize,
    },
    #[error("move is not feasible: {0}")]
    Infeasible(#[from] InvalidMoveError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Applied(MoveRecord),
    Rejected(MoveRejection),
}

impl MoveOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns the city, the registry and the active turn. Every handler runs to
/// completion, outbox emissions and log append included, so callers sharing
/// one coordinator across tasks must serialize access to it.
#[derive(Debug)]
pub struct SessionCoordinator<O, L> {
    session_id: String,
    city: CityModel,
    registry: ParticipantRegistry,
    turn: TurnState,
    outbox: O,
    move_log: L,
    last_persistence_error: Option<String>,
}

impl<O: Outbox, L: MoveLog> SessionCoordinator<O, L> {
    pub fn new(session_id: impl Into<String>, city: CityModel, outbox: O, move_log: L) -> Self {
        Self {
            session_id: session_id.into(),
            city,
            registry: ParticipantRegistry::default(),
            turn: TurnState::NotStarted,
            outbox,
            move_log,
            last_persistence_error: None,
        }
    }

    pub fn from_config(config: &SessionConfig, outbox: O, move_log: L) -> Result<Self, CityError> {
        let city = CityModel::new(config)?;
        Ok(Self::new(config.session_id.clone(), city, outbox, move_log))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn city(&self) -> &CityModel {
        &self.city
    }

    pub fn turn(&self) -> &TurnState {
        &self.turn
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn moves_applied(&self) -> u64 {
        self.city.moves_applied()
    }

    pub fn last_persistence_error(&self) -> Option<&str> {
        self.last_persistence_error.as_deref()
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut O {
        &mut self.outbox
    }

    pub fn move_log(&self) -> &L {
        &self.move_log
    }

    pub fn session_status(&self) -> SessionStatus {
        SessionStatus {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            session_id: self.session_id.clone(),
            participants: self.registry.ids().to_vec(),
            active_participant: self.turn.participant_id().map(str::to_string),
            active_from_idx: self.turn.from_idx(),
            moves_applied: self.city.moves_applied(),
            agents_present: self.city.total_agents(),
            last_persistence_error: self.last_persistence_error.clone(),
        }
    }

    /// What a transport sends a socket right after it connects, before the
    /// participant has identified itself.
    pub fn connection_greeting(&self) -> Vec<OutboundEvent> {
        vec![
            OutboundEvent::RequestIdentity,
            OutboundEvent::UtilityConfig(self.city.utility_curve().config()),
            OutboundEvent::TotalAgents(TotalAgents {
                total_agents: self.city.target_agents(),
            }),
        ]
    }

    /// Current turn context, with deltas relative to the turn's origin block.
    pub fn turn_notice(&self) -> Option<TurnNotice> {
        let TurnState::Active {
            participant_id,
            from_idx,
            ..
        } = &self.turn
        else {
            return None;
        };

        Some(TurnNotice {
            student_id: participant_id.clone(),
            from_idx: *from_idx,
            city: self.city.snapshot(*from_idx),
        })
    }

    pub fn on_participant_join(&mut self, participant_id: &str) {
        let is_new = self.registry.insert(participant_id);
        info!(
            participant_id,
            is_new,
            participants = self.registry.len(),
            "participant joined"
        );

        self.outbox.emit_to(
            participant_id,
            OutboundEvent::UtilityConfig(self.city.utility_curve().config()),
        );
        self.outbox
            .emit_to(participant_id, OutboundEvent::StateUpdate(self.city.snapshot(None)));

        if self.turn.from_idx().is_none() {
            self.start_turn_at(0);
            if let Some(notice) = self.turn_notice() {
                self.outbox.broadcast_all(OutboundEvent::YourTurn(notice));
            }
        } else if let Some(notice) = self.turn_notice() {
            self.outbox
                .emit_to(participant_id, OutboundEvent::YourTurn(notice));
        }
    }

    pub fn on_state_requested(&mut self, participant_id: &str) {
        debug!(participant_id, "state requested");
        self.outbox
            .emit_to(participant_id, OutboundEvent::StateUpdate(self.city.snapshot(None)));
    }

    /// Applies a submitted move and hands the turn to the next participant.
    ///
    /// Moves from participants other than the active one are accepted as the
    /// classroom server always has. Out-of-range or infeasible moves are
    /// reported to the submitter only and leave the turn where it was.
    pub fn on_move_submitted(&mut self, submission: &MoveSubmission) -> MoveOutcome {
        let total_blocks = self.city.total_blocks();
        let (Some(from_idx), Some(to_idx)) = (
            block_index(submission.from_idx, total_blocks),
            block_index(submission.to_idx, total_blocks),
        ) else {
            return self.reject(
                submission,
                MoveRejection::OutOfRange {
                    from_idx: submission.from_idx,
                    to_idx: submission.to_idx,
                    total_blocks,
                },
            );
        };

        if self.turn.participant_id() != Some(submission.student_id.as_str()) {
            debug!(
                student_id = %submission.student_id,
                active = ?self.turn.participant_id(),
                "move submitted outside the active turn"
            );
        }

        // The deltas on record are the ones shown for the active turn.
        let shown = self.city.compute_metrics(self.turn.from_idx());

        if let Err(err) = self.city.apply_move(from_idx, to_idx) {
            return self.reject(submission, MoveRejection::Infeasible(err));
        }

        let record = MoveRecord {
            timestamp: utc_timestamp_now(),
            student_id: submission.student_id.clone(),
            from_idx,
            to_idx,
            delta_us: shown.delta_us,
            delta_social_us: shown.delta_social_us,
        };
        info!(
            student_id = %record.student_id,
            from_idx,
            to_idx,
            turn = self.city.moves_applied(),
            "move applied"
        );

        match self.move_log.append(&record) {
            Ok(()) => self.last_persistence_error = None,
            Err(err) => {
                warn!(error = %err, "failed to append move record");
                self.last_persistence_error = Some(err.to_string());
            }
        }

        self.outbox
            .broadcast_all(OutboundEvent::StateUpdate(self.city.snapshot(None)));

        self.advance_turn();
        if let Some(notice) = self.turn_notice() {
            self.outbox.broadcast_all(OutboundEvent::YourTurn(notice));
        }

        MoveOutcome::Applied(record)
    }

    fn reject(&mut self, submission: &MoveSubmission, rejection: MoveRejection) -> MoveOutcome {
        warn!(
            student_id = %submission.student_id,
            from_idx = submission.from_idx,
            to_idx = submission.to_idx,
            reason = %rejection,
            "move rejected"
        );
        self.outbox.emit_to(
            &submission.student_id,
            OutboundEvent::MoveRejected(MoveRejected {
                student_id: submission.student_id.clone(),
                from_idx: submission.from_idx,
                to_idx: submission.to_idx,
                reason: rejection.to_string(),
            }),
        );
        MoveOutcome::Rejected(rejection)
    }

    fn start_turn_at(&mut self, position: usize) {
        let Some(participant_id) = self.registry.get(position).map(str::to_string) else {
            self.turn = TurnState::NotStarted;
            return;
        };

        let from_idx = self.city.sample_weighted_block();
        if from_idx.is_none() {
            warn!(participant_id = %participant_id, "city is empty; turn has no origin block");
        }
        self.turn = TurnState::Active {
            position,
            participant_id,
            from_idx,
        };
    }

    fn advance_turn(&mut self) {
        if self.registry.is_empty() {
            self.turn = TurnState::NotStarted;
            return;
        }
        let next = match self.turn.position() {
            Some(position) => (position + 1) % self.registry.len(),
            None => 0,
        };
        self.start_turn_at(next);
    }
}

fn block_index(raw: i64, total_blocks: usize) -> Option<usize> {
    usize::try_from(raw).ok().filter(|&idx| idx < total_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryMoveLog, RecordingOutbox};

    fn coordinator(occupied: Vec<u32>) -> SessionCoordinator<RecordingOutbox, MemoryMoveLog> {
        let config = SessionConfig {
            rows: 1,
            cols: occupied.len(),
            capacity: 10,
            seed: Some(11),
            ..SessionConfig::default()
        };
        let city = CityModel::from_occupancy(&config, occupied).expect("city");
        SessionCoordinator::new("test", city, RecordingOutbox::default(), MemoryMoveLog::default())
    }

    fn submission(student_id: &str, from_idx: i64, to_idx: i64) -> MoveSubmission {
        MoveSubmission {
            student_id: student_id.to_string(),
            from_idx,
            to_idx,
        }
    }

    #[test]
    fn registry_deduplicates_and_keeps_first_join_order() {
        let mut registry = ParticipantRegistry::default();
        assert!(registry.insert("b"));
        assert!(registry.insert("a"));
        assert!(!registry.insert("b"));
        assert_eq!(registry.ids(), &["b".to_string(), "a".to_string()]);
        assert!(registry.contains("a"));
    }

    #[test]
    fn first_join_starts_the_turn_and_broadcasts_it() {
        let mut session = coordinator(vec![4, 0, 2]);
        assert_eq!(session.turn(), &TurnState::NotStarted);

        session.on_participant_join("alice");

        assert_eq!(session.turn().position(), Some(0));
        assert_eq!(session.turn().participant_id(), Some("alice"));
        let from_idx = session.turn().from_idx().expect("city has agents");
        assert!(session.city().occupied()[from_idx] > 0);

        let names: Vec<_> = session
            .outbox()
            .deliveries()
            .iter()
            .map(|d| (d.target.clone(), d.event.name()))
            .collect();
        assert_eq!(
            names,
            vec![
                (Some("alice".to_string()), "utility_config"),
                (Some("alice".to_string()), "state_update"),
                (None, "your_turn"),
            ]
        );
    }

    #[test]
    fn join_state_update_has_no_deltas_but_turn_notice_does() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        let deliveries = session.outbox().deliveries();

        let OutboundEvent::StateUpdate(plain) = &deliveries[1].event else {
            panic!("expected state_update");
        };
        assert!(plain.delta_us.iter().all(|&d| d == 0.0));

        let OutboundEvent::YourTurn(notice) = &deliveries[2].event else {
            panic!("expected your_turn");
        };
        assert_eq!(notice.student_id, "alice");
        assert!(notice.city.delta_us.iter().any(|&d| d != 0.0));
    }

    #[test]
    fn late_joiner_gets_current_turn_privately() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        let active_from = session.turn().from_idx();
        session.outbox_mut().take();

        session.on_participant_join("bob");

        assert_eq!(session.turn().participant_id(), Some("alice"));
        assert_eq!(session.turn().from_idx(), active_from);
        assert!(session.outbox().broadcasts().is_empty());
        let to_bob = session.outbox().events_for("bob");
        assert_eq!(to_bob.len(), 3);
        let OutboundEvent::YourTurn(notice) = to_bob[2] else {
            panic!("expected your_turn");
        };
        assert_eq!(notice.student_id, "alice");
        assert_eq!(notice.from_idx, active_from);
    }

    #[test]
    fn rejoin_does_not_duplicate_participant() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        session.on_participant_join("alice");
        assert_eq!(session.participants().len(), 1);
    }

    #[test]
    fn applied_move_logs_broadcasts_and_rotates() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        session.on_participant_join("bob");
        let from_idx = session.turn().from_idx().expect("origin");
        let to_idx = if from_idx == 1 { 2 } else { 1 };
        session.outbox_mut().take();

        let outcome = session.on_move_submitted(&submission("alice", from_idx as i64, to_idx as i64));

        assert!(outcome.is_applied());
        assert_eq!(session.move_log().records().len(), 1);
        assert_eq!(session.moves_applied(), 1);
        assert_eq!(session.turn().participant_id(), Some("bob"));

        let broadcasts = session.outbox().broadcasts();
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(broadcasts[0].name(), "state_update");
        assert_eq!(broadcasts[1].name(), "your_turn");
    }

    #[test]
    fn logged_deltas_are_the_ones_shown_for_the_turn() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        let from_idx = session.turn().from_idx().expect("origin");
        let shown = session.turn_notice().expect("active turn").city;
        let to_idx = if from_idx == 1 { 2 } else { 1 };

        session.on_participant_join("bob");
        session.on_state_requested("bob");
        session.on_move_submitted(&submission("alice", from_idx as i64, to_idx as i64));

        let record = &session.move_log().records()[0];
        assert_eq!(record.delta_us, shown.delta_us);
        assert_eq!(record.delta_social_us, shown.delta_social_us);
        assert_eq!(record.from_idx, from_idx);
        assert_eq!(record.to_idx, to_idx);
    }

    #[test]
    fn out_of_range_move_is_reported_only_to_submitter() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        session.on_participant_join("bob");
        let before = session.city().occupied().to_vec();
        let turn_before = session.turn().clone();
        session.outbox_mut().take();

        let outcome = session.on_move_submitted(&submission("alice", -1, 7));

        assert!(matches!(
            outcome,
            MoveOutcome::Rejected(MoveRejection::OutOfRange { total_blocks: 3, .. })
        ));
        assert_eq!(session.city().occupied(), before.as_slice());
        assert_eq!(session.turn(), &turn_before);
        assert!(session.move_log().records().is_empty());
        assert!(session.outbox().events_for("bob").is_empty());
        assert_eq!(session.outbox().events_for("alice")[0].name(), "move_rejected");
    }

    #[test]
    fn infeasible_move_is_rejected_without_advancing() {
        let mut session = coordinator(vec![4, 0, 10]);
        session.on_participant_join("alice");
        session.on_participant_join("bob");
        session.outbox_mut().take();

        let outcome = session.on_move_submitted(&submission("alice", 1, 0));
        assert_eq!(
            outcome,
            MoveOutcome::Rejected(MoveRejection::Infeasible(InvalidMoveError::OriginEmpty {
                from_idx: 1
            }))
        );

        let outcome = session.on_move_submitted(&submission("alice", 0, 2));
        assert!(matches!(
            outcome,
            MoveOutcome::Rejected(MoveRejection::Infeasible(
                InvalidMoveError::DestinationFull { to_idx: 2, .. }
            ))
        ));

        assert_eq!(session.city().occupied(), &[4, 0, 10]);
        assert_eq!(session.turn().participant_id(), Some("alice"));
        assert!(session.move_log().records().is_empty());
        assert!(session.outbox().broadcasts().is_empty());
    }

    #[test]
    fn empty_city_yields_turn_without_origin_and_retries_on_next_join() {
        let mut session = coordinator(vec![0, 0]);
        session.on_participant_join("alice");

        assert!(session.turn().is_active());
        assert_eq!(session.turn().from_idx(), None);
        let notice = session.turn_notice().expect("turn is active");
        assert_eq!(notice.from_idx, None);
        assert!(notice.city.delta_us.iter().all(|&d| d == 0.0));

        session.outbox_mut().take();
        session.on_participant_join("bob");
        // Still nothing to draw, so the turn is restarted from the first participant.
        assert_eq!(session.turn().participant_id(), Some("alice"));
        assert_eq!(session.outbox().broadcasts().len(), 1);
    }

    #[test]
    fn state_request_sends_plain_snapshot_to_requester() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_state_requested("carol");
        let deliveries = session.outbox().deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].target.as_deref(), Some("carol"));
        let OutboundEvent::StateUpdate(snapshot) = &deliveries[0].event else {
            panic!("expected state_update");
        };
        assert_eq!(snapshot.occupied, vec![4, 0, 2]);
    }

    #[test]
    fn greeting_announces_identity_request_utility_and_agent_target() {
        let session = coordinator(vec![4, 0, 2]);
        let greeting = session.connection_greeting();
        let names: Vec<_> = greeting.iter().map(OutboundEvent::name).collect();
        assert_eq!(names, vec!["request_identity", "utility_config", "total_agents"]);
        assert_eq!(
            greeting[2],
            OutboundEvent::TotalAgents(TotalAgents { total_agents: 15 })
        );
    }

    #[test]
    fn status_reflects_turn_and_registry() {
        let mut session = coordinator(vec![4, 0, 2]);
        session.on_participant_join("alice");
        let status = session.session_status();
        assert_eq!(status.participants, vec!["alice".to_string()]);
        assert_eq!(status.active_participant.as_deref(), Some("alice"));
        assert_eq!(status.agents_present, 6);
        assert_eq!(status.moves_applied, 0);
    }
}
