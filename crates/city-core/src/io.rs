//! Boundaries the session talks through: an outbox for participant-facing
//! events and an append-only move log.

use std::convert::Infallible;

use contracts::{MoveRecord, OutboundEvent};

/// Delivery channel towards connected participants.
pub trait Outbox {
    fn emit_to(&mut self, participant_id: &str, event: OutboundEvent);
    fn broadcast_all(&mut self, event: OutboundEvent);
}

/// Durable sink for applied moves. Records are never rewritten.
///
/// Only applied moves are appended. Out-of-range and infeasible submissions
/// are answered with `move_rejected` and never reach the log.
pub trait MoveLog {
    type Error: std::error::Error;

    fn append(&mut self, record: &MoveRecord) -> Result<(), Self::Error>;
}

/// One outbound event and who it is for; `target == None` means everyone.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub target: Option<String>,
    pub event: OutboundEvent,
}

impl Delivery {
    pub fn is_visible_to(&self, participant_id: &str) -> bool {
        self.target
            .as_deref()
            .map_or(true, |target| target == participant_id)
    }
}

/// Outbox that keeps every delivery in order. Used by headless runs and tests.
#[derive(Debug, Default)]
pub struct RecordingOutbox {
    deliveries: Vec<Delivery>,
}

impl RecordingOutbox {
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    pub fn take(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    /// Events the given participant would have received, in order.
    pub fn events_for(&self, participant_id: &str) -> Vec<&OutboundEvent> {
        self.deliveries
            .iter()
            .filter(|delivery| delivery.is_visible_to(participant_id))
            .map(|delivery| &delivery.event)
            .collect()
    }

    pub fn broadcasts(&self) -> Vec<&OutboundEvent> {
        self.deliveries
            .iter()
            .filter(|delivery| delivery.target.is_none())
            .map(|delivery| &delivery.event)
            .collect()
    }
}

impl Outbox for RecordingOutbox {
    fn emit_to(&mut self, participant_id: &str, event: OutboundEvent) {
        self.deliveries.push(Delivery {
            target: Some(participant_id.to_string()),
            event,
        });
    }

    fn broadcast_all(&mut self, event: OutboundEvent) {
        self.deliveries.push(Delivery {
            target: None,
            event,
        });
    }
}

#[derive(Debug, Default)]
pub struct MemoryMoveLog {
    records: Vec<MoveRecord>,
}

impl MemoryMoveLog {
    pub fn records(&self) -> &[MoveRecord] {
        &self.records
    }
}

impl MoveLog for MemoryMoveLog {
    type Error = Infallible;

    fn append(&mut self, record: &MoveRecord) -> Result<(), Self::Error> {
        self.records.push(record.clone());
        Ok(())
    }
}
