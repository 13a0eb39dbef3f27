//! v1 wire contracts shared by the city core, the session server and the CLI.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SCHEMA_VERSION_V1: &str = "1.0";
pub const UTILITY_KIND_PIECEWISE_LINEAR: &str = "piecewise_linear";

/// Process-wide session parameters, fixed at start-up.
///
/// Grid and curve fields keep the single-letter names the browser client and
/// the classroom notes use (`N`, `M`, `H`, `rho0`, `m`). Every field is
/// optional in JSON and falls back to [`SessionConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub schema_version: String,
    pub session_id: String,
    /// Grid rows.
    #[serde(rename = "N")]
    pub rows: usize,
    /// Grid columns.
    #[serde(rename = "M")]
    pub cols: usize,
    /// Per-block capacity.
    #[serde(rename = "H")]
    pub capacity: u32,
    /// Target aggregate occupancy fraction used to populate the city.
    pub rho0: f64,
    /// Utility curve parameter, strictly inside (0, 1).
    pub m: f64,
    /// Fixed RNG seed; `None` draws from OS entropy.
    pub seed: Option<u64>,
    pub notes: Option<String>,
}

/// Upper bound on `N*M*H`, the number of agent slots a session may hold.
pub const MAX_AGENT_SLOTS: u64 = 10_000_000;

/// `floor(total_blocks * capacity * rho0)`, or 0 when that is not a positive
/// finite number.
pub fn agent_target(total_blocks: usize, capacity: u32, rho0: f64) -> u64 {
    let raw = total_blocks as f64 * f64::from(capacity) * rho0;
    if raw.is_finite() && raw > 0.0 {
        raw.floor() as u64
    } else {
        0
    }
}

impl SessionConfig {
    /// Saturates instead of overflowing; `validate` rejects such grids.
    pub fn total_blocks(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    /// Agent count the initializer aims for: `floor(N*M*H*rho0)`.
    pub fn target_agents(&self) -> u64 {
        agent_target(self.total_blocks(), self.capacity, self.rho0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ConfigError::EmptyGrid {
                rows: self.rows,
                cols: self.cols,
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let slots = self
            .rows
            .checked_mul(self.cols)
            .and_then(|blocks| u64::try_from(blocks).ok())
            .and_then(|blocks| blocks.checked_mul(u64::from(self.capacity)));
        if !slots.is_some_and(|slots| slots <= MAX_AGENT_SLOTS) {
            return Err(ConfigError::GridTooLarge {
                rows: self.rows,
                cols: self.cols,
                capacity: self.capacity,
            });
        }
        if !(0.0..=1.0).contains(&self.rho0) {
            return Err(ConfigError::InitialDensityOutOfRange(self.rho0));
        }
        if !(self.m > 0.0 && self.m < 1.0) {
            return Err(ConfigError::UtilityParameterOutOfRange(self.m));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            session_id: "classroom_local_001".to_string(),
            rows: 1,
            cols: 2,
            capacity: 100,
            rho0: 0.5,
            m: 0.7,
            seed: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("grid must have at least one block (N={rows}, M={cols})")]
    EmptyGrid { rows: usize, cols: usize },
    #[error("block capacity H must be at least 1")]
    ZeroCapacity,
    #[error("N*M*H must not exceed {max} (N={rows}, M={cols}, H={capacity})", max = MAX_AGENT_SLOTS)]
    GridTooLarge {
        rows: usize,
        cols: usize,
        capacity: u32,
    },
    #[error("rho0 must lie in [0, 1], got {0}")]
    InitialDensityOutOfRange(f64),
    #[error("utility parameter m must lie in (0, 1), got {0}")]
    UtilityParameterOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UtilityParams {
    pub m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilityConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub params: UtilityParams,
}

impl UtilityConfig {
    pub fn piecewise_linear(m: f64) -> Self {
        Self {
            kind: UTILITY_KIND_PIECEWISE_LINEAR.to_string(),
            params: UtilityParams { m },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TotalAgents {
    pub total_agents: u64,
}

/// Full wire-ready city state. Delta arrays are all zero unless the snapshot
/// was taken relative to an origin block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitySnapshot {
    #[serde(rename = "N")]
    pub rows: usize,
    #[serde(rename = "M")]
    pub cols: usize,
    pub occupied: Vec<u32>,
    pub densities: Vec<f64>,
    pub delta_us: Vec<f64>,
    #[serde(rename = "delta_Us")]
    pub delta_social_us: Vec<f64>,
    pub social_utility: f64,
    /// Number of moves applied so far.
    pub turn: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnNotice {
    pub student_id: String,
    pub from_idx: Option<usize>,
    pub city: CitySnapshot,
}

/// Move as submitted by a client. Indices are signed so that negative input
/// reaches range validation instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveSubmission {
    pub student_id: String,
    pub from_idx: i64,
    pub to_idx: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveRecord {
    pub timestamp: String,
    pub student_id: String,
    pub from_idx: usize,
    pub to_idx: usize,
    pub delta_us: Vec<f64>,
    #[serde(rename = "delta_Us")]
    pub delta_social_us: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveRejected {
    pub student_id: String,
    pub from_idx: i64,
    pub to_idx: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    NotRegistered,
    InvalidQuery,
    PersistenceUnavailable,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

/// Server-to-participant events, framed as `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    RequestIdentity,
    UtilityConfig(UtilityConfig),
    TotalAgents(TotalAgents),
    StateUpdate(CitySnapshot),
    YourTurn(TurnNotice),
    MoveRejected(MoveRejected),
    Error(ApiError),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestIdentity => "request_identity",
            Self::UtilityConfig(_) => "utility_config",
            Self::TotalAgents(_) => "total_agents",
            Self::StateUpdate(_) => "state_update",
            Self::YourTurn(_) => "your_turn",
            Self::MoveRejected(_) => "move_rejected",
            Self::Error(_) => "error",
        }
    }
}

/// Participant-to-server events, framed like [`OutboundEvent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    Register { student_id: String },
    RequestState,
    Move(MoveSubmission),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub schema_version: String,
    pub session_id: String,
    pub participants: Vec<String>,
    pub active_participant: Option<String>,
    pub active_from_idx: Option<usize>,
    pub moves_applied: u64,
    pub agents_present: u64,
    pub last_persistence_error: Option<String>,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session_id={} participants={} active={} from_idx={} moves={} agents={}",
            self.session_id,
            self.participants.len(),
            self.active_participant.as_deref().unwrap_or("-"),
            self.active_from_idx
                .map(|idx| idx.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.moves_applied,
            self.agents_present
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub schema_version: String,
    pub query_type: String,
    pub session_id: String,
    pub generated_at_move: u64,
    pub data: Value,
}
