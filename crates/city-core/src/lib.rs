//! Urban density model and the turn-based classroom session built on it.

pub mod city;
pub mod clock;
pub mod io;
pub mod session;
pub mod utility;

pub use city::{CityError, CityMetrics, CityModel, InvalidMoveError};
pub use io::{Delivery, MemoryMoveLog, MoveLog, Outbox, RecordingOutbox};
pub use session::{MoveOutcome, MoveRejection, ParticipantRegistry, SessionCoordinator, TurnState};
pub use utility::UtilityCurve;
