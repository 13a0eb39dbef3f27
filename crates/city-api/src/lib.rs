//! Adapters around the classroom session: move log stores and the HTTP and
//! WebSocket server.

mod persistence;
mod server;

pub use persistence::{CsvMoveLog, MoveStore, PersistenceError, SqliteMoveStore, CSV_HEADER};
pub use server::{serve, ChannelOutbox, ClassroomSession, ServerError};

/// Environment variable naming the move log path.
pub const MOVE_LOG_ENV: &str = "CITY_MOVE_LOG";
pub const DEFAULT_MOVE_LOG_PATH: &str = "move_log.csv";

/// Move log path from `CITY_MOVE_LOG`, falling back to `move_log.csv`.
pub fn default_move_log_path() -> String {
    std::env::var(MOVE_LOG_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MOVE_LOG_PATH.to_string())
}
