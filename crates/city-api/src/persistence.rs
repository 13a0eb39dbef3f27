use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use city_core::MoveLog;
use contracts::MoveRecord;
use rusqlite::{params, Connection};
use thiserror::Error;

pub const CSV_HEADER: &str = "timestamp,student_id,from_idx,to_idx,delta_us,delta_Us";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("move history is only available from a sqlite store")]
    HistoryUnavailable,
}

// ---------------------------------------------------------------------------
// CSV log
// ---------------------------------------------------------------------------

/// Append-only CSV file, one row per applied move; rejected moves never reach
/// it. Delta arrays are written as `[a, b, ...]` lists with `", "`
/// separators inside quoted fields.
///
/// Each append opens, writes and closes the file synchronously. The server
/// calls this while holding the session lock, so a slow disk stalls every
/// socket until the row is written.
#[derive(Debug)]
pub struct CsvMoveLog {
    path: PathBuf,
}

impl CsvMoveLog {
    /// Opens the log, writing the header row if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
            writeln!(file, "{CSV_HEADER}")?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MoveLog for CsvMoveLog {
    type Error = PersistenceError;

    fn append(&mut self, record: &MoveRecord) -> Result<(), Self::Error> {
        let row = csv_row(record)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{row}")?;
        Ok(())
    }
}

fn csv_row(record: &MoveRecord) -> Result<String, PersistenceError> {
    let fields = [
        record.timestamp.clone(),
        record.student_id.clone(),
        record.from_idx.to_string(),
        record.to_idx.to_string(),
        list_field(&record.delta_us)?,
        list_field(&record.delta_social_us)?,
    ];
    Ok(fields
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(","))
}

fn list_field(values: &[f64]) -> Result<String, PersistenceError> {
    let items = values
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("[{}]", items.join(", ")))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SqliteMoveStore {
    conn: Connection,
    session_id: String,
}

impl SqliteMoveStore {
    pub fn open(path: impl AsRef<Path>, session_id: &str) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, session_id)
    }

    pub fn open_in_memory(session_id: &str) -> Result<Self, PersistenceError> {
        Self::with_connection(Connection::open_in_memory()?, session_id)
    }

    fn with_connection(conn: Connection, session_id: &str) -> Result<Self, PersistenceError> {
        let mut store = Self {
            conn,
            session_id: session_id.to_string(),
        };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn append_record(&mut self, record: &MoveRecord) -> Result<(), PersistenceError> {
        let delta_us_json = serde_json::to_string(&record.delta_us)?;
        let delta_social_us_json = serde_json::to_string(&record.delta_social_us)?;
        self.conn.execute(
            "INSERT INTO moves (
                session_id,
                timestamp,
                student_id,
                from_idx,
                to_idx,
                delta_us_json,
                delta_social_us_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.session_id.as_str(),
                record.timestamp.as_str(),
                record.student_id.as_str(),
                i64::try_from(record.from_idx).unwrap_or(i64::MAX),
                i64::try_from(record.to_idx).unwrap_or(i64::MAX),
                delta_us_json,
                delta_social_us_json,
            ],
        )?;
        Ok(())
    }

    pub fn count_moves(&self) -> Result<usize, PersistenceError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM moves WHERE session_id = ?1",
            params![self.session_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Moves in append order, starting at `offset`.
    pub fn load_moves(&self, offset: usize, limit: usize) -> Result<Vec<MoveRecord>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, student_id, from_idx, to_idx, delta_us_json, delta_social_us_json
             FROM moves
             WHERE session_id = ?1
             ORDER BY seq ASC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![
                self.session_id.as_str(),
                i64::try_from(limit).unwrap_or(i64::MAX),
                i64::try_from(offset).unwrap_or(i64::MAX)
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut moves = Vec::new();
        for row in rows {
            let (timestamp, student_id, from_idx, to_idx, delta_us, delta_social_us) = row?;
            moves.push(MoveRecord {
                timestamp,
                student_id,
                from_idx: usize::try_from(from_idx).unwrap_or(0),
                to_idx: usize::try_from(to_idx).unwrap_or(0),
                delta_us: serde_json::from_str(&delta_us)?,
                delta_social_us: serde_json::from_str(&delta_social_us)?,
            });
        }

        Ok(moves)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS moves (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                student_id TEXT NOT NULL,
                from_idx INTEGER NOT NULL,
                to_idx INTEGER NOT NULL,
                delta_us_json TEXT NOT NULL,
                delta_social_us_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_moves_session_seq ON moves(session_id, seq);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name) VALUES(1, 'moves_v1')",
            [],
        )?;

        Ok(())
    }
}

impl MoveLog for SqliteMoveStore {
    type Error = PersistenceError;

    fn append(&mut self, record: &MoveRecord) -> Result<(), Self::Error> {
        self.append_record(record)
    }
}

// ---------------------------------------------------------------------------
// Store selection
// ---------------------------------------------------------------------------

/// Move sink chosen at start-up from the configured path.
#[derive(Debug)]
pub enum MoveStore {
    Csv(CsvMoveLog),
    Sqlite(SqliteMoveStore),
    Disabled,
}

impl MoveStore {
    /// `.sqlite`, `.sqlite3` and `.db` paths open a SQLite store; anything
    /// else is treated as a CSV log.
    pub fn open(path: impl AsRef<Path>, session_id: &str) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let is_sqlite = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "sqlite" | "sqlite3" | "db"))
            .unwrap_or(false);

        if is_sqlite {
            Ok(Self::Sqlite(SqliteMoveStore::open(path, session_id)?))
        } else {
            Ok(Self::Csv(CsvMoveLog::open(path)?))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Csv(log) => format!("csv:{}", log.path().display()),
            Self::Sqlite(store) => format!("sqlite:session={}", store.session_id()),
            Self::Disabled => "disabled".to_string(),
        }
    }

    pub fn count_moves(&self) -> Result<usize, PersistenceError> {
        match self {
            Self::Sqlite(store) => store.count_moves(),
            _ => Err(PersistenceError::HistoryUnavailable),
        }
    }

    pub fn load_moves(&self, offset: usize, limit: usize) -> Result<Vec<MoveRecord>, PersistenceError> {
        match self {
            Self::Sqlite(store) => store.load_moves(offset, limit),
            _ => Err(PersistenceError::HistoryUnavailable),
        }
    }
}

impl MoveLog for MoveStore {
    type Error = PersistenceError;

    fn append(&mut self, record: &MoveRecord) -> Result<(), Self::Error> {
        match self {
            Self::Csv(log) => log.append(record),
            Self::Sqlite(store) => store.append_record(record),
            Self::Disabled => Ok(()),
        }
    }
}
