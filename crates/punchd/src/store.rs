use chrono::{NaiveDate, NaiveTime};
use punch_core::{
    AttendanceLog, AttendanceRecord, Embedding, GalleryProvider, LogError, PunchType,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("cannot create database directory {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database lock poisoned")]
    Poisoned,
    #[error("embedding {index} is not a finite {dim}-dimensional vector", dim = punch_core::EMBEDDING_DIM)]
    InvalidEmbedding { index: usize },
    #[error("no embeddings supplied for {0}")]
    NoEmbeddings(String),
    #[error("malformed attendance row {id}: {reason}")]
    MalformedRecord { id: i64, reason: String },
}

/// Attendance counts for one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub date: NaiveDate,
    pub total_identities: usize,
    pub present: usize,
    pub attendance_percent: f64,
}

/// SQLite-backed gallery and attendance log.
///
/// Embeddings are stored as little-endian `f32` blobs, one row per sample.
/// The attendance table is append-only. Cloning shares the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `db_path` and create the schema.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS identities (
                 name TEXT NOT NULL,
                 sample INTEGER NOT NULL,
                 embedding BLOB NOT NULL,
                 PRIMARY KEY (name, sample)
             );
             CREATE TABLE IF NOT EXISTS attendance (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL,
                 date TEXT NOT NULL,
                 time TEXT NOT NULL,
                 kind TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_attendance_name_date ON attendance(name, date);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Every stored `(name, embedding)` pair, in enrollment order.
    ///
    /// Blobs whose length is not a whole number of `f32`s are skipped.
    pub fn all_identities(&self) -> Result<Vec<(String, Vec<f32>)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, embedding FROM identities ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, blob)| match bytes_to_embedding(&blob) {
                Some(values) => Some((name, values)),
                None => {
                    tracing::debug!(name = %name, len = blob.len(), "skipping malformed embedding blob");
                    None
                }
            })
            .collect())
    }

    /// Replace every sample of `name` with `embeddings`. Returns the number stored.
    pub fn enroll(&self, name: &str, embeddings: &[Vec<f32>]) -> Result<usize, StoreError> {
        if embeddings.is_empty() {
            return Err(StoreError::NoEmbeddings(name.to_string()));
        }
        if let Some(index) = embeddings
            .iter()
            .position(|e| !Embedding::new(e.clone()).is_well_formed())
        {
            return Err(StoreError::InvalidEmbedding { index });
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM identities WHERE name = ?1", params![name])?;
        for (sample, values) in embeddings.iter().enumerate() {
            tx.execute(
                "INSERT INTO identities (name, sample, embedding) VALUES (?1, ?2, ?3)",
                params![name, sample as i64, embedding_to_bytes(values)],
            )?;
        }
        tx.commit()?;

        tracing::info!(name, samples = embeddings.len(), "identity enrolled");
        Ok(embeddings.len())
    }

    /// Delete every sample of `name`. Attendance history is kept.
    pub fn remove_identity(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM identities WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    pub fn identity_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT name FROM identities ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Type of the newest record for `name` on `date`.
    pub fn last_record(&self, name: &str, date: NaiveDate) -> Result<Option<PunchType>, StoreError> {
        let row: Option<(i64, String)> = self
            .conn()?
            .query_row(
                "SELECT id, kind FROM attendance WHERE name = ?1 AND date = ?2
                 ORDER BY id DESC LIMIT 1",
                params![name, date.format(DATE_FORMAT).to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(id, kind)| {
            kind.parse::<PunchType>()
                .map_err(|e| StoreError::MalformedRecord { id, reason: e.to_string() })
        })
        .transpose()
    }

    pub fn append_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO attendance (name, date, time, kind) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.name,
                record.date.format(DATE_FORMAT).to_string(),
                record.time.format(TIME_FORMAT).to_string(),
                record.kind.as_str(),
            ],
        )?;
        Ok(())
    }

    /// All records dated `date`, oldest first. Unparseable rows are skipped.
    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, time, kind FROM attendance WHERE date = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, name, time, kind) in rows {
            let parsed = NaiveTime::parse_from_str(&time, TIME_FORMAT)
                .map_err(|e| e.to_string())
                .and_then(|time| kind.parse::<PunchType>().map(|kind| (time, kind)).map_err(|e| e.to_string()));
            match parsed {
                Ok((time, kind)) => records.push(AttendanceRecord { name, date, time, kind }),
                Err(reason) => tracing::warn!(id, reason = %reason, "skipping malformed attendance row"),
            }
        }
        Ok(records)
    }

    /// Names whose newest record on `date` is a punch-in, sorted.
    pub fn present_on(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let mut latest = std::collections::BTreeMap::new();
        for record in self.records_on(date)? {
            latest.insert(record.name, record.kind);
        }
        Ok(latest
            .into_iter()
            .filter(|(_, kind)| *kind == PunchType::PunchIn)
            .map(|(name, _)| name)
            .collect())
    }

    /// Presence over enrolled identities on `date`.
    ///
    /// The denominator is the enrolled gallery, not the distinct names in the
    /// attendance table, so people who never punched in count as absent.
    pub fn stats(&self, date: NaiveDate) -> Result<AttendanceStats, StoreError> {
        let total_identities = self.identity_names()?.len();
        let present = self.present_on(date)?.len();
        let attendance_percent = if total_identities == 0 {
            0.0
        } else {
            let pct = present as f64 / total_identities as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };
        Ok(AttendanceStats {
            date,
            total_identities,
            present,
            attendance_percent,
        })
    }
}

impl GalleryProvider for Store {
    type Error = StoreError;

    fn all_identities(&self) -> Result<Vec<(String, Vec<f32>)>, StoreError> {
        Store::all_identities(self)
    }
}

impl AttendanceLog for Store {
    fn last_record(&self, name: &str, date: NaiveDate) -> Result<Option<PunchType>, LogError> {
        Store::last_record(self, name, date).map_err(|e| LogError::Read(e.to_string()))
    }

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), LogError> {
        Store::append_record(self, record).map_err(|e| LogError::Write(e.to_string()))
    }
}

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}
