//! Punch-in / punch-out state machine with commit cooldown.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Minimum time between two accepted commits.
pub const DEFAULT_COOLDOWN_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchType {
    #[serde(rename = "Punch-In")]
    PunchIn,
    #[serde(rename = "Punch-Out")]
    PunchOut,
}

impl PunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PunchType::PunchIn => "Punch-In",
            PunchType::PunchOut => "Punch-Out",
        }
    }

    /// The type that must follow `last` on the same day.
    pub fn following(last: Option<PunchType>) -> PunchType {
        match last {
            Some(PunchType::PunchIn) => PunchType::PunchOut,
            Some(PunchType::PunchOut) | None => PunchType::PunchIn,
        }
    }
}

impl fmt::Display for PunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown punch type: {0}")]
pub struct UnknownPunchType(pub String);

impl FromStr for PunchType {
    type Err = UnknownPunchType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Punch-In" => Ok(PunchType::PunchIn),
            "Punch-Out" => Ok(PunchType::PunchOut),
            other => Err(UnknownPunchType(other.to_string())),
        }
    }
}

/// One immutable attendance log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    #[serde(rename = "type")]
    pub kind: PunchType,
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("attendance log read failed: {0}")]
    Read(String),
    #[error("attendance log write failed: {0}")]
    Write(String),
}

/// Append-only attendance persistence.
pub trait AttendanceLog {
    /// Type of the most recent record for `name` on `date`, if any.
    fn last_record(&self, name: &str, date: NaiveDate) -> Result<Option<PunchType>, LogError>;

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), LogError>;
}

/// In-process attendance log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<AttendanceRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AttendanceLog for MemoryLog {
    fn last_record(&self, name: &str, date: NaiveDate) -> Result<Option<PunchType>, LogError> {
        let records = self.records.lock().map_err(|e| LogError::Read(e.to_string()))?;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.name == name && r.date == date)
            .map(|r| r.kind))
    }

    fn append_record(&self, record: &AttendanceRecord) -> Result<(), LogError> {
        self.records
            .lock()
            .map_err(|e| LogError::Write(e.to_string()))?
            .push(record.clone());
        Ok(())
    }
}

/// Whose commits share a cooldown window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// One window for the whole session, whoever committed last.
    #[default]
    Session,
    /// One window per identity.
    Identity,
}

/// Result of handing a confirmed identity to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(AttendanceRecord),
    /// Inside the cooldown window; nothing was written.
    CoolingDown { remaining: std::time::Duration },
}

/// Decides punch-in vs punch-out and enforces the cooldown.
#[derive(Debug)]
pub struct AttendanceMachine {
    cooldown: Duration,
    scope: CooldownScope,
    session_marker: Option<NaiveDateTime>,
    identity_markers: HashMap<String, NaiveDateTime>,
}

impl Default for AttendanceMachine {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_COOLDOWN_SECS), CooldownScope::Session)
    }
}

impl AttendanceMachine {
    pub fn new(cooldown: Duration, scope: CooldownScope) -> Self {
        Self {
            cooldown,
            scope,
            session_marker: None,
            identity_markers: HashMap::new(),
        }
    }

    fn marker(&self, name: &str) -> Option<NaiveDateTime> {
        match self.scope {
            CooldownScope::Session => self.session_marker,
            CooldownScope::Identity => self.identity_markers.get(name).copied(),
        }
    }

    fn set_marker(&mut self, name: &str, at: NaiveDateTime) {
        match self.scope {
            CooldownScope::Session => self.session_marker = Some(at),
            CooldownScope::Identity => {
                self.identity_markers.insert(name.to_string(), at);
            }
        }
    }

    /// Time left before `name` may commit again, if any.
    pub fn cooldown_remaining(&self, name: &str, now: NaiveDateTime) -> Option<Duration> {
        let last = self.marker(name)?;
        let elapsed = now - last;
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    /// Handle a consensus-confirmed identity at `now`.
    ///
    /// Inside the cooldown window this is a no-op. Otherwise the next type
    /// in the day's alternation is appended to `log` and the cooldown marker
    /// moves to `now`. An unreadable prior state counts as "no record". A
    /// failed append is returned as an error and leaves the marker untouched.
    pub fn on_confirmed(
        &mut self,
        name: &str,
        now: NaiveDateTime,
        log: &dyn AttendanceLog,
    ) -> Result<CommitOutcome, LogError> {
        if let Some(remaining) = self.cooldown_remaining(name, now) {
            tracing::debug!(name, remaining_ms = remaining.num_milliseconds(), "commit suppressed by cooldown");
            return Ok(CommitOutcome::CoolingDown {
                remaining: remaining.to_std().unwrap_or_default(),
            });
        }

        let date = now.date();
        let last = log.last_record(name, date).unwrap_or_else(|e| {
            tracing::warn!(name, error = %e, "could not read prior attendance; treating as no record");
            None
        });

        let record = AttendanceRecord {
            name: name.to_string(),
            date,
            time: now.time().with_nanosecond(0).unwrap_or_else(|| now.time()),
            kind: PunchType::following(last),
        };

        log.append_record(&record)?;
        self.set_marker(name, now);

        tracing::info!(name, kind = %record.kind, date = %record.date, time = %record.time, "attendance committed");
        Ok(CommitOutcome::Committed(record))
    }
}
