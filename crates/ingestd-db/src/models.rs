//! Rust structs mapping to catalog tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row` selected with the matching column list in `queries`.

use chrono::{DateTime, SecondsFormat, Utc};
use ingestd_common::{ArtifactId, ArtifactTypeId, ProcessState};
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Render a timestamp the way the catalog stores it.
///
/// Fixed millisecond precision with a `Z` suffix keeps every stored value
/// the same width, so SQL string comparison orders them chronologically.
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored catalog timestamp.
pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn parse_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_time(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        from_db_time(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parse_state(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<ProcessState> {
    let raw: i64 = row.get(idx)?;
    ProcessState::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One uploaded or derived artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: Option<String>,
    pub size: i64,
    pub type_id: ArtifactTypeId,
    pub source_artifact_id: Option<ArtifactId>,
    pub process_state: ProcessState,
    pub msg: Option<String>,
    pub process_percentage: Option<i32>,
    pub ready_for_processing: bool,
    pub ready_for_delete: bool,
    pub in_use: bool,
    pub has_processed_successfully: bool,
    pub reprocess: bool,
    pub session_id: Option<String>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ArtifactId::new(row.get(0)?),
            name: row.get(1)?,
            size: row.get(2)?,
            type_id: ArtifactTypeId::new(row.get(3)?),
            source_artifact_id: row.get::<_, Option<i64>>(4)?.map(ArtifactId::new),
            process_state: parse_state(row, 5)?,
            msg: row.get(6)?,
            process_percentage: row.get(7)?,
            ready_for_processing: row.get(8)?,
            ready_for_delete: row.get(9)?,
            in_use: row.get(10)?,
            has_processed_successfully: row.get(11)?,
            reprocess: row.get(12)?,
            session_id: row.get(13)?,
            heartbeat: parse_opt_time(row, 14)?,
            process_start_time: parse_opt_time(row, 15)?,
            process_end_time: parse_opt_time(row, 16)?,
            created_at: parse_time(row, 17)?,
            updated_at: parse_time(row, 18)?,
        })
    }

    /// Whether this artifact was derived from another one.
    pub fn is_derived(&self) -> bool {
        self.source_artifact_id.is_some()
    }
}

/// Fields supplied when inserting an artifact row.
///
/// Anything not listed takes the column default.
#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub name: Option<String>,
    pub size: i64,
    pub type_id: i32,
    pub source_artifact_id: Option<ArtifactId>,
    pub process_state: Option<ProcessState>,
    pub ready_for_processing: bool,
    pub ready_for_delete: bool,
    pub in_use: bool,
    pub session_id: Option<String>,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl NewArtifact {
    /// A root upload, ready to be picked up by the process scan.
    pub fn upload(type_id: ArtifactTypeId, name: &str, size: i64) -> Self {
        Self {
            name: Some(name.to_string()),
            size,
            type_id: type_id.get(),
            ready_for_processing: true,
            in_use: true,
            ..Self::default()
        }
    }

    /// A derived artifact as a processor creates it: already successful,
    /// not yet in use, and heartbeat set so no scan can claim it.
    pub fn derived(
        parent: ArtifactId,
        type_id: ArtifactTypeId,
        name: Option<&str>,
        size: i64,
        heartbeat: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.map(String::from),
            size,
            type_id: type_id.get(),
            source_artifact_id: Some(parent),
            process_state: Some(ProcessState::Success),
            heartbeat: Some(heartbeat),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessingServer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessingServer {
    pub id: i64,
    pub heartbeat: DateTime<Utc>,
}

impl ProcessingServer {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            heartbeat: parse_time(row, 1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_time_is_fixed_width() {
        let whole = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let frac = whole + chrono::Duration::milliseconds(7);

        assert_eq!(to_db_time(whole), "2024-01-02T03:04:05.000Z");
        assert_eq!(to_db_time(frac), "2024-01-02T03:04:05.007Z");
        assert!(to_db_time(whole) < to_db_time(frac));
    }

    #[test]
    fn test_db_time_parses_back() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(250);
        assert_eq!(from_db_time(&to_db_time(at)).unwrap(), at);
    }

    #[test]
    fn test_derived_defaults() {
        let now = Utc::now();
        let new = NewArtifact::derived(ArtifactId::new(42), ArtifactTypeId::new(2), Some("thumb"), 10, now);
        assert_eq!(new.source_artifact_id, Some(ArtifactId::new(42)));
        assert_eq!(new.process_state, Some(ProcessState::Success));
        assert!(!new.in_use);
        assert_eq!(new.heartbeat, Some(now));
    }
}
