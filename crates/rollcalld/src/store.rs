use std::path::Path;

use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use rollcall_core::attendance::{CooldownEntry, LogTrigger};
use rollcall_core::{AttendanceWrite, BoundingBox};
use serde::Serialize;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

/// One stored attendance row, as returned to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub person_id: String,
    pub member_name: Option<String>,
    pub context: Option<String>,
    pub confidence: f32,
    pub similarity: f32,
    pub source: String,
    pub liveness_status: String,
    pub liveness_confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub trigger: Option<String>,
}

/// SQLite-backed attendance log and cooldown persistence.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     person_id TEXT NOT NULL,
                     member_name TEXT,
                     context TEXT,
                     confidence REAL NOT NULL,
                     similarity REAL NOT NULL,
                     source TEXT NOT NULL,
                     liveness_status TEXT NOT NULL,
                     liveness_confidence REAL,
                     timestamp TEXT NOT NULL,
                     session_id TEXT,
                     log_trigger TEXT,
                     quality REAL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp);
                 CREATE INDEX IF NOT EXISTS idx_attendance_person ON attendance(person_id);
                 CREATE TABLE IF NOT EXISTS cooldowns (
                     key TEXT PRIMARY KEY,
                     person_id TEXT NOT NULL,
                     context TEXT,
                     start_time TEXT NOT NULL,
                     cooldown_duration_seconds INTEGER NOT NULL,
                     last_known_bbox TEXT NOT NULL,
                     member_name TEXT
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Insert an attendance write. Returns the generated record id.
    pub async fn insert_attendance(&self, write: &AttendanceWrite) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let person_id = write.person_id.clone();
        let member_name = write.member_name.clone();
        let context = write.context.clone();
        let confidence = write.confidence as f64;
        let similarity = write.similarity as f64;
        let source = write.source.clone();
        let liveness_status = write.liveness_status.as_str();
        let liveness_confidence = write.liveness_confidence.map(|c| c as f64);
        let timestamp = format_ts(write.timestamp);
        let session_id = write.session_id.map(|s| s.to_string());
        let trigger = write.trigger.map(trigger_str);
        let quality = write.quality.map(|q| q as f64);
        let created_at = format_ts(Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (id, person_id, member_name, context, confidence,
                         similarity, source, liveness_status, liveness_confidence, timestamp,
                         session_id, log_trigger, quality, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        id_clone,
                        person_id,
                        member_name,
                        context,
                        confidence,
                        similarity,
                        source,
                        liveness_status,
                        liveness_confidence,
                        timestamp,
                        session_id,
                        trigger,
                        quality,
                        created_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Most recent records first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<AttendanceRecord>, StoreError> {
        type Row = (
            String,
            String,
            Option<String>,
            Option<String>,
            f64,
            f64,
            String,
            String,
            Option<f64>,
            String,
            Option<String>,
            Option<String>,
        );

        let rows: Vec<Row> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, person_id, member_name, context, confidence, similarity, source,
                            liveness_status, liveness_confidence, timestamp, session_id,
                            log_trigger
                     FROM attendance ORDER BY timestamp DESC, created_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|r| {
                Ok(AttendanceRecord {
                    id: r.0,
                    person_id: r.1,
                    member_name: r.2,
                    context: r.3,
                    confidence: r.4 as f32,
                    similarity: r.5 as f32,
                    source: r.6,
                    liveness_status: r.7,
                    liveness_confidence: r.8.map(|c| c as f32),
                    timestamp: parse_ts(&r.9)?,
                    session_id: r.10,
                    trigger: r.11,
                })
            })
            .collect()
    }

    /// Number of records with a timestamp at or after `since`.
    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let since = format_ts(since);
        let count: i64 = self
            .conn
            .call(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE timestamp >= ?1",
                    [since],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Records since midnight UTC of `now`'s day.
    pub async fn today_count(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        self.count_since(midnight).await
    }

    /// Insert or replace the persisted cooldown for one key.
    pub async fn upsert_cooldown(&self, entry: &CooldownEntry) -> Result<(), StoreError> {
        let row = CooldownRow::encode(entry)?;
        self.conn
            .call(move |conn| {
                row.upsert(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Replace the whole cooldown table with `entries`.
    pub async fn save_cooldowns(&self, entries: &[CooldownEntry]) -> Result<(), StoreError> {
        let rows = entries
            .iter()
            .map(CooldownRow::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let count = rows.len();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM cooldowns", [])?;
                for row in &rows {
                    row.upsert(&tx)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        tracing::info!(count, "cooldowns saved");
        Ok(())
    }

    pub async fn load_cooldowns(&self) -> Result<Vec<CooldownEntry>, StoreError> {
        let rows: Vec<CooldownRow> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, person_id, context, start_time, cooldown_duration_seconds,
                            last_known_bbox, member_name
                     FROM cooldowns ORDER BY key",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(CooldownRow {
                            key: row.get(0)?,
                            person_id: row.get(1)?,
                            context: row.get(2)?,
                            start_time: row.get(3)?,
                            duration_secs: row.get(4)?,
                            bbox_json: row.get(5)?,
                            member_name: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(CooldownRow::decode).collect()
    }
}

/// Column-shaped cooldown, encoded outside the connection closure.
struct CooldownRow {
    key: String,
    person_id: String,
    context: Option<String>,
    start_time: String,
    duration_secs: i64,
    bbox_json: String,
    member_name: Option<String>,
}

impl CooldownRow {
    fn encode(entry: &CooldownEntry) -> Result<Self, StoreError> {
        Ok(Self {
            key: entry.key.clone(),
            person_id: entry.person_id.clone(),
            context: entry.context.clone(),
            start_time: format_ts(entry.start_time),
            duration_secs: entry.cooldown_duration_seconds as i64,
            bbox_json: serde_json::to_string(&entry.last_known_bbox)?,
            member_name: entry.member_name.clone(),
        })
    }

    fn decode(self) -> Result<CooldownEntry, StoreError> {
        let bbox: BoundingBox = serde_json::from_str(&self.bbox_json)?;
        let duration = u64::try_from(self.duration_secs).map_err(|_| {
            StoreError::InvalidRecord(format!(
                "negative cooldown duration for {}: {}",
                self.key, self.duration_secs
            ))
        })?;
        Ok(CooldownEntry {
            start_time: parse_ts(&self.start_time)?,
            key: self.key,
            person_id: self.person_id,
            context: self.context,
            cooldown_duration_seconds: duration,
            last_known_bbox: bbox,
            member_name: self.member_name,
        })
    }

    fn upsert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO cooldowns (key, person_id, context, start_time,
                 cooldown_duration_seconds, last_known_bbox, member_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
                 person_id = excluded.person_id,
                 context = excluded.context,
                 start_time = excluded.start_time,
                 cooldown_duration_seconds = excluded.cooldown_duration_seconds,
                 last_known_bbox = excluded.last_known_bbox,
                 member_name = excluded.member_name",
            rusqlite::params![
                self.key,
                self.person_id,
                self.context,
                self.start_time,
                self.duration_secs,
                self.bbox_json,
                self.member_name
            ],
        )
    }
}

/// Fixed-width UTC timestamps so text comparison orders chronologically.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord(format!("bad timestamp '{s}': {e}")))
}

fn trigger_str(trigger: LogTrigger) -> &'static str {
    match trigger {
        LogTrigger::ForceFlush => "force_flush",
        LogTrigger::Stable => "stable",
        LogTrigger::Idle => "idle",
    }
}
