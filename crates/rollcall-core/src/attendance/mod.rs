//! Attendance deduplication.
//!
//! Turns a noisy stream of per-frame recognitions into at most one attendance
//! write per visit. Two strategies are available and one is chosen per
//! deployment through [`DedupStrategy`]:
//!
//! - **Dual cooldown** writes on the first qualifying sighting and then
//!   suppresses the identity for the visual and re-log windows.
//! - **Session clustering** groups sightings into a visit, scores each sample,
//!   and writes the best one once the visit is long and stable enough (or runs
//!   too long, or goes idle).
//!
//! Both strategies share one cooldown table, which is what guarantees the
//! at-most-one-write-per-re-log-window property and which is persisted across
//! restarts.

mod cooldown;
mod engine;
mod session;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::FaceAnalysis;
use crate::liveness::{LivenessStatus, LivenessVerdict};
use crate::types::BoundingBox;

pub use cooldown::{
    CooldownEntry, CooldownOverlay, CooldownPhase, CooldownTable, PRUNE_MARGIN_SECS,
};
pub use engine::AttendanceEngine;
pub use session::{quality_score, DetectionSession, LogTrigger, SessionConfig, SessionSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    DualCooldown,
    #[default]
    SessionClustering,
}

impl FromStr for DedupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "dual_cooldown" | "cooldown" => Ok(DedupStrategy::DualCooldown),
            "session_clustering" | "session" => Ok(DedupStrategy::SessionClustering),
            other => Err(format!("unknown dedup strategy '{other}'")),
        }
    }
}

impl fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupStrategy::DualCooldown => f.write_str("dual_cooldown"),
            DedupStrategy::SessionClustering => f.write_str("session_clustering"),
        }
    }
}

/// Key shared by cooldown entries and visit sessions.
pub fn cooldown_key(context: Option<&str>, person_id: &str) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => format!("{ctx}::{person_id}"),
        _ => person_id.to_string(),
    }
}

/// One identified sighting fed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub person_id: String,
    pub member_name: Option<String>,
    pub confidence: f32,
    pub similarity: f32,
    pub bbox: BoundingBox,
    pub liveness: LivenessVerdict,
    pub timestamp: DateTime<Utc>,
    pub track_id: Option<u32>,
}

impl Observation {
    /// Build from a fresh recognition. Unknown faces and faces whose
    /// recognition failed yield `None`: only a positive match may log.
    pub fn from_face(face: &FaceAnalysis, timestamp: DateTime<Utc>) -> Option<Self> {
        let recognition = face.recognition.as_ref()?;
        let person_id = recognition.person_id.clone()?;
        Some(Observation {
            person_id,
            member_name: recognition.member_name.clone(),
            confidence: face.detection.confidence,
            similarity: recognition.similarity,
            bbox: face.detection.bbox,
            liveness: face.liveness,
            timestamp,
            track_id: face.detection.track_id,
        })
    }
}

/// Attendance write handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceWrite {
    pub person_id: String,
    pub member_name: Option<String>,
    pub context: Option<String>,
    pub confidence: f32,
    pub similarity: f32,
    pub source: String,
    pub liveness_status: LivenessStatus,
    pub liveness_confidence: Option<f32>,
    /// Time of the sample being recorded, not the time the decision was made.
    pub timestamp: DateTime<Utc>,
    pub bbox: BoundingBox,
    pub quality: Option<f32>,
    pub session_id: Option<Uuid>,
    pub trigger: Option<LogTrigger>,
}

pub const AUTO_SOURCE: &str = "auto";

/// Engine verdict for one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Write this record.
    Log(AttendanceWrite),
    /// Identity is inside a cooldown window; only its overlay position moved.
    Suppressed {
        person_id: String,
        phase: CooldownPhase,
    },
    /// Sample joined a visit that has not met its logging rule yet.
    Pending {
        person_id: String,
        session_id: Uuid,
        samples: usize,
    },
    /// Liveness did not confirm a live subject.
    Rejected {
        person_id: String,
        liveness: LivenessStatus,
    },
}

impl Decision {
    pub fn as_write(&self) -> Option<&AttendanceWrite> {
        match self {
            Decision::Log(write) => Some(write),
            _ => None,
        }
    }
}
