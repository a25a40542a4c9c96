use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::liveness::LivenessVerdict;
use crate::stability::{relative_variation, DEFAULT_VARIATION_THRESHOLD};
use crate::types::BoundingBox;

use super::Observation;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Gap after which the next sighting opens a new visit.
    pub session_timeout: chrono::Duration,
    pub min_duration: chrono::Duration,
    /// Visits running this long log regardless of stability.
    pub max_duration: chrono::Duration,
    /// Silence after which a visit is flushed by `tick`.
    pub idle_gap: chrono::Duration,
    pub min_quality: f32,
    pub stable_quality: f32,
    pub idle_quality: f32,
    pub confidence_weight: f32,
    pub similarity_weight: f32,
    pub size_weight: f32,
    /// Face area (px²) at which the size term saturates.
    pub max_face_area: f32,
    pub min_stable_samples: usize,
    pub variation_threshold: f32,
    pub max_samples: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: chrono::Duration::seconds(3),
            min_duration: chrono::Duration::seconds(1),
            max_duration: chrono::Duration::seconds(10),
            idle_gap: chrono::Duration::seconds(5),
            min_quality: 0.7,
            stable_quality: 0.8,
            idle_quality: 0.75,
            confidence_weight: 0.4,
            similarity_weight: 0.4,
            size_weight: 0.2,
            max_face_area: 50_000.0,
            min_stable_samples: 3,
            variation_threshold: DEFAULT_VARIATION_THRESHOLD,
            max_samples: 50,
        }
    }
}

/// Weighted blend of detector confidence, match similarity and face size.
pub fn quality_score(
    confidence: f32,
    similarity: f32,
    face_area: f32,
    cfg: &SessionConfig,
) -> f32 {
    let size = if cfg.max_face_area > 0.0 {
        (face_area / cfg.max_face_area).clamp(0.0, 1.0)
    } else {
        0.0
    };
    cfg.confidence_weight * confidence
        + cfg.similarity_weight * similarity
        + cfg.size_weight * size
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSample {
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub similarity: f32,
    pub bbox: BoundingBox,
    pub face_size: f32,
    pub quality_score: f32,
    pub liveness: LivenessVerdict,
}

impl SessionSample {
    pub fn from_observation(obs: &Observation, cfg: &SessionConfig) -> Self {
        let face_size = obs.bbox.area();
        SessionSample {
            timestamp: obs.timestamp,
            confidence: obs.confidence,
            similarity: obs.similarity,
            bbox: obs.bbox,
            face_size,
            quality_score: quality_score(obs.confidence, obs.similarity, face_size, cfg),
            liveness: obs.liveness,
        }
    }
}

/// Why a visit was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTrigger {
    /// Ran past the maximum duration.
    ForceFlush,
    /// Long enough and steady enough.
    Stable,
    /// Went quiet with a good enough best sample.
    Idle,
}

/// One visit of one identity.
#[derive(Debug, Clone)]
pub struct DetectionSession {
    pub id: Uuid,
    pub key: String,
    pub person_id: String,
    pub member_name: Option<String>,
    pub context: Option<String>,
    pub samples: VecDeque<SessionSample>,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub best: SessionSample,
    pub logged: bool,
}

impl DetectionSession {
    pub fn open(
        key: String,
        context: Option<String>,
        obs: &Observation,
        cfg: &SessionConfig,
    ) -> Self {
        let sample = SessionSample::from_observation(obs, cfg);
        let mut samples = VecDeque::with_capacity(cfg.max_samples.min(16));
        samples.push_back(sample.clone());
        DetectionSession {
            id: Uuid::new_v4(),
            key,
            person_id: obs.person_id.clone(),
            member_name: obs.member_name.clone(),
            context,
            samples,
            first_detected: obs.timestamp,
            last_detected: obs.timestamp,
            best: sample,
            logged: false,
        }
    }

    pub fn add(&mut self, obs: &Observation, cfg: &SessionConfig) {
        let sample = SessionSample::from_observation(obs, cfg);
        if sample.quality_score > self.best.quality_score {
            self.best = sample.clone();
        }
        if obs.member_name.is_some() {
            self.member_name = obs.member_name.clone();
        }
        self.last_detected = self.last_detected.max(obs.timestamp);
        self.samples.push_back(sample);
        while self.samples.len() > cfg.max_samples.max(1) {
            self.samples.pop_front();
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.last_detected - self.first_detected
    }

    /// Enough samples whose confidence and similarity both hold steady.
    pub fn is_stable(&self, cfg: &SessionConfig) -> bool {
        if self.samples.len() < cfg.min_stable_samples {
            return false;
        }
        let conf = relative_variation(self.samples.iter().map(|s| s.confidence));
        let sim = relative_variation(self.samples.iter().map(|s| s.similarity));
        conf < cfg.variation_threshold && sim < cfg.variation_threshold
    }

    pub fn is_idle(&self, now: DateTime<Utc>, cfg: &SessionConfig) -> bool {
        now - self.last_detected > cfg.idle_gap
    }

    /// The rule that would write this visit at `now`, if any.
    pub fn log_trigger(&self, now: DateTime<Utc>, cfg: &SessionConfig) -> Option<LogTrigger> {
        let best = self.best.quality_score;
        if self.logged || best < cfg.min_quality {
            return None;
        }
        let duration = self.duration();
        if duration >= cfg.max_duration {
            Some(LogTrigger::ForceFlush)
        } else if duration >= cfg.min_duration && best >= cfg.stable_quality && self.is_stable(cfg)
        {
            Some(LogTrigger::Stable)
        } else if self.is_idle(now, cfg) && best >= cfg.idle_quality {
            Some(LogTrigger::Idle)
        } else {
            None
        }
    }
}
