use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::liveness::LivenessStatus;
use crate::settings::{CooldownSettings, RuntimeSettings};
use crate::types::BoundingBox;

use super::cooldown::{CooldownEntry, CooldownOverlay, CooldownTable};
use super::session::{DetectionSession, LogTrigger, SessionConfig};
use super::{cooldown_key, AttendanceWrite, Decision, DedupStrategy, Observation, AUTO_SOURCE};

/// Decides which sightings become attendance writes.
///
/// Owns the cooldown table and the open visit sessions. Every transition is
/// synchronous; the caller feeds one frame's observations before the next
/// frame's results are merged.
pub struct AttendanceEngine {
    strategy: DedupStrategy,
    session_config: SessionConfig,
    cooldowns: CooldownTable,
    sessions: HashMap<String, DetectionSession>,
    /// Visits cut off by a later sighting before their idle rule could be
    /// judged. Checked by `tick` until they log or are swept.
    closing: Vec<DetectionSession>,
}

impl AttendanceEngine {
    pub fn new(strategy: DedupStrategy, session_config: SessionConfig) -> Self {
        Self {
            strategy,
            session_config,
            cooldowns: CooldownTable::new(),
            sessions: HashMap::new(),
            closing: Vec::new(),
        }
    }

    pub fn strategy(&self) -> DedupStrategy {
        self.strategy
    }

    /// Feed one identified sighting.
    pub fn observe(&mut self, obs: &Observation, settings: &RuntimeSettings) -> Decision {
        if !liveness_allows(obs.liveness.status, settings.spoof_detection) {
            tracing::debug!(
                person_id = %obs.person_id,
                liveness = obs.liveness.status.as_str(),
                "sighting rejected by liveness gate"
            );
            return Decision::Rejected {
                person_id: obs.person_id.clone(),
                liveness: obs.liveness.status,
            };
        }

        let context = settings.context.clone();
        let key = cooldown_key(context.as_deref(), &obs.person_id);

        if let Some(phase) = self.cooldowns.phase(&key, obs.timestamp, &settings.cooldowns) {
            self.cooldowns.touch(&key, obs.bbox);
            return Decision::Suppressed {
                person_id: obs.person_id.clone(),
                phase,
            };
        }

        match self.strategy {
            DedupStrategy::DualCooldown => {
                let write = write_from_observation(obs, context.clone());
                self.start_cooldown(key, &write, obs.bbox, &settings.cooldowns);
                tracing::info!(person_id = %obs.person_id, "attendance logged");
                Decision::Log(write)
            }
            DedupStrategy::SessionClustering => self.observe_session(key, context, obs, settings),
        }
    }

    fn observe_session(
        &mut self,
        key: String,
        context: Option<String>,
        obs: &Observation,
        settings: &RuntimeSettings,
    ) -> Decision {
        let cfg = &self.session_config;

        let expired = self
            .sessions
            .get(&key)
            .is_some_and(|s| obs.timestamp - s.last_detected > cfg.session_timeout);
        if expired {
            if let Some(old) = self.sessions.remove(&key) {
                if let Some(trigger) = old.log_trigger(obs.timestamp, cfg) {
                    // The finalized visit owns the window; this sighting only
                    // moves the overlay.
                    let write = write_from_session(&old, trigger);
                    self.start_cooldown(key, &write, obs.bbox, &settings.cooldowns);
                    log_session(&old, trigger);
                    return Decision::Log(write);
                }
                if old.best.quality_score >= cfg.idle_quality {
                    tracing::debug!(
                        person_id = %old.person_id,
                        session_id = %old.id,
                        "visit closing, awaiting idle flush"
                    );
                    self.closing.push(old);
                } else {
                    tracing::debug!(
                        person_id = %old.person_id,
                        session_id = %old.id,
                        samples = old.samples.len(),
                        "visit abandoned"
                    );
                }
            }
        }

        let session = self
            .sessions
            .entry(key.clone())
            .and_modify(|s| s.add(obs, cfg))
            .or_insert_with(|| DetectionSession::open(key.clone(), context, obs, cfg));

        match session.log_trigger(obs.timestamp, cfg) {
            Some(trigger) => {
                session.logged = true;
                let write = write_from_session(session, trigger);
                log_session(session, trigger);
                self.sessions.remove(&key);
                self.start_cooldown(key, &write, obs.bbox, &settings.cooldowns);
                Decision::Log(write)
            }
            None => Decision::Pending {
                person_id: session.person_id.clone(),
                session_id: session.id,
                samples: session.samples.len(),
            },
        }
    }

    /// Periodic housekeeping: flush idle visits, sweep dead ones and prune
    /// expired cooldowns. Returns the writes produced by idle flushes.
    pub fn tick(&mut self, now: DateTime<Utc>, settings: &RuntimeSettings) -> Vec<AttendanceWrite> {
        let mut writes = Vec::new();
        let sweep_after = self.session_config.session_timeout * 2;

        // closed visits are older than any open one for the same key
        for session in std::mem::take(&mut self.closing) {
            match session.log_trigger(now, &self.session_config) {
                Some(trigger) => {
                    if let Some(write) = self.flush(session, trigger, now, settings) {
                        writes.push(write);
                    }
                }
                None if now - session.last_detected <= sweep_after => self.closing.push(session),
                None => {}
            }
        }

        let mut keys: Vec<String> = self.sessions.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(session) = self.sessions.get(&key) else {
                continue;
            };
            let Some(trigger) = session.log_trigger(now, &self.session_config) else {
                continue;
            };
            let Some(session) = self.sessions.remove(&key) else {
                continue;
            };
            if let Some(write) = self.flush(session, trigger, now, settings) {
                writes.push(write);
            }
        }

        let before = self.sessions.len();
        self.sessions.retain(|_, s| now - s.last_detected <= sweep_after);
        let swept = before - self.sessions.len();
        if swept > 0 {
            tracing::debug!(swept, "swept idle visits");
        }

        let pruned = self.cooldowns.prune(now, &settings.cooldowns);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned expired cooldowns");
        }

        writes
    }

    /// Write a visit found ready by `tick`, unless its key is already covered.
    fn flush(
        &mut self,
        session: DetectionSession,
        trigger: LogTrigger,
        now: DateTime<Utc>,
        settings: &RuntimeSettings,
    ) -> Option<AttendanceWrite> {
        if self.cooldowns.phase(&session.key, now, &settings.cooldowns).is_some() {
            tracing::debug!(person_id = %session.person_id, "idle visit already covered");
            return None;
        }
        let write = write_from_session(&session, trigger);
        let bbox = session
            .samples
            .back()
            .map(|s| s.bbox)
            .unwrap_or(session.best.bbox);
        self.start_cooldown(session.key.clone(), &write, bbox, &settings.cooldowns);
        log_session(&session, trigger);
        Some(write)
    }

    fn start_cooldown(
        &mut self,
        key: String,
        write: &AttendanceWrite,
        bbox: BoundingBox,
        cooldowns: &CooldownSettings,
    ) {
        self.cooldowns.start(CooldownEntry {
            key,
            person_id: write.person_id.clone(),
            context: write.context.clone(),
            start_time: write.timestamp,
            cooldown_duration_seconds: cooldowns.relog_secs,
            last_known_bbox: bbox,
            member_name: write.member_name.clone(),
        });
    }

    pub fn cooldown_overlay(
        &self,
        now: DateTime<Utc>,
        settings: &CooldownSettings,
        context: Option<&str>,
    ) -> Vec<CooldownOverlay> {
        self.cooldowns.overlay(now, settings, context)
    }

    /// Load persisted cooldowns. Returns how many survived pruning.
    pub fn restore<I>(
        &mut self,
        entries: I,
        now: DateTime<Utc>,
        settings: &CooldownSettings,
    ) -> usize
    where
        I: IntoIterator<Item = CooldownEntry>,
    {
        self.cooldowns.restore(entries, now, settings)
    }

    pub fn cooldown_entries(&self) -> Vec<CooldownEntry> {
        self.cooldowns.entries()
    }

    pub fn cooldown(&self, key: &str) -> Option<&CooldownEntry> {
        self.cooldowns.get(key)
    }

    pub fn session(&self, key: &str) -> Option<&DetectionSession> {
        self.sessions.get(key)
    }

    /// Open visits plus closed ones still awaiting an idle flush.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len() + self.closing.len()
    }

    /// Drop in-flight visits without logging them.
    pub fn clear_sessions(&mut self) {
        self.sessions.clear();
        self.closing.clear();
    }
}

/// With spoof detection on only a confirmed live face may log. With it off
/// the check never ran, so `Unchecked` passes but a stray failure still blocks.
fn liveness_allows(status: LivenessStatus, spoof_detection: bool) -> bool {
    if spoof_detection {
        status == LivenessStatus::Live
    } else {
        !status.blocks_logging()
    }
}

fn write_from_observation(obs: &Observation, context: Option<String>) -> AttendanceWrite {
    AttendanceWrite {
        person_id: obs.person_id.clone(),
        member_name: obs.member_name.clone(),
        context,
        confidence: obs.confidence,
        similarity: obs.similarity,
        source: AUTO_SOURCE.to_string(),
        liveness_status: obs.liveness.status,
        liveness_confidence: obs.liveness.confidence(),
        timestamp: obs.timestamp,
        bbox: obs.bbox,
        quality: None,
        session_id: None,
        trigger: None,
    }
}

fn write_from_session(session: &DetectionSession, trigger: LogTrigger) -> AttendanceWrite {
    let best = &session.best;
    AttendanceWrite {
        person_id: session.person_id.clone(),
        member_name: session.member_name.clone(),
        context: session.context.clone(),
        confidence: best.confidence,
        similarity: best.similarity,
        source: AUTO_SOURCE.to_string(),
        liveness_status: best.liveness.status,
        liveness_confidence: best.liveness.confidence(),
        timestamp: best.timestamp,
        bbox: best.bbox,
        quality: Some(best.quality_score),
        session_id: Some(session.id),
        trigger: Some(trigger),
    }
}

fn log_session(session: &DetectionSession, trigger: LogTrigger) {
    tracing::info!(
        person_id = %session.person_id,
        session_id = %session.id,
        samples = session.samples.len(),
        quality = session.best.quality_score,
        ?trigger,
        "attendance logged"
    );
}
