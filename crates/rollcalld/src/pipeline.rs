//! Capture/merge loop.
//!
//! One task owns the tracker and the attendance engine. It pulls a frame on
//! every capture tick and hands it to the engine thread without waiting; the
//! reply comes back through a channel and is merged in the same task, so
//! dedup transitions never race each other. While a frame is in flight the
//! capture tick is skipped without pulling a frame from the source.
//!
//! Replies carry the context generation read at submit time. A reply whose
//! generation no longer matches the live settings belongs to the previous
//! subject/group and is discarded.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollcall_core::attendance::{cooldown_key, CooldownEntry, CooldownOverlay, SessionConfig};
use rollcall_core::tracker::{TrackState, TrackerConfig};
use rollcall_core::{
    AnalyzeOptions, AttendanceEngine, AttendanceWrite, BoundingBox, Decision, DedupStrategy,
    FaceTracker, LivenessStatus, Observation, RuntimeSettings, SettingsHandle,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::engine::{EngineError, EngineHandle, FrameAnalysis};
use crate::source::FrameSource;
use crate::store::{AttendanceStore, StoreError};

/// Where accepted attendance writes and their cooldowns go.
pub trait AttendanceSink: Send + Sync + 'static {
    fn log_attendance(
        &self,
        write: AttendanceWrite,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn upsert_cooldown(
        &self,
        entry: CooldownEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl AttendanceSink for AttendanceStore {
    async fn log_attendance(&self, write: AttendanceWrite) -> Result<(), StoreError> {
        self.insert_attendance(&write).await.map(|_| ())
    }

    async fn upsert_cooldown(&self, entry: CooldownEntry) -> Result<(), StoreError> {
        AttendanceStore::upsert_cooldown(self, &entry).await
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capture_interval: Duration,
    /// Cadence of idle flushes, track eviction and cooldown pruning.
    pub tick_interval: Duration,
    pub strategy: DedupStrategy,
    pub session: SessionConfig,
    pub tracker: TrackerConfig,
}

/// Notable pipeline outcomes, broadcast to whoever listens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Logged(AttendanceWrite),
    /// The write was lost; cooldown and session state were kept.
    WriteFailed { person_id: String, error: String },
    Rejected {
        person_id: String,
        liveness: LivenessStatus,
    },
    /// Capture tick skipped because the previous frame was still being
    /// analyzed. `seq` is the sequence number the frame would have taken.
    Dropped { seq: u64 },
    /// Reply arrived after a context switch.
    Stale { seq: u64, generation: u64 },
}

/// One track as the UI draws it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackOverlay {
    pub track_id: u32,
    /// The track the UI should feature.
    pub primary: bool,
    pub state: TrackState,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub stable: bool,
    pub stability: f32,
    pub person_id: Option<String>,
    pub member_name: Option<String>,
    pub liveness: LivenessStatus,
}

/// Latest UI-facing state, published after every merge and housekeeping pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlaySnapshot {
    pub updated_at: DateTime<Utc>,
    pub running: bool,
    pub context: Option<String>,
    pub frames_processed: u64,
    pub open_sessions: usize,
    pub primary_track_id: Option<u32>,
    pub tracks: Vec<TrackOverlay>,
    /// Cooldowns of the active context only.
    pub cooldowns: Vec<CooldownOverlay>,
}

impl OverlaySnapshot {
    fn idle(now: DateTime<Utc>) -> Self {
        Self {
            updated_at: now,
            running: false,
            context: None,
            frames_processed: 0,
            open_sessions: 0,
            primary_track_id: None,
            tracks: Vec::new(),
            cooldowns: Vec::new(),
        }
    }
}

/// Reply from the engine, tagged with what was known at submit time.
struct Completed {
    seq: u64,
    captured_at: DateTime<Utc>,
    generation: u64,
    result: Result<FrameAnalysis, EngineError>,
}

pub struct Pipeline<S, K> {
    engine: EngineHandle,
    source: S,
    sink: K,
    settings: SettingsHandle,
    tracker: FaceTracker,
    attendance: AttendanceEngine,
    config: PipelineConfig,
    overlay_tx: watch::Sender<OverlaySnapshot>,
    events: broadcast::Sender<PipelineEvent>,
    accepting: Arc<AtomicBool>,
    /// Sequence number and waiter of the frame being analyzed.
    in_flight: Option<(u64, JoinHandle<()>)>,
    last_seq: u64,
    generation: u64,
    frames_processed: u64,
    exhausted: bool,
}

impl<S: FrameSource, K: AttendanceSink> Pipeline<S, K> {
    pub fn new(
        engine: EngineHandle,
        source: S,
        sink: K,
        settings: SettingsHandle,
        config: PipelineConfig,
    ) -> Self {
        let (overlay_tx, _) = watch::channel(OverlaySnapshot::idle(Utc::now()));
        let (events, _) = broadcast::channel(64);
        let generation = settings.current().generation;
        Self {
            engine,
            source,
            sink,
            settings,
            tracker: FaceTracker::new(config.tracker.clone()),
            attendance: AttendanceEngine::new(config.strategy, config.session.clone()),
            config,
            overlay_tx,
            events,
            accepting: Arc::new(AtomicBool::new(false)),
            in_flight: None,
            last_seq: 0,
            generation,
            frames_processed: 0,
            exhausted: false,
        }
    }

    /// Load persisted cooldowns before the loop starts.
    pub fn restore_cooldowns(&mut self, entries: Vec<CooldownEntry>) -> usize {
        let settings = self.settings.current();
        let kept = self
            .attendance
            .restore(entries, Utc::now(), &settings.cooldowns);
        tracing::info!(kept, "cooldowns restored");
        kept
    }

    pub fn overlay(&self) -> watch::Receiver<OverlaySnapshot> {
        self.overlay_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Run until `shutdown` flips to true, then stop and return the cooldowns
    /// to persist.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Vec<CooldownEntry> {
        let (results_tx, mut results_rx) = mpsc::channel::<Completed>(1);
        let mut capture = tokio::time::interval(self.config.capture_interval);
        capture.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut housekeeping = tokio::time::interval(self.config.tick_interval);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.accepting.store(true, Ordering::Release);
        tracing::info!(
            strategy = %self.attendance.strategy(),
            capture_ms = self.config.capture_interval.as_millis() as u64,
            "pipeline started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = capture.tick() => self.capture(&results_tx),
                Some(done) = results_rx.recv() => self.merge(done).await,
                _ = housekeeping.tick() => self.housekeeping(Utc::now()).await,
            }
        }

        self.stop();
        self.attendance.cooldown_entries()
    }

    fn capture(&mut self, results_tx: &mpsc::Sender<Completed>) {
        if !self.accepting.load(Ordering::Acquire) || self.exhausted {
            return;
        }
        // no decode while the engine cannot take the frame
        if self.engine.is_busy() {
            let seq = self.last_seq + 1;
            tracing::trace!(seq, "capture skipped, analysis in flight");
            let _ = self.events.send(PipelineEvent::Dropped { seq });
            return;
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!("frame source exhausted");
                self.exhausted = true;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                return;
            }
        };

        let seq = frame.seq;
        self.last_seq = seq;
        let captured_at = frame.captured_at;
        let settings = self.settings.current();
        let options = AnalyzeOptions {
            liveness: settings.spoof_detection,
        };

        let pending = match self.engine.submit(frame, options) {
            Ok(pending) => pending,
            Err(EngineError::Busy) => {
                tracing::trace!(seq, "frame dropped, analysis in flight");
                let _ = self.events.send(PipelineEvent::Dropped { seq });
                return;
            }
            Err(e) => {
                tracing::warn!(seq, error = %e, "frame submit failed");
                return;
            }
        };

        let tx = results_tx.clone();
        let generation = settings.generation;
        let waiter = tokio::spawn(async move {
            let result = pending.wait().await;
            let _ = tx
                .send(Completed {
                    seq,
                    captured_at,
                    generation,
                    result,
                })
                .await;
        });
        self.in_flight = Some((seq, waiter));
    }

    async fn merge(&mut self, done: Completed) {
        if self.in_flight.as_ref().is_some_and(|(seq, _)| *seq == done.seq) {
            self.in_flight = None;
        }
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }

        let settings = self.settings.current();
        self.sync_generation(&settings);
        if done.generation != settings.generation {
            tracing::debug!(seq = done.seq, generation = done.generation, "stale reply dropped");
            let _ = self.events.send(PipelineEvent::Stale {
                seq: done.seq,
                generation: done.generation,
            });
            return;
        }

        let mut faces = match done.result {
            Ok(analysis) => analysis.faces,
            Err(e) => {
                tracing::warn!(seq = done.seq, error = %e, "analysis failed, frame has no faces");
                Vec::new()
            }
        };
        self.frames_processed += 1;
        let now = done.captured_at;

        let tracked = self.tracker.update(&mut faces, now);
        for tf in &tracked {
            // remembered identities only feed the overlay
            if tf.memory_hit {
                continue;
            }
            let Some(obs) = Observation::from_face(&faces[tf.face_index], now) else {
                continue;
            };
            match self.attendance.observe(&obs, &settings) {
                Decision::Log(write) => self.persist(write).await,
                Decision::Rejected {
                    person_id,
                    liveness,
                } => {
                    tracing::debug!(
                        person_id = %person_id,
                        liveness = liveness.as_str(),
                        "sighting rejected"
                    );
                    let _ = self.events.send(PipelineEvent::Rejected {
                        person_id,
                        liveness,
                    });
                }
                Decision::Suppressed { .. } | Decision::Pending { .. } => {}
            }
        }

        self.publish(now, &settings);
    }

    async fn housekeeping(&mut self, now: DateTime<Utc>) {
        let settings = self.settings.current();
        self.sync_generation(&settings);
        for write in self.attendance.tick(now, &settings) {
            self.persist(write).await;
        }
        self.tracker.evict_expired(now);
        self.publish(now, &settings);
    }

    /// Visits opened under a previous context are dropped, not logged.
    fn sync_generation(&mut self, settings: &RuntimeSettings) {
        if settings.generation != self.generation {
            tracing::info!(
                generation = settings.generation,
                dropped_sessions = self.attendance.open_sessions(),
                "context switched"
            );
            self.attendance.clear_sessions();
            self.tracker.clear();
            self.generation = settings.generation;
        }
    }

    /// Hand a write to the sink. A failed write is reported and not retried;
    /// the cooldown it started stays in force.
    async fn persist(&mut self, write: AttendanceWrite) {
        let key = cooldown_key(write.context.as_deref(), &write.person_id);
        let entry = self.attendance.cooldown(&key).cloned();
        let person_id = write.person_id.clone();

        match self.sink.log_attendance(write.clone()).await {
            Ok(()) => {
                tracing::info!(
                    person_id = %person_id,
                    context = ?write.context,
                    timestamp = %write.timestamp,
                    "attendance recorded"
                );
                let _ = self.events.send(PipelineEvent::Logged(write));
            }
            Err(e) => {
                tracing::warn!(person_id = %person_id, error = %e, "attendance write failed");
                let _ = self.events.send(PipelineEvent::WriteFailed {
                    person_id,
                    error: e.to_string(),
                });
            }
        }

        if let Some(entry) = entry {
            if let Err(e) = self.sink.upsert_cooldown(entry).await {
                tracing::warn!(key = %key, error = %e, "cooldown persist failed");
            }
        }
    }

    fn publish(&self, now: DateTime<Utc>, settings: &RuntimeSettings) {
        let primary_track_id = self.tracker.primary_track().map(|t| t.id);
        let tracks = self
            .tracker
            .tracks()
            .iter()
            .map(|t| TrackOverlay {
                track_id: t.id,
                primary: primary_track_id == Some(t.id),
                state: t.state,
                bbox: t.bbox,
                confidence: t.confidence,
                stable: t.stable,
                stability: t.stability,
                person_id: t.identity.as_ref().map(|i| i.person_id.clone()),
                member_name: t.identity.as_ref().and_then(|i| i.member_name.clone()),
                liveness: t.liveness,
            })
            .collect();

        self.overlay_tx.send_replace(OverlaySnapshot {
            updated_at: now,
            running: self.accepting.load(Ordering::Acquire),
            context: settings.context.clone(),
            frames_processed: self.frames_processed,
            open_sessions: self.attendance.open_sessions(),
            primary_track_id,
            tracks,
            cooldowns: self.attendance.cooldown_overlay(
                now,
                &settings.cooldowns,
                settings.context.as_deref(),
            ),
        });
    }

    /// Stop accepting, cancel the pending analysis, release the source and
    /// drop transient state. Cooldowns are kept for persistence.
    fn stop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        if let Some((_, task)) = self.in_flight.take() {
            task.abort();
        }
        self.source.release();
        self.tracker.clear();
        self.attendance.clear_sessions();
        self.overlay_tx
            .send_replace(OverlaySnapshot::idle(Utc::now()));
        tracing::info!(frames = self.frames_processed, "pipeline stopped");
    }
}
