//! Face tracker.
//!
//! Turns unordered per-frame detections into persistent tracks. Association is
//! greedy on a weighted cost (centroid distance, size ratio, confidence delta);
//! detections with no candidate open a new track, and tracks not refreshed
//! within the timeout are evicted before the next association.
//!
//! Tracks also remember the identity they were last bound to. When the
//! recognizer answers "unknown" for a face that lands on a bound track, the
//! bound identity is reported back as a memory hit instead of flickering to an
//! unknown overlay during brief occlusion or a bad angle.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inference::FaceAnalysis;
use crate::liveness::LivenessStatus;
use crate::stability::{relative_variation, DEFAULT_VARIATION_THRESHOLD};
use crate::types::BoundingBox;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum centroid distance (px) for a detection to continue a track.
    pub max_match_distance: f32,
    /// Minimum smaller/larger area ratio for a detection to continue a track.
    pub min_size_ratio: f32,
    pub distance_weight: f32,
    pub size_weight: f32,
    pub confidence_weight: f32,
    /// Ring buffer length of per-track samples.
    pub history_len: usize,
    pub stability_threshold: f32,
    pub min_stable_samples: usize,
    pub track_timeout: chrono::Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance: 80.0,
            min_size_ratio: 0.5,
            distance_weight: 0.5,
            size_weight: 0.3,
            confidence_weight: 0.2,
            history_len: 10,
            stability_threshold: DEFAULT_VARIATION_THRESHOLD,
            min_stable_samples: 3,
            track_timeout: chrono::Duration::milliseconds(1500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Seen in a single frame so far.
    New,
    /// Matched in the latest update.
    Tracked,
    /// Missed in the latest update; evicted once the timeout passes.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSample {
    pub at: DateTime<Utc>,
    pub confidence: f32,
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundIdentity {
    pub person_id: String,
    pub member_name: Option<String>,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: u32,
    pub state: TrackState,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub history: VecDeque<TrackSample>,
    /// `1 - worst relative variation` over the history, clamped to `[0, 1]`.
    pub stability: f32,
    pub stable: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub identity: Option<BoundIdentity>,
    pub liveness: LivenessStatus,
    /// Consecutive updates without a match.
    pub missed_updates: u32,
    hits: u32,
}

/// Tracker verdict for one face of the current frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedFace {
    pub track_id: u32,
    pub face_index: usize,
    /// Identity to display: fresh recognition or remembered binding.
    pub identity: Option<BoundIdentity>,
    /// `identity` came from the track's memory, not from this frame's recognizer.
    pub memory_hit: bool,
    pub stable: bool,
}

pub struct FaceTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Associate this frame's faces with tracks.
    ///
    /// Writes the assigned track id into each face's detection and returns one
    /// [`TrackedFace`] per input face, in input order.
    pub fn update(&mut self, faces: &mut [FaceAnalysis], now: DateTime<Utc>) -> Vec<TrackedFace> {
        self.evict_expired(now);

        let num_existing = self.tracks.len();
        let matches = self.match_faces(faces);

        let mut assigned: Vec<Option<TrackedFace>> = vec![None; faces.len()];
        let mut matched_tracks = HashSet::new();

        for (ti, fi) in matches {
            matched_tracks.insert(ti);
            assigned[fi] = Some(apply_face(
                &mut self.tracks[ti],
                &faces[fi],
                fi,
                now,
                &self.config,
            ));
        }

        for (fi, slot) in assigned.iter_mut().enumerate() {
            if slot.is_none() {
                let ti = self.open_track(&faces[fi], now);
                *slot = Some(apply_face(
                    &mut self.tracks[ti],
                    &faces[fi],
                    fi,
                    now,
                    &self.config,
                ));
            }
        }

        for (ti, track) in self.tracks.iter_mut().enumerate().take(num_existing) {
            if !matched_tracks.contains(&ti) {
                track.missed_updates += 1;
                track.state = TrackState::Stale;
            }
        }

        let out: Vec<TrackedFace> = assigned.into_iter().flatten().collect();
        for tf in &out {
            faces[tf.face_index].detection.track_id = Some(tf.track_id);
        }
        out
    }

    /// Drop tracks not refreshed within the timeout.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) {
        let timeout = self.config.track_timeout;
        self.tracks.retain(|t| {
            let keep = now - t.last_seen <= timeout;
            if !keep {
                tracing::debug!(track_id = t.id, "track evicted");
            }
            keep
        });
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Most stable, then most confident, of the tracks seen in the last update.
    pub fn primary_track(&self) -> Option<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.state != TrackState::Stale)
            .max_by(|a, b| {
                a.stable
                    .cmp(&b.stable)
                    .then(
                        a.stability
                            .partial_cmp(&b.stability)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            })
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn open_track(&mut self, face: &FaceAnalysis, now: DateTime<Utc>) -> usize {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        tracing::debug!(track_id = id, "track opened");
        self.tracks.push(Track {
            id,
            state: TrackState::New,
            bbox: face.detection.bbox,
            confidence: face.detection.confidence,
            history: VecDeque::with_capacity(self.config.history_len),
            stability: 0.0,
            stable: false,
            first_seen: now,
            last_seen: now,
            identity: None,
            liveness: LivenessStatus::Unchecked,
            missed_updates: 0,
            hits: 0,
        });
        self.tracks.len() - 1
    }

    /// Greedy association: candidate pairs sorted by ascending cost, each track
    /// and face used at most once.
    fn match_faces(&self, faces: &[FaceAnalysis]) -> Vec<(usize, usize)> {
        let c = &self.config;
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();

        for (ti, track) in self.tracks.iter().enumerate() {
            for (fi, face) in faces.iter().enumerate() {
                let bbox = &face.detection.bbox;
                let distance = track.bbox.center_distance(bbox);
                let ratio = track.bbox.size_ratio(bbox);
                if distance > c.max_match_distance || ratio < c.min_size_ratio {
                    continue;
                }
                let cost = c.distance_weight * (distance / c.max_match_distance)
                    + c.size_weight * (1.0 - ratio)
                    + c.confidence_weight * (track.confidence - face.detection.confidence).abs();
                pairs.push((ti, fi, cost));
            }
        }
        pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_tracks = HashSet::new();
        let mut used_faces = HashSet::new();
        let mut matches = Vec::new();
        for (ti, fi, _) in pairs {
            if !used_tracks.contains(&ti) && !used_faces.contains(&fi) {
                used_tracks.insert(ti);
                used_faces.insert(fi);
                matches.push((ti, fi));
            }
        }
        matches
    }
}

fn apply_face(
    track: &mut Track,
    face: &FaceAnalysis,
    face_index: usize,
    now: DateTime<Utc>,
    config: &TrackerConfig,
) -> TrackedFace {
    track.bbox = face.detection.bbox;
    track.confidence = face.detection.confidence;
    track.last_seen = now;
    track.missed_updates = 0;
    track.hits += 1;
    track.state = if track.hits >= 2 {
        TrackState::Tracked
    } else {
        TrackState::New
    };
    track.liveness = face.liveness.status;

    if track.history.len() >= config.history_len {
        track.history.pop_front();
    }
    track.history.push_back(TrackSample {
        at: now,
        confidence: face.detection.confidence,
        similarity: face.recognition.as_ref().map(|r| r.similarity),
    });
    recompute_stability(track, config);

    let (identity, memory_hit) = resolve_identity(track, face);

    TrackedFace {
        track_id: track.id,
        face_index,
        identity,
        memory_hit,
        stable: track.stable,
    }
}

fn resolve_identity(track: &mut Track, face: &FaceAnalysis) -> (Option<BoundIdentity>, bool) {
    if face.liveness.status.blocks_logging() {
        // non-live faces render without identity and forget any binding
        track.identity = None;
        return (None, false);
    }

    let fresh = face.recognition.as_ref().and_then(|r| {
        r.person_id.as_ref().map(|id| BoundIdentity {
            person_id: id.clone(),
            member_name: r.member_name.clone(),
            similarity: r.similarity,
        })
    });

    match fresh {
        Some(identity) => {
            if let Some(previous) = &track.identity {
                if previous.person_id != identity.person_id {
                    tracing::debug!(
                        track_id = track.id,
                        from = %previous.person_id,
                        to = %identity.person_id,
                        "track re-identified"
                    );
                }
            }
            track.identity = Some(identity.clone());
            (Some(identity), false)
        }
        None => match &track.identity {
            Some(remembered) => (Some(remembered.clone()), true),
            None => (None, false),
        },
    }
}

fn recompute_stability(track: &mut Track, config: &TrackerConfig) {
    let conf_var = relative_variation(track.history.iter().map(|s| s.confidence));
    let sim_var = relative_variation(track.history.iter().filter_map(|s| s.similarity));
    let worst = conf_var.max(sim_var);

    track.stability = (1.0 - worst).clamp(0.0, 1.0);
    track.stable = track.history.len() >= config.min_stable_samples
        && conf_var < config.stability_threshold
        && sim_var < config.stability_threshold;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessVerdict;
    use crate::types::{Detection, Recognition};
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn face(x: f32, y: f32, conf: f32, person: Option<&str>) -> FaceAnalysis {
        FaceAnalysis {
            detection: Detection {
                bbox: BoundingBox::new(x, y, 100.0, 100.0),
                confidence: conf,
                landmarks: [(0.0, 0.0); 5],
                track_id: None,
            },
            recognition: Some(Recognition {
                person_id: person.map(str::to_string),
                member_name: None,
                similarity: if person.is_some() { 0.9 } else { 0.2 },
            }),
            liveness: LivenessVerdict::unchecked(),
        }
    }

    fn with_status(mut f: FaceAnalysis, status: LivenessStatus) -> FaceAnalysis {
        f.liveness = LivenessVerdict {
            status,
            result: None,
        };
        f
    }

    #[test]
    fn test_new_faces_get_unique_ids() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let mut faces = vec![face(0.0, 0.0, 0.9, None), face(300.0, 0.0, 0.9, None)];
        let out = tracker.update(&mut faces, t(0));
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].track_id, out[1].track_id);
        assert_eq!(faces[0].detection.track_id, Some(out[0].track_id));
        assert_eq!(tracker.tracks()[0].state, TrackState::New);
    }

    #[test]
    fn test_jitter_keeps_track_id() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let id = tracker.update(&mut [face(100.0, 100.0, 0.9, None)], t(0))[0].track_id;
        let out = tracker.update(&mut [face(108.0, 95.0, 0.88, None)], t(100));
        assert_eq!(out[0].track_id, id);
        assert_eq!(tracker.get(id).unwrap().state, TrackState::Tracked);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_large_jump_opens_new_track() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let id = tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(0))[0].track_id;
        let out = tracker.update(&mut [face(200.0, 0.0, 0.9, None)], t(100));
        assert_ne!(out[0].track_id, id);
        assert_eq!(tracker.get(id).unwrap().state, TrackState::Stale);
    }

    #[test]
    fn test_size_mismatch_opens_new_track() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let id = tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(0))[0].track_id;
        let mut small = face(0.0, 0.0, 0.9, None);
        small.detection.bbox = BoundingBox::new(30.0, 30.0, 40.0, 40.0);
        let out = tracker.update(&mut [small], t(100));
        assert_ne!(out[0].track_id, id);
    }

    #[test]
    fn test_closest_detection_wins() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let id = tracker.update(&mut [face(100.0, 100.0, 0.9, None)], t(0))[0].track_id;
        let out = tracker.update(
            &mut [face(160.0, 100.0, 0.9, None), face(105.0, 100.0, 0.9, None)],
            t(100),
        );
        assert_eq!(out[1].track_id, id);
        assert_ne!(out[0].track_id, id);
    }

    #[test]
    fn test_track_evicted_after_timeout() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(0));

        tracker.update(&mut [], t(1000));
        assert_eq!(tracker.len(), 1);

        tracker.update(&mut [], t(1600));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stale_track_recovers_within_timeout() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let id = tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(0))[0].track_id;
        tracker.update(&mut [], t(500));
        assert_eq!(tracker.get(id).unwrap().missed_updates, 1);

        let out = tracker.update(&mut [face(5.0, 5.0, 0.9, None)], t(1000));
        assert_eq!(out[0].track_id, id);
        assert_eq!(tracker.get(id).unwrap().missed_updates, 0);
    }

    #[test]
    fn test_steady_samples_become_stable() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let mut last = None;
        for i in 0..3 {
            last = Some(tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p1"))], t(i * 100)));
        }
        assert!(last.unwrap()[0].stable);
    }

    #[test]
    fn test_two_samples_are_not_enough() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p1"))], t(0));
        let out = tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p1"))], t(100));
        assert!(!out[0].stable);
    }

    #[test]
    fn test_erratic_confidence_is_unstable() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        let mut last = None;
        for (i, conf) in [0.95, 0.55, 0.95, 0.55].into_iter().enumerate() {
            last = Some(tracker.update(&mut [face(0.0, 0.0, conf, Some("p1"))], t(i as i64 * 100)));
        }
        assert!(!last.unwrap()[0].stable);
    }

    #[test]
    fn test_history_is_capped() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        for i in 0..25 {
            tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(i * 50));
        }
        assert_eq!(tracker.tracks()[0].history.len(), 10);
    }

    #[test]
    fn test_unknown_on_bound_track_is_memory_hit() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p1"))], t(0));
        let out = tracker.update(&mut [face(4.0, 4.0, 0.9, None)], t(100));
        assert!(out[0].memory_hit);
        assert_eq!(out[0].identity.as_ref().unwrap().person_id, "p1");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_track_rebinds_to_new_identity() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p1"))], t(0));
        let out = tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p2"))], t(100));
        assert!(!out[0].memory_hit);
        assert_eq!(out[0].identity.as_ref().unwrap().person_id, "p2");
    }

    #[test]
    fn test_spoof_face_renders_without_identity() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        tracker.update(&mut [face(0.0, 0.0, 0.9, Some("p1"))], t(0));

        let spoof = with_status(face(0.0, 0.0, 0.9, Some("p1")), LivenessStatus::Spoof);
        let out = tracker.update(&mut [spoof], t(100));
        assert!(out[0].identity.is_none());

        // binding was dropped, so a later unknown is not a memory hit
        let out = tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(200));
        assert!(out[0].identity.is_none());
        assert!(!out[0].memory_hit);
    }

    #[test]
    fn test_primary_track_prefers_stable() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        for (i, erratic) in [0.99, 0.5, 0.99].into_iter().enumerate() {
            tracker.update(
                &mut [
                    face(0.0, 0.0, 0.8, Some("steady")),
                    face(400.0, 0.0, erratic, Some("jumpy")),
                ],
                t(i as i64 * 100),
            );
        }
        let primary = tracker.primary_track().unwrap();
        assert_eq!(primary.identity.as_ref().unwrap().person_id, "steady");
    }

    #[test]
    fn test_primary_track_ignores_stale() {
        let mut tracker = FaceTracker::new(TrackerConfig::default());
        tracker.update(&mut [face(0.0, 0.0, 0.9, None)], t(0));
        tracker.update(&mut [], t(100));
        assert!(tracker.primary_track().is_none());
    }
}
