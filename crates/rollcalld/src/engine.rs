use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollcall_core::{AnalyzeOptions, FaceAnalysis, Frame, FrameAnalyzer, InferenceError};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("a frame is already being analyzed")]
    Busy,
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("reply for request {got} arrived for request {expected}")]
    MismatchedReply { expected: u64, got: u64 },
}

/// Faces found in one frame.
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub request_id: u64,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub faces: Vec<FaceAnalysis>,
}

/// Message sent from the capture loop to the engine thread.
struct AnalysisRequest {
    id: u64,
    frame: Frame,
    options: AnalyzeOptions,
    reply: oneshot::Sender<AnalysisReply>,
}

struct AnalysisReply {
    id: u64,
    result: Result<Vec<FaceAnalysis>, InferenceError>,
}

/// Clears the in-flight flag when the pending request is finished or dropped.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Clone-safe handle to the engine thread.
///
/// At most one request is in flight across all clones; a frame submitted
/// while another is pending is rejected with [`EngineError::Busy`] rather
/// than queued.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<AnalysisRequest>,
    in_flight: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl EngineHandle {
    /// Hand a frame to the engine thread without waiting for the result.
    pub fn submit(
        &self,
        frame: Frame,
        options: AnalyzeOptions,
    ) -> Result<PendingAnalysis, EngineError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Busy);
        }
        let guard = InFlight(self.in_flight.clone());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let seq = frame.seq;
        let captured_at = frame.captured_at;
        let (reply_tx, reply_rx) = oneshot::channel();

        match self.tx.try_send(AnalysisRequest {
            id,
            frame,
            options,
            reply: reply_tx,
        }) {
            Ok(()) => {}
            // The thread is still finishing a request whose caller gave up.
            Err(TrySendError::Full(_)) => return Err(EngineError::Busy),
            Err(TrySendError::Closed(_)) => return Err(EngineError::ChannelClosed),
        }

        tracing::trace!(request_id = id, seq, "frame submitted");
        Ok(PendingAnalysis {
            request_id: id,
            seq,
            captured_at,
            rx: reply_rx,
            timeout: self.timeout,
            _in_flight: guard,
        })
    }

    /// Submit and wait in one step.
    pub async fn detect_and_recognize(
        &self,
        frame: Frame,
        options: AnalyzeOptions,
    ) -> Result<FrameAnalysis, EngineError> {
        self.submit(frame, options)?.wait().await
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// A submitted frame whose analysis has not been collected yet.
pub struct PendingAnalysis {
    request_id: u64,
    seq: u64,
    captured_at: DateTime<Utc>,
    rx: oneshot::Receiver<AnalysisReply>,
    timeout: Duration,
    _in_flight: InFlight,
}

impl PendingAnalysis {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the engine thread's reply, bounded by the engine timeout.
    pub async fn wait(self) -> Result<FrameAnalysis, EngineError> {
        let PendingAnalysis {
            request_id,
            seq,
            captured_at,
            rx,
            timeout,
            _in_flight,
        } = self;

        let reply = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
            .map_err(|_| EngineError::ChannelClosed)?;
        if reply.id != request_id {
            return Err(EngineError::MismatchedReply {
                expected: request_id,
                got: reply.id,
            });
        }

        Ok(FrameAnalysis {
            request_id,
            seq,
            captured_at,
            faces: reply.result?,
        })
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Models are loaded lazily by the analyzer's session pools on first use, so
/// the thread starts immediately.
pub fn spawn_engine(analyzer: Arc<dyn FrameAnalyzer>, timeout: Duration) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<AnalysisRequest>(1);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let started = std::time::Instant::now();
                let result = analyzer.analyze(&req.frame, req.options);
                match &result {
                    Ok(faces) => tracing::debug!(
                        request_id = req.id,
                        seq = req.frame.seq,
                        faces = faces.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "frame analyzed"
                    ),
                    Err(e) => tracing::warn!(
                        request_id = req.id,
                        seq = req.frame.seq,
                        error = %e,
                        "frame analysis failed"
                    ),
                }
                // Receiver gone means the caller timed out; the reply is stale.
                let _ = req.reply.send(AnalysisReply { id: req.id, result });
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        in_flight: Arc::new(AtomicBool::new(false)),
        next_id: Arc::new(AtomicU64::new(0)),
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use rollcall_core::{BoundingBox, Detection, LivenessVerdict, Recognition};
    use std::sync::Mutex;

    /// Returns one face per frame, optionally blocking until released.
    struct FakeAnalyzer {
        gate: Option<Mutex<std::sync::mpsc::Receiver<()>>>,
        delay: Duration,
        fail: bool,
    }

    impl FakeAnalyzer {
        fn instant() -> Self {
            Self {
                gate: None,
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    impl FrameAnalyzer for FakeAnalyzer {
        fn analyze(
            &self,
            frame: &Frame,
            options: AnalyzeOptions,
        ) -> Result<Vec<FaceAnalysis>, InferenceError> {
            if let Some(gate) = &self.gate {
                let _ = gate.lock().unwrap().recv();
            }
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(InferenceError::EmptyCrop);
            }
            Ok(vec![FaceAnalysis {
                detection: Detection {
                    bbox: BoundingBox::new(frame.seq as f32, 0.0, 100.0, 100.0),
                    confidence: 0.9,
                    landmarks: [(0.0, 0.0); 5],
                    track_id: None,
                },
                recognition: Some(Recognition {
                    person_id: Some("p1".into()),
                    member_name: None,
                    similarity: 0.8,
                }),
                liveness: if options.liveness {
                    LivenessVerdict::error()
                } else {
                    LivenessVerdict::unchecked()
                },
            }])
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Utc::now(), RgbImage::new(8, 8))
    }

    #[tokio::test]
    async fn test_detect_and_recognize_roundtrip() {
        let engine = spawn_engine(Arc::new(FakeAnalyzer::instant()), Duration::from_secs(5));

        let first = engine
            .detect_and_recognize(frame(7), AnalyzeOptions { liveness: true })
            .await
            .unwrap();
        assert_eq!(first.seq, 7);
        assert_eq!(first.faces.len(), 1);
        assert_eq!(first.faces[0].liveness, LivenessVerdict::error());

        let second = engine
            .detect_and_recognize(frame(8), AnalyzeOptions::default())
            .await
            .unwrap();
        assert!(second.request_id > first.request_id);
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_second_frame_dropped_while_pending() {
        let (release, gate) = std::sync::mpsc::channel();
        let analyzer = FakeAnalyzer {
            gate: Some(Mutex::new(gate)),
            ..FakeAnalyzer::instant()
        };
        let engine = spawn_engine(Arc::new(analyzer), Duration::from_secs(5));

        let pending = engine.submit(frame(1), AnalyzeOptions::default()).unwrap();
        assert!(engine.is_busy());
        assert!(matches!(
            engine.submit(frame(2), AnalyzeOptions::default()),
            Err(EngineError::Busy)
        ));
        // clones share the in-flight slot
        assert!(matches!(
            engine.clone().submit(frame(3), AnalyzeOptions::default()),
            Err(EngineError::Busy)
        ));

        release.send(()).unwrap();
        let result = pending.wait().await.unwrap();
        assert_eq!(result.seq, 1);
        assert!(!engine.is_busy());

        release.send(()).unwrap();
        let next = engine
            .detect_and_recognize(frame(4), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(next.seq, 4);
    }

    #[tokio::test]
    async fn test_timeout_frees_the_slot() {
        let analyzer = FakeAnalyzer {
            delay: Duration::from_millis(300),
            ..FakeAnalyzer::instant()
        };
        let engine = spawn_engine(Arc::new(analyzer), Duration::from_millis(20));

        let err = engine
            .detect_and_recognize(frame(1), AnalyzeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_inference_error_propagates() {
        let analyzer = FakeAnalyzer {
            fail: true,
            ..FakeAnalyzer::instant()
        };
        let engine = spawn_engine(Arc::new(analyzer), Duration::from_secs(5));
        let err = engine
            .detect_and_recognize(frame(1), AnalyzeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Inference(InferenceError::EmptyCrop)));
        assert!(!engine.is_busy());
    }
}
