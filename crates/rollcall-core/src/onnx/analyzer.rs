use std::path::{Path, PathBuf};
use std::sync::Arc;

use rollcall_models::{model_path, ModelRole};

use super::detector::{DetectorConfig, ScrfdDetector};
use super::gallery::Gallery;
use super::liveness_model::OnnxLivenessModel;
use super::recognizer::ArcFaceRecognizer;
use crate::inference::{AnalyzeOptions, FaceAnalysis, FrameAnalyzer, InferenceError};
use crate::liveness::{self, LivenessConfig, LivenessVerdict};
use crate::pool::{PoolConfig, PoolError, PoolStats, SessionPool};
use crate::types::Frame;

/// On-disk location of each model.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    /// `None` when no anti-spoofing model is installed; every liveness check
    /// then reports `Error`.
    pub liveness: Option<PathBuf>,
}

impl ModelPaths {
    pub fn from_dir(dir: &Path) -> Self {
        let liveness = model_path(dir, ModelRole::Liveness);
        Self {
            detector: model_path(dir, ModelRole::Detector),
            recognizer: model_path(dir, ModelRole::Recognizer),
            liveness: liveness.exists().then_some(liveness),
        }
    }
}

/// Detection, recognition and selective liveness over pooled ONNX sessions.
pub struct OnnxFaceAnalyzer {
    paths: ModelPaths,
    gallery: Arc<Gallery>,
    detector_config: DetectorConfig,
    liveness_config: LivenessConfig,
    detectors: SessionPool<ScrfdDetector>,
    recognizers: SessionPool<ArcFaceRecognizer>,
    liveness_models: SessionPool<OnnxLivenessModel>,
}

impl OnnxFaceAnalyzer {
    pub fn new(
        paths: ModelPaths,
        gallery: Arc<Gallery>,
        detector_config: DetectorConfig,
        liveness_config: LivenessConfig,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            paths,
            gallery,
            detector_config,
            liveness_config,
            detectors: SessionPool::new(pool_config.clone()),
            recognizers: SessionPool::new(pool_config.clone()),
            liveness_models: SessionPool::new(pool_config),
        }
    }

    /// Evict idle sessions from every pool.
    pub fn sweep(&self) -> usize {
        self.detectors.sweep() + self.recognizers.sweep() + self.liveness_models.sweep()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats = self.detectors.stats();
        stats.extend(self.recognizers.stats());
        stats.extend(self.liveness_models.stats());
        stats
    }

    fn check_liveness(&self, frame: &Frame, face: &FaceAnalysis) -> LivenessVerdict {
        let Some(path) = self.paths.liveness.as_deref() else {
            tracing::warn!("spoof detection enabled but no liveness model is installed");
            return LivenessVerdict::error();
        };
        let session = self
            .liveness_models
            .get_session(ModelRole::Liveness.id(), || OnnxLivenessModel::load(path));
        match session {
            Ok(mut model) => liveness::evaluate(
                &mut *model,
                &frame.image,
                &face.detection.bbox,
                &self.liveness_config,
            ),
            Err(e) => {
                tracing::warn!(error = %e, "liveness session unavailable");
                LivenessVerdict::error()
            }
        }
    }
}

fn pool_err(e: PoolError<InferenceError>) -> InferenceError {
    match e {
        PoolError::Construct { source, .. } => source,
        other => InferenceError::Pool(other.to_string()),
    }
}

impl FrameAnalyzer for OnnxFaceAnalyzer {
    fn analyze(
        &self,
        frame: &Frame,
        options: AnalyzeOptions,
    ) -> Result<Vec<FaceAnalysis>, InferenceError> {
        let detections = {
            let mut detector = self
                .detectors
                .get_session(ModelRole::Detector.id(), || {
                    ScrfdDetector::load(&self.paths.detector, self.detector_config.clone())
                })
                .map_err(pool_err)?;
            detector.detect(&frame.image)?
        };
        if detections.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self
            .recognizers
            .get_session(ModelRole::Recognizer.id(), || {
                ArcFaceRecognizer::load(&self.paths.recognizer)
            })
            .map_err(pool_err)?;

        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let embedding =
                match recognizer.embed(&frame.image, &detection.bbox, &detection.landmarks) {
                    Ok(embedding) => embedding,
                    Err(e) => {
                        tracing::warn!(
                            seq = frame.seq,
                            error = %e,
                            "recognition failed, face skipped"
                        );
                        continue;
                    }
                };
            let recognition = self.gallery.best_match(&embedding);
            faces.push(FaceAnalysis {
                detection,
                recognition: Some(recognition),
                liveness: LivenessVerdict::unchecked(),
            });
        }
        self.recognizers.release(recognizer);

        for face in faces.iter_mut() {
            if liveness::should_check(face.recognition.as_ref(), options.liveness) {
                face.liveness = self.check_liveness(frame, face);
            }
        }

        tracing::debug!(
            seq = frame.seq,
            faces = faces.len(),
            identified = faces.iter().filter(|f| f.person_id().is_some()).count(),
            "frame analyzed"
        );
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths_without_liveness_model() {
        let dir = std::env::temp_dir().join(format!("rollcall-models-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = ModelPaths::from_dir(&dir);
        assert!(paths.detector.ends_with("det_10g.onnx"));
        assert!(paths.recognizer.ends_with("w600k_r50.onnx"));
        assert!(paths.liveness.is_none());

        std::fs::write(dir.join("anti_spoofing.onnx"), b"stub").unwrap();
        assert!(ModelPaths::from_dir(&dir).liveness.is_some());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_pool_errors_keep_load_failures() {
        let err = pool_err(PoolError::Construct {
            model_id: "detector".into(),
            source: InferenceError::Load {
                path: "/nope".into(),
                detail: "missing".into(),
            },
        });
        assert!(matches!(err, InferenceError::Load { .. }));

        let err = pool_err(PoolError::Timeout {
            model_id: "detector".into(),
            waited: std::time::Duration::from_millis(10),
        });
        assert!(matches!(err, InferenceError::Pool(_)));
    }
}
