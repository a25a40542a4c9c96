use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::liveness::LivenessVerdict;
use crate::types::{Detection, Frame, Recognition};

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to load model {path}: {detail}")]
    Load { path: String, detail: String },
    #[error("inference failed in {model}: {detail}")]
    Run { model: &'static str, detail: String },
    #[error("unexpected output from {model}: {detail}")]
    UnexpectedOutput { model: &'static str, detail: String },
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("session pool: {0}")]
    Pool(String),
}

impl InferenceError {
    pub(crate) fn run(model: &'static str, e: impl std::fmt::Display) -> Self {
        InferenceError::Run {
            model,
            detail: e.to_string(),
        }
    }
}

/// Per-request switches, read from the live settings at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalyzeOptions {
    /// Run anti-spoofing on faces the recognizer identified.
    pub liveness: bool,
}

/// Everything the inference stage knows about one face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceAnalysis {
    pub detection: Detection,
    /// `None` when recognition failed for this face; an unknown face carries
    /// `Some` with `person_id: None`.
    pub recognition: Option<Recognition>,
    pub liveness: LivenessVerdict,
}

impl FaceAnalysis {
    pub fn person_id(&self) -> Option<&str> {
        self.recognition
            .as_ref()
            .and_then(|r| r.person_id.as_deref())
    }
}

/// Detect + recognize (+ selectively liveness) on a full frame.
///
/// Implementations block; callers run them off the capture path.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(
        &self,
        frame: &Frame,
        options: AnalyzeOptions,
    ) -> Result<Vec<FaceAnalysis>, InferenceError>;
}
