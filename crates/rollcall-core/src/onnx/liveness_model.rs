use std::path::Path;

use ndarray::Array4;

use crate::inference::InferenceError;
use crate::liveness::LivenessModel;

/// Two-class anti-spoofing classifier behind an `ort` session.
pub struct OnnxLivenessModel {
    session: ort::session::Session,
}

impl OnnxLivenessModel {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let session = super::load_session(path)?;
        tracing::debug!(path = %path.display(), "liveness session loaded");
        Ok(Self { session })
    }
}

impl LivenessModel for OnnxLivenessModel {
    fn logits(&mut self, input: Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        super::run_model(&mut self.session, input, "liveness")?
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::UnexpectedOutput {
                model: "liveness",
                detail: "no outputs".into(),
            })
    }
}
