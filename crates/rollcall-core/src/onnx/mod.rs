//! ONNX Runtime adapters for the three face models.
//!
//! Each model is wrapped in a small struct that owns an `ort` session and
//! knows its own pre/post-processing. [`OnnxFaceAnalyzer`] pools those
//! wrappers and implements [`crate::FrameAnalyzer`] on top of them.

mod analyzer;
mod detector;
mod gallery;
mod liveness_model;
mod recognizer;

use std::path::Path;

use crate::inference::InferenceError;

pub use analyzer::{ModelPaths, OnnxFaceAnalyzer};
pub use detector::{DetectorConfig, ScrfdDetector};
pub use gallery::{Gallery, GalleryEntry, GalleryError, DEFAULT_SIMILARITY_THRESHOLD};
pub use liveness_model::OnnxLivenessModel;
pub use recognizer::{align_face, ArcFaceRecognizer, EMBEDDING_DIM};

fn load_session(path: &Path) -> Result<ort::session::Session, InferenceError> {
    let load_err = |e: ort::Error| InferenceError::Load {
        path: path.display().to_string(),
        detail: e.to_string(),
    };
    ort::session::Session::builder()
        .map_err(load_err)?
        .commit_from_file(path)
        .map_err(load_err)
}

fn output_vec(
    value: &ort::value::DynValue,
    model: &'static str,
) -> Result<Vec<f32>, InferenceError> {
    let array = value
        .try_extract_array::<f32>()
        .map_err(|e| InferenceError::UnexpectedOutput {
            model,
            detail: e.to_string(),
        })?;
    Ok(array.iter().copied().collect())
}

/// Run a single-input model and copy every output out of the session's buffers.
fn run_model(
    session: &mut ort::session::Session,
    input: ndarray::Array4<f32>,
    model: &'static str,
) -> Result<Vec<Vec<f32>>, InferenceError> {
    let value =
        ort::value::Tensor::from_array(input).map_err(|e| InferenceError::run(model, e))?;
    let outputs = session
        .run(ort::inputs![value])
        .map_err(|e| InferenceError::run(model, e))?;
    let mut out = Vec::with_capacity(outputs.len());
    for i in 0..outputs.len() {
        out.push(output_vec(&outputs[i], model)?);
    }
    Ok(out)
}
