//! Anti-spoofing gate for recognized faces.
//!
//! A two-class classifier (live vs. spoof) runs on an inflated crop around the
//! face. Running it costs a full model pass per face, so the gate only fires
//! for faces the recognizer already matched to an enrolled identity; unknown
//! faces can never log attendance, so checking them buys nothing.
//!
//! # Status mapping
//!
//! - `Live` / `Spoof`: softmax winner, when its probability clears the
//!   borderline threshold.
//! - `Borderline`: winner probability below the threshold.
//! - `Error`: crop or inference failed.
//! - `Unchecked`: the gate did not run (unknown face or spoof detection off).
//!
//! `Spoof`, `Borderline` and `Error` are non-logging: such faces are excluded
//! from attendance and rendered without identity.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::inference::InferenceError;
use crate::types::{BoundingBox, Recognition};

pub const DEFAULT_INFLATE: f32 = 1.5;
pub const DEFAULT_INPUT_SIZE: u32 = 80;
pub const DEFAULT_BORDERLINE_CONFIDENCE: f32 = 0.6;

/// Classifier output for one face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    pub is_live: bool,
    /// Probability of the winning class.
    pub confidence: f32,
    /// `live_logit - spoof_logit`.
    pub score: f32,
}

impl LivenessResult {
    /// Softmax over the two logits.
    pub fn from_logits(live_logit: f32, spoof_logit: f32) -> Self {
        // shift by max for numerical stability
        let m = live_logit.max(spoof_logit);
        let live_exp = (live_logit - m).exp();
        let spoof_exp = (spoof_logit - m).exp();
        let total = live_exp + spoof_exp;
        let live_prob = live_exp / total;
        let spoof_prob = spoof_exp / total;

        LivenessResult {
            is_live: live_prob >= spoof_prob,
            confidence: live_prob.max(spoof_prob),
            score: live_logit - spoof_logit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Live,
    Spoof,
    Borderline,
    Error,
    Unchecked,
}

impl LivenessStatus {
    /// Whether this status excludes the face from attendance logging and
    /// "recognized" feedback.
    pub fn blocks_logging(self) -> bool {
        matches!(
            self,
            LivenessStatus::Spoof | LivenessStatus::Borderline | LivenessStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LivenessStatus::Live => "live",
            LivenessStatus::Spoof => "spoof",
            LivenessStatus::Borderline => "borderline",
            LivenessStatus::Error => "error",
            LivenessStatus::Unchecked => "unchecked",
        }
    }
}

/// Gate outcome attached to a face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub status: LivenessStatus,
    pub result: Option<LivenessResult>,
}

impl LivenessVerdict {
    pub fn unchecked() -> Self {
        Self {
            status: LivenessStatus::Unchecked,
            result: None,
        }
    }

    pub fn error() -> Self {
        Self {
            status: LivenessStatus::Error,
            result: None,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        self.result.map(|r| r.confidence)
    }
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Crop inflation around the detected box.
    pub inflate: f32,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Winner probability below this is reported as `Borderline`.
    pub borderline_confidence: f32,
    /// Output index of the "live" logit; the other of the first two is "spoof".
    pub live_class: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            inflate: DEFAULT_INFLATE,
            input_size: DEFAULT_INPUT_SIZE,
            borderline_confidence: DEFAULT_BORDERLINE_CONFIDENCE,
            live_class: 0,
        }
    }
}

/// Backend that turns a preprocessed NCHW crop into class logits.
pub trait LivenessModel {
    fn logits(&mut self, input: Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

/// Only faces matched to an enrolled identity are worth a liveness pass.
pub fn should_check(recognition: Option<&Recognition>, spoof_detection: bool) -> bool {
    spoof_detection && recognition.is_some_and(Recognition::is_identified)
}

/// Cut the inflated face region out of the frame.
pub fn crop_face(
    image: &RgbImage,
    bbox: &BoundingBox,
    inflate: f32,
) -> Result<RgbImage, InferenceError> {
    let region = bbox.inflate(inflate, image.width(), image.height());
    let x = region.x.floor() as u32;
    let y = region.y.floor() as u32;
    let w = (region.width.round() as u32).min(image.width().saturating_sub(x));
    let h = (region.height.round() as u32).min(image.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return Err(InferenceError::EmptyCrop);
    }
    Ok(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Resize a crop to the model input and lay it out as `[1, 3, size, size]`
/// with values scaled to `[0, 1]`.
pub fn to_input_tensor(crop: &RgbImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);
    let size = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Map a classifier result onto a gate status.
pub fn classify(result: &LivenessResult, borderline_confidence: f32) -> LivenessStatus {
    if result.confidence < borderline_confidence {
        LivenessStatus::Borderline
    } else if result.is_live {
        LivenessStatus::Live
    } else {
        LivenessStatus::Spoof
    }
}

/// Run the full gate on one face. Never fails: problems become `Error`.
pub fn evaluate(
    model: &mut dyn LivenessModel,
    image: &RgbImage,
    bbox: &BoundingBox,
    config: &LivenessConfig,
) -> LivenessVerdict {
    match run_gate(model, image, bbox, config) {
        Ok(result) => {
            let status = classify(&result, config.borderline_confidence);
            tracing::debug!(
                status = status.as_str(),
                confidence = result.confidence,
                score = result.score,
                "liveness evaluated"
            );
            LivenessVerdict {
                status,
                result: Some(result),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "liveness check failed");
            LivenessVerdict::error()
        }
    }
}

fn run_gate(
    model: &mut dyn LivenessModel,
    image: &RgbImage,
    bbox: &BoundingBox,
    config: &LivenessConfig,
) -> Result<LivenessResult, InferenceError> {
    let crop = crop_face(image, bbox, config.inflate)?;
    let input = to_input_tensor(&crop, config.input_size);
    let logits = model.logits(input)?;
    if logits.len() < 2 {
        return Err(InferenceError::UnexpectedOutput {
            model: "liveness",
            detail: format!("expected 2 logits, got {}", logits.len()),
        });
    }
    let live = config.live_class.min(1);
    let spoof = 1 - live;
    Ok(LivenessResult::from_logits(logits[live], logits[spoof]))
}
