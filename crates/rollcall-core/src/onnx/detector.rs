//! SCRFD face detector (`det_10g.onnx`).
//!
//! The model sees a 640×640 letterboxed frame and emits, for each of three
//! feature strides, per-anchor scores, box distances and five-point landmark
//! offsets. Decoding follows the usual anchor-free SCRFD layout: two anchors
//! per grid cell, distances scaled by the stride.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::inference::InferenceError;
use crate::types::{BoundingBox, Detection, Landmarks};

const MODEL: &str = "detector";
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const NORM_MEAN: f32 = 127.5;
const NORM_STD: f32 = 128.0;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub input_size: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

pub struct ScrfdDetector {
    session: ort::session::Session,
    config: DetectorConfig,
}

impl ScrfdDetector {
    pub fn load(path: &Path, config: DetectorConfig) -> Result<Self, InferenceError> {
        let session = super::load_session(path)?;
        tracing::debug!(path = %path.display(), "detector session loaded");
        Ok(Self { session, config })
    }

    /// Faces in `image`, highest score first, in frame coordinates.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        let (input, scale) = letterbox(image, self.config.input_size);
        let outputs = super::run_model(&mut self.session, input, MODEL)?;
        if outputs.len() < STRIDES.len() * 3 {
            return Err(InferenceError::UnexpectedOutput {
                model: MODEL,
                detail: format!("expected 9 outputs, got {}", outputs.len()),
            });
        }

        let n = STRIDES.len();
        let mut candidates = Vec::new();
        for (i, &stride) in STRIDES.iter().enumerate() {
            candidates.extend(decode_stride(
                &outputs[i],
                &outputs[i + n],
                &outputs[i + 2 * n],
                stride,
                self.config.input_size,
                self.config.score_threshold,
            ));
        }

        let kept = nms(candidates, self.config.nms_threshold);
        Ok(kept
            .into_iter()
            .map(|c| to_frame(c, scale, image.width(), image.height()))
            .collect())
    }
}

/// Resize keeping aspect ratio, pad bottom/right, normalize to NCHW.
/// Returns the tensor and the scale applied to the frame.
fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, f32) {
    let (w, h) = image.dimensions();
    let scale = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
    let nw = ((w as f32 * scale).round() as u32).clamp(1, size);
    let nh = ((h as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, nw, nh, FilterType::Triangle);

    let s = size as usize;
    // padding normalizes to the value of a black pixel
    let mut tensor = Array4::<f32>::from_elem((1, 3, s, s), -NORM_MEAN / NORM_STD);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - NORM_MEAN) / NORM_STD;
        }
    }
    (tensor, scale)
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: Landmarks,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let iw = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let ih = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = iw * ih;
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }
}

/// Decode one stride's flattened outputs in input-tensor coordinates.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: u32,
    input_size: u32,
    threshold: f32,
) -> Vec<Candidate> {
    let side = (input_size / stride) as usize;
    let anchors = side * side * ANCHORS_PER_CELL;
    let s = stride as f32;
    let mut out = Vec::new();

    for (idx, &score) in scores.iter().enumerate().take(anchors) {
        if score < threshold {
            continue;
        }
        let b = idx * 4;
        let k = idx * 10;
        if b + 4 > boxes.len() || k + 10 > kps.len() {
            break;
        }
        let cell = idx / ANCHORS_PER_CELL;
        let cx = (cell % side) as f32 * s;
        let cy = (cell / side) as f32 * s;

        let mut landmarks = [(0.0, 0.0); 5];
        for (p, point) in landmarks.iter_mut().enumerate() {
            *point = (cx + kps[k + 2 * p] * s, cy + kps[k + 2 * p + 1] * s);
        }

        out.push(Candidate {
            x1: cx - boxes[b] * s,
            y1: cy - boxes[b + 1] * s,
            x2: cx + boxes[b + 2] * s,
            y2: cy + boxes[b + 3] * s,
            score,
            landmarks,
        });
    }
    out
}

fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn to_frame(c: Candidate, scale: f32, width: u32, height: u32) -> Detection {
    let (fw, fh) = (width as f32, height as f32);
    let x1 = (c.x1 / scale).clamp(0.0, fw);
    let y1 = (c.y1 / scale).clamp(0.0, fh);
    let x2 = (c.x2 / scale).clamp(0.0, fw);
    let y2 = (c.y2 / scale).clamp(0.0, fh);

    let mut landmarks = c.landmarks;
    for point in landmarks.iter_mut() {
        *point = (point.0 / scale, point.1 / scale);
    }

    Detection {
        bbox: BoundingBox::from_corners(x1, y1, x2, y2),
        confidence: c.score,
        landmarks,
        track_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_letterbox_shape_and_padding() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, scale) = letterbox(&image, 640);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((scale - 2.0).abs() < 1e-6);
        // content
        assert!((tensor[[0, 0, 10, 10]] - (127.5 / 128.0)).abs() < 1e-3);
        // padding below the resized content
        assert!((tensor[[0, 0, 600, 10]] - (-127.5 / 128.0)).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_places_anchor() {
        // stride 32 on a 64 input: 2x2 cells, 8 anchors
        let mut scores = vec![0.0; 8];
        let mut boxes = vec![0.0; 32];
        let mut kps = vec![0.0; 80];
        // anchor 3 -> cell 1 -> (x=32, y=0)
        scores[3] = 0.9;
        boxes[12..16].copy_from_slice(&[0.5, 0.25, 0.5, 1.0]);
        kps[30] = 0.1;
        kps[31] = 0.2;

        let out = decode_stride(&scores, &boxes, &kps, 32, 64, 0.5);
        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (16.0, -8.0, 48.0, 32.0));
        assert!((c.landmarks[0].0 - 35.2).abs() < 1e-4);
        assert!((c.landmarks[0].1 - 6.4).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_threshold() {
        let scores = vec![0.49; 8];
        let out = decode_stride(&scores, &[0.0; 32], &[0.0; 80], 32, 64, 0.5);
        assert!(out.is_empty());
    }

    #[test]
    fn test_nms_suppresses_overlap() {
        let kept = nms(
            vec![
                candidate(0.0, 0.0, 100.0, 100.0, 0.8),
                candidate(5.0, 5.0, 105.0, 105.0, 0.9),
                candidate(300.0, 300.0, 400.0, 400.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn test_to_frame_rescales_and_clamps() {
        let det = to_frame(candidate(-10.0, 20.0, 200.0, 120.0, 0.8), 2.0, 90, 100);
        assert_eq!(det.bbox, BoundingBox::from_corners(0.0, 10.0, 90.0, 60.0));
        assert_eq!(det.confidence, 0.8);
        assert_eq!(det.track_id, None);
    }
}
