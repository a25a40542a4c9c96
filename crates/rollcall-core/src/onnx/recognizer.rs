//! ArcFace embedding model (`w600k_r50.onnx`).

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;

use crate::inference::InferenceError;
use crate::types::{BoundingBox, Landmarks};

const MODEL: &str = "recognizer";
const INPUT_SIZE: u32 = 112;
const NORM_MEAN: f32 = 127.5;
const NORM_STD: f32 = 127.5;

pub const EMBEDDING_DIM: usize = 512;

/// Canonical landmark positions in the 112×112 aligned crop.
const REFERENCE: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub struct ArcFaceRecognizer {
    session: ort::session::Session,
}

impl ArcFaceRecognizer {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let session = super::load_session(path)?;
        tracing::debug!(path = %path.display(), "recognizer session loaded");
        Ok(Self { session })
    }

    /// L2-normalized embedding of the face at `bbox`/`landmarks`.
    pub fn embed(
        &mut self,
        image: &RgbImage,
        bbox: &BoundingBox,
        landmarks: &Landmarks,
    ) -> Result<Vec<f32>, InferenceError> {
        let aligned = align_face(image, bbox, landmarks)?;
        let outputs = super::run_model(&mut self.session, to_input_tensor(&aligned), MODEL)?;
        let mut embedding = outputs
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::UnexpectedOutput {
                model: MODEL,
                detail: "no outputs".into(),
            })?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(InferenceError::UnexpectedOutput {
                model: MODEL,
                detail: format!("expected {EMBEDDING_DIM} values, got {}", embedding.len()),
            });
        }
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

/// Warp the face onto the canonical 112×112 template using a least-squares
/// similarity transform of the five landmarks. Falls back to a plain crop
/// and resize when the landmarks are degenerate.
pub fn align_face(
    image: &RgbImage,
    bbox: &BoundingBox,
    landmarks: &Landmarks,
) -> Result<RgbImage, InferenceError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(InferenceError::EmptyCrop);
    }
    match similarity_transform(landmarks, &REFERENCE) {
        Some(t) => Ok(warp(image, &t)),
        None => crop_resize(image, bbox),
    }
}

/// `dst = [a -b; b a] * src + (tx, ty)`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Map a destination pixel back into the source image.
    fn invert_point(&self, u: f32, v: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let du = u - self.tx;
        let dv = v - self.ty;
        ((self.a * du + self.b * dv) / det, (-self.b * du + self.a * dv) / det)
    }
}

fn similarity_transform(src: &Landmarks, dst: &Landmarks) -> Option<Similarity> {
    let n = src.len() as f32;
    let (sx, sy) = src.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    let (dx, dy) = dst.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    let (sx, sy, dx, dy) = (sx / n, sy / n, dx / n, dy / n);

    let mut norm = 0.0;
    let mut dot = 0.0;
    let mut cross = 0.0;
    for (p, q) in src.iter().zip(dst.iter()) {
        let (px, py) = (p.0 - sx, p.1 - sy);
        let (qx, qy) = (q.0 - dx, q.1 - dy);
        norm += px * px + py * py;
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
    }
    if norm < 1e-6 {
        return None;
    }

    let a = dot / norm;
    let b = cross / norm;
    if a * a + b * b < 1e-12 {
        return None;
    }
    Some(Similarity {
        a,
        b,
        tx: dx - (a * sx - b * sy),
        ty: dy - (b * sx + a * sy),
    })
}

fn warp(image: &RgbImage, t: &Similarity) -> RgbImage {
    RgbImage::from_fn(INPUT_SIZE, INPUT_SIZE, |u, v| {
        let (x, y) = t.invert_point(u as f32, v as f32);
        bilinear(image, x, y)
    })
}

fn bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if x < 0.0 || y < 0.0 || x > w - 1.0 || y > h - 1.0 {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);
    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn crop_resize(image: &RgbImage, bbox: &BoundingBox) -> Result<RgbImage, InferenceError> {
    let region = bbox.inflate(1.0, image.width(), image.height());
    let x = region.x.floor() as u32;
    let y = region.y.floor() as u32;
    let w = (region.width.round() as u32).min(image.width().saturating_sub(x));
    let h = (region.height.round() as u32).min(image.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return Err(InferenceError::EmptyCrop);
    }
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    Ok(imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

fn to_input_tensor(aligned: &RgbImage) -> Array4<f32> {
    let s = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - NORM_MEAN) / NORM_STD;
        }
    }
    tensor
}

pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform_for_reference_landmarks() {
        let t = similarity_transform(&REFERENCE, &REFERENCE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3);
        assert!(t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_and_shifted_landmarks_recovered() {
        let src: Landmarks = REFERENCE.map(|(x, y)| (x * 2.0 + 100.0, y * 2.0 + 50.0));
        let t = similarity_transform(&src, &REFERENCE).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        // a destination point maps back onto its source
        let (x, y) = t.invert_point(REFERENCE[2].0, REFERENCE[2].1);
        assert!((x - src[2].0).abs() < 1e-2);
        assert!((y - src[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks_fall_back_to_crop() {
        let image = RgbImage::from_pixel(200, 200, Rgb([10, 20, 30]));
        let bbox = BoundingBox::new(50.0, 50.0, 80.0, 80.0);
        let aligned = align_face(&image, &bbox, &[(60.0, 60.0); 5]).unwrap();
        assert_eq!(aligned.dimensions(), (112, 112));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_aligned_crop_samples_inside_face() {
        let image = RgbImage::from_pixel(400, 400, Rgb([200, 100, 50]));
        let src: Landmarks = REFERENCE.map(|(x, y)| (x + 100.0, y + 100.0));
        let aligned = align_face(&image, &BoundingBox::default(), &src).unwrap();
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_input_tensor_normalization() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let t = to_input_tensor(&aligned);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
