use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned face box in frame pixel coordinates (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Euclidean distance between the two box centres.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Ratio of the smaller area to the larger one, in `[0, 1]`.
    pub fn size_ratio(&self, other: &BoundingBox) -> f32 {
        let a = self.area();
        let b = other.area();
        if a <= 0.0 || b <= 0.0 {
            return 0.0;
        }
        a.min(b) / a.max(b)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    /// Grow the box around its centre by `factor` and clamp it to the frame.
    pub fn inflate(&self, factor: f32, frame_width: u32, frame_height: u32) -> BoundingBox {
        let (cx, cy) = self.center();
        let w = self.width * factor;
        let h = self.height * factor;
        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(frame_width as f32);
        let y2 = (cy + h / 2.0).min(frame_height as f32);
        BoundingBox::from_corners(x1, y1, x2, y2)
    }
}

/// Five facial landmarks: left eye, right eye, nose, left mouth, right mouth.
pub type Landmarks = [(f32, f32); 5];

/// One detector hit in a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Landmarks,
    /// Filled in by the tracker once the detection is associated.
    pub track_id: Option<u32>,
}

/// Gallery match for a detection. `person_id` is `None` when nothing cleared
/// the similarity threshold; `similarity` is still the best score seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub person_id: Option<String>,
    pub member_name: Option<String>,
    pub similarity: f32,
}

impl Recognition {
    pub fn unknown(similarity: f32) -> Self {
        Self {
            person_id: None,
            member_name: None,
            similarity,
        }
    }

    pub fn is_identified(&self) -> bool {
        self.person_id.is_some()
    }
}

/// A captured RGB frame. `seq` increases monotonically per capture session.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(seq: u64, captured_at: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_distance() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(3.0, 4.0, 10.0, 10.0);
        assert!((a.center_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_size_ratio_symmetric() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(0.0, 0.0, 20.0, 10.0);
        assert!((a.size_ratio(&b) - 0.5).abs() < 1e-6);
        assert!((b.size_ratio(&a) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 10.0, 10.0);
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn test_inflate_clamps_to_frame() {
        let b = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let grown = b.inflate(1.5, 120, 120);
        assert_eq!(grown.x, 0.0);
        assert_eq!(grown.y, 0.0);
        assert!((grown.width - 120.0).abs() < 1e-4);
        assert!((grown.height - 120.0).abs() < 1e-4);
    }

    #[test]
    fn test_inflate_keeps_center_when_room() {
        let b = BoundingBox::new(100.0, 100.0, 40.0, 40.0);
        let grown = b.inflate(1.5, 640, 480);
        assert_eq!(grown.center(), b.center());
        assert!((grown.width - 60.0).abs() < 1e-4);
    }
}
