use serde::Serialize;

use crate::{bounding_box::BoundingBox, labels::label_for};

/// Pixel coordinates of a detection, top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

/// A single detection as reported to API clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Class label, see [`crate::labels::label_for`].
    #[serde(rename = "class")]
    pub class_name: String,
    /// Detector score rounded to two decimals.
    pub confidence: f64,
    /// Box in original image pixels.
    pub bbox: BBox,
}

impl Detection {
    /// Map a detector bounding box to a response record.
    pub fn from_bounding_box(bbox: &BoundingBox) -> Self {
        Self {
            class_name: label_for(bbox.class).into_owned(),
            confidence: round_confidence(bbox.confidence),
            bbox: BBox {
                x1: bbox.xmin,
                y1: bbox.ymin,
                x2: bbox.xmax,
                y2: bbox.ymax,
            },
        }
    }
}

/// Dimensions of the decoded upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageDimensions {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
}

/// Round a score to two decimals, clamped to `[0, 1]`.
pub fn round_confidence(confidence: f32) -> f64 {
    ((confidence as f64).clamp(0., 1.) * 100.).round() / 100.
}
