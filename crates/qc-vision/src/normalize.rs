use qc_proto::{BoundingBox, VisionDetectedObject};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.5;

/// Box corners in pixels, as returned by the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: PixelBox,
}

/// Keep detections scoring strictly above `threshold`.
pub fn filter_by_confidence(detections: &[RawDetection], threshold: f64) -> Vec<RawDetection> {
    detections.iter().filter(|d| d.score > threshold).cloned().collect()
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Convert pixel corners to fractions of the image; each field is clamped to 0..1 on its own.
pub fn normalize_bounding_box(b: &PixelBox, image_width: u32, image_height: u32) -> BoundingBox {
    if image_width == 0 || image_height == 0 {
        return BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
        };
    }
    let w = image_width as f64;
    let h = image_height as f64;
    BoundingBox {
        x: clamp01(b.xmin / w),
        y: clamp01(b.ymin / h),
        width: clamp01((b.xmax - b.xmin) / w),
        height: clamp01((b.ymax - b.ymin) / h),
    }
}

pub fn transform_detection(
    raw: &RawDetection,
    image_width: u32,
    image_height: u32,
) -> VisionDetectedObject {
    VisionDetectedObject {
        label: raw.label.clone(),
        confidence: raw.score,
        bbox: normalize_bounding_box(&raw.bbox, image_width, image_height),
    }
}

/// Filter on raw score, then normalize what is left.
pub fn transform_detection_results(
    raw: &[RawDetection],
    image_width: u32,
    image_height: u32,
    threshold: f64,
) -> Vec<VisionDetectedObject> {
    filter_by_confidence(raw, threshold)
        .iter()
        .map(|d| transform_detection(d, image_width, image_height))
        .collect()
}
