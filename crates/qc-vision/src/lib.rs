pub mod camera;
pub mod checklist;
pub mod inspect;
pub mod labels;
pub mod normalize;
pub mod resize;

pub use checklist::{check_legacy, check_vision, compare_labels, normalize_label, LabelComparison};
pub use inspect::{Dimensions, ImageFormat, ImageValidation, INFERENCE_MAX, THUMBNAIL_MAX};
pub use labels::{map_detections, map_label, LabelMatch};
pub use normalize::{PixelBox, RawDetection, DEFAULT_SCORE_THRESHOLD};
