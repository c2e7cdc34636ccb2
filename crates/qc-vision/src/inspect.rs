use serde::Serialize;

/// Upper bound on an accepted frame (10 MiB).
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Largest frame handed to the inference engine.
pub const INFERENCE_MAX: Dimensions = Dimensions::new(1920, 1080);

/// Bound for stored thumbnails.
pub const THUMBNAIL_MAX: Dimensions = Dimensions::new(640, 480);

const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatCheck {
    pub valid: bool,
    pub format: ImageFormat,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeCheck {
    pub valid: bool,
    pub size: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageValidation {
    pub valid: bool,
    pub format: ImageFormat,
    pub size: usize,
    pub dimensions: Option<Dimensions>,
    /// Whether the frame exceeds [`INFERENCE_MAX`].
    pub needs_resize: bool,
    pub errors: Vec<String>,
}

pub fn detect_format(bytes: &[u8]) -> ImageFormat {
    if bytes.starts_with(&JPEG_SOI) {
        ImageFormat::Jpeg
    } else if bytes.starts_with(&PNG_SIGNATURE) {
        ImageFormat::Png
    } else {
        ImageFormat::Unknown
    }
}

pub fn validate_format(bytes: &[u8]) -> FormatCheck {
    if bytes.is_empty() {
        return FormatCheck {
            valid: false,
            format: ImageFormat::Unknown,
            error: Some("Empty image data".into()),
        };
    }
    match detect_format(bytes) {
        ImageFormat::Unknown => FormatCheck {
            valid: false,
            format: ImageFormat::Unknown,
            error: Some("Unsupported image format. Only JPEG and PNG are allowed".into()),
        },
        format => FormatCheck {
            valid: true,
            format,
            error: None,
        },
    }
}

pub fn validate_size(bytes: &[u8]) -> SizeCheck {
    let size = bytes.len();
    if size > MAX_IMAGE_BYTES {
        SizeCheck {
            valid: false,
            size,
            error: Some(format!("Image size {} bytes exceeds 10MB limit", size)),
        }
    } else {
        SizeCheck {
            valid: true,
            size,
            error: None,
        }
    }
}

/// Read width/height from the JPEG SOF or PNG IHDR header.
pub fn extract_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    match detect_format(bytes) {
        ImageFormat::Jpeg => jpeg_dimensions(bytes),
        ImageFormat::Png => png_dimensions(bytes),
        ImageFormat::Unknown => None,
    }
}

fn be16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

fn be32(bytes: &[u8], at: usize) -> Option<u32> {
    let s = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    let mut pos = 2;
    while pos + 1 < bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        match marker {
            // fill byte before a marker
            0xFF => pos += 1,
            // SOF0..SOF3: FF Cn len(2) precision(1) height(2) width(2)
            0xC0..=0xC3 => {
                let height = be16(bytes, pos + 5)?;
                let width = be16(bytes, pos + 7)?;
                return Some(Dimensions::new(width as u32, height as u32));
            }
            // standalone markers carry no length
            0x01 | 0xD0..=0xD9 => pos += 2,
            _ => {
                let len = be16(bytes, pos + 2)? as usize;
                if len < 2 {
                    return None;
                }
                pos += 2 + len;
            }
        }
    }
    None
}

fn png_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    if bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    Some(Dimensions {
        width: be32(bytes, 16)?,
        height: be32(bytes, 20)?,
    })
}

pub fn needs_resize(dims: Dimensions, max: Dimensions) -> bool {
    dims.width > max.width || dims.height > max.height
}

/// Scale `dims` down to fit inside `max`, keeping the aspect ratio.
/// Dimensions that already fit come back unchanged; outputs are never zero.
pub fn compute_fit_dimensions(dims: Dimensions, max: Dimensions) -> Dimensions {
    if !needs_resize(dims, max) {
        return dims;
    }
    let scale = f64::min(
        max.width as f64 / dims.width as f64,
        max.height as f64 / dims.height as f64,
    );
    let fit = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    Dimensions::new(fit(dims.width), fit(dims.height))
}

/// Never fails; each problem lands in `errors` and clears `valid`.
pub fn validate_image(bytes: &[u8]) -> ImageValidation {
    let format = validate_format(bytes);
    let size = validate_size(bytes);

    let errors: Vec<String> = [format.error.clone(), size.error.clone()]
        .into_iter()
        .flatten()
        .collect();
    let dimensions = if format.valid {
        extract_dimensions(bytes)
    } else {
        None
    };

    ImageValidation {
        valid: errors.is_empty(),
        format: format.format,
        size: size.size,
        dimensions,
        needs_resize: dimensions.map(|d| needs_resize(d, INFERENCE_MAX)).unwrap_or(false),
        errors,
    }
}
