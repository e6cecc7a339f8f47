//! Task payload codec: raw upload bytes → bounded RGB raster.
//!
//! Runs in the parent before any worker exists, so a malformed upload is
//! rejected without paying for a process spawn. The output never exceeds
//! `max_dimension` on its longest side, which bounds both the worker's
//! memory and the size of the request written over the IPC pipe.
//!
//! Decoding is CPU-bound; callers on an async runtime should run
//! [`prepare`] inside `spawn_blocking`.

use crate::error::ServiceError;
use crate::pipeline::ipc::base64_bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Preprocessed input for one task invocation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8 pixels, `width * height * 3` bytes.
    #[serde(with = "base64_bytes")]
    pub pixels: Vec<u8>,
}

impl fmt::Debug for TaskInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInput")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels", &format_args!("<{} bytes>", self.pixels.len()))
            .finish()
    }
}

impl TaskInput {
    /// Wrap an RGB raster.
    pub fn from_image(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixels: img.into_raw(),
        }
    }

    /// A uniformly white raster, used for warmup probes.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::from_image(RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255])))
    }

    /// Check that the pixel buffer matches the declared dimensions.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("empty raster {}x{}", self.width, self.height));
        }
        let expected = self.width as usize * self.height as usize * 3;
        if self.pixels.len() != expected {
            return Err(format!(
                "pixel buffer is {} bytes, expected {expected} for {}x{}",
                self.pixels.len(),
                self.width,
                self.height
            ));
        }
        Ok(())
    }

    /// Copy the pixels back into an image buffer.
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

/// Fractional region of interest, relative to image size.
///
/// Values are not required to lie in `[0, 1]`; [`Roi::crop_rect`] clamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Pixel-space crop rectangle, always inside the image and non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// Parse the `roi` form field (`{"x":..,"y":..,"w":..,"h":..}`).
    ///
    /// Returns `None` for anything malformed: invalid JSON, a missing field,
    /// or a value that is neither a number nor a numeric string.
    pub fn parse(raw: &str) -> Option<Roi> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Ignoring ROI: not valid JSON ({e})");
                return None;
            }
        };
        let field = |name: &str| -> Option<f64> {
            let n = match value.get(name)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }?;
            n.is_finite().then_some(n)
        };
        match (field("x"), field("y"), field("w"), field("h")) {
            (Some(x), Some(y), Some(w), Some(h)) => Some(Roi { x, y, w, h }),
            _ => {
                warn!("Ignoring ROI: missing or non-numeric field in {raw}");
                None
            }
        }
    }

    /// Convert to a pixel rectangle inside `[0, width) × [0, height)`.
    pub fn crop_rect(&self, width: u32, height: u32) -> CropRect {
        let (x, w) = clamp_span(self.x, self.w, width);
        let (y, h) = clamp_span(self.y, self.h, height);
        CropRect {
            x,
            y,
            width: w,
            height: h,
        }
    }
}

/// Clamp one axis: start in `[0, extent - 1]`, length in `[1, extent - start]`.
fn clamp_span(start: f64, len: f64, extent: u32) -> (u32, u32) {
    if extent == 0 {
        return (0, 0);
    }
    let extent = i64::from(extent);
    // Float → int casts saturate, so huge or tiny fractions stay in range.
    let s = ((start * extent as f64).floor() as i64).clamp(0, extent - 1);
    let l = ((len * extent as f64).floor() as i64).clamp(1, extent - s);
    (s as u32, l as u32)
}

/// Dimensions after bounding the longest side to `max_dimension`.
///
/// Unchanged when already within bounds; otherwise the longer side becomes
/// exactly `max_dimension` and the shorter one is rounded to the nearest
/// pixel (minimum 1).
pub fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension {
        return (width, height);
    }
    let scale = |side: u32| -> u32 {
        let scaled = (u64::from(side) * u64::from(max_dimension) + u64::from(longest) / 2)
            / u64::from(longest);
        (scaled as u32).max(1)
    };
    if width >= height {
        (max_dimension, scale(height))
    } else {
        (scale(width), max_dimension)
    }
}

/// Decode, optionally crop, and bound an uploaded image.
///
/// # Errors
/// [`ServiceError::Decode`] when the bytes are not a supported image. A
/// malformed ROI is not an error; the whole image is used instead.
pub fn prepare(raw: &[u8], roi: Option<&str>, max_dimension: u32) -> Result<TaskInput, ServiceError> {
    let decoded = image::load_from_memory(raw).map_err(|e| ServiceError::Decode(e.to_string()))?;
    let mut img = decoded.into_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(ServiceError::Decode("image has no pixels".into()));
    }
    debug!("Decoded upload → {}x{} px", img.width(), img.height());

    if let Some(roi) = roi.and_then(Roi::parse) {
        let rect = roi.crop_rect(img.width(), img.height());
        debug!("Cropping to {:?}", rect);
        img = imageops::crop_imm(&img, rect.x, rect.y, rect.width, rect.height).to_image();
    }

    let (w, h) = scaled_dimensions(img.width(), img.height(), max_dimension);
    if (w, h) != img.dimensions() {
        debug!("Downscaling {}x{} → {w}x{h}", img.width(), img.height());
        img = imageops::resize(&img, w, h, FilterType::Triangle);
    }

    Ok(TaskInput::from_image(img))
}
