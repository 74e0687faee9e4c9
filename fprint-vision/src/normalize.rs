use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::capture::RawImage;
use crate::error::{Result, VisionError};

/// Side length of the square model input.
pub const INPUT_SIZE: u32 = 96;

/// Neighbourhood for the local mean, in pixels.
const BLOCK_SIZE: u32 = 11;
/// Subtracted from the local mean before comparing.
const THRESHOLD_C: i16 = 2;
/// The crop is taken slightly larger than the guide so the whole fingertip
/// survives.
const GUIDE_MARGIN: f32 = 1.1;

/// On-screen framing guide, in capture pixels. The guide is drawn in
/// portrait over a landscape sensor, so its height spans the frame width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuideWindow {
    pub width: u32,
    pub height: u32,
}

/// Model-ready input, laid out NHWC as `[1, 96, 96, 1]` with values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array4<f32>,
}

impl Tensor {
    pub fn shape() -> (usize, usize, usize, usize) {
        (1, INPUT_SIZE as usize, INPUT_SIZE as usize, 1)
    }

    pub fn from_array(data: Array4<f32>) -> Result<Self> {
        if data.dim() != Self::shape() {
            return Err(VisionError::InvalidImage(format!(
                "tensor shape {:?}, expected {:?}",
                data.dim(),
                Self::shape()
            )));
        }
        Ok(Self { data })
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}

/// Turns a capture into a [`Tensor`]: optional guide crop, grayscale,
/// Gaussian adaptive threshold, bilinear resize to 96x96, scale to [0, 1].
///
/// Deterministic: the same capture always yields the same tensor.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    guide: Option<GuideWindow>,
}

impl Normalizer {
    pub fn new(guide: Option<GuideWindow>) -> Self {
        Self { guide }
    }

    pub fn normalize(&self, raw: &RawImage) -> Result<Tensor> {
        let img = decode(raw)?;
        ensure_area(&img)?;

        let framed = match self.guide {
            Some(guide) => {
                let cropped = crop_to_guide(&img, guide);
                ensure_area(&cropped)?;
                Cow::Owned(cropped)
            }
            None => img,
        };

        let binary = adaptive_threshold(&framed.to_luma8());
        let resized = imageops::resize(&binary, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

        let data: Vec<f32> = resized
            .as_raw()
            .iter()
            .map(|&p| p as f32 / 255.0)
            .collect();
        let array = Array4::from_shape_vec(Tensor::shape(), data)
            .map_err(|e| VisionError::InvalidImage(e.to_string()))?;

        log::debug!(
            "normalized {}x{} capture to {:?}",
            framed.width(),
            framed.height(),
            Tensor::shape()
        );
        Ok(Tensor { data: array })
    }
}

fn decode(raw: &RawImage) -> Result<Cow<'_, DynamicImage>> {
    match raw {
        RawImage::Decoded(img) => Ok(Cow::Borrowed(img)),
        RawImage::Encoded(bytes) => image::load_from_memory(bytes)
            .map(Cow::Owned)
            .map_err(|e| VisionError::InvalidImage(format!("decoding capture: {e}"))),
    }
}

fn ensure_area(img: &DynamicImage) -> Result<()> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(VisionError::InvalidImage(format!(
            "image has zero area ({w}x{h})"
        )));
    }
    Ok(())
}

/// Centre crop around the guide, rotated upright when the crop comes out
/// landscape.
pub fn crop_to_guide(img: &DynamicImage, guide: GuideWindow) -> DynamicImage {
    let (w, h) = img.dimensions();
    let crop_w = (guide.height as f32 * GUIDE_MARGIN) as u32;
    let crop_h = (guide.width as f32 * GUIDE_MARGIN) as u32;

    let left = w.saturating_sub(crop_w) / 2;
    let top = h.saturating_sub(crop_h) / 2;
    let right = w.min(left + crop_w);
    let bottom = h.min(top + crop_h);

    let cropped = img.crop_imm(left, top, right - left, bottom - top);
    if cropped.width() > cropped.height() {
        cropped.rotate90()
    } else {
        cropped
    }
}

/// Local-mean binarization with a Gaussian-weighted neighbourhood:
/// a pixel turns white when it is brighter than its local mean minus C.
pub fn adaptive_threshold(gray: &GrayImage) -> GrayImage {
    // Same sigma OpenCV derives for this block size.
    let sigma = 0.3 * ((BLOCK_SIZE - 1) as f32 * 0.5 - 1.0) + 0.8;
    let mean = imageops::blur(gray, sigma);

    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let src = gray.get_pixel(x, y)[0] as i16;
        let local = mean.get_pixel(x, y)[0] as i16;
        if src > local - THRESHOLD_C {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
