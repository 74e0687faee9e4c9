use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;

/// A captured frame, either still encoded (file, JPEG from a camera app)
/// or an already decoded raster.
#[derive(Debug, Clone)]
pub enum RawImage {
    Encoded(Vec<u8>),
    Decoded(DynamicImage),
}

#[derive(Debug, Clone)]
pub enum Captured {
    Image(RawImage),
    Cancelled,
}

/// Source of fingerprint captures.
///
/// `capture` may block on the user (framing the finger, pressing a button).
/// Returning `Captured::Cancelled` aborts the workflow before any processing.
pub trait Capture {
    fn capture(&mut self) -> Result<Captured>;
}

/// Reads an image file from disk. Bytes are handed on undecoded so a bad
/// file surfaces as an invalid image during normalization.
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Capture for FileCapture {
    fn capture(&mut self) -> Result<Captured> {
        let data = std::fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        log::debug!("read {} bytes from {}", data.len(), self.path.display());
        Ok(Captured::Image(RawImage::Encoded(data)))
    }
}

impl<F> Capture for F
where
    F: FnMut() -> Result<Captured>,
{
    fn capture(&mut self) -> Result<Captured> {
        self()
    }
}
