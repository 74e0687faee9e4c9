use anyhow::{bail, Context, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture as _;
use v4l::{Device, Format, FourCC};

use crate::capture::{Capture, Captured, RawImage};

/// Pixel formats asked of the driver, best first. Ridges only need luma, so
/// single-plane grey wins; MJPG frames go to the normalizer still encoded.
const PREFERRED: [&[u8; 4]; 4] = [b"GREY", b"YUYV", b"MJPG", b"RGB3"];

/// V4L2 camera pointed at the fingertip.
pub struct Camera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fourcc: FourCC,
    warmup_frames: u32,
}

impl Camera {
    pub fn open(device: &str, warmup_frames: u32) -> Result<Self> {
        let dev = Device::with_path(device).with_context(|| format!("open camera {device}"))?;
        let current = dev.format().context("get format")?;
        let fmt = PREFERRED
            .iter()
            .find_map(|code| {
                let wanted = FourCC::new(code);
                dev.set_format(&Format::new(current.width, current.height, wanted))
                    .ok()
                    .filter(|got| got.fourcc == wanted)
            })
            .unwrap_or(current);
        if !PREFERRED.contains(&&fmt.fourcc.repr) {
            bail!("{device} offers no usable pixel format (has {})", fmt.fourcc);
        }

        let stream = Stream::with_buffers(&dev, Type::VideoCapture, 4).context("stream")?;
        log::debug!(
            "opened {}: {}x{} {}",
            device,
            fmt.width,
            fmt.height,
            fmt.fourcc
        );
        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc,
            warmup_frames,
        })
    }

    /// Next frame after skipping `skip` frames, as the driver delivered it.
    fn grab(&mut self, skip: u32) -> Result<RawImage> {
        for _ in 0..skip {
            self.stream.next().context("discarding warm-up frame")?;
        }
        let (data, meta) = self.stream.next().context("capture frame")?;
        log::debug!(
            "captured frame seq={} len={} ({} skipped)",
            meta.sequence,
            data.len(),
            skip
        );
        frame_to_image(self.width, self.height, &self.fourcc.repr, data)
    }
}

impl Capture for Camera {
    /// Lets exposure and focus settle over the warm-up frames first.
    fn capture(&mut self) -> Result<Captured> {
        let skip = self.warmup_frames;
        Ok(Captured::Image(self.grab(skip)?))
    }
}

fn frame_to_image(width: u32, height: u32, fourcc: &[u8; 4], data: &[u8]) -> Result<RawImage> {
    let pixels = width as usize * height as usize;
    let image = match fourcc {
        b"GREY" => {
            let luma = frame_prefix(data, pixels, "GREY")?;
            DynamicImage::ImageLuma8(gray(width, height, luma.to_vec())?)
        }
        // Y0 U Y1 V: every even byte is luma.
        b"YUYV" => {
            let packed = frame_prefix(data, pixels * 2, "YUYV")?;
            let luma = packed.iter().step_by(2).copied().collect();
            DynamicImage::ImageLuma8(gray(width, height, luma)?)
        }
        b"RGB3" => {
            let rgb = frame_prefix(data, pixels * 3, "RGB3")?;
            let buf = RgbImage::from_raw(width, height, rgb.to_vec())
                .context("failed to build image buffer")?;
            DynamicImage::ImageRgb8(buf)
        }
        b"MJPG" => return Ok(RawImage::Encoded(data.to_vec())),
        other => bail!("unsupported pixel format {:?}", String::from_utf8_lossy(other)),
    };
    Ok(RawImage::Decoded(image))
}

/// Drivers may pad frames; anything past `len` is dropped.
fn frame_prefix<'a>(data: &'a [u8], len: usize, format: &str) -> Result<&'a [u8]> {
    if data.len() < len {
        log::error!("{} frame too small: got {}, expected {}", format, data.len(), len);
        bail!("short {format} buffer");
    }
    if data.len() > len {
        log::debug!("{} frame padded by {} bytes", format, data.len() - len);
    }
    Ok(&data[..len])
}

fn gray(width: u32, height: u32, luma: Vec<u8>) -> Result<GrayImage> {
    GrayImage::from_raw(width, height, luma).context("failed to build image buffer")
}
