//! CPU implementation of [`GraphicsBackend`] built on the `image` crate.
//!
//! Render passes read the latest host frame from a shared [`SourceFeed`]; copies
//! into staging surfaces complete immediately.

use std::sync::{Arc, Mutex};

use image::{
    ImageBuffer, Rgba, RgbaImage,
    imageops::{self, FilterType},
};

use super::{BackendError, GraphicsBackend, PixelFormat, RenderPass, RoiRect, TextureDesc};

/// One BGRA frame handed over by the host.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
}

/// Latest-frame mailbox shared between the ingest loop and the backend.
#[derive(Debug, Default)]
pub struct SourceFeed {
    latest: Mutex<Option<SourceFrame>>,
}

impl SourceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: SourceFrame) {
        let mut guard = match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(frame);
    }

    pub fn latest(&self) -> Option<SourceFrame> {
        match self.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct SoftwareTexture {
    desc: TextureDesc,
    pixels: Vec<u8>,
}

impl SoftwareTexture {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

pub struct SoftwareStaging {
    desc: TextureDesc,
    data: Vec<u8>,
    ready: bool,
}

/// Graphics backend that renders on the calling thread.
pub struct SoftwareBackend {
    feed: Arc<SourceFeed>,
    filter: FilterType,
}

impl SoftwareBackend {
    pub fn new(feed: Arc<SourceFeed>) -> Self {
        Self {
            feed,
            filter: FilterType::Triangle,
        }
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    fn allocate(desc: TextureDesc) -> Result<Vec<u8>, BackendError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::Unsupported(format!(
                "zero-sized surface {desc}"
            )));
        }
        Ok(vec![0u8; desc.byte_len()])
    }
}

impl GraphicsBackend for SoftwareBackend {
    type Texture = SoftwareTexture;
    type Staging = SoftwareStaging;

    fn create_render_target(&mut self, desc: TextureDesc) -> Result<SoftwareTexture, BackendError> {
        Ok(SoftwareTexture {
            desc,
            pixels: Self::allocate(desc)?,
        })
    }

    fn create_staging(&mut self, desc: TextureDesc) -> Result<SoftwareStaging, BackendError> {
        Ok(SoftwareStaging {
            desc,
            data: Self::allocate(desc)?,
            ready: false,
        })
    }

    fn texture_desc(&self, texture: &SoftwareTexture) -> TextureDesc {
        texture.desc
    }

    fn render_into(
        &mut self,
        target: &mut SoftwareTexture,
        pass: &RenderPass,
    ) -> Result<(), BackendError> {
        let frame = self.feed.latest().ok_or(BackendError::NoSource)?;
        let source: ImageBuffer<Rgba<u8>, &[u8]> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_slice()).ok_or_else(
                || {
                    BackendError::Device(format!(
                        "source frame of {} bytes is too small for {}x{}",
                        frame.data.len(),
                        frame.width,
                        frame.height
                    ))
                },
            )?;
        let desc = target.desc;

        match *pass {
            RenderPass::Letterbox { roi, fill } => {
                let gray = (fill.clamp(0.0, 1.0) * 255.0).round() as u8;
                let mut canvas = RgbaImage::from_pixel(
                    desc.width,
                    desc.height,
                    Rgba([gray, gray, gray, u8::MAX]),
                );
                let roi = clamp_roi(roi, desc.width, desc.height);
                let scaled = imageops::resize(&source, roi.width, roi.height, self.filter);
                imageops::replace(&mut canvas, &scaled, i64::from(roi.x), i64::from(roi.y));
                store_bgra(&canvas, target);
            }
            RenderPass::Crop { region } => {
                let rect = region.to_pixels(frame.width, frame.height);
                let cropped = imageops::crop_imm(&source, rect.x, rect.y, rect.width, rect.height);
                let scaled = imageops::resize(&*cropped, desc.width, desc.height, self.filter);
                store_bgra(&scaled, target);
            }
        }
        Ok(())
    }

    fn copy_to_staging(
        &mut self,
        texture: &SoftwareTexture,
        staging: &mut SoftwareStaging,
    ) -> Result<(), BackendError> {
        if texture.desc != staging.desc {
            return Err(BackendError::SurfaceMismatch {
                expected: staging.desc,
                got: texture.desc,
            });
        }
        staging.data.copy_from_slice(&texture.pixels);
        staging.ready = true;
        Ok(())
    }

    fn map_staging_for_read(
        &mut self,
        staging: &mut SoftwareStaging,
        out: &mut [u8],
    ) -> Result<(), BackendError> {
        if !staging.ready {
            return Err(BackendError::NothingToMap);
        }
        if out.len() != staging.data.len() {
            return Err(BackendError::Device(format!(
                "readback buffer is {} bytes, staging surface {} needs {}",
                out.len(),
                staging.desc,
                staging.data.len()
            )));
        }
        out.copy_from_slice(&staging.data);
        Ok(())
    }
}

fn clamp_roi(roi: RoiRect, width: u32, height: u32) -> RoiRect {
    let x = roi.x.min(width.saturating_sub(1));
    let y = roi.y.min(height.saturating_sub(1));
    RoiRect::new(
        x,
        y,
        roi.width.clamp(1, width - x),
        roi.height.clamp(1, height - y),
    )
}

/// Write a BGRA-ordered image into `target`, converting to its pixel format.
fn store_bgra(image: &RgbaImage, target: &mut SoftwareTexture) {
    let bgra = image.as_raw().chunks_exact(4);
    match target.desc.format {
        PixelFormat::Bgrx => {
            for (dst, px) in target.pixels.chunks_exact_mut(4).zip(bgra) {
                dst.copy_from_slice(&[px[0], px[1], px[2], u8::MAX]);
            }
        }
        PixelFormat::Rgba => {
            for (dst, px) in target.pixels.chunks_exact_mut(4).zip(bgra) {
                dst.copy_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
        PixelFormat::Luma8 => {
            for (dst, px) in target.pixels.iter_mut().zip(bgra) {
                *dst = luma(px[2], px[1], px[0]);
            }
        }
    }
}

/// BT.601 luma in integer arithmetic.
pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b) + 500) / 1000) as u8
}
