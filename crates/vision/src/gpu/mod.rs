//! Graphics backend seam used by the pipeline for render-to-texture and
//! asynchronous readback.
//!
//! The pipeline never touches pixels on the render thread directly: it asks the
//! backend to draw a [`RenderPass`] into a render target, copy that target into a
//! staging surface, and later map the staging surface into CPU memory. Copies are
//! allowed to complete asynchronously; mapping blocks until that specific copy
//! has landed.

pub(crate) mod software;

use std::fmt;

use thiserror::Error;

pub use software::{SoftwareBackend, SoftwareStaging, SoftwareTexture, SourceFeed, SourceFrame};

/// Pixel layouts understood by render targets and staging surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit blue, green, red, padding.
    Bgrx,
    /// 8-bit red, green, blue, alpha.
    Rgba,
    /// 8-bit single channel luminance.
    Luma8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgrx | PixelFormat::Rgba => 4,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// Dimensions and format of a texture or staging surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TextureDesc {
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Tightly packed byte length of one surface.
    pub const fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

impl fmt::Display for TextureDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

/// Rectangle expressed as fractions of the source frame (0.0..=1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Region {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True when the region has positive area and lies inside the unit square.
    pub fn is_normalized(&self) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= 1.0 + f32::EPSILON
            && self.y + self.height <= 1.0 + f32::EPSILON
    }

    /// Pixel rectangle covered by this region in a `width` x `height` frame.
    ///
    /// The result is clamped to the frame and is never empty for a non-empty
    /// frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> RoiRect {
        let x = ((self.x * width as f32).round() as u32).min(width.saturating_sub(1));
        let y = ((self.y * height as f32).round() as u32).min(height.saturating_sub(1));
        let w = ((self.width * width as f32).round() as u32)
            .clamp(1, width.saturating_sub(x).max(1));
        let h = ((self.height * height as f32).round() as u32)
            .clamp(1, height.saturating_sub(y).max(1));
        RoiRect::new(x, y, w, h)
    }
}

/// Pixel rectangle inside a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RoiRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Aspect-preserving fit of a `src_w` x `src_h` frame centred inside a
    /// `dst_w` x `dst_h` target.
    pub fn letterbox(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        if src_w == 0 || src_h == 0 {
            return Self::new(0, 0, dst_w, dst_h);
        }
        let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
        let width = ((src_w as f32 * scale).round() as u32).clamp(1, dst_w.max(1));
        let height = ((src_h as f32 * scale).round() as u32).clamp(1, dst_h.max(1));
        Self::new((dst_w - width) / 2, (dst_h - height) / 2, width, height)
    }
}

/// Draw operation issued against a render target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderPass {
    /// Scale the whole source into `roi`, filling the rest with gray `fill`
    /// (0.0 black, 1.0 white).
    Letterbox { roi: RoiRect, fill: f32 },
    /// Stretch the fractional source `region` over the whole target.
    Crop { region: Region },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no source frame available to render")]
    NoSource,
    #[error("surface size mismatch: expected {expected}, got {got}")]
    SurfaceMismatch {
        expected: TextureDesc,
        got: TextureDesc,
    },
    #[error("staging surface has no completed copy to map")]
    NothingToMap,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("graphics device error: {0}")]
    Device(String),
}

/// Rendering and readback operations the pipeline needs from a graphics device.
///
/// All calls happen on the render thread.
pub trait GraphicsBackend {
    type Texture;
    type Staging;

    fn create_render_target(&mut self, desc: TextureDesc) -> Result<Self::Texture, BackendError>;

    fn create_staging(&mut self, desc: TextureDesc) -> Result<Self::Staging, BackendError>;

    fn texture_desc(&self, texture: &Self::Texture) -> TextureDesc;

    fn render_into(
        &mut self,
        target: &mut Self::Texture,
        pass: &RenderPass,
    ) -> Result<(), BackendError>;

    /// Queue a copy of `texture` into `staging`. Must not wait for completion.
    fn copy_to_staging(
        &mut self,
        texture: &Self::Texture,
        staging: &mut Self::Staging,
    ) -> Result<(), BackendError>;

    /// Block until the last copy into `staging` completes, then write its bytes
    /// into `out`, which is exactly `desc.byte_len()` long.
    fn map_staging_for_read(
        &mut self,
        staging: &mut Self::Staging,
        out: &mut [u8],
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_centres_wide_source() {
        let roi = RoiRect::letterbox(1920, 1080, 224, 224);
        assert_eq!(roi, RoiRect::new(0, 49, 224, 126));
    }

    #[test]
    fn letterbox_centres_tall_source() {
        let roi = RoiRect::letterbox(1080, 1920, 224, 224);
        assert_eq!(roi, RoiRect::new(49, 0, 126, 224));
    }

    #[test]
    fn timer_region_maps_to_source_pixels() {
        let region = Region::new(800.0 / 1920.0, 20.0 / 1080.0, 320.0 / 1920.0, 100.0 / 1080.0);
        assert!(region.is_normalized());
        assert_eq!(region.to_pixels(1920, 1080), RoiRect::new(800, 20, 320, 100));
        assert_eq!(region.to_pixels(960, 540), RoiRect::new(400, 10, 160, 50));
    }

    #[test]
    fn region_outside_unit_square_is_rejected() {
        assert!(!Region::new(0.9, 0.0, 0.2, 0.5).is_normalized());
        assert!(!Region::new(0.0, 0.0, 0.0, 0.5).is_normalized());
    }

    #[test]
    fn desc_byte_len_follows_format() {
        assert_eq!(TextureDesc::new(224, 224, PixelFormat::Bgrx).byte_len(), 224 * 224 * 4);
        assert_eq!(TextureDesc::new(10, 3, PixelFormat::Luma8).byte_len(), 30);
    }
}
