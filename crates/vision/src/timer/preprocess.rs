//! CPU-side preparation of the staged timer crop for OCR.

use std::collections::VecDeque;

use image::{GrayImage, Luma};

use super::OcrError;
use crate::gpu::software::luma;

/// Convert a tightly packed BGRX buffer into a luma image.
pub fn bgrx_to_luma(bgrx: &[u8], width: u32, height: u32) -> Result<GrayImage, OcrError> {
    let expected = width as usize * height as usize * 4;
    if bgrx.len() != expected || expected == 0 {
        return Err(OcrError::Image(format!(
            "timer crop is {} bytes, expected {expected} for {width}x{height} BGRX",
            bgrx.len()
        )));
    }
    let pixels = bgrx
        .chunks_exact(4)
        .map(|px| luma(px[2], px[1], px[0]))
        .collect();
    GrayImage::from_raw(width, height, pixels)
        .ok_or_else(|| OcrError::Image("luma buffer size mismatch".into()))
}

/// Otsu's threshold over the 256-bin histogram of `image`.
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for Luma([v]) in image.pixels() {
        histogram[*v as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as f64 * *count as f64)
        .sum();

    // A histogram with a single level has no split; keep everything as page.
    let mut best = (u8::MAX, f64::MIN);
    let mut background = 0u64;
    let mut background_sum = 0.0;
    for level in 0..256usize {
        background += histogram[level];
        if background == 0 {
            continue;
        }
        let foreground = total - background;
        if foreground == 0 {
            break;
        }
        background_sum += level as f64 * histogram[level] as f64;
        let mean_bg = background_sum / background as f64;
        let mean_fg = (weighted_total - background_sum) / foreground as f64;
        let between = background as f64 * foreground as f64 * (mean_bg - mean_fg).powi(2);
        if between > best.1 {
            best = (level as u8, between);
        }
    }
    best.0
}

/// Binarize with Otsu's threshold, turning bright digits into black text on a
/// white page.
pub fn binarize_otsu(image: &GrayImage) -> GrayImage {
    let threshold = otsu_threshold(image);
    let mut out = image.clone();
    for Luma([v]) in out.pixels_mut() {
        *v = if *v > threshold { 0 } else { u8::MAX };
    }
    out
}

/// Per-pixel median over the last `window` luma frames.
#[derive(Debug)]
pub struct MedianHistory {
    window: usize,
    frames: VecDeque<GrayImage>,
}

impl MedianHistory {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            frames: VecDeque::with_capacity(window),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Record `frame` and return the median of the retained history.
    ///
    /// A frame of a different size than the history restarts it.
    pub fn push(&mut self, frame: GrayImage) -> GrayImage {
        if self
            .frames
            .front()
            .is_some_and(|first| first.dimensions() != frame.dimensions())
        {
            self.frames.clear();
        }
        if self.frames.len() == self.window {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);

        if self.frames.len() == 1 {
            return self.frames[0].clone();
        }

        let (width, height) = self.frames[0].dimensions();
        let mut samples = Vec::with_capacity(self.frames.len());
        let mut out = GrayImage::new(width, height);
        for (index, dst) in out.iter_mut().enumerate() {
            samples.clear();
            samples.extend(self.frames.iter().map(|frame| frame.as_raw()[index]));
            samples.sort_unstable();
            *dst = samples[samples.len() / 2];
        }
        out
    }
}

/// Staged BGRX timer crop to OCR-ready binary image.
#[derive(Debug)]
pub struct TimerPreprocessor {
    width: u32,
    height: u32,
    history: MedianHistory,
}

impl TimerPreprocessor {
    pub fn new(width: u32, height: u32, median_window: usize) -> Self {
        Self {
            width,
            height,
            history: MedianHistory::new(median_window),
        }
    }

    pub fn prepare(&mut self, bgrx: &[u8]) -> Result<GrayImage, OcrError> {
        let luma = bgrx_to_luma(bgrx, self.width, self.height)?;
        let filtered = self.history.push(luma);
        Ok(binarize_otsu(&filtered))
    }
}
