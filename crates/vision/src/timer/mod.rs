//! Countdown timer extraction: OCR constrained to digits and colon, followed by
//! strict `0D:DD` validation so OCR noise never reaches subscribers.

pub mod preprocess;
mod tesseract;

use std::path::PathBuf;

use image::GrayImage;
use thiserror::Error;
use tracing::trace;

pub use preprocess::{
    MedianHistory, TimerPreprocessor, binarize_otsu, bgrx_to_luma, otsu_threshold,
};
pub use tesseract::TesseractCli;

/// Characters the OCR engine is allowed to emit for the timer.
pub const TIMER_WHITELIST: &str = "0123456789:";

/// Tesseract page segmentation modes used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSegMode {
    Auto,
    SingleLine,
    SingleWord,
}

impl PageSegMode {
    pub const fn as_psm(self) -> u8 {
        match self {
            PageSegMode::Auto => 3,
            PageSegMode::SingleLine => 7,
            PageSegMode::SingleWord => 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR data directory not found: {0:?}")]
    DataPathMissing(PathBuf),
    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("OCR recognition failed: {0}")]
    Recognition(String),
    #[error("timer image error: {0}")]
    Image(String),
}

/// Text recognizer used by [`TimerExtractionAdapter`].
pub trait OcrEngine: Send {
    fn recognize(
        &mut self,
        image: &GrayImage,
        whitelist: &str,
        mode: PageSegMode,
    ) -> Result<String, OcrError>;
}

impl<E: OcrEngine + ?Sized> OcrEngine for Box<E> {
    fn recognize(
        &mut self,
        image: &GrayImage,
        whitelist: &str,
        mode: PageSegMode,
    ) -> Result<String, OcrError> {
        (**self).recognize(image, whitelist, mode)
    }
}

/// A validated `0D:DD` reading, or empty when OCR produced nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TimerReading {
    text: String,
}

impl TimerReading {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate raw OCR output; anything off-pattern becomes empty.
    pub fn from_raw(raw: &str) -> Self {
        Self {
            text: validate_timer_text(raw).unwrap_or_default(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Strip whitespace and accept only `0D:DD`.
pub fn validate_timer_text(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = compact.as_bytes();
    let valid = bytes.len() == 5
        && bytes[0] == b'0'
        && bytes[1].is_ascii_digit()
        && bytes[2] == b':'
        && bytes[3].is_ascii_digit()
        && bytes[4].is_ascii_digit();
    valid.then_some(compact)
}

/// Wraps an OCR engine with the timer whitelist, page mode and validation.
pub struct TimerExtractionAdapter<E> {
    engine: E,
    mode: PageSegMode,
}

impl<E: OcrEngine> TimerExtractionAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            mode: PageSegMode::SingleLine,
        }
    }

    pub fn with_mode(mut self, mode: PageSegMode) -> Self {
        self.mode = mode;
        self
    }

    /// OCR a binarized timer crop.
    ///
    /// Engine failures are errors; off-pattern text is an empty reading.
    pub fn read(&mut self, binarized: &GrayImage) -> Result<TimerReading, OcrError> {
        let _span = tracing::debug_span!("timer.ocr").entered();
        let raw = self.engine.recognize(binarized, TIMER_WHITELIST, self.mode)?;
        let reading = TimerReading::from_raw(&raw);
        trace!(raw = raw.trim(), accepted = !reading.is_empty(), "timer OCR");
        Ok(reading)
    }
}

impl TimerExtractionAdapter<TesseractCli> {
    /// Build an adapter backed by the `tesseract` executable, failing fast when
    /// the data directory or the engine is unavailable.
    pub fn from_data_path(tessdata: impl Into<PathBuf>) -> Result<Self, OcrError> {
        Ok(Self::new(TesseractCli::new(tessdata)?))
    }
}
