use std::io;

use thiserror::Error;

/// Bytes per pixel of a [`Frame`] (BGRA).
pub const FRAME_CHANNELS: usize = 4;

/// Decoded BGRA frame from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time in microseconds; strictly increasing per source.
    pub timestamp_us: u64,
}

impl Frame {
    /// Byte length of a `width` x `height` BGRA frame.
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * FRAME_CHANNELS
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("invalid capture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("frame stream failed: {0}")]
    Stream(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Hands out strictly increasing microsecond timestamps from the wall clock.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last: Option<u64>,
}

impl MonotonicClock {
    pub(crate) fn next(&mut self, now_us: u64) -> u64 {
        let stamp = match self.last {
            Some(last) if now_us <= last => last + 1,
            _ => now_us,
        };
        self.last = Some(stamp);
        stamp
    }
}
