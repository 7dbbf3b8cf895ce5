//! Host-side frame sources feeding the analysis pipeline.

pub mod ffmpeg;
pub mod synthetic;
pub mod types;

pub use ffmpeg::{parse_device_index, spawn_ffmpeg_reader};
pub use synthetic::{countdown_text, render_test_pattern, spawn_test_pattern};
pub use types::{CaptureError, FRAME_CHANNELS, Frame};
