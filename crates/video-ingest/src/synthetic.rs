//! Synthetic frame source: a slowly shifting gradient with a seven-segment
//! countdown drawn where the match timer sits on a 1920x1080 broadcast.

use std::{thread, time::Duration};

use chrono::Utc;
use crossbeam_channel::{Receiver, bounded};
use tracing::debug;

use crate::types::{CaptureError, FRAME_CHANNELS, Frame, MonotonicClock};

/// Countdown start, in seconds.
pub const COUNTDOWN_START_SECS: u64 = 20 * 60;

/// Timer box as fractions of the frame.
const TIMER_BOX: (f32, f32, f32, f32) = (
    800.0 / 1920.0,
    20.0 / 1080.0,
    320.0 / 1920.0,
    100.0 / 1080.0,
);

const WHITE: [u8; 4] = [255, 255, 255, 255];
const BLACK: [u8; 4] = [0, 0, 0, 255];

// Segment bits: a (top), b, c, d (bottom), e, f, g (middle).
const DIGIT_SEGMENTS: [u8; 10] = [
    0x3F, 0x06, 0x5B, 0x4F, 0x66, 0x6D, 0x7D, 0x07, 0x7F, 0x6F,
];

/// Streams test-pattern frames at `fps` until the receiver is dropped.
pub fn spawn_test_pattern(
    target_size: (u32, u32),
    fps: u32,
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let (width, height) = target_size;
    if width == 0 || height == 0 {
        return Err(CaptureError::InvalidSize { width, height });
    }
    let fps = fps.max(1);
    let interval = Duration::from_secs(1) / fps;
    let (tx, rx) = bounded(2);

    thread::Builder::new()
        .name("test-pattern".into())
        .spawn(move || {
            let mut clock = MonotonicClock::default();
            for index in 0u64.. {
                let now = Utc::now().timestamp_micros().max(0) as u64;
                let frame = Frame {
                    data: render_test_pattern(width, height, index, fps),
                    width,
                    height,
                    timestamp_us: clock.next(now),
                };
                if tx.send(Ok(frame)).is_err() {
                    debug!("test pattern consumer disconnected after {index} frames");
                    break;
                }
                thread::sleep(interval);
            }
        })?;
    Ok(rx)
}

/// Countdown shown on frame `index`, as `MM:SS`.
pub fn countdown_text(index: u64, fps: u32) -> String {
    let elapsed = index / u64::from(fps.max(1));
    let remaining = COUNTDOWN_START_SECS - elapsed % (COUNTDOWN_START_SECS + 1);
    format!("{:02}:{:02}", remaining / 60, remaining % 60)
}

/// Render frame `index` of the pattern as BGRA.
pub fn render_test_pattern(width: u32, height: u32, index: u64, fps: u32) -> Vec<u8> {
    let mut data = vec![0u8; Frame::byte_len(width, height)];
    let shift = (index % 128) as u8;
    for (y, row) in data
        .chunks_exact_mut(width as usize * FRAME_CHANNELS)
        .enumerate()
    {
        let r = (y as u32 * 127 / height.max(1)) as u8;
        for (x, px) in row.chunks_exact_mut(FRAME_CHANNELS).enumerate() {
            let b = (x as u32 * 127 / width.max(1)) as u8;
            px.copy_from_slice(&[b, shift, r, 255]);
        }
    }

    let canvas = Canvas {
        data: &mut data,
        width,
        height,
    };
    draw_timer(canvas, &countdown_text(index, fps));
    data
}

struct Canvas<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
}

impl Canvas<'_> {
    fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 4]) {
        let x_end = (x + w).min(self.width);
        let y_end = (y + h).min(self.height);
        for row in y..y_end {
            for col in x..x_end {
                let offset = (row as usize * self.width as usize + col as usize) * FRAME_CHANNELS;
                self.data[offset..offset + FRAME_CHANNELS].copy_from_slice(&color);
            }
        }
    }
}

fn draw_timer(mut canvas: Canvas<'_>, text: &str) {
    let (fx, fy, fw, fh) = TIMER_BOX;
    let bx = (fx * canvas.width as f32) as u32;
    let by = (fy * canvas.height as f32) as u32;
    let bw = ((fw * canvas.width as f32) as u32).max(5);
    let bh = ((fh * canvas.height as f32) as u32).max(5);
    canvas.fill_rect(bx, by, bw, bh, BLACK);

    let glyphs = text.chars().count().max(1) as u32;
    let cell = bw / glyphs;
    let margin_x = (cell / 6).max(1);
    let margin_y = (bh / 8).max(1);
    let stroke = (bh / 12).max(1);
    let glyph_w = cell.saturating_sub(2 * margin_x).max(stroke * 3);
    let glyph_h = bh.saturating_sub(2 * margin_y).max(stroke * 3);

    for (i, ch) in text.chars().enumerate() {
        let x = bx + i as u32 * cell + margin_x;
        let y = by + margin_y;
        match ch.to_digit(10) {
            Some(digit) => draw_digit(&mut canvas, x, y, glyph_w, glyph_h, stroke, digit),
            None if ch == ':' => {
                let cx = x + glyph_w / 2 - stroke / 2;
                canvas.fill_rect(cx, y + glyph_h / 3 - stroke / 2, stroke, stroke, WHITE);
                canvas.fill_rect(cx, y + 2 * glyph_h / 3 - stroke / 2, stroke, stroke, WHITE);
            }
            None => {}
        }
    }
}

fn draw_digit(canvas: &mut Canvas<'_>, x: u32, y: u32, w: u32, h: u32, t: u32, digit: u32) {
    let segments = DIGIT_SEGMENTS[digit as usize % 10];
    let half = h / 2;
    let rects = [
        (x, y, w, t),
        (x + w - t, y, t, half),
        (x + w - t, y + half, t, h - half),
        (x, y + h - t, w, t),
        (x, y + half, t, h - half),
        (x, y, t, half),
        (x, y + half - t / 2, w, t),
    ];
    for (bit, (rx, ry, rw, rh)) in rects.into_iter().enumerate() {
        if segments & (1 << bit) != 0 {
            canvas.fill_rect(rx, ry, rw, rh, WHITE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_white(data: &[u8], width: u32, x: u32, y: u32) -> bool {
        let offset = (y as usize * width as usize + x as usize) * FRAME_CHANNELS;
        data[offset..offset + 3] == [255, 255, 255]
    }

    #[test]
    fn countdown_ticks_once_per_second_of_frames() {
        assert_eq!(countdown_text(0, 30), "20:00");
        assert_eq!(countdown_text(29, 30), "20:00");
        assert_eq!(countdown_text(30, 30), "19:59");
        assert_eq!(countdown_text(30 * 61, 30), "18:59");
        assert_eq!(countdown_text(30 * COUNTDOWN_START_SECS, 30), "00:00");
        assert_eq!(countdown_text(30 * (COUNTDOWN_START_SECS + 1), 30), "20:00");
    }

    #[test]
    fn digits_only_appear_inside_the_timer_box() {
        let (width, height) = (480, 270);
        let data = render_test_pattern(width, height, 0, 30);
        assert_eq!(data.len(), Frame::byte_len(width, height));

        let (x0, y0) = (200, 5);
        let (x1, y1) = (280, 30);
        let mut inside = 0;
        for y in 0..height {
            for x in 0..width {
                if is_white(&data, width, x, y) {
                    assert!((x0..x1).contains(&x) && (y0..y1).contains(&y), "stray white at {x},{y}");
                    inside += 1;
                }
            }
        }
        assert!(inside > 0);
    }

    #[test]
    fn pattern_changes_between_seconds() {
        let a = render_test_pattern(192, 108, 0, 1);
        let b = render_test_pattern(192, 108, 1, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn stream_delivers_increasing_timestamps() {
        let rx = spawn_test_pattern((64, 36), 200).expect("spawn");
        let first = rx.recv().expect("frame").expect("ok");
        let second = rx.recv().expect("frame").expect("ok");
        assert_eq!((first.width, first.height), (64, 36));
        assert!(second.timestamp_us > first.timestamp_us);
    }
}
