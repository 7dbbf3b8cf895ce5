use std::{
    io::{ErrorKind, Read},
    process::{Command, Stdio},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame, MonotonicClock};

/// Frames buffered between the decoder thread and the consumer.
const FRAME_QUEUE: usize = 2;

/// Spawns FFmpeg decoding `uri` to BGRA rawvideo at `target_size` and streams
/// the frames from a background thread.
///
/// `uri` may be a file path, an `rtsp://` URL, a `/dev/videoN` device or a bare
/// device index. Files are paced at their native frame rate. The channel closes
/// when the stream ends; decode failures arrive as a final `Err`.
pub fn spawn_ffmpeg_reader(
    uri: &str,
    target_size: (u32, u32),
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let (width, height) = target_size;
    if width == 0 || height == 0 {
        return Err(CaptureError::InvalidSize { width, height });
    }
    let mut cmd = Command::new("ffmpeg");
    cmd.args(ffmpeg_args(uri, target_size))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| {
        warn!("failed to start ffmpeg for {uri}: {err}");
        CaptureError::Open {
            uri: uri.to_string(),
        }
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    let (tx, rx) = bounded(FRAME_QUEUE);
    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || {
            if let Err(err) = read_frames(stdout, target_size, &tx) {
                let _ = tx.send(Err(err));
            }
            let _ = child.kill();
            let _ = child.wait();
        })?;
    Ok(rx)
}

/// FFmpeg arguments for decoding `uri` to BGRA rawvideo on stdout.
pub fn ffmpeg_args(uri: &str, target_size: (u32, u32)) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();

    let input = if let Some(index) = parse_device_index(uri) {
        args.extend(["-f", "video4linux2"].map(String::from));
        format!("/dev/video{index}")
    } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        args.extend(
            [
                "-rtsp_transport",
                "tcp",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
            ]
            .map(String::from),
        );
        uri.to_string()
    } else {
        args.push(String::from("-re"));
        uri.to_string()
    };

    args.push(String::from("-i"));
    args.push(input);
    args.extend(["-an", "-vf"].map(String::from));
    args.push(format!("scale={}:{}", target_size.0, target_size.1));
    args.extend(["-pix_fmt", "bgra", "-f", "rawvideo", "-"].map(String::from));
    args
}

/// Device index from `3` or `/dev/video3`.
pub fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    let digits = uri.strip_prefix("/dev/video")?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse().ok();
    }
    None
}

/// Read whole BGRA frames until EOF or until the consumer hangs up.
pub(crate) fn read_frames(
    mut stdout: impl Read,
    target_size: (u32, u32),
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let (width, height) = target_size;
    let mut buffer = vec![0u8; Frame::byte_len(width, height)];
    let mut clock = MonotonicClock::default();

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let now = Utc::now().timestamp_micros().max(0) as u64;
                let frame = Frame {
                    data: buffer.clone(),
                    width,
                    height,
                    timestamp_us: clock.next(now),
                };
                if tx.send(Ok(frame)).is_err() {
                    debug!("frame consumer disconnected");
                    return Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("ffmpeg stream ended");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }
}
