use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vision::{VisionCliArgs, pipeline::config::RegionArg};

/// Live game-context classification and timer OCR.
#[derive(Debug, Parser)]
#[command(name = "unite-live", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze a live source and broadcast results.
    Run(VisionCliArgs),
    /// Read the timer from a still image.
    Timer(TimerArgs),
    /// Classify a still image.
    #[cfg(feature = "with-tch")]
    Classify(ClassifyArgs),
}

#[derive(Debug, clap::Args)]
pub struct TimerArgs {
    /// PNG screenshot (or timer crop with `--cropped`).
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
    /// Tesseract data directory.
    #[arg(long = "tessdata", value_name = "DIR", env = "TESSDATA_PREFIX")]
    pub tessdata: PathBuf,
    /// Timer region as fractions `x,y,w,h` of the image.
    #[arg(long = "timer-region", value_name = "X,Y,W,H", conflicts_with = "cropped")]
    pub timer_region: Option<RegionArg>,
    /// The image already is the timer crop.
    #[arg(long = "cropped", action = clap::ArgAction::SetTrue)]
    pub cropped: bool,
}

#[cfg(feature = "with-tch")]
#[derive(Debug, clap::Args)]
pub struct ClassifyArgs {
    /// PNG screenshot.
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
    /// TorchScript classifier model.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: PathBuf,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_positional_source() {
        let cli = Cli::try_parse_from([
            "unite-live",
            "run",
            "testpattern:",
            "--tessdata",
            "/usr/share/tessdata",
        ])
        .expect("parse");
        match cli.command {
            Command::Run(args) => assert_eq!(args.source.as_deref(), Some("testpattern:")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn timer_region_and_cropped_conflict() {
        let err = Cli::try_parse_from([
            "unite-live",
            "timer",
            "shot.png",
            "--tessdata",
            "/tmp",
            "--cropped",
            "--timer-region",
            "0.1,0.1,0.2,0.2",
        ])
        .expect_err("conflict");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
