use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use image::{DynamicImage, GrayImage, ImageFormat};
use tracing::debug;

use super::{OcrEngine, OcrError, PageSegMode};

/// OCR engine that shells out to the `tesseract` executable.
///
/// The image is written to the child's stdin as PNG and the recognised text is
/// read back from stdout.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    program: PathBuf,
    tessdata: PathBuf,
    language: String,
}

impl TesseractCli {
    /// Use `tesseract` from `PATH` with English data under `tessdata`.
    pub fn new(tessdata: impl Into<PathBuf>) -> Result<Self, OcrError> {
        Self::with_program("tesseract", tessdata, "eng")
    }

    pub fn with_program(
        program: impl Into<PathBuf>,
        tessdata: impl Into<PathBuf>,
        language: impl Into<String>,
    ) -> Result<Self, OcrError> {
        let tessdata = tessdata.into();
        if !tessdata.is_dir() {
            return Err(OcrError::DataPathMissing(tessdata));
        }
        let engine = Self {
            program: program.into(),
            tessdata,
            language: language.into(),
        };
        engine.probe()?;
        Ok(engine)
    }

    pub fn tessdata(&self) -> &Path {
        &self.tessdata
    }

    fn probe(&self) -> Result<(), OcrError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                OcrError::EngineUnavailable(format!("{}: {err}", self.program.display()))
            })?;
        if !output.status.success() {
            return Err(OcrError::EngineUnavailable(format!(
                "{} --version exited with {}",
                self.program.display(),
                output.status
            )));
        }
        let banner = String::from_utf8_lossy(&output.stdout);
        debug!(
            "using {} ({})",
            self.program.display(),
            banner.lines().next().unwrap_or("unknown version")
        );
        Ok(())
    }
}

impl OcrEngine for TesseractCli {
    fn recognize(
        &mut self,
        image: &GrayImage,
        whitelist: &str,
        mode: PageSegMode,
    ) -> Result<String, OcrError> {
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(image.clone())
            .write_to(&mut png, ImageFormat::Png)
            .map_err(|err| OcrError::Image(err.to_string()))?;

        let mut child = Command::new(&self.program)
            .arg("stdin")
            .arg("stdout")
            .arg("--psm")
            .arg(mode.as_psm().to_string())
            .arg("-l")
            .arg(&self.language)
            .arg("--tessdata-dir")
            .arg(&self.tessdata)
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={whitelist}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| OcrError::EngineUnavailable(err.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(png.get_ref()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OcrError::Recognition(format!("writing image to tesseract: {err}")));
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|err| OcrError::Recognition(err.to_string()))?;
        if !output.status.success() {
            return Err(OcrError::Recognition(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
