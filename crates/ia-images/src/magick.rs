//! GraphicsMagick engine
//!
//! Shells out to the `gm` binary (`gm identify`, `gm convert`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use ia_core::{ImageMetadata, ResizeOp};
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, error, instrument};

use crate::error::{ImageError, ImageResult};
use crate::service::ImageService;

/// `gm identify -format` template: one property per line
const IDENTIFY_FORMAT: &str = "%m\n%w\n%h\n%r\n%A\n%q\n";

/// Image engine backed by the GraphicsMagick command line
#[derive(Debug, Clone)]
pub struct MagickImageService {
    program: PathBuf,
}

impl Default for MagickImageService {
    fn default() -> Self {
        Self::new()
    }
}

impl MagickImageService {
    pub fn new() -> Self {
        Self::with_program("gm")
    }

    /// Use a specific `gm` executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: Vec<OsString>) -> ImageResult<Output> {
        Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                error!(program = ?self.program, error = %e, "Failed to start image engine");
                ImageError::EngineUnavailable(format!("{}: {}", self.program.display(), e))
            })
    }
}

/// `gm convert` operators for a resize
pub fn resize_args(op: ResizeOp) -> Vec<String> {
    match op {
        ResizeOp::Thumbnail { width, height } => vec![
            "-resize".to_string(),
            format!("{}x{}^", width, height),
            "-gravity".to_string(),
            "center".to_string(),
            "-extent".to_string(),
            format!("{}x{}", width, height),
        ],
        other => vec!["-resize".to_string(), other.geometry()],
    }
}

/// Parse `gm identify` output produced with `IDENTIFY_FORMAT`
fn parse_identify(stdout: &str, filesize: u64) -> ImageResult<ImageMetadata> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).collect();
    if lines.len() < 6 {
        return Err(ImageError::Processing(format!(
            "unexpected identify output: {:?}",
            stdout
        )));
    }

    let parse_dim = |value: &str| {
        value
            .parse::<u32>()
            .map_err(|_| ImageError::Processing(format!("bad dimension '{}'", value)))
    };

    let format = lines[0].to_string();
    let mime_type = mime_guess::from_ext(&format.to_ascii_lowercase())
        .first_or_octet_stream()
        .to_string();
    let class = lines[3];
    // "DirectClass sRGB" -> "sRGB"
    let color_type = class.split_whitespace().last().unwrap_or(class).to_string();

    Ok(ImageMetadata {
        format,
        mime_type,
        width: parse_dim(lines[1])?,
        height: parse_dim(lines[2])?,
        filesize,
        color_type,
        has_alpha: lines[4].eq_ignore_ascii_case("true"),
        properties: Some(json!({
            "engine": "graphicsmagick",
            "class": class,
            "quantum_depth": lines[5],
        })),
    })
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ImageService for MagickImageService {
    #[instrument(skip(self), fields(engine = "magick"))]
    async fn identify(&self, path: &Path) -> ImageResult<ImageMetadata> {
        let filesize = tokio::fs::metadata(path).await?.len();

        // First frame only
        let mut target = path.as_os_str().to_os_string();
        target.push("[0]");

        let output = self
            .run(vec![
                "identify".into(),
                "-format".into(),
                IDENTIFY_FORMAT.into(),
                target,
            ])
            .await?;

        if !output.status.success() {
            let stderr = stderr_text(&output);
            if stderr.contains("unable to load module") {
                return Err(ImageError::EngineUnavailable(stderr));
            }
            return Err(ImageError::Unrecognized(stderr));
        }

        let metadata = parse_identify(&String::from_utf8_lossy(&output.stdout), filesize)?;
        debug!(
            format = %metadata.format,
            width = metadata.width,
            height = metadata.height,
            "Image identified"
        );
        Ok(metadata)
    }

    #[instrument(skip(self), fields(engine = "magick", op = %op))]
    async fn resize(&self, source: &Path, target: &Path, op: ResizeOp) -> ImageResult<()> {
        let mut args: Vec<OsString> = vec!["convert".into(), source.as_os_str().to_os_string()];
        args.extend(resize_args(op).into_iter().map(OsString::from));
        args.push(target.as_os_str().to_os_string());

        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(ImageError::Processing(stderr_text(&output)));
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match Command::new(&self.program).arg("version").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    fn name(&self) -> &str {
        "magick"
    }
}
