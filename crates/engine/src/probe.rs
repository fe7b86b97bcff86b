//! Media probing: pixel dimensions, alpha and video duration.
//!
//! Still images are decoded with the `image` crate (headers only where the
//! format allows). Videos are probed with ffprobe's JSON output.

use crate::asset::AssetType;
use media_optimiser_config::ToolsConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What ffprobe told us about a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub dimensions: Option<Dimensions>,
    pub duration_secs: Option<f64>,
    pub codec_name: Option<String>,
    pub has_audio: bool,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Read an image's dimensions from its header.
pub fn image_dimensions(path: &Path) -> Result<Dimensions, ProbeError> {
    let (width, height) = image::image_dimensions(path)?;
    Ok(Dimensions::new(width, height))
}

/// Whether the image has an alpha channel. JPEG conversion would flatten it.
pub fn has_alpha(path: &Path) -> Result<bool, ProbeError> {
    use image::ImageDecoder;

    let decoder = image::ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    Ok(decoder.color_type().has_alpha())
}

/// Longest edge of generated thumbnails
pub const THUMBNAIL_EDGE: u32 = 256;

/// Write a PNG thumbnail of an image, keeping its aspect ratio.
pub fn write_thumbnail(source: &Path, dest: &Path) -> Result<(), ProbeError> {
    let thumb = image::open(source)?.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    thumb.save_with_format(dest, image::ImageFormat::Png)?;
    Ok(())
}

/// Build the ffprobe invocation used for videos.
pub fn build_ffprobe_command(ffprobe: &str, path: &Path) -> Command {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path);
    cmd
}

/// Parses ffprobe JSON output.
pub fn parse_ffprobe_output(json_str: &str) -> Result<VideoInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let dimensions = video.and_then(|s| match (s.width, s.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(Dimensions::new(w, h)),
        _ => None,
    });
    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());

    Ok(VideoInfo {
        dimensions,
        duration_secs,
        codec_name: video.and_then(|s| s.codec_name.clone()),
        has_audio,
    })
}

/// Probe a video with ffprobe.
pub async fn probe_video(ffprobe: &str, path: &Path) -> Result<VideoInfo, ProbeError> {
    let output = build_ffprobe_command(ffprobe, path).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Best-effort dimensions for any asset; failures are logged and yield `None`.
pub async fn dimensions(asset_type: &AssetType, path: &Path, tools: &ToolsConfig) -> Option<Dimensions> {
    let result = match asset_type {
        AssetType::Image(_) => {
            let path: PathBuf = path.to_path_buf();
            match tokio::task::spawn_blocking(move || image_dimensions(&path)).await {
                Ok(result) => result,
                Err(e) => {
                    debug!(error = %e, "image probe task failed");
                    return None;
                }
            }
        }
        AssetType::Video(_) => probe_video(&tools.ffprobe, path)
            .await
            .and_then(|info| {
                info.dimensions
                    .ok_or_else(|| ProbeError::ParseError("no video stream".to_string()))
            }),
        AssetType::Pdf | AssetType::RemoteUrl(_) | AssetType::Unknown => return None,
    };

    match result {
        Ok(dimensions) => Some(dimensions),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "could not probe dimensions");
            None
        }
    }
}
