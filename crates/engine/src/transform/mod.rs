//! Transform planning per asset type.
//!
//! A transform is planned as one or more [`Candidate`]s, each an ordered chain
//! of tool invocations writing into the asset's scratch directory. Single
//! candidates are the norm; adaptive image sizing plans two and the executor
//! keeps the smaller result. Planning is pure: nothing runs here.

pub mod image;
pub mod pdf;
pub mod video;

use crate::asset::AssetType;
use crate::progress::ProgressGrammar;
use crate::runner::ToolCommand;
use media_optimiser_config::ToolsConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for transform planning
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    /// No transform implementation for this type
    #[error("unsupported asset type: {0}")]
    Unsupported(AssetType),

    /// The operation makes no sense for this type, or its parameters are out of range
    #[error("{operation} is not possible for {target}")]
    InvalidOperation { operation: String, target: String },
}

/// How to shrink an asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// Multiply both dimensions, `0 < factor < 1`
    Factor(f64),
    /// Fit inside a bounding box, keeping the aspect ratio
    Fit { width: u32, height: u32 },
}

impl Scale {
    pub fn is_valid(&self) -> bool {
        match *self {
            Scale::Factor(factor) => factor.is_finite() && factor > 0.0 && factor < 1.0,
            Scale::Fit { width, height } => width > 0 && height > 0,
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scale::Factor(factor) => write!(f, "{}%", (factor * 100.0).round()),
            Scale::Fit { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

/// Target size for a center crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropSize {
    pub width: u32,
    pub height: u32,
}

/// A requested transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Operation {
    Optimise,
    Downscale(Scale),
    Crop(CropSize),
    /// Playback speed multiplier, video only
    ChangeSpeed(f64),
    /// Video only
    RemoveAudio,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Optimise => "optimise",
            Operation::Downscale(_) => "downscale",
            Operation::Crop(_) => "crop",
            Operation::ChangeSpeed(_) => "change_speed",
            Operation::RemoveAudio => "remove_audio",
        }
    }

    /// Human-readable progress description.
    pub fn describe(&self) -> String {
        match self {
            Operation::Optimise => "Optimising".to_string(),
            Operation::Downscale(scale) => format!("Downscaling to {}", scale),
            Operation::Crop(size) => format!("Cropping to {}x{}", size.width, size.height),
            Operation::ChangeSpeed(speed) => format!("Changing speed to {}x", speed),
            Operation::RemoveAudio => "Removing audio".to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Operation::Optimise | Operation::RemoveAudio => true,
            Operation::Downscale(scale) => scale.is_valid(),
            Operation::Crop(size) => size.width > 0 && size.height > 0,
            Operation::ChangeSpeed(speed) => {
                speed.is_finite() && *speed >= 0.25 && *speed <= 4.0 && (*speed - 1.0).abs() > f64::EPSILON
            }
        }
    }
}

/// One tool invocation in a chain.
#[derive(Debug, Clone)]
pub struct Step {
    pub command: ToolCommand,
    /// Streaming progress parser, if the tool reports any
    pub grammar: Option<ProgressGrammar>,
    pub description: String,
    pub output: PathBuf,
}

/// A complete chain producing one output file.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub label: &'static str,
    pub steps: Vec<Step>,
    /// Final file of the chain
    pub output: PathBuf,
    /// Set when the chain converts to another format
    pub extension: Option<&'static str>,
}

/// Everything a transform will run.
#[derive(Debug, Clone)]
pub struct TransformPlan {
    /// Index 0 is the preferred candidate
    pub candidates: Vec<Candidate>,
}

impl TransformPlan {
    pub fn single(candidate: Candidate) -> Self {
        Self {
            candidates: vec![candidate],
        }
    }

    pub fn total_steps(&self) -> usize {
        self.candidates.iter().map(|c| c.steps.len()).sum()
    }
}

/// Input to planning.
#[derive(Debug, Clone, Copy)]
pub struct TransformRequest<'a> {
    pub asset_type: &'a AssetType,
    pub source: &'a Path,
    pub scratch: &'a Path,
    pub operation: &'a Operation,
    pub aggressive: bool,
    /// Try a second image format and keep the smaller result
    pub adaptive: bool,
    /// Source has transparency; excludes JPEG candidates
    pub has_alpha: bool,
    pub tools: &'a ToolsConfig,
}

impl TransformRequest<'_> {
    fn invalid(&self) -> TransformError {
        TransformError::InvalidOperation {
            operation: self.operation.name().to_string(),
            target: self.asset_type.to_string(),
        }
    }

    /// Scratch file for a chain step: `<scratch>/<label>-<n>.<ext>`.
    fn scratch_file(&self, label: &str, index: usize, extension: &str) -> PathBuf {
        self.scratch.join(format!("{}-{}.{}", label, index, extension))
    }
}

/// Plan the tool chains for a request.
pub fn plan(request: &TransformRequest<'_>) -> Result<TransformPlan, TransformError> {
    if !request.asset_type.supports(request.operation) {
        return match request.asset_type {
            AssetType::Unknown => Err(TransformError::Unsupported(AssetType::Unknown)),
            _ => Err(request.invalid()),
        };
    }
    if !request.operation.is_valid() {
        return Err(request.invalid());
    }

    match request.asset_type {
        AssetType::Image(format) => self::image::plan(*format, request),
        AssetType::Video(format) => self::video::plan(*format, request),
        AssetType::Pdf => pdf::plan(request),
        AssetType::RemoteUrl(url) => match AssetType::resolve_remote(url) {
            resolved @ (AssetType::Image(_) | AssetType::Video(_) | AssetType::Pdf) => {
                plan(&TransformRequest {
                    asset_type: &resolved,
                    ..*request
                })
            }
            _ => Err(TransformError::Unsupported(request.asset_type.clone())),
        },
        AssetType::Unknown => Err(TransformError::Unsupported(AssetType::Unknown)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn args(step: &Step) -> Vec<String> {
        step.command.args_lossy()
    }

    pub fn request<'a>(
        asset_type: &'a AssetType,
        operation: &'a Operation,
        tools: &'a ToolsConfig,
    ) -> TransformRequest<'a> {
        TransformRequest {
            asset_type,
            source: Path::new("/in/source"),
            scratch: Path::new("/scratch"),
            operation,
            aggressive: false,
            adaptive: false,
            has_alpha: false,
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::request;
    use super::*;
    use crate::asset::{ImageFormat, VideoFormat};

    #[test]
    fn test_operation_validation() {
        assert!(Operation::Downscale(Scale::Factor(0.5)).is_valid());
        assert!(!Operation::Downscale(Scale::Factor(1.5)).is_valid());
        assert!(!Operation::Downscale(Scale::Factor(0.0)).is_valid());
        assert!(!Operation::Downscale(Scale::Fit { width: 0, height: 10 }).is_valid());
        assert!(!Operation::Crop(CropSize { width: 10, height: 0 }).is_valid());
        assert!(Operation::ChangeSpeed(2.0).is_valid());
        assert!(!Operation::ChangeSpeed(1.0).is_valid());
        assert!(!Operation::ChangeSpeed(f64::NAN).is_valid());
    }

    #[test]
    fn test_speed_change_on_image_is_invalid() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Png);
        let op = Operation::ChangeSpeed(2.0);
        let err = plan(&request(&asset_type, &op, &tools)).unwrap_err();
        assert_eq!(
            err,
            TransformError::InvalidOperation {
                operation: "change_speed".to_string(),
                target: "image/png".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let tools = ToolsConfig::default();
        let op = Operation::Optimise;
        let err = plan(&request(&AssetType::Unknown, &op, &tools)).unwrap_err();
        assert_eq!(err, TransformError::Unsupported(AssetType::Unknown));
    }

    #[test]
    fn test_remote_url_plans_as_resolved_type() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::RemoteUrl("https://cdn.example.com/clip.mp4".to_string());
        let op = Operation::RemoveAudio;
        let plan = plan(&request(&asset_type, &op, &tools)).unwrap();
        assert_eq!(plan.candidates[0].steps[0].command.program(), "ffmpeg");

        let video = AssetType::Video(VideoFormat::Mp4);
        assert!(super::plan(&request(&video, &op, &tools)).is_ok());
    }

    #[test]
    fn test_operation_serde_shape() {
        let json = serde_json::to_string(&Operation::Downscale(Scale::Factor(0.5))).unwrap();
        assert_eq!(json, r#"{"op":"downscale","value":{"factor":0.5}}"#);
        let back: Operation = serde_json::from_str(r#"{"op":"optimise"}"#).unwrap();
        assert_eq!(back, Operation::Optimise);
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            Operation::Downscale(Scale::Factor(0.5)).describe(),
            "Downscaling to 50%"
        );
        assert_eq!(
            Operation::Crop(CropSize { width: 800, height: 600 }).describe(),
            "Cropping to 800x600"
        );
    }
}
