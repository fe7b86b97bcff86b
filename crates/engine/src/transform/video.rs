//! Video transforms: a single ffmpeg invocation per operation.
//!
//! ffmpeg is run with `-progress pipe:1` so the tracker sees `out_time_us=`
//! lines on stdout and the input `Duration:` banner on stderr.

use super::{Candidate, Operation, Scale, Step, TransformError, TransformPlan, TransformRequest};
use crate::asset::VideoFormat;
use crate::progress::ProgressGrammar;
use crate::runner::ToolCommand;

/// H.264 CRF for each profile
const X264_CRF: (&str, &str) = ("23", "28");
/// VP9 CRF for each profile
const VP9_CRF: (&str, &str) = ("32", "38");

/// Container written for a source format; AVI is converted to MP4.
fn output_format(format: VideoFormat) -> VideoFormat {
    match format {
        VideoFormat::Avi => VideoFormat::Mp4,
        other => other,
    }
}

pub fn plan(format: VideoFormat, request: &TransformRequest<'_>) -> Result<TransformPlan, TransformError> {
    let target = output_format(format);
    let output = request.scratch_file("video", 1, target.extension());
    let aggressive = request.aggressive;

    let mut cmd = ToolCommand::new(&request.tools.ffmpeg);
    cmd.args(["-y", "-hide_banner", "-nostats", "-progress", "pipe:1", "-i"])
        .arg(request.source);

    let mut video_filters: Vec<String> = Vec::new();
    let mut audio_filters: Vec<String> = Vec::new();
    let mut copy_video = false;
    let mut drop_audio = false;

    match request.operation {
        Operation::Optimise => {}
        Operation::Downscale(scale) => video_filters.push(scale_filter(*scale)),
        Operation::Crop(size) => video_filters.push(format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
            w = size.width,
            h = size.height
        )),
        Operation::ChangeSpeed(speed) => {
            video_filters.push(format!("setpts=PTS/{}", speed));
            audio_filters.extend(atempo_chain(*speed));
        }
        Operation::RemoveAudio => {
            // Only the audio goes; the video stream is copied untouched
            copy_video = format == target;
            drop_audio = true;
        }
    }

    if copy_video {
        cmd.args(["-map", "0:v", "-c:v", "copy"]);
    } else {
        if !video_filters.is_empty() {
            cmd.arg("-vf").arg(video_filters.join(","));
        }
        video_codec(&mut cmd, target, aggressive);
    }

    if drop_audio {
        cmd.arg("-an");
    } else {
        if !audio_filters.is_empty() {
            cmd.arg("-af").arg(audio_filters.join(","));
        }
        audio_codec(&mut cmd, target);
    }

    if matches!(target, VideoFormat::Mp4 | VideoFormat::Mov | VideoFormat::M4v) {
        cmd.args(["-movflags", "+faststart"]);
    }
    cmd.arg(&output);

    let step = Step {
        command: cmd,
        grammar: Some(ProgressGrammar::ffmpeg()),
        description: request.operation.describe(),
        output: output.clone(),
    };
    Ok(TransformPlan::single(Candidate {
        label: "video",
        steps: vec![step],
        output,
        extension: (target != format).then(|| target.extension()),
    }))
}

/// Even output dimensions are required by yuv420p encoders.
fn scale_filter(scale: Scale) -> String {
    match scale {
        Scale::Factor(factor) => format!(
            "scale=trunc(iw*{f}/2)*2:trunc(ih*{f}/2)*2",
            f = factor
        ),
        Scale::Fit { width, height } => format!(
            "scale=w={}:h={}:force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2",
            width, height
        ),
    }
}

/// `atempo` accepts 0.5..=2.0 per instance, so larger changes are chained.
fn atempo_chain(speed: f64) -> Vec<String> {
    let mut filters = Vec::new();
    let mut remaining = speed;
    while remaining > 2.0 {
        filters.push("atempo=2.0".to_string());
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        filters.push("atempo=0.5".to_string());
        remaining /= 0.5;
    }
    filters.push(format!("atempo={}", remaining));
    filters
}

fn video_codec(cmd: &mut ToolCommand, target: VideoFormat, aggressive: bool) {
    match target {
        VideoFormat::Webm => {
            let crf = if aggressive { VP9_CRF.1 } else { VP9_CRF.0 };
            cmd.args(["-c:v", "libvpx-vp9", "-crf", crf, "-b:v", "0", "-row-mt", "1"]);
        }
        VideoFormat::Mp4 | VideoFormat::Mov | VideoFormat::M4v | VideoFormat::Mkv | VideoFormat::Avi => {
            let crf = if aggressive { X264_CRF.1 } else { X264_CRF.0 };
            cmd.args([
                "-c:v", "libx264", "-preset", "slow", "-crf", crf, "-pix_fmt", "yuv420p",
            ]);
        }
    }
}

fn audio_codec(cmd: &mut ToolCommand, target: VideoFormat) {
    match target {
        VideoFormat::Webm => {
            cmd.args(["-c:a", "libopus", "-b:a", "96k"]);
        }
        _ => {
            cmd.args(["-c:a", "aac", "-b:a", "128k"]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{args, request};
    use super::super::{plan as plan_any, CropSize};
    use super::*;
    use crate::asset::AssetType;
    use media_optimiser_config::ToolsConfig;
    use std::path::Path;

    fn video_args(format: VideoFormat, op: Operation, aggressive: bool) -> (Vec<String>, Candidate) {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Video(format);
        let mut req = request(&asset_type, &op, &tools);
        req.aggressive = aggressive;
        let plan = plan_any(&req).unwrap();
        let candidate = plan.candidates.into_iter().next().unwrap();
        (args(&candidate.steps[0]), candidate)
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_optimise_mp4_profiles() {
        let (a, candidate) = video_args(VideoFormat::Mp4, Operation::Optimise, false);
        assert!(has_pair(&a, "-progress", "pipe:1"));
        assert!(has_pair(&a, "-crf", "23"));
        assert!(has_pair(&a, "-c:a", "aac"));
        assert!(has_pair(&a, "-movflags", "+faststart"));
        assert_eq!(candidate.output, Path::new("/scratch/video-1.mp4"));
        assert_eq!(candidate.extension, None);
        assert!(candidate.steps[0].grammar.is_some());

        let (a, _) = video_args(VideoFormat::Mp4, Operation::Optimise, true);
        assert!(has_pair(&a, "-crf", "28"));
    }

    #[test]
    fn test_webm_stays_vp9() {
        let (a, _) = video_args(VideoFormat::Webm, Operation::Optimise, false);
        assert!(has_pair(&a, "-c:v", "libvpx-vp9"));
        assert!(has_pair(&a, "-c:a", "libopus"));
        assert!(!a.contains(&"-movflags".to_string()));
    }

    #[test]
    fn test_avi_converts_to_mp4() {
        let (_, candidate) = video_args(VideoFormat::Avi, Operation::Optimise, false);
        assert_eq!(candidate.extension, Some("mp4"));
        assert_eq!(candidate.output, Path::new("/scratch/video-1.mp4"));
    }

    #[test]
    fn test_remove_audio_copies_video() {
        let (a, _) = video_args(VideoFormat::Mov, Operation::RemoveAudio, false);
        assert!(has_pair(&a, "-c:v", "copy"));
        assert!(a.contains(&"-an".to_string()));
        assert!(!a.contains(&"-c:a".to_string()));
    }

    #[test]
    fn test_speed_change_filters() {
        let (a, _) = video_args(VideoFormat::Mp4, Operation::ChangeSpeed(4.0), false);
        assert!(has_pair(&a, "-vf", "setpts=PTS/4"));
        assert!(has_pair(&a, "-af", "atempo=2.0,atempo=2"));

        assert_eq!(atempo_chain(0.25), vec!["atempo=0.5", "atempo=0.5"]);
        assert_eq!(atempo_chain(1.5), vec!["atempo=1.5"]);
    }

    #[test]
    fn test_downscale_and_crop_filters() {
        let (a, _) = video_args(VideoFormat::Mkv, Operation::Downscale(Scale::Factor(0.5)), false);
        assert!(has_pair(&a, "-vf", "scale=trunc(iw*0.5/2)*2:trunc(ih*0.5/2)*2"));

        let (a, _) = video_args(
            VideoFormat::Mp4,
            Operation::Crop(CropSize { width: 1080, height: 1080 }),
            false,
        );
        assert!(has_pair(
            &a,
            "-vf",
            "scale=1080:1080:force_original_aspect_ratio=increase,crop=1080:1080"
        ));
    }
}
