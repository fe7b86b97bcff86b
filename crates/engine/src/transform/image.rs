//! Still image tool chains.
//!
//! | format | lossless                     | aggressive                     |
//! |--------|------------------------------|--------------------------------|
//! | PNG    | oxipng                       | pngquant, then oxipng          |
//! | JPEG   | jpegoptim                    | jpegoptim --max=80             |
//! | GIF    | gifsicle -O3                 | gifsicle -O3 --lossy=80        |
//! | WebP   | cwebp -q 90                  | cwebp -q 70                    |
//! | other  | magick re-encode             | magick re-encode, quality 80   |
//!
//! Downscale and crop resize with magick first and then run the same chain on
//! the resized file.

use super::{Candidate, Operation, Scale, Step, TransformError, TransformPlan, TransformRequest};
use crate::asset::ImageFormat;
use crate::runner::ToolCommand;
use std::path::{Path, PathBuf};

/// Chain builder threading each step's output into the next step's input.
struct Chain<'r, 'a> {
    request: &'r TransformRequest<'a>,
    label: &'static str,
    input: PathBuf,
    steps: Vec<Step>,
}

impl<'r, 'a> Chain<'r, 'a> {
    fn new(request: &'r TransformRequest<'a>, label: &'static str) -> Self {
        Self {
            request,
            label,
            input: request.source.to_path_buf(),
            steps: Vec::new(),
        }
    }

    fn next_output(&self, extension: &str) -> PathBuf {
        self.request
            .scratch_file(self.label, self.steps.len() + 1, extension)
    }

    fn push(&mut self, command: ToolCommand, description: &str, output: PathBuf) {
        self.steps.push(Step {
            command,
            grammar: None,
            description: description.to_string(),
            output: output.clone(),
        });
        self.input = output;
    }

    fn finish(self, extension: Option<&'static str>) -> Candidate {
        Candidate {
            label: self.label,
            output: self.input,
            steps: self.steps,
            extension,
        }
    }
}

pub fn plan(format: ImageFormat, request: &TransformRequest<'_>) -> Result<TransformPlan, TransformError> {
    let mut chain = Chain::new(request, "image");

    match request.operation {
        Operation::Optimise => {}
        Operation::Downscale(scale) => resize(&mut chain, format, *scale),
        Operation::Crop(size) => {
            let output = chain.next_output(format.extension());
            let geometry = format!("{}x{}", size.width, size.height);
            let mut cmd = ToolCommand::new(&request.tools.magick);
            cmd.arg(&chain.input)
                .arg("-resize")
                .arg(format!("{}^", geometry))
                .arg("-gravity")
                .arg("center")
                .arg("-extent")
                .arg(&geometry)
                .arg("+repage")
                .arg(&output);
            chain.push(cmd, "Cropping", output);
        }
        Operation::ChangeSpeed(_) | Operation::RemoveAudio => return Err(request.invalid()),
    }

    optimise_chain(&mut chain, format, request.aggressive);
    let preferred = chain.finish(None);

    let mut plan = TransformPlan::single(preferred);
    if request.adaptive
        && format == ImageFormat::Png
        && !request.has_alpha
        && matches!(request.operation, Operation::Optimise)
    {
        plan.candidates.push(jpeg_candidate(request));
    }
    Ok(plan)
}

fn resize(chain: &mut Chain<'_, '_>, format: ImageFormat, scale: Scale) {
    let output = chain.next_output(format.extension());
    let geometry = match scale {
        Scale::Factor(factor) => format!("{}%", (factor * 10_000.0).round() / 100.0),
        // `>` only ever shrinks
        Scale::Fit { width, height } => format!("{}x{}>", width, height),
    };
    let mut cmd = ToolCommand::new(&chain.request.tools.magick);
    cmd.arg(&chain.input)
        .arg("-resize")
        .arg(geometry)
        .arg(&output);
    chain.push(cmd, "Resizing", output);
}

fn optimise_chain(chain: &mut Chain<'_, '_>, format: ImageFormat, aggressive: bool) {
    let tools = chain.request.tools;
    match format {
        ImageFormat::Png => {
            if aggressive {
                let output = chain.next_output("png");
                let mut cmd = ToolCommand::new(&tools.pngquant);
                cmd.args(["--quality", "60-85", "--speed", "1", "--strip", "--force", "--output"])
                    .arg(&output)
                    .arg(&chain.input);
                chain.push(cmd, "Quantizing colors", output);
            }
            let output = chain.next_output("png");
            let mut cmd = ToolCommand::new(&tools.oxipng);
            cmd.args(["-o", "4", "--strip"])
                .arg(if aggressive { "all" } else { "safe" })
                .arg("--out")
                .arg(&output)
                .arg(&chain.input);
            chain.push(cmd, "Compressing PNG", output);
        }
        ImageFormat::Jpeg => {
            // jpegoptim keeps the input file name inside --dest
            let dest = chain.request.scratch.join(format!("jpegoptim-{}", chain.steps.len() + 1));
            let output = dest.join(file_name(&chain.input));
            let mut cmd = ToolCommand::new(&tools.jpegoptim);
            cmd.args(["--force", "--strip-all", "--all-progressive"]);
            if aggressive {
                cmd.arg("--max=80");
            }
            cmd.arg("--dest").arg(&dest).arg(&chain.input);
            chain.push(cmd, "Compressing JPEG", output);
        }
        ImageFormat::Gif => {
            let output = chain.next_output("gif");
            let mut cmd = ToolCommand::new(&tools.gifsicle);
            cmd.arg("-O3");
            if aggressive {
                cmd.arg("--lossy=80");
            }
            cmd.arg("-o").arg(&output).arg(&chain.input);
            chain.push(cmd, "Compressing GIF", output);
        }
        ImageFormat::Webp => {
            let output = chain.next_output("webp");
            let mut cmd = ToolCommand::new(&tools.cwebp);
            cmd.arg("-q")
                .arg(if aggressive { "70" } else { "90" })
                .args(["-m", "6", "-metadata", "none"])
                .arg(&chain.input)
                .arg("-o")
                .arg(&output);
            chain.push(cmd, "Compressing WebP", output);
        }
        ImageFormat::Avif | ImageFormat::Heic | ImageFormat::Tiff | ImageFormat::Bmp => {
            let output = chain.next_output(format.extension());
            let mut cmd = ToolCommand::new(&tools.magick);
            cmd.arg(&chain.input).arg("-strip");
            if aggressive {
                cmd.args(["-quality", "80"]);
            }
            cmd.arg(&output);
            chain.push(cmd, "Re-encoding", output);
        }
    }
}

/// Lossy JPEG alternative to an opaque PNG.
fn jpeg_candidate(request: &TransformRequest<'_>) -> Candidate {
    let mut chain = Chain::new(request, "jpeg");
    let output = chain.next_output("jpg");
    let mut cmd = ToolCommand::new(&request.tools.magick);
    cmd.arg(&chain.input)
        .arg("-strip")
        .arg("-quality")
        .arg(if request.aggressive { "75" } else { "85" })
        .args(["-sampling-factor", "4:2:0", "-interlace", "JPEG"])
        .arg(&output);
    chain.push(cmd, "Converting to JPEG", output);
    chain.finish(Some("jpg"))
}

fn file_name(path: &Path) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("image.jpg"))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{args, request};
    use super::super::{plan as plan_any, CropSize};
    use super::*;
    use crate::asset::AssetType;
    use media_optimiser_config::ToolsConfig;

    #[test]
    fn test_png_lossless_is_single_oxipng_step() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Png);
        let op = Operation::Optimise;
        let plan = plan_any(&request(&asset_type, &op, &tools)).unwrap();

        assert_eq!(plan.candidates.len(), 1);
        let steps = &plan.candidates[0].steps;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].command.program(), "oxipng");
        let a = args(&steps[0]);
        assert!(a.contains(&"safe".to_string()));
        assert_eq!(a.last().unwrap(), "/in/source");
        assert_eq!(plan.candidates[0].output, Path::new("/scratch/image-1.png"));
    }

    #[test]
    fn test_png_aggressive_chains_pngquant_into_oxipng() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Png);
        let op = Operation::Optimise;
        let mut req = request(&asset_type, &op, &tools);
        req.aggressive = true;
        let plan = plan_any(&req).unwrap();

        let steps = &plan.candidates[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].command.program(), "pngquant");
        assert_eq!(steps[1].command.program(), "oxipng");
        // oxipng reads pngquant's output
        assert_eq!(
            args(&steps[1]).last().unwrap(),
            &steps[0].output.display().to_string()
        );
    }

    #[test]
    fn test_adaptive_png_adds_jpeg_candidate() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Png);
        let op = Operation::Optimise;
        let mut req = request(&asset_type, &op, &tools);
        req.adaptive = true;
        let plan = plan_any(&req).unwrap();

        assert_eq!(plan.candidates.len(), 2);
        assert_eq!(plan.candidates[0].extension, None);
        assert_eq!(plan.candidates[1].extension, Some("jpg"));
        assert_eq!(plan.candidates[1].output, Path::new("/scratch/jpeg-1.jpg"));

        req.has_alpha = true;
        assert_eq!(plan_any(&req).unwrap().candidates.len(), 1);
    }

    #[test]
    fn test_jpeg_uses_dest_directory() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Jpeg);
        let op = Operation::Optimise;
        let mut req = request(&asset_type, &op, &tools);
        req.aggressive = true;
        let plan = plan_any(&req).unwrap();

        let step = &plan.candidates[0].steps[0];
        assert!(args(step).contains(&"--max=80".to_string()));
        assert_eq!(step.output, Path::new("/scratch/jpegoptim-1/source"));
    }

    #[test]
    fn test_downscale_resizes_then_optimises() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Gif);
        let op = Operation::Downscale(Scale::Factor(0.5));
        let plan = plan_any(&request(&asset_type, &op, &tools)).unwrap();

        let steps = &plan.candidates[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].command.program(), "magick");
        assert!(args(&steps[0]).contains(&"50%".to_string()));
        assert_eq!(steps[1].command.program(), "gifsicle");
    }

    #[test]
    fn test_fit_only_shrinks() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Webp);
        let op = Operation::Downscale(Scale::Fit { width: 1280, height: 720 });
        let plan = plan_any(&request(&asset_type, &op, &tools)).unwrap();
        assert!(args(&plan.candidates[0].steps[0]).contains(&"1280x720>".to_string()));
    }

    #[test]
    fn test_crop_fills_then_extents() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Tiff);
        let op = Operation::Crop(CropSize { width: 300, height: 200 });
        let plan = plan_any(&request(&asset_type, &op, &tools)).unwrap();

        let a = args(&plan.candidates[0].steps[0]);
        assert!(a.contains(&"300x200^".to_string()));
        assert!(a.contains(&"-extent".to_string()));
        assert_eq!(plan.candidates[0].steps[1].command.program(), "magick");
    }

    #[test]
    fn test_adaptive_only_applies_to_plain_optimise() {
        let tools = ToolsConfig::default();
        let asset_type = AssetType::Image(ImageFormat::Png);
        let op = Operation::Downscale(Scale::Factor(0.5));
        let mut req = request(&asset_type, &op, &tools);
        req.adaptive = true;
        assert_eq!(plan_any(&req).unwrap().candidates.len(), 1);
    }
}
