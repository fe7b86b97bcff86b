//! PDF transforms through Ghostscript's pdfwrite device.

use super::{Candidate, Operation, Scale, Step, TransformError, TransformPlan, TransformRequest};
use crate::progress::ProgressGrammar;
use crate::runner::ToolCommand;

/// Image resolution of the `/ebook` preset, scaled for downscales.
const BASE_DPI: f64 = 150.0;

pub fn plan(request: &TransformRequest<'_>) -> Result<TransformPlan, TransformError> {
    let output = request.scratch_file("pdf", 1, "pdf");

    let mut cmd = ToolCommand::new(&request.tools.gs);
    cmd.args([
        "-sDEVICE=pdfwrite",
        "-dCompatibilityLevel=1.5",
        "-dNOPAUSE",
        "-dBATCH",
        "-dSAFER",
        "-dDetectDuplicateImages=true",
        "-dCompressFonts=true",
    ]);
    cmd.arg(if request.aggressive {
        "-dPDFSETTINGS=/screen"
    } else {
        "-dPDFSETTINGS=/ebook"
    });

    match request.operation {
        Operation::Optimise => {}
        Operation::Downscale(Scale::Factor(factor)) => {
            let dpi = (BASE_DPI * factor).round().max(36.0) as u32;
            for kind in ["Color", "Gray", "Mono"] {
                cmd.arg(format!("-dDownsample{}Images=true", kind))
                    .arg(format!("-d{}ImageDownsampleType=/Bicubic", kind))
                    .arg(format!("-d{}ImageResolution={}", kind, dpi));
            }
        }
        // Pages have no single pixel size to fit into
        Operation::Downscale(Scale::Fit { .. }) => return Err(request.invalid()),
        // Crop sizes are PostScript points for documents
        Operation::Crop(size) => {
            cmd.arg(format!("-dDEVICEWIDTHPOINTS={}", size.width))
                .arg(format!("-dDEVICEHEIGHTPOINTS={}", size.height))
                .args(["-dFIXEDMEDIA", "-dPDFFitPage"]);
        }
        Operation::ChangeSpeed(_) | Operation::RemoveAudio => return Err(request.invalid()),
    }

    cmd.arg(format!("-sOutputFile={}", output.display()))
        .arg(request.source);

    let step = Step {
        command: cmd,
        grammar: Some(ProgressGrammar::ghostscript()),
        description: if matches!(request.operation, Operation::Optimise) {
            "Compressing PDF".to_string()
        } else {
            request.operation.describe()
        },
        output: output.clone(),
    };
    Ok(TransformPlan::single(Candidate {
        label: "pdf",
        steps: vec![step],
        output,
        extension: None,
    }))
}
