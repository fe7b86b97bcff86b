//! Startup tool checks
//!
//! Probes every configured compressor once with its version flag. Nothing here
//! is fatal: a missing tool only fails the assets that need it, so the report
//! is logged and handed to the caller.

use media_optimiser_config::ToolsConfig;
use serde::Serialize;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Oldest ffmpeg whose `-progress` output the tracker understands
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Result of probing one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: &'static str,
    /// Executable as configured
    pub program: String,
    pub available: bool,
    /// First line of the version output
    pub version: Option<String>,
}

/// Report for all configured tools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    pub tools: Vec<ToolStatus>,
}

impl ToolAvailability {
    pub fn get(&self, name: &str) -> Option<&ToolStatus> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn missing(&self) -> impl Iterator<Item = &ToolStatus> {
        self.tools.iter().filter(|t| !t.available)
    }

    pub fn all_available(&self) -> bool {
        self.tools.iter().all(|t| t.available)
    }
}

/// Tools with the flag that prints their version
fn probes(tools: &ToolsConfig) -> [(&'static str, &str, &'static str); 9] {
    [
        ("oxipng", &tools.oxipng, "--version"),
        ("pngquant", &tools.pngquant, "--version"),
        ("jpegoptim", &tools.jpegoptim, "--version"),
        ("gifsicle", &tools.gifsicle, "--version"),
        ("cwebp", &tools.cwebp, "-version"),
        ("magick", &tools.magick, "-version"),
        ("ffmpeg", &tools.ffmpeg, "-version"),
        ("ffprobe", &tools.ffprobe, "-version"),
        ("gs", &tools.gs, "--version"),
    ]
}

fn probe(name: &'static str, program: &str, flag: &str) -> ToolStatus {
    let output = Command::new(program)
        .arg(flag)
        .stdin(Stdio::null())
        .output();
    let (available, version) = match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string);
            (true, version)
        }
        Ok(_) | Err(_) => (false, None),
    };
    ToolStatus {
        name,
        program: program.to_string(),
        available,
        version,
    }
}

/// Probe every configured tool and log what is missing.
pub fn check_tools(tools: &ToolsConfig) -> ToolAvailability {
    let report = ToolAvailability {
        tools: probes(tools)
            .into_iter()
            .map(|(name, program, flag)| probe(name, program, flag))
            .collect(),
    };

    for status in report.missing() {
        warn!(tool = status.name, program = %status.program, "tool not available; assets needing it will fail");
    }
    if let Some(version) = report.get("ffmpeg").and_then(|s| s.version.as_deref()) {
        match parse_ffmpeg_version(version) {
            Some(major) if major < MIN_FFMPEG_MAJOR => {
                warn!(major, "ffmpeg is older than {}; progress may not be reported", MIN_FFMPEG_MAJOR)
            }
            Some(_) => {}
            None => warn!(version, "could not parse ffmpeg version"),
        }
    }
    info!(
        available = report.tools.len() - report.missing().count(),
        total = report.tools.len(),
        "tool check finished"
    );
    report
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_lowercase();
    let version_part = lower
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?;

    // Distribution builds prefix git tags with 'n'
    let version_str = version_part.trim_start_matches('n');

    version_str
        .split(['.', '-'])
        .next()?
        .parse()
        .ok()
}
