//! Asset model and the per-asset optimisation state machine.
//!
//! An [`AssetOptimiser`] owns one asset's lifecycle. It is only ever mutated by
//! the coordinator task; workers report back through events and never touch it.

use crate::concurrency::QueueKind;
use crate::probe::Dimensions;
use crate::snapshot::{now_unix_ms, AssetSnapshot};
use crate::transform::Operation;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sentinel for byte counts that have not been computed yet.
pub const BYTES_UNKNOWN: i64 = -1;

/// Still image container formats with a transform implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Avif,
    Heic,
    Tiff,
    Bmp,
}

impl ImageFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "heic" | "heif" => Some(Self::Heic),
            "tif" | "tiff" => Some(Self::Tiff),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }

    /// Canonical file extension written for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Heic => "heic",
            Self::Tiff => "tiff",
            Self::Bmp => "bmp",
        }
    }
}

/// Video container formats with a transform implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Mp4,
    Mov,
    M4v,
    Mkv,
    Webm,
    Avi,
}

impl VideoFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "mov" => Some(Self::Mov),
            "m4v" => Some(Self::M4v),
            "mkv" => Some(Self::Mkv),
            "webm" => Some(Self::Webm),
            "avi" => Some(Self::Avi),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mov => "mov",
            Self::M4v => "m4v",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
            Self::Avi => "avi",
        }
    }
}

/// What kind of asset an id refers to.
///
/// Every transform dispatch matches on this exhaustively, so a new variant is a
/// compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "format", rename_all = "snake_case")]
pub enum AssetType {
    Image(ImageFormat),
    Video(VideoFormat),
    Pdf,
    RemoteUrl(String),
    Unknown,
}

impl AssetType {
    /// Classify a local file by its extension.
    pub fn from_path(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Self::Unknown;
        };
        if let Some(format) = ImageFormat::from_extension(ext) {
            return Self::Image(format);
        }
        if let Some(format) = VideoFormat::from_extension(ext) {
            return Self::Video(format);
        }
        if ext.eq_ignore_ascii_case("pdf") {
            return Self::Pdf;
        }
        Self::Unknown
    }

    /// Classify a caller-supplied identifier that may be a URL or a path.
    pub fn classify(input: &str) -> Self {
        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::RemoteUrl(input.to_string())
        } else {
            Self::from_path(Path::new(input))
        }
    }

    /// Type of the content behind a remote URL, judged from its path.
    pub fn resolve_remote(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .trim_end_matches('/');
        Self::from_path(Path::new(path))
    }

    /// Which bounded queue runs transforms for this type.
    pub fn queue(&self) -> Option<QueueKind> {
        match self {
            Self::Image(_) => Some(QueueKind::Image),
            Self::Video(_) => Some(QueueKind::Video),
            Self::Pdf => Some(QueueKind::Pdf),
            Self::RemoteUrl(url) => match Self::resolve_remote(url) {
                Self::RemoteUrl(_) | Self::Unknown => Some(QueueKind::Image),
                resolved => resolved.queue(),
            },
            Self::Unknown => None,
        }
    }

    /// Whether `operation` makes sense for this type at all.
    pub fn supports(&self, operation: &Operation) -> bool {
        match self {
            Self::Image(_) => matches!(
                operation,
                Operation::Optimise | Operation::Downscale(_) | Operation::Crop(_)
            ),
            Self::Video(_) => true,
            Self::Pdf => matches!(
                operation,
                Operation::Optimise | Operation::Downscale(_) | Operation::Crop(_)
            ),
            Self::RemoteUrl(url) => match Self::resolve_remote(url) {
                Self::RemoteUrl(_) | Self::Unknown => matches!(operation, Operation::Optimise),
                resolved => resolved.supports(operation),
            },
            Self::Unknown => false,
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetType::Image(format) => write!(f, "image/{}", format.extension()),
            AssetType::Video(format) => write!(f, "video/{}", format.extension()),
            AssetType::Pdf => write!(f, "pdf"),
            AssetType::RemoteUrl(url) => write!(f, "url({})", url),
            AssetType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Normalized progress of one transform.
///
/// `completed_units <= total_units` always holds. While `indeterminate` the
/// completed count stays at zero; the total is refined exactly once and never
/// drops below what has already been reported as completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed_units: u64,
    pub total_units: u64,
    pub indeterminate: bool,
    pub description: String,
}

impl Progress {
    pub fn indeterminate(description: impl Into<String>) -> Self {
        Self {
            completed_units: 0,
            total_units: 0,
            indeterminate: true,
            description: description.into(),
        }
    }

    pub fn determinate(total_units: u64, description: impl Into<String>) -> Self {
        Self {
            completed_units: 0,
            total_units,
            indeterminate: false,
            description: description.into(),
        }
    }

    /// Upgrade from indeterminate to a real count. Later calls are ignored.
    pub fn set_total(&mut self, total_units: u64) -> bool {
        if !self.indeterminate {
            return false;
        }
        self.total_units = total_units.max(self.completed_units);
        self.indeterminate = false;
        true
    }

    /// Advance monotonically, clamped to the known total.
    pub fn advance_to(&mut self, completed_units: u64) -> bool {
        if self.indeterminate {
            return false;
        }
        let next = completed_units
            .max(self.completed_units)
            .min(self.total_units);
        let changed = next != self.completed_units;
        self.completed_units = next;
        changed
    }

    /// Fold an update from a worker into this progress without breaking monotonicity.
    pub fn merge(&mut self, update: &Progress) {
        if !update.description.is_empty() {
            self.description = update.description.clone();
        }
        if update.indeterminate {
            return;
        }
        self.set_total(update.total_units);
        self.advance_to(update.completed_units);
    }

    pub fn finish(&mut self) {
        if self.indeterminate {
            self.total_units = 1;
            self.indeterminate = false;
        }
        self.completed_units = self.total_units;
    }

    pub fn fraction(&self) -> Option<f64> {
        if self.indeterminate || self.total_units == 0 {
            return None;
        }
        Some(self.completed_units as f64 / self.total_units as f64)
    }
}

/// Coarse lifecycle state derived from an asset's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Idle,
    Running,
    Finished,
    Failed,
    Removed,
}

/// Ongoing user interactions that keep an asset from being auto-removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    Hover,
    Rename,
    Drag,
    /// Background job that callers do not display.
    Hidden,
}

/// Metrics recorded when a transform completes.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishMetrics {
    pub old_bytes: u64,
    pub new_bytes: u64,
    pub old_size: Option<Dimensions>,
    pub new_size: Option<Dimensions>,
    pub result_path: Option<PathBuf>,
}

/// One asset's mutable unit of work.
#[derive(Debug, Clone)]
pub struct AssetOptimiser {
    id: String,
    asset_type: AssetType,
    started_at: i64,

    pub running: bool,
    pub error: Option<String>,
    pub notice: Option<String>,
    pub old_bytes: i64,
    pub new_bytes: i64,
    pub old_size: Option<Dimensions>,
    pub new_size: Option<Dimensions>,
    pub progress: Progress,
    pub source_path: Option<PathBuf>,
    pub result_path: Option<PathBuf>,
    /// Where the pristine original lives when restored (the source before any
    /// format conversion renamed it)
    original_path: Option<PathBuf>,
    backup_path: Option<PathBuf>,
    /// Small preview of the latest image result
    pub thumbnail_path: Option<PathBuf>,
    pub processes: HashSet<u32>,
    pub aggressive: bool,
    /// Set when the file on disk is the pristine original again.
    pub is_original: bool,
    /// A request is waiting in the debounce window or behind the current run.
    pub pending: bool,
    pub operation: Option<Operation>,

    interactions: HashSet<Interaction>,
    removal_delay: Option<Duration>,
    removal_token: u64,
    run: u64,
    removed: bool,
}

impl AssetOptimiser {
    pub fn new(id: impl Into<String>, asset_type: AssetType, source_path: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            asset_type,
            started_at: now_unix_ms(),
            running: false,
            error: None,
            notice: None,
            old_bytes: BYTES_UNKNOWN,
            new_bytes: BYTES_UNKNOWN,
            old_size: None,
            new_size: None,
            progress: Progress::default(),
            result_path: source_path.clone(),
            original_path: source_path.clone(),
            source_path,
            backup_path: None,
            thumbnail_path: None,
            processes: HashSet::new(),
            aggressive: false,
            is_original: true,
            pending: false,
            operation: None,
            interactions: HashSet::new(),
            removal_delay: None,
            removal_token: 0,
            run: 0,
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn asset_type(&self) -> &AssetType {
        &self.asset_type
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup_path.as_deref()
    }

    pub fn original_path(&self) -> Option<&Path> {
        self.original_path.as_deref()
    }

    /// Generation of the current (or last) run; worker events carry it so stale
    /// reports from superseded runs can be dropped.
    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn state(&self) -> AssetState {
        if self.removed {
            AssetState::Removed
        } else if self.running {
            AssetState::Running
        } else if self.error.is_some() {
            AssetState::Failed
        } else if self.operation.is_some() {
            AssetState::Finished
        } else {
            AssetState::Idle
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.interactions.contains(&Interaction::Hidden)
    }

    /// Enter `Running` for a new transform and return its run generation.
    pub fn start(&mut self, operation: Operation, aggressive: bool) -> u64 {
        self.error = None;
        self.notice = None;
        self.running = true;
        self.pending = false;
        self.aggressive = aggressive;
        self.progress = Progress::indeterminate(operation.describe());
        self.operation = Some(operation);
        self.disarm_removal();
        self.run += 1;
        self.run
    }

    /// Remember where the pristine copy went. Only the first backup counts;
    /// chained transforms keep pointing at the original.
    pub fn record_backup(&mut self, backup_path: Option<PathBuf>) {
        if self.backup_path.is_none() {
            self.backup_path = backup_path;
        }
    }

    /// Enter `Running` to put the backed-up original back in place.
    pub fn start_restore(&mut self) -> u64 {
        self.error = None;
        self.notice = None;
        self.running = true;
        self.pending = false;
        self.progress = Progress::indeterminate("Restoring original");
        self.disarm_removal();
        self.run += 1;
        self.run
    }

    /// Record a successful transform. Returns the removal delay to arm, if any.
    pub fn finish(&mut self, metrics: FinishMetrics, remove_after: Duration) -> Option<Duration> {
        self.running = false;
        self.processes.clear();
        self.old_bytes = metrics.old_bytes as i64;
        self.new_bytes = metrics.new_bytes as i64;
        self.old_size = metrics.old_size;
        self.new_size = metrics.new_size;
        if metrics.result_path.is_some() {
            self.result_path = metrics.result_path;
        }
        self.is_original = false;
        self.progress.finish();
        self.removal_after(remove_after)
    }

    /// Record a recoverable outcome (already optimised, not smaller, stopped).
    pub fn settle(&mut self, notice: impl Into<String>, bytes: Option<(u64, u64)>, remove_after: Duration) -> Option<Duration> {
        self.running = false;
        self.processes.clear();
        self.error = None;
        self.notice = Some(notice.into());
        if let Some((old_bytes, new_bytes)) = bytes {
            self.old_bytes = old_bytes as i64;
            self.new_bytes = new_bytes as i64;
        }
        self.progress.finish();
        self.removal_after(remove_after)
    }

    /// Record a genuine failure.
    pub fn fail(&mut self, error: impl Into<String>, remove_after: Duration) -> Option<Duration> {
        self.running = false;
        self.processes.clear();
        self.error = Some(error.into());
        self.removal_after(remove_after)
    }

    /// Leave `Running` because the engine cancelled the work.
    ///
    /// The worker's own cancel token terminates its subprocesses. The run
    /// generation is bumped so the cancelled worker's late reports are ignored.
    pub fn stop(&mut self) {
        self.processes.clear();
        if self.running {
            self.notice = Some("Stopped".to_string());
        }
        self.running = false;
        self.pending = false;
        self.error = None;
        self.run += 1;
    }

    /// The original is back on disk; derived metrics are void.
    pub fn mark_restored(&mut self, bytes: u64, remove_after: Duration) -> Option<Duration> {
        self.running = false;
        self.processes.clear();
        self.is_original = true;
        self.old_bytes = bytes as i64;
        self.new_bytes = BYTES_UNKNOWN;
        self.new_size = None;
        self.thumbnail_path = None;
        if let Some(original) = self.original_path.clone() {
            self.refresh_type(&original);
            self.source_path = Some(original);
        }
        self.result_path = self.source_path.clone();
        self.notice = Some("Restored original".to_string());
        self.progress.finish();
        self.removal_after(remove_after)
    }

    pub fn mark_removed(&mut self) {
        self.removed = true;
        self.running = false;
        self.pending = false;
        self.disarm_removal();
    }

    /// Put a removed asset back into circulation (bring-back from history).
    pub fn revive(&mut self) {
        self.removed = false;
    }

    /// The file now lives at `path`, possibly in another format.
    pub fn set_source_path(&mut self, path: PathBuf) {
        if self.result_path.is_none() || self.result_path == self.source_path {
            self.result_path = Some(path.clone());
        }
        self.refresh_type(&path);
        self.source_path = Some(path);
    }

    /// Follow a format change; remote assets and unknown extensions keep their type.
    fn refresh_type(&mut self, path: &Path) {
        if matches!(self.asset_type, AssetType::RemoteUrl(_)) {
            return;
        }
        match AssetType::from_path(path) {
            AssetType::Unknown => {}
            detected => self.asset_type = detected,
        }
    }

    /// Update an interaction flag. Returns true when the asset just became idle.
    pub fn set_interaction(&mut self, interaction: Interaction, active: bool) -> bool {
        if active {
            self.interactions.insert(interaction);
            false
        } else {
            self.interactions.remove(&interaction) && self.interactions.is_empty()
        }
    }

    /// Never auto-remove while running or while anything interacts with the asset.
    pub fn auto_removal_allowed(&self) -> bool {
        !self.running && !self.pending && self.interactions.is_empty()
    }

    fn removal_after(&mut self, remove_after: Duration) -> Option<Duration> {
        if remove_after.is_zero() {
            self.removal_delay = None;
            return None;
        }
        self.removal_delay = Some(remove_after);
        self.auto_removal_allowed().then_some(remove_after)
    }

    /// Delay to re-arm once interactions end, if a removal was requested.
    pub fn pending_removal(&self) -> Option<Duration> {
        self.removal_delay.filter(|_| self.auto_removal_allowed())
    }

    /// Arm the removal timer; the returned token identifies this arming.
    pub fn arm_removal(&mut self) -> u64 {
        self.removal_token += 1;
        self.removal_token
    }

    pub fn disarm_removal(&mut self) {
        self.removal_token += 1;
    }

    pub fn removal_token(&self) -> u64 {
        self.removal_token
    }

    pub fn snapshot(&self) -> AssetSnapshot {
        AssetSnapshot {
            id: self.id.clone(),
            asset_type: self.asset_type.clone(),
            state: self.state(),
            running: self.running,
            pending: self.pending,
            progress: self.progress.clone(),
            error: self.error.clone(),
            notice: self.notice.clone(),
            old_bytes: self.old_bytes,
            new_bytes: self.new_bytes,
            old_size: self.old_size,
            new_size: self.new_size,
            source_path: self.source_path.clone(),
            result_path: self.result_path.clone(),
            backup_path: self.backup_path.clone(),
            thumbnail_path: self.thumbnail_path.clone(),
            aggressive: self.aggressive,
            is_original: self.is_original,
            hidden: self.is_hidden(),
            operation: self.operation.as_ref().map(|op| op.name().to_string()),
            started_at: self.started_at,
            run: self.run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Scale;
    use proptest::prelude::*;

    fn png_asset() -> AssetOptimiser {
        AssetOptimiser::new(
            "/tmp/shot.png",
            AssetType::Image(ImageFormat::Png),
            Some(PathBuf::from("/tmp/shot.png")),
        )
    }

    fn metrics(old_bytes: u64, new_bytes: u64) -> FinishMetrics {
        FinishMetrics {
            old_bytes,
            new_bytes,
            old_size: None,
            new_size: None,
            result_path: None,
        }
    }

    #[test]
    fn test_classify_paths_and_urls() {
        assert_eq!(
            AssetType::classify("/a/b/Photo.JPEG"),
            AssetType::Image(ImageFormat::Jpeg)
        );
        assert_eq!(
            AssetType::classify("clip.webm"),
            AssetType::Video(VideoFormat::Webm)
        );
        assert_eq!(AssetType::classify("paper.pdf"), AssetType::Pdf);
        assert_eq!(AssetType::classify("notes.txt"), AssetType::Unknown);
        assert_eq!(AssetType::classify("Clipboard image"), AssetType::Unknown);
        assert_eq!(
            AssetType::classify("https://example.com/a.png?x=1"),
            AssetType::RemoteUrl("https://example.com/a.png?x=1".to_string())
        );
        assert_eq!(
            AssetType::resolve_remote("https://example.com/a.png?x=1"),
            AssetType::Image(ImageFormat::Png)
        );
    }

    #[test]
    fn test_operation_support_matrix() {
        let image = AssetType::Image(ImageFormat::Png);
        let video = AssetType::Video(VideoFormat::Mp4);
        assert!(image.supports(&Operation::Downscale(Scale::Factor(0.5))));
        assert!(!image.supports(&Operation::ChangeSpeed(2.0)));
        assert!(!image.supports(&Operation::RemoveAudio));
        assert!(video.supports(&Operation::RemoveAudio));
        assert!(!AssetType::Pdf.supports(&Operation::ChangeSpeed(2.0)));
        assert!(!AssetType::Unknown.supports(&Operation::Optimise));
        assert_eq!(AssetType::Unknown.queue(), None);
        assert_eq!(AssetType::Pdf.queue(), Some(QueueKind::Pdf));
    }

    #[test]
    fn test_start_finish_lifecycle() {
        let mut asset = png_asset();
        assert_eq!(asset.state(), AssetState::Idle);

        let run = asset.start(Operation::Optimise, false);
        assert_eq!(run, 1);
        assert_eq!(asset.state(), AssetState::Running);
        assert!(asset.progress.indeterminate);

        let removal = asset.finish(metrics(10_000_000, 3_000_000), Duration::from_secs(5));
        assert_eq!(removal, Some(Duration::from_secs(5)));
        assert_eq!(asset.state(), AssetState::Finished);
        assert_eq!(asset.old_bytes, 10_000_000);
        assert_eq!(asset.new_bytes, 3_000_000);
        assert!(!asset.is_original);
    }

    #[test]
    fn test_backup_reference_is_recorded_once() {
        let mut asset = png_asset();
        asset.start(Operation::Optimise, false);
        asset.record_backup(Some(PathBuf::from("/b/first")));
        asset.finish(metrics(10, 5), Duration::ZERO);
        asset.start(Operation::Downscale(Scale::Factor(0.5)), false);
        asset.record_backup(Some(PathBuf::from("/b/second")));
        assert_eq!(asset.backup_path(), Some(Path::new("/b/first")));
    }

    #[test]
    fn test_conversion_updates_asset_type() {
        let mut asset = png_asset();
        asset.start(Operation::Optimise, false);
        asset.finish(metrics(100, 40), Duration::ZERO);
        asset.set_source_path(PathBuf::from("/tmp/shot.jpg"));

        assert_eq!(asset.asset_type(), &AssetType::Image(ImageFormat::Jpeg));
        assert_eq!(asset.snapshot().asset_type, AssetType::Image(ImageFormat::Jpeg));
        assert_eq!(asset.result_path, Some(PathBuf::from("/tmp/shot.jpg")));

        asset.set_source_path(PathBuf::from("/tmp/shot"));
        assert_eq!(asset.asset_type(), &AssetType::Image(ImageFormat::Jpeg));
    }

    #[test]
    fn test_start_clears_previous_error_and_notice() {
        let mut asset = png_asset();
        asset.start(Operation::Optimise, false);
        asset.fail("oxipng exited with code 1", Duration::from_secs(1));
        assert_eq!(asset.state(), AssetState::Failed);

        asset.start(Operation::Optimise, true);
        assert!(asset.error.is_none());
        assert!(asset.notice.is_none());
        assert!(asset.aggressive);
    }

    #[test]
    fn test_stop_is_not_a_failure() {
        let mut asset = png_asset();
        let run = asset.start(Operation::Optimise, false);
        asset.processes.insert(4242);

        asset.stop();
        assert!(asset.processes.is_empty());
        assert_eq!(asset.notice.as_deref(), Some("Stopped"));
        assert!(!asset.running);
        assert!(asset.error.is_none());
        assert_ne!(asset.state(), AssetState::Failed);
        assert!(asset.run() > run, "stale worker reports must be distinguishable");
    }

    #[test]
    fn test_interaction_suspends_auto_removal() {
        let mut asset = png_asset();
        asset.start(Operation::Optimise, false);
        asset.set_interaction(Interaction::Hover, true);

        let removal = asset.finish(metrics(10, 5), Duration::from_secs(2));
        assert_eq!(removal, None, "hovered asset must not arm removal");
        assert_eq!(asset.pending_removal(), None);

        asset.set_interaction(Interaction::Drag, true);
        assert!(!asset.set_interaction(Interaction::Hover, false));
        assert!(asset.set_interaction(Interaction::Drag, false));
        assert_eq!(asset.pending_removal(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_restore_resets_derived_metrics() {
        let mut asset = png_asset();
        asset.start(Operation::Optimise, false);
        asset.finish(metrics(100, 40), Duration::ZERO);

        asset.set_source_path(PathBuf::from("/tmp/shot.jpg"));
        assert_eq!(asset.original_path(), Some(Path::new("/tmp/shot.png")));

        asset.start_restore();
        asset.mark_restored(100, Duration::ZERO);
        assert!(asset.is_original);
        assert_eq!(asset.source_path, Some(PathBuf::from("/tmp/shot.png")));
        assert_eq!(asset.asset_type(), &AssetType::Image(ImageFormat::Png));
        assert_eq!(asset.new_bytes, BYTES_UNKNOWN);
        assert_eq!(asset.result_path, asset.source_path);
    }

    #[test]
    fn test_progress_total_refined_once() {
        let mut progress = Progress::indeterminate("Encoding");
        assert!(!progress.advance_to(10));
        assert!(progress.set_total(100));
        assert!(!progress.set_total(5));
        assert_eq!(progress.total_units, 100);
        progress.advance_to(40);
        progress.advance_to(20);
        assert_eq!(progress.completed_units, 40);
        progress.advance_to(500);
        assert_eq!(progress.completed_units, 100);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_is_monotonic_and_bounded(
            total in 1u64..100_000,
            updates in proptest::collection::vec(0u64..200_000, 0..50),
        ) {
            let mut progress = Progress::indeterminate("Working");
            progress.set_total(total);
            let mut last = 0;
            for update in updates {
                progress.advance_to(update);
                prop_assert!(progress.completed_units >= last);
                prop_assert!(progress.completed_units <= progress.total_units);
                last = progress.completed_units;
            }
        }

        #[test]
        fn prop_merge_never_moves_backwards(
            updates in proptest::collection::vec((0u64..1000, 1u64..1000), 1..30),
        ) {
            let mut progress = Progress::indeterminate("Working");
            let mut last = 0;
            for (completed, total) in updates {
                progress.merge(&Progress {
                    completed_units: completed,
                    total_units: total,
                    indeterminate: false,
                    description: String::new(),
                });
                prop_assert!(progress.completed_units >= last);
                prop_assert!(progress.completed_units <= progress.total_units);
                last = progress.completed_units;
            }
        }
    }
}
