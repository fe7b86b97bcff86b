//! Transform executor.
//!
//! Runs one transform to completion on a bounded queue: queue admission,
//! marker checks, the planned tool chains, the size gate and the final
//! backup-and-replace. Workers never touch the registry; everything they learn
//! is reported to the coordinator as a [`WorkerEvent`] tagged with the run
//! generation it belongs to.

use crate::asset::{AssetType, FinishMetrics, Progress};
use crate::backup::{atomic_replace, bucket_name, BackupStore};
use crate::concurrency::ExecutionQueues;
use crate::error::EngineError;
use crate::fetch;
use crate::marker::OptimisationMarker;
use crate::probe;
use crate::progress::ProgressSink;
use crate::runner::{ProcessEvent, ProcessObserver, ProgressHook, RunContext, ToolRunner};
use crate::size_gate::{check_result_size, pick_smaller, SizeGateResult};
use crate::transform::{self, Candidate, Operation, Step, TransformPlan, TransformRequest};
use media_optimiser_config::ToolsConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Progress units reserved for each tool step of a plan.
pub const STEP_UNITS: u64 = 1000;

/// Everything a worker needs to run one transform.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub run: u64,
    pub asset_type: AssetType,
    /// Local file to transform; `None` for remote URLs
    pub source: Option<PathBuf>,
    pub operation: Operation,
    pub aggressive: bool,
    pub allow_larger: bool,
    /// Write the result here instead of replacing the source
    pub output_template: Option<String>,
    /// Backup this asset already took; reused instead of copying again
    pub backup: Option<PathBuf>,
}

/// What a successful transform changed on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub metrics: FinishMetrics,
    /// Pristine copy taken before the source was replaced
    pub backup: Option<PathBuf>,
    /// New source location when the transform converted the file
    pub source_path: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
}

/// Reports from workers to the coordinator.
#[derive(Debug)]
pub enum WorkerEvent {
    Progress { id: String, run: u64, progress: Progress },
    ProcessStarted { id: String, run: u64, pid: u32 },
    ProcessExited { id: String, run: u64, pid: u32 },
    Finished { id: String, run: u64, result: Result<TransformOutcome, EngineError> },
    Restored { id: String, run: u64, result: Result<u64, EngineError> },
}

impl WorkerEvent {
    pub fn id(&self) -> &str {
        match self {
            WorkerEvent::Progress { id, .. }
            | WorkerEvent::ProcessStarted { id, .. }
            | WorkerEvent::ProcessExited { id, .. }
            | WorkerEvent::Finished { id, .. }
            | WorkerEvent::Restored { id, .. } => id,
        }
    }

    pub fn run(&self) -> u64 {
        match self {
            WorkerEvent::Progress { run, .. }
            | WorkerEvent::ProcessStarted { run, .. }
            | WorkerEvent::ProcessExited { run, .. }
            | WorkerEvent::Finished { run, .. }
            | WorkerEvent::Restored { run, .. } => *run,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Root of scratch space and remote results
    pub work_dir: PathBuf,
    pub adaptive_images: bool,
    pub min_saving_ratio: f32,
}

struct Inner {
    runner: ToolRunner,
    queues: ExecutionQueues,
    backups: BackupStore,
    tools: ToolsConfig,
    settings: ExecutorSettings,
    http: reqwest::Client,
}

/// Shared handle to the worker side of the engine.
#[derive(Clone)]
pub struct TransformExecutor {
    inner: Arc<Inner>,
}

/// Sends worker events for one run.
#[derive(Clone)]
struct Reporter {
    id: String,
    run: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Reporter {
    fn send(&self, event: WorkerEvent) {
        // The coordinator may already be gone during shutdown
        let _ = self.events.send(event);
    }

    fn progress(&self, progress: Progress) {
        self.send(WorkerEvent::Progress {
            id: self.id.clone(),
            run: self.run,
            progress,
        });
    }

    /// Progress at an absolute position of the whole plan.
    fn at(&self, completed: u64, total: u64, description: &str) {
        let mut progress = Progress::determinate(total, description);
        progress.advance_to(completed);
        self.progress(progress);
    }

    fn observer(&self) -> ProcessObserver {
        let reporter = self.clone();
        Arc::new(move |event| {
            let (id, run) = (reporter.id.clone(), reporter.run);
            reporter.send(match event {
                ProcessEvent::Started { pid } => WorkerEvent::ProcessStarted { id, run, pid },
                ProcessEvent::Exited { pid } => WorkerEvent::ProcessExited { id, run, pid },
            });
        })
    }

    /// Sink mapping one step's own progress into its slice of the plan.
    fn step_sink(&self, base: u64, total: u64) -> ProgressSink {
        let reporter = self.clone();
        Arc::new(move |update: Progress| match update.fraction() {
            Some(fraction) => {
                let within = (fraction.clamp(0.0, 1.0) * STEP_UNITS as f64) as u64;
                reporter.at(base + within, total, &update.description);
            }
            None => reporter.progress(Progress::indeterminate(update.description)),
        })
    }
}

/// Per-run scratch directory, removed when dropped.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(work_dir: &Path, id: &str) -> Result<Self, EngineError> {
        let path = work_dir
            .join("scratch")
            .join(bucket_name(id.as_bytes()))
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&path).map_err(|e| {
            EngineError::BackupOrRestoreFailed(format!(
                "cannot create scratch directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self { path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "scratch cleanup failed");
            }
        }
    }
}

/// Where an accepted result ends up.
#[derive(Debug, Clone, PartialEq)]
enum Placement {
    /// Replace the source
    InPlace,
    /// Replace the source with a file of another format next to it
    Converted(PathBuf),
    /// Write to a rendered output path and leave the source alone
    Template(PathBuf),
}

fn placement(source: &Path, extension: Option<&str>, template: Option<&str>) -> Placement {
    let source_ext = source.extension().and_then(|e| e.to_str());
    if let Some(template) = template {
        let ext = extension.or(source_ext).unwrap_or_default();
        let dest = render_output_path(template, source, ext);
        return if dest == source {
            Placement::InPlace
        } else {
            Placement::Template(dest)
        };
    }
    match extension {
        Some(ext) if !source_ext.is_some_and(|s| s.eq_ignore_ascii_case(ext)) => {
            Placement::Converted(source.with_extension(ext))
        }
        _ => Placement::InPlace,
    }
}

/// Expand an output template for `source`.
///
/// Placeholders: `{dir}` (source directory), `{stem}` (file name without
/// extension), `{ext}` (result extension) and `{name}` (`{stem}.{ext}`).
/// Relative results resolve against the source directory.
pub fn render_output_path(template: &str, source: &Path, extension: &str) -> PathBuf {
    let dir = source.parent().unwrap_or_else(|| Path::new(""));
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = if extension.is_empty() {
        stem.clone()
    } else {
        format!("{}.{}", stem, extension)
    };
    let rendered = template
        .replace("{dir}", &dir.to_string_lossy())
        .replace("{stem}", &stem)
        .replace("{ext}", extension)
        .replace("{name}", &name);
    let rendered = PathBuf::from(rendered);
    if rendered.is_absolute() {
        rendered
    } else {
        dir.join(rendered)
    }
}

fn place(
    backups: &BackupStore,
    placement: &Placement,
    source: &Path,
    result: &Path,
    existing: Option<&Path>,
) -> Result<(Option<PathBuf>, PathBuf), EngineError> {
    match placement {
        Placement::InPlace => {
            let backup = backups.backup(source, existing)?;
            atomic_replace(source, result)?;
            Ok((Some(backup), source.to_path_buf()))
        }
        Placement::Converted(dest) => {
            if dest.exists() {
                return Err(EngineError::BackupOrRestoreFailed(format!(
                    "{} already exists",
                    dest.display()
                )));
            }
            let backup = backups.backup(source, existing)?;
            atomic_replace(dest, result)?;
            fs::remove_file(source).map_err(|e| {
                EngineError::BackupOrRestoreFailed(format!(
                    "cannot remove converted source {}: {}",
                    source.display(),
                    e
                ))
            })?;
            Ok((Some(backup), dest.clone()))
        }
        Placement::Template(dest) => {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    EngineError::BackupOrRestoreFailed(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            atomic_replace(dest, result)?;
            Ok((None, dest.clone()))
        }
    }
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

fn join_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::BackupOrRestoreFailed(format!("file task failed: {}", e))
}

impl TransformExecutor {
    pub fn new(
        runner: ToolRunner,
        queues: ExecutionQueues,
        backups: BackupStore,
        tools: ToolsConfig,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                queues,
                backups,
                tools,
                settings,
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Run `spec` in the background; the outcome arrives as [`WorkerEvent::Finished`].
    pub fn spawn(
        &self,
        spec: JobSpec,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let (id, run) = (spec.id.clone(), spec.run);
            let result = executor.execute(&spec, &cancel, &events).await;
            let _ = events.send(WorkerEvent::Finished { id, run, result });
        })
    }

    /// Restore in the background; the outcome arrives as [`WorkerEvent::Restored`].
    pub fn spawn_restore(
        &self,
        id: String,
        run: u64,
        original: PathBuf,
        backup: PathBuf,
        converted: Option<PathBuf>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.restore(original, backup, converted).await;
            let _ = events.send(WorkerEvent::Restored { id, run, result });
        })
    }

    /// Put the backed-up original back. A converted result is removed.
    pub async fn restore(
        &self,
        original: PathBuf,
        backup: PathBuf,
        converted: Option<PathBuf>,
    ) -> Result<u64, EngineError> {
        let backups = self.inner.backups.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, EngineError> {
            let bytes = backups.restore(&original, &backup)?;
            if let Some(converted) = converted.filter(|c| *c != original) {
                match fs::remove_file(&converted) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(EngineError::BackupOrRestoreFailed(format!(
                            "cannot remove {}: {}",
                            converted.display(),
                            e
                        )))
                    }
                }
                backups.clear_marker(&converted).ok();
            }
            info!(path = %original.display(), bytes, "original restored");
            Ok(bytes)
        })
        .await
        .map_err(join_error)?
    }

    /// Run one transform to completion, waiting for a queue slot first.
    pub async fn execute(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<TransformOutcome, EngineError> {
        let kind = spec
            .asset_type
            .queue()
            .ok_or_else(|| EngineError::UnsupportedType(spec.asset_type.to_string()))?;
        let queue = self.inner.queues.get(kind);

        let _permit = tokio::select! {
            permit = queue.acquire() => permit.map_err(|_| EngineError::Closed)?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let reporter = Reporter {
            id: spec.id.clone(),
            run: spec.run,
            events: events.clone(),
        };
        let started = Instant::now();
        info!(id = %spec.id, operation = spec.operation.name(), queue = %kind, "transform started");

        let scratch = ScratchDir::create(&self.inner.settings.work_dir, &spec.id)?;
        let result = match (&spec.asset_type, &spec.source) {
            (AssetType::RemoteUrl(url), _) => {
                self.execute_remote(spec, url, &scratch.path, cancel, &reporter).await
            }
            (_, Some(source)) => self.execute_local(spec, source, &scratch.path, cancel, &reporter).await,
            (_, None) => Err(EngineError::SourceNotFound(spec.id.clone())),
        };

        match &result {
            Ok(outcome) => info!(
                id = %spec.id,
                old_bytes = outcome.metrics.old_bytes,
                new_bytes = outcome.metrics.new_bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "transform finished"
            ),
            Err(e) if e.is_notice() => info!(id = %spec.id, notice = %e, "transform settled"),
            Err(e) => warn!(id = %spec.id, error = %e, "transform failed"),
        }
        result
    }

    async fn execute_local(
        &self,
        spec: &JobSpec,
        source: &Path,
        scratch: &Path,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<TransformOutcome, EngineError> {
        let Some(old_bytes) = file_len(source) else {
            return Err(EngineError::SourceNotFound(source.display().to_string()));
        };
        let backups = &self.inner.backups;

        if matches!(spec.operation, Operation::Optimise) && backups.is_optimised(source) {
            debug!(path = %source.display(), "marker says already optimised");
            return Err(EngineError::AlreadyOptimised { bytes: old_bytes });
        }

        let previous = backups.marker(source);
        if let Err(e) = backups.set_marker(source, OptimisationMarker::Pending) {
            warn!(path = %source.display(), error = %e, "could not set pending marker");
        }
        let result = self
            .transform_local(spec, source, old_bytes, scratch, cancel, reporter)
            .await;
        self.release_pending(source, previous);
        result
    }

    /// Put back the marker a source had if it was not replaced.
    fn release_pending(&self, source: &Path, previous: Option<OptimisationMarker>) {
        let backups = &self.inner.backups;
        if !source.exists() || backups.marker(source) != Some(OptimisationMarker::Pending) {
            return;
        }
        let restored = match previous {
            Some(marker) if marker != OptimisationMarker::Pending => backups.set_marker(source, marker),
            _ => backups.clear_marker(source),
        };
        if let Err(e) = restored {
            warn!(path = %source.display(), error = %e, "could not release pending marker");
        }
    }

    async fn transform_local(
        &self,
        spec: &JobSpec,
        source: &Path,
        old_bytes: u64,
        scratch: &Path,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<TransformOutcome, EngineError> {
        let tools = &self.inner.tools;
        let settings = &self.inner.settings;
        let old_size = probe::dimensions(&spec.asset_type, source, tools).await;

        let is_image = matches!(spec.asset_type, AssetType::Image(_));
        let adaptive = is_image && settings.adaptive_images && spec.output_template.is_none();
        let has_alpha = if adaptive {
            let path = source.to_path_buf();
            match tokio::task::spawn_blocking(move || probe::has_alpha(&path)).await {
                Ok(Ok(alpha)) => alpha,
                // Unreadable headers rule out lossy conversion
                Ok(Err(_)) | Err(_) => true,
            }
        } else {
            false
        };

        let plan = transform::plan(&TransformRequest {
            asset_type: &spec.asset_type,
            source,
            scratch,
            operation: &spec.operation,
            aggressive: spec.aggressive,
            adaptive,
            has_alpha,
            tools,
        })?;

        // A conversion never overwrites an unrelated file next to the source
        let excluded: Vec<bool> = plan
            .candidates
            .iter()
            .enumerate()
            .map(|(i, candidate)| {
                i > 0
                    && match placement(source, candidate.extension, spec.output_template.as_deref()) {
                        Placement::Converted(dest) => dest.exists(),
                        _ => false,
                    }
            })
            .collect();

        let sizes = self.run_plan(&plan, &excluded, scratch, cancel, reporter).await?;
        let winner = pick_smaller(&sizes, settings.min_saving_ratio).unwrap_or(0);
        let candidate = &plan.candidates[winner];
        let new_bytes = sizes[winner];
        if winner > 0 {
            debug!(id = %spec.id, label = candidate.label, "alternative candidate won");
        }

        if let SizeGateResult::Reject { old_bytes, new_bytes } =
            check_result_size(old_bytes, new_bytes, spec.allow_larger)
        {
            return Err(EngineError::ResultNotSmaller { old_bytes, new_bytes });
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let target = placement(source, candidate.extension, spec.output_template.as_deref());
        let backups = self.inner.backups.clone();
        let (source_owned, output) = (source.to_path_buf(), candidate.output.clone());
        let existing = spec.backup.clone();
        let (backup, result_path) = tokio::task::spawn_blocking(move || {
            place(&backups, &target, &source_owned, &output, existing.as_deref())
        })
        .await
        .map_err(join_error)??;

        if let Err(e) = self
            .inner
            .backups
            .set_marker(&result_path, OptimisationMarker::Optimised)
        {
            warn!(path = %result_path.display(), error = %e, "could not set optimised marker");
        }

        let result_type = AssetType::from_path(&result_path);
        let new_size = probe::dimensions(&result_type, &result_path, tools).await;
        let converted = result_path != source && backup.is_some();
        let thumbnail = self.thumbnail(&spec.id, &result_type, &result_path).await;

        Ok(TransformOutcome {
            metrics: FinishMetrics {
                old_bytes,
                new_bytes: file_len(&result_path).unwrap_or(new_bytes),
                old_size,
                new_size,
                result_path: Some(result_path.clone()),
            },
            backup,
            source_path: converted.then_some(result_path),
            thumbnail,
        })
    }

    async fn execute_remote(
        &self,
        spec: &JobSpec,
        url: &str,
        scratch: &Path,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<TransformOutcome, EngineError> {
        reporter.progress(Progress::indeterminate("Downloading"));
        let download_dir = scratch.join("download");
        let downloaded = tokio::select! {
            result = fetch::download(&self.inner.http, url, &download_dir) => {
                result.map_err(|e| EngineError::SourceNotFound(format!("{}: {}", url, e)))?
            }
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let asset_type = downloaded.asset_type.clone();
        if asset_type == AssetType::Unknown {
            return Err(EngineError::UnsupportedType(spec.asset_type.to_string()));
        }
        let tools = &self.inner.tools;
        let old_size = probe::dimensions(&asset_type, &downloaded.path, tools).await;

        let plan = transform::plan(&TransformRequest {
            asset_type: &asset_type,
            source: &downloaded.path,
            scratch,
            operation: &spec.operation,
            aggressive: spec.aggressive,
            adaptive: false,
            has_alpha: true,
            tools,
        })?;
        let excluded = vec![false; plan.candidates.len()];
        let sizes = self.run_plan(&plan, &excluded, scratch, cancel, reporter).await?;
        let candidate = &plan.candidates[0];
        let new_bytes = sizes[0];

        if let SizeGateResult::Reject { old_bytes, new_bytes } =
            check_result_size(downloaded.bytes, new_bytes, spec.allow_larger)
        {
            return Err(EngineError::ResultNotSmaller { old_bytes, new_bytes });
        }

        let name = downloaded
            .path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("download"));
        let dest = self
            .inner
            .settings
            .work_dir
            .join("remote")
            .join(bucket_name(url.as_bytes()))
            .join(name);
        let output = candidate.output.clone();
        let dest_owned = dest.clone();
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            if let Some(parent) = dest_owned.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    EngineError::BackupOrRestoreFailed(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            atomic_replace(&dest_owned, &output)?;
            Ok(())
        })
        .await
        .map_err(join_error)??;

        if let Err(e) = self
            .inner
            .backups
            .set_marker(&dest, OptimisationMarker::Optimised)
        {
            warn!(path = %dest.display(), error = %e, "could not set optimised marker");
        }
        let new_size = probe::dimensions(&asset_type, &dest, tools).await;
        let thumbnail = self.thumbnail(&spec.id, &asset_type, &dest).await;

        Ok(TransformOutcome {
            metrics: FinishMetrics {
                old_bytes: downloaded.bytes,
                new_bytes,
                old_size,
                new_size,
                result_path: Some(dest),
            },
            backup: None,
            source_path: None,
            thumbnail,
        })
    }

    /// Best-effort thumbnail for image results, kept under the work dir.
    async fn thumbnail(&self, id: &str, asset_type: &AssetType, result: &Path) -> Option<PathBuf> {
        if !matches!(asset_type, AssetType::Image(_)) {
            return None;
        }
        let dest = self
            .inner
            .settings
            .work_dir
            .join("thumbnails")
            .join(format!("{}.png", bucket_name(id.as_bytes())));
        let (source, target) = (result.to_path_buf(), dest.clone());
        match tokio::task::spawn_blocking(move || probe::write_thumbnail(&source, &target)).await {
            Ok(Ok(())) => Some(dest),
            Ok(Err(e)) => {
                debug!(id = %id, error = %e, "no thumbnail");
                None
            }
            Err(e) => {
                debug!(id = %id, error = %e, "thumbnail task failed");
                None
            }
        }
    }

    /// Run every candidate chain and return their output sizes.
    ///
    /// Alternatives that fail or are excluded get `u64::MAX` so they never win.
    /// A failure of the preferred candidate fails the transform.
    async fn run_plan(
        &self,
        plan: &TransformPlan,
        excluded: &[bool],
        scratch: &Path,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<Vec<u64>, EngineError> {
        let total = plan.total_steps().max(1) as u64 * STEP_UNITS;
        let mut base = 0;
        let mut sizes = Vec::with_capacity(plan.candidates.len());

        for (index, candidate) in plan.candidates.iter().enumerate() {
            let steps = candidate.steps.len() as u64 * STEP_UNITS;
            if excluded.get(index).copied().unwrap_or(false) {
                sizes.push(u64::MAX);
                base += steps;
                continue;
            }
            match self
                .run_candidate(candidate, base, total, scratch, cancel, reporter)
                .await
            {
                Ok(bytes) => sizes.push(bytes),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) if index == 0 => return Err(e),
                Err(e) => {
                    warn!(label = candidate.label, error = %e, "alternative candidate failed");
                    sizes.push(u64::MAX);
                }
            }
            base += steps;
            let description = candidate.steps.last().map(|s| s.description.as_str()).unwrap_or_default();
            reporter.at(base, total, description);
        }
        Ok(sizes)
    }

    async fn run_candidate(
        &self,
        candidate: &Candidate,
        base: u64,
        total: u64,
        scratch: &Path,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<u64, EngineError> {
        for (index, step) in candidate.steps.iter().enumerate() {
            let step_base = base + index as u64 * STEP_UNITS;
            self.run_step(step, step_base, total, scratch, cancel, reporter)
                .await?;
        }
        file_len(&candidate.output).ok_or_else(|| EngineError::ToolExitedNonZero {
            command: candidate.label.to_string(),
            code: None,
            summary: "produced no output".to_string(),
        })
    }

    async fn run_step(
        &self,
        step: &Step,
        base: u64,
        total: u64,
        scratch: &Path,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<(), EngineError> {
        if let Some(parent) = step.output.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::ToolExitedNonZero {
                command: step.command.name(),
                code: None,
                summary: format!("cannot prepare {}: {}", parent.display(), e),
            })?;
        }
        reporter.at(base, total, &step.description);

        let mut ctx = RunContext::new(scratch.join("logs"), cancel.clone()).with_observer(reporter.observer());
        if let Some(grammar) = &step.grammar {
            ctx = ctx.with_progress(ProgressHook {
                grammar: grammar.clone(),
                description: step.description.clone(),
                sink: reporter.step_sink(base, total),
            });
        }

        debug!(command = %step.command.display(), "running step");
        let output = self.inner.runner.run(&step.command, &ctx).await?;
        debug!(command = %step.command.name(), attempts = output.attempts, "step succeeded");

        if !step.output.exists() {
            return Err(EngineError::ToolExitedNonZero {
                command: step.command.name(),
                code: Some(0),
                summary: "produced no output".to_string(),
            });
        }
        reporter.at(base + STEP_UNITS, total, &step.description);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{QueueKind, QueuePlan};
    use crate::marker::{MarkerStore, MemoryMarkers};
    use crate::runner::CancellationRegistry;
    use media_optimiser_config::QueueConfig;
    use tempfile::TempDir;

    fn new_executor(dir: &TempDir, tools: ToolsConfig) -> (TransformExecutor, Arc<MemoryMarkers>) {
        let markers = Arc::new(MemoryMarkers::new());
        let plan = QueuePlan::derive(&QueueConfig {
            logical_cores: Some(4),
            media_engines: Some(1),
            ..Default::default()
        });
        let executor = TransformExecutor::new(
            ToolRunner::new(CancellationRegistry::new(), 1),
            ExecutionQueues::new(&plan),
            BackupStore::new(dir.path().join("backups"), markers.clone()),
            tools,
            ExecutorSettings {
                work_dir: dir.path().join("work"),
                adaptive_images: false,
                min_saving_ratio: 0.05,
            },
        );
        (executor, markers)
    }

    fn spec(source: &Path) -> JobSpec {
        JobSpec {
            id: source.display().to_string(),
            run: 1,
            asset_type: AssetType::from_path(source),
            source: Some(source.to_path_buf()),
            operation: Operation::Optimise,
            aggressive: false,
            allow_larger: false,
            output_template: None,
            backup: None,
        }
    }

    #[test]
    fn test_render_output_path() {
        let source = Path::new("/photos/shot.png");
        assert_eq!(
            render_output_path("{dir}/out/{name}", source, "png"),
            PathBuf::from("/photos/out/shot.png")
        );
        assert_eq!(
            render_output_path("{stem}-small.{ext}", source, "jpg"),
            PathBuf::from("/photos/shot-small.jpg")
        );
        assert_eq!(
            render_output_path("/tmp/{name}", source, ""),
            PathBuf::from("/tmp/shot")
        );
    }

    #[test]
    fn test_placement_rules() {
        let source = Path::new("/p/a.png");
        assert_eq!(placement(source, None, None), Placement::InPlace);
        assert_eq!(placement(source, Some("png"), None), Placement::InPlace);
        assert_eq!(
            placement(source, Some("jpg"), None),
            Placement::Converted(PathBuf::from("/p/a.jpg"))
        );
        assert_eq!(
            placement(source, None, Some("{stem}.min.{ext}")),
            Placement::Template(PathBuf::from("/p/a.min.png"))
        );
        assert_eq!(placement(source, None, Some("{name}")), Placement::InPlace);
    }

    #[test]
    fn test_place_converted_backs_up_and_removes_source() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("b"), Arc::new(MemoryMarkers::new()));
        let source = dir.path().join("a.png");
        let result = dir.path().join("result.jpg");
        fs::write(&source, b"png bytes").unwrap();
        fs::write(&result, b"jpg").unwrap();

        let dest = dir.path().join("a.jpg");
        let (backup, placed) = place(&store, &Placement::Converted(dest.clone()), &source, &result, None).unwrap();
        assert_eq!(placed, dest);
        assert!(!source.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"jpg");
        assert_eq!(fs::read(backup.unwrap()).unwrap(), b"png bytes");
    }

    #[test]
    fn test_place_in_place_keeps_asset_backup() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("b"), Arc::new(MemoryMarkers::new()));
        let source = dir.path().join("a.png");
        let result = dir.path().join("result.png");
        fs::write(&source, b"already transformed").unwrap();
        fs::write(&result, b"smaller").unwrap();
        let earlier = dir.path().join("b").join("earlier.png");
        fs::create_dir_all(earlier.parent().unwrap()).unwrap();
        fs::write(&earlier, b"true original").unwrap();

        let (backup, placed) =
            place(&store, &Placement::InPlace, &source, &result, Some(earlier.as_path())).unwrap();
        assert_eq!(placed, source);
        assert_eq!(backup.as_deref(), Some(earlier.as_path()));
        assert_eq!(fs::read(&earlier).unwrap(), b"true original");
        assert!(!store.backup_path(&source).exists());

        let (fresh, _) = place(&store, &Placement::InPlace, &source, &result, None).unwrap();
        assert_eq!(fs::read(fresh.unwrap()).unwrap(), b"smaller");
    }

    #[test]
    fn test_place_converted_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("b"), Arc::new(MemoryMarkers::new()));
        let source = dir.path().join("a.png");
        let dest = dir.path().join("a.jpg");
        fs::write(&source, b"png").unwrap();
        fs::write(&dest, b"someone else's").unwrap();

        let err = place(&store, &Placement::Converted(dest.clone()), &source, &source, None).unwrap_err();
        assert!(matches!(err, EngineError::BackupOrRestoreFailed(_)));
        assert!(source.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"someone else's");
    }

    #[tokio::test]
    async fn test_missing_source_is_reported() {
        let dir = TempDir::new().unwrap();
        let (executor, _) = new_executor(&dir, ToolsConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor
            .execute(&spec(&dir.path().join("gone.png")), &CancellationToken::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_marked_file_short_circuits() {
        let dir = TempDir::new().unwrap();
        let (executor, markers) = new_executor(&dir, ToolsConfig::default());
        let source = dir.path().join("done.png");
        fs::write(&source, vec![0u8; 42]).unwrap();
        markers.set(&source, OptimisationMarker::Optimised).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor
            .execute(&spec(&source), &CancellationToken::new(), &tx)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::AlreadyOptimised { bytes: 42 });
    }

    #[tokio::test]
    async fn test_unknown_type_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let (executor, _) = new_executor(&dir, ToolsConfig::default());
        let source = dir.path().join("notes.txt");
        fs::write(&source, b"text").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor
            .execute(&spec(&source), &CancellationToken::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let dir = TempDir::new().unwrap();
        let (executor, _) = new_executor(&dir, ToolsConfig::default());
        let source = dir.path().join("a.png");
        fs::write(&source, b"png").unwrap();

        // Occupy every image slot
        let queue = executor.inner.queues.get(QueueKind::Image);
        let mut permits = Vec::new();
        while let Some(permit) = queue.try_acquire() {
            permits.push(permit);
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor.execute(&spec(&source), &cancel, &tx).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert!(!dir.path().join("work").join("scratch").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_failure_clears_pending_marker() {
        let dir = TempDir::new().unwrap();
        let tools = ToolsConfig {
            oxipng: dir.path().join("no-such-oxipng").display().to_string(),
            ..Default::default()
        };
        let (executor, markers) = new_executor(&dir, tools);
        let source = dir.path().join("a.png");
        fs::write(&source, b"png").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor
            .execute(&spec(&source), &CancellationToken::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolLaunchFailed { .. }));
        assert_eq!(markers.get(&source).unwrap(), None);
        assert_eq!(fs::read(&source).unwrap(), b"png");
    }
}
