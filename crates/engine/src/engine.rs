//! Engine handle and the coordinator task.
//!
//! One coordinator task owns the [`OptimisationRegistry`] and is the only code
//! that mutates assets. Callers talk to it through [`Engine`] (commands over a
//! channel), workers report through [`WorkerEvent`]s and debounce timers fire
//! back into it. Observers get immutable snapshots: a broadcast stream of
//! [`EngineEvent`]s plus a per-asset watch channel behind [`AssetHandle`].

use crate::asset::{AssetOptimiser, AssetType, Interaction};
use crate::backup::BackupStore;
use crate::concurrency::{ExecutionQueues, QueuePlan};
use crate::debounce::{compare_sizes, Scheduler, StabilityResult};
use crate::error::EngineError;
use crate::executor::{ExecutorSettings, JobSpec, TransformExecutor, TransformOutcome, WorkerEvent};
use crate::marker::{MarkerStore, XattrMarkers};
use crate::registry::OptimisationRegistry;
use crate::runner::{CancellationRegistry, ToolRunner};
use crate::snapshot::{AssetSnapshot, EngineEvent, RegistrySnapshot};
use crate::transform::{CropSize, Operation, Scale};
use media_optimiser_config::Config;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// What caused a request; decides the debounce window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    User,
    /// A file-system event; the file must stop growing before work starts
    Watcher,
}

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub aggressive: bool,
    pub allow_larger: bool,
    /// Overrides the configured removal delays; `Some(0)` keeps the asset
    pub remove_after_ms: Option<u64>,
    /// Background job excluded from visible counts
    pub hidden: bool,
    pub trigger: Trigger,
    /// Write the result to this template instead of replacing the source
    pub output_template: Option<String>,
}

/// Waits on one asset's published state.
#[derive(Debug, Clone)]
pub struct AssetHandle {
    id: String,
    rx: watch::Receiver<AssetSnapshot>,
}

impl AssetHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest published snapshot.
    pub fn current(&self) -> AssetSnapshot {
        self.rx.borrow().clone()
    }

    /// Park until the asset is neither running nor waiting to run.
    ///
    /// Returns the last snapshot if the asset is removed in the meantime.
    pub async fn wait(&mut self) -> AssetSnapshot {
        loop {
            {
                let snapshot = self.rx.borrow_and_update();
                if !snapshot.running && !snapshot.pending {
                    return snapshot.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

enum Command {
    Request {
        id: String,
        /// Type and source for assets that may not exist yet
        target: Option<(AssetType, Option<PathBuf>)>,
        operation: Operation,
        options: RequestOptions,
        reply: oneshot::Sender<Result<AssetHandle, EngineError>>,
    },
    Stop {
        id: String,
        remove: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Restore {
        id: String,
        reply: oneshot::Sender<Result<AssetHandle, EngineError>>,
    },
    BringBack {
        id: String,
        reply: oneshot::Sender<Result<AssetSnapshot, EngineError>>,
    },
    ClearFinished {
        stop_running: bool,
        reply: oneshot::Sender<Vec<String>>,
    },
    SetInteraction {
        id: String,
        interaction: Interaction,
        active: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Watch {
        id: String,
        reply: oneshot::Sender<Result<AssetHandle, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Dispatch(String),
    Removal(String),
}

#[derive(Debug)]
enum Timer {
    Dispatch { id: String, token: u64 },
    Removal { id: String, token: u64 },
}

#[derive(Debug, Clone)]
struct PendingRequest {
    operation: Operation,
    options: RequestOptions,
    /// File size when a watcher request was scheduled
    settle_size: Option<u64>,
}

/// Coordinator-side bookkeeping for one asset.
#[derive(Debug, Default)]
struct Slot {
    /// Cancels the in-flight run
    cancel: Option<CancellationToken>,
    /// Waiting in the debounce window
    scheduled: Option<PendingRequest>,
    /// Waiting behind the in-flight run
    queued: Option<PendingRequest>,
    dispatch_token: u64,
    remove_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    user_delay: Duration,
    watcher_delay: Duration,
    finished_after: Duration,
    failed_after: Duration,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<EngineEvent>,
    plan: QueuePlan,
    defaults: RequestOptions,
    shutdown: CancellationToken,
}

impl Engine {
    /// Start an engine that keeps markers in extended attributes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &Config) -> Self {
        Self::with_marker_store(config, Arc::new(XattrMarkers))
    }

    pub fn with_marker_store(config: &Config, markers: Arc<dyn MarkerStore>) -> Self {
        let plan = QueuePlan::derive(&config.queues);
        let work_dir = config.storage.work_dir();
        let timeout = (config.runner.timeout_secs > 0).then(|| Duration::from_secs(config.runner.timeout_secs));
        let runner = ToolRunner::new(CancellationRegistry::new(), config.runner.max_attempts)
            .with_timeout(timeout, config.runner.retry_on_timeout);
        let executor = TransformExecutor::new(
            runner,
            ExecutionQueues::new(&plan),
            BackupStore::new(work_dir.join("backups"), markers),
            config.tools.clone(),
            ExecutorSettings {
                work_dir: work_dir.clone(),
                adaptive_images: config.optimisation.adaptive_images,
                min_saving_ratio: config.optimisation.min_saving_ratio,
            },
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (timers, timer_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator::new(config, executor, timers, worker_tx, events.clone(), shutdown.clone());

        info!(
            image_workers = plan.image_workers,
            video_workers = plan.video_workers,
            pdf_workers = plan.pdf_workers,
            work_dir = %work_dir.display(),
            "engine started"
        );
        tokio::spawn(coordinator.run(command_rx, timer_rx, worker_rx));

        Self {
            commands,
            events,
            plan,
            defaults: RequestOptions {
                aggressive: config.optimisation.aggressive,
                allow_larger: config.optimisation.allow_larger,
                ..Default::default()
            },
            shutdown,
        }
    }

    pub fn plan(&self) -> &QueuePlan {
        &self.plan
    }

    /// Options carrying the configured defaults.
    pub fn default_options(&self) -> RequestOptions {
        self.defaults.clone()
    }

    /// Change notifications for every asset plus aggregate counts.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Request `operation` on `id`, creating the asset if it is new.
    pub async fn request(
        &self,
        id: impl Into<String>,
        asset_type: AssetType,
        source: Option<PathBuf>,
        operation: Operation,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        let id = id.into();
        self.call(|reply| Command::Request {
            id,
            target: Some((asset_type, source)),
            operation,
            options,
            reply,
        })
        .await?
    }

    pub async fn request_optimise(
        &self,
        id: impl Into<String>,
        asset_type: AssetType,
        source: Option<PathBuf>,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        self.request(id, asset_type, source, Operation::Optimise, options)
            .await
    }

    /// Optimise a local file, using its path as the id.
    pub async fn optimise_path(&self, path: &Path, options: RequestOptions) -> Result<AssetHandle, EngineError> {
        self.request_optimise(
            path.display().to_string(),
            AssetType::from_path(path),
            Some(path.to_path_buf()),
            options,
        )
        .await
    }

    /// Optimise the content behind a URL, using the URL as the id.
    pub async fn optimise_url(&self, url: &str, options: RequestOptions) -> Result<AssetHandle, EngineError> {
        self.request_optimise(url, AssetType::RemoteUrl(url.to_string()), None, options)
            .await
    }

    async fn request_existing(
        &self,
        id: impl Into<String>,
        operation: Operation,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        let id = id.into();
        self.call(|reply| Command::Request {
            id,
            target: None,
            operation,
            options,
            reply,
        })
        .await?
    }

    pub async fn request_downscale(
        &self,
        id: impl Into<String>,
        scale: Scale,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        self.request_existing(id, Operation::Downscale(scale), options)
            .await
    }

    pub async fn request_crop(
        &self,
        id: impl Into<String>,
        size: CropSize,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        self.request_existing(id, Operation::Crop(size), options)
            .await
    }

    pub async fn request_speed(
        &self,
        id: impl Into<String>,
        factor: f64,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        self.request_existing(id, Operation::ChangeSpeed(factor), options)
            .await
    }

    pub async fn request_remove_audio(
        &self,
        id: impl Into<String>,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        self.request_existing(id, Operation::RemoveAudio, options)
            .await
    }

    /// Cancel pending work and terminate running tools; optionally remove the asset.
    pub async fn request_stop(&self, id: impl Into<String>, remove: bool) -> Result<(), EngineError> {
        let id = id.into();
        self.call(|reply| Command::Stop { id, remove, reply }).await?
    }

    /// Put the pristine original back on disk.
    pub async fn request_restore(&self, id: impl Into<String>) -> Result<AssetHandle, EngineError> {
        let id = id.into();
        self.call(|reply| Command::Restore { id, reply }).await?
    }

    /// Dismiss an asset, stopping it first if needed.
    pub async fn remove(&self, id: impl Into<String>) -> Result<(), EngineError> {
        self.request_stop(id, true).await
    }

    /// Return the most recently removed asset with `id` to the registry.
    pub async fn bring_back(&self, id: impl Into<String>) -> Result<AssetSnapshot, EngineError> {
        let id = id.into();
        self.call(|reply| Command::BringBack { id, reply }).await?
    }

    /// Remove every asset that is not running. With `stop_running`, running
    /// assets are stopped first and removed too. Returns the removed ids.
    pub async fn clear_finished(&self, stop_running: bool) -> Result<Vec<String>, EngineError> {
        self.call(|reply| Command::ClearFinished { stop_running, reply })
            .await
    }

    pub async fn set_interaction(
        &self,
        id: impl Into<String>,
        interaction: Interaction,
        active: bool,
    ) -> Result<(), EngineError> {
        let id = id.into();
        self.call(|reply| Command::SetInteraction {
            id,
            interaction,
            active,
            reply,
        })
        .await?
    }

    /// Handle for an existing asset.
    pub async fn watch(&self, id: impl Into<String>) -> Result<AssetHandle, EngineError> {
        let id = id.into();
        self.call(|reply| Command::Watch { id, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot, EngineError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the coordinator. Running tools are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn validate(asset_type: &AssetType, operation: &Operation) -> Result<(), EngineError> {
    if *asset_type == AssetType::Unknown {
        return Err(EngineError::UnsupportedType(asset_type.to_string()));
    }
    if !asset_type.supports(operation) || !operation.is_valid() {
        return Err(EngineError::InvalidOperation {
            operation: operation.name().to_string(),
            target: asset_type.to_string(),
        });
    }
    Ok(())
}

fn file_len(path: Option<&Path>) -> Option<u64> {
    fs::metadata(path?).ok().map(|m| m.len())
}

/// Keep track of what a transform did on disk: the backup it took and where
/// the file lives after a format conversion.
fn record_placement(asset: &mut AssetOptimiser, backup: Option<PathBuf>, source_path: Option<PathBuf>) {
    asset.record_backup(backup);
    if let Some(source) = source_path {
        asset.set_source_path(source);
    }
}

struct Coordinator {
    registry: OptimisationRegistry,
    slots: HashMap<String, Slot>,
    watchers: HashMap<String, watch::Sender<AssetSnapshot>>,
    scheduler: Scheduler<TimerKey>,
    timers: mpsc::UnboundedSender<Timer>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: broadcast::Sender<EngineEvent>,
    executor: TransformExecutor,
    timing: Timing,
    shutdown: CancellationToken,
}

impl Coordinator {
    fn new(
        config: &Config,
        executor: TransformExecutor,
        timers: mpsc::UnboundedSender<Timer>,
        worker_tx: mpsc::UnboundedSender<WorkerEvent>,
        events: broadcast::Sender<EngineEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: OptimisationRegistry::new(config.removal.history_limit),
            slots: HashMap::new(),
            watchers: HashMap::new(),
            scheduler: Scheduler::new(),
            timers,
            worker_tx,
            events,
            executor,
            timing: Timing {
                user_delay: Duration::from_millis(config.debounce.user_delay_ms),
                watcher_delay: Duration::from_millis(config.debounce.watcher_delay_ms),
                finished_after: Duration::from_millis(config.removal.finished_after_ms),
                failed_after: Duration::from_millis(config.removal.failed_after_ms),
            },
            shutdown,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut timers: mpsc::UnboundedReceiver<Timer>,
        mut workers: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(timer) = timers.recv() => self.handle_timer(timer),
                Some(event) = workers.recv() => self.handle_worker(event),
            }
        }

        for id in self.registry.running_ids() {
            let _ = self.stop(&id, false);
        }
        info!("engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        // A caller that gave up waiting is not an error
        match command {
            Command::Request {
                id,
                target,
                operation,
                options,
                reply,
            } => {
                let _ = reply.send(self.request(id, target, operation, options));
            }
            Command::Stop { id, remove, reply } => {
                let _ = reply.send(self.stop(&id, remove));
            }
            Command::Restore { id, reply } => {
                let _ = reply.send(self.restore(&id));
            }
            Command::BringBack { id, reply } => {
                let _ = reply.send(self.bring_back(&id));
            }
            Command::ClearFinished { stop_running, reply } => {
                let _ = reply.send(self.clear_finished(stop_running));
            }
            Command::SetInteraction {
                id,
                interaction,
                active,
                reply,
            } => {
                let _ = reply.send(self.set_interaction(&id, interaction, active));
            }
            Command::Watch { id, reply } => {
                let _ = reply.send(self.handle(&id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    fn request(
        &mut self,
        id: String,
        target: Option<(AssetType, Option<PathBuf>)>,
        operation: Operation,
        options: RequestOptions,
    ) -> Result<AssetHandle, EngineError> {
        if !self.registry.contains(&id) {
            let Some((asset_type, source)) = target else {
                return Err(EngineError::UnknownAsset(id));
            };
            // Rejected requests leave nothing behind in the registry
            validate(&asset_type, &operation)?;
            self.registry.get_or_create(&id, asset_type, source);
            debug!(id = %id, "asset created");
        }
        let asset = self
            .registry
            .get_mut(&id)
            .ok_or_else(|| EngineError::UnknownAsset(id.clone()))?;
        validate(asset.asset_type(), &operation)?;

        if options.hidden {
            asset.set_interaction(Interaction::Hidden, true);
        }
        asset.pending = true;
        asset.disarm_removal();
        let running = asset.running;
        self.scheduler.cancel(&TimerKey::Removal(id.clone()));

        let slot = self.slots.entry(id.clone()).or_default();
        slot.remove_after = options.remove_after_ms.map(Duration::from_millis);
        let request = PendingRequest {
            operation,
            options,
            settle_size: None,
        };
        if running {
            info!(id = %id, operation = request.operation.name(), "queued behind running transform");
            slot.queued = Some(request);
        } else {
            self.schedule_dispatch(&id, request);
        }

        self.publish(&id);
        self.handle(&id)
    }

    /// Schedule (or supersede) the debounced dispatch for `id`.
    fn schedule_dispatch(&mut self, id: &str, mut request: PendingRequest) {
        let delay = match request.options.trigger {
            Trigger::User => self.timing.user_delay,
            Trigger::Watcher => self.timing.watcher_delay,
        };
        if request.options.trigger == Trigger::Watcher && request.settle_size.is_none() {
            let source = self.registry.get(id).and_then(|a| a.source_path.clone());
            request.settle_size = file_len(source.as_deref());
        }

        let slot = self.slots.entry(id.to_string()).or_default();
        slot.dispatch_token += 1;
        let token = slot.dispatch_token;
        slot.scheduled = Some(request);

        if delay.is_zero() {
            self.dispatch(id);
            return;
        }
        let timers = self.timers.clone();
        let timer_id = id.to_string();
        self.scheduler
            .schedule(TimerKey::Dispatch(id.to_string()), delay, async move {
                let _ = timers.send(Timer::Dispatch { id: timer_id, token });
            });
    }

    /// Hand the scheduled request for `id` to the executor.
    fn dispatch(&mut self, id: &str) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let Some(request) = slot.scheduled.take() else {
            return;
        };
        let Some(asset) = self.registry.get_mut(id) else {
            return;
        };

        let run = asset.start(request.operation.clone(), request.options.aggressive);
        let cancel = self.shutdown.child_token();
        slot.cancel = Some(cancel.clone());

        let spec = JobSpec {
            id: id.to_string(),
            run,
            asset_type: asset.asset_type().clone(),
            source: asset.source_path.clone(),
            operation: request.operation,
            aggressive: request.options.aggressive,
            allow_larger: request.options.allow_larger,
            output_template: request.options.output_template,
            backup: asset.backup_path().map(Path::to_path_buf),
        };
        info!(id = %id, run, operation = spec.operation.name(), "transform dispatched");
        self.executor.spawn(spec, cancel, self.worker_tx.clone());
    }

    fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Dispatch { id, token } => {
                let Some(slot) = self.slots.get_mut(&id) else {
                    return;
                };
                if slot.dispatch_token != token {
                    return;
                }
                let source = self.registry.get(&id).and_then(|a| a.source_path.clone());
                if let Some(request) = slot.scheduled.as_mut() {
                    if let (Some(initial), Some(current)) = (request.settle_size, file_len(source.as_deref())) {
                        if let StabilityResult::Unstable { .. } = compare_sizes(initial, current) {
                            debug!(id = %id, initial, current, "file still changing, waiting again");
                            request.settle_size = Some(current);
                            let request = request.clone();
                            self.schedule_dispatch(&id, request);
                            return;
                        }
                    }
                }
                self.dispatch(&id);
                self.publish(&id);
            }
            Timer::Removal { id, token } => {
                let due = self
                    .registry
                    .get(&id)
                    .is_some_and(|a| a.removal_token() == token && a.auto_removal_allowed());
                if due {
                    debug!(id = %id, "auto-removing asset");
                    self.remove_asset(&id);
                }
            }
        }
    }

    fn handle_worker(&mut self, event: WorkerEvent) {
        let id = event.id().to_string();
        let Some(asset) = self.registry.get_mut(&id) else {
            return;
        };
        let run = event.run();
        if asset.run() != run {
            // A stopped run may still have replaced the file before noticing
            if let WorkerEvent::Finished { result: Ok(outcome), .. } = event {
                debug!(id = %id, run, current = asset.run(), "superseded run changed the file");
                record_placement(asset, outcome.backup, outcome.source_path);
                self.publish(&id);
            } else {
                debug!(id = %id, run, current = asset.run(), "dropping report from superseded run");
            }
            return;
        }

        match event {
            WorkerEvent::Progress { progress, .. } => asset.progress.merge(&progress),
            WorkerEvent::ProcessStarted { pid, .. } => {
                asset.processes.insert(pid);
            }
            WorkerEvent::ProcessExited { pid, .. } => {
                asset.processes.remove(&pid);
            }
            WorkerEvent::Finished { result, .. } => self.finish(&id, result),
            WorkerEvent::Restored { result, .. } => self.restored(&id, result),
        }
        self.publish(&id);
    }

    fn removal_delays(&self, id: &str) -> (Duration, Duration) {
        match self.slots.get(id).and_then(|s| s.remove_after) {
            Some(delay) => (delay, delay),
            None => (self.timing.finished_after, self.timing.failed_after),
        }
    }

    fn finish(&mut self, id: &str, result: Result<TransformOutcome, EngineError>) {
        let (finished_after, failed_after) = self.removal_delays(id);
        let slot = self.slots.entry(id.to_string()).or_default();
        slot.cancel = None;
        let queued = slot.queued.take();
        let Some(asset) = self.registry.get_mut(id) else {
            return;
        };

        let delay = match result {
            Ok(outcome) => {
                record_placement(asset, outcome.backup, outcome.source_path);
                if outcome.thumbnail.is_some() {
                    asset.thumbnail_path = outcome.thumbnail;
                }
                asset.finish(outcome.metrics, finished_after)
            }
            Err(e) if e.is_notice() => asset.settle(e.to_string(), e.settled_bytes(), finished_after),
            Err(e) => {
                warn!(id = %id, error = %e, "asset failed");
                asset.fail(e.to_string(), failed_after)
            }
        };

        if let Some(request) = queued {
            asset.pending = true;
            slot.scheduled = Some(request);
            self.dispatch(id);
        } else if let Some(delay) = delay {
            self.arm_removal(id, delay);
        }
    }

    fn restored(&mut self, id: &str, result: Result<u64, EngineError>) {
        let (finished_after, failed_after) = self.removal_delays(id);
        let slot = self.slots.entry(id.to_string()).or_default();
        let queued = slot.queued.take();
        let Some(asset) = self.registry.get_mut(id) else {
            return;
        };
        let delay = match result {
            Ok(bytes) => asset.mark_restored(bytes, finished_after),
            Err(e) => {
                warn!(id = %id, error = %e, "restore failed");
                asset.fail(e.to_string(), failed_after)
            }
        };

        if let Some(request) = queued {
            asset.pending = true;
            slot.scheduled = Some(request);
            self.dispatch(id);
        } else if let Some(delay) = delay {
            self.arm_removal(id, delay);
        }
    }

    fn arm_removal(&mut self, id: &str, delay: Duration) {
        let Some(asset) = self.registry.get_mut(id) else {
            return;
        };
        let token = asset.arm_removal();
        let timers = self.timers.clone();
        let timer_id = id.to_string();
        self.scheduler
            .schedule(TimerKey::Removal(id.to_string()), delay, async move {
                let _ = timers.send(Timer::Removal { id: timer_id, token });
            });
    }

    fn stop(&mut self, id: &str, remove: bool) -> Result<(), EngineError> {
        if !self.registry.contains(id) {
            return Err(EngineError::UnknownAsset(id.to_string()));
        }
        self.scheduler.cancel(&TimerKey::Dispatch(id.to_string()));
        if let Some(slot) = self.slots.get_mut(id) {
            slot.scheduled = None;
            slot.queued = None;
            slot.dispatch_token += 1;
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
        }

        if let Some(asset) = self.registry.get_mut(id) {
            let was_running = asset.running;
            asset.stop();
            if was_running {
                info!(id = %id, "transform stopped");
            }
        }

        if remove {
            self.remove_asset(id);
        } else {
            self.publish(id);
        }
        Ok(())
    }

    fn restore(&mut self, id: &str) -> Result<AssetHandle, EngineError> {
        let busy = self
            .registry
            .get(id)
            .map(|a| a.running || a.pending)
            .ok_or_else(|| EngineError::UnknownAsset(id.to_string()))?;
        if busy {
            self.stop(id, false)?;
        }

        let asset = self
            .registry
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownAsset(id.to_string()))?;
        let backup = asset
            .backup_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| EngineError::BackupOrRestoreFailed(format!("no backup for {}", id)))?;
        let original = asset
            .original_path()
            .or(asset.source_path.as_deref())
            .map(Path::to_path_buf)
            .ok_or_else(|| EngineError::BackupOrRestoreFailed(format!("no original path for {}", id)))?;
        let converted = asset.result_path.clone().filter(|p| *p != original);

        let run = asset.start_restore();
        self.scheduler.cancel(&TimerKey::Removal(id.to_string()));
        info!(id = %id, run, "restoring original");
        self.executor.spawn_restore(
            id.to_string(),
            run,
            original,
            backup,
            converted,
            self.worker_tx.clone(),
        );

        self.publish(id);
        self.handle(id)
    }

    fn remove_asset(&mut self, id: &str) {
        self.scheduler.cancel(&TimerKey::Dispatch(id.to_string()));
        self.scheduler.cancel(&TimerKey::Removal(id.to_string()));
        if let Some(slot) = self.slots.remove(id) {
            if let Some(cancel) = slot.cancel {
                cancel.cancel();
            }
        }

        let Some(snapshot) = self.registry.remove(id).map(|a| a.snapshot()) else {
            return;
        };
        if let Some(watcher) = self.watchers.remove(id) {
            watcher.send_replace(snapshot);
        }
        info!(id = %id, "asset removed");
        let _ = self.events.send(EngineEvent::Removed { id: id.to_string() });
        let _ = self.events.send(EngineEvent::Aggregate(self.registry.counts()));
    }

    fn bring_back(&mut self, id: &str) -> Result<AssetSnapshot, EngineError> {
        let snapshot = self
            .registry
            .bring_back(id)
            .map(|a| a.snapshot())
            .ok_or_else(|| EngineError::UnknownAsset(id.to_string()))?;
        info!(id = %id, "asset brought back");
        self.publish(id);
        let _ = self.events.send(EngineEvent::Aggregate(self.registry.counts()));
        Ok(snapshot)
    }

    fn clear_finished(&mut self, stop_running: bool) -> Vec<String> {
        if stop_running {
            for id in self.registry.running_ids() {
                let _ = self.stop(&id, false);
            }
        }
        let removed = self.registry.clear_finished();
        for id in &removed {
            self.scheduler.cancel(&TimerKey::Removal(id.clone()));
            self.slots.remove(id);
            self.watchers.remove(id);
            let _ = self.events.send(EngineEvent::Removed { id: id.clone() });
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "cleared finished assets");
            let _ = self.events.send(EngineEvent::Aggregate(self.registry.counts()));
        }
        removed
    }

    fn set_interaction(&mut self, id: &str, interaction: Interaction, active: bool) -> Result<(), EngineError> {
        let asset = self
            .registry
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownAsset(id.to_string()))?;
        if active {
            asset.set_interaction(interaction, true);
            asset.disarm_removal();
            self.scheduler.cancel(&TimerKey::Removal(id.to_string()));
        } else if asset.set_interaction(interaction, false) {
            if let Some(delay) = asset.pending_removal() {
                self.arm_removal(id, delay);
            }
        }
        self.publish(id);
        Ok(())
    }

    /// Push the asset's current snapshot to its watchers and all subscribers.
    fn publish(&mut self, id: &str) {
        let Some(asset) = self.registry.get(id) else {
            return;
        };
        let snapshot = asset.snapshot();
        if let Some(watcher) = self.watchers.get(id) {
            watcher.send_replace(snapshot.clone());
        }
        let _ = self.events.send(EngineEvent::Asset(snapshot));
        if self.registry.recount() {
            let _ = self.events.send(EngineEvent::Aggregate(self.registry.counts()));
        }
    }

    fn handle(&mut self, id: &str) -> Result<AssetHandle, EngineError> {
        let asset = self
            .registry
            .get(id)
            .ok_or_else(|| EngineError::UnknownAsset(id.to_string()))?;
        let rx = match self.watchers.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(asset.snapshot());
                entry.insert(tx);
                rx
            }
        };
        Ok(AssetHandle {
            id: id.to_string(),
            rx,
        })
    }
}
