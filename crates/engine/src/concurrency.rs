//! Bounded execution queues.
//!
//! Transforms run on one of three queues, each a counting semaphore sized from
//! the host: images use every core but one, videos are limited by the number
//! of hardware media engines, PDFs use half the cores.

use media_optimiser_config::QueueConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Which queue a transform runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Image,
    Video,
    Pdf,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Image => write!(f, "image"),
            QueueKind::Video => write!(f, "video"),
            QueueKind::Pdf => write!(f, "pdf"),
        }
    }
}

/// Queue capacities derived from configuration and host resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    pub image_workers: u32,
    pub video_workers: u32,
    pub pdf_workers: u32,
}

impl QueuePlan {
    /// Derive queue sizes.
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - image: cores - 1 (at least 1)
    /// - video: media engine count (1 if unknown)
    /// - pdf: cores / 2 (at least 1)
    ///
    /// A non-zero explicit worker count overrides the derived value.
    pub fn derive(cfg: &QueueConfig) -> Self {
        let total_cores = cfg
            .logical_cores
            .filter(|&c| c > 0)
            .unwrap_or_else(|| num_cpus::get() as u32);

        let image_workers = explicit_or(cfg.image_workers, derive_image_workers(total_cores));
        let video_workers = explicit_or(
            cfg.video_workers,
            cfg.media_engines.filter(|&n| n > 0).unwrap_or(1),
        );
        let pdf_workers = explicit_or(cfg.pdf_workers, derive_pdf_workers(total_cores));

        Self {
            total_cores,
            image_workers,
            video_workers,
            pdf_workers,
        }
    }

    pub fn workers(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Image => self.image_workers,
            QueueKind::Video => self.video_workers,
            QueueKind::Pdf => self.pdf_workers,
        }
    }
}

fn explicit_or(explicit: u32, derived: u32) -> u32 {
    if explicit > 0 {
        explicit
    } else {
        derived
    }
}

fn derive_image_workers(cores: u32) -> u32 {
    cores.saturating_sub(1).max(1)
}

fn derive_pdf_workers(cores: u32) -> u32 {
    (cores / 2).max(1)
}

/// A named counting semaphore.
#[derive(Debug, Clone)]
pub struct BoundedQueue {
    kind: QueueKind,
    capacity: u32,
    semaphore: Arc<Semaphore>,
}

impl BoundedQueue {
    pub fn new(kind: QueueKind, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Wait for a slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// The three queues, shared by every worker.
#[derive(Debug, Clone)]
pub struct ExecutionQueues {
    image: BoundedQueue,
    video: BoundedQueue,
    pdf: BoundedQueue,
}

impl ExecutionQueues {
    pub fn new(plan: &QueuePlan) -> Self {
        Self {
            image: BoundedQueue::new(QueueKind::Image, plan.image_workers),
            video: BoundedQueue::new(QueueKind::Video, plan.video_workers),
            pdf: BoundedQueue::new(QueueKind::Pdf, plan.pdf_workers),
        }
    }

    pub fn get(&self, kind: QueueKind) -> &BoundedQueue {
        match kind {
            QueueKind::Image => &self.image,
            QueueKind::Video => &self.video,
            QueueKind::Pdf => &self.pdf,
        }
    }
}
