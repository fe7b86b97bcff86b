//! Media Optimiser engine
//!
//! Background service that compresses images, videos and PDFs with external
//! tools, keeps a backup of every original and publishes per-asset progress.

pub mod asset;
pub mod backup;
pub mod concurrency;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod marker;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod server;
pub mod size_gate;
pub mod snapshot;
pub mod startup;
pub mod transform;

pub use media_optimiser_config as config;
pub use media_optimiser_config::Config;
pub use asset::{AssetOptimiser, AssetState, AssetType, ImageFormat, Interaction, Progress, VideoFormat};
pub use backup::{BackupError, BackupStore};
pub use concurrency::{ExecutionQueues, QueueKind, QueuePlan};
pub use engine::{AssetHandle, Engine, RequestOptions, Trigger};
pub use error::EngineError;
pub use marker::{MarkerStore, MemoryMarkers, OptimisationMarker, XattrMarkers};
pub use registry::OptimisationRegistry;
pub use runner::{RunError, ToolCommand, ToolRunner};
pub use server::{optimise_batch, router, run_server, ErrorBody, OptimiseRequest, RestoreRequest, ServerError, StopRequest};
pub use snapshot::{AggregateCounts, AssetSnapshot, EngineEvent, RegistrySnapshot, ResponseRecord};
pub use startup::{check_tools, parse_ffmpeg_version, ToolAvailability, ToolStatus};
pub use transform::{CropSize, Operation, Scale};
