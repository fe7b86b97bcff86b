//! Immutable state snapshots pushed to observers.
//!
//! Observers never see the coordinator's mutable state. Every change is
//! published as a copy: per-asset [`AssetSnapshot`]s and registry-wide
//! [`AggregateCounts`], all serializable to JSON for the IPC surface.

use crate::asset::{AssetState, AssetType, Progress};
use crate::probe::Dimensions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix epoch milliseconds.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Copy of one asset's published fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetSnapshot {
    pub id: String,
    pub asset_type: AssetType,
    pub state: AssetState,
    pub running: bool,
    pub pending: bool,
    pub progress: Progress,
    pub error: Option<String>,
    pub notice: Option<String>,
    /// -1 until known
    pub old_bytes: i64,
    /// -1 until known
    pub new_bytes: i64,
    pub old_size: Option<Dimensions>,
    pub new_size: Option<Dimensions>,
    pub source_path: Option<PathBuf>,
    pub result_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
    pub aggressive: bool,
    pub is_original: bool,
    pub hidden: bool,
    pub operation: Option<String>,
    pub started_at: i64,
    pub run: u64,
}

impl AssetSnapshot {
    /// Bytes saved, when both sizes are known.
    pub fn saved_bytes(&self) -> Option<i64> {
        (self.old_bytes >= 0 && self.new_bytes >= 0).then(|| self.old_bytes - self.new_bytes)
    }
}

/// Derived counts driving aggregate progress
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateCounts {
    pub visible_count: usize,
    pub done_count: usize,
    pub failed_count: usize,
    pub running_count: usize,
}

/// Whole-registry snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistrySnapshot {
    pub timestamp_unix_ms: i64,
    pub assets: Vec<AssetSnapshot>,
    pub counts: AggregateCounts,
    /// Ids of removed assets that can be brought back, most recent first
    pub history: Vec<String>,
}

/// Change notifications broadcast by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Asset(AssetSnapshot),
    Removed { id: String },
    Aggregate(AggregateCounts),
}

/// One record per completed asset for out-of-process clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseRecord {
    pub path: String,
    pub for_url: bool,
    pub old_bytes: i64,
    pub new_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResponseRecord {
    pub fn from_snapshot(snapshot: &AssetSnapshot) -> Self {
        let for_url = matches!(snapshot.asset_type, AssetType::RemoteUrl(_));
        let path = match &snapshot.asset_type {
            AssetType::RemoteUrl(url) => url.clone(),
            _ => snapshot
                .result_path
                .as_ref()
                .or(snapshot.source_path.as_ref())
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| snapshot.id.clone()),
        };
        Self {
            path,
            for_url,
            old_bytes: snapshot.old_bytes,
            new_bytes: snapshot.new_bytes,
            error: snapshot.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::ImageFormat;

    fn snapshot() -> AssetSnapshot {
        AssetSnapshot {
            id: "/photos/a.png".to_string(),
            asset_type: AssetType::Image(ImageFormat::Png),
            state: AssetState::Finished,
            running: false,
            pending: false,
            progress: Progress::determinate(1, "Optimising"),
            error: None,
            notice: None,
            old_bytes: 10_000_000,
            new_bytes: 3_000_000,
            old_size: Some(Dimensions::new(4000, 3000)),
            new_size: Some(Dimensions::new(4000, 3000)),
            source_path: Some(PathBuf::from("/photos/a.png")),
            result_path: Some(PathBuf::from("/photos/a.png")),
            backup_path: None,
            thumbnail_path: None,
            aggressive: false,
            is_original: false,
            hidden: false,
            operation: Some("optimise".to_string()),
            started_at: 1_701_388_800_000,
            run: 1,
        }
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snap = snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"old_bytes\":10000000"));
        assert!(json.contains("\"state\":\"finished\""));
        let parsed: AssetSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snap);
    }

    #[test]
    fn test_saved_bytes() {
        let mut snap = snapshot();
        assert_eq!(snap.saved_bytes(), Some(7_000_000));
        snap.new_bytes = -1;
        assert_eq!(snap.saved_bytes(), None);
    }

    #[test]
    fn test_response_record_from_snapshot() {
        let record = ResponseRecord::from_snapshot(&snapshot());
        assert_eq!(record.path, "/photos/a.png");
        assert!(!record.for_url);
        assert_eq!(record.old_bytes, 10_000_000);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("error"), "absent errors are omitted");

        let mut remote = snapshot();
        remote.asset_type = AssetType::RemoteUrl("https://example.com/a.png".to_string());
        remote.error = Some("Source not found: https://example.com/a.png".to_string());
        let record = ResponseRecord::from_snapshot(&remote);
        assert!(record.for_url);
        assert_eq!(record.path, "https://example.com/a.png");
        assert!(record.error.is_some());
    }

    #[test]
    fn test_event_tagging() {
        let event = EngineEvent::Removed { id: "x".to_string() };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"removed","id":"x"}"#
        );
    }

    #[test]
    fn test_now_unix_ms_is_recent() {
        assert!(now_unix_ms() > 1_600_000_000_000);
    }
}
