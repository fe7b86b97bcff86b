//! Local IPC server.
//!
//! Lets a separate command-line client drive the engine over HTTP on the
//! loopback interface. Requests go in as JSON; `/optimise` answers with one
//! [`ResponseRecord`] per asset once every asset has settled.

use crate::asset::AssetType;
use crate::engine::{Engine, RequestOptions};
use crate::error::EngineError;
use crate::snapshot::{AssetSnapshot, RegistrySnapshot, ResponseRecord};
use crate::transform::{CropSize, Operation, Scale};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Body of `POST /optimise`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimiseRequest {
    /// Local paths or http(s) URLs
    pub paths: Vec<String>,
    /// Falls back to the configured default when absent
    pub aggressive: Option<bool>,
    pub downscale_factor: Option<f64>,
    pub crop: Option<CropSize>,
    pub allow_larger: bool,
    pub output_template: Option<String>,
}

impl OptimiseRequest {
    pub fn operation(&self) -> Operation {
        match (self.crop, self.downscale_factor) {
            (Some(size), _) => Operation::Crop(size),
            (None, Some(factor)) => Operation::Downscale(Scale::Factor(factor)),
            (None, None) => Operation::Optimise,
        }
    }
}

/// Body of `POST /stop`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopRequest {
    pub id: String,
    #[serde(default)]
    pub remove: bool,
}

/// Body of `POST /restore`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreRequest {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Engine errors rendered as JSON with a fitting status code.
struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::UnknownAsset(_) => StatusCode::NOT_FOUND,
            EngineError::UnsupportedType(_) | EngineError::InvalidOperation { .. } => StatusCode::BAD_REQUEST,
            EngineError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

/// Record for a path the engine refused outright.
fn rejected(path: &str, error: &EngineError) -> ResponseRecord {
    ResponseRecord {
        path: path.to_string(),
        for_url: matches!(AssetType::classify(path), AssetType::RemoteUrl(_)),
        old_bytes: -1,
        new_bytes: -1,
        error: Some(error.to_string()),
    }
}

async fn get_snapshot(State(engine): State<Engine>) -> Result<Json<RegistrySnapshot>, ApiError> {
    Ok(Json(engine.snapshot().await?))
}

/// Run one batch to completion and return a record per path, in order.
///
/// Paths the engine refuses outright get a record with the error instead of
/// failing the whole batch; only a shut-down engine aborts it.
pub async fn optimise_batch(engine: &Engine, request: &OptimiseRequest) -> Result<Vec<ResponseRecord>, EngineError> {
    let defaults = engine.default_options();
    let options = RequestOptions {
        aggressive: request.aggressive.unwrap_or(defaults.aggressive),
        allow_larger: request.allow_larger || defaults.allow_larger,
        output_template: request.output_template.clone(),
        ..defaults
    };
    let operation = request.operation();
    info!(count = request.paths.len(), operation = operation.name(), "optimise request");

    let mut pending = Vec::with_capacity(request.paths.len());
    for path in &request.paths {
        let asset_type = AssetType::classify(path);
        let source = match asset_type {
            AssetType::RemoteUrl(_) => None,
            _ => Some(PathBuf::from(path)),
        };
        let handle = engine
            .request(path.clone(), asset_type, source, operation.clone(), options.clone())
            .await;
        match handle {
            Ok(handle) => pending.push(Ok(handle)),
            Err(EngineError::Closed) => return Err(EngineError::Closed),
            Err(e) => pending.push(Err(rejected(path, &e))),
        }
    }

    let mut records = Vec::with_capacity(pending.len());
    for entry in pending {
        records.push(match entry {
            Ok(mut handle) => ResponseRecord::from_snapshot(&handle.wait().await),
            Err(record) => record,
        });
    }
    Ok(records)
}

async fn post_optimise(
    State(engine): State<Engine>,
    Json(request): Json<OptimiseRequest>,
) -> Result<Json<Vec<ResponseRecord>>, ApiError> {
    Ok(Json(optimise_batch(&engine, &request).await?))
}

async fn post_stop(
    State(engine): State<Engine>,
    Json(request): Json<StopRequest>,
) -> Result<StatusCode, ApiError> {
    engine.request_stop(request.id, request.remove).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_restore(
    State(engine): State<Engine>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<AssetSnapshot>, ApiError> {
    let mut handle = engine.request_restore(request.id).await?;
    Ok(Json(handle.wait().await))
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/optimise", post(post_optimise))
        .route("/stop", post(post_stop))
        .route("/restore", post(post_restore))
        .with_state(engine)
}

/// Serve the router on `addr` until `shutdown` resolves.
pub async fn run_server<F>(engine: Engine, addr: &str, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr, "ipc server listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MemoryMarkers;
    use axum::body::Body;
    use axum::http::Request;
    use media_optimiser_config::Config;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn engine(dir: &TempDir) -> Engine {
        let mut config = Config::default();
        config.storage.work_dir = Some(dir.path().join("work"));
        Engine::with_marker_store(&config, Arc::new(MemoryMarkers::new()))
    }

    fn post_json(uri: &str, body: &impl Serialize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_request_operation_precedence() {
        let mut request = OptimiseRequest::default();
        assert_eq!(request.operation(), Operation::Optimise);
        request.downscale_factor = Some(0.5);
        assert_eq!(request.operation(), Operation::Downscale(Scale::Factor(0.5)));
        request.crop = Some(CropSize { width: 10, height: 20 });
        assert_eq!(request.operation(), Operation::Crop(CropSize { width: 10, height: 20 }));
    }

    #[tokio::test]
    async fn test_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let app = router(engine(&dir));

        let response = app
            .oneshot(Request::builder().uri("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let snapshot: RegistrySnapshot = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(snapshot.assets.is_empty());
        assert_eq!(snapshot.counts.visible_count, 0);
    }

    #[tokio::test]
    async fn test_optimise_reports_one_record_per_path() {
        let dir = TempDir::new().unwrap();
        let app = router(engine(&dir));
        let missing = dir.path().join("missing.png").display().to_string();

        let request = OptimiseRequest {
            paths: vec![missing.clone(), "notes.txt".to_string()],
            ..Default::default()
        };
        let response = app.oneshot(post_json("/optimise", &request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records: Vec<ResponseRecord> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, missing);
        assert!(!records[0].for_url);
        assert!(records[0].error.as_deref().unwrap().starts_with("Source not found"));
        assert!(records[1].error.as_deref().unwrap().starts_with("Unsupported file type"));
    }

    #[tokio::test]
    async fn test_invalid_downscale_is_rejected_per_path() {
        let dir = TempDir::new().unwrap();
        let app = router(engine(&dir));

        let request = OptimiseRequest {
            paths: vec!["https://example.com/a.png".to_string()],
            downscale_factor: Some(2.0),
            ..Default::default()
        };
        let response = app.oneshot(post_json("/optimise", &request)).await.unwrap();
        let records: Vec<ResponseRecord> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(records[0].for_url);
        assert!(records[0].error.is_some());
        assert_eq!(records[0].old_bytes, -1);
    }

    #[tokio::test]
    async fn test_stop_and_restore_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let response = router(engine.clone())
            .oneshot(post_json(
                "/stop",
                &StopRequest {
                    id: "nope".to_string(),
                    remove: true,
                },
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.error, "No asset with id nope");

        let response = router(engine)
            .oneshot(post_json(
                "/restore",
                &RestoreRequest {
                    id: "nope".to_string(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_known_asset() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let path = dir.path().join("gone.png");
        engine
            .optimise_path(&path, RequestOptions::default())
            .await
            .unwrap()
            .wait()
            .await;

        let response = router(engine.clone())
            .oneshot(post_json(
                "/stop",
                &StopRequest {
                    id: path.display().to_string(),
                    remove: true,
                },
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(engine.snapshot().await.unwrap().assets.is_empty());
    }
}
