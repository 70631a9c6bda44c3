//! HTTP surface for remote clients.
//!
//! Thin axum handlers over [`ReplicateStore`]; wire types are shared
//! with the core crate so the JSON shapes match the in-process adapter.
//! Failures surface as the `{status, message}` envelope clients classify
//! into auth / validation / retriable.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use driftsync_core::{
    DeleteDocumentRequest, InsertDocumentRequest, MutationResponse, ProtocolVersionResponse,
    SsrRequest, SsrResponse, StreamRequest, StreamResponse, UpdateDocumentRequest,
};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::store::{CompactionReport, PruneReport, ReplicateStore};

/// Default retention for on-demand compaction (days).
const DEFAULT_COMPACTION_RETENTION_DAYS: i64 = 90;

/// Default retention for on-demand pruning (days).
const DEFAULT_PRUNING_RETENTION_DAYS: i64 = 180;

/// Wire error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub message: String,
}

/// Wrapper turning [`ServerError`] into an HTTP response.
pub struct ApiError(ServerError);

impl From<ServerError> for ApiError {
    fn from(error: ServerError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = ErrorBody {
            status,
            message: self.0.to_string(),
        };
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(body)).into_response()
    }
}

/// Arguments for the maintenance mutations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRequest {
    pub collection: String,
    pub retention_days: Option<i64>,
}

/// Build the replication router.
pub fn replicate_routes(store: Arc<ReplicateStore>) -> Router {
    Router::new()
        .route("/documents/insert", post(insert_document))
        .route("/documents/update", post(update_document))
        .route("/documents/delete", post(delete_document))
        .route("/stream", post(stream))
        .route("/ssr", post(ssr))
        .route("/protocol", get(protocol_version))
        .route("/maintenance/compact", post(compact))
        .route("/maintenance/prune", post(prune))
        .with_state(store)
}

async fn insert_document(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<InsertDocumentRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    Ok(Json(store.insert_document(request)?))
}

async fn update_document(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<UpdateDocumentRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    Ok(Json(store.update_document(request)?))
}

async fn delete_document(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<DeleteDocumentRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    Ok(Json(store.delete_document(request)?))
}

async fn stream(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<StreamRequest>,
) -> Result<Json<StreamResponse>, ApiError> {
    Ok(Json(store.stream(request)?))
}

async fn ssr(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<SsrRequest>,
) -> Result<Json<SsrResponse>, ApiError> {
    Ok(Json(store.ssr(request)?))
}

async fn protocol_version(
    State(store): State<Arc<ReplicateStore>>,
) -> Json<ProtocolVersionResponse> {
    Json(ProtocolVersionResponse {
        protocol_version: store.protocol_version(),
    })
}

async fn compact(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<Json<CompactionReport>, ApiError> {
    let retention = request
        .retention_days
        .unwrap_or(DEFAULT_COMPACTION_RETENTION_DAYS);
    Ok(Json(store.compact(&request.collection, retention)?))
}

async fn prune(
    State(store): State<Arc<ReplicateStore>>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<Json<PruneReport>, ApiError> {
    let retention = request
        .retention_days
        .unwrap_or(DEFAULT_PRUNING_RETENTION_DAYS);
    Ok(Json(store.prune(&request.collection, retention)?))
}
