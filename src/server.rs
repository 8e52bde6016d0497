//! HTTP surface over a shared [`Coordinator`].
//!
//! | Method | Path | Body | Response |
//! |---|---|---|---|
//! | GET | `/config` | | `ConfigResponse` |
//! | POST | `/clients` | `RegisterRequest` | `{"registered": bool}` |
//! | POST | `/updates` | `UpdateRequest` | `UpdateAck` |
//! | POST | `/aggregate` | | `AggregationOutcome` |
//! | GET | `/model[?version=N]` | | `ModelPackageResponse` |
//! | POST | `/model/verify` | `ModelPackageResponse` | `{"valid": bool}` |
//! | POST | `/rollback` | `{"target_version": N}` | `ModelPackageResponse` |
//!
//! Errors are `{"error": message, "code": status}` with the status from
//! [`FlError::status_code`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::coordinator::{AggregationOutcome, Coordinator};
use crate::error::FlError;
use crate::protocol::{
    ConfigResponse, ModelPackageResponse, ProtocolError, RegisterRequest, UpdateAck,
};

/// Handler error carrying the coordinator's taxonomy.
#[derive(Debug)]
pub struct ApiError(pub FlError);

impl From<FlError> for ApiError {
    fn from(e: FlError) -> Self {
        ApiError(e)
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "code": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/config", get(config))
        .route("/clients", post(register))
        .route("/updates", post(submit))
        .route("/aggregate", post(aggregate))
        .route("/model", get(model))
        .route("/model/verify", post(verify))
        .route("/rollback", post(rollback))
        .with_state(coordinator)
}

/// Serve until Ctrl-C.
pub async fn serve(coordinator: Arc<Coordinator>, addr: SocketAddr) -> Result<(), FlError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "coordinator listening");
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn config(State(coordinator): State<Arc<Coordinator>>) -> Json<ConfigResponse> {
    Json(coordinator.config_response())
}

async fn register(
    State(coordinator): State<Arc<Coordinator>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = RegisterRequest::from_json(&body)?;
    let created = coordinator.register_client(&request.client_id, &request.public_key)?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(json!({ "registered": true }))))
}

async fn submit(State(coordinator): State<Arc<Coordinator>>, body: Bytes) -> ApiResult<Json<UpdateAck>> {
    let ack = blocking(move || coordinator.submit_json(&body)).await?;
    Ok(Json(ack))
}

async fn aggregate(State(coordinator): State<Arc<Coordinator>>) -> ApiResult<Json<AggregationOutcome>> {
    let outcome = blocking(move || coordinator.aggregate()).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct ModelQuery {
    version: Option<u64>,
}

async fn model(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<ModelQuery>,
) -> ApiResult<Json<ModelPackageResponse>> {
    let package = blocking(move || coordinator.load_package(query.version)).await?;
    Ok(Json(package.to_response()))
}

async fn verify(State(coordinator): State<Arc<Coordinator>>, body: Bytes) -> ApiResult<Json<Value>> {
    let package = ModelPackageResponse::from_json(&body)?;
    let valid = blocking(move || coordinator.verify_package(&package)).await?;
    Ok(Json(json!({ "valid": valid })))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RollbackRequest {
    target_version: u64,
}

async fn rollback(
    State(coordinator): State<Arc<Coordinator>>,
    body: Bytes,
) -> ApiResult<Json<ModelPackageResponse>> {
    let request: RollbackRequest =
        serde_json::from_slice(&body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let package = blocking(move || coordinator.rollback(request.target_version)).await?;
    Ok(Json(package.to_response()))
}

async fn blocking<T, F>(f: F) -> Result<T, FlError>
where
    F: FnOnce() -> Result<T, FlError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FlError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
