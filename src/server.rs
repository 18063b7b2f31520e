//! # HTTP Server
//!
//! Thin `axum` surface over [`Identifier`]. The identify core is synchronous,
//! so every request runs on the blocking pool.

use crate::error::IdentifyError;
use crate::identify::Identifier;
use crate::model::IdentifyResponse;
use crate::request::IdentifyRequest;
use crate::store::ContactStore;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn status_for(err: &IdentifyError) -> StatusCode {
    match err {
        IdentifyError::Validation(_) => StatusCode::BAD_REQUEST,
        IdentifyError::Store { .. } | IdentifyError::Worker(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        IdentifyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for IdentifyError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(error = %self, "identify failed");
        } else {
            warn!(error = %self, "rejected identify request");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router<S>(identifier: Arc<Identifier<S>>) -> Router
where
    S: ContactStore + 'static,
{
    Router::new()
        .route("/identify", post(identify::<S>))
        .route("/health", get(health))
        .with_state(identifier)
}

async fn health() -> &'static str {
    "ok"
}

async fn identify<S>(
    State(identifier): State<Arc<Identifier<S>>>,
    body: Bytes,
) -> Result<Json<IdentifyResponse>, IdentifyError>
where
    S: ContactStore + 'static,
{
    let request = IdentifyRequest::from_json_bytes(&body)?;
    let contact = tokio::task::spawn_blocking(move || identifier.identify(&request))
        .await
        .map_err(worker_failure)??;
    Ok(Json(IdentifyResponse { contact }))
}

fn worker_failure(err: tokio::task::JoinError) -> IdentifyError {
    IdentifyError::Worker(err.to_string())
}

/// Serve `identifier` on `listener` until Ctrl-C.
pub async fn serve<S>(listener: TcpListener, identifier: Arc<Identifier<S>>) -> anyhow::Result<()>
where
    S: ContactStore + 'static,
{
    info!(addr = %listener.local_addr()?, "contact identity server listening");
    axum::serve(listener, router(identifier))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("contact identity server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
