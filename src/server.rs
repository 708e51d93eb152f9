//! HTTP boundary of the gateway: `POST /api/chat`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::types::{ErrorResponse, ProviderRequest, ResponseEnvelope, WholeResponse};

/// Builds the gateway router around a shared dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .with_state(dispatcher)
}

async fn chat(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> Response {
    let request: ProviderRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::error!(error = %err, "rejecting malformed chat request");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"));
        }
    };

    match dispatcher.dispatch(request).await {
        Ok(ResponseEnvelope::Whole(response)) => Json(WholeResponse { response }).into_response(),
        Ok(ResponseEnvelope::Stream(fragments)) => {
            let body = Body::from_stream(fragments.map(Ok::<_, Infallible>));
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
        Err(err) => {
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// Handle returned by [`serve`]: the bound port and a shutdown trigger.
pub struct ServeHandle {
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<Result<(), std::io::Error>>>,
}

impl ServeHandle {
    /// Triggers graceful shutdown and waits for the server task to finish.
    pub async fn shutdown(mut self) -> Result<(), GatewayError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.await
                .map_err(|err| GatewayError::transport(format!("server task failed: {err}")))?
                .map_err(|err| GatewayError::transport(format!("server error: {err}")))?;
        }
        Ok(())
    }
}

/// Binds `bind` and serves the gateway in a background task.
///
/// # Errors
///
/// Returns [`GatewayError::Transport`] when the address cannot be bound.
pub async fn serve(dispatcher: Arc<Dispatcher>, bind: &str) -> Result<ServeHandle, GatewayError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| GatewayError::transport(format!("failed to bind {bind}: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| GatewayError::transport(err.to_string()))?
        .port();
    tracing::info!("gateway listening on {bind} (port {port})");

    let app = router(dispatcher);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("received shutdown signal");
            })
            .await
    });

    Ok(ServeHandle {
        port,
        shutdown_tx: Some(shutdown_tx),
        join: Some(join),
    })
}
