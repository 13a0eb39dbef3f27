use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::Method;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use city_core::{CityError, Delivery, Outbox, SessionCoordinator};
use contracts::{
    ApiError, CitySnapshot, ErrorCode, InboundEvent, OutboundEvent, QueryResponse, SessionConfig,
    SessionStatus, SCHEMA_VERSION_V1,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{MoveStore, PersistenceError};

const DEFAULT_PAGE_SIZE: usize = 500;
const MAX_PAGE_SIZE: usize = 5000;
const DELIVERY_BUFFER: usize = 4096;

include!("error.rs");
include!("state.rs");
include!("routes/query.rs");
include!("routes/stream.rs");
include!("util.rs");

/// Runs the classroom server until the listener fails.
pub async fn serve(
    addr: SocketAddr,
    config: &SessionConfig,
    store: MoveStore,
) -> Result<(), ServerError> {
    let state = AppState::new(config, store)?;
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, session_id = %config.session_id, "classroom server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/session", get(get_session))
        .route("/api/v1/state", get(get_state))
        .route("/api/v1/moves", get(get_moves))
        .route("/api/v1/stream", get(stream_session))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}
