//! HTTP API and WebSocket push channel for the gateway.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, Request, State, WebSocketUpgrade, ws},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use futures_util::{SinkExt, StreamExt};
use gateway::{GatewayService, LoginStatus};
use proto::GatewayError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Settings for [`router`].
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    /// Required bearer token; `None` disables authentication.
    pub api_token: Option<String>,
    /// `*` or a comma-separated origin list.
    pub cors_origins: String,
}

struct HttpState {
    service: Arc<GatewayService>,
    api_token: Option<String>,
}

// ─── Request / response bodies ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAddedResponse {
    pub added: String,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRemovedResponse {
    pub removed: String,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookListResponse {
    pub webhooks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

// ─── Errors ────────────────────────────────────────────────

/// `{"error": ...}` response with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_json() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad json")
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::InvalidRecipient { .. }
            | GatewayError::MalformedRequest(_)
            | GatewayError::NotAuthenticated => StatusCode::BAD_REQUEST,
            GatewayError::AlreadyAuthenticated => StatusCode::CONFLICT,
            GatewayError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DeliveryFailed(_) | GatewayError::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

/// Decodes a JSON body whatever its `Content-Type`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!("Rejected request body: {e}");
        ApiError::bad_json()
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ─── Router ────────────────────────────────────────────────

/// Builds the API router.
///
/// Every route except `/health` requires the configured token.
pub fn router(service: Arc<GatewayService>, config: &HttpConfig) -> Router {
    let state = Arc::new(HttpState {
        service,
        api_token: config.api_token.clone().filter(|t| !t.is_empty()),
    });

    let api = Router::new()
        .route("/login", get(login_status).fallback(get_only))
        .route("/send", axum::routing::post(send_message).fallback(post_only))
        .route(
            "/webhook",
            get(list_webhooks)
                .post(add_webhook)
                .delete(remove_webhook)
                .fallback(post_or_delete_only),
        )
        .route("/webhooks", get(list_webhooks).fallback(get_only))
        .route("/qr", get(qr_image).fallback(get_only))
        .route("/logout", axum::routing::post(logout).fallback(post_only))
        .route("/ws", get(ws_handler))
        .route("/wss", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    api.route("/health", get(health_handler))
        .with_state(state)
        .layer(build_cors(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Serves `app` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP API listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("HTTP API stopped");
    Ok(())
}

/// Builds the CORS layer from the configured origins string.
fn build_cors(cors_origins: &str) -> CorsLayer {
    if cors_origins.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = cors_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ─── Middleware ────────────────────────────────────────────

async fn require_token(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };
    let bearer = request
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string());
    let given = bearer.or(query.token);
    if given.as_deref().is_some_and(|t| validate_token(t, expected)) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected unauthenticated request");
        ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    }
}

/// Token comparison for authentication.
fn validate_token(given: &str, expected: &str) -> bool {
    given == expected
}

// ─── Handlers ──────────────────────────────────────────────

async fn health_handler() -> &'static str {
    "ok"
}

async fn get_only() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "GET only")
}

async fn post_only() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "POST only")
}

async fn post_or_delete_only() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "POST / DELETE only")
}

async fn login_status(State(state): State<Arc<HttpState>>) -> Json<LoginStatus> {
    Json(state.service.login_status())
}

async fn send_message(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let req: SendRequest = parse_body(&body)?;
    state.service.send(&req.to, &req.message).await?;
    Ok(Json(StatusResponse {
        status: "sent".to_string(),
    }))
}

async fn list_webhooks(State(state): State<Arc<HttpState>>) -> Json<WebhookListResponse> {
    Json(WebhookListResponse {
        webhooks: state.service.list_webhooks(),
    })
}

async fn add_webhook(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Result<Json<WebhookAddedResponse>, ApiError> {
    let req: WebhookRequest = parse_body(&body)?;
    let added = state.service.register_webhook(&req.url)?;
    Ok(Json(WebhookAddedResponse {
        added: req.url.trim().to_string(),
        total: added.total,
    }))
}

async fn remove_webhook(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Result<Json<WebhookRemovedResponse>, ApiError> {
    let req: WebhookRequest = parse_body(&body)?;
    let removed = state.service.deregister_webhook(&req.url)?;
    Ok(Json(WebhookRemovedResponse {
        removed: req.url.trim().to_string(),
        total: removed.total,
    }))
}

async fn qr_image(State(state): State<Arc<HttpState>>) -> Result<Response, ApiError> {
    let png = state
        .service
        .qr_artifact()
        .read()
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no qr code"))?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    )
        .into_response())
}

async fn logout(State(state): State<Arc<HttpState>>) -> Result<Json<StatusResponse>, ApiError> {
    state.service.logout().await?;
    Ok(Json(StatusResponse {
        status: "logged out".to_string(),
    }))
}

// ─── WebSocket push ────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HttpState>>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Manages a single push connection.
///
/// The subscriber is removed once, whichever side ends the connection.
async fn handle_ws(socket: ws::WebSocket, state: Arc<HttpState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<gateway::Frame>();
    let subscribers = state.service.subscribers().clone();
    let id = subscribers.register(frame_tx);
    info!(subscriber = %id, total = subscribers.len(), "Push client connected");

    // Inbound frames are keep-alives only.
    let mut read_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(ws::Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_tx
                .send(ws::Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    subscribers.unregister(id);
    info!(subscriber = %id, "Push client disconnected");
}

// ─── Tests ─────────────────────────────────────────────────
