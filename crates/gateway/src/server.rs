use std::{any::Any, net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        body::{Body, Bytes},
        extract::{ConnectInfo, State},
        http::{HeaderMap, HeaderName, HeaderValue, Method, Request, header},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    chrono::{SecondsFormat, Utc},
    serde_json::{Map, Value, json},
    tower_http::{
        LatencyUnit,
        catch_panic::CatchPanicLayer,
        cors::{AllowOrigin, CorsLayer},
        trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
    },
    tracing::{Level, error, info, info_span, warn},
};

use {
    anyhow::Context,
    chatgate_config::{ChatgateConfig, ServerConfig},
    chatgate_whatsapp::{
        BridgeProvider, ConnectionManager, FileCredentialStore, ManagerOptions, MessageGateway,
        OutboundMessage,
    },
};

use crate::{auth, error::ApiError, state::AppState};

/// Header carrying the shared secret.
pub const PASSWORD_HEADER: &str = "x-api-password";

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: AppState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/status", get(status_handler))
        .route("/send-message", post(send_message_handler))
        .route("/reconnect", post(reconnect_handler));

    #[cfg(feature = "prometheus")]
    let router = if state.prometheus.is_some() {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    };

    let trace = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<Body>| {
            let origin = request
                .headers()
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            let remote = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map_or_else(|| "-".to_string(), |ConnectInfo(addr)| addr.to_string());
            info_span!(
                "request",
                method = %request.method(),
                path = %request.uri().path(),
                origin = %origin,
                remote = %remote
            )
        })
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(LatencyUnit::Millis),
        );

    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors_layer(&server.allowed_origins))
        .layer(trace)
        .with_state(state)
}

/// An empty allow-list mirrors any origin; otherwise only listed origins pass.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %o, "ignoring invalid allowed origin");
                    None
                },
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(PASSWORD_HEADER)])
        .allow_credentials(true)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "request handler panicked");
    ApiError::Internal.into_response()
}

/// Start the HTTP server and the managed session; returns after Ctrl-C once
/// the session has been closed.
pub async fn start_gateway(config: ChatgateConfig) -> anyhow::Result<()> {
    let resolved_auth = auth::resolve_auth(config.auth.password.clone());
    if !resolved_auth.is_configured() {
        warn!("no API password configured, protected endpoints will answer 500");
    }

    let whatsapp = &config.whatsapp;
    let store = Arc::new(FileCredentialStore::new(&whatsapp.auth_dir));
    let provider = Arc::new(BridgeProvider::from_config(&whatsapp.bridge));
    let manager = ConnectionManager::new(provider, store, ManagerOptions::from_config(whatsapp));
    let messages = MessageGateway::new(manager.clone(), whatsapp.default_domain.clone());

    let state = AppState::new(messages, resolved_auth);

    #[cfg(feature = "prometheus")]
    let state = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state.with_prometheus(handle),
        Err(e) => {
            warn!(error = %e, "prometheus recorder not installed, /metrics disabled");
            state
        },
    };

    let version = state.version;
    let app = build_gateway_app(state, &config.server);

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    let addr = listener.local_addr()?;

    // Startup banner.
    let lines = [
        format!("chatgate gateway v{version}"),
        format!("listening on {addr}"),
        format!("credentials: {}", whatsapp.auth_dir.display()),
        format!("bridge: {}", whatsapp.bridge.command),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let initial = manager.clone();
    tokio::spawn(async move {
        if !initial.connect().await {
            warn!("initial connect failed, use POST /reconnect to retry");
        }
    });

    // ConnectInfo feeds the remote address into the request span.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down, closing session");
    manager.disconnect().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// ── Request bodies ───────────────────────────────────────────────────────────

/// Request fields, from a JSON object or a URL-encoded form.
type Fields = Map<String, Value>;

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| {
            mime.trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
}

fn parse_fields(headers: &HeaderMap, body: &Bytes) -> Result<Fields, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Fields::new());
    }
    if is_form(headers) {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| ApiError::Validation(format!("invalid form body: {e}")))?;
        return Ok(pairs
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(ApiError::Validation(
            "request body must be a JSON object".into(),
        )),
        Err(e) => Err(ApiError::Validation(format!("invalid JSON body: {e}"))),
    }
}

/// Strings as-is, numbers in decimal form. Anything else counts as absent.
fn text_field(fields: &Fields, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The header wins; the body `password` field is the fallback. The body is
/// only read leniently here, so a malformed field never turns into a 401.
fn check_password(
    state: &AppState,
    headers: &HeaderMap,
    fields: &Result<Fields, ApiError>,
) -> Result<(), ApiError> {
    let header = headers
        .get(PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let body_password = fields
        .as_ref()
        .ok()
        .and_then(|f| text_field(f, "password"));
    auth::authorize(&state.auth, header.or(body_password.as_deref())).map_err(ApiError::from)
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("field \"{field}\" is required")))
}

fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "whatsapp_connected": state.manager.is_ready(),
        "timestamp": iso_now(),
    }))
}

async fn send_message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let fields = parse_fields(&headers, &body);
    check_password(&state, &headers, &fields)?;
    let fields = fields?;

    let message = required(text_field(&fields, "message"), "message")?;
    let receiver = required(text_field(&fields, "receiver"), "receiver")?;

    if !state.manager.is_ready() {
        return Err(ApiError::NotConnected);
    }

    let outbound =
        OutboundMessage::new(receiver, message).with_media(text_field(&fields, "media"));
    let receipt = state.messages.dispatch(&outbound).await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "success": true,
            "messageId": receipt.message_id,
            "timestamp": receipt.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
        "message": "message sent",
    })))
}

async fn reconnect_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let fields = parse_fields(&headers, &body);
    check_password(&state, &headers, &fields)?;
    fields?;

    let connected = state.manager.reconnect().await;
    Ok(Json(json!({
        "success": connected,
        "message": if connected { "reconnection started" } else { "reconnection failed" },
    })))
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}
