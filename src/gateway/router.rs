//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use super::auth::{AUTH_PATH, RequestGate, auth_middleware};
use super::tickets::TicketManager;
use super::tools::CalendarTools;
use crate::calendar::CalendarClient;
use crate::config::Config;
use crate::error::rpc_codes;
use crate::oauth::{
    CallbackParams, ConsentFlow, CredentialStore, INTERNAL_ERROR_MESSAGE, OAuthProvider,
    OAuthStateStore, ProviderClient, TokenManager, build_http_client,
};
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, RequestId, ServerCapabilities, ToolsCallParams,
    ToolsCapability, ToolsListResult, negotiate_version,
};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Consent redirect and callback handling
    pub consent: ConsentFlow,
    /// Host-facing tools
    pub tools: CalendarTools,
    /// Inbound request gate
    pub gate: Arc<RequestGate>,
    /// Path the provider redirects back to
    pub callback_path: String,
    /// Header carrying the host's user id (lowercase)
    pub user_id_header: String,
    /// User id used when the header is absent
    pub default_user_id: String,
}

impl AppState {
    /// Build state talking to the configured provider
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider: Arc<dyn OAuthProvider> = Arc::new(ProviderClient::from_config(config)?);
        let http_client = build_http_client(config.provider.request_timeout)?;
        Self::with_provider(config, provider, http_client)
    }

    /// Build state around an explicit provider and calendar HTTP client
    pub fn with_provider(
        config: &Config,
        provider: Arc<dyn OAuthProvider>,
        http_client: Client,
    ) -> Result<Self> {
        let service_secret = config
            .auth
            .resolve_bearer_token()
            .ok_or_else(|| Error::Config("Service bearer token is not set".to_string()))?;

        let store = Arc::new(CredentialStore::new(config.storage.directory.clone())?);
        let tokens = Arc::new(TokenManager::new(store, Arc::clone(&provider)));
        let tickets = Arc::new(TicketManager::new(config.auth.ticket_ttl));

        let consent = ConsentFlow::new(
            OAuthStateStore::new(config.provider.state_ttl),
            provider,
            Arc::clone(&tokens),
        );
        let tools = CalendarTools::new(
            tokens,
            Arc::clone(&tickets),
            CalendarClient::from_config(&config.calendar, http_client),
        );
        let gate = Arc::new(RequestGate::standard(
            service_secret,
            config.auth.public_paths.clone(),
            config.provider.callback_path.clone(),
            tickets,
        ));

        Ok(Self {
            consent,
            tools,
            gate,
            callback_path: config.provider.callback_path.clone(),
            user_id_header: config.auth.user_id_header.to_ascii_lowercase(),
            default_user_id: config.auth.default_user_id.clone(),
        })
    }

    /// User id for a host request
    fn user_id(&self, headers: &HeaderMap) -> std::result::Result<String, &'static str> {
        resolve_user_id(headers, &self.user_id_header, &self.default_user_id)
    }
}

/// Only an absent header falls back to `default_user_id`. A present header
/// that is empty or not UTF-8 is rejected, never mapped to another user.
fn resolve_user_id(
    headers: &HeaderMap,
    header_name: &str,
    default_user_id: &str,
) -> std::result::Result<String, &'static str> {
    let Some(value) = headers.get(header_name) else {
        return Ok(default_user_id.to_string());
    };
    let user_id = std::str::from_utf8(value.as_bytes())
        .map_err(|_| "User id header is not valid UTF-8")?
        .trim();
    if user_id.is_empty() {
        return Err("User id header is empty");
    }
    Ok(user_id.to_string())
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let gate = Arc::clone(&state.gate);
    let callback_path = state.callback_path.clone();

    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler))
        .route(AUTH_PATH, get(auth_handler))
        .route(&callback_path, get(callback_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(gate, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Health check
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    userid: Option<String>,
}

/// GET /auth - redirect the browser to the provider's consent screen.
/// The gate has already matched the ticket to `userid`.
async fn auth_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
) -> Response {
    let Some(user_id) = query.userid.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing userid").into_response();
    };

    match state.consent.begin(&user_id) {
        // 302 rather than the 303 of `Redirect::to`
        Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to build consent URL");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE).into_response()
        }
    }
}

/// GET /auth/callback - provider redirect after consent
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    state.consent.complete(params).await
}

/// MCP handler (POST /mcp)
async fn mcp_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(
                    None,
                    rpc_codes::PARSE_ERROR,
                    format!("Invalid JSON: {e}"),
                )),
            )
                .into_response();
        }
    };

    let (id, method, params) = match parse_request(&request) {
        Ok(parsed) => parsed,
        Err(response) => return (StatusCode::BAD_REQUEST, Json(response)).into_response(),
    };

    if is_notification_method(&method) {
        debug!(notification = %method, "Handling notification");
        return (StatusCode::ACCEPTED, Json(json!({}))).into_response();
    }

    let Some(id) = id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Missing id")),
        )
            .into_response();
    };

    let response = match method.as_str() {
        "initialize" => handle_initialize(id, params.as_ref()),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => success(
            id,
            &ToolsListResult {
                tools: CalendarTools::definitions(),
            },
        ),
        "tools/call" => match state.user_id(&headers) {
            Ok(user_id) => handle_tools_call(&state, id, &user_id, params).await,
            Err(reason) => {
                warn!(reason, "Rejected tool call with unusable user id header");
                JsonRpcResponse::error(Some(id), rpc_codes::INVALID_PARAMS, reason)
            }
        },
        _ => JsonRpcResponse::error(
            Some(id),
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        ),
    };

    Json(response).into_response()
}

async fn handle_tools_call(
    state: &AppState,
    id: RequestId,
    user_id: &str,
    params: Option<Value>,
) -> JsonRpcResponse {
    let call: ToolsCallParams = match params.map(serde_json::from_value::<ToolsCallParams>).transpose() {
        Ok(Some(call)) => call,
        Ok(None) => {
            return JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_PARAMS,
                "Missing tools/call params",
            );
        }
        Err(e) => {
            return JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_PARAMS,
                format!("Invalid tools/call params: {e}"),
            );
        }
    };

    info!(user_id = %user_id, tool = %call.name, "Tool call");
    match state.tools.call(user_id, &call.name, call.arguments).await {
        Ok(outcome) => success(id, &outcome.into_call_result()),
        Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
    }
}

fn handle_initialize(id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
    let client_version = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let negotiated = negotiate_version(client_version);
    debug!(client = client_version, negotiated, "Protocol version negotiation");

    success(
        id,
        &InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: Info {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Consent Broker".to_string()),
            },
            instructions: Some(
                "Calendar tools. A result of \"[AUTH] <ticket>\" means the user must open \
                 /auth?userid=<user>&token=<ticket> and grant calendar access."
                    .to_string(),
            ),
        },
    )
}

fn success<T: Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(
            Some(id),
            rpc_codes::INTERNAL_ERROR,
            format!("Failed to serialize result: {e}"),
        ),
    }
}

/// Extract a JSON-RPC request ID from a JSON value.
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .map(RequestId::Number),
        _ => None,
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse JSON-RPC request or notification
/// Returns (Option<RequestId>, method, params) - id is None for notifications
#[allow(clippy::result_large_err)] // JsonRpcResponse used directly as HTTP error body
fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    let params = value.get("params").cloned();

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        ));
    }

    Ok((id, method.to_string(), params))
}
