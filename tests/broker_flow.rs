//! End-to-end broker tests
//!
//! Drives the full router against a local fake provider:
//! - Request gate (service bearer, tickets, public paths, callback exemption)
//! - MCP dispatch and JSON-RPC error codes
//! - Consent flow from `[AUTH]` ticket to stored credentials
//! - Token refresh and calendar calls

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Form, Json, Router,
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    routing::{get, post},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use consent_broker::config::Config;
use consent_broker::gateway::Broker;
use consent_broker::oauth::{CredentialRecord, CredentialStore};

const SERVICE_SECRET: &str = "service-secret";

#[derive(Default)]
struct ProviderCalls {
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
}

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
}

fn is_valid_access_token(headers: &HeaderMap) -> bool {
    matches!(bearer_of(headers).as_deref(), Some("at-1" | "at-2"))
}

/// Token endpoint plus the calendar endpoints the tools call
async fn spawn_fake_provider(calls: Arc<ProviderCalls>) -> String {
    let token_calls = Arc::clone(&calls);
    let app = Router::new()
        .route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let calls = Arc::clone(&token_calls);
                async move {
                    match form.get("grant_type").map(String::as_str) {
                        Some("authorization_code") if form.get("code").map(String::as_str) == Some("good-code") => {
                            calls.exchanges.fetch_add(1, Ordering::SeqCst);
                            (
                                StatusCode::OK,
                                Json(json!({
                                    "access_token": "at-1",
                                    "refresh_token": "rt-1",
                                    "expires_in": 3600,
                                    "token_type": "Bearer"
                                })),
                            )
                        }
                        Some("refresh_token") if form.get("refresh_token").map(String::as_str) == Some("rt-1") => {
                            calls.refreshes.fetch_add(1, Ordering::SeqCst);
                            (
                                StatusCode::OK,
                                Json(json!({"access_token": "at-2", "expires_in": 3600})),
                            )
                        }
                        _ => (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "invalid_grant"})),
                        ),
                    }
                }
            }),
        )
        .route(
            "/calendar/v3/calendars/primary/events",
            get(|headers: HeaderMap| async move {
                if !is_valid_access_token(&headers) {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid"})));
                }
                (
                    StatusCode::OK,
                    Json(json!({"items": [{"id": "evt-1", "summary": "Standup"}]})),
                )
            })
            .post(|headers: HeaderMap, Json(mut body): Json<Value>| async move {
                if !is_valid_access_token(&headers) {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid"})));
                }
                body["id"] = json!("evt-new");
                (StatusCode::OK, Json(body))
            }),
        )
        .route(
            "/calendar/v3/users/me/settings/timezone",
            get(|| async { Json(json!({"value": "Europe/Helsinki"})) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    dir: tempfile::TempDir,
    router: Router,
    calls: Arc<ProviderCalls>,
}

impl Harness {
    async fn new() -> Self {
        let calls = Arc::new(ProviderCalls::default());
        let base = spawn_fake_provider(Arc::clone(&calls)).await;
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.auth.bearer_token = Some(SERVICE_SECRET.to_string());
        config.server.public_url = Some("https://broker.example.com".to_string());
        config.provider.client_id = Some("client-id".to_string());
        config.provider.client_secret = Some("client-secret".to_string());
        config.provider.authorization_endpoint =
            "https://accounts.example.com/o/oauth2/auth".to_string();
        config.provider.token_endpoint = format!("{base}/token");
        config.calendar.api_base = format!("{base}/calendar/v3");
        config.storage.directory = dir.path().to_path_buf();
        config.validate().unwrap();

        let router = Broker::new(config).unwrap().router();
        Self { dir, router, calls }
    }

    fn store(&self) -> CredentialStore {
        CredentialStore::new(self.dir.path()).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, String) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn rpc(&self, user_id: &str, body: &Value) -> (StatusCode, Value) {
        self.rpc_with_user_header(Some(HeaderValue::from_str(user_id).unwrap()), body)
            .await
    }

    async fn rpc_with_user_header(
        &self,
        user_header: Option<HeaderValue>,
        body: &Value,
    ) -> (StatusCode, Value) {
        let mut request = Request::post("/mcp")
            .header(header::AUTHORIZATION, format!("Bearer {SERVICE_SECRET}"))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(value) = user_header {
            request = request.header("x-user-id", value);
        }
        let (status, _, text) = self
            .send(request.body(Body::from(body.to_string())).unwrap())
            .await;
        (status, serde_json::from_str(&text).unwrap())
    }

    async fn call_tool(&self, user_id: &str, name: &str, arguments: Value) -> Value {
        let (status, response) = self
            .rpc(
                user_id,
                &json!({
                    "jsonrpc": "2.0",
                    "id": 7,
                    "method": "tools/call",
                    "params": {"name": name, "arguments": arguments}
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        response
    }
}

fn tool_text(response: &Value) -> &str {
    response["result"]["content"][0]["text"].as_str().unwrap()
}

fn query_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location).unwrap();
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn seed_record(store: &CredentialStore, user_id: &str, expires_at: u64, refresh_token: &str) {
    store
        .write_record(&CredentialRecord {
            user_id: user_id.to_string(),
            access_token: "at-1".to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at,
            token_type: Some("Bearer".to_string()),
            scope: None,
        })
        .unwrap();
}

// ============================================================================
// Consent flow
// ============================================================================

#[tokio::test]
async fn test_full_consent_flow() {
    let h = Harness::new().await;

    // No credentials yet: the tool answers with a ticket
    let response = h.call_tool("alice", "view_calendar", json!({})).await;
    let text = tool_text(&response);
    let ticket = text.strip_prefix("[AUTH] ").unwrap().to_string();
    assert_eq!(ticket.len(), 64);
    assert_eq!(response["result"]["isError"], false);

    // Browser follows the consent link
    let (status, headers, _) = h
        .get(&format!("/auth?userid=alice&token={ticket}"))
        .await;
    assert_eq!(status, StatusCode::FOUND);
    let location = headers[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("https://accounts.example.com/o/oauth2/auth?"));
    assert_eq!(
        query_param(&location, "redirect_uri").as_deref(),
        Some("https://broker.example.com/auth/callback")
    );
    assert_eq!(query_param(&location, "access_type").as_deref(), Some("offline"));
    assert_eq!(query_param(&location, "prompt").as_deref(), Some("consent"));
    let state = query_param(&location, "state").unwrap();

    // Provider redirects back without any bearer header
    let (status, _, body) = h
        .get(&format!("/auth/callback?code=good-code&state={state}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "You can close the tab.");
    assert_eq!(h.calls.exchanges.load(Ordering::SeqCst), 1);

    let record = h.store().load("alice").unwrap();
    assert_eq!(record.access_token, "at-1");
    assert_eq!(record.refresh_token, "rt-1");
    assert!(record.is_fresh());

    // State is single use
    let (status, _, body) = h
        .get(&format!("/auth/callback?code=good-code&state={state}"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid or expired state parameter");
    assert_eq!(h.calls.exchanges.load(Ordering::SeqCst), 1);

    // Now the tool reaches the calendar
    let response = h.call_tool("alice", "view_calendar", json!({})).await;
    let events: Value = serde_json::from_str(tool_text(&response)).unwrap();
    assert_eq!(events, json!([{"id": "evt-1", "summary": "Standup"}]));
}

#[tokio::test]
async fn test_ticket_is_bound_to_user() {
    let h = Harness::new().await;

    let response = h.call_tool("alice", "view_calendar", json!({})).await;
    let ticket = tool_text(&response).strip_prefix("[AUTH] ").unwrap().to_string();

    let (status, _, body) = h.get(&format!("/auth?userid=bob&token={ticket}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Invalid authorization ticket");
}

#[tokio::test]
async fn test_new_ticket_supersedes_previous() {
    let h = Harness::new().await;

    let first = h.call_tool("alice", "view_calendar", json!({})).await;
    let first = tool_text(&first).strip_prefix("[AUTH] ").unwrap().to_string();
    let second = h.call_tool("alice", "view_calendar", json!({})).await;
    let second = tool_text(&second).strip_prefix("[AUTH] ").unwrap().to_string();
    assert_ne!(first, second);

    let (status, _, _) = h.get(&format!("/auth?userid=alice&token={first}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = h.get(&format!("/auth?userid=alice&token={second}")).await;
    assert_eq!(status, StatusCode::FOUND);
}

#[tokio::test]
async fn test_callback_error_paths() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/auth/callback?error=access_denied").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "OAuth Error: access_denied");

    let (status, _, body) = h.get("/auth/callback?code=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid OAuth callback parameters");

    let (status, _, body) = h.get("/auth/callback?code=abc&state=forged").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid or expired state parameter");
    assert_eq!(h.calls.exchanges.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_exchange_is_internal_error() {
    let h = Harness::new().await;

    let response = h.call_tool("carol", "view_calendar", json!({})).await;
    let ticket = tool_text(&response).strip_prefix("[AUTH] ").unwrap().to_string();
    let (_, headers, _) = h.get(&format!("/auth?userid=carol&token={ticket}")).await;
    let state = query_param(headers[header::LOCATION].to_str().unwrap(), "state").unwrap();

    let (status, _, body) = h
        .get(&format!("/auth/callback?code=bad-code&state={state}"))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "An internal error occurred.");
    assert!(h.store().load("carol").is_none());
}

fn view_calendar_call() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 9,
        "method": "tools/call",
        "params": {"name": "view_calendar", "arguments": {}}
    })
}

#[tokio::test]
async fn test_missing_user_header_falls_back_to_default_user() {
    let h = Harness::new().await;

    let (status, response) = h.rpc_with_user_header(None, &view_calendar_call()).await;
    assert_eq!(status, StatusCode::OK);
    let ticket = tool_text(&response).strip_prefix("[AUTH] ").unwrap().to_string();

    let (status, _, _) = h
        .get(&format!("/auth?userid=single_user&token={ticket}"))
        .await;
    assert_eq!(status, StatusCode::FOUND);
}

#[tokio::test]
async fn test_non_ascii_user_is_not_served_default_credentials() {
    let h = Harness::new().await;
    seed_record(&h.store(), "single_user", u64::MAX / 2, "rt-1");

    // UTF-8 "josé" is its own tenant
    let header = HeaderValue::from_bytes("jos\u{e9}".as_bytes()).unwrap();
    let (_, response) = h
        .rpc_with_user_header(Some(header), &view_calendar_call())
        .await;
    let text = tool_text(&response);
    let ticket = text
        .strip_prefix("[AUTH] ")
        .unwrap_or_else(|| panic!("josé must authorize separately, got {text}"))
        .to_string();

    let (status, _, _) = h
        .get(&format!("/auth?userid=jos%C3%A9&token={ticket}"))
        .await;
    assert_eq!(status, StatusCode::FOUND);
    let (status, _, _) = h
        .get(&format!("/auth?userid=single_user&token={ticket}"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Bytes that are not UTF-8 are refused rather than guessed at
    let header = HeaderValue::from_bytes(b"jos\xe9").unwrap();
    let (status, response) = h
        .rpc_with_user_header(Some(header), &view_calendar_call())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["error"]["code"], -32602);
    assert!(response.get("result").is_none());

    let record = h.store().load("single_user").unwrap();
    assert_eq!(record.access_token, "at-1");
}

// ============================================================================
// Token lifecycle through the tools
// ============================================================================

#[tokio::test]
async fn test_expired_record_is_refreshed_and_persisted() {
    let h = Harness::new().await;
    seed_record(&h.store(), "dave", 0, "rt-1");

    let response = h.call_tool("dave", "view_calendar", json!({})).await;
    let events: Value = serde_json::from_str(tool_text(&response)).unwrap();
    assert_eq!(events[0]["id"], "evt-1");
    assert_eq!(h.calls.refreshes.load(Ordering::SeqCst), 1);

    let record = h.store().load("dave").unwrap();
    assert_eq!(record.access_token, "at-2");
    // Provider omitted a new refresh token, so the old one is kept
    assert_eq!(record.refresh_token, "rt-1");
    assert!(record.is_fresh());

    // Fresh now: no second refresh
    h.call_tool("dave", "view_calendar", json!({})).await;
    assert_eq!(h.calls.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_refresh_requires_authorization() {
    let h = Harness::new().await;
    seed_record(&h.store(), "erin", 0, "revoked");

    let response = h.call_tool("erin", "view_calendar", json!({})).await;
    assert!(tool_text(&response).starts_with("[AUTH] "));
}

#[tokio::test]
async fn test_add_event_uses_calendar_timezone() {
    let h = Harness::new().await;
    seed_record(&h.store(), "frank", u64::MAX / 2, "rt-1");

    let response = h
        .call_tool(
            "frank",
            "add_event_to_calendar",
            json!({
                "details": "Team meeting",
                "start_time": "2025-05-26T07:00:00",
                "end_time": "2025-05-26T08:00:00"
            }),
        )
        .await;
    let created: Value = serde_json::from_str(tool_text(&response)).unwrap();
    assert_eq!(created["id"], "evt-new");
    assert_eq!(created["summary"], "Team meeting");
    assert_eq!(created["start"]["dateTime"], "2025-05-26T07:00:00");
    assert_eq!(created["start"]["timeZone"], "Europe/Helsinki");
    assert_eq!(created["end"]["dateTime"], "2025-05-26T08:00:00");
}

#[tokio::test]
async fn test_add_event_argument_errors() {
    let h = Harness::new().await;

    let response = h
        .call_tool("gina", "add_event_to_calendar", json!({"details": "x"}))
        .await;
    assert_eq!(response["error"]["code"], -32602);

    let response = h
        .call_tool(
            "gina",
            "add_event_to_calendar",
            json!({"details": "x", "start_time": "tomorrow", "end_time": "2025-05-26T08:00:00"}),
        )
        .await;
    assert_eq!(response["result"]["isError"], true);
    assert!(tool_text(&response).contains("start_time"));
}

// ============================================================================
// Request gate
// ============================================================================

#[tokio::test]
async fn test_mcp_requires_service_bearer() {
    let h = Harness::new().await;
    let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();

    let cases = [
        (None, "Missing Authorization Header"),
        (Some("Basic dXNlcjpwYXNz"), "Invalid Authorization Header"),
        (Some("Bearer wrong"), "Unauthorized"),
    ];
    for (authorization, expected) in cases {
        let mut request = Request::post("/mcp").header(header::CONTENT_TYPE, "application/json");
        if let Some(value) = authorization {
            request = request.header(header::AUTHORIZATION, value);
        }
        let (status, headers, body) = h.send(request.body(Body::from(ping.clone())).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, expected);
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
    }

    let request = Request::post("/mcp")
        .header(header::AUTHORIZATION, format!("bearer {SERVICE_SECRET}"))
        .body(Body::from(ping))
        .unwrap();
    let (status, _, _) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_auth_endpoint_requires_ticket() {
    let h = Harness::new().await;

    let (status, _, body) = h.get("/auth").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Missing userid or token");

    let (status, _, body) = h.get("/auth?userid=alice&token=guess").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Invalid authorization ticket");

    // The service bearer does not open /auth
    let request = Request::get("/auth?userid=alice")
        .header(header::AUTHORIZATION, format!("Bearer {SERVICE_SECRET}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = h.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_is_public() {
    let h = Harness::new().await;
    let (status, _, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "healthy");
}

// ============================================================================
// MCP protocol
// ============================================================================

#[tokio::test]
async fn test_initialize_and_list_tools() {
    let h = Harness::new().await;

    let (_, response) = h
        .rpc(
            "alice",
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2025-06-18", "capabilities": {}}
            }),
        )
        .await;
    assert_eq!(response["result"]["protocolVersion"], "2025-06-18");

    let (_, response) = h
        .rpc("alice", &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["view_calendar", "add_event_to_calendar"]);
}

#[tokio::test]
async fn test_jsonrpc_error_codes() {
    let h = Harness::new().await;

    let request = Request::post("/mcp")
        .header(header::AUTHORIZATION, format!("Bearer {SERVICE_SECRET}"))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = h.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"]["code"], -32700);

    let (status, _) = h
        .rpc(
            "alice",
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, response) = h
        .rpc("alice", &json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}))
        .await;
    assert_eq!(response["error"]["code"], -32601);

    let response = h.call_tool("alice", "delete_calendar", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["id"], 7);
}
