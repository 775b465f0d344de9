use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::BridgeService;
use crate::config::Config;
use crate::control::ControlService;
use crate::opencode::OpenCodeClient;
use crate::telegram::TelegramApi;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ControlState {
    control: Arc<ControlService>,
    opencode: Arc<OpenCodeClient>,
    telegram: Arc<TelegramApi>,
    relay_mode: String,
    relay_fallback: bool,
    relay_fallback_delay_ms: u64,
    started_at: Instant,
}

impl ControlState {
    pub fn new(
        cfg: &Config,
        control: Arc<ControlService>,
        opencode: Arc<OpenCodeClient>,
        telegram: Arc<TelegramApi>,
    ) -> Self {
        Self {
            control,
            opencode,
            telegram,
            relay_mode: cfg.relay_mode.to_string(),
            relay_fallback: cfg.relay_fallback,
            relay_fallback_delay_ms: cfg.relay_fallback_delay.as_millis() as u64,
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct ServiceCheck {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct RelayInfo {
    mode: String,
    #[serde(rename = "fallbackEnabled")]
    fallback_enabled: bool,
    #[serde(rename = "fallbackDelayMs")]
    fallback_delay_ms: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
    opencode: ServiceCheck,
    telegram: ServiceCheck,
    relay: RelayInfo,
}

pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/command/status", post(command_status))
        .route("/command/session/get", post(command_session_get))
        .route("/command/session/list", post(command_session_list))
        .route("/command/session/use", post(command_session_use))
        .route("/command/session/new", post(command_session_new))
        .route("/command/models/list", post(command_models_list))
        .route("/command/models/set", post(command_models_set))
        .route("/command/models/clear", post(command_models_clear))
        .route("/command/compact", post(command_compact))
        .route("/command/allow", post(command_allow))
        .route("/command/deny", post(command_deny))
        .route("/command/access/list", get(command_access_list))
        .with_state(state)
}

/// Serves a router until the shutdown token fires.
pub async fn serve(addr: &str, router: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("http server listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server failed")
}

/// Router for webhook-mode ingestion: parses the Telegram update shape and
/// runs the dispatcher inline, 400 on parse failure.
pub fn webhook_router(path: &str, bridge: Arc<BridgeService>, cancel: CancellationToken) -> Router {
    Router::new().route(
        path,
        post(move |body: axum::body::Bytes| {
            let bridge = Arc::clone(&bridge);
            let cancel = cancel.clone();
            async move {
                match TelegramApi::parse_webhook_update(&body) {
                    Ok(update) => {
                        bridge.handle_update(&cancel, update).await;
                        StatusCode::OK
                    }
                    Err(_) => StatusCode::BAD_REQUEST,
                }
            }
        }),
    )
}

async fn health(State(state): State<ControlState>) -> Json<HealthResponse> {
    let opencode_check = async {
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.opencode.check_connectivity()).await
        {
            Ok(Ok(())) => ServiceCheck {
                ok: true,
                error: None,
            },
            Ok(Err(err)) => check_failure(err.to_string()),
            Err(_) => check_failure("health check timed out".to_owned()),
        }
    };
    let telegram_check = async {
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.telegram.check_connectivity()).await
        {
            Ok(Ok(())) => ServiceCheck {
                ok: true,
                error: None,
            },
            Ok(Err(err)) => check_failure(err.to_string()),
            Err(_) => check_failure("health check timed out".to_owned()),
        }
    };
    let (opencode, telegram) = tokio::join!(opencode_check, telegram_check);

    Json(HealthResponse {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        opencode,
        telegram,
        relay: RelayInfo {
            mode: state.relay_mode.clone(),
            fallback_enabled: state.relay_fallback,
            fallback_delay_ms: state.relay_fallback_delay_ms,
        },
    })
}

fn check_failure(message: String) -> ServiceCheck {
    let message = message.trim().to_owned();
    ServiceCheck {
        ok: false,
        error: Some(if message.is_empty() {
            "unknown error".to_owned()
        } else {
            message
        }),
    }
}

struct ControlError(StatusCode, String);

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ControlError {
    ControlError(StatusCode::BAD_REQUEST, message.into())
}

fn chat_and_user(payload: &Value) -> Result<(i64, i64), ControlError> {
    let chat_id = parse_int64_any(payload.get("chatId"));
    let user_id = parse_int64_any(payload.get("userId"));
    match (chat_id, user_id) {
        (Some(chat_id), Some(user_id)) if chat_id != 0 && user_id != 0 => Ok((chat_id, user_id)),
        _ => Err(bad_request("chatId and userId are required")),
    }
}

fn parse_int64_any(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(num) => num
            .as_i64()
            .or_else(|| num.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

async fn command_status(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let report = state
        .control
        .status(chat_id, user_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "sessionId": report.session_id,
        "status": report.status,
        "model": report.model,
    })))
}

async fn command_session_get(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let session_id = state
        .control
        .session_current(chat_id, user_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({ "sessionId": session_id })))
}

async fn command_session_list(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let list = state
        .control
        .session_list(chat_id, user_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    let sessions: Vec<Value> = list
        .into_iter()
        .map(|item| {
            serde_json::json!({
                "id": item.id,
                "title": item.title,
                "updated": item.updated,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn command_session_use(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let session_id = payload
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if session_id.is_empty() {
        return Err(bad_request("sessionId is required"));
    }
    state
        .control
        .session_use(chat_id, user_id, session_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "session updated",
        "sessionId": session_id,
    })))
}

async fn command_session_new(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let default_id = state
        .control
        .session_new(chat_id, user_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "session reset",
        "defaultSessionId": default_id,
    })))
}

async fn command_models_list(
    State(state): State<ControlState>,
) -> Result<Json<Value>, ControlError> {
    let models = state
        .control
        .models_list()
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    let models: Vec<Value> = models
        .into_iter()
        .map(|model| {
            serde_json::json!({
                "id": model.id,
                "name": model.name,
                "favorite": model.favorite,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "models": models })))
}

async fn command_models_set(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if model.is_empty() {
        return Err(bad_request("model is required"));
    }
    let session_id = state
        .control
        .models_set(chat_id, user_id, model)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "model set",
        "sessionId": session_id,
        "model": model,
    })))
}

async fn command_models_clear(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let session_id = state
        .control
        .models_clear(chat_id, user_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "model cleared",
        "sessionId": session_id,
    })))
}

async fn command_compact(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let (chat_id, user_id) = chat_and_user(&payload)?;
    let session_id = state
        .control
        .compact(chat_id, user_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "session compacted",
        "sessionId": session_id,
    })))
}

async fn command_allow(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let target_id = parse_int64_any(payload.get("targetUserId"))
        .filter(|id| *id != 0)
        .ok_or_else(|| bad_request("targetUserId is required"))?;
    state
        .control
        .allow(target_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "user allowed",
        "targetUserId": target_id,
    })))
}

async fn command_deny(
    State(state): State<ControlState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ControlError> {
    let target_id = parse_int64_any(payload.get("targetUserId"))
        .filter(|id| *id != 0)
        .ok_or_else(|| bad_request("targetUserId is required"))?;
    state
        .control
        .deny(target_id)
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::json!({
        "message": "user removed",
        "targetUserId": target_id,
    })))
}

async fn command_access_list(
    State(state): State<ControlState>,
) -> Result<Json<Value>, ControlError> {
    let list = state
        .control
        .access_list()
        .await
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(serde_json::to_value(list).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use std::future::IntoFuture;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::json;

    use super::*;
    use crate::config::test_support::sample_config;
    use crate::domain::SessionsSource;
    use crate::ports::{AuthzRepository, SessionLinkRepository, SessionModelRepository};
    use crate::session_link::SessionLinkService;
    use crate::storage::SqliteStore;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        p.push(format!("opencode-bridge-control-{name}-{stamp}.db"));
        p
    }

    async fn spawn_control(name: &str) -> (SocketAddr, Arc<SqliteStore>) {
        let cfg = sample_config();
        let store = SqliteStore::open(temp_db_path(name)).await.expect("store");
        let opencode = Arc::new(OpenCodeClient::new(&cfg));
        let sessions = Arc::new(SessionLinkService::new(
            Arc::clone(&store) as Arc<dyn SessionLinkRepository>,
            "",
        ));
        let control = Arc::new(ControlService::new(
            Arc::clone(&store) as Arc<dyn AuthzRepository>,
            sessions,
            Arc::clone(&store) as Arc<dyn SessionModelRepository>,
            Arc::clone(&opencode),
            5,
            SessionsSource::Both,
        ));
        let telegram = Arc::new(TelegramApi::new(
            &cfg.bot_token,
            cfg.opencode_timeout,
            cfg.polling_interval,
        ));
        let state = ControlState::new(&cfg, control, opencode, telegram);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(axum::serve(listener, control_router(state)).into_future());
        (addr, store)
    }

    #[tokio::test]
    async fn session_use_then_get_round_trips_over_http() {
        let (addr, _store) = spawn_control("session-roundtrip").await;
        let client = reqwest::Client::new();

        let set = client
            .post(format!("http://{addr}/command/session/use"))
            .json(&json!({ "chatId": 100, "userId": 42, "sessionId": "ses_http" }))
            .send()
            .await
            .expect("use request");
        assert_eq!(set.status().as_u16(), 200);

        let get = client
            .post(format!("http://{addr}/command/session/get"))
            .json(&json!({ "chatId": "100", "userId": "42" }))
            .send()
            .await
            .expect("get request");
        assert_eq!(get.status().as_u16(), 200);
        let payload: Value = get.json().await.expect("json");
        assert_eq!(
            payload.get("sessionId").and_then(Value::as_str),
            Some("ses_http")
        );
    }

    #[tokio::test]
    async fn command_endpoints_validate_their_input() {
        let (addr, _store) = spawn_control("validation").await;
        let client = reqwest::Client::new();

        let missing_ids = client
            .post(format!("http://{addr}/command/session/get"))
            .json(&json!({ "chatId": 100 }))
            .send()
            .await
            .expect("request");
        assert_eq!(missing_ids.status().as_u16(), 400);

        let missing_session = client
            .post(format!("http://{addr}/command/session/use"))
            .json(&json!({ "chatId": 100, "userId": 42 }))
            .send()
            .await
            .expect("request");
        assert_eq!(missing_session.status().as_u16(), 400);

        let missing_target = client
            .post(format!("http://{addr}/command/allow"))
            .json(&json!({}))
            .send()
            .await
            .expect("request");
        assert_eq!(missing_target.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn allow_and_access_list_round_trip_over_http() {
        let (addr, store) = spawn_control("access").await;
        store.upsert_admin(1).await.expect("seed admin");
        let client = reqwest::Client::new();

        let allow = client
            .post(format!("http://{addr}/command/allow"))
            .json(&json!({ "targetUserId": 77 }))
            .send()
            .await
            .expect("allow");
        assert_eq!(allow.status().as_u16(), 200);

        let list = client
            .get(format!("http://{addr}/command/access/list"))
            .send()
            .await
            .expect("list");
        assert_eq!(list.status().as_u16(), 200);
        let payload: Value = list.json().await.expect("json");
        assert_eq!(payload["admins"], json!([1]));
        assert_eq!(payload["allowed"], json!([77]));
    }

    #[tokio::test]
    async fn health_reports_relay_settings_and_failed_probes() {
        let (addr, _store) = spawn_control("health").await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .expect("health");
        assert_eq!(response.status().as_u16(), 200);
        let payload: Value = response.json().await.expect("json");
        assert_eq!(payload["relay"]["mode"], json!("last"));
        assert_eq!(payload["relay"]["fallbackEnabled"], json!(true));
        assert_eq!(payload["relay"]["fallbackDelayMs"], json!(3000));
        // No live backend in tests; the local probe must fail.
        assert_eq!(payload["opencode"]["ok"], json!(false));
        assert!(payload["telegram"].get("ok").is_some());
    }

    #[tokio::test]
    async fn webhook_router_accepts_updates_and_rejects_bad_bodies() {
        let cfg = sample_config();
        let store = SqliteStore::open(temp_db_path("webhook")).await.expect("store");
        let sessions = Arc::new(SessionLinkService::new(
            Arc::clone(&store) as Arc<dyn SessionLinkRepository>,
            "",
        ));
        let bridge = Arc::new(crate::bridge::BridgeService::new(
            Arc::new(OpenCodeClient::new(&cfg)),
            Arc::new(TelegramApi::new(
                &cfg.bot_token,
                cfg.opencode_timeout,
                cfg.polling_interval,
            )) as Arc<dyn crate::ports::InteractiveTelegram>,
            Arc::clone(&store) as Arc<dyn AuthzRepository>,
            Arc::clone(&store) as Arc<dyn SessionModelRepository>,
            sessions,
            cfg.sessions_list_limit,
            cfg.sessions_source,
            cfg.sessions_show_id_list,
            true,
        ));
        let cancel = CancellationToken::new();
        let router = webhook_router("/telegram/webhook", bridge, cancel);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(axum::serve(listener, router).into_future());
        let client = reqwest::Client::new();

        let bad = client
            .post(format!("http://{addr}/telegram/webhook"))
            .body("{not json")
            .send()
            .await
            .expect("bad body request");
        assert_eq!(bad.status().as_u16(), 400);

        // A well-formed update without from/chat ids is dropped silently.
        let ok = client
            .post(format!("http://{addr}/telegram/webhook"))
            .body(r#"{"update_id": 1}"#)
            .send()
            .await
            .expect("empty update request");
        assert_eq!(ok.status().as_u16(), 200);
    }

    #[test]
    fn int64_values_parse_from_numbers_and_strings() {
        assert_eq!(parse_int64_any(Some(&json!(42))), Some(42));
        assert_eq!(parse_int64_any(Some(&json!(42.0))), Some(42));
        assert_eq!(parse_int64_any(Some(&json!("42"))), Some(42));
        assert_eq!(parse_int64_any(Some(&json!(" 42 "))), Some(42));
        assert_eq!(parse_int64_any(Some(&json!(true))), None);
        assert_eq!(parse_int64_any(None), None);
    }
}
