use std::collections::HashSet;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone};
use futures_util::StreamExt;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::domain::SessionsSource;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SSE_CHANNEL_CAPACITY: usize = 64;

/// Closed failure set for the OpenCode HTTP surface. The bridge maps each
/// variant to a fixed user-facing reply; only `StaleSession` is recovered
/// automatically.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("opencode server unreachable: {0}")]
    Unreachable(String),
    #[error("opencode rejected credentials (status {0})")]
    Unauthorized(u16),
    #[error("opencode request timed out")]
    Timeout,
    #[error("opencode session not found (status 404)")]
    StaleSession,
    #[error("opencode request failed (status {status}): {body}")]
    Failed { status: u16, body: String },
    #[error("opencode response invalid: {0}")]
    Invalid(String),
    #[error("canceled")]
    Canceled,
}

impl BackendError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Unreachable(err.to_string())
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => BackendError::Unauthorized(status.as_u16()),
            404 => BackendError::StaleSession,
            code => {
                let body = if body.trim().is_empty() {
                    format!("opencode status {code}")
                } else {
                    body.trim().to_owned()
                };
                BackendError::Failed { status: code, body }
            }
        }
    }
}

/// One parsed server-sent event from `GET /event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub session_id: String,
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub updated: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub session_id: String,
    pub status: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub favorite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantSnapshot {
    pub count: usize,
    pub last: String,
}

/// Typed wrapper over the OpenCode HTTP API. The bounded client carries the
/// configured per-call timeout; the stream client has none so the event
/// stream can stay open indefinitely.
pub struct OpenCodeClient {
    base_url: String,
    username: String,
    password: String,
    binary: String,
    cli_dir: String,
    timeout: Duration,
    http: reqwest::Client,
    stream: reqwest::Client,
}

impl OpenCodeClient {
    pub fn new(cfg: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.opencode_timeout)
            .build()
            .unwrap_or_default();
        let stream = reqwest::Client::new();
        Self {
            base_url: cfg.opencode_server_url.trim_end_matches('/').to_owned(),
            username: cfg.opencode_server_user.clone(),
            password: cfg.opencode_server_pass.clone(),
            binary: cfg.opencode_binary.clone(),
            cli_dir: cfg.opencode_cli_workdir.clone(),
            timeout: cfg.opencode_timeout,
            http,
            stream,
        }
    }

    pub async fn check_connectivity(&self) -> Result<(), BackendError> {
        self.request(reqwest::Method::GET, "/global/health", None)
            .await
            .map(|_| ())
    }

    /// Submits a prompt, creating a session first when none is given. A 404
    /// on the message post means the stored session died on the server side:
    /// create a fresh one and retry exactly once.
    pub async fn run_prompt(
        &self,
        prompt: &str,
        session_id: &str,
        model: &str,
    ) -> Result<String, BackendError> {
        let mut resolved = session_id.trim().to_owned();
        if resolved.is_empty() {
            resolved = self.create_session().await?;
        }

        let mut body = json!({
            "parts": [{ "type": "text", "text": prompt }],
        });
        if !model.trim().is_empty() {
            body["model"] = Value::String(model.trim().to_owned());
        }

        let path = format!("/session/{resolved}/message");
        match self.request(reqwest::Method::POST, &path, Some(&body)).await {
            Ok(_) => Ok(resolved),
            Err(BackendError::StaleSession) => {
                let fresh = self.create_session().await?;
                let retry_path = format!("/session/{fresh}/message");
                self.request(reqwest::Method::POST, &retry_path, Some(&body))
                    .await?;
                Ok(fresh)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create_session(&self) -> Result<String, BackendError> {
        let payload = self.request(reqwest::Method::POST, "/session", None).await?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_owned();
        if id.is_empty() {
            return Err(BackendError::Invalid(
                "create session returned empty id".to_owned(),
            ));
        }
        Ok(id)
    }

    pub async fn get_last_assistant_message(
        &self,
        session_id: &str,
    ) -> Result<String, BackendError> {
        Ok(self.get_assistant_snapshot(session_id).await?.last)
    }

    /// Walks the session transcript newest to oldest: counts assistant-roled
    /// messages and captures the newest assistant text, falling back to the
    /// newest non-user text when no assistant message carries content.
    pub async fn get_assistant_snapshot(
        &self,
        session_id: &str,
    ) -> Result<AssistantSnapshot, BackendError> {
        let path = format!("/session/{session_id}/message");
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        let messages = payload
            .as_array()
            .ok_or_else(|| BackendError::Invalid("session messages must be an array".to_owned()))?;

        let mut count = 0;
        let mut last = String::new();
        let mut fallback = String::new();
        for message in messages.iter().rev() {
            let Some(message) = message.as_object() else {
                continue;
            };
            let role = first_string(message, &["role"]);
            let text = extract_text(message);
            if fallback.is_empty() && !text.trim().is_empty() && !is_user_role(&role) {
                fallback = text.trim().to_owned();
            }
            if !is_assistant_role(&role) {
                continue;
            }
            count += 1;
            if last.is_empty() && !text.trim().is_empty() {
                last = text.trim().to_owned();
            }
        }
        if last.is_empty() {
            last = fallback;
        }

        Ok(AssistantSnapshot { count, last })
    }

    /// Polls the snapshot until new assistant text shows up: either the
    /// assistant count grew or the newest text changed (trim-compared).
    pub async fn wait_for_assistant_message(
        &self,
        session_id: &str,
        previous: &AssistantSnapshot,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };

        loop {
            let now = self.get_assistant_snapshot(session_id).await?;
            if let Some(text) = snapshot_delta(previous, &now) {
                return Ok(text);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    pub async fn compact_session(&self, session_id: &str) -> Result<(), BackendError> {
        let body = json!({ "command": "compact", "arguments": [] });
        let path = format!("/session/{session_id}/command");
        self.request(reqwest::Method::POST, &path, Some(&body))
            .await
            .map(|_| ())
    }

    /// Lowercased session state from the `/session/status` map, or "unknown"
    /// when the session id is absent.
    pub async fn get_session_state(&self, session_id: &str) -> Result<String, BackendError> {
        if session_id.trim().is_empty() {
            return Ok("unknown".to_owned());
        }
        let payload = self
            .request(reqwest::Method::GET, "/session/status", None)
            .await?;
        let status_map = payload
            .as_object()
            .ok_or_else(|| BackendError::Invalid("session status must be an object".to_owned()))?;
        let Some(item) = status_map.get(session_id).and_then(Value::as_object) else {
            return Ok("unknown".to_owned());
        };
        let mut status = first_string(item, &["type", "status", "state"]);
        if status.is_empty() {
            status = "unknown".to_owned();
        }
        Ok(status.trim().to_ascii_lowercase())
    }

    pub async fn get_status(&self, session_id: &str) -> Result<StatusReport, BackendError> {
        if session_id.trim().is_empty() {
            return Ok(StatusReport {
                session_id: String::new(),
                status: "unknown".to_owned(),
                model: String::new(),
            });
        }

        let status = self.get_session_state(session_id).await?;

        let mut model = String::new();
        let session_path = format!("/session/{session_id}");
        if let Ok(session) = self.request(reqwest::Method::GET, &session_path, None).await {
            if let Some(session) = session.as_object() {
                model = session_model(session);
            }
        }

        Ok(StatusReport {
            session_id: session_id.to_owned(),
            status,
            model,
        })
    }

    /// Merged session listing: endpoint first, CLI entries appended when
    /// their id is new, the current session fetched explicitly when the
    /// merge missed it, sorted by normalized timestamp descending and cut to
    /// `limit`.
    pub async fn list_sessions_with_current(
        &self,
        current_session_id: &str,
        limit: usize,
        source: SessionsSource,
    ) -> Result<Vec<SessionSummary>, BackendError> {
        let limit = limit.max(1);

        let mut sessions: Vec<SessionSummary> = Vec::new();
        if matches!(source, SessionsSource::Endpoint | SessionsSource::Both) {
            match self.list_sessions((limit * 4).max(20)).await {
                Ok(from_endpoint) => sessions.extend(from_endpoint),
                Err(err) if source == SessionsSource::Endpoint => return Err(err),
                Err(err) => debug!("endpoint session listing failed: {err}"),
            }
        }

        if matches!(source, SessionsSource::Cli | SessionsSource::Both) {
            match self.list_sessions_from_cli().await {
                Ok(from_cli) => {
                    let existing: HashSet<String> =
                        sessions.iter().map(|item| item.id.clone()).collect();
                    for item in from_cli {
                        if !existing.contains(&item.id) {
                            sessions.push(item);
                        }
                    }
                }
                Err(err) if source == SessionsSource::Cli => return Err(err),
                Err(err) => debug!("cli session listing failed: {err}"),
            }
        }

        if !current_session_id.is_empty()
            && !sessions.iter().any(|item| item.id == current_session_id)
        {
            let path = format!("/session/{current_session_id}");
            if let Ok(payload) = self.request(reqwest::Method::GET, &path, None).await {
                if let Some(session) = payload.as_object() {
                    sessions.push(session_to_summary(session));
                }
            }
        }

        sessions.sort_by_key(|item| std::cmp::Reverse(parse_timestamp(&item.updated)));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, BackendError> {
        let path = format!("/session?limit={}", limit.max(20));
        let payload = match self.request(reqwest::Method::GET, &path, None).await {
            Ok(payload) => payload,
            Err(_) => self.request(reqwest::Method::GET, "/session", None).await?,
        };
        let items = payload
            .as_array()
            .ok_or_else(|| BackendError::Invalid("session list must be an array".to_owned()))?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let Some(session) = item.as_object() else {
                continue;
            };
            let summary = session_to_summary(session);
            if !summary.id.is_empty() {
                out.push(summary);
            }
        }
        Ok(out)
    }

    /// Spawns `<binary> session list` and parses its tabular stdout: first
    /// column is the session id, a trailing `H:MM AM/PM[ · M/D/YYYY]` column
    /// is the update time, everything between is the title.
    async fn list_sessions_from_cli(&self) -> Result<Vec<SessionSummary>, BackendError> {
        if self.binary.trim().is_empty() {
            return Err(BackendError::Invalid("opencode binary is empty".to_owned()));
        }

        let mut cmd = tokio::process::Command::new(self.binary.trim());
        cmd.args(["session", "list"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if !self.cli_dir.trim().is_empty() {
            cmd.current_dir(self.cli_dir.trim());
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| BackendError::Timeout)?
            .map_err(|err| BackendError::Unreachable(format!("spawn opencode cli: {err}")))?;
        if !output.status.success() {
            return Err(BackendError::Failed {
                status: 0,
                body: format!("opencode cli exited with {}", output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for raw_line in stdout.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with("Session ID") || line.starts_with('─') {
                continue;
            }
            let session_id = first_column(line);
            if !session_id_regex().is_match(&session_id) {
                continue;
            }
            if !seen.insert(session_id.clone()) {
                continue;
            }
            let (title, updated) = parse_cli_session_title_and_updated(line, &session_id);
            rows.push(SessionSummary {
                id: session_id,
                title,
                updated,
            });
        }
        Ok(rows)
    }

    /// Favorite-model discovery chain: `/config` models with favorite=true,
    /// else `/config` favoriteModels strings, else `/config/providers`
    /// favorites prefixed with their provider id.
    pub async fn list_favorite_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        let config = self.request(reqwest::Method::GET, "/config", None).await?;
        let config = config
            .as_object()
            .ok_or_else(|| BackendError::Invalid("config must be an object".to_owned()))?;
        let from_config = extract_favorite_models_from_config(config);
        if !from_config.is_empty() {
            return Ok(from_config);
        }

        let providers = self
            .request(reqwest::Method::GET, "/config/providers", None)
            .await?;
        let providers = providers
            .as_object()
            .ok_or_else(|| BackendError::Invalid("config providers must be an object".to_owned()))?;
        Ok(extract_favorite_models_from_providers(providers))
    }

    /// Opens the server-sent-events endpoint and emits one `Event` per
    /// well-formed payload. Channels close cleanly on cancellation or EOF; a
    /// transport failure while the token is live lands on the error channel.
    pub fn stream_events(
        &self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Event>, mpsc::Receiver<BackendError>) {
        let (events_tx, events_rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
        let (errs_tx, errs_rx) = mpsc::channel(1);

        let url = format!("{}/event", self.base_url);
        let client = self.stream.clone();
        let username = self.username.clone();
        let password = self.password.clone();

        tokio::spawn(async move {
            let request = client
                .get(&url)
                .basic_auth(&username, Some(&password))
                .header("Accept", "text/event-stream");

            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                result = request.send() => result,
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    let _ = errs_tx.send(BackendError::from_transport(err)).await;
                    return;
                }
            };
            if response.status().as_u16() >= 400 {
                let _ = errs_tx
                    .send(BackendError::Failed {
                        status: response.status().as_u16(),
                        body: "opencode event stream rejected".to_owned(),
                    })
                    .await;
                return;
            }

            let mut body = response.bytes_stream();
            let mut line_buffer = String::new();
            let mut data = String::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = body.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        if !cancel.is_cancelled() {
                            let _ = errs_tx.send(BackendError::from_transport(err)).await;
                        }
                        return;
                    }
                    None => return,
                };

                line_buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = line_buffer.find('\n') {
                    let line = line_buffer[..newline].trim_end_matches('\r').to_owned();
                    line_buffer.drain(..=newline);

                    if line.is_empty() {
                        if let Some(event) = parse_sse_data(data.trim()) {
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = events_tx.send(event) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        data.clear();
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("data:") {
                        data.push_str(rest.trim());
                    }
                }
            }
        });

        (events_rx, errs_rx)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(BackendError::from_transport)?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(BackendError::from_transport)?;
        if status.as_u16() >= 400 {
            return Err(BackendError::from_status(status, raw));
        }
        if raw.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&raw).map_err(|err| BackendError::Invalid(err.to_string()))
    }
}

/// True when either the assistant count grew or the newest text changed.
pub fn snapshot_delta(previous: &AssistantSnapshot, now: &AssistantSnapshot) -> Option<String> {
    let last = now.last.trim();
    if last.is_empty() {
        return None;
    }
    if now.count > previous.count || last != previous.last.trim() {
        return Some(last.to_owned());
    }
    None
}

fn session_id_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"ses_[A-Za-z0-9]+").expect("session id regex"))
}

fn cli_updated_suffix_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\d{1,2}:\d{2}\s*(?:am|pm)(?:\s*·\s*\d{1,2}/\d{1,2}/\d{4})?$")
            .expect("cli updated suffix regex")
    })
}

fn columns_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s{2,}").expect("columns regex"))
}

pub fn parse_sse_data(data: &str) -> Option<Event> {
    if data.is_empty() {
        return None;
    }
    let raw: Value = serde_json::from_str(data).ok()?;
    let raw = raw.as_object()?;

    let event_type = first_string(raw, &["type", "event", "name"]);
    if event_type.is_empty() {
        return None;
    }

    let payload = raw
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(raw);

    let session_id = first_string(payload, &["sessionID", "sessionId", "session", "id"]);
    let text = extract_text(payload);

    let mut is_final = payload
        .get("final")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if payload
        .get("isFinal")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        is_final = true;
    }
    let status = first_string(payload, &["status", "state"]);
    if status == "final" || status == "completed" {
        is_final = true;
    }

    Some(Event {
        event_type,
        session_id,
        text: text.trim().to_owned(),
        is_final,
    })
}

fn first_string(raw: &Map<String, Value>, keys: &[&str]) -> String {
    for key in keys {
        if let Some(text) = raw.get(*key).and_then(Value::as_str) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    String::new()
}

/// Message bodies carry either a top-level text field or a `parts[]` array;
/// accept both shapes.
fn extract_text(raw: &Map<String, Value>) -> String {
    let direct = first_string(raw, &["text", "content", "message"]);
    if !direct.is_empty() {
        return direct;
    }

    let Some(parts) = raw.get("parts").and_then(Value::as_array) else {
        return String::new();
    };
    let mut chunks = Vec::with_capacity(parts.len());
    for item in parts {
        let Some(part) = item.as_object() else {
            continue;
        };
        let text = first_string(part, &["text", "content"]);
        if !text.is_empty() {
            chunks.push(text);
        }
    }
    chunks.join("\n")
}

fn session_to_summary(raw: &Map<String, Value>) -> SessionSummary {
    let id = first_string(raw, &["id"]);
    let mut title = first_string(raw, &["title"]);
    if title.is_empty() {
        title = "(untitled)".to_owned();
    }
    let mut updated = String::new();
    if let Some(time_data) = raw.get("time").and_then(Value::as_object) {
        updated = normalize_timestamp_value(time_data.get("updated"));
        if updated.is_empty() {
            updated = normalize_timestamp_value(time_data.get("created"));
        }
    }
    SessionSummary { id, title, updated }
}

/// Model label for `/status`: provider/model of the newest assistant message.
fn session_model(session: &Map<String, Value>) -> String {
    let Some(messages) = session.get("messages").and_then(Value::as_array) else {
        return String::new();
    };
    for msg in messages.iter().rev() {
        let Some(msg) = msg.as_object() else {
            continue;
        };
        if first_string(msg, &["role"]) != "assistant" {
            continue;
        }
        let provider = first_string(msg, &["providerID", "providerId", "provider"]);
        let model = first_string(msg, &["modelID", "modelId", "model"]);
        if !provider.is_empty() && !model.is_empty() {
            return format!("{provider}/{model}");
        }
        if !model.is_empty() {
            return model;
        }
    }
    String::new()
}

/// Normalized milliseconds from any accepted timestamp shape: RFC3339,
/// magnitude-scaled unix integers, or the two CLI table formats. Unknown
/// shapes parse as 0 so they sort last.
pub fn parse_timestamp(value: &str) -> i64 {
    let trimmed = normalize_updated_text(value);
    if trimmed.is_empty() {
        return 0;
    }
    if let Ok(unix) = trimmed.parse::<i64>() {
        return normalize_unix_millis(unix);
    }
    if let Ok(parsed) = NaiveTime::parse_from_str(&trimmed, "%I:%M %p") {
        let today = Local::now().date_naive().and_time(parsed);
        if let Some(local) = Local.from_local_datetime(&today).earliest() {
            return local.timestamp_millis();
        }
        return 0;
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(&trimmed, "%I:%M %p · %m/%d/%Y") {
        return parsed.and_utc().timestamp_millis();
    }
    if let Ok(unix_float) = trimmed.parse::<f64>() {
        return normalize_unix_millis(unix_float as i64);
    }
    match DateTime::parse_from_rfc3339(&trimmed) {
        Ok(parsed) => parsed.timestamp_millis(),
        Err(_) => 0,
    }
}

fn first_column(line: &str) -> String {
    columns_regex()
        .splitn(line.trim(), 2)
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned()
}

pub fn parse_cli_session_title_and_updated(line: &str, session_id: &str) -> (String, String) {
    let remainder = line
        .trim()
        .strip_prefix(session_id)
        .unwrap_or(line.trim())
        .trim();
    if remainder.is_empty() {
        return ("(untitled)".to_owned(), String::new());
    }

    let mut updated = String::new();
    let mut title_part = remainder;
    if let Some(found) = cli_updated_suffix_regex().find(remainder) {
        if found.end() == remainder.len() {
            updated = normalize_updated_text(found.as_str());
            title_part = remainder[..found.start()].trim_end();
        }
    }

    let mut title = title_part.trim().to_owned();
    if title.is_empty() {
        title = "(untitled)".to_owned();
    }
    (title, updated)
}

/// Collapses whitespace, canonicalizes the `·` separator, and uppercases the
/// AM/PM marker so both CLI formats parse with one shape each.
fn normalize_updated_text(value: &str) -> String {
    let mut trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    trimmed = trimmed.replace('•', "·");
    trimmed = trimmed.replace(" ·", " · ").replace("· ", " · ");
    trimmed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some((clock, date)) = trimmed.split_once(" · ") {
        format!("{} · {}", clock.to_uppercase(), date)
    } else {
        trimmed.to_uppercase()
    }
}

/// Scales a raw unix value to milliseconds by magnitude bucket: 10 digits or
/// fewer are seconds, 16+ are nanos, 14-16 are micros, the rest millis.
pub fn normalize_unix_millis(raw: i64) -> i64 {
    let abs = raw.abs();
    if abs < 10_000_000_000 {
        raw.saturating_mul(1000)
    } else if abs > 9_999_999_999_999_999 {
        raw / 1_000_000
    } else if abs > 9_999_999_999_999 {
        raw / 1000
    } else {
        raw
    }
}

fn normalize_timestamp_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.trim().to_owned(),
        Some(Value::Number(num)) => {
            if let Some(int) = num.as_i64() {
                int.to_string()
            } else if let Some(float) = num.as_f64() {
                (float as i64).to_string()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

fn is_assistant_role(role: &str) -> bool {
    role.trim().to_ascii_lowercase().contains("assistant")
}

fn is_user_role(role: &str) -> bool {
    role.trim().to_ascii_lowercase() == "user"
}

fn extract_favorite_models_from_config(payload: &Map<String, Value>) -> Vec<ModelInfo> {
    let entries = extract_model_entries(payload);
    if !entries.is_empty() {
        return entries
            .into_iter()
            .filter(|item| item.favorite && !item.id.trim().is_empty())
            .collect();
    }

    let Some(list) = payload.get("favoriteModels").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| ModelInfo {
            id: text.to_owned(),
            name: text.to_owned(),
            favorite: true,
        })
        .collect()
}

fn extract_favorite_models_from_providers(payload: &Map<String, Value>) -> Vec<ModelInfo> {
    let Some(providers) = payload.get("providers").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut favorites = Vec::new();
    for item in providers {
        let Some(provider) = item.as_object() else {
            continue;
        };
        let provider_id = first_string(provider, &["id"]);
        for model in extract_model_entries(provider) {
            if !model.favorite || model.id.trim().is_empty() {
                continue;
            }
            let id = if !provider_id.is_empty() && !model.id.contains('/') {
                format!("{provider_id}/{}", model.id)
            } else {
                model.id
            };
            let name = if model.name.trim().is_empty() {
                id.clone()
            } else {
                model.name
            };
            favorites.push(ModelInfo {
                id,
                name,
                favorite: true,
            });
        }
    }
    favorites
}

fn extract_model_entries(payload: &Map<String, Value>) -> Vec<ModelInfo> {
    let Some(models) = payload.get("models").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(models.len());
    for item in models {
        let Some(model) = item.as_object() else {
            continue;
        };
        let id = first_string(model, &["id"]);
        if id.is_empty() {
            continue;
        }
        let mut name = first_string(model, &["name"]);
        if name.is_empty() {
            name = id.clone();
        }
        let favorite = model
            .get("favorite")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        out.push(ModelInfo { id, name, favorite });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_session_line_variants() {
        let cases = [
            (
                "ses_39b217c8affe9GAKVHVOQ3zLa0  Comandos integrables con API de opencode                            6:03 PM",
                "ses_39b217c8affe9GAKVHVOQ3zLa0",
                "Comandos integrables con API de opencode",
                "6:03 PM",
            ),
            (
                "ses_39b296c7effec1pavym6BucU4F  Saludo informal / Consulta rápida                                   11:11 PM · 2/15/2026",
                "ses_39b296c7effec1pavym6BucU4F",
                "Saludo informal / Consulta rápida",
                "11:11 PM · 2/15/2026",
            ),
            ("ses_abc123  Titulo sin fecha", "ses_abc123", "Titulo sin fecha", ""),
            ("ses_xyz999", "ses_xyz999", "(untitled)", ""),
        ];
        for (line, session_id, want_title, want_updated) in cases {
            let (title, updated) = parse_cli_session_title_and_updated(line, session_id);
            assert_eq!(title, want_title, "title for {line:?}");
            assert_eq!(updated, want_updated, "updated for {line:?}");
        }
    }

    #[test]
    fn parse_timestamp_accepts_every_documented_shape() {
        for value in [
            "1739714400",
            "1739714400000",
            "1739714400000000",
            "1739714400000000000",
            "2026-02-15T23:11:00Z",
            "6:03 PM",
            "11:11 PM · 2/15/2026",
        ] {
            assert!(parse_timestamp(value) > 0, "expected > 0 for {value:?}");
        }
        assert_eq!(parse_timestamp("not-a-date"), 0);
        assert_eq!(parse_timestamp(""), 0);
    }

    #[test]
    fn parse_timestamp_scales_unix_magnitudes_to_the_same_instant() {
        let seconds = parse_timestamp("1739714400");
        assert_eq!(seconds, parse_timestamp("1739714400000"));
        assert_eq!(seconds, parse_timestamp("1739714400000000"));
        assert_eq!(seconds, parse_timestamp("1739714400000000000"));
    }

    #[test]
    fn normalize_unix_millis_by_magnitude() {
        assert_eq!(normalize_unix_millis(1_739_714_400), 1_739_714_400_000);
        assert_eq!(normalize_unix_millis(1_739_714_400_000), 1_739_714_400_000);
        assert_eq!(
            normalize_unix_millis(1_739_714_400_000_000),
            1_739_714_400_000
        );
        assert_eq!(
            normalize_unix_millis(1_739_714_400_000_000_000),
            1_739_714_400_000
        );
    }

    #[test]
    fn sse_payload_round_trips_session_and_text() {
        let event = parse_sse_data(
            r#"{"type":"message.updated","data":{"sessionID":"ses_1","text":"  hola  "}}"#,
        )
        .expect("event");
        assert_eq!(event.event_type, "message.updated");
        assert_eq!(event.session_id, "ses_1");
        assert_eq!(event.text, "hola");
        assert!(!event.is_final);
    }

    #[test]
    fn sse_final_flag_comes_from_any_marker() {
        let by_flag = parse_sse_data(
            r#"{"type":"message.updated","data":{"sessionId":"ses_1","text":"x","final":true}}"#,
        )
        .expect("final flag");
        assert!(by_flag.is_final);

        let by_is_final = parse_sse_data(
            r#"{"type":"message.updated","data":{"session":"ses_1","text":"x","isFinal":true}}"#,
        )
        .expect("isFinal flag");
        assert!(by_is_final.is_final);

        let by_status = parse_sse_data(
            r#"{"type":"message.updated","data":{"id":"ses_1","text":"x","status":"completed"}}"#,
        )
        .expect("status marker");
        assert!(by_status.is_final);
    }

    #[test]
    fn sse_rejects_payloads_without_a_type() {
        assert!(parse_sse_data("").is_none());
        assert!(parse_sse_data("not json").is_none());
        assert!(parse_sse_data(r#"{"data":{"sessionID":"ses_1"}}"#).is_none());
    }

    #[test]
    fn extract_text_prefers_top_level_then_joins_parts() {
        let top_level: Value = serde_json::from_str(r#"{"text":"direct"}"#).expect("json");
        assert_eq!(extract_text(top_level.as_object().expect("map")), "direct");

        let parts: Value = serde_json::from_str(
            r#"{"parts":[{"type":"text","text":"uno"},{"type":"text","content":"dos"},{"type":"tool"}]}"#,
        )
        .expect("json");
        assert_eq!(extract_text(parts.as_object().expect("map")), "uno\ndos");
    }

    #[test]
    fn snapshot_delta_detects_count_growth_and_text_change() {
        let previous = AssistantSnapshot {
            count: 1,
            last: "hola".to_owned(),
        };
        let grown = AssistantSnapshot {
            count: 2,
            last: "nueva respuesta".to_owned(),
        };
        assert_eq!(
            snapshot_delta(&previous, &grown).as_deref(),
            Some("nueva respuesta")
        );

        let changed = AssistantSnapshot {
            count: 1,
            last: "otra".to_owned(),
        };
        assert_eq!(snapshot_delta(&previous, &changed).as_deref(), Some("otra"));

        let same = AssistantSnapshot {
            count: 1,
            last: " hola ".to_owned(),
        };
        assert_eq!(snapshot_delta(&previous, &same), None);

        let empty = AssistantSnapshot {
            count: 5,
            last: "   ".to_owned(),
        };
        assert_eq!(snapshot_delta(&previous, &empty), None);
    }

    #[test]
    fn favorite_models_prefer_config_entries() {
        let config: Value = serde_json::from_str(
            r#"{"models":[{"id":"a","name":"Model A","favorite":true},{"id":"b","favorite":false}]}"#,
        )
        .expect("json");
        let models = extract_favorite_models_from_config(config.as_object().expect("map"));
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "a");
        assert_eq!(models[0].name, "Model A");
    }

    #[test]
    fn favorite_models_lift_plain_string_list() {
        let config: Value =
            serde_json::from_str(r#"{"favoriteModels":["provider/x"," ",""]}"#).expect("json");
        let models = extract_favorite_models_from_config(config.as_object().expect("map"));
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "provider/x");
        assert_eq!(models[0].name, "provider/x");
        assert!(models[0].favorite);
    }

    #[test]
    fn favorite_models_from_providers_prefix_provider_id() {
        let providers: Value = serde_json::from_str(
            r#"{"providers":[
                {"id":"anthropic","models":[{"id":"claude","favorite":true},{"id":"other"}]},
                {"id":"openai","models":[{"id":"openai/gpt","favorite":true}]}
            ]}"#,
        )
        .expect("json");
        let models = extract_favorite_models_from_providers(providers.as_object().expect("map"));
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "anthropic/claude");
        assert_eq!(models[1].id, "openai/gpt");
    }

    #[test]
    fn session_model_reads_newest_assistant_provider_pair() {
        let session: Value = serde_json::from_str(
            r#"{"messages":[
                {"role":"assistant","providerID":"old","modelID":"m0"},
                {"role":"user","text":"hi"},
                {"role":"assistant","providerID":"anthropic","modelID":"claude"}
            ]}"#,
        )
        .expect("json");
        assert_eq!(
            session_model(session.as_object().expect("map")),
            "anthropic/claude"
        );
    }

    #[test]
    fn first_column_splits_on_double_spaces() {
        assert_eq!(first_column("ses_a  title here  6:03 PM"), "ses_a");
        assert_eq!(first_column("  ses_b  x"), "ses_b");
        assert_eq!(first_column("single"), "single");
    }

    mod http {
        use std::future::IntoFuture;
        use std::net::SocketAddr;

        use axum::http::StatusCode;
        use axum::routing::{get, post};
        use axum::{Json, Router};

        use super::*;
        use crate::config::test_support::sample_config;

        async fn spawn_backend(router: Router) -> SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind fake backend");
            let addr = listener.local_addr().expect("local addr");
            tokio::spawn(axum::serve(listener, router).into_future());
            addr
        }

        fn client_for(addr: SocketAddr) -> OpenCodeClient {
            let mut cfg = sample_config();
            cfg.opencode_server_url = format!("http://{addr}");
            cfg.opencode_timeout = Duration::from_secs(5);
            OpenCodeClient::new(&cfg)
        }

        #[tokio::test]
        async fn run_prompt_creates_a_session_when_none_is_given() {
            let router = Router::new()
                .route("/session", post(|| async { Json(json!({ "id": "ses_A" })) }))
                .route(
                    "/session/:id/message",
                    post(|| async { Json(json!({})) }),
                );
            let client = client_for(spawn_backend(router).await);

            let session = client.run_prompt("hola", "", "").await.expect("prompt");
            assert_eq!(session, "ses_A");
        }

        #[tokio::test]
        async fn run_prompt_retries_once_on_a_stale_session() {
            let router = Router::new()
                .route("/session", post(|| async { Json(json!({ "id": "ses_B" })) }))
                .route(
                    "/session/:id/message",
                    post(
                        |axum::extract::Path(id): axum::extract::Path<String>| async move {
                            if id == "ses_OLD" {
                                (StatusCode::NOT_FOUND, Json(json!({})))
                            } else {
                                (StatusCode::OK, Json(json!({})))
                            }
                        },
                    ),
                );
            let client = client_for(spawn_backend(router).await);

            let session = client
                .run_prompt("hola", "ses_OLD", "model-x")
                .await
                .expect("prompt");
            assert_eq!(session, "ses_B");
        }

        #[tokio::test]
        async fn create_session_rejects_an_empty_id() {
            let router = Router::new()
                .route("/session", post(|| async { Json(json!({ "id": "" })) }));
            let client = client_for(spawn_backend(router).await);

            let err = client.create_session().await.expect_err("empty id");
            assert!(matches!(err, BackendError::Invalid(_)));
        }

        #[tokio::test]
        async fn unauthorized_status_maps_to_the_credentials_error() {
            let router = Router::new().route(
                "/session",
                post(|| async { (StatusCode::UNAUTHORIZED, Json(json!({}))) }),
            );
            let client = client_for(spawn_backend(router).await);

            let err = client.create_session().await.expect_err("unauthorized");
            assert!(matches!(err, BackendError::Unauthorized(401)));
        }

        #[tokio::test]
        async fn snapshot_counts_assistants_and_uses_non_user_fallback() {
            let router = Router::new().route(
                "/session/:id/message",
                get(|| async {
                    Json(json!([
                        { "role": "user", "text": "pregunta" },
                        { "role": "system", "text": "system note" },
                        { "role": "assistant", "parts": [] },
                        { "role": "assistant", "parts": [{ "type": "tool" }] }
                    ]))
                }),
            );
            let client = client_for(spawn_backend(router).await);

            let snapshot = client
                .get_assistant_snapshot("ses_X")
                .await
                .expect("snapshot");
            // Two assistant messages, neither with text: the newest non-user
            // text wins as the fallback.
            assert_eq!(snapshot.count, 2);
            assert_eq!(snapshot.last, "system note");
        }

        #[tokio::test]
        async fn wait_for_assistant_message_returns_on_first_delta() {
            let router = Router::new().route(
                "/session/:id/message",
                get(|| async {
                    Json(json!([
                        { "role": "assistant", "parts": [{ "type": "text", "text": " hola " }] }
                    ]))
                }),
            );
            let client = client_for(spawn_backend(router).await);
            let cancel = CancellationToken::new();

            let text = client
                .wait_for_assistant_message(
                    "ses_X",
                    &AssistantSnapshot::default(),
                    Duration::from_millis(10),
                    &cancel,
                )
                .await
                .expect("wait");
            assert_eq!(text, "hola");
        }

        #[tokio::test]
        async fn wait_for_assistant_message_honors_cancellation() {
            let router = Router::new().route(
                "/session/:id/message",
                get(|| async { Json(json!([])) }),
            );
            let client = client_for(spawn_backend(router).await);
            let cancel = CancellationToken::new();
            cancel.cancel();

            let err = client
                .wait_for_assistant_message(
                    "ses_X",
                    &AssistantSnapshot::default(),
                    Duration::from_millis(10),
                    &cancel,
                )
                .await
                .expect_err("canceled");
            assert!(matches!(err, BackendError::Canceled));
        }

        #[tokio::test]
        async fn get_status_combines_state_and_model_label() {
            let router = Router::new()
                .route(
                    "/session/status",
                    get(|| async { Json(json!({ "ses_X": { "type": "Idle" } })) }),
                )
                .route(
                    "/session/:id",
                    get(|| async {
                        Json(json!({
                            "messages": [
                                { "role": "assistant", "providerID": "anthropic", "modelID": "claude" }
                            ]
                        }))
                    }),
                );
            let client = client_for(spawn_backend(router).await);

            let report = client.get_status("ses_X").await.expect("status");
            assert_eq!(report.session_id, "ses_X");
            assert_eq!(report.status, "idle");
            assert_eq!(report.model, "anthropic/claude");

            let empty = client.get_status("").await.expect("empty session");
            assert_eq!(empty.status, "unknown");
        }

        #[tokio::test]
        async fn session_state_is_unknown_for_absent_sessions() {
            let router = Router::new().route(
                "/session/status",
                get(|| async { Json(json!({ "ses_other": { "type": "busy" } })) }),
            );
            let client = client_for(spawn_backend(router).await);

            assert_eq!(
                client.get_session_state("ses_X").await.expect("state"),
                "unknown"
            );
            assert_eq!(
                client
                    .get_session_state("ses_other")
                    .await
                    .expect("state"),
                "busy"
            );
        }

        #[tokio::test]
        async fn list_sessions_appends_the_missing_current_and_sorts_by_update() {
            let router = Router::new()
                .route(
                    "/session",
                    get(|| async {
                        Json(json!([
                            { "id": "ses_old", "title": "vieja", "time": { "updated": 1_700_000_000_000_i64 } },
                            { "id": "ses_new", "title": "nueva", "time": { "updated": 1_800_000_000_000_i64 } }
                        ]))
                    }),
                )
                .route(
                    "/session/:id",
                    get(|| async {
                        Json(json!({
                            "id": "ses_current",
                            "title": "actual",
                            "time": { "updated": 1_750_000_000_000_i64 }
                        }))
                    }),
                );
            let client = client_for(spawn_backend(router).await);

            let list = client
                .list_sessions_with_current("ses_current", 5, SessionsSource::Endpoint)
                .await
                .expect("list");
            let ids: Vec<&str> = list.iter().map(|item| item.id.as_str()).collect();
            assert_eq!(ids, vec!["ses_new", "ses_current", "ses_old"]);
        }

        #[tokio::test]
        async fn favorite_models_fall_back_to_the_providers_endpoint() {
            let router = Router::new()
                .route("/config", get(|| async { Json(json!({})) }))
                .route(
                    "/config/providers",
                    get(|| async {
                        Json(json!({
                            "providers": [
                                { "id": "anthropic", "models": [{ "id": "claude", "favorite": true }] }
                            ]
                        }))
                    }),
                );
            let client = client_for(spawn_backend(router).await);

            let models = client.list_favorite_models().await.expect("models");
            assert_eq!(models.len(), 1);
            assert_eq!(models[0].id, "anthropic/claude");
        }

        #[tokio::test]
        async fn stream_events_parses_sse_frames_and_closes_on_eof() {
            let router = Router::new().route(
                "/event",
                get(|| async {
                    (
                        [("content-type", "text/event-stream")],
                        concat!(
                            "data: {\"type\":\"message.updated\",",
                            "\"data\":{\"sessionID\":\"ses_1\",\"text\":\"hola\"}}\n",
                            "\n",
                            "data: {\"type\":\"session.idle\",",
                            "\"data\":{\"sessionID\":\"ses_1\"}}\n",
                            "\n"
                        ),
                    )
                }),
            );
            let client = client_for(spawn_backend(router).await);
            let cancel = CancellationToken::new();

            let (mut events, _errs) = client.stream_events(cancel);
            let first = events.recv().await.expect("first event");
            assert_eq!(first.event_type, "message.updated");
            assert_eq!(first.session_id, "ses_1");
            assert_eq!(first.text, "hola");
            let second = events.recv().await.expect("second event");
            assert_eq!(second.event_type, "session.idle");
            assert!(events.recv().await.is_none());
        }
    }
}
