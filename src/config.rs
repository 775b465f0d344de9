use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::domain::{is_valid_session_id, BotTransport, RelayMode, SessionsSource};

/// Process configuration, read once at startup and passed by value into the
/// services. Nothing here mutates at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub admin_user_ids: Vec<i64>,
    pub allowed_user_ids: Vec<i64>,
    pub bot_transport: BotTransport,
    pub webhook_url: String,
    pub webhook_listen_addr: String,
    pub polling_interval: Duration,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub opencode_server_url: String,
    pub opencode_server_user: String,
    pub opencode_server_pass: String,
    pub opencode_binary: String,
    pub opencode_cli_workdir: String,
    pub opencode_timeout: Duration,
    pub default_session_id: String,
    pub relay_mode: RelayMode,
    pub relay_fallback: bool,
    pub relay_fallback_delay: Duration,
    pub relay_sse_enabled: bool,
    pub sessions_list_limit: usize,
    pub sessions_source: SessionsSource,
    pub sessions_show_id_list: bool,
    pub health_port: u16,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(string_env("DATA_DIR", "./data"));
        let database_path = data_dir.join("bridge.db");

        let cfg = Self {
            bot_token: trimmed_env("BOT_TOKEN"),
            admin_user_ids: id_list_env("ADMIN_USER_IDS")?,
            allowed_user_ids: id_list_env("ALLOWED_USER_IDS")?,
            bot_transport: parse_env("BOT_TRANSPORT")?,
            webhook_url: trimmed_env("WEBHOOK_URL"),
            webhook_listen_addr: string_env("WEBHOOK_LISTEN_ADDR", ":8090"),
            polling_interval: Duration::from_secs(int_env("BOT_POLLING_INTERVAL_SECONDS", 2)?),
            opencode_server_url: string_env("OPENCODE_SERVER_URL", "http://127.0.0.1:4096"),
            opencode_server_user: string_env("OPENCODE_SERVER_USERNAME", "opencode"),
            opencode_server_pass: trimmed_env("OPENCODE_SERVER_PASSWORD"),
            opencode_binary: string_env("OPENCODE_BINARY", "opencode"),
            opencode_cli_workdir: trimmed_env("OPENCODE_CLI_WORKDIR"),
            opencode_timeout: Duration::from_millis(int_env("OPENCODE_TIMEOUT_MS", 120_000)?),
            default_session_id: trimmed_env("DEFAULT_SESSION_ID"),
            relay_mode: parse_env("RELAY_MODE")?,
            relay_fallback: bool_env("RELAY_FALLBACK", true)?,
            relay_fallback_delay: Duration::from_millis(int_env("RELAY_FALLBACK_DELAY_MS", 3000)?),
            relay_sse_enabled: bool_env("RELAY_SSE_ENABLED", false)?,
            sessions_list_limit: int_env("SESSIONS_LIST_LIMIT", 5)?.max(1) as usize,
            sessions_source: parse_env("SESSIONS_SOURCE")?,
            sessions_show_id_list: bool_env("SESSIONS_SHOW_ID_LIST", true)?,
            health_port: int_env("HEALTH_PORT", 4097)?
                .try_into()
                .context("HEALTH_PORT out of range")?,
            log_level: string_env("LOG_LEVEL", "info"),
            data_dir,
            database_path,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.bot_token.is_empty() {
            anyhow::bail!("BOT_TOKEN is required");
        }
        if self.admin_user_ids.is_empty() {
            anyhow::bail!("ADMIN_USER_IDS is required");
        }
        if self.opencode_server_url.trim().is_empty() {
            anyhow::bail!("OPENCODE_SERVER_URL is required");
        }
        if self.bot_transport == BotTransport::Webhook {
            if self.webhook_url.is_empty() {
                anyhow::bail!("WEBHOOK_URL is required when BOT_TRANSPORT=webhook");
            }
            if self.webhook_listen_addr.trim().is_empty() {
                anyhow::bail!("WEBHOOK_LISTEN_ADDR is required when BOT_TRANSPORT=webhook");
            }
        }
        if !self.default_session_id.is_empty() && !is_valid_session_id(&self.default_session_id) {
            anyhow::bail!(
                "DEFAULT_SESSION_ID must match ses_[A-Za-z0-9]+: got {:?}",
                self.default_session_id
            );
        }
        if self.health_port == 0 {
            anyhow::bail!("HEALTH_PORT must be > 0");
        }
        Ok(())
    }
}

fn trimmed_env(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_owned()
}

fn string_env(key: &str, fallback: &str) -> String {
    let value = trimmed_env(key);
    if value.is_empty() {
        fallback.to_owned()
    } else {
        value
    }
}

fn int_env(key: &str, fallback: u64) -> Result<u64> {
    let raw = trimmed_env(key);
    if raw.is_empty() {
        return Ok(fallback);
    }
    raw.parse::<u64>()
        .with_context(|| format!("{key} must be a non-negative integer: got {raw:?}"))
}

fn bool_env(key: &str, fallback: bool) -> Result<bool> {
    let raw = trimmed_env(key);
    if raw.is_empty() {
        return Ok(fallback);
    }
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{key} must be boolean: got {other:?}"),
    }
}

fn parse_env<T>(key: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    trimmed_env(key).parse::<T>().map_err(anyhow::Error::msg)
}

fn id_list_env(key: &str) -> Result<Vec<i64>> {
    parse_id_list(&trimmed_env(key)).with_context(|| format!("parse {key}"))
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let parsed: i64 = item
            .parse()
            .with_context(|| format!("invalid numeric ID {item:?}"))?;
        if parsed <= 0 {
            anyhow::bail!("invalid numeric ID {item:?}");
        }
        out.push(parsed);
    }
    Ok(out)
}
