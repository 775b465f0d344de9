use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ports::{InteractiveTelegram, TelegramSender};

const DISPATCH_WORKERS: usize = 8;
const DEFAULT_WEBHOOK_PATH: &str = "/telegram/webhook";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub from: User,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(rename = "callback_data")]
    pub callback_data: String,
}

/// Thin typed client over the Telegram Bot API. Sends are best-effort with
/// no retry; failures surface to the caller as errors to log.
pub struct TelegramApi {
    bot_token: String,
    http: reqwest::Client,
    polling_interval: Duration,
}

impl TelegramApi {
    pub fn new(bot_token: &str, timeout: Duration, polling_interval: Duration) -> Self {
        let polling_interval = if polling_interval.is_zero() {
            Duration::from_secs(2)
        } else {
            polling_interval
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            bot_token: bot_token.to_owned(),
            http,
            polling_interval,
        }
    }

    pub async fn check_connectivity(&self) -> Result<()> {
        self.api("getMe", json!({})).await.map(|_| ())
    }

    /// Long-poll ingestion loop. Each update is dispatched on its own task
    /// behind a fixed-size semaphore so a slow handler cannot stall the poll
    /// but fan-out stays bounded.
    pub async fn poll_updates<H, Fut>(&self, cancel: CancellationToken, handler: H) -> Result<()>
    where
        H: Fn(Update) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let workers = Arc::new(Semaphore::new(DISPATCH_WORKERS));
        let mut offset: i64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let updates = match self.get_updates(&cancel, offset).await {
                Ok(updates) => updates,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(err);
                }
            };

            let batch_empty = updates.is_empty();
            for update in updates {
                if update.update_id >= offset {
                    offset = update.update_id + 1;
                }
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    permit = workers.clone().acquire_owned() => {
                        permit.context("dispatch semaphore closed")?
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler(update).await;
                    drop(permit);
                });
            }

            if batch_empty {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.polling_interval) => {}
                }
            }
        }
    }

    async fn get_updates(&self, cancel: &CancellationToken, offset: i64) -> Result<Vec<Update>> {
        let body = json!({
            "offset": offset,
            "timeout": long_poll_seconds(self.polling_interval),
            "allowed_updates": ["message", "callback_query"],
        });
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            result = self.api("getUpdates", body) => result?,
        };
        serde_json::from_value(result).context("parse getUpdates result")
    }

    pub async fn setup_webhook(&self, webhook_url: &str) -> Result<()> {
        self.api("setWebhook", json!({ "url": webhook_url }))
            .await
            .map(|_| ())
    }

    pub async fn delete_webhook(&self) -> Result<()> {
        self.api("deleteWebhook", json!({ "drop_pending_updates": false }))
            .await
            .map(|_| ())
    }

    pub fn parse_webhook_update(body: &[u8]) -> Result<Update> {
        serde_json::from_slice(body).context("parse webhook update")
    }

    async fn api(&self, method: &str, body: Value) -> Result<Value> {
        let url = format!("https://api.telegram.org/bot{}/{method}", self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("telegram {method} request failed"))?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .with_context(|| format!("telegram {method} body read failed"))?;
        if status.as_u16() >= 400 {
            let detail = if raw.trim().is_empty() {
                format!("telegram status {}", status.as_u16())
            } else {
                raw.trim().to_owned()
            };
            anyhow::bail!("telegram {method} failed: {detail}");
        }
        let payload: Value = serde_json::from_str(&raw)
            .with_context(|| format!("telegram {method} invalid JSON"))?;
        if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let reason = payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("telegram API returned ok=false");
            anyhow::bail!("telegram {method} failed: {reason}");
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl TelegramSender for TelegramApi {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.api("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl InteractiveTelegram for TelegramApi {
    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        self.api(
            "sendChatAction",
            json!({ "chat_id": chat_id, "action": action }),
        )
        .await
        .map(|_| ())
    }

    async fn send_message_with_inline_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        rows: Vec<Vec<InlineKeyboardButton>>,
    ) -> Result<()> {
        self.api(
            "sendMessage",
            json!({
                "chat_id": chat_id,
                "text": text,
                "reply_markup": { "inline_keyboard": rows },
            }),
        )
        .await
        .map(|_| ())
    }

    async fn answer_callback_query(&self, callback_query_id: &str, text: &str) -> Result<()> {
        self.api(
            "answerCallbackQuery",
            json!({
                "callback_query_id": callback_query_id,
                "text": text,
                "show_alert": false,
            }),
        )
        .await
        .map(|_| ())
    }
}

/// Long-poll timeout in seconds, clamped to Telegram's accepted range.
pub fn long_poll_seconds(interval: Duration) -> u64 {
    interval.as_secs().clamp(1, 50)
}

/// Path component of the configured webhook URL, with a stable fallback for
/// unparseable or empty values.
pub fn webhook_path(webhook_url: &str) -> String {
    let Ok(parsed) = Url::parse(webhook_url) else {
        return DEFAULT_WEBHOOK_PATH.to_owned();
    };
    let path = parsed.path().trim();
    if path.is_empty() {
        return DEFAULT_WEBHOOK_PATH.to_owned();
    }
    path.to_owned()
}
