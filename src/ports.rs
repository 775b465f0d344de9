use anyhow::Result;
use async_trait::async_trait;

use crate::domain::ChatRecipient;
use crate::telegram::InlineKeyboardButton;

/// Authorization decisions are made on numeric Telegram user ids only.
/// An id present only in the admin table still answers `is_allowed = true`.
#[async_trait]
pub trait AuthzRepository: Send + Sync {
    async fn is_allowed(&self, user_id: i64) -> Result<bool>;
    async fn is_admin(&self, user_id: i64) -> Result<bool>;
    async fn upsert_allowed(&self, user_id: i64) -> Result<()>;
    async fn remove_allowed(&self, user_id: i64) -> Result<()>;
    async fn upsert_admin(&self, user_id: i64) -> Result<()>;
    async fn list_allowed(&self) -> Result<Vec<i64>>;
    async fn list_admins(&self) -> Result<Vec<i64>>;
}

#[async_trait]
pub trait SessionLinkRepository: Send + Sync {
    async fn get_session_link(&self, chat_id: i64, user_id: i64) -> Result<Option<String>>;
    async fn upsert_session_link(&self, chat_id: i64, user_id: i64, session_id: &str)
        -> Result<()>;
    async fn clear_session_link(&self, chat_id: i64, user_id: i64) -> Result<()>;
    /// Reverse index: every (chat, user) pair currently linked to the session.
    async fn find_recipients_by_session(&self, session_id: &str) -> Result<Vec<ChatRecipient>>;
}

#[async_trait]
pub trait SessionModelRepository: Send + Sync {
    async fn get_session_model(&self, session_id: &str) -> Result<Option<String>>;
    async fn upsert_session_model(&self, session_id: &str, model: &str) -> Result<()>;
    async fn clear_session_model(&self, session_id: &str) -> Result<()>;
}

/// Minimal outbound surface the relay needs.
#[async_trait]
pub trait TelegramSender: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Full outbound surface the bridge dispatcher needs.
#[async_trait]
pub trait InteractiveTelegram: TelegramSender {
    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()>;
    async fn send_message_with_inline_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        rows: Vec<Vec<InlineKeyboardButton>>,
    ) -> Result<()>;
    async fn answer_callback_query(&self, callback_query_id: &str, text: &str) -> Result<()>;
}
