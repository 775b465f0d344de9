use std::sync::Arc;

use anyhow::Result;

use crate::ports::SessionLinkRepository;

/// Resolves and persists the session a (chat, user) pair talks to. When no
/// link exists and a default session is configured, the default is written
/// through on first read so later reverse lookups see it.
pub struct SessionLinkService {
    repo: Arc<dyn SessionLinkRepository>,
    default_session_id: String,
}

impl SessionLinkService {
    pub fn new(repo: Arc<dyn SessionLinkRepository>, default_session_id: &str) -> Self {
        Self {
            repo,
            default_session_id: default_session_id.trim().to_owned(),
        }
    }

    pub fn default_session_id(&self) -> &str {
        &self.default_session_id
    }

    pub async fn get_session(&self, chat_id: i64, user_id: i64) -> Result<String> {
        if let Some(current) = self.repo.get_session_link(chat_id, user_id).await? {
            return Ok(current);
        }
        if self.default_session_id.is_empty() {
            return Ok(String::new());
        }
        self.repo
            .upsert_session_link(chat_id, user_id, &self.default_session_id)
            .await?;
        Ok(self.default_session_id.clone())
    }

    pub async fn set_session(&self, chat_id: i64, user_id: i64, session_id: &str) -> Result<()> {
        self.repo
            .upsert_session_link(chat_id, user_id, session_id)
            .await
    }

    pub async fn clear_session(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.repo.clear_session_link(chat_id, user_id).await
    }
}
