use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::domain::SessionsSource;
use crate::opencode::{ModelInfo, OpenCodeClient, SessionSummary, StatusReport};
use crate::ports::{AuthzRepository, SessionModelRepository};
use crate::session_link::SessionLinkService;

#[derive(Debug, Clone, Serialize)]
pub struct AccessList {
    pub admins: Vec<i64>,
    pub allowed: Vec<i64>,
}

/// Command operations behind the local HTTP control plane. Same repository
/// and backend surface as the Telegram commands, without the chat framing.
pub struct ControlService {
    authz: Arc<dyn AuthzRepository>,
    sessions: Arc<SessionLinkService>,
    models: Arc<dyn SessionModelRepository>,
    opencode: Arc<OpenCodeClient>,
    list_limit: usize,
    list_source: SessionsSource,
}

impl ControlService {
    pub fn new(
        authz: Arc<dyn AuthzRepository>,
        sessions: Arc<SessionLinkService>,
        models: Arc<dyn SessionModelRepository>,
        opencode: Arc<OpenCodeClient>,
        list_limit: usize,
        list_source: SessionsSource,
    ) -> Self {
        Self {
            authz,
            sessions,
            models,
            opencode,
            list_limit: list_limit.max(1),
            list_source,
        }
    }

    pub async fn status(&self, chat_id: i64, user_id: i64) -> Result<StatusReport> {
        let session_id = self.sessions.get_session(chat_id, user_id).await?;
        Ok(self.opencode.get_status(&session_id).await?)
    }

    pub async fn session_current(&self, chat_id: i64, user_id: i64) -> Result<String> {
        self.sessions.get_session(chat_id, user_id).await
    }

    pub async fn session_list(&self, chat_id: i64, user_id: i64) -> Result<Vec<SessionSummary>> {
        let current = self.sessions.get_session(chat_id, user_id).await?;
        Ok(self
            .opencode
            .list_sessions_with_current(&current, self.list_limit, self.list_source)
            .await?)
    }

    pub async fn session_use(&self, chat_id: i64, user_id: i64, session_id: &str) -> Result<()> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            anyhow::bail!("session id is required");
        }
        self.sessions.set_session(chat_id, user_id, session_id).await
    }

    /// Clears the link and reapplies the configured default when present;
    /// returns the default id (empty when none is configured).
    pub async fn session_new(&self, chat_id: i64, user_id: i64) -> Result<String> {
        self.sessions.clear_session(chat_id, user_id).await?;
        let default_id = self.sessions.default_session_id().to_owned();
        if !default_id.is_empty() {
            self.sessions
                .set_session(chat_id, user_id, &default_id)
                .await?;
        }
        Ok(default_id)
    }

    pub async fn models_list(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.opencode.list_favorite_models().await?)
    }

    pub async fn models_set(&self, chat_id: i64, user_id: i64, model: &str) -> Result<String> {
        let session_id = self.require_session(chat_id, user_id).await?;
        self.models
            .upsert_session_model(&session_id, model.trim())
            .await?;
        Ok(session_id)
    }

    pub async fn models_clear(&self, chat_id: i64, user_id: i64) -> Result<String> {
        let session_id = self.require_session(chat_id, user_id).await?;
        self.models.clear_session_model(&session_id).await?;
        Ok(session_id)
    }

    pub async fn compact(&self, chat_id: i64, user_id: i64) -> Result<String> {
        let session_id = self.require_session(chat_id, user_id).await?;
        self.opencode.compact_session(&session_id).await?;
        Ok(session_id)
    }

    pub async fn allow(&self, target_user_id: i64) -> Result<()> {
        self.authz.upsert_allowed(target_user_id).await
    }

    pub async fn deny(&self, target_user_id: i64) -> Result<()> {
        self.authz.remove_allowed(target_user_id).await
    }

    pub async fn access_list(&self) -> Result<AccessList> {
        Ok(AccessList {
            admins: self.authz.list_admins().await?,
            allowed: self.authz.list_allowed().await?,
        })
    }

    async fn require_session(&self, chat_id: i64, user_id: i64) -> Result<String> {
        let session_id = self.sessions.get_session(chat_id, user_id).await?;
        if session_id.trim().is_empty() {
            anyhow::bail!("no active session");
        }
        Ok(session_id)
    }
}
