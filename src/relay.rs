use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::RelayMode;
use crate::opencode::{Event, OpenCodeClient};
use crate::ports::{SessionLinkRepository, TelegramSender};

#[derive(Debug, Clone)]
struct RelayCacheEntry {
    text: String,
    is_final: bool,
    #[allow(dead_code)]
    updated: Instant,
}

/// Streaming relay: consumes the backend event stream, caches the latest
/// assistant text per session, and dispatches to every linked chat when the
/// session goes idle. At most one send per recipient per idle event; the
/// cache entry is dropped afterwards either way.
pub struct RelayService {
    opencode: Arc<OpenCodeClient>,
    repo: Arc<dyn SessionLinkRepository>,
    telegram: Arc<dyn TelegramSender>,
    mode: RelayMode,
    fallback: bool,
    fallback_delay: Duration,
    cache: RwLock<HashMap<String, RelayCacheEntry>>,
}

impl RelayService {
    pub fn new(
        opencode: Arc<OpenCodeClient>,
        repo: Arc<dyn SessionLinkRepository>,
        telegram: Arc<dyn TelegramSender>,
        mode: RelayMode,
        fallback: bool,
        fallback_delay: Duration,
    ) -> Self {
        Self {
            opencode,
            repo,
            telegram,
            mode,
            fallback,
            fallback_delay,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (mut events, mut errs) = self.opencode.stream_events(cancel.clone());
        info!("relay stream started (mode={})", self.mode);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                err = errs.recv() => {
                    if let Some(err) = err {
                        return Err(err.into());
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    self.handle_event(&cancel, event).await;
                }
            }
        }
    }

    pub(crate) async fn handle_event(&self, cancel: &CancellationToken, event: Event) {
        if event.session_id.is_empty() {
            return;
        }
        match event.event_type.as_str() {
            "message.updated" => self.update_cache(event).await,
            "session.idle" => self.on_session_idle(cancel, &event.session_id).await,
            _ => {}
        }
    }

    async fn update_cache(&self, event: Event) {
        if event.text.trim().is_empty() {
            return;
        }
        let mut cache = self.cache.write().await;
        cache.insert(
            event.session_id,
            RelayCacheEntry {
                text: event.text,
                is_final: event.is_final,
                updated: Instant::now(),
            },
        );
    }

    async fn on_session_idle(&self, cancel: &CancellationToken, session_id: &str) {
        if self.mode == RelayMode::Last {
            let mut text = self.cached_text(session_id).await;
            if text.is_empty() {
                text = self.fetch_final_text(session_id).await;
            }
            self.dispatch(session_id, &text).await;
            return;
        }

        if let Some(entry) = self.cached_entry(session_id).await {
            if entry.is_final && !entry.text.trim().is_empty() {
                self.dispatch(session_id, &entry.text).await;
                return;
            }
        }

        if !self.fallback {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.fallback_delay) => {}
        }

        let mut text = self.cached_text(session_id).await;
        if text.is_empty() {
            text = self.fetch_final_text(session_id).await;
        }
        self.dispatch(session_id, &text).await;
    }

    async fn dispatch(&self, session_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let recipients = match self.repo.find_recipients_by_session(session_id).await {
            Ok(recipients) => recipients,
            Err(err) => {
                error!("relay recipients lookup failed (session={session_id}): {err}");
                return;
            }
        };
        for recipient in recipients {
            if let Err(err) = self.telegram.send_message(recipient.chat_id, text).await {
                error!(
                    "relay telegram send failed (chat_id={}): {err}",
                    recipient.chat_id
                );
            }
        }
        self.cache.write().await.remove(session_id);
    }

    async fn cached_text(&self, session_id: &str) -> String {
        self.cached_entry(session_id)
            .await
            .map(|entry| entry.text)
            .unwrap_or_default()
    }

    async fn cached_entry(&self, session_id: &str) -> Option<RelayCacheEntry> {
        self.cache.read().await.get(session_id).cloned()
    }

    async fn fetch_final_text(&self, session_id: &str) -> String {
        match self.opencode.get_last_assistant_message(session_id).await {
            Ok(text) => text.trim().to_owned(),
            Err(err) => {
                error!("fetch final text failed (session={session_id}): {err}");
                String::new()
            }
        }
    }

    #[cfg(test)]
    async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::config::test_support::sample_config;
    use crate::domain::ChatRecipient;

    struct FixedRecipients {
        session_id: String,
        recipients: Vec<ChatRecipient>,
    }

    #[async_trait]
    impl SessionLinkRepository for FixedRecipients {
        async fn get_session_link(&self, _chat_id: i64, _user_id: i64) -> Result<Option<String>> {
            Ok(None)
        }

        async fn upsert_session_link(
            &self,
            _chat_id: i64,
            _user_id: i64,
            _session_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn clear_session_link(&self, _chat_id: i64, _user_id: i64) -> Result<()> {
            Ok(())
        }

        async fn find_recipients_by_session(
            &self,
            session_id: &str,
        ) -> Result<Vec<ChatRecipient>> {
            if session_id == self.session_id {
                Ok(self.recipients.clone())
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl TelegramSender for RecordingSender {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().await.push((chat_id, text.to_owned()));
            Ok(())
        }
    }

    fn relay_with(
        sender: Arc<RecordingSender>,
        mode: RelayMode,
        fallback: bool,
        fallback_delay_ms: u64,
    ) -> RelayService {
        let repo = Arc::new(FixedRecipients {
            session_id: "ses_1".to_owned(),
            recipients: vec![ChatRecipient {
                chat_id: 10,
                user_id: 20,
            }],
        });
        RelayService::new(
            Arc::new(OpenCodeClient::new(&sample_config())),
            repo,
            sender,
            mode,
            fallback,
            Duration::from_millis(fallback_delay_ms),
        )
    }

    fn message_updated(text: &str, is_final: bool) -> Event {
        Event {
            event_type: "message.updated".to_owned(),
            session_id: "ses_1".to_owned(),
            text: text.to_owned(),
            is_final,
        }
    }

    fn session_idle() -> Event {
        Event {
            event_type: "session.idle".to_owned(),
            session_id: "ses_1".to_owned(),
            text: String::new(),
            is_final: false,
        }
    }

    #[tokio::test]
    async fn last_mode_sends_cached_message_once_on_idle() {
        let sender = Arc::new(RecordingSender::default());
        let relay = relay_with(Arc::clone(&sender), RelayMode::Last, true, 1);
        let cancel = CancellationToken::new();

        relay
            .handle_event(&cancel, message_updated("hello", false))
            .await;
        relay.handle_event(&cancel, session_idle()).await;

        let sent = sender.sent.lock().await;
        assert_eq!(sent.as_slice(), &[(10, "hello".to_owned())]);
        drop(sent);
        assert_eq!(relay.cache_len().await, 0);
    }

    #[tokio::test]
    async fn final_mode_without_fallback_drops_non_final_draft() {
        let sender = Arc::new(RecordingSender::default());
        let relay = relay_with(Arc::clone(&sender), RelayMode::Final, false, 1);
        let cancel = CancellationToken::new();

        relay
            .handle_event(&cancel, message_updated("draft", false))
            .await;
        relay.handle_event(&cancel, session_idle()).await;

        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn final_mode_with_fallback_sends_draft_after_delay() {
        let sender = Arc::new(RecordingSender::default());
        let relay = relay_with(Arc::clone(&sender), RelayMode::Final, true, 10);
        let cancel = CancellationToken::new();

        relay
            .handle_event(&cancel, message_updated("draft", false))
            .await;
        relay.handle_event(&cancel, session_idle()).await;

        let sent = sender.sent.lock().await;
        assert_eq!(sent.as_slice(), &[(10, "draft".to_owned())]);
    }

    #[tokio::test]
    async fn final_mode_sends_explicit_final_immediately() {
        let sender = Arc::new(RecordingSender::default());
        let relay = relay_with(Arc::clone(&sender), RelayMode::Final, true, 5000);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        relay
            .handle_event(&cancel, message_updated("final text", true))
            .await;
        relay.handle_event(&cancel, session_idle()).await;
        let elapsed = started.elapsed();

        let sent = sender.sent.lock().await;
        assert_eq!(sent.as_slice(), &[(10, "final text".to_owned())]);
        assert!(
            elapsed < Duration::from_secs(1),
            "expected immediate dispatch, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn events_without_session_id_are_ignored() {
        let sender = Arc::new(RecordingSender::default());
        let relay = relay_with(Arc::clone(&sender), RelayMode::Last, true, 1);
        let cancel = CancellationToken::new();

        relay
            .handle_event(
                &cancel,
                Event {
                    event_type: "session.idle".to_owned(),
                    session_id: String::new(),
                    text: String::new(),
                    is_final: false,
                },
            )
            .await;

        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn later_update_overwrites_cached_draft() {
        let sender = Arc::new(RecordingSender::default());
        let relay = relay_with(Arc::clone(&sender), RelayMode::Last, true, 1);
        let cancel = CancellationToken::new();

        relay
            .handle_event(&cancel, message_updated("draft", false))
            .await;
        relay
            .handle_event(&cancel, message_updated("revised", false))
            .await;
        relay.handle_event(&cancel, session_idle()).await;

        let sent = sender.sent.lock().await;
        assert_eq!(sent.as_slice(), &[(10, "revised".to_owned())]);
    }
}
