use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::{is_valid_session_id, SessionsSource};
use crate::keyed_queue::{Canceled, KeyedQueue};
use crate::opencode::{
    normalize_unix_millis, snapshot_delta, AssistantSnapshot, BackendError, OpenCodeClient,
    SessionSummary,
};
use crate::ports::{AuthzRepository, InteractiveTelegram, SessionModelRepository};
use crate::session_link::SessionLinkService;
use crate::telegram::{CallbackQuery, InlineKeyboardButton, Message, Update};

const WAIT_DEADLINE: Duration = Duration::from_secs(300);
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TYPING_PING_INTERVAL: Duration = Duration::from_secs(4);
const SESSION_BUTTON_MAX_CHARS: usize = 40;

const SESSION_USE_PREFIX: &str = "session_use:";

/// Top-level handler for Telegram updates: routes commands, gates on the
/// numeric-id allowlist, and serializes prompts per (chat, user) so a second
/// message from the same conversation never overtakes the first.
pub struct BridgeService {
    opencode: Arc<OpenCodeClient>,
    telegram: Arc<dyn InteractiveTelegram>,
    authz: Arc<dyn AuthzRepository>,
    models: Arc<dyn SessionModelRepository>,
    sessions: Arc<SessionLinkService>,
    queue: KeyedQueue,
    sessions_list_limit: usize,
    sessions_source: SessionsSource,
    sessions_show_id_list: bool,
    sync_wait: bool,
}

impl BridgeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opencode: Arc<OpenCodeClient>,
        telegram: Arc<dyn InteractiveTelegram>,
        authz: Arc<dyn AuthzRepository>,
        models: Arc<dyn SessionModelRepository>,
        sessions: Arc<SessionLinkService>,
        sessions_list_limit: usize,
        sessions_source: SessionsSource,
        sessions_show_id_list: bool,
        sync_wait: bool,
    ) -> Self {
        Self {
            opencode,
            telegram,
            authz,
            models,
            sessions,
            queue: KeyedQueue::new(),
            sessions_list_limit: sessions_list_limit.max(1),
            sessions_source,
            sessions_show_id_list,
            sync_wait,
        }
    }

    pub async fn handle_update(&self, cancel: &CancellationToken, update: Update) {
        if let Some(query) = update.callback_query {
            self.handle_callback_query(&query).await;
            return;
        }

        let Some(message) = update.message else {
            return;
        };
        if message.from.id == 0 || message.chat.id == 0 {
            return;
        }

        let text = message.text.trim().to_owned();
        if text.is_empty() {
            return;
        }

        if text.starts_with('/') {
            self.handle_command(&message, &text).await;
            return;
        }

        match self.authz.is_allowed(message.from.id).await {
            Ok(true) => {}
            Ok(false) => {
                self.reply(
                    message.chat.id,
                    "No autorizado. Pide acceso al admin con tu userId.",
                )
                .await;
                return;
            }
            Err(err) => {
                error!("auth check failed: {err}");
                return;
            }
        }

        let queue_key = format!("{}:{}", message.chat.id, message.from.id);
        let chat_id = message.chat.id;
        let user_id = message.from.id;
        let outcome = self
            .queue
            .run(&queue_key, cancel, || {
                self.run_prompt_serialized(cancel, chat_id, user_id, text.clone())
            })
            .await;

        if let Err(err) = outcome {
            if cancel.is_cancelled() || err.downcast_ref::<Canceled>().is_some() {
                info!("prompt canceled during shutdown (chat_id={chat_id}, user_id={user_id})");
                return;
            }
            error!("handle prompt failed (chat_id={chat_id}, user_id={user_id}): {err}");
            self.reply(chat_id, user_facing_opencode_error(&err)).await;
        }
    }

    async fn run_prompt_serialized(
        &self,
        cancel: &CancellationToken,
        chat_id: i64,
        user_id: i64,
        prompt: String,
    ) -> Result<()> {
        let session_id = self.sessions.get_session(chat_id, user_id).await?;

        let mut previous_snapshot = AssistantSnapshot::default();
        if !session_id.is_empty() {
            if let Ok(snapshot) = self.opencode.get_assistant_snapshot(&session_id).await {
                previous_snapshot = snapshot;
            }
        }

        let mut model = String::new();
        if !session_id.is_empty() {
            if let Some(stored) = self.models.get_session_model(&session_id).await? {
                model = stored;
            }
        }

        let effective_session_id = self.opencode.run_prompt(&prompt, &session_id, &model).await?;
        if !effective_session_id.is_empty() && effective_session_id != session_id {
            self.sessions
                .set_session(chat_id, user_id, &effective_session_id)
                .await?;
            if !model.trim().is_empty() {
                self.models
                    .upsert_session_model(&effective_session_id, &model)
                    .await?;
            }
        }

        self.telegram
            .send_message(chat_id, "Procesando solicitud...")
            .await?;

        if !self.sync_wait {
            // Streaming relay owns response delivery.
            return Ok(());
        }

        let response = self
            .wait_for_assistant_response(cancel, chat_id, &effective_session_id, previous_snapshot)
            .await?;
        if response.trim().is_empty() {
            self.telegram
                .send_message(chat_id, "OpenCode no devolvio texto en esta respuesta.")
                .await?;
            return Ok(());
        }
        self.telegram.send_message(chat_id, &response).await?;
        Ok(())
    }

    /// Synchronous waiter: polls the assistant snapshot every two seconds
    /// with typing pings every four, until the transcript changes, the
    /// session reaches an idle-like state with text, an error-like state, or
    /// the five-minute deadline.
    async fn wait_for_assistant_response(
        &self,
        cancel: &CancellationToken,
        chat_id: i64,
        session_id: &str,
        previous: AssistantSnapshot,
    ) -> Result<String, BackendError> {
        if session_id.trim().is_empty() {
            return Err(BackendError::Invalid("session id is empty".to_owned()));
        }

        let typing_cancel = CancellationToken::new();
        {
            let telegram = Arc::clone(&self.telegram);
            let typing_cancel = typing_cancel.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = telegram.send_chat_action(chat_id, "typing").await;
                loop {
                    tokio::select! {
                        _ = typing_cancel.cancelled() => return,
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(TYPING_PING_INTERVAL) => {
                            let _ = telegram.send_chat_action(chat_id, "typing").await;
                        }
                    }
                }
            });
        }

        let result = self.wait_loop(cancel, session_id, previous).await;
        typing_cancel.cancel();
        result
    }

    async fn wait_loop(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        previous: AssistantSnapshot,
    ) -> Result<String, BackendError> {
        let started = tokio::time::Instant::now();
        let mut last_snapshot = previous.clone();

        loop {
            if let Ok(now) = self.opencode.get_assistant_snapshot(session_id).await {
                last_snapshot = now.clone();
                if let Some(text) = snapshot_delta(&previous, &now) {
                    return Ok(text);
                }
            }

            if let Ok(state) = self.opencode.get_session_state(session_id).await {
                if is_error_state(&state) {
                    if !last_snapshot.last.trim().is_empty() {
                        return Ok(last_snapshot.last.trim().to_owned());
                    }
                    return Err(BackendError::Failed {
                        status: 0,
                        body: format!("opencode session entered error state: {state}"),
                    });
                }
                if is_idle_state(&state) {
                    if let Ok(snapshot) = self.opencode.get_assistant_snapshot(session_id).await {
                        if !snapshot.last.trim().is_empty() {
                            return Ok(snapshot.last.trim().to_owned());
                        }
                    }
                }
            }

            if started.elapsed() >= WAIT_DEADLINE {
                return Err(BackendError::Timeout);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Canceled),
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    async fn handle_callback_query(&self, query: &CallbackQuery) {
        let Some(message) = &query.message else {
            return;
        };
        let data = query.data.trim();
        if data.is_empty() {
            return;
        }
        let Some(session_id) = data.strip_prefix(SESSION_USE_PREFIX) else {
            let _ = self
                .telegram
                .answer_callback_query(&query.id, "Accion no soportada")
                .await;
            return;
        };

        if !is_valid_session_id(session_id) {
            let _ = self
                .telegram
                .answer_callback_query(&query.id, "Sesion invalida")
                .await;
            return;
        }

        if !self.check_allowed(query.from.id).await {
            let _ = self
                .telegram
                .answer_callback_query(&query.id, "No autorizado")
                .await;
            return;
        }

        if let Err(err) = self
            .sessions
            .set_session(message.chat.id, query.from.id, session_id)
            .await
        {
            error!("set session from callback failed (session={session_id}): {err}");
            let _ = self
                .telegram
                .answer_callback_query(&query.id, "No se pudo cambiar sesion")
                .await;
            return;
        }

        let _ = self
            .telegram
            .answer_callback_query(&query.id, "Sesion seleccionada")
            .await;
        self.reply(
            message.chat.id,
            &format!("Sesion seleccionada: {session_id}"),
        )
        .await;
    }

    async fn handle_command(&self, message: &Message, text: &str) {
        let mut fields = text.split_whitespace();
        let Some(first) = fields.next() else {
            return;
        };
        let name = first.trim_start_matches('/');
        let args: Vec<&str> = fields.collect();

        match name {
            "start" => self.handle_start(message).await,
            "status" => self.handle_status(message).await,
            "compact" => self.handle_compact(message).await,
            "session" => self.handle_session(message, &args).await,
            "sessions" => self.handle_sessions(message).await,
            "models" => self.handle_models(message, &args).await,
            "allow" => self.handle_allow(message, &args).await,
            "deny" => self.handle_deny(message, &args).await,
            "list" => self.handle_list(message).await,
            _ => {
                self.reply(
                    message.chat.id,
                    "Comando no soportado aun. Usa /start /status /session /sessions /compact /models /allow /deny /list.",
                )
                .await;
            }
        }
    }

    async fn handle_start(&self, message: &Message) {
        match self.authz.is_allowed(message.from.id).await {
            Ok(true) => {
                let _ = self
                    .sessions
                    .get_session(message.chat.id, message.from.id)
                    .await;
                self.reply(
                    message.chat.id,
                    "Bot listo. Puedes enviar instrucciones para OpenCode.",
                )
                .await;
            }
            Ok(false) => {
                self.reply(
                    message.chat.id,
                    "No autorizado. Pide a un admin que te agregue por userId.",
                )
                .await;
            }
            Err(err) => error!("auth check failed on start: {err}"),
        }
    }

    async fn handle_status(&self, message: &Message) {
        if !self.require_allowed(message).await {
            return;
        }
        let session_id = match self
            .sessions
            .get_session(message.chat.id, message.from.id)
            .await
        {
            Ok(session_id) => session_id,
            Err(err) => {
                error!("get session for status failed: {err}");
                self.reply(message.chat.id, "No se pudo obtener la sesion actual.")
                    .await;
                return;
            }
        };
        if session_id.is_empty() {
            self.reply(
                message.chat.id,
                "Sin sesion activa. Envia un mensaje para crear una sesion nueva.",
            )
            .await;
            return;
        }

        let report = match self.opencode.get_status(&session_id).await {
            Ok(report) => report,
            Err(err) => {
                error!("status request failed: {err}");
                self.reply(message.chat.id, "No se pudo consultar status de OpenCode.")
                    .await;
                return;
            }
        };
        let model = if report.model.trim().is_empty() {
            "n/d"
        } else {
            report.model.trim()
        };
        let status = if report.status.trim().is_empty() {
            "unknown"
        } else {
            report.status.trim()
        };
        let text = format!(
            "Status OpenCode\n• Sesion: {session_id}\n• Estado: {status}\n• Modelo: {model}"
        );
        self.reply(message.chat.id, &text).await;
    }

    async fn handle_compact(&self, message: &Message) {
        if !self.require_allowed(message).await {
            return;
        }
        let session_id = match self
            .sessions
            .get_session(message.chat.id, message.from.id)
            .await
        {
            Ok(session_id) => session_id,
            Err(err) => {
                error!("get session for compact failed: {err}");
                self.reply(message.chat.id, "No se pudo obtener la sesion actual.")
                    .await;
                return;
            }
        };
        if session_id.is_empty() {
            self.reply(message.chat.id, "No hay sesion activa para compactar.")
                .await;
            return;
        }
        if let Err(err) = self.opencode.compact_session(&session_id).await {
            error!("compact failed (session={session_id}): {err}");
            self.reply(message.chat.id, "No se pudo compactar la sesion.")
                .await;
            return;
        }
        self.reply(message.chat.id, "Sesion compactada.").await;
    }

    async fn handle_sessions(&self, message: &Message) {
        if !self.require_allowed(message).await {
            return;
        }
        let current = match self
            .sessions
            .get_session(message.chat.id, message.from.id)
            .await
        {
            Ok(current) => current,
            Err(err) => {
                error!("get session for sessions failed: {err}");
                self.reply(message.chat.id, "No se pudo obtener la sesion actual.")
                    .await;
                return;
            }
        };
        let list = match self
            .opencode
            .list_sessions_with_current(&current, self.sessions_list_limit, self.sessions_source)
            .await
        {
            Ok(list) => list,
            Err(err) => {
                error!("list sessions failed: {err}");
                self.reply(
                    message.chat.id,
                    "No se pudieron listar sesiones de OpenCode.",
                )
                .await;
                return;
            }
        };
        if list.is_empty() {
            self.reply(message.chat.id, "No hay sesiones disponibles en OpenCode.")
                .await;
            return;
        }

        let mut lines = Vec::with_capacity(list.len() + 1);
        if self.sessions_show_id_list {
            lines.push("Sesiones recientes:".to_owned());
        } else {
            lines.push("Sesiones recientes (toca para seleccionar):".to_owned());
        }
        let mut buttons = Vec::with_capacity(list.len());
        for (index, item) in list.iter().enumerate() {
            let suffix = if item.id == current { " [actual]" } else { "" };
            if self.sessions_show_id_list {
                lines.push(format!(
                    "{}. {} ({}){suffix}",
                    index + 1,
                    item.title,
                    item.id
                ));
            }
            buttons.push(vec![InlineKeyboardButton {
                text: session_button_label(item, &current),
                callback_data: format!("{SESSION_USE_PREFIX}{}", item.id),
            }]);
        }
        let _ = self
            .telegram
            .send_message_with_inline_keyboard(message.chat.id, &lines.join("\n"), buttons)
            .await;
    }

    async fn handle_session(&self, message: &Message, args: &[&str]) {
        if !self.require_allowed(message).await {
            return;
        }
        if args.is_empty() {
            let current = match self
                .sessions
                .get_session(message.chat.id, message.from.id)
                .await
            {
                Ok(current) => current,
                Err(err) => {
                    error!("get session failed: {err}");
                    self.reply(message.chat.id, "No se pudo obtener la sesion actual.")
                        .await;
                    return;
                }
            };
            let shown = if current.is_empty() {
                "(nueva en el proximo mensaje)".to_owned()
            } else {
                current
            };
            self.reply(
                message.chat.id,
                &format!(
                    "Sesion actual: {shown}\nUso: /session list | /session use <ses_...> | /session new"
                ),
            )
            .await;
            return;
        }

        match args[0] {
            "list" => self.handle_sessions(message).await,
            "new" => {
                if let Err(err) = self
                    .sessions
                    .clear_session(message.chat.id, message.from.id)
                    .await
                {
                    error!("clear session failed: {err}");
                    self.reply(message.chat.id, "No se pudo reiniciar la sesion.")
                        .await;
                    return;
                }
                let default_session_id = self.sessions.default_session_id().to_owned();
                if !default_session_id.is_empty() {
                    if let Err(err) = self
                        .sessions
                        .set_session(message.chat.id, message.from.id, &default_session_id)
                        .await
                    {
                        error!("set default session failed: {err}");
                        self.reply(
                            message.chat.id,
                            "Sesion reiniciada, pero no se pudo aplicar la sesion default.",
                        )
                        .await;
                        return;
                    }
                    self.reply(
                        message.chat.id,
                        &format!("Sesion reiniciada. Sesion default: {default_session_id}"),
                    )
                    .await;
                    return;
                }
                self.reply(
                    message.chat.id,
                    "Sesion reiniciada. El proximo mensaje creara una sesion nueva.",
                )
                .await;
            }
            "use" => {
                if args.len() < 2 || !is_valid_session_id(args[1]) {
                    self.reply(message.chat.id, "Uso: /session use <ses_...>")
                        .await;
                    return;
                }
                if let Err(err) = self
                    .sessions
                    .set_session(message.chat.id, message.from.id, args[1])
                    .await
                {
                    error!("set session failed: {err}");
                    self.reply(message.chat.id, "No se pudo cambiar la sesion.")
                        .await;
                    return;
                }
                self.reply(
                    message.chat.id,
                    &format!("Sesion seleccionada: {}", args[1]),
                )
                .await;
            }
            _ => {
                self.reply(
                    message.chat.id,
                    "Accion invalida. Usa /session list | /session use <ses_...> | /session new",
                )
                .await;
            }
        }
    }

    async fn handle_models(&self, message: &Message, args: &[&str]) {
        if !self.require_allowed(message).await {
            return;
        }

        if args.is_empty() || args[0] == "list" {
            let models = match self.opencode.list_favorite_models().await {
                Ok(models) => models,
                Err(err) => {
                    error!("list models failed: {err}");
                    self.reply(
                        message.chat.id,
                        "No se pudieron listar modelos favoritos.",
                    )
                    .await;
                    return;
                }
            };
            if models.is_empty() {
                self.reply(message.chat.id, "No hay modelos favoritos en OpenCode.")
                    .await;
                return;
            }
            let mut lines = vec!["Modelos favoritos:".to_owned()];
            for (index, model) in models.iter().enumerate() {
                let name = if model.name.trim().is_empty() {
                    model.id.as_str()
                } else {
                    model.name.trim()
                };
                lines.push(format!("{}. {name} ({})", index + 1, model.id));
            }
            lines.push("Usa /models set <model-id> o /models clear".to_owned());
            self.reply(message.chat.id, &lines.join("\n")).await;
            return;
        }

        let session_id = match self
            .sessions
            .get_session(message.chat.id, message.from.id)
            .await
        {
            Ok(session_id) => session_id,
            Err(err) => {
                error!("get session for models failed: {err}");
                self.reply(message.chat.id, "No se pudo obtener la sesion actual.")
                    .await;
                return;
            }
        };
        if session_id.is_empty() {
            self.reply(
                message.chat.id,
                "No hay sesion activa. Envia un mensaje primero.",
            )
            .await;
            return;
        }

        match args[0] {
            "set" => {
                let model_id = args.get(1).map(|value| value.trim()).unwrap_or_default();
                if model_id.is_empty() {
                    self.reply(message.chat.id, "Uso: /models set <model-id>")
                        .await;
                    return;
                }
                if let Err(err) = self.models.upsert_session_model(&session_id, model_id).await {
                    error!("set session model failed: {err}");
                    self.reply(message.chat.id, "No se pudo establecer el modelo.")
                        .await;
                    return;
                }
                self.reply(
                    message.chat.id,
                    &format!("Modelo seleccionado: {model_id}"),
                )
                .await;
            }
            "clear" => {
                if let Err(err) = self.models.clear_session_model(&session_id).await {
                    error!("clear session model failed: {err}");
                    self.reply(message.chat.id, "No se pudo limpiar el modelo.")
                        .await;
                    return;
                }
                self.reply(
                    message.chat.id,
                    "Modelo limpiado. Se usara el default de OpenCode.",
                )
                .await;
            }
            _ => {
                self.reply(
                    message.chat.id,
                    "Uso: /models list | /models set <model-id> | /models clear",
                )
                .await;
            }
        }
    }

    async fn handle_allow(&self, message: &Message, args: &[&str]) {
        if !self.require_admin(message).await {
            return;
        }
        let Some(user_id) = args.first().and_then(|raw| parse_telegram_id(raw)) else {
            self.reply(message.chat.id, "Uso: /allow <telegramUserId>")
                .await;
            return;
        };
        if let Err(err) = self.authz.upsert_allowed(user_id).await {
            error!("allow user failed (target_user_id={user_id}): {err}");
            self.reply(message.chat.id, "No se pudo agregar el usuario.")
                .await;
            return;
        }
        self.reply(message.chat.id, &format!("Usuario permitido: {user_id}"))
            .await;
    }

    async fn handle_deny(&self, message: &Message, args: &[&str]) {
        if !self.require_admin(message).await {
            return;
        }
        let Some(user_id) = args.first().and_then(|raw| parse_telegram_id(raw)) else {
            self.reply(message.chat.id, "Uso: /deny <telegramUserId>")
                .await;
            return;
        };
        if let Err(err) = self.authz.remove_allowed(user_id).await {
            error!("deny user failed (target_user_id={user_id}): {err}");
            self.reply(message.chat.id, "No se pudo remover el usuario.")
                .await;
            return;
        }
        self.reply(message.chat.id, &format!("Usuario removido: {user_id}"))
            .await;
    }

    async fn handle_list(&self, message: &Message) {
        if !self.require_admin(message).await {
            return;
        }
        let admins = match self.authz.list_admins().await {
            Ok(admins) => admins,
            Err(err) => {
                error!("list admins failed: {err}");
                self.reply(message.chat.id, "No se pudo listar admins.").await;
                return;
            }
        };
        let allowed = match self.authz.list_allowed().await {
            Ok(allowed) => allowed,
            Err(err) => {
                error!("list allowed failed: {err}");
                self.reply(message.chat.id, "No se pudo listar usuarios permitidos.")
                    .await;
                return;
            }
        };
        let text = format!(
            "Acceso\n• Admins: {}\n• Allowed: {}",
            format_id_list(&admins),
            format_id_list(&allowed)
        );
        self.reply(message.chat.id, &text).await;
    }

    async fn require_allowed(&self, message: &Message) -> bool {
        if self.check_allowed(message.from.id).await {
            return true;
        }
        self.reply(message.chat.id, "No autorizado.").await;
        false
    }

    async fn check_allowed(&self, user_id: i64) -> bool {
        match self.authz.is_allowed(user_id).await {
            Ok(allowed) => allowed,
            Err(err) => {
                error!("auth check failed: {err}");
                false
            }
        }
    }

    async fn require_admin(&self, message: &Message) -> bool {
        match self.authz.is_admin(message.from.id).await {
            Ok(true) => true,
            Ok(false) => {
                self.reply(message.chat.id, "Comando solo para admins.").await;
                false
            }
            Err(err) => {
                error!("admin check failed: {err}");
                false
            }
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.telegram.send_message(chat_id, text).await {
            error!("telegram send failed (chat_id={chat_id}): {err}");
        }
    }
}

fn session_button_label(item: &SessionSummary, current: &str) -> String {
    let time_label = format_session_time_label(&item.updated);
    let title = item.title.trim();
    let mut label = if title.is_empty() {
        time_label
    } else {
        format!("{time_label} {title}")
    };
    if label.chars().count() > SESSION_BUTTON_MAX_CHARS {
        label = label
            .chars()
            .take(SESSION_BUTTON_MAX_CHARS - 3)
            .collect::<String>()
            + "...";
    }
    if item.id == current {
        label = format!("* {label}");
    }
    label
}

/// Local HH:MM label for a session's update stamp; "--:--" for anything
/// unparseable.
fn format_session_time_label(raw: &str) -> String {
    let trimmed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        return "--:--".to_owned();
    }
    let canonical = trimmed
        .replace('•', "·")
        .replace(" ·", " · ")
        .replace("· ", " · ");
    let canonical = canonical.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Ok(unix) = canonical.parse::<i64>() {
        return millis_to_local_label(normalize_unix_millis(unix));
    }
    if let Ok(unix_float) = canonical.parse::<f64>() {
        return millis_to_local_label(normalize_unix_millis(unix_float as i64));
    }
    let upper = canonical.to_uppercase();
    if let Ok(parsed) = NaiveTime::parse_from_str(&upper, "%I:%M %p") {
        return parsed.format("%H:%M").to_string();
    }
    if let Some((clock, _)) = upper.split_once(" · ") {
        if let Ok(parsed) = NaiveTime::parse_from_str(clock.trim(), "%I:%M %p") {
            return parsed.format("%H:%M").to_string();
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&canonical) {
        return parsed.with_timezone(&Local).format("%H:%M").to_string();
    }
    "--:--".to_owned()
}

fn millis_to_local_label(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).earliest() {
        Some(local) => local.format("%H:%M").to_string(),
        None => "--:--".to_owned(),
    }
}

fn parse_telegram_id(value: &str) -> Option<i64> {
    let parsed: i64 = value.trim().parse().ok()?;
    if parsed <= 0 {
        return None;
    }
    Some(parsed)
}

fn format_id_list(items: &[i64]) -> String {
    if items.is_empty() {
        return "(none)".to_owned();
    }
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Conservative Spanish mapping of backend failures; anything unrecognized
/// gets the generic send-failed reply.
fn user_facing_opencode_error(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<BackendError>() {
        Some(BackendError::Unreachable(_)) => {
            "OpenCode no esta disponible. Revisa OPENCODE_SERVER_URL y que el servidor este corriendo."
        }
        Some(BackendError::Unauthorized(_)) => {
            "OpenCode rechazo credenciales. Revisa OPENCODE_SERVER_USERNAME y OPENCODE_SERVER_PASSWORD."
        }
        Some(BackendError::Timeout) => {
            "OpenCode no respondio a tiempo. Revisa OPENCODE_TIMEOUT_MS o la carga del servidor."
        }
        _ => "No se pudo enviar el mensaje a OpenCode.",
    }
}

fn is_idle_state(state: &str) -> bool {
    matches!(
        state.trim().to_ascii_lowercase().as_str(),
        "idle" | "completed" | "done" | "ready"
    )
}

fn is_error_state(state: &str) -> bool {
    let trimmed = state.trim().to_ascii_lowercase();
    trimmed.contains("error") || trimmed.contains("failed") || trimmed.contains("abort")
}
