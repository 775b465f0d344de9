use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::domain::ChatRecipient;
use crate::ports::{AuthzRepository, SessionLinkRepository, SessionModelRepository};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS admins (
    telegram_user_id INTEGER PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS allowed_users (
    telegram_user_id INTEGER PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS session_links (
    telegram_chat_id INTEGER NOT NULL,
    telegram_user_id INTEGER NOT NULL,
    opencode_session_id TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (telegram_chat_id, telegram_user_id)
);
CREATE TABLE IF NOT EXISTS session_models (
    opencode_session_id TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Durable store behind the repository ports. Every call opens a short-lived
/// connection on the blocking pool; the async mutex keeps writers serialized.
pub struct SqliteStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let store = Arc::new(Self {
            path,
            lock: Mutex::new(()),
        });
        store
            .with_conn(|conn| {
                conn.execute_batch(SCHEMA)
                    .context("run schema migrations")?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub async fn seed_from_config(&self, admin_ids: &[i64], allowed_ids: &[i64]) -> Result<()> {
        for user_id in admin_ids {
            self.upsert_admin(*user_id).await?;
        }
        for user_id in allowed_ids {
            self.upsert_allowed(*user_id).await?;
        }
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = Connection::open(&path)
                .with_context(|| format!("open sqlite {}", path.display()))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("set WAL mode")?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .context("enable foreign keys")?;
            op(&conn)
        })
        .await
        .context("sqlite join error")?
    }
}

#[async_trait]
impl AuthzRepository for SqliteStore {
    async fn is_allowed(&self, user_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1
                     FROM (
                         SELECT telegram_user_id FROM allowed_users
                         UNION
                         SELECT telegram_user_id FROM admins
                     )
                     WHERE telegram_user_id = ?1
                     LIMIT 1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .context("query allowed union")?;
            Ok(found.is_some())
        })
        .await
    }

    async fn is_admin(&self, user_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM admins WHERE telegram_user_id = ?1 LIMIT 1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .context("query admins")?;
            Ok(found.is_some())
        })
        .await
    }

    async fn upsert_allowed(&self, user_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO allowed_users (telegram_user_id, created_at)
                 VALUES (?1, datetime('now'))
                 ON CONFLICT(telegram_user_id) DO NOTHING",
                params![user_id],
            )
            .context("upsert allowed user")?;
            Ok(())
        })
        .await
    }

    async fn remove_allowed(&self, user_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM allowed_users WHERE telegram_user_id = ?1",
                params![user_id],
            )
            .context("remove allowed user")?;
            Ok(())
        })
        .await
    }

    async fn upsert_admin(&self, user_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO admins (telegram_user_id, created_at)
                 VALUES (?1, datetime('now'))
                 ON CONFLICT(telegram_user_id) DO NOTHING",
                params![user_id],
            )
            .context("upsert admin")?;
            Ok(())
        })
        .await
    }

    async fn list_allowed(&self) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            list_user_ids(conn, "SELECT telegram_user_id FROM allowed_users ORDER BY telegram_user_id")
        })
        .await
    }

    async fn list_admins(&self) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            list_user_ids(conn, "SELECT telegram_user_id FROM admins ORDER BY telegram_user_id")
        })
        .await
    }
}

fn list_user_ids(conn: &Connection, query: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(query).context("prepare id list query")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .context("query id list")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("read id row")?);
    }
    Ok(out)
}

#[async_trait]
impl SessionLinkRepository for SqliteStore {
    async fn get_session_link(&self, chat_id: i64, user_id: i64) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT opencode_session_id
                 FROM session_links
                 WHERE telegram_chat_id = ?1 AND telegram_user_id = ?2
                 LIMIT 1",
                params![chat_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .context("query session link")
        })
        .await
    }

    async fn upsert_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
        session_id: &str,
    ) -> Result<()> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO session_links
                     (telegram_chat_id, telegram_user_id, opencode_session_id, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(telegram_chat_id, telegram_user_id)
                 DO UPDATE SET
                     opencode_session_id = excluded.opencode_session_id,
                     updated_at = datetime('now')",
                params![chat_id, user_id, session_id],
            )
            .context("upsert session link")?;
            Ok(())
        })
        .await
    }

    async fn clear_session_link(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM session_links
                 WHERE telegram_chat_id = ?1 AND telegram_user_id = ?2",
                params![chat_id, user_id],
            )
            .context("clear session link")?;
            Ok(())
        })
        .await
    }

    async fn find_recipients_by_session(&self, session_id: &str) -> Result<Vec<ChatRecipient>> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT telegram_chat_id, telegram_user_id
                     FROM session_links
                     WHERE opencode_session_id = ?1",
                )
                .context("prepare recipients query")?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok(ChatRecipient {
                        chat_id: row.get(0)?,
                        user_id: row.get(1)?,
                    })
                })
                .context("query recipients")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("read recipient row")?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl SessionModelRepository for SqliteStore {
    async fn get_session_model(&self, session_id: &str) -> Result<Option<String>> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT model FROM session_models WHERE opencode_session_id = ?1 LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .context("query session model")
        })
        .await
    }

    async fn upsert_session_model(&self, session_id: &str, model: &str) -> Result<()> {
        let session_id = session_id.to_owned();
        let model = model.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO session_models (opencode_session_id, model, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(opencode_session_id)
                 DO UPDATE SET
                     model = excluded.model,
                     updated_at = datetime('now')",
                params![session_id, model],
            )
            .context("upsert session model")?;
            Ok(())
        })
        .await
    }

    async fn clear_session_model(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM session_models WHERE opencode_session_id = ?1",
                params![session_id],
            )
            .context("clear session model")?;
            Ok(())
        })
        .await
    }
}
