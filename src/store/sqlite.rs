// src/store/sqlite.rs — SQLite backend behind a single-connection actor
//
// The connection is owned by a dedicated thread. Callers send closures over
// an mpsc channel and await the result on a oneshot, so statements are
// serialised without holding a lock across await points.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

use super::schema;
use super::{
    now_timestamp, normalize_email, timestamp, ChatStore, Conversation, ConversationUpdate,
    ListOptions, Message, NewMessage, NewUser, ProviderUsage, Session, StoredKey, UsageStats,
    User, UserUpdate,
};
use crate::infra::errors::ChatHubError;
use crate::provider::{Provider, Role};
use crate::store::AuthType;

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<Job>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Self::spawn(conn)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Self::spawn(conn)
    }

    fn spawn(mut conn: Connection) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(100);
        std::thread::Builder::new()
            .name("chathub-store".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&mut conn);
                }
                tracing::debug!("Store actor shutting down");
            })?;
        Ok(Self { tx })
    }

    async fn call<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (resp_tx, resp_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = resp_tx.send(f(conn));
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow!("store actor has shut down"))?;
        resp_rx
            .await
            .map_err(|_| anyhow!("store actor dropped the reply"))?
    }
}

// ─── Row mapping ────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, email, name, password_hash, auth_type, picture_url, is_active,
     created_at, updated_at, last_login_at";

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let auth_type: String = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_hash: row.get(3)?,
        auth_type: AuthType::parse(&auth_type),
        picture_url: row.get(5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        last_login_at: row.get(9)?,
    })
}

const CONVERSATION_COLUMNS: &str = "id, user_id, title, provider, model, is_archived, is_pinned,
     total_messages, total_tokens, total_cost, created_at, updated_at";

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        is_archived: row.get(5)?,
        is_pinned: row.get(6)?,
        total_messages: row.get(7)?,
        total_tokens: row.get(8)?,
        total_cost: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, provider, model,
     input_tokens, output_tokens, total_tokens, cost, is_error, error_message, created_at";

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let role = Role::parse(&role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role '{role}'").into(),
        )
    })?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        provider: row.get(4)?,
        model: row.get(5)?,
        input_tokens: row.get(6)?,
        output_tokens: row.get(7)?,
        total_tokens: row.get(8)?,
        cost: row.get(9)?,
        is_error: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
    })
}

// ─── Queries ────────────────────────────────────────────────────

fn select_user(conn: &Connection, clause: &str, arg: &str) -> anyhow::Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}");
    Ok(conn.query_row(&sql, [arg], row_to_user).optional()?)
}

fn select_conversation(conn: &Connection, id: &str) -> anyhow::Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_conversation).optional()?)
}

fn insert_user(conn: &Connection, user: &User) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO users (id, email, name, password_hash, auth_type, picture_url, is_active,
                            created_at, updated_at, last_login_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            user.id,
            user.email,
            user.name,
            user.password_hash,
            user.auth_type.as_str(),
            user.picture_url,
            user.is_active,
            user.created_at,
            user.updated_at,
            user.last_login_at,
        ],
    )?;
    Ok(())
}

fn insert_message(
    conn: &mut Connection,
    conversation_id: &str,
    msg: NewMessage,
) -> anyhow::Result<Message> {
    let tx = conn.transaction()?;

    let exists: bool = tx
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            [conversation_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !exists {
        return Err(anyhow!("conversation {} not found", conversation_id));
    }

    let now = now_timestamp();
    tx.execute(
        "INSERT INTO messages (conversation_id, role, content, provider, model, input_tokens,
                               output_tokens, total_tokens, cost, is_error, error_message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            conversation_id,
            msg.role.as_str(),
            msg.content,
            msg.provider,
            msg.model,
            msg.usage.input_tokens,
            msg.usage.output_tokens,
            msg.usage.total(),
            msg.cost,
            msg.is_error(),
            msg.error_message,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();

    tx.execute(
        "UPDATE conversations
         SET total_messages = total_messages + 1,
             total_tokens = total_tokens + ?2,
             total_cost = total_cost + ?3,
             updated_at = ?4
         WHERE id = ?1",
        params![conversation_id, msg.usage.total(), msg.cost, now],
    )?;
    tx.commit()?;

    Ok(msg.into_message(id, conversation_id, now))
}

fn list_conversations(
    conn: &Connection,
    user_id: &str,
    opts: &ListOptions,
) -> anyhow::Result<Vec<Conversation>> {
    // SQLite's lower() and LIKE only fold ASCII and treat % and _ as
    // wildcards, so title search runs on the Rust side like the file backend.
    let searching = opts
        .search
        .as_deref()
        .is_some_and(|q| !q.trim().is_empty());
    let limit = if searching { -1 } else { opts.limit() as i64 };

    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE user_id = ?1
           AND (?2 OR is_archived = 0)
         ORDER BY updated_at DESC, created_at DESC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![user_id, opts.include_archived, limit],
            row_to_conversation,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    if !searching {
        return Ok(rows);
    }
    Ok(rows
        .into_iter()
        .filter(|c| c.matches(opts))
        .take(opts.limit())
        .collect())
}

fn usage_stats(conn: &Connection, user_id: &str) -> anyhow::Result<UsageStats> {
    let stats = conn.query_row(
        "SELECT COUNT(DISTINCT c.id), COUNT(m.id),
                COALESCE(SUM(m.input_tokens), 0), COALESCE(SUM(m.output_tokens), 0),
                COALESCE(SUM(m.total_tokens), 0), COALESCE(SUM(m.cost), 0.0)
         FROM messages m JOIN conversations c ON m.conversation_id = c.id
         WHERE c.user_id = ?1 AND m.role = 'assistant'",
        [user_id],
        |r| {
            Ok(UsageStats {
                total_conversations: r.get(0)?,
                total_messages: r.get(1)?,
                total_input_tokens: r.get(2)?,
                total_output_tokens: r.get(3)?,
                total_tokens: r.get(4)?,
                total_cost: r.get(5)?,
            })
        },
    )?;
    Ok(stats)
}

fn provider_usage(
    conn: &Connection,
    user_id: &str,
) -> anyhow::Result<BTreeMap<String, ProviderUsage>> {
    let mut stmt = conn.prepare(
        "SELECT c.provider, COUNT(DISTINCT c.id), COUNT(m.id),
                COALESCE(SUM(m.input_tokens), 0), COALESCE(SUM(m.output_tokens), 0),
                COALESCE(SUM(m.total_tokens), 0), COALESCE(SUM(m.cost), 0.0)
         FROM conversations c JOIN messages m ON m.conversation_id = c.id
         WHERE c.user_id = ?1 AND m.role = 'assistant'
         GROUP BY c.provider",
    )?;
    let rows = stmt.query_map([user_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            ProviderUsage {
                conversations: r.get(1)?,
                messages: r.get(2)?,
                input_tokens: r.get(3)?,
                output_tokens: r.get(4)?,
                total_tokens: r.get(5)?,
                cost: r.get(6)?,
            },
        ))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (provider, usage) = row?;
        out.insert(provider, usage);
    }
    Ok(out)
}

// ─── ChatStore ──────────────────────────────────────────────────

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_user(&self, user: NewUser) -> anyhow::Result<User> {
        let user = user.build();
        self.call(move |conn| {
            if select_user(conn, "email = ?1", &user.email)?.is_some() {
                return Err(ChatHubError::EmailTaken.into());
            }
            insert_user(conn, &user)?;
            Ok(user)
        })
        .await
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        let id = id.to_string();
        self.call(move |conn| select_user(conn, "id = ?1", &id))
            .await
    }

    async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let email = normalize_email(email);
        self.call(move |conn| select_user(conn, "email = ?1", &email))
            .await
    }

    async fn update_user(&self, id: &str, update: UserUpdate) -> anyhow::Result<Option<User>> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET name = COALESCE(?2, name),
                                  picture_url = COALESCE(?3, picture_url),
                                  updated_at = ?4
                 WHERE id = ?1",
                params![id, update.name, update.picture_url, now_timestamp()],
            )?;
            select_user(conn, "id = ?1", &id)
        })
        .await
    }

    async fn record_login(&self, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET last_login_at = ?2 WHERE id = ?1",
                params![id, now_timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_api_key(
        &self,
        user_id: &str,
        provider: Provider,
        encrypted_key: &str,
    ) -> anyhow::Result<()> {
        let user_id = user_id.to_string();
        let encrypted_key = encrypted_key.to_string();
        self.call(move |conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO api_keys (user_id, provider, encrypted_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id, provider)
                 DO UPDATE SET encrypted_key = excluded.encrypted_key,
                               updated_at = excluded.updated_at",
                params![user_id, provider.as_str(), encrypted_key, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_api_key(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Option<String>> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT encrypted_key FROM api_keys WHERE user_id = ?1 AND provider = ?2",
                    params![user_id, provider.as_str()],
                    |r| r.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn list_api_keys(&self, user_id: &str) -> anyhow::Result<Vec<StoredKey>> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, encrypted_key, created_at, updated_at, last_used_at
                 FROM api_keys WHERE user_id = ?1 ORDER BY provider",
            )?;
            let rows = stmt
                .query_map([&user_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, Option<String>>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .filter_map(|(provider, encrypted_key, created_at, updated_at, last_used_at)| {
                    Some(StoredKey {
                        provider: provider.parse().ok()?,
                        encrypted_key,
                        created_at,
                        updated_at,
                        last_used_at,
                    })
                })
                .collect())
        })
        .await
    }

    async fn touch_api_key(&self, user_id: &str, provider: Provider) -> anyhow::Result<()> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?3 WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str(), now_timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        provider: &str,
        model: &str,
    ) -> anyhow::Result<Conversation> {
        let conv = Conversation::new(user_id, title, provider, model);
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, provider, model, is_archived,
                                            is_pinned, total_messages, total_tokens, total_cost,
                                            created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, 0, 0.0, ?6, ?7)",
                params![
                    conv.id,
                    conv.user_id,
                    conv.title,
                    conv.provider,
                    conv.model,
                    conv.created_at,
                    conv.updated_at,
                ],
            )?;
            Ok(conv)
        })
        .await
    }

    async fn get_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let id = id.to_string();
        self.call(move |conn| select_conversation(conn, &id)).await
    }

    async fn list_conversations(
        &self,
        user_id: &str,
        opts: ListOptions,
    ) -> anyhow::Result<Vec<Conversation>> {
        let user_id = user_id.to_string();
        self.call(move |conn| list_conversations(conn, &user_id, &opts))
            .await
    }

    async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> anyhow::Result<Option<Conversation>> {
        let id = id.to_string();
        self.call(move |conn| {
            let Some(mut conv) = select_conversation(conn, &id)? else {
                return Ok(None);
            };
            if conv.apply(&update) {
                conn.execute(
                    "UPDATE conversations
                     SET title = ?2, provider = ?3, model = ?4, is_archived = ?5,
                         is_pinned = ?6, updated_at = ?7
                     WHERE id = ?1",
                    params![
                        conv.id,
                        conv.title,
                        conv.provider,
                        conv.model,
                        conv.is_archived,
                        conv.is_pinned,
                        conv.updated_at,
                    ],
                )?;
            }
            Ok(Some(conv))
        })
        .await
    }

    async fn delete_conversation(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM conversations WHERE id = ?1", [&id])?;
            Ok(n > 0)
        })
        .await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        msg: NewMessage,
    ) -> anyhow::Result<Message> {
        let conversation_id = conversation_id.to_string();
        self.call(move |conn| insert_message(conn, &conversation_id, msg))
            .await
    }

    async fn get_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([&conversation_id], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn usage_stats(&self, user_id: &str) -> anyhow::Result<UsageStats> {
        let user_id = user_id.to_string();
        self.call(move |conn| usage_stats(conn, &user_id)).await
    }

    async fn provider_usage(
        &self,
        user_id: &str,
    ) -> anyhow::Result<BTreeMap<String, ProviderUsage>> {
        let user_id = user_id.to_string();
        self.call(move |conn| provider_usage(conn, &user_id)).await
    }

    async fn create_session(&self, session: Session) -> anyhow::Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO user_sessions (token, user_id, expires_at, ip_address, user_agent,
                                            created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.token,
                    session.user_id,
                    session.expires_at,
                    session.ip_address,
                    session.user_agent,
                    session.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, token: &str) -> anyhow::Result<Option<Session>> {
        let token = token.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT token, user_id, expires_at, ip_address, user_agent, created_at
                     FROM user_sessions WHERE token = ?1",
                    [&token],
                    |r| {
                        Ok(Session {
                            token: r.get(0)?,
                            user_id: r.get(1)?,
                            expires_at: r.get(2)?,
                            ip_address: r.get(3)?,
                            user_agent: r.get(4)?,
                            created_at: r.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn delete_session(&self, token: &str) -> anyhow::Result<()> {
        let token = token.to_string();
        self.call(move |conn| {
            conn.execute("DELETE FROM user_sessions WHERE token = ?1", [&token])?;
            Ok(())
        })
        .await
    }

    async fn cleanup_expired_sessions(&self) -> anyhow::Result<usize> {
        self.call(move |conn| {
            let n = conn.execute(
                "DELETE FROM user_sessions WHERE expires_at <= ?1",
                [timestamp(Utc::now())],
            )?;
            Ok(n)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TokenUsage;

    async fn store_with_user() -> (SqliteStore, User) {
        let store = SqliteStore::in_memory().unwrap();
        let user = store
            .create_user(NewUser {
                email: "a@example.com".into(),
                name: "A".into(),
                password_hash: None,
                auth_type: AuthType::Email,
                picture_url: None,
            })
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn test_append_updates_aggregates() {
        let (store, user) = store_with_user().await;
        let conv = store
            .create_conversation(&user.id, "t", "openai", "gpt-4o")
            .await
            .unwrap();

        store
            .append_message(&conv.id, NewMessage::user("hi"))
            .await
            .unwrap();
        store
            .append_message(
                &conv.id,
                NewMessage::assistant(
                    "hello",
                    "openai",
                    "gpt-4o",
                    TokenUsage {
                        input_tokens: 10,
                        output_tokens: 20,
                    },
                    0.25,
                ),
            )
            .await
            .unwrap();

        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.total_messages, 2);
        assert_eq!(conv.total_tokens, 30);
        assert!((conv.total_cost - 0.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_append_to_missing_conversation_fails() {
        let (store, _) = store_with_user().await;
        let err = store
            .append_message("nope", NewMessage::user("hi"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_message_ids_monotonic() {
        let (store, user) = store_with_user().await;
        let conv = store
            .create_conversation(&user.id, "t", "openai", "gpt-4o")
            .await
            .unwrap();
        let a = store
            .append_message(&conv.id, NewMessage::user("1"))
            .await
            .unwrap();
        let b = store
            .append_message(&conv.id, NewMessage::user("2"))
            .await
            .unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let (store, _) = store_with_user().await;
        let res = store
            .create_user(NewUser {
                email: "A@example.com".into(),
                name: String::new(),
                password_hash: None,
                auth_type: AuthType::Email,
                picture_url: None,
            })
            .await;
        assert!(res.is_err());
    }
}
