// src/store/mod.rs — Conversation store: types and the ChatStore trait

pub mod file;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::infra::config::{StorageBackend, StorageConfig};
use crate::provider::{Provider, Role, TokenUsage};

pub use file::FileStore;
pub use sqlite::SqliteStore;

/// Default page size for conversation listings.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Timestamps are RFC 3339 UTC with microseconds, so they sort as strings.
pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─── Users ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Email,
    Google,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Email => "email",
            AuthType::Google => "google",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "google" => AuthType::Google,
            _ => AuthType::Email,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub auth_type: AuthType,
    #[serde(default)]
    pub picture_url: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_login_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub password_hash: Option<String>,
    pub auth_type: AuthType,
    pub picture_url: Option<String>,
}

impl NewUser {
    /// Normalise the email and fill in a display name when none is given.
    pub fn build(self) -> User {
        let now = now_timestamp();
        let email = normalize_email(&self.email);
        let name = if self.name.trim().is_empty() {
            email.split('@').next().unwrap_or_default().to_string()
        } else {
            self.name.trim().to_string()
        };
        User {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            name,
            password_hash: self.password_hash,
            auth_type: self.auth_type,
            picture_url: self.picture_url,
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
            last_login_at: None,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub picture_url: Option<String>,
}

// ─── Credentials ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredKey {
    pub provider: Provider,
    /// base64(nonce || ciphertext); never the plaintext.
    pub encrypted_key: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_used_at: Option<String>,
}

// ─── Conversations ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub total_messages: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub total_cost: f64,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn new(user_id: &str, title: &str, provider: &str, model: &str) -> Self {
        let now = now_timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            is_archived: false,
            is_pinned: false,
            total_messages: 0,
            total_tokens: 0,
            total_cost: 0.0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Apply a partial update; returns true when anything changed.
    pub fn apply(&mut self, update: &ConversationUpdate) -> bool {
        let mut changed = false;
        if let Some(title) = &update.title {
            changed |= self.title != *title;
            self.title = title.clone();
        }
        if let Some(provider) = &update.provider {
            changed |= self.provider != *provider;
            self.provider = provider.clone();
        }
        if let Some(model) = &update.model {
            changed |= self.model != *model;
            self.model = model.clone();
        }
        if let Some(archived) = update.is_archived {
            changed |= self.is_archived != archived;
            self.is_archived = archived;
        }
        if let Some(pinned) = update.is_pinned {
            changed |= self.is_pinned != pinned;
            self.is_pinned = pinned;
        }
        if changed {
            self.updated_at = now_timestamp();
        }
        changed
    }

    pub fn matches(&self, opts: &ListOptions) -> bool {
        if self.is_archived && !opts.include_archived {
            return false;
        }
        match opts.search.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => self.title.to_lowercase().contains(&q.to_lowercase()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub is_archived: Option<bool>,
    pub is_pinned: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub include_archived: bool,
    pub limit: Option<usize>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
}

impl ListOptions {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }
}

// ─── Messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: String,
}

/// A message about to be appended. Ids and timestamps are assigned by the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub error_message: Option<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            provider: None,
            model: None,
            usage: TokenUsage::default(),
            cost: 0.0,
            error_message: None,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        cost: f64,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            usage,
            cost,
            error_message: None,
        }
    }

    /// Error-flagged assistant message. Carries no usage.
    pub fn error(content: impl Into<String>, provider: &str, model: &str, error: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            usage: TokenUsage::default(),
            cost: 0.0,
            error_message: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn into_message(self, id: i64, conversation_id: &str, created_at: String) -> Message {
        let is_error = self.is_error();
        Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: self.role,
            content: self.content,
            provider: self.provider,
            model: self.model,
            input_tokens: self.usage.input_tokens as i64,
            output_tokens: self.usage.output_tokens as i64,
            total_tokens: self.usage.total() as i64,
            cost: self.cost,
            is_error,
            error_message: self.error_message,
            created_at,
        }
    }
}

// ─── Usage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub conversations: i64,
    pub messages: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
}

/// Accumulates usage over assistant messages of a set of conversations.
/// Shared by the backends that compute usage in memory.
#[derive(Default)]
pub(crate) struct UsageAccumulator {
    pub totals: UsageStats,
    pub by_provider: BTreeMap<String, ProviderUsage>,
}

impl UsageAccumulator {
    pub fn add(&mut self, conversation: &Conversation, messages: &[Message]) {
        let assistant: Vec<&Message> = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        if assistant.is_empty() {
            return;
        }
        let entry = self
            .by_provider
            .entry(conversation.provider.clone())
            .or_default();
        self.totals.total_conversations += 1;
        entry.conversations += 1;
        for m in assistant {
            self.totals.total_messages += 1;
            self.totals.total_input_tokens += m.input_tokens;
            self.totals.total_output_tokens += m.output_tokens;
            self.totals.total_tokens += m.total_tokens;
            self.totals.total_cost += m.cost;
            entry.messages += 1;
            entry.input_tokens += m.input_tokens;
            entry.output_tokens += m.output_tokens;
            entry.total_tokens += m.total_tokens;
            entry.cost += m.cost;
        }
    }
}

// ─── Sessions ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub expires_at: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub created_at: String,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        is_expired_at(&self.expires_at, Utc::now())
    }
}

pub(crate) fn is_expired_at(expires_at: &str, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(expires_at) {
        Ok(t) => t.with_timezone(&Utc) <= now,
        Err(_) => true,
    }
}

// ─── Trait ──────────────────────────────────────────────────────

/// Durable record of users, credentials, conversations and sessions.
/// Ownership checks belong to callers; the store answers for any id.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // Users
    async fn create_user(&self, user: NewUser) -> anyhow::Result<User>;
    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn update_user(&self, id: &str, update: UserUpdate) -> anyhow::Result<Option<User>>;
    async fn record_login(&self, id: &str) -> anyhow::Result<()>;

    // Credentials
    async fn save_api_key(
        &self,
        user_id: &str,
        provider: Provider,
        encrypted_key: &str,
    ) -> anyhow::Result<()>;
    async fn get_api_key(&self, user_id: &str, provider: Provider)
        -> anyhow::Result<Option<String>>;
    async fn list_api_keys(&self, user_id: &str) -> anyhow::Result<Vec<StoredKey>>;
    async fn touch_api_key(&self, user_id: &str, provider: Provider) -> anyhow::Result<()>;

    // Conversations
    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        provider: &str,
        model: &str,
    ) -> anyhow::Result<Conversation>;
    async fn get_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>>;
    async fn list_conversations(
        &self,
        user_id: &str,
        opts: ListOptions,
    ) -> anyhow::Result<Vec<Conversation>>;
    async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> anyhow::Result<Option<Conversation>>;
    async fn delete_conversation(&self, id: &str) -> anyhow::Result<bool>;
    /// Append and bump the conversation's counters and `updated_at`.
    async fn append_message(&self, conversation_id: &str, msg: NewMessage)
        -> anyhow::Result<Message>;
    async fn get_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>>;

    // Usage
    async fn usage_stats(&self, user_id: &str) -> anyhow::Result<UsageStats>;
    async fn provider_usage(&self, user_id: &str)
        -> anyhow::Result<BTreeMap<String, ProviderUsage>>;

    // Sessions
    async fn create_session(&self, session: Session) -> anyhow::Result<()>;
    async fn get_session(&self, token: &str) -> anyhow::Result<Option<Session>>;
    async fn delete_session(&self, token: &str) -> anyhow::Result<()>;
    async fn cleanup_expired_sessions(&self) -> anyhow::Result<usize>;
}

/// Open the configured backend.
pub fn open(config: &StorageConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
    match config.backend {
        StorageBackend::Sqlite => {
            let path = config.database_path();
            tracing::info!("Using SQLite storage at {}", path.display());
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        StorageBackend::File => {
            let users_file = config.users_file();
            let data_dir = config.user_data_dir();
            tracing::info!("Using file storage at {}", data_dir.display());
            Ok(Arc::new(FileStore::open(&users_file, &data_dir)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_user_normalises_email() {
        let u = NewUser {
            email: "  Alice@Example.COM ".into(),
            name: String::new(),
            password_hash: None,
            auth_type: AuthType::Email,
            picture_url: None,
        }
        .build();
        assert_eq!(u.email, "alice@example.com");
        assert_eq!(u.name, "alice");
        assert!(u.is_active);
    }

    #[test]
    fn test_conversation_apply_update() {
        let mut c = Conversation::new("u1", "New Chat", "openai", "gpt-4o");
        let changed = c.apply(&ConversationUpdate {
            model: Some("gpt-4o-mini".into()),
            is_pinned: Some(true),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(c.model, "gpt-4o-mini");
        assert!(c.is_pinned);
        assert_eq!(c.provider, "openai");

        assert!(!c.apply(&ConversationUpdate::default()));
    }

    #[test]
    fn test_conversation_matches_filters() {
        let mut c = Conversation::new("u1", "Rust lifetimes", "openai", "gpt-4o");
        let all = ListOptions::default();
        assert!(c.matches(&all));
        assert!(c.matches(&ListOptions {
            search: Some("LIFE".into()),
            ..Default::default()
        }));
        assert!(!c.matches(&ListOptions {
            search: Some("python".into()),
            ..Default::default()
        }));

        c.is_archived = true;
        assert!(!c.matches(&all));
        assert!(c.matches(&ListOptions {
            include_archived: true,
            ..Default::default()
        }));
    }

    #[test]
    fn test_error_message_has_no_usage() {
        let m = NewMessage::error("Error: boom", "openai", "gpt-4o", "boom");
        assert!(m.is_error());
        assert_eq!(m.usage, TokenUsage::default());
        let stored = m.into_message(1, "c1", now_timestamp());
        assert!(stored.is_error);
        assert_eq!(stored.total_tokens, 0);
        assert_eq!(stored.cost, 0.0);
    }

    #[test]
    fn test_assistant_message_totals() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        let stored = NewMessage::assistant("hi", "openai", "gpt-4o", usage, 0.01)
            .into_message(7, "c1", now_timestamp());
        assert_eq!(stored.total_tokens, 15);
        assert!(!stored.is_error);
        assert_eq!(stored.id, 7);
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        assert!(is_expired_at(&timestamp(now - Duration::seconds(1)), now));
        assert!(!is_expired_at(&timestamp(now + Duration::hours(1)), now));
        assert!(is_expired_at("garbage", now));
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = timestamp(Utc::now());
        let b = timestamp(Utc::now() + Duration::microseconds(5));
        assert!(a < b);
    }

    #[test]
    fn test_usage_accumulator_counts_assistant_only() {
        let conv = Conversation::new("u1", "t", "anthropic", "claude-3-5-haiku-20241022");
        let user = NewMessage::user("hi").into_message(1, &conv.id, now_timestamp());
        let reply = NewMessage::assistant(
            "hello",
            "anthropic",
            "claude-3-5-haiku-20241022",
            TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
            },
            0.5,
        )
        .into_message(2, &conv.id, now_timestamp());

        let mut acc = UsageAccumulator::default();
        acc.add(&conv, &[user, reply]);
        assert_eq!(acc.totals.total_messages, 1);
        assert_eq!(acc.totals.total_tokens, 7);
        assert_eq!(acc.by_provider["anthropic"].conversations, 1);
    }
}
