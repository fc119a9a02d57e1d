// src/store/file.rs — Flat-file JSON backend
//
// Layout:
//   users.json                 user id -> profile
//   user_data/<user id>.json   {api_keys, conversations, next_message_id}
//
// Every read or write of one file holds an exclusive advisory lock on a
// sidecar `.lock` file; writes go through a temp file and rename. There is
// no atomicity across files. Sessions live in process memory only.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{
    normalize_email, now_timestamp, ChatStore, Conversation, ConversationUpdate, ListOptions,
    Message, NewMessage, NewUser, ProviderUsage, Session, StoredKey, UsageAccumulator,
    UsageStats, User, UserUpdate,
};
use crate::infra::errors::ChatHubError;
use crate::provider::Provider;

type UserIndex = BTreeMap<String, User>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserData {
    #[serde(default)]
    api_keys: BTreeMap<String, StoredKey>,
    #[serde(default)]
    conversations: BTreeMap<String, ConversationRecord>,
    #[serde(default)]
    next_message_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationRecord {
    #[serde(flatten)]
    meta: Conversation,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

struct Inner {
    users_file: PathBuf,
    data_dir: PathBuf,
    sessions: Mutex<HashMap<String, Session>>,
    /// conversation id -> owning user id. May be stale after a delete.
    owners: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(users_file: &Path, data_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        if let Some(parent) = users_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                users_file: users_file.to_path_buf(),
                data_dir: data_dir.to_path_buf(),
                sessions: Mutex::new(HashMap::new()),
                owners: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Run blocking file work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Inner) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| anyhow!("file store task failed: {}", e))?
    }

    fn sessions(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, Session>>> {
        self.inner
            .sessions
            .lock()
            .map_err(|_| anyhow!("session table poisoned"))
    }
}

// ─── Locked JSON files ──────────────────────────────────────────

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn with_lock<R>(path: &Path, f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    FileExt::lock_exclusive(&lock)?;
    let result = f();
    FileExt::unlock(&lock)?;
    result
}

fn load<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn save<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;

    // Atomic write: temp file + rename
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_locked<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    with_lock(path, || load(path))
}

fn update_locked<T, R>(path: &Path, f: impl FnOnce(&mut T) -> anyhow::Result<R>) -> anyhow::Result<R>
where
    T: DeserializeOwned + Serialize + Default,
{
    with_lock(path, || {
        let mut data: T = load(path)?;
        let result = f(&mut data)?;
        save(path, &data)?;
        Ok(result)
    })
}

// ─── Inner helpers ──────────────────────────────────────────────

impl Inner {
    fn user_file(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        if user_id.is_empty()
            || !user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!("invalid user id '{}'", user_id));
        }
        Ok(self.data_dir.join(format!("{user_id}.json")))
    }

    fn users(&self) -> anyhow::Result<UserIndex> {
        read_locked(&self.users_file)
    }

    fn update_users<R>(&self, f: impl FnOnce(&mut UserIndex) -> anyhow::Result<R>) -> anyhow::Result<R> {
        update_locked(&self.users_file, f)
    }

    fn user_data(&self, user_id: &str) -> anyhow::Result<UserData> {
        read_locked(&self.user_file(user_id)?)
    }

    fn update_user_data<R>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserData) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        update_locked(&self.user_file(user_id)?, f)
    }

    fn remember_owner(&self, conversation_id: &str, user_id: &str) {
        if let Ok(mut owners) = self.owners.lock() {
            owners.insert(conversation_id.to_string(), user_id.to_string());
        }
    }

    fn forget_owner(&self, conversation_id: &str) {
        if let Ok(mut owners) = self.owners.lock() {
            owners.remove(conversation_id);
        }
    }

    /// Which user's file holds this conversation. Scans the users index on
    /// a cache miss.
    fn find_owner(&self, conversation_id: &str) -> anyhow::Result<Option<String>> {
        let cached = self
            .owners
            .lock()
            .ok()
            .and_then(|o| o.get(conversation_id).cloned());
        if let Some(user_id) = cached {
            return Ok(Some(user_id));
        }

        for user_id in self.users()?.keys() {
            let data = self.user_data(user_id)?;
            if data.conversations.contains_key(conversation_id) {
                self.remember_owner(conversation_id, user_id);
                return Ok(Some(user_id.clone()));
            }
        }
        Ok(None)
    }

    fn find_record(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationRecord>> {
        let Some(owner) = self.find_owner(conversation_id)? else {
            return Ok(None);
        };
        let mut data = self.user_data(&owner)?;
        Ok(data.conversations.remove(conversation_id))
    }
}

// ─── ChatStore ──────────────────────────────────────────────────

#[async_trait]
impl ChatStore for FileStore {
    async fn create_user(&self, user: NewUser) -> anyhow::Result<User> {
        let user = user.build();
        self.blocking(move |inner| {
            inner.update_users(|users| {
                if users.values().any(|u| u.email == user.email) {
                    return Err(ChatHubError::EmailTaken.into());
                }
                users.insert(user.id.clone(), user.clone());
                Ok(())
            })?;
            inner.update_user_data(&user.id, |_: &mut UserData| Ok(()))?;
            Ok(user)
        })
        .await
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        let id = id.to_string();
        self.blocking(move |inner| Ok(inner.users()?.remove(&id)))
            .await
    }

    async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let email = normalize_email(email);
        self.blocking(move |inner| {
            Ok(inner.users()?.into_values().find(|u| u.email == email))
        })
        .await
    }

    async fn update_user(&self, id: &str, update: UserUpdate) -> anyhow::Result<Option<User>> {
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.update_users(|users| {
                let Some(user) = users.get_mut(&id) else {
                    return Ok(None);
                };
                if let Some(name) = update.name {
                    user.name = name;
                }
                if let Some(picture) = update.picture_url {
                    user.picture_url = Some(picture);
                }
                user.updated_at = now_timestamp();
                Ok(Some(user.clone()))
            })
        })
        .await
    }

    async fn record_login(&self, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.update_users(|users| {
                if let Some(user) = users.get_mut(&id) {
                    user.last_login_at = Some(now_timestamp());
                }
                Ok(())
            })
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
        self.blocking(move |inner| {
            inner.update_user_data(&user_id, |data| {
                let now = now_timestamp();
                data.api_keys
                    .entry(provider.as_str().to_string())
                    .and_modify(|k| {
                        k.encrypted_key = encrypted_key.clone();
                        k.updated_at = now.clone();
                    })
                    .or_insert_with(|| StoredKey {
                        provider,
                        encrypted_key: encrypted_key.clone(),
                        created_at: now.clone(),
                        updated_at: now.clone(),
                        last_used_at: None,
                    });
                Ok(())
            })
        })
        .await
    }

    async fn get_api_key(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Option<String>> {
        let user_id = user_id.to_string();
        self.blocking(move |inner| {
            Ok(inner
                .user_data(&user_id)?
                .api_keys
                .remove(provider.as_str())
                .map(|k| k.encrypted_key))
        })
        .await
    }

    async fn list_api_keys(&self, user_id: &str) -> anyhow::Result<Vec<StoredKey>> {
        let user_id = user_id.to_string();
        self.blocking(move |inner| Ok(inner.user_data(&user_id)?.api_keys.into_values().collect()))
            .await
    }

    async fn touch_api_key(&self, user_id: &str, provider: Provider) -> anyhow::Result<()> {
        let user_id = user_id.to_string();
        self.blocking(move |inner| {
            inner.update_user_data(&user_id, |data| {
                if let Some(k) = data.api_keys.get_mut(provider.as_str()) {
                    k.last_used_at = Some(now_timestamp());
                }
                Ok(())
            })
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
        self.blocking(move |inner| {
            inner.update_user_data(&conv.user_id, |data| {
                data.conversations.insert(
                    conv.id.clone(),
                    ConversationRecord {
                        meta: conv.clone(),
                        messages: Vec::new(),
                    },
                );
                Ok(())
            })?;
            inner.remember_owner(&conv.id, &conv.user_id);
            Ok(conv)
        })
        .await
    }

    async fn get_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let id = id.to_string();
        self.blocking(move |inner| Ok(inner.find_record(&id)?.map(|r| r.meta)))
            .await
    }

    async fn list_conversations(
        &self,
        user_id: &str,
        opts: ListOptions,
    ) -> anyhow::Result<Vec<Conversation>> {
        let user_id = user_id.to_string();
        self.blocking(move |inner| {
            let data = inner.user_data(&user_id)?;
            let mut convs: Vec<Conversation> = data
                .conversations
                .into_values()
                .map(|r| r.meta)
                .filter(|c| c.matches(&opts))
                .collect();
            convs.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            });
            convs.truncate(opts.limit());
            Ok(convs)
        })
        .await
    }

    async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> anyhow::Result<Option<Conversation>> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let Some(owner) = inner.find_owner(&id)? else {
                return Ok(None);
            };
            inner.update_user_data(&owner, |data| {
                Ok(data.conversations.get_mut(&id).map(|r| {
                    r.meta.apply(&update);
                    r.meta.clone()
                }))
            })
        })
        .await
    }

    async fn delete_conversation(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let Some(owner) = inner.find_owner(&id)? else {
                return Ok(false);
            };
            let removed =
                inner.update_user_data(&owner, |data| Ok(data.conversations.remove(&id).is_some()))?;
            inner.forget_owner(&id);
            Ok(removed)
        })
        .await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        msg: NewMessage,
    ) -> anyhow::Result<Message> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |inner| {
            let owner = inner
                .find_owner(&conversation_id)?
                .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))?;

            inner.update_user_data(&owner, |data| {
                let id = data.next_message_id + 1;
                let record = data
                    .conversations
                    .get_mut(&conversation_id)
                    .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))?;

                let message = msg.into_message(id, &conversation_id, now_timestamp());
                record.meta.total_messages += 1;
                record.meta.total_tokens += message.total_tokens;
                record.meta.total_cost += message.cost;
                record.meta.updated_at = message.created_at.clone();
                record.messages.push(message.clone());
                data.next_message_id = id;
                Ok(message)
            })
        })
        .await
    }

    async fn get_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |inner| {
            Ok(inner
                .find_record(&conversation_id)?
                .map(|r| r.messages)
                .unwrap_or_default())
        })
        .await
    }

    async fn usage_stats(&self, user_id: &str) -> anyhow::Result<UsageStats> {
        let user_id = user_id.to_string();
        self.blocking(move |inner| {
            let mut acc = UsageAccumulator::default();
            for record in inner.user_data(&user_id)?.conversations.values() {
                acc.add(&record.meta, &record.messages);
            }
            Ok(acc.totals)
        })
        .await
    }

    async fn provider_usage(
        &self,
        user_id: &str,
    ) -> anyhow::Result<BTreeMap<String, ProviderUsage>> {
        let user_id = user_id.to_string();
        self.blocking(move |inner| {
            let mut acc = UsageAccumulator::default();
            for record in inner.user_data(&user_id)?.conversations.values() {
                acc.add(&record.meta, &record.messages);
            }
            Ok(acc.by_provider)
        })
        .await
    }

    async fn create_session(&self, session: Session) -> anyhow::Result<()> {
        self.sessions()?.insert(session.token.clone(), session);
        Ok(())
    }

    async fn get_session(&self, token: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions()?.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> anyhow::Result<()> {
        self.sessions()?.remove(token);
        Ok(())
    }

    async fn cleanup_expired_sessions(&self) -> anyhow::Result<usize> {
        let mut sessions = self.sessions()?;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        Ok(before - sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuthType;

    fn open_temp() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileStore::open(&dir.path().join("users.json"), &dir.path().join("user_data")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_lock_path_is_sidecar() {
        let p = lock_path(Path::new("/tmp/data/users.json"));
        assert_eq!(p, PathBuf::from("/tmp/data/users.json.lock"));
    }

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let data: UserData = load(&dir.path().join("absent.json")).unwrap();
        assert!(data.conversations.is_empty());
    }

    #[test]
    fn test_update_locked_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.json");
        update_locked(&path, |m: &mut BTreeMap<String, i64>| {
            m.insert("a".into(), 1);
            Ok(())
        })
        .unwrap();
        let m: BTreeMap<String, i64> = read_locked(&path).unwrap();
        assert_eq!(m["a"], 1);
        assert!(!dir.path().join("idx.json.tmp").exists());
    }

    #[test]
    fn test_user_file_rejects_traversal() {
        let (_dir, store) = open_temp();
        assert!(store.inner.user_file("../etc/passwd").is_err());
        assert!(store.inner.user_file("").is_err());
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let (dir, store) = open_temp();
        let user = store
            .create_user(NewUser {
                email: "f@example.com".into(),
                name: "F".into(),
                password_hash: None,
                auth_type: AuthType::Email,
                picture_url: None,
            })
            .await
            .unwrap();
        let conv = store
            .create_conversation(&user.id, "t", "google", "gemini-2.5-flash")
            .await
            .unwrap();

        assert!(dir.path().join("users.json").exists());
        let raw = fs::read_to_string(dir.path().join("user_data").join(format!("{}.json", user.id)))
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(v["conversations"][&conv.id].is_object());
        assert!(v["api_keys"].is_object());
    }

    #[tokio::test]
    async fn test_owner_lookup_survives_fresh_handle() {
        let (dir, store) = open_temp();
        let user = store
            .create_user(NewUser {
                email: "g@example.com".into(),
                name: "G".into(),
                password_hash: None,
                auth_type: AuthType::Email,
                picture_url: None,
            })
            .await
            .unwrap();
        let conv = store
            .create_conversation(&user.id, "t", "openai", "gpt-4o")
            .await
            .unwrap();

        // New handle has an empty owner cache and must scan
        let reopened =
            FileStore::open(&dir.path().join("users.json"), &dir.path().join("user_data")).unwrap();
        let found = reopened.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(found.user_id, user.id);
    }
}
