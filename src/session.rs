//! Ordered chat sessions with a current pointer, persisted through a key-value layer.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::types::{Message, Provider};

/// Key under which the whole session collection is stored.
pub const SESSIONS_KEY: &str = "chatSessions";

/// Title given to sessions that have not been named yet.
pub const DEFAULT_TITLE: &str = "New Chat";

/// One conversation and the provider/model it talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub provider: Provider,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn fresh() -> Self {
        let provider = Provider::OpenAi;
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            provider,
            model: provider.default_selection().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Durable string storage addressed by key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;

    fn set(&self, key: &str, value: &str) -> Result<(), GatewayError>;
}

/// Thread-safe key-value store handle.
pub type DynKeyValueStore = Arc<dyn KeyValueStore>;

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Stores each key as `<key>.json` inside a directory.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so readers never observe a half-written value.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(GatewayError::storage(format!("failed to read {key}: {err}"))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        let storage = |err: std::io::Error| GatewayError::storage(format!("failed to write {key}: {err}"));

        fs::create_dir_all(&self.dir).map_err(storage)?;
        let mut temp_file = NamedTempFile::new_in(&self.dir).map_err(storage)?;
        temp_file.write_all(value.as_bytes()).map_err(storage)?;
        temp_file.as_file_mut().sync_all().map_err(storage)?;
        temp_file
            .persist(self.path_for(key))
            .map_err(|err| storage(err.error))?;
        Ok(())
    }
}

/// Sessions indexed by id, kept most-recent-first, with one current session.
///
/// Entries are shared `Arc<Session>` values updated copy-on-write, so a
/// snapshot returned by [`SessionStore::list`] never changes after the fact.
/// Every mutation is written back under [`SESSIONS_KEY`]; write failures are
/// logged and never fail the mutation.
pub struct SessionStore {
    sessions: HashMap<String, Arc<Session>>,
    order: Vec<String>,
    current: Option<String>,
    kv: DynKeyValueStore,
}

impl SessionStore {
    /// Restores the stored collection, or starts with one fresh session when
    /// nothing usable is stored.
    pub fn load(kv: DynKeyValueStore) -> Self {
        let mut store = Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            current: None,
            kv,
        };

        let stored = match store.kv.get(SESSIONS_KEY) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(error = %err, "could not read stored sessions");
                None
            }
        };
        let restored = stored.and_then(|raw| match serde_json::from_str::<Vec<Session>>(&raw) {
            Ok(sessions) => Some(sessions),
            Err(err) => {
                tracing::warn!(error = %err, "discarding undecodable sessions");
                None
            }
        });

        match restored {
            Some(sessions) if !sessions.is_empty() => {
                for mut session in sessions {
                    if store.sessions.contains_key(&session.id) {
                        continue;
                    }
                    if !session.provider.supports_model(&session.model) {
                        tracing::debug!(
                            id = %session.id,
                            model = %session.model,
                            "resetting model not offered by {}",
                            session.provider
                        );
                        session.model = session.provider.default_selection().to_string();
                    }
                    store.order.push(session.id.clone());
                    store.sessions.insert(session.id.clone(), Arc::new(session));
                }
                store.current = store.order.first().cloned();
                tracing::debug!(count = store.order.len(), "restored sessions");
            }
            _ => {
                store.create();
            }
        }
        store
    }

    /// Prepends a fresh session and makes it current; returns its id.
    pub fn create(&mut self) -> String {
        self.insert_fresh().id.clone()
    }

    /// Current session, creating one first if the store is empty.
    pub fn current_or_create(&mut self) -> Arc<Session> {
        match self.current() {
            Some(session) => session,
            None => self.insert_fresh(),
        }
    }

    fn insert_fresh(&mut self) -> Arc<Session> {
        let session = Arc::new(Session::fresh());
        self.order.insert(0, session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());
        self.current = Some(session.id.clone());
        self.persist();
        session
    }

    /// Makes `id` current; unknown ids leave the store untouched.
    pub fn select(&mut self, id: &str) -> bool {
        if !self.sessions.contains_key(id) {
            tracing::debug!(id, "ignoring selection of unknown session");
            return false;
        }
        self.current = Some(id.to_string());
        true
    }

    pub fn append_message(&mut self, id: &str, message: Message) -> bool {
        self.update(id, |session| session.messages.push(message))
    }

    /// Overwrites the content of the last message of `id`, if any.
    pub fn update_last_message(&mut self, id: &str, content: &str) -> bool {
        self.update(id, |session| {
            if let Some(last) = session.messages.last_mut() {
                last.content.clear();
                last.content.push_str(content);
            }
        })
    }

    pub fn rename_title(&mut self, id: &str, title: impl Into<String>) -> bool {
        let title = title.into();
        self.update(id, |session| session.title = title)
    }

    /// Stores the provider/model pair used for future turns of `id`.
    pub fn set_selection(&mut self, id: &str, provider: Provider, model: impl Into<String>) -> bool {
        let model = model.into();
        self.update(id, |session| {
            session.provider = provider;
            session.model = model;
        })
    }

    /// Snapshot of every session, most recent first.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).cloned()
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.as_deref().and_then(|id| self.get(id))
    }

    fn update(&mut self, id: &str, apply: impl FnOnce(&mut Session)) -> bool {
        let Some(entry) = self.sessions.get_mut(id) else {
            tracing::debug!(id, "ignoring update of unknown session");
            return false;
        };
        apply(Arc::make_mut(entry));
        self.persist();
        true
    }

    fn persist(&self) {
        let sessions: Vec<&Session> = self
            .order
            .iter()
            .filter_map(|id| self.sessions.get(id).map(Arc::as_ref))
            .collect();
        let result = serde_json::to_string(&sessions)
            .map_err(|err| GatewayError::storage(err.to_string()))
            .and_then(|json| self.kv.set(SESSIONS_KEY, &json));
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, GatewayError> {
            Ok(Some("not json".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), GatewayError> {
            Err(GatewayError::storage("disk full"))
        }
    }

    #[test]
    fn load_without_data_creates_one_current_session() {
        let store = SessionStore::load(Arc::new(MemoryStore::new()));
        let sessions = store.list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(store.current_id(), Some(sessions[0].id.as_str()));
        assert_eq!(sessions[0].title, DEFAULT_TITLE);
        assert_eq!(sessions[0].provider, Provider::OpenAi);
        assert_eq!(sessions[0].model, "gpt-3.5-turbo");
        assert!(Uuid::parse_str(&sessions[0].id).is_ok());
    }

    #[test]
    fn create_prepends_and_selects() {
        let mut store = SessionStore::load(Arc::new(MemoryStore::new()));
        let first = store.current_id().unwrap().to_string();
        let second = store.create();
        let ids: Vec<String> = store.list().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![second.clone(), first.clone()]);
        assert_eq!(store.current_id(), Some(second.as_str()));

        assert!(store.select(&first));
        assert!(!store.select("missing"));
        assert_eq!(store.current_id(), Some(first.as_str()));
    }

    #[test]
    fn mutations_survive_reload_in_list_order() {
        let kv: DynKeyValueStore = Arc::new(MemoryStore::new());
        let mut store = SessionStore::load(kv.clone());
        let older = store.current_id().unwrap().to_string();
        store.append_message(&older, Message::user("hello"));
        store.append_message(&older, Message::assistant(""));
        store.update_last_message(&older, "hi there");
        store.rename_title(&older, "Greetings");
        let newer = store.create();
        store.set_selection(&newer, Provider::Google, "gemini-pro");

        let raw = kv.get(SESSIONS_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[1]["title"], "Greetings");
        assert!(value[0]["createdAt"].is_string());

        let reloaded = SessionStore::load(kv);
        let sessions = reloaded.list();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, newer);
        assert_eq!(sessions[0].provider, Provider::Google);
        assert_eq!(
            sessions[1].messages,
            vec![Message::user("hello"), Message::assistant("hi there")]
        );
        assert_eq!(reloaded.current_id(), Some(newer.as_str()));
    }

    #[test]
    fn load_resets_models_not_offered_by_the_provider() {
        let kv: DynKeyValueStore = Arc::new(MemoryStore::new());
        let mut stale = Session::fresh();
        stale.provider = Provider::Google;
        stale.model = "gpt-4o-mini".to_string();
        let mut kept = Session::fresh();
        kept.model = "gpt-4o-mini".to_string();
        kv.set(
            SESSIONS_KEY,
            &serde_json::to_string(&[stale.clone(), kept.clone()]).unwrap(),
        )
        .unwrap();

        let store = SessionStore::load(kv);
        assert_eq!(store.get(&stale.id).unwrap().model, "gemini-pro");
        assert_eq!(store.get(&kept.id).unwrap().model, "gpt-4o-mini");
    }

    #[test]
    fn snapshots_are_not_affected_by_later_mutations() {
        let mut store = SessionStore::load(Arc::new(MemoryStore::new()));
        let id = store.current_id().unwrap().to_string();
        let before = store.list();
        store.append_message(&id, Message::user("later"));
        assert!(before[0].messages.is_empty());
        assert_eq!(store.get(&id).unwrap().messages.len(), 1);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut store = SessionStore::load(Arc::new(MemoryStore::new()));
        assert!(!store.append_message("nope", Message::user("x")));
        assert!(!store.rename_title("nope", "x"));
        assert!(store.list().iter().all(|session| session.messages.is_empty()));
    }

    #[test]
    fn storage_failures_do_not_fail_mutations() {
        let mut store = SessionStore::load(Arc::new(BrokenStore));
        let id = store.current_id().unwrap().to_string();
        assert!(store.append_message(&id, Message::user("still works")));
        assert_eq!(store.current().unwrap().messages.len(), 1);
    }

    #[test]
    fn file_store_round_trips_and_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileStore::new(dir.path().join("data"));
        assert_eq!(kv.get(SESSIONS_KEY).unwrap(), None);

        kv.set(SESSIONS_KEY, "[1]").unwrap();
        kv.set(SESSIONS_KEY, "[2]").unwrap();
        assert_eq!(kv.get(SESSIONS_KEY).unwrap().as_deref(), Some("[2]"));

        let entries: Vec<_> = fs::read_dir(kv.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(kv.dir().join("chatSessions.json").exists());
    }

    #[test]
    fn file_store_backs_a_session_store() {
        let dir = tempfile::tempdir().unwrap();
        let kv: DynKeyValueStore = Arc::new(FileStore::new(dir.path()));
        let id = {
            let mut store = SessionStore::load(kv.clone());
            let id = store.current_id().unwrap().to_string();
            store.rename_title(&id, "Persisted");
            id
        };
        let store = SessionStore::load(kv);
        assert_eq!(store.get(&id).unwrap().title, "Persisted");
    }
}
