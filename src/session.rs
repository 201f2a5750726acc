//! Journal sessions and the stores that persist them.

use crate::synonyms::SynonymMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Number of display colors entries cycle through.
pub const PALETTE_SIZE: u8 = 6;
const ID_LENGTH: usize = 24;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {id} not found")]
    NotFound { id: String },
    #[error("invalid session id {id:?}")]
    InvalidId { id: String },
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session file could not be persisted: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("session store task failed: {0}")]
    Task(String),
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

pub fn generate_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// Timestamps are stored as RFC 3339 strings. Unreadable values fall back to
/// the current time rather than failing the whole session.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use tracing::warn;

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(parse(&raw).unwrap_or_else(|| {
            warn!(value = %raw, "malformed timestamp, substituting current time");
            Utc::now()
        }))
    }

    pub(super) fn parse(raw: &Value) -> Option<DateTime<Utc>> {
        match raw {
            Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            Value::Number(millis) => millis
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Notebook {
    Journal,
    Buddy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub text: String,
    #[serde(with = "timestamp", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub color_index: u8,
}

impl Entry {
    pub fn new(text: impl Into<String>, color_index: u8) -> Self {
        Self {
            id: generate_id(),
            text: text.into(),
            created_at: Utc::now(),
            color_index: color_index % PALETTE_SIZE,
        }
    }

    /// Color for the entry following `count` existing ones.
    pub fn next_color(count: usize) -> u8 {
        (count % PALETTE_SIZE as usize) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Buddy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    pub fn buddy(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Buddy,
            text: text.into(),
        }
    }
}

/// One stored vocabulary value: a sentence's synonym map, or the plain list
/// written by word-level lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VocabularyValue {
    Words(Vec<String>),
    Sentence(SynonymMap),
}

impl VocabularyValue {
    /// A map holding only `key` itself is written back as a plain list.
    pub fn from_map(key: &str, map: SynonymMap) -> Self {
        if map.len() == 1 {
            if let Some(words) = map.get(key) {
                return VocabularyValue::Words(words.clone());
            }
        }
        VocabularyValue::Sentence(map)
    }

    pub fn into_map(self, key: &str) -> SynonymMap {
        match self {
            VocabularyValue::Sentence(map) => map,
            VocabularyValue::Words(words) => {
                let mut map = SynonymMap::new();
                if !words.is_empty() {
                    map.insert(key.to_string(), words);
                }
                map
            }
        }
    }
}

pub type VocabularyData = BTreeMap<String, VocabularyValue>;

pub fn vocabulary_from_cache(entries: BTreeMap<String, SynonymMap>) -> VocabularyData {
    entries
        .into_iter()
        .map(|(key, map)| {
            let value = VocabularyValue::from_map(&key, map);
            (key, value)
        })
        .collect()
}

pub fn vocabulary_into_cache(data: VocabularyData) -> Vec<(String, SynonymMap)> {
    data.into_iter()
        .map(|(key, value)| {
            let map = value.into_map(&key);
            (key, map)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub journal_entries: Vec<Entry>,
    #[serde(default)]
    pub buddy_entries: Vec<Entry>,
    #[serde(default)]
    pub conversation: Vec<ChatTurn>,
    #[serde(default)]
    pub vocabulary_data: VocabularyData,
    #[serde(with = "timestamp", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SessionData {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            journal_entries: Vec::new(),
            buddy_entries: Vec::new(),
            conversation: Vec::new(),
            vocabulary_data: VocabularyData::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.journal_entries.len() + self.buddy_entries.len()
    }

    fn summary(&self, id: &str) -> SessionSummary {
        SessionSummary {
            id: id.to_string(),
            name: self.name.clone(),
            entry_count: self.entry_count(),
            updated_at: self.updated_at,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub journal_entries: Option<Vec<Entry>>,
    #[serde(default)]
    pub buddy_entries: Option<Vec<Entry>>,
    #[serde(default)]
    pub conversation: Option<Vec<ChatTurn>>,
    #[serde(default)]
    pub vocabulary_data: Option<VocabularyData>,
}

impl SessionPatch {
    pub fn apply(self, data: &mut SessionData) {
        if let Some(name) = self.name {
            data.name = name;
        }
        if let Some(entries) = self.journal_entries {
            data.journal_entries = entries;
        }
        if let Some(entries) = self.buddy_entries {
            data.buddy_entries = entries;
        }
        if let Some(conversation) = self.conversation {
            data.conversation = conversation;
        }
        if let Some(vocabulary) = self.vocabulary_data {
            data.vocabulary_data = vocabulary;
        }
        data.updated_at = Utc::now();
    }
}

impl From<SessionData> for SessionPatch {
    fn from(data: SessionData) -> Self {
        Self {
            name: Some(data.name),
            journal_entries: Some(data.journal_entries),
            buddy_entries: Some(data.buddy_entries),
            conversation: Some(data.conversation),
            vocabulary_data: Some(data.vocabulary_data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub entry_count: usize,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, data: SessionData) -> Result<String, StoreError>;
    async fn read(&self, id: &str) -> Result<Option<SessionData>, StoreError>;
    async fn update(&self, id: &str, patch: SessionPatch) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// Most recently updated first.
    async fn list_all(&self) -> Result<Vec<SessionSummary>, StoreError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionData>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, data: SessionData) -> Result<String, StoreError> {
        let id = generate_id();
        self.sessions.write().insert(id.clone(), data);
        Ok(id)
    }

    async fn read(&self, id: &str) -> Result<Option<SessionData>, StoreError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn update(&self, id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        let mut guard = self.sessions.write();
        let data = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        patch.apply(data);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn list_all(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut rows: Vec<_> = self
            .sessions
            .read()
            .iter()
            .map(|(id, data)| data.summary(id))
            .collect();
        sort_summaries(&mut rows);
        Ok(rows)
    }
}

/// One `<id>.json` document per session inside `dir`.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !valid_id(id) {
            return Err(StoreError::InvalidId { id: id.to_string() });
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn blocking<T, F>(&self, job: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, StoreError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || job(dir))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn read_file(path: &Path) -> Result<Option<SessionData>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_file(dir: &Path, path: &Path, data: &SessionData) -> Result<(), StoreError> {
    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, data)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, data: SessionData) -> Result<String, StoreError> {
        let id = generate_id();
        let path = self.path_for(&id)?;
        self.blocking(move |dir| write_file(&dir, &path, &data))
            .await?;
        debug!(id = %id, "session created");
        Ok(id)
    }

    async fn read(&self, id: &str) -> Result<Option<SessionData>, StoreError> {
        let path = self.path_for(id)?;
        self.blocking(move |_| read_file(&path)).await
    }

    async fn update(&self, id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let id = id.to_string();
        self.blocking(move |dir| {
            let mut data = read_file(&path)?.ok_or(StoreError::NotFound { id })?;
            patch.apply(&mut data);
            write_file(&dir, &path, &data)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let id = id.to_string();
        self.blocking(move |_| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { id })
            }
            Err(err) => Err(err.into()),
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.blocking(|dir| {
            let mut rows = Vec::new();
            for item in fs::read_dir(&dir)? {
                let path = item?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                match read_file(&path) {
                    Ok(Some(data)) => rows.push(data.summary(id)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "skipping unreadable session file"
                        )
                    }
                }
            }
            sort_summaries(&mut rows);
            Ok(rows)
        })
        .await
    }
}

fn sort_summaries(rows: &mut [SessionSummary]) {
    rows.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SessionData {
        let mut data = SessionData::named("Summer");
        data.journal_entries.push(Entry::new("I was sad.", 0));
        data.buddy_entries.push(Entry::new("Oh no! What happened?", 0));
        data.conversation.push(ChatTurn::user("I was sad."));
        data
    }

    #[test]
    fn entry_serializes_iso_timestamp() {
        let entry = Entry::new("hello", 7);
        assert_eq!(entry.color_index, 1);
        let value = serde_json::to_value(&entry).unwrap();
        let created = value["createdAt"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok());
        assert!(created.ends_with('Z'));
        assert!(value.get("colorIndex").is_some());
    }

    #[test]
    fn malformed_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let entry: Entry = serde_json::from_str(
            r#"{"id":"a1","text":"hi","createdAt":"yesterday-ish","colorIndex":2}"#,
        )
        .unwrap();
        assert!(entry.created_at >= before);
        assert_eq!(entry.color_index, 2);
    }

    #[test]
    fn numeric_and_missing_timestamps_are_accepted() {
        let entry: Entry =
            serde_json::from_str(r#"{"id":"a1","text":"hi","createdAt":1700000000000}"#).unwrap();
        assert_eq!(entry.created_at.timestamp(), 1_700_000_000);
        let entry: Entry = serde_json::from_str(r#"{"id":"a2","text":"hi"}"#).unwrap();
        assert_eq!(entry.color_index, 0);
    }

    #[test]
    fn word_level_vocabulary_round_trips() {
        let data: SessionData = serde_json::from_str(
            r#"{"name":"s","vocabularyData":{"sad":["unhappy","gloomy","downhearted"],"i was very happy":{"very":["extremely"],"happy":["joyful"]}}}"#,
        )
        .unwrap();
        let entries = vocabulary_into_cache(data.vocabulary_data.clone());
        let (key, map) = &entries[1];
        assert_eq!(key, "sad");
        assert_eq!(map["sad"], vec!["unhappy", "gloomy", "downhearted"]);

        let restored = vocabulary_from_cache(entries.into_iter().collect());
        assert_eq!(restored, data.vocabulary_data);
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut data = sample();
        let before = data.clone();
        SessionPatch {
            name: Some("Autumn".to_string()),
            ..SessionPatch::default()
        }
        .apply(&mut data);
        assert_eq!(data.name, "Autumn");
        assert_eq!(data.journal_entries, before.journal_entries);
        assert!(data.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn memory_store_crud() {
        let store = MemorySessionStore::new();
        let id = store.create(sample()).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap().unwrap().name, "Summer");
        store
            .update(
                &id,
                SessionPatch {
                    name: Some("Winter".to_string()),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();
        let listed = store.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Winter");
        assert_eq!(listed[0].entry_count, 2);
        store.delete(&id).await.unwrap();
        assert!(store.read(&id).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn file_store_persists_documents() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        let id = store.create(sample()).await.unwrap();
        assert!(dir.path().join(format!("{id}.json")).exists());

        let reopened = FileSessionStore::new(dir.path()).unwrap();
        let data = reopened.read(&id).await.unwrap().unwrap();
        assert_eq!(data.journal_entries[0].text, "I was sad.");

        reopened
            .update(&id, SessionPatch::from(SessionData::named("Renamed")))
            .await
            .unwrap();
        let data = reopened.read(&id).await.unwrap().unwrap();
        assert_eq!(data.name, "Renamed");
        assert!(data.journal_entries.is_empty());

        let second = reopened.create(SessionData::named("Later")).await.unwrap();
        let listed = reopened.list_all().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);

        reopened.delete(&id).await.unwrap();
        assert!(reopened.read(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.read("../etc/passwd").await,
            Err(StoreError::InvalidId { .. })
        ));
    }

    #[tokio::test]
    async fn file_store_update_of_missing_session_fails() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.update("nothere", SessionPatch::default()).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
