use crate::annotate::{EntryView, HoverGeometry, HoverState, RenderedEntry};
use crate::buddy::BuddyReplier;
use crate::cache::SynonymService;
use crate::session::{
    ChatTurn, Entry, Notebook, SessionData, SessionPatch, SessionStore, SessionSummary,
    StoreError, vocabulary_from_cache, vocabulary_into_cache,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

pub const DEFAULT_SESSION_NAME: &str = "My Journal";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal entries cannot be empty")]
    EmptyEntry,
    #[error("entry {0} not found")]
    EntryNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub entry: Entry,
    pub reply: Entry,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalSnapshot {
    pub session_id: Option<String>,
    pub session_name: String,
    pub journal_entries: Vec<Entry>,
    pub buddy_entries: Vec<Entry>,
    pub conversation: Vec<ChatTurn>,
}

#[derive(Default)]
struct JournalState {
    session_id: Option<String>,
    session_name: String,
    journal: Vec<Entry>,
    buddy: Vec<Entry>,
    conversation: Vec<ChatTurn>,
    views: HashMap<String, EntryView>,
    /// Bumped whenever the in-memory journal is replaced.
    epoch: u64,
}

impl JournalState {
    fn replace(
        &mut self,
        session_id: Option<String>,
        data: SessionData,
        views: HashMap<String, EntryView>,
    ) {
        self.session_id = session_id;
        self.session_name = data.name;
        self.journal = data.journal_entries;
        self.buddy = data.buddy_entries;
        self.conversation = data.conversation;
        self.views = views;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn to_session_data(&self) -> SessionData {
        let mut data = SessionData::named(self.session_name.clone());
        data.journal_entries = self.journal.clone();
        data.buddy_entries = self.buddy.clone();
        data.conversation = self.conversation.clone();
        data
    }
}

/// The two notebooks, the conversation with the buddy, and the session they
/// are saved to. Switching sessions resets the synonym cache along with them.
pub struct Journal {
    service: Arc<SynonymService>,
    buddy: BuddyReplier,
    store: Arc<dyn SessionStore>,
    state: RwLock<JournalState>,
}

impl Journal {
    pub fn new(
        service: Arc<SynonymService>,
        buddy: BuddyReplier,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            service,
            buddy,
            store,
            state: RwLock::new(JournalState {
                session_name: DEFAULT_SESSION_NAME.to_string(),
                ..JournalState::default()
            }),
        }
    }

    pub fn service(&self) -> &Arc<SynonymService> {
        &self.service
    }

    pub fn active_session(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        let state = self.state.read();
        JournalSnapshot {
            session_id: state.session_id.clone(),
            session_name: state.session_name.clone(),
            journal_entries: state.journal.clone(),
            buddy_entries: state.buddy.clone(),
            conversation: state.conversation.clone(),
        }
    }

    pub fn entries(&self, notebook: Notebook) -> Vec<Entry> {
        let state = self.state.read();
        match notebook {
            Notebook::Journal => state.journal.clone(),
            Notebook::Buddy => state.buddy.clone(),
        }
    }

    /// Adds a user entry, starts its synonym lookups, then waits for the buddy
    /// reply. The two paths are independent; either may finish first.
    pub async fn submit_entry(&self, text: &str) -> Result<Submission, JournalError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(JournalError::EmptyEntry);
        }

        let (entry, history, epoch) = {
            let mut state = self.state.write();
            let entry = Entry::new(text, Entry::next_color(state.journal.len()));
            self.attach_view(&mut state, &entry, true);
            state.journal.push(entry.clone());
            (entry, state.conversation.clone(), state.epoch)
        };
        info!(entry = %entry.id, chars = entry.text.len(), "journal entry added");

        let reply_text = self.buddy.reply(&history, &entry.text).await;

        let mut state = self.state.write();
        let reply = Entry::new(reply_text, Entry::next_color(state.buddy.len()));
        if state.epoch != epoch {
            debug!(entry = %entry.id, "journal replaced before buddy replied, reply dropped");
            return Ok(Submission { entry, reply });
        }
        self.attach_view(&mut state, &reply, false);
        state.buddy.push(reply.clone());
        state.conversation.push(ChatTurn::user(entry.text.clone()));
        state.conversation.push(ChatTurn::buddy(reply.text.clone()));
        Ok(Submission { entry, reply })
    }

    pub fn render_entry(&self, id: &str) -> Result<RenderedEntry, JournalError> {
        let state = self.state.read();
        state
            .views
            .get(id)
            .map(EntryView::render)
            .ok_or_else(|| JournalError::EntryNotFound(id.to_string()))
    }

    pub fn hover(
        &self,
        id: &str,
        key: &str,
        geometry: &HoverGeometry,
    ) -> Result<Option<HoverState>, JournalError> {
        let state = self.state.read();
        let view = state
            .views
            .get(id)
            .ok_or_else(|| JournalError::EntryNotFound(id.to_string()))?;
        Ok(view.pointer_enter(key, geometry))
    }

    pub fn leave(&self, id: &str) -> Result<(), JournalError> {
        let state = self.state.read();
        let view = state
            .views
            .get(id)
            .ok_or_else(|| JournalError::EntryNotFound(id.to_string()))?;
        view.pointer_leave();
        Ok(())
    }

    /// Creates an empty session and makes it active. Nothing changes in memory
    /// unless the store accepts the new session.
    pub async fn new_session(&self, name: &str) -> Result<String, JournalError> {
        let name = match name.trim() {
            "" => DEFAULT_SESSION_NAME,
            trimmed => trimmed,
        };
        let data = SessionData::named(name);
        let id = self.store.create(data.clone()).await.map_err(|err| {
            error!(error = %err, "failed to create session");
            err
        })?;
        self.service.clear();
        self.state.write().replace(Some(id.clone()), data, HashMap::new());
        info!(session = %id, name, "started new session");
        Ok(id)
    }

    /// Writes entries, conversation and learned vocabulary to the active
    /// session, creating one when none is active yet.
    pub async fn save_session(&self) -> Result<String, JournalError> {
        let (session_id, mut data, epoch) = {
            let state = self.state.read();
            (state.session_id.clone(), state.to_session_data(), state.epoch)
        };
        data.vocabulary_data = vocabulary_from_cache(self.service.export_all());

        let id = match session_id {
            Some(id) => match self.store.update(&id, SessionPatch::from(data.clone())).await {
                Ok(()) => id,
                Err(StoreError::NotFound { .. }) => {
                    info!(session = %id, "active session vanished from store, saving as new");
                    self.store.create(data).await.map_err(log_store_error)?
                }
                Err(err) => return Err(log_store_error(err).into()),
            },
            None => self.store.create(data).await.map_err(log_store_error)?,
        };
        let mut state = self.state.write();
        if state.epoch != epoch {
            debug!(session = %id, "journal replaced while saving, active session kept");
            return Ok(id);
        }
        state.session_id = Some(id.clone());
        info!(session = %id, "session saved");
        Ok(id)
    }

    /// Replaces the in-memory journal with a stored session. The cache is
    /// cleared before the stored vocabulary is restored.
    pub async fn load_session(&self, id: &str) -> Result<(), JournalError> {
        let mut data = self
            .store
            .read(id)
            .await
            .map_err(log_store_error)?
            .ok_or_else(|| JournalError::SessionNotFound(id.to_string()))?;

        self.service.clear();
        let vocabulary = std::mem::take(&mut data.vocabulary_data);
        self.service.restore_all(vocabulary_into_cache(vocabulary));

        let mut views = HashMap::new();
        for entry in &data.journal_entries {
            views.insert(entry.id.clone(), self.mounted_view(entry, true));
        }
        for entry in &data.buddy_entries {
            views.insert(entry.id.clone(), self.mounted_view(entry, false));
        }
        let entries = data.entry_count();
        self.state.write().replace(Some(id.to_string()), data, views);
        info!(session = %id, entries, "session loaded");
        Ok(())
    }

    /// Removes a stored session. Deleting the active one also resets the
    /// in-memory journal.
    pub async fn delete_session(&self, id: &str) -> Result<(), JournalError> {
        self.store.delete(id).await.map_err(|err| match err {
            StoreError::NotFound { .. } => JournalError::SessionNotFound(id.to_string()),
            other => log_store_error(other).into(),
        })?;
        let was_active = self.active_session().as_deref() == Some(id);
        if was_active {
            self.service.clear();
            self.state.write().replace(
                None,
                SessionData::named(DEFAULT_SESSION_NAME),
                HashMap::new(),
            );
        }
        info!(session = %id, was_active, "session deleted");
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, JournalError> {
        Ok(self.store.list_all().await.map_err(log_store_error)?)
    }

    pub async fn read_session(&self, id: &str) -> Result<SessionData, JournalError> {
        self.store
            .read(id)
            .await
            .map_err(log_store_error)?
            .ok_or_else(|| JournalError::SessionNotFound(id.to_string()))
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> Result<(), JournalError> {
        let patch = SessionPatch {
            name: Some(name.trim().to_string()),
            ..SessionPatch::default()
        };
        self.store.update(id, patch).await.map_err(|err| match err {
            StoreError::NotFound { .. } => JournalError::SessionNotFound(id.to_string()),
            other => log_store_error(other).into(),
        })?;
        let mut state = self.state.write();
        if state.session_id.as_deref() == Some(id) {
            state.session_name = name.trim().to_string();
        }
        Ok(())
    }

    fn attach_view(&self, state: &mut JournalState, entry: &Entry, annotations_enabled: bool) {
        let view = self.mounted_view(entry, annotations_enabled);
        state.views.insert(entry.id.clone(), view);
    }

    fn mounted_view(&self, entry: &Entry, annotations_enabled: bool) -> EntryView {
        let view = EntryView::new(&entry.text, annotations_enabled, Arc::clone(&self.service));
        view.mount();
        view
    }
}

fn log_store_error(err: StoreError) -> StoreError {
    error!(error = %err, "session store operation failed");
    err
}
