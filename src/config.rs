//! Runtime settings and the wiring that turns them into a [`Journal`].

use crate::buddy::BuddyReplier;
use crate::cache::SynonymService;
use crate::journal::Journal;
use crate::llm::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_TIMEOUT, DisabledGenerator, GeminiClient, LlmError,
    TextGenerator,
};
use crate::session::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
use crate::synonyms::SynonymProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_LOG_FILTER: &str = "wordsprout=info,tower_http=info,warn";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not configure text generation client: {0}")]
    Llm(#[from] LlmError),
    #[error("could not open session store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub model: String,
    pub llm_endpoint: String,
    pub llm_timeout: Duration,
    /// `None` keeps sessions in memory for the life of the process.
    pub session_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            llm_endpoint: DEFAULT_ENDPOINT.to_string(),
            llm_timeout: DEFAULT_TIMEOUT,
            session_dir: None,
        }
    }
}

impl Settings {
    pub fn build_generator(&self) -> Result<Arc<dyn TextGenerator>, ConfigError> {
        let Some(api_key) = self.api_key.as_deref().filter(|key| !key.trim().is_empty()) else {
            warn!("GEMINI_API_KEY is not set; synonyms and buddy replies are disabled");
            return Ok(Arc::new(DisabledGenerator));
        };
        let client = GeminiClient::with_options(
            api_key,
            self.model.clone(),
            self.llm_endpoint.clone(),
            self.llm_timeout,
        )?;
        info!(
            model = client.model(),
            timeout_secs = self.llm_timeout.as_secs(),
            "text generation enabled"
        );
        Ok(Arc::new(client))
    }

    pub fn build_store(&self) -> Result<Arc<dyn SessionStore>, ConfigError> {
        match &self.session_dir {
            Some(dir) => {
                let store = FileSessionStore::new(dir.clone())?;
                info!(dir = %store.dir().display(), "file session store ready");
                Ok(Arc::new(store))
            }
            None => {
                info!("no session directory configured, sessions live in memory");
                Ok(Arc::new(MemorySessionStore::new()))
            }
        }
    }

    /// One generator backs both the synonym provider and the buddy.
    pub fn build_journal(&self) -> Result<Journal, ConfigError> {
        let generator = self.build_generator()?;
        let service = Arc::new(SynonymService::new(SynonymProvider::new(Arc::clone(
            &generator,
        ))));
        let buddy = BuddyReplier::new(generator);
        Ok(Journal::new(service, buddy, self.build_store()?))
    }
}
