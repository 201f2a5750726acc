//! Journaling companion for young writers.
//!
//! Entries are split into sentences, each sentence is sent once to a text
//! generation service for richer synonyms, and matching words become hover
//! targets. A buddy persona replies to every entry, and whole journals can be
//! saved to and restored from a session store.

pub mod annotate;
pub mod buddy;
pub mod cache;
pub mod config;
pub mod journal;
pub mod llm;
pub mod session;
pub mod synonyms;
pub mod tokenizer;
#[cfg(feature = "web")]
pub mod web;

pub use annotate::{
    AnnotationPhase, EntryView, HoverGeometry, HoverState, Rect, RenderedEntry, RenderedToken,
    TooltipPosition, estimate_tooltip_width, place_tooltip,
};
pub use buddy::BuddyReplier;
pub use cache::{SynonymCache, SynonymService};
pub use config::{ConfigError, DEFAULT_LOG_FILTER, Settings};
pub use journal::{Journal, JournalError, Submission};
pub use llm::{DisabledGenerator, GeminiClient, GenerationRequest, LlmError, TextGenerator};
pub use session::{
    Entry, FileSessionStore, MemorySessionStore, Notebook, SessionData, SessionPatch,
    SessionStore, SessionSummary, StoreError,
};
pub use synonyms::{SynonymMap, SynonymProvider, parse_synonym_response};
pub use tokenizer::{Segment, Token, TokenKind, normalize_sentence, normalize_word, tokenize};
