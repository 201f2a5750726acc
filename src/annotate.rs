//! Per-entry annotation state and tooltip placement.
//!
//! An [`EntryView`] owns the tokenized text of one displayed entry and moves
//! through `Idle -> Loading -> Ready <-> HoverActive`. Lookups run on the
//! shared [`SynonymService`]; the task applying their result only holds a weak
//! reference to the view, so a view that is gone simply never sees it.

use crate::cache::SynonymService;
use crate::synonyms::SynonymMap;
use crate::tokenizer::{self, Segment, TokenKind};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::debug;

/// Distance between the tooltip anchor and the top edge of the word.
pub const TOOLTIP_OFFSET_Y: f64 = 8.0;
pub const TOOLTIP_BASE_WIDTH: f64 = 60.0;
pub const TOOLTIP_CHAR_WIDTH: f64 = 7.0;
pub const TOOLTIP_PADDING: f64 = 24.0;
pub const VIEWPORT_MARGIN: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationPhase {
    Idle,
    Loading,
    Ready,
    HoverActive,
}

/// Screen-space box, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn mid_x(&self) -> f64 {
        self.left + self.width / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverGeometry {
    pub word: Rect,
    pub container: Rect,
    pub viewport_width: f64,
}

/// Tooltip anchor relative to the entry container. `x` is the horizontal
/// center of the tooltip, `y` its bottom edge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TooltipPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverState {
    pub hovered_word_key: String,
    pub tooltip_position: TooltipPosition,
    pub active_synonyms: Vec<String>,
}

/// Estimated rendered width of a tooltip listing `synonyms`.
pub fn estimate_tooltip_width(synonyms: &[String]) -> f64 {
    let chars = synonyms.join(", ").chars().count() as f64;
    TOOLTIP_BASE_WIDTH + chars * TOOLTIP_CHAR_WIDTH + TOOLTIP_PADDING
}

/// Centers the tooltip over the word, shifted so its estimated footprint
/// stays inside the viewport margins.
pub fn place_tooltip(
    word: &Rect,
    container: &Rect,
    viewport_width: f64,
    synonyms: &[String],
) -> TooltipPosition {
    let half = estimate_tooltip_width(synonyms) / 2.0;
    let mut x = word.mid_x() - container.left;
    let y = word.top - container.top - TOOLTIP_OFFSET_Y;

    let absolute_left = container.left + x - half;
    let absolute_right = container.left + x + half;
    if absolute_left < VIEWPORT_MARGIN {
        x = VIEWPORT_MARGIN + half - container.left;
    } else if absolute_right > viewport_width - VIEWPORT_MARGIN {
        x = viewport_width - VIEWPORT_MARGIN - half - container.left;
    }
    TooltipPosition { x, y }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderedKind {
    Word,
    Whitespace,
    Delimiter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedToken {
    pub kind: RenderedKind,
    pub text: String,
    /// `"{segment}:{token}"` for words, used as the hover key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub interactive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synonyms: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedEntry {
    pub phase: AnnotationPhase,
    pub annotations_enabled: bool,
    pub tokens: Vec<RenderedToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hover: Option<HoverState>,
}

impl RenderedEntry {
    pub fn interactive_words(&self) -> impl Iterator<Item = &RenderedToken> {
        self.tokens.iter().filter(|token| token.interactive)
    }
}

struct ViewState {
    phase: AnnotationPhase,
    mounted: bool,
    /// Incremented by every mount; only the latest mount's lookups apply.
    mount_count: u64,
    maps: HashMap<usize, SynonymMap>,
    hover: Option<HoverState>,
}

pub struct EntryView {
    segments: Vec<Segment>,
    annotations_enabled: bool,
    service: Arc<SynonymService>,
    state: Arc<Mutex<ViewState>>,
}

impl EntryView {
    pub fn new(text: &str, annotations_enabled: bool, service: Arc<SynonymService>) -> Self {
        Self {
            segments: tokenizer::tokenize(text),
            annotations_enabled,
            service,
            state: Arc::new(Mutex::new(ViewState {
                phase: AnnotationPhase::Idle,
                mounted: false,
                mount_count: 0,
                maps: HashMap::new(),
                hover: None,
            })),
        }
    }

    pub fn phase(&self) -> AnnotationPhase {
        self.state.lock().phase
    }

    pub fn annotations_enabled(&self) -> bool {
        self.annotations_enabled
    }

    /// Starts synonym lookups for sentences missing from the cache. Only the
    /// first call from `Idle` does anything; the returned handle resolves once
    /// the lookup result has been applied or discarded.
    pub fn mount(&self) -> Option<JoinHandle<()>> {
        let mut state = self.state.lock();
        if state.phase != AnnotationPhase::Idle {
            return None;
        }
        state.mounted = true;
        state.mount_count += 1;
        if !self.annotations_enabled {
            state.phase = AnnotationPhase::Ready;
            return None;
        }

        let mut pending = Vec::new();
        for (idx, sentence) in tokenizer::sentences(&self.segments) {
            match self.service.cached(sentence) {
                Some(map) => {
                    state.maps.insert(idx, map);
                }
                None => pending.push((idx, sentence.to_string())),
            }
        }
        if pending.is_empty() {
            state.phase = AnnotationPhase::Ready;
            return None;
        }
        state.phase = AnnotationPhase::Loading;
        let mount = state.mount_count;
        drop(state);

        let weak = Arc::downgrade(&self.state);
        let service = Arc::clone(&self.service);
        Some(tokio::spawn(async move {
            let lookups = pending.into_iter().map(|(idx, sentence)| {
                let service = Arc::clone(&service);
                async move { (idx, service.lookup(&sentence).await) }
            });
            let results = join_all(lookups).await;
            apply_lookups(&weak, mount, results);
        }))
    }

    /// Detaches the view; results still in flight are discarded on arrival.
    /// A view unmounted while loading goes back to `Idle` and can be mounted
    /// again.
    pub fn unmount(&self) {
        let mut state = self.state.lock();
        state.mounted = false;
        state.hover = None;
        if state.phase == AnnotationPhase::Loading {
            state.phase = AnnotationPhase::Idle;
            state.maps.clear();
        }
    }

    pub fn render(&self) -> RenderedEntry {
        let state = self.state.lock();
        let mut tokens = Vec::new();
        for (segment_idx, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Delimiter { text } => tokens.push(RenderedToken {
                    kind: RenderedKind::Delimiter,
                    text: text.clone(),
                    key: None,
                    interactive: false,
                    synonyms: None,
                }),
                Segment::Sentence {
                    tokens: sentence_tokens,
                    ..
                } => {
                    let map = state.maps.get(&segment_idx);
                    for (token_idx, token) in sentence_tokens.iter().enumerate() {
                        if token.kind == TokenKind::Whitespace {
                            tokens.push(RenderedToken {
                                kind: RenderedKind::Whitespace,
                                text: token.text.clone(),
                                key: None,
                                interactive: false,
                                synonyms: None,
                            });
                            continue;
                        }
                        let synonyms = self.synonyms_for(map, &token.text);
                        tokens.push(RenderedToken {
                            kind: RenderedKind::Word,
                            text: token.text.clone(),
                            key: Some(word_key(segment_idx, token_idx)),
                            interactive: synonyms.is_some(),
                            synonyms,
                        });
                    }
                }
            }
        }
        RenderedEntry {
            phase: state.phase,
            annotations_enabled: self.annotations_enabled,
            tokens,
            hover: state.hover.clone(),
        }
    }

    /// Pointer entered the word at `key`. Returns the hover state when the
    /// word is interactive and the view is ready.
    pub fn pointer_enter(&self, key: &str, geometry: &HoverGeometry) -> Option<HoverState> {
        let (segment_idx, token_idx) = parse_word_key(key)?;
        let mut state = self.state.lock();
        if !state.mounted
            || !matches!(
                state.phase,
                AnnotationPhase::Ready | AnnotationPhase::HoverActive
            )
        {
            return None;
        }
        let Segment::Sentence { tokens, .. } = self.segments.get(segment_idx)? else {
            return None;
        };
        let token = tokens.get(token_idx).filter(|t| t.is_word())?;
        let synonyms = self.synonyms_for(state.maps.get(&segment_idx), &token.text)?;

        let hover = HoverState {
            hovered_word_key: key.to_string(),
            tooltip_position: place_tooltip(
                &geometry.word,
                &geometry.container,
                geometry.viewport_width,
                &synonyms,
            ),
            active_synonyms: synonyms,
        };
        state.hover = Some(hover.clone());
        state.phase = AnnotationPhase::HoverActive;
        Some(hover)
    }

    pub fn pointer_leave(&self) {
        let mut state = self.state.lock();
        state.hover = None;
        if state.phase == AnnotationPhase::HoverActive {
            state.phase = AnnotationPhase::Ready;
        }
    }

    fn synonyms_for(&self, map: Option<&SynonymMap>, word: &str) -> Option<Vec<String>> {
        if !self.annotations_enabled {
            return None;
        }
        map?.get(&tokenizer::normalize_word(word)).cloned()
    }
}

impl Drop for EntryView {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn apply_lookups(view: &Weak<Mutex<ViewState>>, mount: u64, results: Vec<(usize, SynonymMap)>) {
    let Some(state) = view.upgrade() else {
        debug!("entry view dropped before synonyms arrived");
        return;
    };
    let mut state = state.lock();
    if !state.mounted || state.mount_count != mount {
        debug!("entry view unmounted before synonyms arrived");
        return;
    }
    for (idx, map) in results {
        state.maps.insert(idx, map);
    }
    if state.phase == AnnotationPhase::Loading {
        state.phase = AnnotationPhase::Ready;
    }
}

fn word_key(segment: usize, token: usize) -> String {
    format!("{segment}:{token}")
}

fn parse_word_key(key: &str) -> Option<(usize, usize)> {
    let (segment, token) = key.split_once(':')?;
    Some((segment.parse().ok()?, token.parse().ok()?))
}
