use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+").expect("valid sentence break pattern"));
static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Characters removed from a word before it is compared against a synonym map.
pub const STRIPPED_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':', '"', '(', ')'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Word,
    Whitespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    /// Normalized form used for synonym lookups. `None` for whitespace.
    pub fn normalized(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(normalize_word(&self.text)),
            TokenKind::Whitespace => None,
        }
    }

    pub fn is_word(&self) -> bool {
        self.kind == TokenKind::Word
    }
}

/// One span of a tokenized line. Concatenating every segment's text in order
/// reproduces the original input byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Sentence { text: String, tokens: Vec<Token> },
    Delimiter { text: String },
}

impl Segment {
    pub fn text(&self) -> &str {
        match self {
            Segment::Sentence { text, .. } => text,
            Segment::Delimiter { text } => text,
        }
    }

    /// True for sentence spans holding at least one word token.
    pub fn has_words(&self) -> bool {
        match self {
            Segment::Sentence { tokens, .. } => tokens.iter().any(Token::is_word),
            Segment::Delimiter { .. } => false,
        }
    }
}

/// Splits `text` into sentence and delimiter segments, then each sentence into
/// word and whitespace tokens.
pub fn tokenize(text: &str) -> Vec<Segment> {
    split_keeping(&SENTENCE_BREAK, text)
        .into_iter()
        .map(|(is_break, span)| {
            if is_break {
                Segment::Delimiter {
                    text: span.to_string(),
                }
            } else {
                Segment::Sentence {
                    text: span.to_string(),
                    tokens: tokenize_sentence(span),
                }
            }
        })
        .collect()
}

fn tokenize_sentence(sentence: &str) -> Vec<Token> {
    split_keeping(&WHITESPACE, sentence)
        .into_iter()
        .map(|(is_space, span)| Token {
            kind: if is_space {
                TokenKind::Whitespace
            } else {
                TokenKind::Word
            },
            text: span.to_string(),
        })
        .collect()
}

/// Returns the sentence spans that contain words, with their segment index.
pub fn sentences(segments: &[Segment]) -> impl Iterator<Item = (usize, &str)> + '_ {
    segments
        .iter()
        .enumerate()
        .filter(|(_, segment)| segment.has_words())
        .map(|(idx, segment)| (idx, segment.text()))
}

pub fn normalize_word(word: &str) -> String {
    word.chars()
        .filter(|ch| !STRIPPED_PUNCTUATION.contains(ch))
        .collect::<String>()
        .trim()
        .to_lowercase()
}

/// Cache key for a sentence.
pub fn normalize_sentence(sentence: &str) -> String {
    sentence.trim().to_lowercase()
}

fn split_keeping<'a>(pattern: &Regex, text: &'a str) -> Vec<(bool, &'a str)> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    for found in pattern.find_iter(text) {
        if found.start() > cursor {
            spans.push((false, &text[cursor..found.start()]));
        }
        spans.push((true, found.as_str()));
        cursor = found.end();
    }
    if cursor < text.len() {
        spans.push((false, &text[cursor..]));
    }
    spans
}
