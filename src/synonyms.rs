use crate::llm::{GenerationRequest, TextGenerator};
use crate::tokenizer::normalize_word;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Normalized word to its suggested replacements, in the order suggested.
pub type SynonymMap = BTreeMap<String, Vec<String>>;

pub const MAX_SYNONYMS: usize = 5;
const REQUESTED_SYNONYMS: usize = 3;

static FIRST_BRACES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*?\}").expect("valid brace pattern"));
static SINGLE_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("valid object pattern"));

const TARGET_CATEGORIES: &[&str] = &[
    "intensifiers (very, really, so, super)",
    "basic emotions (happy, sad, mad, scared)",
    "simple verbs (go, get, make, say, see)",
    "generic adjectives (good, bad, nice, big, small, fun)",
    "overused filler words (stuff, things, a lot)",
];

const EXCLUDED_WORDS: &[&str] = &[
    "function words (the, a, and, but, because)",
    "pronouns (I, you, he, she, they, it)",
    "prepositions (in, on, at, with, to)",
    "words that are already advanced vocabulary",
];

/// Turns one sentence into word suggestions via the text generator.
pub struct SynonymProvider {
    generator: Arc<dyn TextGenerator>,
}

impl SynonymProvider {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// Never fails: call errors and unparseable replies both yield an empty map.
    pub async fn lookup(&self, sentence: &str) -> SynonymMap {
        let request = GenerationRequest::new(build_prompt(sentence))
            .with_temperature(0.3)
            .json();
        match self.generator.generate(request).await {
            Ok(reply) => parse_synonym_response(&reply),
            Err(err) => {
                warn!(error = %err, "synonym lookup failed, continuing without suggestions");
                SynonymMap::new()
            }
        }
    }
}

pub fn build_prompt(sentence: &str) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You help children grow their vocabulary. Read the sentence below and find the simple, \
         everyday words a young writer could swap for a more interesting word.\n\n",
    );
    prompt.push_str("Look for:\n");
    for category in TARGET_CATEGORIES {
        prompt.push_str("- ");
        prompt.push_str(category);
        prompt.push('\n');
    }
    prompt.push_str("\nNever pick:\n");
    for excluded in EXCLUDED_WORDS {
        prompt.push_str("- ");
        prompt.push_str(excluded);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nFor every word you pick, give exactly {REQUESTED_SYNONYMS} kid-friendly synonyms that \
         fit the sentence.\nAnswer with strict JSON only: an object whose keys are the picked \
         words exactly as written (lowercase) and whose values are arrays of {REQUESTED_SYNONYMS} \
         strings. If no word qualifies, answer {{}}.\n\nSentence: \"{}\"\n",
        sentence.trim()
    ));
    prompt
}

/// Recovery stages applied in order to free-form model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    /// First non-greedy `{...}` span anywhere in the reply.
    FirstBraces,
    /// Newlines and tabs removed, then the first brace-free object.
    Flattened,
}

impl ParseStage {
    pub const CHAIN: [ParseStage; 2] = [ParseStage::FirstBraces, ParseStage::Flattened];

    fn candidate(self, reply: &str) -> Option<String> {
        match self {
            ParseStage::FirstBraces => FIRST_BRACES.find(reply).map(|m| m.as_str().to_string()),
            ParseStage::Flattened => {
                let flat: String = reply
                    .chars()
                    .filter(|ch| !matches!(ch, '\n' | '\r' | '\t'))
                    .collect();
                SINGLE_OBJECT.find(&flat).map(|m| m.as_str().to_string())
            }
        }
    }
}

/// Parses a model reply into a synonym map. Anything that is not a non-empty
/// JSON object of string lists becomes the empty map.
pub fn parse_synonym_response(reply: &str) -> SynonymMap {
    for stage in ParseStage::CHAIN {
        let Some(candidate) = stage.candidate(reply) else {
            continue;
        };
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                if let Some(map) = map_from_value(value) {
                    debug!(?stage, words = map.len(), "parsed synonym reply");
                    return map;
                }
            }
            Err(err) => debug!(?stage, error = %err, "synonym reply stage did not parse"),
        }
    }
    SynonymMap::new()
}

fn map_from_value(value: Value) -> Option<SynonymMap> {
    let Value::Object(object) = value else {
        return None;
    };
    let mut map = SynonymMap::new();
    for (word, suggestions) in object {
        let key = normalize_word(&word);
        if key.is_empty() || map.contains_key(&key) {
            continue;
        }
        let Value::Array(items) = suggestions else {
            continue;
        };
        let synonyms: Vec<String> = items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(MAX_SYNONYMS)
            .map(str::to_string)
            .collect();
        if !synonyms.is_empty() {
            map.insert(key, synonyms);
        }
    }
    if map.is_empty() { None } else { Some(map) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::llm::ResponseFormat;
    use crate::llm::testing::ScriptedGenerator;

    fn list(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn preamble_and_trailing_text_are_ignored() {
        let map = parse_synonym_response(
            "Some preamble {\"very\":[\"extremely\",\"incredibly\",\"remarkably\"]} trailing",
        );
        assert_eq!(map.len(), 1);
        assert_eq!(
            map["very"],
            list(&["extremely", "incredibly", "remarkably"])
        );
    }

    #[test]
    fn no_json_yields_empty_map() {
        assert!(parse_synonym_response("no json here").is_empty());
    }

    #[test]
    fn empty_object_yields_empty_map() {
        assert!(parse_synonym_response("{}").is_empty());
    }

    #[test]
    fn multiline_reply_parses() {
        let reply = "```json\n{\n  \"happy\": [\"joyful\", \"cheerful\", \"glad\"],\n  \"big\": [\"huge\", \"giant\", \"enormous\"]\n}\n```";
        let map = parse_synonym_response(reply);
        assert_eq!(map.len(), 2);
        assert_eq!(map["big"], list(&["huge", "giant", "enormous"]));
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(parse_synonym_response("[\"very\"]").is_empty());
        assert!(parse_synonym_response("{\"very\": \"extremely\"}").is_empty());
    }

    #[test]
    fn keys_are_normalized_and_lists_trimmed() {
        let map = parse_synonym_response(
            r#"{"Good!": ["great", " ", "super", "fine", "swell", "dandy", "grand"]}"#,
        );
        assert_eq!(
            map["good"],
            list(&["great", "super", "fine", "swell", "dandy"])
        );
    }

    #[test]
    fn prompt_embeds_sentence_and_rubric() {
        let prompt = build_prompt("  I was very sad. ");
        assert!(prompt.contains("Sentence: \"I was very sad.\""));
        assert!(prompt.contains("intensifiers"));
        assert!(prompt.contains("pronouns"));
        assert!(prompt.contains("exactly 3"));
    }

    #[tokio::test]
    async fn lookup_requests_json_and_parses_reply() {
        let generator = Arc::new(ScriptedGenerator::always(
            r#"{"sad": ["unhappy", "gloomy", "downhearted"]}"#,
        ));
        let provider = SynonymProvider::new(generator.clone());
        let map = provider.lookup("I was sad").await;
        assert_eq!(map["sad"], list(&["unhappy", "gloomy", "downhearted"]));
        let request = generator.last_request().unwrap();
        assert_eq!(request.format, ResponseFormat::Json);
    }

    #[tokio::test]
    async fn lookup_degrades_on_call_failure() {
        let generator = Arc::new(ScriptedGenerator::always("{}"));
        generator.push(Err(LlmError::NotConfigured));
        let provider = SynonymProvider::new(generator);
        assert!(provider.lookup("I was sad").await.is_empty());
    }
}
