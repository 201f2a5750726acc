use crate::llm::{GenerationRequest, TextGenerator};
use crate::session::{ChatRole, ChatTurn};
use std::sync::Arc;
use tracing::warn;

pub const FALLBACK_REPLY: &str =
    "Thanks for sharing that with me! I love reading your journal. What else happened today?";
const HISTORY_TURNS: usize = 10;

const PERSONA: &str = "You are Sprout, a warm and encouraging writing buddy for children aged 7 to 12. \
Reply to the child's newest journal entry in 2 or 3 short, simple sentences. Be kind and curious, \
celebrate their effort, never correct spelling or grammar, and finish with one gentle question \
that invites them to write more. Keep everything age-appropriate.";

/// Writes the friendly reply shown under each journal entry.
pub struct BuddyReplier {
    generator: Arc<dyn TextGenerator>,
}

impl BuddyReplier {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub async fn reply(&self, history: &[ChatTurn], entry: &str) -> String {
        let request = GenerationRequest::new(build_conversation(history, entry))
            .with_system_prompt(PERSONA)
            .with_temperature(0.8)
            .with_max_output_tokens(256);
        match self.generator.generate(request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("buddy reply was empty, using fallback");
                FALLBACK_REPLY.to_string()
            }
            Err(err) => {
                warn!(error = %err, "buddy reply failed, using fallback");
                FALLBACK_REPLY.to_string()
            }
        }
    }
}

fn build_conversation(history: &[ChatTurn], entry: &str) -> String {
    let start = history.len().saturating_sub(HISTORY_TURNS);
    let mut prompt = String::new();
    if start < history.len() {
        prompt.push_str("Conversation so far:\n");
        for turn in &history[start..] {
            let speaker = match turn.role {
                ChatRole::User => "Child",
                ChatRole::Buddy => "Sprout",
            };
            prompt.push_str(&format!("{speaker}: {}\n", turn.text.trim()));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("Newest journal entry:\n{}\n", entry.trim()));
    prompt
}
