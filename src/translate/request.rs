//! Translate OpenAI chat requests into DeepSider conversation requests.
//!
//! The upstream takes a single prompt string rather than a message list, so
//! the conversation is flattened into role-tagged paragraphs. System messages
//! are hoisted to the front; everything else keeps its order.

use super::openai_types::{ChatCompletionRequest, ChatMessage, Role};
use super::upstream_types::ConversationRequest;

const WEB_ACCESS_CLOSED: &str = "close";

/// Flatten a conversation into the upstream prompt format.
pub fn build_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();

    for msg in messages {
        let content = msg.content.as_text();
        match &msg.role {
            // Each system message goes in front of everything built so far.
            Role::System => prompt.insert_str(0, &format!("{content}\n\n")),
            Role::User => prompt.push_str(&format!("Human: {content}\n\n")),
            Role::Assistant => prompt.push_str(&format!("Assistant: {content}\n\n")),
            Role::Other(role) => prompt.push_str(&format!("Human ({role}): {content}\n\n")),
        }
    }

    // Cue the upstream to answer when the conversation does not end on a user turn.
    if messages.last().is_some_and(|m| m.role != Role::User) {
        prompt.push_str("Human: ");
    }

    prompt.trim().to_string()
}

/// Assemble the upstream payload. Sampling values are forwarded unvalidated.
pub fn build_payload(
    upstream_model: &str,
    prompt: String,
    req: &ChatCompletionRequest,
    timezone: &str,
) -> ConversationRequest {
    ConversationRequest {
        model: upstream_model.to_string(),
        prompt,
        web_access: WEB_ACCESS_CLOSED.to_string(),
        timezone: timezone.to_string(),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
    }
}
