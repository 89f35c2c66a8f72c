//! Collect a complete upstream frame stream into one OpenAI completion.
//!
//! Classification matches the streaming path for session and content frames,
//! but the end frame carries no meaning here and captcha detection is not
//! applied: whatever the upstream sent as chat content is returned verbatim.

use super::frames::FrameDecoder;
use super::openai_types::{ChatCompletionResponse, ChatUsage, Choice, ChoiceMessage};
use super::upstream_types::UpstreamFrame;

#[derive(Debug, Default)]
pub struct ResponseAggregator {
    frames: FrameDecoder,
    answer: String,
    reasoning: String,
    conversation_id: Option<String>,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        for frame in self.frames.push(chunk) {
            self.process_frame(frame);
        }
    }

    pub fn process_frame(&mut self, frame: UpstreamFrame) {
        match frame {
            UpstreamFrame::SessionStarted { conversation_id } => {
                self.conversation_id = conversation_id;
            }
            UpstreamFrame::ContentDelta {
                kind,
                content,
                reasoning_content,
            } if kind == "chat" => {
                self.answer.push_str(&content);
                self.reasoning.push_str(&reasoning_content);
            }
            _ => {}
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Flush the last undelimited line and build the final object.
    pub fn finish(mut self, request_id: &str, model: &str, created: i64) -> ChatCompletionResponse {
        if let Some(frame) = self.frames.finish() {
            self.process_frame(frame);
        }

        let reasoning_content = if self.reasoning.is_empty() {
            None
        } else {
            Some(self.reasoning)
        };

        ChatCompletionResponse {
            id: format!("chatcmpl-{request_id}"),
            object: "chat.completion".to_string(),
            created,
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: self.answer,
                    reasoning_content,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: ChatUsage::default(),
        }
    }
}
