//! State machine for translating the DeepSider frame stream into OpenAI chunks.
//!
//! The [`StreamTranslator`] owns the byte reassembly buffer and the per-request
//! accumulators. Content frames only accumulate; the end-of-stream frame is the
//! single point at which chunks are emitted, followed by the `[DONE]` sentinel.
//!
//! ```text
//! AwaitingFirstBytes -> Accumulating -> CaptchaTerminated
//!                                     | NormalTerminated
//!                                     | ErrorTerminated
//! ```
//!
//! Every terminal state emits the sentinel exactly once and ignores any input
//! that follows.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

use super::challenge::{self, MarkerScan};
use super::frames::FrameDecoder;
use super::openai_types::{ChatCompletionChunk, ChunkDelta};
use super::upstream_types::UpstreamFrame;

/// Shown to the caller in place of an answer when the upstream demands a captcha.
pub const CAPTCHA_NOTICE: &str =
    "\n[Captcha detected: please open the upstream client and complete the verification manually]";

/// Shown to the caller when the upstream byte stream breaks mid-response.
pub const STREAM_ERROR_NOTICE: &str = "\n\n[Error while processing the upstream response]";

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingFirstBytes,
    Accumulating,
    CaptchaTerminated,
    NormalTerminated,
    ErrorTerminated,
}

impl DecoderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CaptchaTerminated | Self::NormalTerminated | Self::ErrorTerminated
        )
    }
}

/// One event of the outbound stream.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Chunk(ChatCompletionChunk),
    Done,
}

impl OutboundEvent {
    /// The payload that follows `data: ` on the wire.
    pub fn data(&self) -> String {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Done => DONE_SENTINEL.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_chunk(&self) -> Option<&ChatCompletionChunk> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            Self::Done => None,
        }
    }
}

#[derive(Debug, Default)]
struct Challenge {
    detected: bool,
    raw: String,
    image: Option<String>,
}

#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    created: i64,
    model: String,
    state: DecoderState,
    frames: FrameDecoder,
    answer: String,
    reasoning: String,
    conversation_id: Option<String>,
    challenge: Challenge,
    markers: MarkerScan,
    /// Offset in `answer` at which each accumulated delta began.
    delta_starts: Vec<usize>,
}

impl StreamTranslator {
    /// `model` is the public id the caller asked for; it is echoed in every chunk.
    pub fn new(request_id: &str, model: &str, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            created,
            model: model.to_string(),
            state: DecoderState::AwaitingFirstBytes,
            frames: FrameDecoder::new(),
            answer: String::new(),
            reasoning: String::new(),
            conversation_id: None,
            challenge: Challenge::default(),
            markers: MarkerScan::default(),
            delta_starts: Vec::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn captcha_detected(&self) -> bool {
        self.challenge.detected
    }

    pub fn captcha_image(&self) -> Option<&str> {
        self.challenge.image.as_deref()
    }

    /// Feed one network read.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<OutboundEvent> {
        if self.is_terminated() {
            return Vec::new();
        }
        if self.state == DecoderState::AwaitingFirstBytes && !chunk.is_empty() {
            self.state = DecoderState::Accumulating;
        }

        let mut events = Vec::new();
        for frame in self.frames.push(chunk) {
            events.extend(self.process_frame(frame));
            if self.is_terminated() {
                break;
            }
        }
        events
    }

    /// Apply one already-decoded frame.
    pub fn process_frame(&mut self, frame: UpstreamFrame) -> Vec<OutboundEvent> {
        if self.is_terminated() {
            return Vec::new();
        }

        match frame {
            UpstreamFrame::SessionStarted { conversation_id } => {
                tracing::info!(conversation_id = ?conversation_id, "Upstream session started");
                self.conversation_id = conversation_id;
                Vec::new()
            }
            UpstreamFrame::ContentDelta {
                kind,
                content,
                reasoning_content,
            } if kind == "chat" => {
                self.accumulate(&content, &reasoning_content);
                Vec::new()
            }
            UpstreamFrame::StreamEnd => self.terminate(),
            UpstreamFrame::ContentDelta { .. } | UpstreamFrame::Unrecognized { .. } => Vec::new(),
        }
    }

    /// Call when the upstream closes. Flushes any undelimited final line, and
    /// terminates normally if no end frame was seen.
    pub fn finish(&mut self) -> Vec<OutboundEvent> {
        if self.is_terminated() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(frame) = self.frames.finish() {
            events.extend(self.process_frame(frame));
        }
        if !self.is_terminated() {
            tracing::warn!("Upstream closed without an end-of-stream frame");
            events.extend(self.terminate());
        }
        events
    }

    /// Call when reading from the upstream fails.
    pub fn fail(&mut self, reason: &str) -> Vec<OutboundEvent> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::error!(reason, "Upstream stream failed");
        self.state = DecoderState::ErrorTerminated;
        vec![
            self.chunk(ChunkDelta::content(STREAM_ERROR_NOTICE), Some("stop")),
            OutboundEvent::Done,
        ]
    }

    fn accumulate(&mut self, content: &str, reasoning: &str) {
        if challenge::is_challenge(content) {
            self.capture_challenge(content.to_string());
        } else if !self.challenge.detected {
            self.delta_starts.push(self.answer.len());
            self.answer.push_str(content);
            // The challenge may also arrive spread over several deltas; it
            // starts with the delta holding the earliest marker.
            if self.markers.update(&self.answer) {
                let first_marker = self.markers.start().unwrap_or(0);
                let from = self
                    .delta_starts
                    .iter()
                    .rev()
                    .find(|&&start| start <= first_marker)
                    .copied()
                    .unwrap_or(0);
                let raw = self.answer[from..].to_string();
                self.capture_challenge(raw);
            }
        }

        self.reasoning.push_str(reasoning);
    }

    fn capture_challenge(&mut self, raw: String) {
        tracing::warn!(
            conversation_id = ?self.conversation_id,
            "Upstream returned a captcha challenge"
        );
        self.challenge.image = challenge::extract_image(&raw);
        self.challenge.raw = raw;
        self.challenge.detected = true;
    }

    fn terminate(&mut self) -> Vec<OutboundEvent> {
        let captcha_ready = self.challenge.detected
            && self.challenge.image.is_some()
            && self.conversation_id.is_some();

        if captcha_ready {
            self.state = DecoderState::CaptchaTerminated;
            return vec![
                self.chunk(ChunkDelta::content(self.challenge.raw.clone()), None),
                self.chunk(ChunkDelta::content(CAPTCHA_NOTICE), Some("stop")),
                OutboundEvent::Done,
            ];
        }

        self.state = DecoderState::NormalTerminated;
        let mut events = Vec::with_capacity(4);
        if !self.answer.is_empty() {
            events.push(self.chunk(ChunkDelta::content(self.answer.clone()), None));
        }
        if !self.reasoning.is_empty() {
            events.push(self.chunk(ChunkDelta::reasoning(self.reasoning.clone()), None));
        }
        events.push(self.chunk(ChunkDelta::default(), Some("stop")));
        events.push(OutboundEvent::Done);
        events
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> OutboundEvent {
        OutboundEvent::Chunk(ChatCompletionChunk::new(
            &self.id,
            self.created,
            &self.model,
            delta,
            finish_reason,
        ))
    }
}

/// Drive a translator over a live byte stream.
///
/// Events are produced lazily as the consumer polls, so dropping the returned
/// stream stops reading from the upstream.
pub fn translate_stream<S, E>(
    byte_stream: S,
    mut translator: StreamTranslator,
) -> impl Stream<Item = OutboundEvent> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        tokio::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let events = match chunk_result {
                Ok(chunk) => translator.push_bytes(&chunk),
                Err(e) => translator.fail(&e.to_string()),
            };
            for event in events {
                yield event;
            }
            if translator.is_terminated() {
                break;
            }
        }

        for event in translator.finish() {
            yield event;
        }
    }
}
