//! Wire types for the DeepSider chat API.
//!
//! Requests are plain JSON. Responses arrive as newline-delimited
//! `data: {json}` frames whose meaning is carried by an integer `code`.

use serde::{Deserialize, Serialize};

/// Prefix that marks a frame line in the upstream stream.
pub const FRAME_PREFIX: &str = "data: ";

pub const CODE_SESSION_STARTED: i64 = 201;
pub const CODE_CONTENT_DELTA: i64 = 202;
pub const CODE_STREAM_END: i64 = 203;

// ---------------------------------------------------------------------------
// Request payload (what we send TO the upstream)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub model: String,
    pub prompt: String,
    #[serde(rename = "webAccess")]
    pub web_access: String,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

// ---------------------------------------------------------------------------
// Stream frames (what the upstream sends back)
// ---------------------------------------------------------------------------

/// One classified upstream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    /// Code 201. Carries the upstream conversation id when present.
    SessionStarted { conversation_id: Option<String> },
    /// Code 202. `kind` is the `type` discriminator; only `"chat"` carries answer text.
    ContentDelta {
        kind: String,
        content: String,
        reasoning_content: String,
    },
    /// Code 203.
    StreamEnd,
    /// Any other code, or no code at all.
    Unrecognized { code: Option<i64> },
}

impl UpstreamFrame {
    /// Parse the JSON body of a frame line.
    ///
    /// Only syntactically invalid JSON is an error. Any well-formed object,
    /// including one with unexpected field types, classifies to some variant.
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        let raw = if value.is_object() {
            RawFrame::deserialize(value).unwrap_or_default()
        } else {
            RawFrame::default()
        };
        let data = raw.data.unwrap_or_default();

        match raw.code {
            Some(CODE_SESSION_STARTED) => Self::SessionStarted {
                conversation_id: data.cl_id,
            },
            Some(CODE_CONTENT_DELTA) => Self::ContentDelta {
                kind: data.kind.unwrap_or_default(),
                content: data.content.unwrap_or_default(),
                reasoning_content: data.reasoning_content.unwrap_or_default(),
            },
            Some(CODE_STREAM_END) => Self::StreamEnd,
            code => Self::Unrecognized { code },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    #[serde(default, deserialize_with = "lenient")]
    code: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    data: Option<RawFrameData>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFrameData {
    #[serde(rename = "clId", default, deserialize_with = "lenient")]
    cl_id: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    content: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    reasoning_content: Option<String>,
}

/// Treat a field of the wrong shape as absent instead of failing the frame.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

/// Quota amounts are integral in practice; fractional values are truncated.
fn amount<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0))
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaResponse {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub data: Option<QuotaData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaData {
    #[serde(default)]
    pub list: Vec<QuotaEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaEntry {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "amount")]
    pub total: i64,
    #[serde(default, deserialize_with = "amount")]
    pub available: i64,
    #[serde(default)]
    pub title: String,
}
