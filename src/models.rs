//! Public model identifiers and their upstream counterparts.

/// Upstream model used for any public id that has no explicit mapping.
pub const DEFAULT_UPSTREAM_MODEL: &str = "anthropic/claude-3.7-sonnet";

const MODEL_TABLE: &[(&str, &str)] = &[
    ("gpt-4o", "openai/gpt-4o"),
    ("gpt-4.1", "openai/gpt-4.1"),
    ("gpt-4o-image", "openai/gpt-4o-image"),
    ("claude-3.5-sonnet", "anthropic/claude-3.5-sonnet"),
    ("claude-3.7-sonnet", "anthropic/claude-3.7-sonnet"),
    ("o1", "openai/o1"),
    ("o3-mini", "openai/o3-mini"),
    ("gemini-2.0-flash", "google/gemini-2.0-flash"),
    ("grok-3", "x-ai/grok-3"),
    ("grok-3-reasoner", "x-ai/grok-3-reasoner"),
    ("deepseek-chat", "deepseek/deepseek-chat"),
    ("deepseek-r1", "deepseek/deepseek-r1"),
    ("qwq-32b", "qwen/qwq-32b"),
    ("qwen-max", "qwen/qwen-max"),
];

/// Translate a public model id into the upstream's id. Never fails.
#[must_use]
pub fn map_model(public_id: &str) -> &'static str {
    MODEL_TABLE
        .iter()
        .find(|(public, _)| *public == public_id)
        .map_or(DEFAULT_UPSTREAM_MODEL, |(_, upstream)| upstream)
}

/// Public ids in table order.
#[must_use]
pub fn supported_models() -> Vec<&'static str> {
    MODEL_TABLE.iter().map(|(public, _)| *public).collect()
}
