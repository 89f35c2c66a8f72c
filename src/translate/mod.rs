//! API translation between the `OpenAI` and DeepSider formats.
//!
//! The core of the gateway: flattens requests into upstream prompts and turns
//! the upstream frame stream back into `OpenAI` chunks or completions. All
//! translation types are pure (no I/O); [`streaming::translate_stream`] only
//! adapts them onto an async byte stream.

pub mod challenge;
pub mod frames;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod upstream_types;
