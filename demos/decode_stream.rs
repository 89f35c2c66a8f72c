//! Run the translation layer on a canned upstream stream, without a server.
//!
//! Usage:
//!   `cargo run --example decode_stream`

use deepsider_proxy::models::map_model;
use deepsider_proxy::translate::openai_types::{ChatCompletionRequest, ChatMessage, Role};
use deepsider_proxy::translate::request::{build_payload, build_prompt};
use deepsider_proxy::translate::response::ResponseAggregator;
use deepsider_proxy::translate::streaming::StreamTranslator;

const UPSTREAM: &str = concat!(
    "data: {\"code\":201,\"data\":{\"clId\":\"demo-conversation\"}}\n",
    "data: {\"code\":202,\"data\":{\"type\":\"chat\",\"content\":\"The capital of \",\"reasoning_content\":\"Recall geography.\"}}\n",
    "data: {\"code\":202,\"data\":{\"type\":\"chat\",\"content\":\"Germany is Berlin.\"}}\n",
    "data: {\"code\":203}\n",
);

fn main() -> anyhow::Result<()> {
    let request = ChatCompletionRequest {
        model: "gpt-4o".to_string(),
        messages: vec![
            ChatMessage::new(Role::System, "You are a geography expert. Be concise."),
            ChatMessage::new(Role::User, "What is the capital of France?"),
            ChatMessage::new(Role::Assistant, "Paris."),
            ChatMessage::new(Role::User, "And Germany?"),
        ],
        temperature: Some(0.7),
        top_p: None,
        n: None,
        stream: Some(true),
        stop: None,
        max_tokens: None,
        presence_penalty: None,
        frequency_penalty: None,
        user: None,
    };

    let prompt = build_prompt(&request.messages);
    let payload = build_payload(map_model(&request.model), prompt, &request, "Asia/Shanghai");

    println!("=== Upstream request ===");
    println!("{}", serde_json::to_string_pretty(&payload)?);

    // Feed the stream in awkward 7-byte pieces to show reassembly.
    println!("\n=== Streaming events ===");
    let mut translator = StreamTranslator::new("demo", &request.model, 0);
    let mut events = Vec::new();
    for piece in UPSTREAM.as_bytes().chunks(7) {
        events.extend(translator.push_bytes(piece));
    }
    events.extend(translator.finish());
    for event in &events {
        println!("data: {}\n", event.data());
    }

    println!("=== Non-streaming response ===");
    let mut aggregator = ResponseAggregator::new();
    aggregator.push_bytes(UPSTREAM.as_bytes());
    let completion = aggregator.finish("demo", &request.model, 0);
    println!("{}", serde_json::to_string_pretty(&completion)?);

    Ok(())
}
