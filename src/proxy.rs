use crate::config::ProxyConfig;
use crate::credentials::Rotator;
use crate::error::{ProxyError, Result};
use crate::logging::{RequestLogger, SharedLogger};
use crate::models::map_model;
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::translate::request::{build_payload, build_prompt};
use crate::translate::response::ResponseAggregator;
use crate::translate::streaming::{translate_stream, OutboundEvent, StreamTranslator};
use crate::translate::upstream_types::{ConversationRequest, QuotaEntry, QuotaResponse};

use futures::stream::{Stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, ORIGIN, USER_AGENT,
};
use serde::Serialize;
use std::pin::Pin;

/// Outbound OpenAI events for one streaming request.
pub type EventStream = Pin<Box<dyn Stream<Item = OutboundEvent> + Send>>;

const CLIENT_ORIGIN: &str = "chrome-extension://client";
const CLIENT_VERSION: &str = "1.1.64";
const CLIENT_LANG: &str = "zh-CN";
const CLIENT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7";
const CLIENT_SEC_CH_UA: &str = r#""Chromium";v="134", "Not:A-Brand";v="24""#;
const CLIENT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36";

/// Build the shared upstream client with the configured connect and read timeouts.
pub fn build_client(config: &ProxyConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.timeout())
        .read_timeout(config.timeout())
        .build()?;
    Ok(client)
}

/// Everything needed to issue one chat request upstream.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request_id: String,
    pub created: i64,
    /// The id the caller asked for, echoed back in responses.
    pub public_model: String,
    pub payload: ConversationRequest,
    pub secret: String,
    pub credential_index: Option<usize>,
}

impl PreparedRequest {
    pub fn new(
        req: &ChatCompletionRequest,
        credentials: &str,
        rotator: &Rotator,
        config: &ProxyConfig,
    ) -> Self {
        let selection = rotator.select(credentials);
        let prompt = build_prompt(&req.messages);
        let payload = build_payload(map_model(&req.model), prompt, req, &config.upstream.timezone);

        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            created: chrono::Utc::now().timestamp(),
            public_model: req.model.clone(),
            payload,
            secret: selection.secret,
            credential_index: selection.index,
        }
    }
}

fn upstream_headers(secret: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(CLIENT_ACCEPT_LANGUAGE));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ORIGIN, HeaderValue::from_static(CLIENT_ORIGIN));
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    headers.insert("i-lang", HeaderValue::from_static(CLIENT_LANG));
    headers.insert("i-version", HeaderValue::from_static(CLIENT_VERSION));
    headers.insert("sec-ch-ua", HeaderValue::from_static(CLIENT_SEC_CH_UA));
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("Windows"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));

    let mut bearer = HeaderValue::from_str(&format!("Bearer {secret}"))
        .map_err(|_| ProxyError::auth("Credential contains characters not allowed in a header"))?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);
    Ok(headers)
}

/// POST the conversation and return the response once its status is known to be 2xx.
async fn open_conversation(
    prepared: &PreparedRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
    log: &RequestLogger,
) -> Result<reqwest::Response> {
    let url = config.conversation_url();
    log.info(
        "proxy",
        format!(
            "POST {} model={} credential={:?} prompt_chars={}",
            url,
            prepared.payload.model,
            prepared.credential_index,
            prepared.payload.prompt.chars().count()
        ),
    );

    let response = client
        .post(&url)
        .headers(upstream_headers(&prepared.secret)?)
        .json(&prepared.payload)
        .send()
        .await
        .map_err(|e| {
            let err = ProxyError::from_transport(&e);
            log.error("proxy", format!("Upstream request failed: {}", e));
            err
        })?;

    let status = response.status();
    log.debug("proxy", format!("Upstream status={}", status.as_u16()));

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| truncate(&body, 500).to_string());
        let message = format!("Upstream request failed: {} - {}", status.as_u16(), detail);

        log.error_with_context(
            "proxy",
            message.clone(),
            serde_json::json!({
                "status": status.as_u16(),
                "body": truncate(&body, 500),
            }),
        );
        return Err(ProxyError::upstream(status.as_u16(), message));
    }

    Ok(response)
}

/// Forward a chat request and collect the upstream stream into one completion.
pub async fn proxy_non_streaming(
    prepared: &PreparedRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<ChatCompletionResponse> {
    let log = logger.request(&prepared.request_id);
    let response = open_conversation(prepared, config, client, &log).await?;

    let mut aggregator = ResponseAggregator::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| {
            log.error("proxy", format!("Upstream body read failed: {}", e));
            ProxyError::from_transport(&e)
        })?;
        aggregator.push_bytes(&chunk);
    }

    let completion = aggregator.finish(&prepared.request_id, &prepared.public_model, prepared.created);
    if let Some(choice) = completion.choices.first() {
        log.info(
            "proxy",
            format!(
                "Completed: content_chars={} reasoning_chars={}",
                choice.message.content.chars().count(),
                choice
                    .message
                    .reasoning_content
                    .as_deref()
                    .map_or(0, |r| r.chars().count())
            ),
        );
    }
    Ok(completion)
}

/// Forward a chat request, returning the translated event stream.
///
/// Errors before the first upstream byte (transport, timeout, non-2xx status)
/// are returned directly; failures after that are reported inside the stream.
pub async fn proxy_streaming(
    prepared: &PreparedRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<EventStream> {
    let log = logger.request(&prepared.request_id);
    let response = open_conversation(prepared, config, client, &log).await?;

    let translator = StreamTranslator::new(
        &prepared.request_id,
        &prepared.public_model,
        prepared.created,
    );

    let events = translate_stream(response.bytes_stream(), translator).inspect(move |event| {
        if event.is_done() {
            log.info("stream", "Stream completed");
        }
    });

    Ok(Box::pin(events))
}

/// Summed quota across every credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub total: i64,
    pub available: i64,
}

/// Query the quota for a single credential.
pub async fn fetch_quota(
    secret: &str,
    config: &ProxyConfig,
    client: &reqwest::Client,
) -> Result<Vec<QuotaEntry>> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut bearer = HeaderValue::from_str(&format!("Bearer {secret}"))
        .map_err(|_| ProxyError::auth("Credential contains characters not allowed in a header"))?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);

    let response = client
        .get(config.quota_url())
        .headers(headers)
        .send()
        .await
        .map_err(|e| ProxyError::from_transport(&e))?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(ProxyError::upstream(
            status,
            format!("Quota query returned status {status}"),
        ));
    }

    let body: QuotaResponse = response.json().await?;
    match body.code {
        Some(0) => Ok(body.data.unwrap_or_default().list),
        code => Err(ProxyError::upstream(
            status,
            format!("Quota query returned code {code:?}"),
        )),
    }
}

/// Query every credential in `credentials` and sum the results.
/// A credential whose query fails contributes nothing.
pub async fn total_balance(
    credentials: &str,
    rotator: &Rotator,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Balance {
    let count = crate::credentials::CredentialSet::parse(credentials).len().max(1);

    let queries = (0..count).map(|index| {
        let selection = rotator.select_at(credentials, index);
        async move {
            let result = fetch_quota(&selection.secret, config, client).await;
            (index, result)
        }
    });

    let mut balance = Balance::default();
    for (index, result) in futures::future::join_all(queries).await {
        match result {
            Ok(entries) => {
                for entry in entries {
                    balance.total += entry.total;
                    balance.available += entry.available;
                }
            }
            Err(e) => {
                logger.warn("balance", format!("Quota query for credential #{index} failed: {e}"));
            }
        }
    }
    balance
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
