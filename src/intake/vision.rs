//! Vision model client used to read fields off document images.
//!
//! Speaks the OpenAI-compatible chat-completions protocol: one user message
//! carrying the extraction prompt and the image as a base64 data URL. The
//! client never errors outward: connection-level failures are retried with
//! exponential backoff and then degraded to an empty response, which the
//! parser turns into the sentinel result downstream.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use nonzero_ext::nonzero;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::state::RunContext;

type CallRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Total attempts for connection-level failures.
const MAX_ATTEMPTS: u32 = 3;
/// First backoff delay; doubled after each failed attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
/// Fixed per-call timeout; an expired call counts as a connection failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Pricing applied to each reply's usage block, in USD.
const COST_PER_PROMPT_TOKEN: f64 = 2.5e-6;
const COST_PER_COMPLETION_TOKEN: f64 = 1.0e-5;
/// Flat charge for the image payload on every call.
const COST_PER_IMAGE: f64 = 0.003_825;

const EXTRACTION_PROMPT: &str = "You are reading a scanned business document. \
Extract the vendor or company name, the document number, and the document date. \
Respond with only a JSON object with exactly these keys: \
company_name, invoice_number, invoice_date. Use MM/DD/YYYY for the date.";

/// One outbound call per second, enforced process-wide across every client
/// instance; a call arriving sooner sleeps for the remaining interval.
fn call_rate_limiter() -> &'static Arc<CallRateLimiter> {
    static LIMITER: OnceLock<Arc<CallRateLimiter>> = OnceLock::new();
    LIMITER.get_or_init(|| Arc::new(RateLimiter::direct(Quota::per_second(nonzero!(1u32)))))
}

/// Raw reply from the vision API.
///
/// `text` is `None` when the call could not be completed: retries
/// exhausted, an error status, or an unusable body.
#[derive(Debug, Clone, Default)]
pub struct RawModelResponse {
    pub text: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Seam between the dispatcher and the external model.
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync + std::fmt::Debug {
    /// Analyze one document image.
    async fn analyze(&self, image_bytes: &[u8], mime_type: &str) -> RawModelResponse;
}

/// Client for an OpenAI-compatible vision endpoint.
#[derive(Debug)]
pub struct VisionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    ctx: Arc<RunContext>,
}

impl VisionClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        ctx: Arc<RunContext>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("http client construction");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            ctx,
        }
    }

    async fn request_once(&self, data_url: &str) -> Result<reqwest::Response, reqwest::Error> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": EXTRACTION_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            }],
            "max_tokens": 300,
            "temperature": 0
        });

        self.client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
    }

    fn record_cost(&self, usage: TokenUsage) {
        let cost = usage.prompt_tokens as f64 * COST_PER_PROMPT_TOKEN
            + usage.completion_tokens as f64 * COST_PER_COMPLETION_TOKEN
            + COST_PER_IMAGE;
        self.ctx
            .record_call(usage.prompt_tokens, usage.completion_tokens, cost);
    }
}

/// Connection-level failures (refused, unreachable, timed out) are worth
/// retrying; application-level failures are not.
fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[async_trait]
impl DocumentAnalyzer for VisionClient {
    async fn analyze(&self, image_bytes: &[u8], mime_type: &str) -> RawModelResponse {
        let data_url = format!(
            "data:{};base64,{}",
            mime_type,
            BASE64_STANDARD.encode(image_bytes)
        );

        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=MAX_ATTEMPTS {
            call_rate_limiter().until_ready().await;

            let response = match self.request_once(&data_url).await {
                Ok(response) => response,
                Err(err) if is_transient(&err) => {
                    warn!(attempt, error = %err, "vision call failed at the connection level");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "vision call failed; not retryable");
                    return RawModelResponse::default();
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(%status, body = %body, "vision API returned an error status");
                return RawModelResponse::default();
            }

            let reply: ChatCompletionReply = match response.json().await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, "vision API reply body was unusable");
                    return RawModelResponse::default();
                }
            };

            let usage = reply.usage.unwrap_or_default();
            self.record_cost(usage);

            let text = reply
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content);
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "vision reply received"
            );
            return RawModelResponse {
                text,
                usage: Some(usage),
            };
        }

        warn!(
            attempts = MAX_ATTEMPTS,
            "vision call abandoned after repeated connection failures"
        );
        RawModelResponse::default()
    }
}
