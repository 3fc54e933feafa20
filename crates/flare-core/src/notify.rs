use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use sha2::Sha256;

use crate::error::{CoreReason, CoreResult};
use crate::eval::ConditionOutcome;

// ---------------------------------------------------------------------------
// WebhookPayload
// ---------------------------------------------------------------------------

/// Body of the webhook POST sent when a signal trips.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub signal_id: String,
    pub signal_name: String,
    pub triggered_at: DateTime<Utc>,
    pub scope: Scope,
    /// Every condition evaluated on the first tripped chain, in definition
    /// order — not only the passing ones. Receivers filter on `passed`.
    pub conditions_met: Vec<ConditionOutcome>,
    /// Free-form extra context; an empty object when there is none.
    pub context: serde_json::Value,
}

/// The chains that tripped in this evaluation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Scope {
    pub chains: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// HMAC signing secret. Empty disables the signature header entirely —
    /// operators rely on this to turn signing off without unsetting the
    /// variable.
    pub secret: String,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    /// Retries after the first attempt; `max_retries = 2` means up to three
    /// POSTs.
    pub max_retries: u32,
}

/// Result of one `dispatch` call, across all attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
}

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 5_000;

/// Delay before the attempt following `attempt` (1-based).
fn backoff(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

/// At-least-once webhook delivery with HMAC signing, an idempotency key and
/// bounded exponential retries.
pub struct Notifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(config: NotifierConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            orion_error::StructError::from(CoreReason::Notify)
                .with_detail(format!("http client build: {e}"))
        })?;
        Ok(Self { client, config })
    }

    /// POST `payload` to `url`.
    ///
    /// The body, timestamp and signature are computed once per call, so every
    /// retry is byte-identical and receivers can dedupe on the stable
    /// `Idempotency-Key`. Retries fire on transport errors, 429 and 5xx;
    /// other 4xx responses are terminal.
    pub async fn dispatch(&self, url: &str, payload: &WebhookPayload) -> DispatchOutcome {
        let started = Instant::now();

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return DispatchOutcome {
                    success: false,
                    status: None,
                    error: Some(format!("payload serialization: {e}")),
                    duration_ms: started.elapsed().as_millis() as u64,
                    attempts: 0,
                };
            }
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let idempotency_key = format!(
            "{}:{}",
            payload.signal_id,
            payload.triggered_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let signature =
            (!self.config.secret.is_empty()).then(|| sign(&self.config.secret, &timestamp, &body));

        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let mut request = self
                .client
                .post(url)
                .timeout(self.config.timeout)
                .header(CONTENT_TYPE, "application/json")
                .header(USER_AGENT, "flare/1.0")
                .header("Idempotency-Key", &idempotency_key)
                .header("X-Flare-Timestamp", &timestamp)
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header("X-Flare-Signature", sig);
            }

            let (retry, status, error) = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return DispatchOutcome {
                            success: true,
                            status: Some(status.as_u16()),
                            error: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                            attempts,
                        };
                    }
                    (
                        retryable_status(status),
                        Some(status.as_u16()),
                        Some(format!("http status {status}")),
                    )
                }
                Err(e) => (true, None, Some(format!("transport: {e}"))),
            };

            if !retry || attempts >= max_attempts {
                return DispatchOutcome {
                    success: false,
                    status,
                    error,
                    duration_ms: started.elapsed().as_millis() as u64,
                    attempts,
                };
            }

            tracing::debug!(
                domain = "notify",
                attempt = attempts,
                status = status.unwrap_or(0),
                "webhook attempt failed, backing off"
            );
            tokio::time::sleep(backoff(attempts)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
