//! HTTP client delivering one payload per attempt.
//!
//! Each call to [`DeliveryClient::send`] is exactly one attempt: there is no
//! retry loop here. The outcome is classified into an [`AttemptError`] which
//! the dispatcher hands to the retry policy.
//!
//! | Response | Classification |
//! |----------|----------------|
//! | 2xx | success |
//! | connect/IO error | [`AttemptError::Network`] (transient) |
//! | timeout | [`AttemptError::Timeout`] (transient) |
//! | 5xx, 408 | [`AttemptError::ServerError`] (transient) |
//! | 429 | [`AttemptError::RateLimited`] (transient, honours `Retry-After`) |
//! | other | [`AttemptError::PermanentRejection`] |

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, ForwardingConfig};
use crate::retry::FailureKind;
use crate::types::DeliveryPayload;

/// Header carrying the stable per-delivery key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Validated destination of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub url: Url,
    /// Sensitive `Authorization` value, when an API key is configured.
    pub authorization: Option<HeaderValue>,
}

impl DeliveryTarget {
    /// Validates the endpoint and the API key of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEndpoint`] or
    /// [`ConfigError::InvalidApiKey`] when either cannot be used.
    pub fn from_config(config: &ForwardingConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            url: config.endpoint()?,
            authorization: config.authorization()?,
        })
    }
}

/// Why a single delivery attempt failed.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    /// 5xx, or 408 Request Timeout.
    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    /// The endpoint refused the request and will keep refusing it.
    #[error("rejected with HTTP {status}")]
    PermanentRejection { status: u16 },

    /// The delivery key cannot be sent as a header value.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl AttemptError {
    /// How the retry policy should treat this failure.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Network(_) | Self::Timeout | Self::ServerError { .. } => FailureKind::Transient,
            Self::RateLimited { retry_after } => FailureKind::RateLimited {
                retry_after: *retry_after,
            },
            Self::PermanentRejection { .. } | Self::InvalidHeader(_) => FailureKind::Permanent,
        }
    }
}

/// Outbound HTTP client with a per-attempt timeout.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: Client,
}

impl DeliveryClient {
    /// Builds a client whose every request is bounded by `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the TLS backend cannot be initialized.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { client })
    }

    /// Makes one delivery attempt.
    ///
    /// Sends `payload` as JSON with `Idempotency-Key` set to its delivery id,
    /// plus the target's `Authorization` header when it has one.
    ///
    /// # Errors
    ///
    /// Returns an [`AttemptError`] for every non-2xx outcome.
    pub async fn send(
        &self,
        target: &DeliveryTarget,
        payload: &DeliveryPayload,
    ) -> Result<(), AttemptError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            IDEMPOTENCY_KEY_HEADER,
            HeaderValue::from_str(&payload.delivery_id.to_string())?,
        );
        if let Some(value) = &target.authorization {
            headers.insert(AUTHORIZATION, value.clone());
        }

        debug!(
            url = %target.url,
            delivery_id = %payload.delivery_id,
            source = %payload.source_package,
            "Sending delivery"
        );

        let response = self
            .client
            .post(target.url.clone())
            .headers(headers)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout
                } else {
                    AttemptError::Network(e)
                }
            })?;

        classify(response.status(), response.headers(), Utc::now())
    }
}

fn classify(
    status: StatusCode,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<(), AttemptError> {
    if status.is_success() {
        return Ok(());
    }

    let code = status.as_u16();
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(AttemptError::RateLimited {
            retry_after: parse_retry_after(headers, now),
        }),
        StatusCode::REQUEST_TIMEOUT => Err(AttemptError::ServerError { status: code }),
        _ if status.is_server_error() => Err(AttemptError::ServerError { status: code }),
        _ => Err(AttemptError::PermanentRejection { status: code }),
    }
}

/// Reads `Retry-After` as delay-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
