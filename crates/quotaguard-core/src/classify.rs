//! Deterministic classification of upstream failures.
//!
//! The protected operation reports failures as an [`UpstreamError`], a
//! normalized shape carrying the HTTP status, the provider's structured reason
//! code, response headers and, for failures that never produced a response,
//! the transport failure. [`classify`] maps that shape onto the closed
//! [`ErrorClass`] union. Free-text messages are carried for humans and never
//! inspected.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

lazy_static! {
    /// Provider reason codes that mean the daily quota is spent.
    static ref QUOTA_REASON: Regex =
        Regex::new(r"(?i)^(quotaExceeded|dailyLimitExceeded|limitExceeded)$").unwrap();
}

/// Header carrying an explicit retry delay.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Failure below HTTP: no response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportFailure {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    DnsLookup,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportFailure::ConnectionRefused => "connection refused",
            TransportFailure::ConnectionReset => "connection reset",
            TransportFailure::Timeout => "timed out",
            TransportFailure::DnsLookup => "dns lookup failed",
        };
        f.write_str(s)
    }
}

/// Normalized error reported by a protected operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UpstreamError {
    /// HTTP status, if a response was received
    pub status: Option<u16>,

    /// Provider reason code (e.g. "quotaExceeded")
    pub reason: Option<String>,

    /// Human-readable description
    pub message: String,

    /// Response headers, keys lowercased
    pub headers: BTreeMap<String, String>,

    /// Set when the request never got a response
    pub transport: Option<TransportFailure>,
}

impl UpstreamError {
    /// An error response with an HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: None,
            message: message.into(),
            headers: BTreeMap::new(),
            transport: None,
        }
    }

    /// A failure that produced no response.
    pub fn transport(failure: TransportFailure, message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
            headers: BTreeMap::new(),
            transport: Some(failure),
        }
    }

    /// Anything else the operation could not describe further.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
            headers: BTreeMap::new(),
            transport: None,
        }
    }

    /// Attach the provider's reason code.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a response header. Names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Explicit delay from a delta-seconds `Retry-After` header.
    ///
    /// The HTTP-date form needs a reference instant; see [`Self::retry_after_at`].
    pub fn retry_after(&self) -> Option<Duration> {
        self.header(RETRY_AFTER_HEADER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Explicit delay from `Retry-After` in either delta-seconds or HTTP-date
    /// form. A date already in the past means no wait.
    pub fn retry_after_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let raw = self.header(RETRY_AFTER_HEADER)?.trim();
        if let Ok(seconds) = raw.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Error category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    CircuitOpen,
    QuotaExceeded,
    RateLimit,
    NetworkError,
    ApiError,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::CircuitOpen => "circuit_open",
            ErrorType::QuotaExceeded => "quota_exceeded",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::NetworkError => "network_error",
            ErrorType::ApiError => "api_error",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Provider reports the daily quota is spent
    QuotaExceeded { status: Option<u16> },

    /// HTTP 429, with the explicit delay if one was sent
    RateLimit { retry_after: Option<Duration> },

    /// No response received
    NetworkError(TransportFailure),

    /// Any other 4xx or 5xx
    ApiError { status: u16 },

    /// Nothing recognisable; treated as transient
    Unknown { status: Option<u16> },
}

impl ErrorClass {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ErrorClass::QuotaExceeded { .. } => ErrorType::QuotaExceeded,
            ErrorClass::RateLimit { .. } => ErrorType::RateLimit,
            ErrorClass::NetworkError(_) => ErrorType::NetworkError,
            ErrorClass::ApiError { .. } => ErrorType::ApiError,
            ErrorClass::Unknown { .. } => ErrorType::Unknown,
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorClass::QuotaExceeded { .. } => false,
            ErrorClass::RateLimit { .. } => true,
            ErrorClass::NetworkError(_) => true,
            ErrorClass::ApiError { status } => *status >= 500,
            ErrorClass::Unknown { .. } => true,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ErrorClass::QuotaExceeded { status } => *status,
            ErrorClass::RateLimit { .. } => Some(429),
            ErrorClass::NetworkError(_) => None,
            ErrorClass::ApiError { status } => Some(*status),
            ErrorClass::Unknown { status } => *status,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorClass::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Caller-facing message for this class.
    pub fn describe(&self, source: &UpstreamError) -> String {
        match self {
            ErrorClass::QuotaExceeded { .. } => "Upstream API quota exceeded".to_string(),
            ErrorClass::RateLimit {
                retry_after: Some(delay),
            } => format!("Rate limit exceeded. Retry after {}s.", delay.as_secs()),
            ErrorClass::RateLimit { retry_after: None } => "Rate limit exceeded".to_string(),
            ErrorClass::NetworkError(failure) => {
                format!("Network error connecting to upstream API: {failure}")
            }
            ErrorClass::ApiError { status: 400 } => "Bad request".to_string(),
            ErrorClass::ApiError { status: 404 } => "Resource not found".to_string(),
            ErrorClass::ApiError { status } if *status >= 500 => {
                format!("Upstream API server error ({status})")
            }
            ErrorClass::ApiError { status } => {
                format!("Upstream API rejected the request ({status}): {}", source.message)
            }
            ErrorClass::Unknown { .. } => source.message.clone(),
        }
    }
}

/// Whether a provider reason code denotes quota exhaustion.
pub fn is_quota_reason(reason: &str) -> bool {
    QUOTA_REASON.is_match(reason)
}

/// Classify an upstream failure.
pub fn classify(error: &UpstreamError) -> ErrorClass {
    if let Some(failure) = error.transport {
        return ErrorClass::NetworkError(failure);
    }

    if error.reason.as_deref().is_some_and(is_quota_reason) {
        return ErrorClass::QuotaExceeded {
            status: error.status,
        };
    }

    match error.status {
        Some(429) => ErrorClass::RateLimit {
            retry_after: error.retry_after(),
        },
        // A bare 403 from a metered API is a quota refusal.
        Some(403) if error.reason.is_none() => ErrorClass::QuotaExceeded { status: Some(403) },
        Some(status) if (400..=599).contains(&status) => ErrorClass::ApiError { status },
        status => ErrorClass::Unknown { status },
    }
}

/// Classify an upstream failure, resolving an HTTP-date `Retry-After`
/// against `now`.
pub fn classify_at(error: &UpstreamError, now: DateTime<Utc>) -> ErrorClass {
    match classify(error) {
        ErrorClass::RateLimit { retry_after: None } => ErrorClass::RateLimit {
            retry_after: error.retry_after_at(now),
        },
        class => class,
    }
}
