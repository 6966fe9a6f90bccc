//! Exchange error taxonomy
//!
//! Every failure the dispatch pipeline or the order-book engine can report is
//! one variant of [`ExchangeError`]. Transient kinds are retried by the
//! dispatcher and only surface wrapped in `ExhaustedRetries`; everything else
//! propagates immediately with its diagnostic payload attached.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of an [`ExchangeError`], independent of its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    RateLimitExceeded,
    InvalidRequest,
    ExchangeUnavailable,
    ExhaustedRetries,
    DesyncDetected,
    Cancelled,
    InvalidResponse,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ExchangeUnavailable => "exchange_unavailable",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::DesyncDetected => "desync_detected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidResponse => "invalid_response",
        };
        f.write_str(name)
    }
}

/// Raw diagnostic data from the exchange response that caused an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    /// HTTP status code, if the failure came from a response
    pub status: Option<u16>,
    /// Exchange-specific error code extracted from the body
    pub code: Option<String>,
    /// Response body (truncated)
    pub body: String,
    /// Server-requested delay before retrying, from `Retry-After`
    pub retry_after_ms: Option<u64>,
}

/// Maximum number of body bytes kept in a [`Diagnostic`]
const MAX_DIAGNOSTIC_BODY: usize = 512;

impl Diagnostic {
    pub fn from_response(status: u16, body: &str, retry_after_ms: Option<u64>) -> Self {
        let mut end = body.len().min(MAX_DIAGNOSTIC_BODY);
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            status: Some(status),
            code: extract_code(body),
            body: body[..end].to_string(),
            retry_after_ms,
        }
    }
}

/// Exchange-specific error types for the dispatch and order-book core
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    /// Bad weight/cost/bucket/profile setup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing or invalid credentials, or signature rejected by the exchange
    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        diagnostic: Option<Diagnostic>,
    },

    /// Exchange throttled the request despite local limiting
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        diagnostic: Option<Diagnostic>,
    },

    /// Malformed parameters or any other non-auth 4xx
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        diagnostic: Option<Diagnostic>,
    },

    /// 5xx, timeouts and transport failures
    #[error("Exchange unavailable: {message}")]
    ExchangeUnavailable {
        message: String,
        diagnostic: Option<Diagnostic>,
    },

    /// Retry policy exhausted; carries the last retryable failure
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<ExchangeError>,
    },

    /// Order-book continuity broken (informational, triggers resync)
    #[error("Order book desync on {symbol}: {reason}")]
    DesyncDetected { symbol: String, reason: String },

    /// Dispatch cancelled by the caller before completion
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Response or stream message could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for exchange operations
pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

impl ExchangeError {
    pub fn authentication(message: impl Into<String>) -> Self {
        ExchangeError::Authentication {
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        ExchangeError::InvalidRequest {
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ExchangeError::ExchangeUnavailable {
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        ExchangeError::RateLimitExceeded {
            message: message.into(),
            diagnostic: None,
        }
    }

    /// Build an error of the given kind carrying a response diagnostic
    pub fn with_kind(kind: ErrorKind, message: String, diagnostic: Diagnostic) -> Self {
        let diagnostic = Some(diagnostic);
        match kind {
            ErrorKind::Authentication => ExchangeError::Authentication { message, diagnostic },
            ErrorKind::RateLimitExceeded => ExchangeError::RateLimitExceeded { message, diagnostic },
            ErrorKind::InvalidRequest => ExchangeError::InvalidRequest { message, diagnostic },
            ErrorKind::ExchangeUnavailable => {
                ExchangeError::ExchangeUnavailable { message, diagnostic }
            }
            ErrorKind::Configuration => ExchangeError::Configuration(message),
            ErrorKind::Cancelled => ExchangeError::Cancelled(message),
            // Not producible from a response; keep the payload as an invalid response
            ErrorKind::ExhaustedRetries | ErrorKind::DesyncDetected | ErrorKind::InvalidResponse => {
                ExchangeError::InvalidResponse(message)
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Configuration(_) => ErrorKind::Configuration,
            ExchangeError::Authentication { .. } => ErrorKind::Authentication,
            ExchangeError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ExchangeError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            ExchangeError::ExchangeUnavailable { .. } => ErrorKind::ExchangeUnavailable,
            ExchangeError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            ExchangeError::DesyncDetected { .. } => ErrorKind::DesyncDetected,
            ExchangeError::Cancelled(_) => ErrorKind::Cancelled,
            ExchangeError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }

    /// Whether the dispatcher may retry this failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimitExceeded | ErrorKind::ExchangeUnavailable
        )
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            ExchangeError::Authentication { diagnostic, .. }
            | ExchangeError::RateLimitExceeded { diagnostic, .. }
            | ExchangeError::InvalidRequest { diagnostic, .. }
            | ExchangeError::ExchangeUnavailable { diagnostic, .. } => diagnostic.as_ref(),
            ExchangeError::ExhaustedRetries { last, .. } => last.diagnostic(),
            _ => None,
        }
    }

    /// Server-requested retry delay, if the response carried one
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.diagnostic().and_then(|d| d.retry_after_ms)
    }
}

// =============================================================================
// Response Classification
// =============================================================================

/// Map a non-2xx HTTP status onto the taxonomy
pub fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ErrorKind::Authentication),
        418 | 429 => Some(ErrorKind::RateLimitExceeded),
        408 => Some(ErrorKind::ExchangeUnavailable),
        400..=499 => Some(ErrorKind::InvalidRequest),
        500..=599 => Some(ErrorKind::ExchangeUnavailable),
        _ => Some(ErrorKind::InvalidResponse),
    }
}

/// Per-exchange error-code tables
///
/// `exact` is keyed by the body's error code or message; `broad` entries match
/// when the error message contains the key as a substring. Rules are consulted
/// before the HTTP status, so a 200 response carrying an error code still fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorRules {
    #[serde(default)]
    pub exact: HashMap<String, ErrorKind>,
    #[serde(default)]
    pub broad: HashMap<String, ErrorKind>,
}

impl ErrorRules {
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.broad.is_empty()
    }

    /// Find the rule that applies to an error body
    ///
    /// Plain-text bodies are treated as the error message.
    pub fn classify(&self, body: &str) -> Option<ErrorKind> {
        if self.is_empty() {
            return None;
        }
        let message = extract_message(body).or_else(|| plain_text(body));
        self.classify_fields(extract_code(body).as_deref(), message.as_deref())
    }

    /// Match the extracted error code and message against the tables
    pub fn classify_fields(&self, code: Option<&str>, message: Option<&str>) -> Option<ErrorKind> {
        if let Some(kind) = code.and_then(|c| self.exact.get(c)) {
            return Some(*kind);
        }
        let message = message?;
        if let Some(kind) = self.exact.get(message) {
            return Some(*kind);
        }
        // Longest key first so that specific phrases beat generic ones
        let mut broad: Vec<(&String, &ErrorKind)> = self.broad.iter().collect();
        broad.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        broad
            .into_iter()
            .find(|(needle, _)| message.contains(needle.as_str()))
            .map(|(_, kind)| *kind)
    }
}

/// Classify a complete response; `Ok(())` means success
///
/// A 2xx response only fails when its JSON carries an error code or message
/// that a rule recognizes.
pub fn classify_response(
    status: u16,
    body: &str,
    retry_after_ms: Option<u64>,
    rules: &ErrorRules,
) -> ExchangeResult<()> {
    let kind = if (200..300).contains(&status) {
        if rules.is_empty() {
            None
        } else {
            rules.classify_fields(extract_code(body).as_deref(), extract_message(body).as_deref())
        }
    } else {
        rules.classify(body).or_else(|| kind_for_status(status))
    };
    match kind {
        None => Ok(()),
        Some(kind) => {
            let diagnostic = Diagnostic::from_response(status, body, retry_after_ms);
            let message = match &diagnostic.code {
                Some(code) => format!("HTTP {} (code {})", status, code),
                None => format!("HTTP {}", status),
            };
            Err(ExchangeError::with_kind(kind, message, diagnostic))
        }
    }
}

fn parse_object(body: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn extract_code(body: &str) -> Option<String> {
    let map = parse_object(body)?;
    ["code", "error_code", "errorCode", "ret_code", "retCode"]
        .iter()
        .find_map(|key| match map.get(*key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

fn plain_text(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() || serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return None;
    }
    Some(trimmed.to_string())
}

fn extract_message(body: &str) -> Option<String> {
    let map = parse_object(body)?;
    ["msg", "message", "error", "ret_msg", "retMsg"]
        .iter()
        .find_map(|key| match map.get(*key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_display() {
        let err = ExchangeError::authentication("missing secret");
        assert_eq!(err.to_string(), "Authentication failed: missing secret");
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_exhausted_retries_display_wraps_last_cause() {
        let err = ExchangeError::ExhaustedRetries {
            attempts: 4,
            last: Box::new(ExchangeError::unavailable("HTTP 503")),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 4 attempts: Exchange unavailable: HTTP 503"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ExchangeError::rate_limited("429").is_transient());
        assert!(ExchangeError::unavailable("502").is_transient());
        assert!(!ExchangeError::invalid_request("bad symbol").is_transient());
        assert!(!ExchangeError::Configuration("x".into()).is_transient());
        assert!(!ExchangeError::Cancelled("x".into()).is_transient());
    }

    #[test]
    fn test_kind_for_status() {
        assert_eq!(kind_for_status(200), None);
        assert_eq!(kind_for_status(204), None);
        assert_eq!(kind_for_status(401), Some(ErrorKind::Authentication));
        assert_eq!(kind_for_status(403), Some(ErrorKind::Authentication));
        assert_eq!(kind_for_status(429), Some(ErrorKind::RateLimitExceeded));
        assert_eq!(kind_for_status(418), Some(ErrorKind::RateLimitExceeded));
        assert_eq!(kind_for_status(408), Some(ErrorKind::ExchangeUnavailable));
        assert_eq!(kind_for_status(400), Some(ErrorKind::InvalidRequest));
        assert_eq!(kind_for_status(404), Some(ErrorKind::InvalidRequest));
        assert_eq!(kind_for_status(503), Some(ErrorKind::ExchangeUnavailable));
        assert_eq!(kind_for_status(302), Some(ErrorKind::InvalidResponse));
    }

    #[test]
    fn test_classify_response_attaches_diagnostic() {
        let body = r#"{"code":-1121,"msg":"Invalid symbol."}"#;
        let err = classify_response(400, body, None, &ErrorRules::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        let diag = err.diagnostic().unwrap();
        assert_eq!(diag.status, Some(400));
        assert_eq!(diag.code.as_deref(), Some("-1121"));
        assert!(diag.body.contains("Invalid symbol"));
    }

    #[test]
    fn test_rules_override_status() {
        let mut rules = ErrorRules::default();
        rules.exact.insert("50011".into(), ErrorKind::RateLimitExceeded);
        // OKX-style: HTTP 200 with an error code in the body
        let body = r#"{"code":"50011","msg":"Too Many Requests","data":[]}"#;
        let err = classify_response(200, body, None, &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert!(err.is_transient());
    }

    #[test]
    fn test_rules_broad_match_prefers_longest_phrase() {
        let mut rules = ErrorRules::default();
        rules.broad.insert("Invalid".into(), ErrorKind::InvalidRequest);
        rules.broad.insert("Invalid API-key".into(), ErrorKind::Authentication);
        let body = r#"{"msg":"Invalid API-key, IP, or permissions for action."}"#;
        assert_eq!(rules.classify(body), Some(ErrorKind::Authentication));
    }

    #[test]
    fn test_broad_rule_ignores_successful_payload() {
        let mut rules = ErrorRules::default();
        rules.broad.insert("Insufficient".into(), ErrorKind::InvalidRequest);
        // Order list where one entry mentions the phrase; the call itself succeeded
        let body = r#"{"code":0,"data":[{"orderId":"1","status":"REJECTED","rejectReason":"Insufficient balance"}]}"#;
        assert!(classify_response(200, body, None, &rules).is_ok());
    }

    #[test]
    fn test_broad_rule_matches_error_message_on_success_status() {
        let mut rules = ErrorRules::default();
        rules.broad.insert("Insufficient".into(), ErrorKind::InvalidRequest);
        let body = r#"{"code":51008,"msg":"Insufficient balance","data":[]}"#;
        let err = classify_response(200, body, None, &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_broad_rule_matches_plain_text_error() {
        let mut rules = ErrorRules::default();
        rules.broad.insert("maintenance".into(), ErrorKind::ExchangeUnavailable);
        let err = classify_response(400, "System under maintenance", None, &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExchangeUnavailable);
        assert_eq!(rules.classify(r#"{"data":"maintenance window"}"#), None);
    }

    #[test]
    fn test_classify_success_without_rules() {
        assert!(classify_response(200, r#"{"ok":true}"#, None, &ErrorRules::default()).is_ok());
    }

    #[test]
    fn test_diagnostic_truncates_long_bodies() {
        let body = "x".repeat(2000);
        let diag = Diagnostic::from_response(500, &body, Some(1000));
        assert_eq!(diag.body.len(), MAX_DIAGNOSTIC_BODY);
        assert_eq!(diag.retry_after_ms, Some(1000));
        assert_eq!(diag.code, None);
    }

    #[test]
    fn test_retry_after_visible_through_exhausted_retries() {
        let last = ExchangeError::with_kind(
            ErrorKind::RateLimitExceeded,
            "HTTP 429".into(),
            Diagnostic::from_response(429, "", Some(2000)),
        );
        let err = ExchangeError::ExhaustedRetries {
            attempts: 2,
            last: Box::new(last),
        };
        assert_eq!(err.retry_after_ms(), Some(2000));
    }
}
