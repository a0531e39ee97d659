//! Provider error types and the HTTP status mapping shared by all adapters.

use std::time::Duration;

pub use oralexam_core::error::ProviderError;

/// Seconds to wait after a 429 that carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Build the HTTP client every adapter uses.
pub(crate) fn build_client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ProviderError::NetworkError(format!("failed to build HTTP client: {e}")))
}

/// Map a failed send to a typed error.
pub(crate) fn transport_error(err: reqwest::Error, timeout_secs: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout_secs)
    } else {
        ProviderError::NetworkError(err.to_string())
    }
}

/// Map a non-success HTTP status to a typed error.
///
/// `body` is the raw response body; a JSON `error.message` or `error` string
/// is preferred over the raw text when present.
pub(crate) fn status_error(
    status: u16,
    retry_after_secs: Option<u64>,
    body: &str,
    model: &str,
) -> ProviderError {
    let message = error_message(body);
    match status {
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS) * 1000,
        },
        401 | 403 => ProviderError::AuthenticationFailed(message),
        404 => ProviderError::ModelNotFound(model.to_string()),
        _ => ProviderError::ApiError { status, message },
    }
}

/// Read the status, headers and body of a failed response and map them.
pub(crate) async fn error_from_response(response: reqwest::Response, model: &str) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    status_error(status, retry_after, &body, model)
}

fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    let error = &value["error"];
    error["message"]
        .as_str()
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
