//! Shared HTTP client, SSE parsing, and status mapping.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};

use crate::error::{AgentError, ErrorCode, ErrorDetails};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// No overall request timeout is set: responses are long-lived streams, and
/// the loop applies its own per-attempt and idle limits.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Split complete SSE events off the front of `buffer`, returning their data payloads.
///
/// The buffer holds raw bytes so a multi-byte character split across network
/// chunks is only decoded once its event is complete. Incomplete trailing data
/// stays in the buffer for the next chunk.
pub fn drain_sse_events(buffer: &mut Vec<u8>) -> Result<Vec<String>, AgentError> {
    let mut events = Vec::new();
    while let Some((end, separator)) = find_event_boundary(buffer) {
        let raw: Vec<u8> = buffer.drain(..end + separator).take(end).collect();
        let raw = String::from_utf8(raw)
            .map_err(|e| AgentError::Stream(format!("SSE event is not valid UTF-8: {e}")))?;
        let data: Vec<&str> = raw
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    Ok(events)
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find_bytes(buffer, b"\n\n").map(|i| (i, 2));
    let crlf = find_bytes(buffer, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Map a non-success HTTP response onto an error.
pub fn status_to_error(status: u16, headers: &HeaderMap, body: &str) -> AgentError {
    let details = extract_details(body);
    let message = extract_message(body).unwrap_or_else(|| body.to_string());
    match status {
        429 => AgentError::RateLimited {
            retry_after_ms: retry_after_header_ms(headers).or_else(|| extract_retry_after(body)),
            message: Some(message),
        },
        _ if details
            .as_ref()
            .and_then(|d| d.code)
            .is_some_and(|code| code == ErrorCode::ContextLengthExceeded) =>
        {
            AgentError::ContextLengthExceeded(message)
        }
        _ => match details {
            Some(details) => AgentError::api_with_details(status, message, details),
            None => AgentError::api(status, message),
        },
    }
}

fn retry_after_header_ms(headers: &HeaderMap) -> Option<u64> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
    {
        return Some(ms as u64);
    }
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
}

fn extract_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}

fn extract_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

fn extract_details(body: &str) -> Option<ErrorDetails> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    let error = value.get("error")?;
    let provider_code = error
        .get("code")
        .and_then(|c| c.as_str())
        .or_else(|| error.get("type").and_then(|t| t.as_str()))
        .map(str::to_string);
    Some(ErrorDetails {
        code: provider_code.as_deref().map(ErrorCode::from_provider_code),
        provider_code,
        param: error.get("param").and_then(|p| p.as_str()).map(str::to_string),
        request_id: None,
    })
}
