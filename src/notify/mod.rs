//! Outbound webhook notification.
//!
//! Callbacks are best-effort: every sink is fired concurrently, the notifier
//! waits for all of them to settle, and failures (invalid URL, network
//! error, non-2xx) are logged and never retried or propagated.
//!
//! The callbacks form field arrives as JSON, sometimes mangled by clients: a
//! bare object instead of an array, or several objects joined with `},{`.
//! [`parse_callbacks`] repairs both shapes before giving up.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::AcceptError;

/// Timeout for a single webhook request.
const CALLBACK_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Callback Sink
// =============================================================================

/// HTTP method for a callback. Defaults to POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallbackMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
}

impl CallbackMethod {
    fn as_reqwest(&self) -> reqwest::Method {
        match self {
            CallbackMethod::Get => reqwest::Method::GET,
            CallbackMethod::Post => reqwest::Method::POST,
            CallbackMethod::Put => reqwest::Method::PUT,
            CallbackMethod::Patch => reqwest::Method::PATCH,
        }
    }

    /// Whether requests with this method carry the payload as a body.
    fn has_body(&self) -> bool {
        !matches!(self, CallbackMethod::Get)
    }
}

/// One registered webhook target.
///
/// URLs are validated at notification time, not at accept time: an invalid
/// URL is logged and skipped when the callback fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSink {
    /// Absolute target URL
    pub url: String,

    /// HTTP method (default POST)
    #[serde(default)]
    pub method: CallbackMethod,

    /// Extra headers merged into the request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

// =============================================================================
// Callbacks Field Parsing
// =============================================================================

/// Parse the `callbacks` form field, repairing common client mistakes.
///
/// Accepted shapes, tried in order:
/// 1. a proper JSON array of callback objects,
/// 2. a bare object `{…}`, wrapped into a one-element array,
/// 3. objects joined with `},{` and no surrounding brackets, re-wrapped.
///
/// An empty field yields no callbacks.
pub fn parse_callbacks(raw: &str) -> Result<Vec<CallbackSink>, AcceptError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(sinks) = serde_json::from_str::<Vec<CallbackSink>>(trimmed) {
        return Ok(sinks);
    }

    if trimmed.starts_with('{') {
        // Bare object, or a `},{`-joined concatenation of objects.
        if let Ok(single) = serde_json::from_str::<CallbackSink>(trimmed) {
            return Ok(vec![single]);
        }
        let rewrapped = format!("[{}]", trimmed);
        if let Ok(sinks) = serde_json::from_str::<Vec<CallbackSink>>(&rewrapped) {
            return Ok(sinks);
        }
    }

    Err(AcceptError::InvalidCallbacks(truncate(trimmed, 200)))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

// =============================================================================
// Callback Notifier
// =============================================================================

/// Fires webhook callbacks with best-effort semantics.
#[derive(Debug, Clone)]
pub struct CallbackNotifier {
    client: reqwest::Client,
}

impl Default for CallbackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackNotifier {
    /// Create a notifier with a default HTTP client (30 s timeout).
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALLBACK_TIMEOUT_SECS))
            .build()
            // Builder only fails on TLS backend misconfiguration; fall back
            // to the default client rather than refusing to start.
            .unwrap_or_default();
        Self { client }
    }

    /// Fire all callbacks concurrently and wait for them to settle.
    ///
    /// Never returns an error; every failure is logged.
    pub async fn notify(&self, callbacks: &[CallbackSink], payload: &serde_json::Value) {
        if callbacks.is_empty() {
            return;
        }
        let dispatches = callbacks.iter().map(|sink| self.dispatch(sink, payload));
        join_all(dispatches).await;
    }

    async fn dispatch(&self, sink: &CallbackSink, payload: &serde_json::Value) {
        let url = match Url::parse(&sink.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %sink.url, error = %e, "skipping callback with invalid URL");
                return;
            }
        };

        let mut request = self
            .client
            .request(sink.method.as_reqwest(), url.clone())
            .header(CONTENT_TYPE, "application/json");

        for (name, value) in &sink.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => warn!(url = %sink.url, header = %name, "skipping invalid callback header"),
            }
        }

        if sink.method.has_body() {
            request = request.json(payload);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, status = %response.status(), "callback delivered");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "callback returned non-2xx");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "callback request failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
