//! Delivery REST API client.
//!
//! Authenticated HTTP access to the tracking snapshot endpoint and the driver
//! deliveries endpoints. Implements [`TrackingApi`] and [`DeliveryBackend`]
//! so the tracking client and the driver console never see HTTP directly.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::deliveries::{
    BulkStatusUpdateRequest, BulkStatusUpdateResponse, DailyDeliveries, DailyDeliveriesQuery,
    DeliveryBackend, DeliveryRecord, StatusUpdateRequest,
};
use crate::error::{DeliveryError, TrackingError};
use crate::reducer::RemoteSnapshot;
use crate::tracking::TrackingApi;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach delivery server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid delivery server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session expired or auth token is invalid".to_string(),
        403 => "Not authorized for this delivery".to_string(),
        404 => "Delivery or order not found".to_string(),
        409 => "Delivery was changed by someone else".to_string(),
        s if s >= 500 => "Delivery server error".to_string(),
        _ => "Unexpected response from delivery server".to_string(),
    }
}

/// Build the error text for a non-2xx response, keeping whatever detail the
/// server sent back.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let body = body_text.trim();
    let code = status.as_u16();
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        let details = json.get("details").or_else(|| json.get("errors")).cloned();
        if let Some(details) = details {
            format!("{message} (HTTP {code}): {details}")
        } else if !body.is_empty() && body != message && !json.is_object() {
            format!("{message} (HTTP {code}): {body}")
        } else {
            format!("{message} (HTTP {code})")
        }
    } else if !body.is_empty() {
        format!("{} (HTTP {code}): {body}", status_error(status))
    } else {
        format!("{} (HTTP {code})", status_error(status))
    }
}

/// Some endpoints wrap their payload as `{ "data": { ... } }`.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| format!("Invalid {what} from delivery server: {e}"))
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    base_url: String,
    auth_token: Zeroizing<String>,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, auth_token: Zeroizing<String>, timeout: Duration) -> Result<Self, String> {
        let base_url = normalize_base_url(base_url);
        Url::parse(&base_url).map_err(|e| format!("Invalid delivery server URL {base_url}: {e}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url,
            auth_token,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/{segments...}` with every segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| format!("Invalid delivery server URL {}: {e}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| format!("Delivery server URL cannot have a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Perform an authenticated request and return the JSON body, or `null`
    /// for an empty response.
    async fn request_json(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Value, String> {
        let path = url.path().to_string();
        let mut req = self
            .client
            .request(method.clone(), url)
            .header("Content-Type", "application/json");
        if !self.auth_token.is_empty() {
            req = req.bearer_auth(self.auth_token.as_str());
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        debug!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Delivery API request"
        );

        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let detail = error_detail(status, &body_text);
            warn!(method = %method, path = %path, error = %detail, "Delivery API request failed");
            return Err(detail);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from delivery server: {e}"))
    }

    async fn put_json<B: Serialize>(&self, segments: &[&str], body: &B) -> Result<Value, String> {
        let url = self.endpoint(segments)?;
        let body = serde_json::to_value(body).map_err(|e| format!("Failed to encode request: {e}"))?;
        self.request_json(Method::PUT, url, Some(body)).await
    }

    /// Lightweight health check against `{base}/health`.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        let url = match self.endpoint(&["health"]) {
            Ok(u) => u,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(e),
                }
            }
        };

        let start = Instant::now();
        let resp = match self
            .client
            .get(url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.base_url, &e)),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(format!("{} (HTTP {})", status_error(status), status.as_u16())),
            }
        }
    }
}

#[async_trait]
impl TrackingApi for ApiClient {
    async fn fetch_tracking(&self, order_id: &str) -> Result<RemoteSnapshot, TrackingError> {
        let url = self
            .endpoint(&["delivery-tracking", order_id])
            .map_err(TrackingError::Fetch)?;
        let value = self
            .request_json(Method::GET, url, None)
            .await
            .map_err(TrackingError::Fetch)?;
        decode(unwrap_data(value), "tracking snapshot").map_err(TrackingError::Decode)
    }
}

#[async_trait]
impl DeliveryBackend for ApiClient {
    async fn update_status(
        &self,
        request: &StatusUpdateRequest,
    ) -> Result<DeliveryRecord, DeliveryError> {
        let value = self
            .put_json(&["driver", "deliveries", "status"], request)
            .await
            .map_err(DeliveryError::Transport)?;
        decode(unwrap_data(value), "delivery record").map_err(DeliveryError::Transport)
    }

    async fn bulk_update_status(
        &self,
        request: &BulkStatusUpdateRequest,
    ) -> Result<BulkStatusUpdateResponse, DeliveryError> {
        let value = self
            .put_json(&["driver", "deliveries", "bulk-status"], request)
            .await
            .map_err(DeliveryError::Transport)?;
        match unwrap_data(value) {
            Value::Null => Ok(BulkStatusUpdateResponse::default()),
            value => decode(value, "bulk update result").map_err(DeliveryError::Transport),
        }
    }

    async fn daily_deliveries(
        &self,
        query: &DailyDeliveriesQuery,
    ) -> Result<DailyDeliveries, DeliveryError> {
        let mut url = self
            .endpoint(&["driver", "deliveries", "daily"])
            .map_err(DeliveryError::Transport)?;
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query.to_query_pairs() {
                qp.append_pair(k, &v);
            }
        }
        let value = self
            .request_json(Method::GET, url, None)
            .await
            .map_err(DeliveryError::Transport)?;
        decode(value, "deliveries list").map_err(DeliveryError::Transport)
    }
}
