use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{header, Body, Client, Method, Request, StatusCode, Uri};
use serde_json::{json, Map, Value};

use crate::storage::MutationKind;

use super::RemoteError;

/// Delivers one mutation to the remote authoritative service.
///
/// Implementations must bound every call; a timeout is reported as a
/// transient failure like any other transport problem.
#[async_trait]
pub trait RemoteMutationClient: Send + Sync {
    async fn submit(&self, kind: &MutationKind, payload: &Value) -> Result<(), RemoteError>;
}

/// One best-effort read refresh run during the download phase of a cycle.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Stable name, also used as the read-cache key.
    fn name(&self) -> &str;

    async fn refresh(&self) -> Result<Value, RemoteError>;
}

/// Fields the count-line endpoint accepts. Anything else a form layer put in
/// the payload (display names, local ids) is stripped before sending.
const COUNT_LINE_FIELDS: &[&str] = &[
    "session_id",
    "item_code",
    "counted_qty",
    "damaged_qty",
    "non_returnable_damaged_qty",
    "sr_no",
    "mrp_counted",
    "remark",
    "floor_no",
    "rack_no",
    "variant_id",
    "variant_barcode",
    "item_condition",
    "manufacturing_date",
];

fn count_line_body(payload: &Value) -> Value {
    let mut body = Map::new();
    if let Value::Object(fields) = payload {
        for name in COUNT_LINE_FIELDS {
            match fields.get(*name) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    body.insert((*name).to_string(), value.clone());
                }
            }
        }
    }
    Value::Object(body)
}

/// Request path and body for each mutation kind.
fn route(kind: &MutationKind, payload: &Value) -> Result<(&'static str, Value), RemoteError> {
    match kind {
        MutationKind::CreateSession => Ok(("/api/sessions", payload.clone())),
        MutationKind::CreateCountLine => Ok(("/api/count-lines", count_line_body(payload))),
        MutationKind::CreateUnknownItem => Ok(("/api/unknown-items", payload.clone())),
        MutationKind::SyncRecord => Ok((
            "/api/sync/batch",
            json!({ "records": [payload], "operations": [] }),
        )),
        MutationKind::Unrecognized(tag) => Err(RemoteError::UnsupportedKind(tag.clone())),
    }
}

/// Best human-readable message from an error response body.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for field in ["detail", "message", "error"] {
            if let Some(text) = value.get(field).and_then(Value::as_str) {
                return text.to_string();
            }
        }

        // Validation errors carry a list of {loc, msg} entries.
        if let Some(Value::Array(items)) = value.get("detail") {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect();
            if !messages.is_empty() {
                return messages.join("; ");
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if !text.is_empty() {
        return text.chars().take(200).collect();
    }

    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

/// The batch endpoint answers 200 with per-record results. A refused record
/// carries no status to classify it by, so it spends one retry.
fn check_record_results(body: &[u8]) -> Result<(), RemoteError> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Ok(());
    };
    let Some(results) = value.get("results").and_then(Value::as_array) else {
        return Ok(());
    };

    for result in results {
        if result.get("success").and_then(Value::as_bool) == Some(false) {
            let message = result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(RemoteError::transient(message));
        }
    }
    Ok(())
}

/// Remote Mutation Client speaking JSON over HTTP/1.1.
#[derive(Clone)]
pub struct HttpMutationClient {
    client: Client<HttpConnector>,
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpMutationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            timeout,
        }
    }

    /// Bearer credential supplied by the host's auth layer.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The read refreshes run after every upload phase: the first page of
    /// sessions and a broad item search.
    pub fn refreshers(&self) -> Vec<Arc<dyn Refresher>> {
        vec![
            Arc::new(HttpRefresher::new(
                self.clone(),
                "sessions",
                "/api/sessions?page=1&page_size=50",
            )),
            Arc::new(HttpRefresher::new(self.clone(), "items", "/api/items/search?q=.")),
        ]
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Bytes), RemoteError> {
        let uri: Uri = format!("{}{}", self.base_url, path)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| RemoteError::RequestError(e.to_string()))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let request = match body {
            Some(body) => {
                let bytes = serde_json::to_vec(body)
                    .map_err(|e| RemoteError::RequestError(e.to_string()))?;
                builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))
            }
            None => builder.body(Body::empty()),
        }
        .map_err(|e| RemoteError::RequestError(e.to_string()))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(RemoteError::ConnectionError(e.to_string())),
            Err(_) => Err(RemoteError::TimeoutError(self.timeout)),
        }
    }
}

#[async_trait]
impl RemoteMutationClient for HttpMutationClient {
    async fn submit(&self, kind: &MutationKind, payload: &Value) -> Result<(), RemoteError> {
        let (path, body) = route(kind, payload)?;
        let (status, bytes) = self.send(Method::POST, path, Some(&body)).await?;

        if !status.is_success() {
            return Err(RemoteError::from_status(
                status.as_u16(),
                error_message(status, &bytes),
            ));
        }

        if *kind == MutationKind::SyncRecord {
            check_record_results(&bytes)?;
        }

        log::debug!("Submitted {kind} to {path} ({status})");
        Ok(())
    }
}

pub struct HttpRefresher {
    client: HttpMutationClient,
    name: String,
    path: String,
}

impl HttpRefresher {
    pub fn new(client: HttpMutationClient, name: &str, path: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl Refresher for HttpRefresher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self) -> Result<Value, RemoteError> {
        let (status, bytes) = self.client.send(Method::GET, &self.path, None).await?;
        if !status.is_success() {
            return Err(RemoteError::from_status(
                status.as_u16(),
                error_message(status, &bytes),
            ));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::transient(format!("invalid JSON from {}: {e}", self.path)))
    }
}
