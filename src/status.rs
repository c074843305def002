//! Client for the streaming server's SRT connection-status endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub type StatusResult<T> = Result<T, StatusError>;

/// Errors from polling the status endpoint. The monitor loop treats all of
/// them as "no publishing connection" for the tick, but they carry distinct
/// messages for the operator.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("endpoint returned {0}")]
    Http(StatusCode),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for StatusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StatusError::Timeout
        } else if err.is_connect() {
            StatusError::ConnectionRefused
        } else {
            StatusError::Transport(err.to_string())
        }
    }
}

/// One connection as reported by the status feed. Only `state == "publish"`
/// is meaningful to the monitor; `id` is an arbitrary scalar kept for logs.
#[derive(Clone, Debug, Deserialize)]
pub struct SrtConnection {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub state: String,
    #[serde(default, rename = "mbpsSendRate")]
    pub mbps_send_rate: Option<f64>,
}

impl SrtConnection {
    pub fn is_publishing(&self) -> bool {
        self.state == "publish"
    }

    /// Send rate in mbps, with a missing value read as zero.
    pub fn send_rate(&self) -> f64 {
        self.mbps_send_rate.unwrap_or(0.0)
    }
}

/// Seam between the monitor loop and the status endpoint, so tests can
/// script the feed without a server.
#[async_trait]
pub trait StatusSource: Send {
    async fn list_connections(&self) -> StatusResult<Vec<SrtConnection>>;
}

pub struct StatusClient {
    client: reqwest::Client,
    url: String,
}

impl StatusClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl StatusSource for StatusClient {
    async fn list_connections(&self) -> StatusResult<Vec<SrtConnection>> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .header("User-Agent", "obs-autoscene/0.1")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StatusError::Http(response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StatusError::Malformed(e.to_string()))?;
        parse_connections(body)
    }
}

/// Accepts either a bare array of connections or an object wrapping the
/// array under `items` (the paginated shape newer servers return). The
/// item/page counts are only interesting for debugging.
pub fn parse_connections(body: Value) -> StatusResult<Vec<SrtConnection>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => {
                if let Some(count) = map.get("itemCount").and_then(Value::as_u64) {
                    let pages = map.get("pageCount").and_then(Value::as_u64).unwrap_or(1);
                    debug!("status feed reports {} connection(s) over {} page(s)", count, pages);
                }
                items
            }
            _ => {
                return Err(StatusError::Malformed(
                    "object response without an items array".to_string(),
                ))
            }
        },
        other => {
            return Err(StatusError::Malformed(format!(
                "unexpected response shape: {}",
                other
            )))
        }
    };

    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| StatusError::Malformed(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_array() {
        let body = json!([
            { "id": 1, "state": "idle" },
            { "id": 2, "state": "publish", "mbpsSendRate": 0.5 }
        ]);

        let connections = parse_connections(body).unwrap();

        assert_eq!(connections.len(), 2);
        assert!(!connections[0].is_publishing());
        assert!(connections[1].is_publishing());
        assert_eq!(connections[1].send_rate(), 0.5);
    }

    #[test]
    fn parses_items_wrapper() {
        let body = json!({
            "itemCount": 1,
            "pageCount": 1,
            "items": [ { "id": "d3b1", "state": "publish" } ]
        });

        let connections = parse_connections(body).unwrap();

        assert_eq!(connections.len(), 1);
        assert!(connections[0].is_publishing());
        // missing send rate reads as zero
        assert_eq!(connections[0].send_rate(), 0.0);
    }

    #[test]
    fn object_without_items_is_malformed() {
        let body = json!({ "error": "no such path" });
        assert!(matches!(
            parse_connections(body),
            Err(StatusError::Malformed(_))
        ));
    }

    #[test]
    fn scalar_body_is_malformed() {
        assert!(matches!(
            parse_connections(json!("ok")),
            Err(StatusError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_states_are_not_publishing() {
        let connections =
            parse_connections(json!([{ "id": 7, "state": "request" }])).unwrap();
        assert!(!connections[0].is_publishing());
    }
}
