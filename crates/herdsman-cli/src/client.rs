//! HTTP client for the orchestrator's command and diagnostics endpoints.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use herdsman_core::{CommandOutcome, HealthSnapshot, Resource, WorkerState};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

/// Ledger row as reported by `/v1/ledger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub error_kind: String,
    pub attempts: u32,
    pub max: u32,
    pub exhausted: bool,
}

/// Per-resource trend as reported by `/v1/health/trend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendRow {
    pub resource: Resource,
    pub average: f64,
    pub peak: f64,
    pub samples: usize,
}

/// Worker slot as reported by `/v1/workers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRow {
    pub slot: usize,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub state: Option<WorkerState>,
    pub busy: bool,
    pub operation_count: u64,
    pub restarts: u64,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ExecuteBody<'a> {
    operation: &'a str,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deadline_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ResetBody<'a> {
    error_kind: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for REST API endpoints.
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client.
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Check if the orchestrator is up.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        debug!(url = %url, "Checking health");

        let response = self.inner.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    pub async fn execute(
        &self,
        operation: &str,
        payload: &[u8],
        deadline_ms: Option<u64>,
    ) -> Result<CommandOutcome, ClientError> {
        let body = ExecuteBody {
            operation,
            payload: STANDARD.encode(payload),
            deadline_ms,
        };
        self.post_json("/v1/execute", &body).await
    }

    pub async fn health_snapshot(&self) -> Result<HealthSnapshot, ClientError> {
        self.get_json("/v1/health/snapshot").await
    }

    pub async fn health_history(&self, limit: Option<usize>) -> Result<Vec<HealthSnapshot>, ClientError> {
        match limit {
            Some(limit) => self.get_json(&format!("/v1/health/history?limit={limit}")).await,
            None => self.get_json("/v1/health/history").await,
        }
    }

    pub async fn health_trend(&self, window: Option<usize>) -> Result<Vec<TrendRow>, ClientError> {
        match window {
            Some(window) => self.get_json(&format!("/v1/health/trend?window={window}")).await,
            None => self.get_json("/v1/health/trend").await,
        }
    }

    pub async fn ledger(&self) -> Result<Vec<LedgerRow>, ClientError> {
        self.get_json("/v1/ledger").await
    }

    /// Reset one error kind, or all of them when `error_kind` is `None`.
    pub async fn reset_ledger(&self, error_kind: Option<&str>) -> Result<Vec<LedgerRow>, ClientError> {
        self.post_json("/v1/ledger/reset", &ResetBody { error_kind })
            .await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerRow>, ClientError> {
        self.get_json("/v1/workers").await
    }

    /// Get JSON from an endpoint.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET request");

        let response = self.inner.get(&url).send().await?;
        Self::decode(response).await
    }

    /// Post a JSON body and decode the JSON reply.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST request");

        let response = self.inner.post(&url).json(body).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    /// Serve a stub orchestrator on an ephemeral port.
    async fn stub() -> HttpClient {
        let router = Router::new()
            .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
            .route(
                "/v1/execute",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "success": true,
                        "result": body["payload"],
                        "error_kind": null,
                        "error_message": null,
                        "phase": "SUCCEEDED",
                        "recovery_summary": null
                    }))
                }),
            )
            .route(
                "/v1/health/snapshot",
                get(|| async {
                    (
                        StatusCode::NOT_FOUND,
                        Json(json!({ "error": "no health sample recorded yet" })),
                    )
                }),
            )
            .route(
                "/v1/health/history",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    let count: usize = query
                        .get("limit")
                        .and_then(|l| l.parse().ok())
                        .unwrap_or(3);
                    let rows: Vec<Value> = (0..count)
                        .map(|_| {
                            json!({
                                "timestamp": "2026-01-01T00:00:00Z",
                                "cpu": 0.1, "memory": 0.2, "disk": 0.3
                            })
                        })
                        .collect();
                    Json(Value::Array(rows))
                }),
            )
            .route(
                "/v1/health/trend",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    let samples: usize = query
                        .get("window")
                        .and_then(|w| w.parse().ok())
                        .unwrap_or(60);
                    Json(json!([
                        { "resource": "cpu", "average": 0.1, "peak": 0.2, "samples": samples },
                        { "resource": "memory", "average": 0.5, "peak": 0.9, "samples": samples },
                        { "resource": "disk", "average": 0.3, "peak": 0.3, "samples": samples }
                    ]))
                }),
            )
            .route(
                "/v1/ledger/reset",
                post(|Json(body): Json<Value>| async move {
                    Json(json!([{
                        "error_kind": body["error_kind"].as_str().unwrap_or("AccessDenied"),
                        "attempts": 0, "max": 3, "exhausted": false
                    }]))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        HttpClient::new(&format!("http://{addr}/"))
    }

    #[tokio::test]
    async fn test_execute_round_trips_payload() {
        let client = stub().await;
        assert!(client.health().await.unwrap());

        let outcome = client.execute("echo", b"\x00\x01", Some(500)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(vec![0, 1]));
    }

    #[tokio::test]
    async fn test_error_body_becomes_status_error() {
        let client = stub().await;
        let err = client.health_snapshot().await.unwrap_err();
        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no health sample recorded yet");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_history_passes_limit() {
        let client = stub().await;
        assert_eq!(client.health_history(Some(2)).await.unwrap().len(), 2);
        assert_eq!(client.health_history(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_trend_passes_window() {
        let client = stub().await;
        let rows = client.health_trend(Some(5)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].resource, Resource::Memory);
        assert_eq!(rows[1].peak, 0.9);
        assert_eq!(rows[1].samples, 5);
        assert_eq!(client.health_trend(None).await.unwrap()[0].samples, 60);
    }

    #[tokio::test]
    async fn test_reset_sends_kind() {
        let client = stub().await;
        let rows = client.reset_ledger(Some("ConnectivityFailure")).await.unwrap();
        assert_eq!(rows[0].error_kind, "ConnectivityFailure");
        assert!(!rows[0].exhausted);
    }
}
