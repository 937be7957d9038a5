use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const SNAPSHOT_PATH: &str = "/state/overview";
pub const DETECT_PATH: &str = "/tools/detect";
pub const MATCH_PATH: &str = "/tools/match";
pub const AUDIT_PATH: &str = "/tools/audit";
pub const FORECAST_PATH: &str = "/tools/forecast";
pub const PLANNER_PATH: &str = "/planner/run";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned {status}")]
    Status { endpoint: String, status: StatusCode },
    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Where the poller gets its raw snapshots and per-entity forecasts.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Value, ClientError>;

    async fn fetch_forecast(
        &self,
        entity_id: &str,
        horizon_minutes: u32,
    ) -> Result<Value, ClientError>;
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode(path: &str, resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                endpoint: path.to_string(),
                status,
            });
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| ClientError::Decode(format!("{path}: {err}")))
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let resp = self.client.get(self.url(path)).send().await?;
        Self::decode(path, resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(path, resp).await
    }

    pub async fn run_detect(&self) -> Result<Value, ClientError> {
        self.post(DETECT_PATH, &json!({})).await
    }

    pub async fn run_match(&self) -> Result<Value, ClientError> {
        self.post(MATCH_PATH, &json!({})).await
    }

    pub async fn run_audit(&self) -> Result<Value, ClientError> {
        self.post(AUDIT_PATH, &json!({})).await
    }

    pub async fn run_forecast(
        &self,
        entity_id: &str,
        horizon_minutes: u32,
    ) -> Result<Value, ClientError> {
        self.post(FORECAST_PATH, &forecast_request(entity_id, horizon_minutes))
            .await
    }

    pub async fn run_planner(
        &self,
        goal: &str,
        context: Value,
        dry_run: bool,
    ) -> Result<Value, ClientError> {
        let body = json!({ "goal": goal, "context": context, "dry_run": dry_run });
        self.post(PLANNER_PATH, &body).await
    }
}

/// Carries both entity-id spellings so either backend dialect accepts it.
pub fn forecast_request(entity_id: &str, horizon_minutes: u32) -> Value {
    json!({
        "cauldron_id": entity_id,
        "entity_id": entity_id,
        "horizon_minutes": horizon_minutes,
    })
}

#[async_trait]
impl SnapshotSource for BackendClient {
    async fn fetch_snapshot(&self) -> Result<Value, ClientError> {
        self.get(SNAPSHOT_PATH).await
    }

    async fn fetch_forecast(
        &self,
        entity_id: &str,
        horizon_minutes: u32,
    ) -> Result<Value, ClientError> {
        self.run_forecast(entity_id, horizon_minutes).await
    }
}
