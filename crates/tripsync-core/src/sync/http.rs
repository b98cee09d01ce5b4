//! HTTP implementation of [`RemoteDataSource`].
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  /v1/sync/{table}?user_id=..&since=..` pull deltas
//! - `POST /v1/sync/changes` apply a batch
//! - `PUT  /v1/sync/{table}/{id}` version-checked single write (409 on conflict)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::{SyncError, SyncResult};
use super::remote::{
    Applied, BatchResult, Change, PushOutcome, RejectReason, RemoteDataSource, RemoteRow,
};
use crate::config::RemoteConfig;
use crate::models::{EntityKind, EntityPayload};
use crate::util::{compact_text, normalize_text_option};

#[derive(Clone)]
pub struct HttpRemoteDataSource {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteDataSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteDataSource")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteDataSource {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self {
            endpoint,
            api_key: normalize_text_option(api_key),
            client,
        })
    }

    pub fn from_config(config: &RemoteConfig, timeout: Duration) -> SyncResult<Self> {
        let endpoint = config.endpoint().ok_or_else(|| {
            SyncError::transport_fatal("remote base_url is missing or not an http(s) URL")
        })?;
        Self::new(endpoint, config.api_key.clone(), timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!("{}/v1/sync/{}", self.endpoint, kind.table())
    }

    fn changes_url(&self) -> String {
        format!("{}/v1/sync/changes", self.endpoint)
    }

    fn row_url(&self, change: &Change) -> String {
        format!("{}/{}", self.table_url(change.kind), change.id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteDataSource for HttpRemoteDataSource {
    async fn pull(
        &self,
        kind: EntityKind,
        user_id: &str,
        since: Option<i64>,
    ) -> SyncResult<Vec<RemoteRow>> {
        let mut query = vec![("user_id", user_id.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let response = self
            .authorize(self.client.get(self.table_url(kind)).query(&query))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        let payload = response
            .json::<PullResponse>()
            .await
            .map_err(map_transport_error)?;
        tracing::debug!("Pulled {} {kind} rows", payload.rows.len());
        payload
            .rows
            .into_iter()
            .map(|row| row.into_remote(kind))
            .collect()
    }

    async fn push_batch(&self, changes: Vec<Change>) -> SyncResult<BatchResult> {
        let body = BatchRequest {
            changes: changes
                .iter()
                .map(WireChange::from_change)
                .collect::<SyncResult<_>>()?,
        };

        let response = self
            .authorize(self.client.post(self.changes_url()).json(&body))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        let payload = response
            .json::<BatchResponse>()
            .await
            .map_err(map_transport_error)?;

        let kinds: std::collections::HashMap<String, EntityKind> = changes
            .iter()
            .map(|change| (change.id.to_string(), change.kind))
            .collect();
        let mut result = BatchResult::default();
        for applied in payload.accepted {
            let id = parse_id(&applied.id)?;
            result.accepted.push((
                id,
                Applied {
                    version: applied.version,
                    updated_at: applied.updated_at,
                },
            ));
        }
        for rejected in payload.rejected {
            let id = parse_id(&rejected.id)?;
            let kind = kinds.get(&rejected.id).copied().ok_or_else(|| {
                SyncError::transport_fatal(format!("server rejected unknown change {id}"))
            })?;
            result.rejected.push((id, rejected.into_reason(kind)?));
        }
        Ok(result)
    }

    async fn push_one(&self, change: Change) -> SyncResult<PushOutcome> {
        let body = WireChange::from_change(&change)?;
        let response = self
            .authorize(self.client.put(self.row_url(&change)).json(&body))
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status() == StatusCode::CONFLICT {
            let payload = response
                .json::<ConflictResponse>()
                .await
                .map_err(map_transport_error)?;
            let current = payload
                .current
                .map(|row| row.into_remote(change.kind))
                .transpose()?;
            return Ok(PushOutcome::VersionConflict { current });
        }

        let response = check_status(response).await?;
        let applied = response
            .json::<WireApplied>()
            .await
            .map_err(map_transport_error)?;
        Ok(PushOutcome::Applied(Applied {
            version: applied.version,
            updated_at: applied.updated_at,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    rows: Vec<WireRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRow {
    id: String,
    user_id: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    version: i64,
    updated_at: i64,
    #[serde(default)]
    deleted_at: Option<i64>,
}

impl WireRow {
    fn into_remote(self, kind: EntityKind) -> SyncResult<RemoteRow> {
        let data = match self.data {
            Some(value) if !value.is_null() => Some(
                EntityPayload::from_data_value(kind, value)
                    .map_err(|e| SyncError::transport_fatal(format!("invalid {kind} row: {e}")))?,
            ),
            _ => None,
        };
        Ok(RemoteRow {
            kind,
            id: parse_id(&self.id)?,
            user_id: self.user_id,
            data,
            version: self.version,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[derive(Debug, Serialize)]
struct WireChange<'a> {
    entity_type: &'static str,
    id: String,
    user_id: &'a str,
    action: &'static str,
    version: i64,
    expected_version: Option<i64>,
    data: Option<serde_json::Value>,
}

impl<'a> WireChange<'a> {
    fn from_change(change: &'a Change) -> SyncResult<Self> {
        let data = change
            .data
            .as_ref()
            .map(EntityPayload::to_data_value)
            .transpose()?;
        Ok(Self {
            entity_type: change.kind.as_str(),
            id: change.id.to_string(),
            user_id: &change.user_id,
            action: change.action.as_str(),
            version: change.version,
            expected_version: change.expected_version,
            data,
        })
    }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    changes: Vec<WireChange<'a>>,
}

#[derive(Debug, Deserialize)]
struct WireApplied {
    #[serde(default)]
    id: String,
    version: i64,
    updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct WireRejected {
    id: String,
    reason: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    current: Option<WireRow>,
}

impl WireRejected {
    fn into_reason(self, kind: EntityKind) -> SyncResult<RejectReason> {
        let message = self.message.unwrap_or_else(|| self.reason.clone());
        let reason = match self.reason.as_str() {
            "version_conflict" => RejectReason::VersionConflict {
                current: self.current.map(|row| row.into_remote(kind)).transpose()?,
            },
            "transient" => RejectReason::Transient(message),
            _ => RejectReason::Invalid(message),
        };
        Ok(reason)
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    accepted: Vec<WireApplied>,
    #[serde(default)]
    rejected: Vec<WireRejected>,
}

#[derive(Debug, Deserialize)]
struct ConflictResponse {
    #[serde(default)]
    current: Option<WireRow>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_id(raw: &str) -> SyncResult<crate::models::EntityId> {
    raw.parse()
        .map_err(|e| SyncError::transport_fatal(format!("invalid entity id {raw:?}: {e}")))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

fn status_error(status: StatusCode, body: &str) -> SyncError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Unauthenticated,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::transport_retryable(message)
        }
        status if status.is_server_error() => SyncError::Server(message),
        _ => SyncError::Rejected(message),
    }
}

async fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn map_transport_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::Timeout
    } else if error.is_connect() {
        SyncError::NotConnected
    } else if error.is_decode() {
        SyncError::transport_fatal(error.to_string())
    } else {
        SyncError::transport_retryable(error.to_string())
    }
}

fn normalize_endpoint(raw: String) -> SyncResult<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| SyncError::transport_fatal("endpoint must not be empty"))?;
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(SyncError::transport_fatal(
            "endpoint must include http:// or https://",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityId, OperationAction, SyncEntity, Vehicle};
    use pretty_assertions::assert_eq;

    fn source() -> HttpRemoteDataSource {
        HttpRemoteDataSource::new(
            "https://api.example.com/",
            Some("secret-key".to_string()),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint(" https://api.example.com/ ".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn debug_redacts_api_key() {
        let debug = format!("{:?}", source());
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn urls_use_table_names() {
        let source = source();
        assert_eq!(
            source.table_url(EntityKind::WorkSchedule),
            "https://api.example.com/v1/sync/work_schedules"
        );
        assert_eq!(source.changes_url(), "https://api.example.com/v1/sync/changes");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            SyncError::Unauthenticated
        ));
        let server = status_error(StatusCode::BAD_GATEWAY, "");
        assert!(server.is_retryable());
        let rejected = status_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"plate is invalid"}"#,
        );
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.to_string(), "rejected by server: plate is invalid (422)");
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
    }

    #[test]
    fn long_error_pages_are_truncated() {
        let page = "x".repeat(4_000);
        let message = parse_api_error(StatusCode::BAD_GATEWAY, &page);
        assert_eq!(message.len(), 180 + " (502)".len());
    }

    #[test]
    fn wire_row_into_remote() {
        let id = EntityId::new();
        let row: WireRow = serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "user_id": "user-1",
            "data": {"name": "Clio", "fiscal_horsepower": 4, "fuel_type": "diesel", "is_default": false},
            "version": 3,
            "updated_at": 1_000
        }))
        .unwrap();

        let remote = row.into_remote(EntityKind::Vehicle).unwrap();
        assert_eq!(remote.id, id);
        assert_eq!(remote.version, 3);
        assert!(!remote.is_deleted());

        let tombstone: WireRow = serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "user_id": "user-1",
            "data": null,
            "version": 4,
            "updated_at": 2_000,
            "deleted_at": 2_000
        }))
        .unwrap();
        assert!(tombstone.into_remote(EntityKind::Vehicle).unwrap().is_deleted());
    }

    #[test]
    fn wire_change_carries_untagged_data() {
        let change = Change {
            kind: EntityKind::Vehicle,
            id: EntityId::new(),
            user_id: "user-1".to_string(),
            action: OperationAction::Update,
            version: 2,
            expected_version: Some(1),
            data: Some(Vehicle::new("Clio").into_payload()),
        };

        let json = serde_json::to_value(WireChange::from_change(&change).unwrap()).unwrap();
        assert_eq!(json["entity_type"], "vehicle");
        assert_eq!(json["action"], "UPDATE");
        assert_eq!(json["expected_version"], 1);
        assert_eq!(json["data"]["name"], "Clio");
    }
}
