//! Axum JSON API over the sync core: sync triggers, analysis, connection
//! listing, and credential summaries.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadsheet_core::{CredentialSummary, SheetConnection, SyncError};
use leadsheet_source::CredentialStore;
use leadsheet_storage::ConnectionStore;
use leadsheet_sync::{engine_with_store_from_config, SyncConfig, SyncEngine};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsheet-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub connections: Arc<dyn ConnectionStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl AppState {
    pub fn new(
        engine: Arc<SyncEngine>,
        connections: Arc<dyn ConnectionStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            engine,
            connections,
            credentials,
        }
    }
}

/// JSON error body with the taxonomy's stable machine-readable code, so the
/// UI can dispatch a specific remediation.
struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::AuthRequired | SyncError::RefreshFailed(_) => StatusCode::UNAUTHORIZED,
            SyncError::AccessDenied => StatusCode::FORBIDDEN,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidLocator(_) | SyncError::EmptySource => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SyncError::MalformedResponse(_) | SyncError::Network(_) => StatusCode::BAD_GATEWAY,
            SyncError::SuggestionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::InProgress => StatusCode::CONFLICT,
            SyncError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/connections", get(connections_handler))
        .route("/connections/{id}/disconnect", post(disconnect_handler))
        .route("/connections/{id}/sync", post(sync_connection_handler))
        .route("/sync", post(sync_user_handler))
        .route("/analyze", post(analyze_handler))
        .route("/credentials/{user_id}", get(credential_summary_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("LEADSHEET_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let (engine, store) = engine_with_store_from_config(&config).await?;
    let state = AppState::new(engine, store.clone(), store);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving leadsheet api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: Uuid,
}

async fn connections_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SheetConnection>>, ApiError> {
    let connections = state
        .connections
        .active_connections_for_user(query.user_id)
        .await?;
    Ok(Json(connections))
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.connections.set_active(id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_user_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Response, ApiError> {
    let summary = state.engine.clone().sync_user(query.user_id).await?;
    Ok(Json(summary).into_response())
}

async fn sync_connection_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, ApiError> {
    let connection = state
        .connections
        .connection(id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("connection {id}")))?;
    match state.engine.sync_connection(&connection).await {
        Ok(summary) => Ok(Json(summary).into_response()),
        // Connection-level failures keep their structure so the UI can show
        // the failed phase alongside the remediation code.
        Err(failure) => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "code": failure.code,
                "phase": failure.phase,
                "message": failure.message,
            })),
        )
            .into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    sheet_url: String,
    #[serde(default)]
    tabs: Option<Vec<String>>,
    #[serde(default)]
    user_id: Option<Uuid>,
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    let analyses = state
        .engine
        .analyze_sheet(request.user_id, &request.sheet_url, request.tabs)
        .await?;
    Ok(Json(analyses).into_response())
}

/// Tokens are write-only from the UI's perspective: only the non-sensitive
/// projection ever leaves this surface.
async fn credential_summary_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<Uuid>,
) -> Result<Json<CredentialSummary>, ApiError> {
    let credential = state
        .credentials
        .credential(user_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("credential for user {user_id}")))?;
    Ok(Json(credential.summary()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use leadsheet_core::{
        ColumnMapping, Credential, EntityKind, RawTable, SheetLocator, Transform,
    };
    use leadsheet_mapper::RuleSuggestionPort;
    use leadsheet_source::{parse_csv, SheetReader, TabInfo};
    use leadsheet_storage::MemoryStore;
    use leadsheet_sync::EngineOptions;
    use tower::ServiceExt;

    struct TableReader(RawTable);

    #[async_trait]
    impl SheetReader for TableReader {
        async fn fetch_rows(
            &self,
            _locator: &SheetLocator,
            _access_token: Option<&str>,
            max_rows: Option<usize>,
        ) -> Result<RawTable, SyncError> {
            let mut table = self.0.clone();
            if let Some(max) = max_rows {
                table.truncate(max);
            }
            Ok(table)
        }

        async fn list_tabs(
            &self,
            _locator: &SheetLocator,
            _access_token: Option<&str>,
        ) -> Result<Vec<TabInfo>, SyncError> {
            Ok(vec![])
        }
    }

    fn test_state(csv: &str) -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(SyncEngine::new(
            Arc::new(TableReader(parse_csv(csv))),
            store.clone(),
            store.clone(),
            store.clone(),
            None,
            Arc::new(RuleSuggestionPort),
            EngineOptions::default(),
        ));
        let state = AppState::new(engine, store.clone(), store.clone());
        (state, store)
    }

    fn lead_connection(user_id: Uuid) -> SheetConnection {
        SheetConnection {
            id: Uuid::new_v4(),
            user_id,
            sheet_url: "https://docs.google.com/spreadsheets/d/book/edit#gid=0".into(),
            sheet_name: Some("Leads".into()),
            sheet_type: EntityKind::Leads,
            mappings: vec![
                ColumnMapping::new("Name", "name"),
                ColumnMapping::new("Email", "email").with_transform(Transform::LowercaseTrim),
            ],
            is_active: true,
            last_synced_at: None,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (state, _store) = test_state("Name,Email\nAda,ada@x.com\n");
        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_endpoint_returns_per_connection_summaries() {
        let (state, store) = test_state("Name,Email\nAda,ada@x.com\nGrace,grace@x.com\n");
        let user_id = Uuid::new_v4();
        let connection = lead_connection(user_id);
        store.insert_connection(&connection).await.unwrap();

        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/sync?user_id={user_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["connections"][0]["imported"], 2);
        assert_eq!(body["connections"][0]["failed"], 0);
        assert!(body["failures"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_connection_sync_and_disconnect_round_trip() {
        let (state, store) = test_state("Name,Email\nAda,ada@x.com\n");
        let user_id = Uuid::new_v4();
        let connection = lead_connection(user_id);
        store.insert_connection(&connection).await.unwrap();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/connections/{}/sync", connection.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["imported"], 1);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/connections/{}/disconnect", connection.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/connections?user_id={user_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn analyze_endpoint_proposes_mappings() {
        let (state, _store) = test_state(
            "Lead Name,Email Address,Setter,Closer,Call Result,Cash Collected\n\
             Ada,ada@x.com,Sam,Jane,won,$100\n",
        );
        let app = app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/analyze")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"sheet_url": "https://docs.google.com/spreadsheets/d/book/edit#gid=0"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body[0]["detected_kind"], "appointments");
        assert!(body[0]["mappings"].as_array().unwrap().len() >= 6);
    }

    #[tokio::test]
    async fn credential_endpoint_exposes_only_the_summary() {
        let (state, store) = test_state("Name,Email\nAda,ada@x.com\n");
        let user_id = Uuid::new_v4();
        store
            .upsert_credential(&Credential {
                user_id,
                access_token: "secret-access".into(),
                refresh_token: "secret-refresh".into(),
                expires_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let app = app(state);
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/credentials/{user_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body.get("access_token").is_none());
        assert!(body.get("refresh_token").is_none());
        assert_eq!(body["user_id"], user_id.to_string());

        let missing = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/credentials/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
