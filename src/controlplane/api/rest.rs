//! REST API Handlers
//!
//! Thin adapter from HTTP to the disk service. Capacities travel as quantity
//! strings (`10Gi`), life spans as seconds.

use crate::controlplane::service::DiskService;
use crate::domain::disk::{life_span_from_secs, Disk, DiskRequest, Scope};
use crate::domain::quantity::{format_quantity, parse_quantity};
use crate::error::Error;
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Header carrying the requesting user
pub const USER_HEADER: &str = "x-platform-user";
/// Header stamped on every response
pub const VERSION_HEADER: &str = "x-service-version";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Disk creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDiskRequest {
    pub org_name: String,
    pub project_name: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Capacity (e.g., "10Gi", "500M")
    pub capacity: String,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Life span in seconds
    #[serde(default)]
    pub life_span: Option<f64>,
}

impl CreateDiskRequest {
    /// Convert into a service request on behalf of `requester`
    pub fn into_request(self, requester: String) -> Result<DiskRequest, Error> {
        Ok(DiskRequest {
            scope: Scope::new(self.org_name, self.project_name),
            name: self.name,
            capacity_bytes: parse_quantity(&self.capacity)?,
            storage_class: self.storage_class,
            life_span: self.life_span.map(life_span_from_secs).transpose()?,
            requester,
        })
    }
}

/// Disk as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskResponse {
    pub id: String,
    pub name: Option<String>,
    pub org_name: String,
    pub project_name: String,
    pub owner: String,
    pub status: String,
    pub requested_capacity: String,
    pub requested_capacity_bytes: u64,
    pub capacity_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub storage_class: Option<String>,
    /// Life span in seconds
    pub life_span: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_usage_check: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&Disk> for DiskResponse {
    fn from(disk: &Disk) -> Self {
        Self {
            id: disk.id.clone(),
            name: disk.name.clone(),
            org_name: disk.scope.org.clone(),
            project_name: disk.scope.project.clone(),
            owner: disk.owner.clone(),
            status: disk.status.to_string(),
            requested_capacity: format_quantity(disk.requested_capacity_bytes),
            requested_capacity_bytes: disk.requested_capacity_bytes,
            capacity_bytes: disk.capacity_bytes,
            used_bytes: disk.used_bytes,
            storage_class: disk.storage_class.clone(),
            life_span: disk
                .life_span
                .map(|span| span.num_milliseconds() as f64 / 1000.0),
            created_at: disk.created_at,
            last_usage_check: disk.last_usage_check,
            last_used_at: disk.last_used_at,
        }
    }
}

/// Optional scope given as query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeQuery {
    pub org_name: Option<String>,
    pub project_name: Option<String>,
}

impl ScopeQuery {
    /// Both parts or neither
    pub fn scope(&self) -> Result<Option<Scope>, Error> {
        match (&self.org_name, &self.project_name) {
            (Some(org), Some(project)) => Ok(Some(Scope::new(org.clone(), project.clone()))),
            (None, None) => Ok(None),
            _ => Err(Error::ApiValidation(
                "org_name and project_name must be given together".into(),
            )),
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Service error rendered as an HTTP response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Error::NameTaken { .. } => (StatusCode::CONFLICT, "name_taken"),
            Error::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
            Error::QuotaExceeded { .. } => (StatusCode::FORBIDDEN, "over_limit"),
            Error::Unavailable { .. } | Error::Kube(_) | Error::Conflict { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            Error::ApiValidation(_) | Error::CapacityParse(_) | Error::DurationParse(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let details = match &self.0 {
            Error::QuotaExceeded {
                used,
                limit,
                requested,
                ..
            } => Some(serde_json::json!({
                "used": used,
                "limit": limit,
                "requested": requested,
            })),
            _ => None,
        };

        (
            status,
            Json(ApiErrorResponse {
                error: code.into(),
                message: self.0.to_string(),
                details,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    service: Arc<DiskService>,
    cors_origins: Vec<String>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(service: Arc<DiskService>) -> Self {
        Self {
            service,
            cors_origins: Vec::new(),
        }
    }

    /// Allowed CORS origins; `*` allows any
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            service: self.service,
        };

        Router::new()
            .route("/api/v1/disk", get(list_disks).post(create_disk))
            .route("/api/v1/disk/:id_or_name", get(get_disk).delete(delete_disk))
            .route("/ping", get(ping))
            .with_state(state)
            .layer(middleware::map_response(stamp_version))
            .layer(cors_layer(&self.cors_origins))
            .layer(TraceLayer::new_for_http())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin {}", origin);
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn stamp_version(mut response: Response) -> Response {
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<DiskService>,
}

fn requester(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError(Error::ApiValidation(format!("missing {} header", USER_HEADER))))
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a disk
async fn create_disk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDiskRequest>,
) -> ApiResult<impl IntoResponse> {
    let request = body.into_request(requester(&headers)?)?;
    info!(
        "Creating disk {:?} in {} for {}",
        request.name, request.scope, request.requester
    );

    let disk = state.service.create_disk(request).await?;
    Ok((StatusCode::CREATED, Json(DiskResponse::from(&disk))))
}

/// List the disks of a scope
async fn list_disks(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<impl IntoResponse> {
    let scope = query.scope()?.ok_or_else(|| {
        ApiError(Error::ApiValidation(
            "org_name and project_name are required".into(),
        ))
    })?;

    let disks = state.service.list_disks(&scope).await?;
    let body: Vec<DiskResponse> = disks.iter().map(DiskResponse::from).collect();
    Ok(Json(body))
}

/// Get a disk by id, or by id or name within a scope
async fn get_disk(
    State(state): State<AppState>,
    Path(id_or_name): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<impl IntoResponse> {
    let disk = match query.scope()? {
        Some(scope) => state.service.get_disk(&scope, &id_or_name).await?,
        None => state.service.get_disk_by_id(&id_or_name).await?,
    };
    Ok(Json(DiskResponse::from(&disk)))
}

/// Delete a disk by id, or by id or name within a scope
async fn delete_disk(
    State(state): State<AppState>,
    Path(id_or_name): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> ApiResult<impl IntoResponse> {
    match query.scope()? {
        Some(scope) => state.service.delete_disk(&scope, &id_or_name).await?,
        None => state.service.delete_disk_by_id(&id_or_name).await?,
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Liveness probe for load balancers
async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::gateway::InMemoryGateway;
    use crate::controlplane::metrics::DiskMetrics;
    use crate::controlplane::naming::NamingConfig;
    use crate::controlplane::quota::QuotaLimits;
    use crate::controlplane::retry::ConflictRetry;
    use crate::controlplane::service::DiskServiceConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const GI: u64 = 1 << 30;

    fn router(limit: u64) -> (Router, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::default());
        let service = DiskService::new(
            gateway.clone(),
            DiskServiceConfig {
                default_storage_class: None,
                naming: NamingConfig {
                    pending_interval: Duration::ZERO,
                    ..Default::default()
                },
                quota: QuotaLimits::uniform(limit),
                retry: ConflictRetry::immediate(3),
            },
            Arc::new(DiskMetrics::new().unwrap()),
        );
        (RestRouter::new(service).build(), gateway)
    }

    fn create(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/disk")
            .header("content-type", "application/json")
            .header(USER_HEADER, "alice")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn logs() -> serde_json::Value {
        serde_json::json!({
            "org_name": "acme",
            "project_name": "ml",
            "name": "logs",
            "capacity": "10Gi",
            "life_span": 3600,
        })
    }

    #[tokio::test]
    async fn test_create_and_get_disk() {
        let (app, _) = router(100 * GI);

        let response = app.clone().oneshot(create(logs())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key(VERSION_HEADER));
        let created = json(response).await;
        assert_eq!(created["name"], "logs");
        assert_eq!(created["status"], "Pending");
        assert_eq!(created["owner"], "alice");
        assert_eq!(created["requested_capacity_bytes"], 10 * GI);
        assert_eq!(created["life_span"], 3600.0);

        let id = created["id"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(get(&format!("/api/v1/disk/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["id"], id.as_str());

        let response = app
            .oneshot(get("/api/v1/disk/logs?org_name=acme&project_name=ml"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_list_disks() {
        let (app, _) = router(100 * GI);
        app.clone().oneshot(create(logs())).await.unwrap();

        let response = app
            .clone()
            .oneshot(get("/api/v1/disk?org_name=acme&project_name=ml"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await.as_array().unwrap().len(), 1);

        let response = app.oneshot(get("/api/v1/disk?org_name=acme")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (app, gateway) = router(15 * GI);
        app.clone().oneshot(create(logs())).await.unwrap();

        // same name, different capacity
        let mut taken = logs();
        taken["capacity"] = "5Gi".into();
        let response = app.clone().oneshot(create(taken)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json(response).await["error"], "name_taken");

        let mut over = logs();
        over["name"] = "data".into();
        let response = app.clone().oneshot(create(over)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json(response).await;
        assert_eq!(body["error"], "over_limit");
        assert_eq!(body["details"]["used"], 10 * GI);
        assert_eq!(body["details"]["limit"], 15 * GI);

        let mut bad = logs();
        bad["capacity"] = "lots".into();
        let response = app.clone().oneshot(create(bad)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut forever = logs();
        forever["name"] = "forever".into();
        forever["capacity"] = "1Gi".into();
        forever["life_span"] = serde_json::json!(1e15_f64);
        let response = app.clone().oneshot(create(forever)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(gateway.claim_count(), 1);

        let response = app.clone().oneshot(get("/api/v1/disk/disk-nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        gateway.set_unavailable(true);
        let response = app
            .oneshot(get("/api/v1/disk?org_name=acme&project_name=ml"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_user_header() {
        let (app, _) = router(100 * GI);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/disk")
            .header("content-type", "application/json")
            .body(Body::from(logs().to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_disk() {
        let (app, gateway) = router(100 * GI);
        app.clone().oneshot(create(logs())).await.unwrap();

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/disk/logs?org_name=acme&project_name=ml")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(gateway.claim_count(), 0);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/disk/logs?org_name=acme&project_name=ml")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_under_persistent_conflicts_is_unavailable() {
        let (app, gateway) = router(100 * GI);
        app.clone().oneshot(create(logs())).await.unwrap();

        gateway.inject_conflicts(10);
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/disk/logs?org_name=acme&project_name=ml")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(response).await["error"], "unavailable");
        assert_eq!(gateway.claim_count(), 1);
    }

    #[tokio::test]
    async fn test_ping() {
        let (app, _) = router(GI);
        let response = app.oneshot(get("/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_scope_query() {
        let query = ScopeQuery {
            org_name: Some("acme".into()),
            project_name: None,
        };
        assert!(query.scope().is_err());
        assert_eq!(ScopeQuery::default().scope().unwrap(), None);
    }
}
