//! REST API handlers

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use crane_core::{
    ApiConfig, Cargo, CargoId, CargoRequest, ClusterEvent, CraneError, EventEnvelope,
    ExpiryPolicy, Lease, LeaseId, MiniCluster, MiniClusterId, MiniClusterRequest,
    MiniClusterStatus, NodeId, NodeSpec, NodeView, ResizeOutcome, ResourceClaim, TenantId,
};
use crane_scheduler::{ClusterStatus, Scheduler, TenantView};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Header carrying the verified tenant identity, set by the upstream gateway
pub const TENANT_HEADER: &str = "x-crane-tenant";

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Map a scheduling error onto an HTTP status
fn api_error(err: CraneError) -> (StatusCode, String) {
    let status = match &err {
        CraneError::InsufficientCapacity(_)
        | CraneError::MiniClusterNotActive(_)
        | CraneError::LeaseNotActive(_)
        | CraneError::NodeBusy(_)
        | CraneError::NodeExists(_)
        | CraneError::InvalidTransition { .. } => StatusCode::CONFLICT,
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        CraneError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        CraneError::LaunchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CraneError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CraneError::SubstrateUntracked(_) | CraneError::Runtime(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Tenant identity taken from [`TENANT_HEADER`]
pub struct Tenant(pub TenantId);

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts.headers.get(TENANT_HEADER).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                format!("missing {} header", TENANT_HEADER),
            )
        })?;
        let raw = raw.to_str().map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                format!("{} header is not valid text", TENANT_HEADER),
            )
        })?;
        TenantId::parse(raw).map(Tenant).map_err(api_error)
    }
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>, config: &ApiConfig) -> Router {
    let state = Arc::new(AppState { scheduler });

    let router = Router::new()
        .route("/api/v1/mini_clusters", post(reserve_mini_cluster))
        .route("/api/v1/mini_clusters", get(list_mini_clusters))
        .route("/api/v1/mini_clusters/:id", get(get_mini_cluster))
        .route("/api/v1/mini_clusters/:id", delete(release_mini_cluster))
        .route("/api/v1/mini_clusters/:id/resize", post(resize_mini_cluster))
        .route("/api/v1/mini_clusters/:id/cargoes", post(submit_cargo))
        .route("/api/v1/mini_clusters/:id/cargoes", get(list_mini_cluster_cargoes))
        .route("/api/v1/cargoes", get(list_cargoes))
        .route("/api/v1/cargoes/:id", get(get_cargo))
        .route("/api/v1/cargoes/:id", delete(kill_cargo))
        .route("/api/v1/cargoes/:id/reap", post(reap_cargo))
        .route("/api/v1/leases/:id/renew", post(renew_lease))
        .route("/api/v1/tenant", get(get_tenant_view))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes", post(register_node))
        .route("/api/v1/nodes/:id", delete(deregister_node))
        .route("/api/v1/events", get(stream_events))
        .route("/api/v1/status", get(get_status))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        router.layer(cors_layer(&config.cors_origins))
    } else {
        router
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

/// Request to reserve a mini-cluster
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    /// Mini-cluster name
    #[serde(default)]
    pub name: Option<String>,
    /// Number of units
    pub size: u32,
    /// Capacity of each unit
    pub per_unit: ResourceClaim,
    /// Lease expiry for every unit
    #[serde(default)]
    pub expiry: ExpiryPolicy,
    /// Smallest size the mini-cluster may run at
    #[serde(default)]
    pub min_size: Option<u32>,
    #[serde(default)]
    pub max_size: Option<u32>,
}

/// Reserve a new mini-cluster
async fn reserve_mini_cluster(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Json(req): Json<ReserveRequest>,
) -> ApiResult<(StatusCode, Json<MiniCluster>)> {
    info!(
        tenant = %tenant,
        name = req.name.as_deref().unwrap_or("-"),
        size = req.size,
        per_unit = %req.per_unit.resources,
        "Reserving mini-cluster"
    );

    let mut request = MiniClusterRequest::new(req.size, req.per_unit)
        .with_expiry(req.expiry)
        .with_bounds(req.min_size, req.max_size);
    if let Some(name) = req.name {
        request = request.named(name);
    }

    let mc = state
        .scheduler
        .reserve_mini_cluster(&tenant, request)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(mc)))
}

/// List the tenant's mini-clusters
async fn list_mini_clusters(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> ApiResult<Json<Vec<MiniCluster>>> {
    Ok(Json(state.scheduler.list_mini_clusters(&tenant).await))
}

/// Get a mini-cluster with its leases and usage
async fn get_mini_cluster(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<MiniClusterId>,
) -> ApiResult<Json<MiniClusterStatus>> {
    state
        .scheduler
        .mini_cluster_status(&tenant, &id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Release a mini-cluster and everything running in it
async fn release_mini_cluster(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<MiniClusterId>,
) -> ApiResult<StatusCode> {
    info!(tenant = %tenant, mini_cluster_id = %id, "Releasing mini-cluster");

    state
        .scheduler
        .release_mini_cluster(&tenant, &id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to resize a mini-cluster
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub size: u32,
}

/// Grow or shrink a mini-cluster
async fn resize_mini_cluster(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<MiniClusterId>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<Json<ResizeOutcome>> {
    info!(tenant = %tenant, mini_cluster_id = %id, size = req.size, "Resizing mini-cluster");

    state
        .scheduler
        .resize_mini_cluster(&tenant, &id, req.size)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Submit a cargo into a mini-cluster
async fn submit_cargo(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<MiniClusterId>,
    Json(req): Json<CargoRequest>,
) -> ApiResult<(StatusCode, Json<Cargo>)> {
    info!(
        tenant = %tenant,
        mini_cluster_id = %id,
        claim = %req.claim,
        "Submitting cargo"
    );

    let cargo = state
        .scheduler
        .submit_cargo(&tenant, &id, req)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(cargo)))
}

async fn list_mini_cluster_cargoes(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<MiniClusterId>,
) -> ApiResult<Json<Vec<Cargo>>> {
    state
        .scheduler
        .list_cargoes(&tenant, Some(&id))
        .await
        .map(Json)
        .map_err(api_error)
}

/// List every cargo of the tenant
async fn list_cargoes(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> ApiResult<Json<Vec<Cargo>>> {
    state
        .scheduler
        .list_cargoes(&tenant, None)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_cargo(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<CargoId>,
) -> ApiResult<Json<Cargo>> {
    state
        .scheduler
        .cargo_status(&tenant, &id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Kill a cargo
async fn kill_cargo(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<CargoId>,
) -> ApiResult<Json<Cargo>> {
    info!(tenant = %tenant, cargo_id = %id, "Killing cargo");

    state
        .scheduler
        .kill_cargo(&tenant, &id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Remove a finished cargo's record
async fn reap_cargo(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<CargoId>,
) -> ApiResult<Json<Cargo>> {
    state
        .scheduler
        .reap_cargo(&tenant, &id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Request to renew a lease
#[derive(Debug, Default, Deserialize)]
pub struct RenewRequest {
    /// New deadline; omitted means a fresh heartbeat window
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Path(id): Path<LeaseId>,
    Json(req): Json<RenewRequest>,
) -> ApiResult<Json<Lease>> {
    state
        .scheduler
        .renew_lease(&tenant, &id, req.until)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Everything the tenant owns
async fn get_tenant_view(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
) -> ApiResult<Json<TenantView>> {
    Ok(Json(state.scheduler.tenant_view(&tenant).await))
}

/// Cluster resource view
async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<NodeView>>> {
    Ok(Json(state.scheduler.nodes().await))
}

/// Register a node
async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<NodeSpec>,
) -> ApiResult<(StatusCode, Json<NodeView>)> {
    let view = state
        .scheduler
        .register_node(spec)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Deregister an idle node
async fn deregister_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .scheduler
        .deregister_node(&NodeId::new(id))
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Event stream filter
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    /// Only events of this kind
    #[serde(default)]
    pub kind: Option<String>,
}

/// Whether a tenant may see an event. Node events are cluster-wide.
fn visible_to(event: &ClusterEvent, tenant: &TenantId) -> bool {
    match event.owner() {
        Some(owner) => owner == tenant,
        None => matches!(
            event,
            ClusterEvent::NodeRegistered { .. }
                | ClusterEvent::NodeDeregistered { .. }
                | ClusterEvent::NodeHealthChanged { .. }
        ),
    }
}

/// Server-sent stream of the tenant's state transitions
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.scheduler.subscribe();

    let events = stream::unfold(receiver, move |mut receiver| {
        let tenant = tenant.clone();
        let kind = query.kind.clone();
        async move {
            loop {
                let envelope: EventEnvelope = match receiver.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(tenant = %tenant, skipped = skipped, "Event subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                };
                if !visible_to(&envelope.event, &tenant) {
                    continue;
                }
                if kind.as_deref().is_some_and(|k| k != envelope.event.kind()) {
                    continue;
                }
                let event = Event::default()
                    .event(envelope.event.kind())
                    .id(envelope.seq.to_string());
                match event.json_data(&envelope) {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(e) => warn!(seq = envelope.seq, error = %e, "Failed to encode event"),
                }
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub cluster: ClusterStatus,
}

async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        cluster: state.scheduler.status().await,
    }))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use crane_core::{ResourceVector, SchedulerConfig};
    use crane_runtime::InMemorySubstrate;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn setup() -> (Arc<Scheduler>, Router) {
        let scheduler = Arc::new(Scheduler::new(
            &SchedulerConfig::default(),
            Arc::new(InMemorySubstrate::new()),
            64,
        ));
        scheduler
            .register_node(NodeSpec::new("n1", ResourceVector::new(2, 16, 1 << 30)))
            .await
            .unwrap();
        let router = create_router(scheduler.clone(), &ApiConfig::default());
        (scheduler, router)
    }

    async fn router() -> Router {
        setup().await.1
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn reserve_body(size: u32, gpus: u32) -> Value {
        json!({
            "name": "training",
            "size": size,
            "per_unit": { "resources": { "gpu": gpus, "cpu": 0, "memory": 0 } }
        })
    }

    fn cargo_body(gpus: u32) -> Value {
        json!({
            "claim": { "gpu": gpus, "cpu": 0, "memory": 0 },
            "launch": { "command": ["python", "train.py"] }
        })
    }

    #[tokio::test]
    async fn test_reserve_submit_and_status() {
        let router = router().await;

        let (status, mc) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(reserve_body(1, 2))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(mc["name"], "training");
        let id = mc["id"].as_str().unwrap().to_string();

        let uri = format!("/api/v1/mini_clusters/{}/cargoes", id);
        let (status, cargo) = call(&router, "POST", &uri, Some("alice"), Some(cargo_body(1))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(cargo["history"]["current"], "running");

        call(&router, "POST", &uri, Some("alice"), Some(cargo_body(1))).await;
        let (status, _) = call(&router, "POST", &uri, Some("alice"), Some(cargo_body(1))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, view) = call(&router, "GET", &format!("/api/v1/mini_clusters/{}", id), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["in_use"]["gpu"], 2);
        assert_eq!(view["cargo_count"], 2);
    }

    #[tokio::test]
    async fn test_tenant_header_required() {
        let router = router().await;
        let (status, _) = call(&router, "GET", "/api/v1/mini_clusters", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&router, "GET", "/api/v1/mini_clusters", Some("  "), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cross_tenant_request_forbidden() {
        let router = router().await;
        let (_, mc) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(reserve_body(1, 1))).await;
        let uri = format!("/api/v1/mini_clusters/{}", mc["id"].as_str().unwrap());

        let (status, _) = call(&router, "GET", &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&router, "DELETE", &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, list) = call(&router, "GET", "/api/v1/mini_clusters", Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 0);

        let (status, _) = call(&router, "DELETE", &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let router = router().await;
        let missing = format!("/api/v1/cargoes/{}", uuid::Uuid::new_v4());
        let (status, _) = call(&router, "GET", &missing, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(reserve_body(0, 1))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(reserve_body(2, 2))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        assert_eq!(
            api_error(CraneError::LaunchTimeout("x".into())).0,
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_node_registration() {
        let router = router().await;
        let body = json!({ "id": "n2", "capacity": { "gpu": 8, "cpu": 64, "memory": 0 }, "gpu_type": "a100" });
        let (status, view) = call(&router, "POST", "/api/v1/nodes", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(view["available"]["gpu"], 8);

        let (status, _) = call(&router, "POST", "/api/v1/nodes", None, Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, nodes) = call(&router, "GET", "/api/v1/nodes", None, None).await;
        assert_eq!(nodes.as_array().unwrap().len(), 2);

        let (status, _) = call(&router, "DELETE", "/api/v1/nodes/n2", None, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&router, "GET", "/api/v1/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cluster"]["nodes"], 1);
    }

    #[test]
    fn test_event_visibility() {
        let alice = TenantId::from("alice");
        let node_event = ClusterEvent::NodeRegistered { node: NodeId::from("n1") };
        assert!(visible_to(&node_event, &alice));

        let lease_event = ClusterEvent::LeaseActivated {
            lease_id: uuid::Uuid::new_v4(),
            owner: TenantId::from("bob"),
        };
        assert!(!visible_to(&lease_event, &alice));

        let anonymous = ClusterEvent::Reconciled {
            reason: crane_core::ReconcileReason::RecoveryRollback,
            owner: None,
            target: "lease/x".to_string(),
            detail: "gone".to_string(),
        };
        assert!(!visible_to(&anonymous, &alice));

        let granted = ClusterEvent::LeaseGranted {
            lease_id: uuid::Uuid::new_v4(),
            owner: TenantId::from("bob"),
            nodes: vec![],
        };
        assert!(!visible_to(&granted, &alice));
    }

    #[tokio::test]
    async fn test_owner_sees_lease_lifecycle_events() {
        let (scheduler, router) = setup().await;
        let mut events = scheduler.subscribe();

        let (_, mc) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(reserve_body(1, 1))).await;
        let id = mc["id"].as_str().unwrap().to_string();
        let (status, _) = call(&router, "DELETE", &format!("/api/v1/mini_clusters/{}", id), Some("alice"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let alice = TenantId::from("alice");
        let bob = TenantId::from("bob");
        let mut seen = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            assert!(!visible_to(&envelope.event, &bob));
            if visible_to(&envelope.event, &alice) {
                seen.push(envelope.event.kind());
            }
        }
        for kind in ["lease_granted", "lease_activated", "lease_released", "mini_cluster_transition"] {
            assert!(seen.contains(&kind), "alice missed {} in {:?}", kind, seen);
        }
    }

    #[tokio::test]
    async fn test_reserve_rejects_inconsistent_bounds() {
        let router = router().await;
        let mut body = reserve_body(2, 1);
        body["min_size"] = json!(3);
        let (status, _) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut body = reserve_body(2, 1);
        body["min_size"] = json!(1);
        body["max_size"] = json!(2);
        let (status, mc) = call(&router, "POST", "/api/v1/mini_clusters", Some("alice"), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(mc["max_size"], 2);
    }
}
