//! HTTP boundary: the wake endpoint and traffic observation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use kubenap_common::ServiceIdentity;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use crate::activity::ActivityLedger;
use crate::controller::resume::{ResumeEngine, ResumeOutcome};
use crate::kubernetes::gateway::GatewayError;

const DEFAULT_NAMESPACE: &str = "default";

/// What the boundary knows about an inbound wake request.
#[derive(Debug, Clone, Default)]
pub struct WakeRequest {
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
}

/// Proxy-specific hooks around the wake endpoint.
#[async_trait]
pub trait WakeInterceptor: Send + Sync {
    fn should_wake(&self, request: &WakeRequest) -> bool;

    fn target(&self, request: &WakeRequest) -> Option<ServiceIdentity>;

    /// Location the caller should retry once the workload is ready.
    fn original_location(&self, request: &WakeRequest) -> Option<String>;

    async fn on_resume_completed(&self, id: &ServiceIdentity, outcome: ResumeOutcome) {
        info!(target: "wake", "Resume of {} completed: {:?}", id, outcome);
    }
}

/// Reads `namespace`, `name` and `original` from the query string and
/// ignores kubelet probes.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryInterceptor;

#[async_trait]
impl WakeInterceptor for QueryInterceptor {
    fn should_wake(&self, request: &WakeRequest) -> bool {
        let is_probe = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|ua| ua.to_str().ok())
            .is_some_and(|ua| ua.starts_with("kube-probe/"));
        !is_probe
    }

    fn target(&self, request: &WakeRequest) -> Option<ServiceIdentity> {
        let name = request.query.get("name").filter(|n| !n.is_empty())?;
        let namespace = request
            .query
            .get("namespace")
            .filter(|ns| !ns.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_NAMESPACE);
        Some(ServiceIdentity::new(namespace, name.as_str()))
    }

    fn original_location(&self, request: &WakeRequest) -> Option<String> {
        request.query.get("original").filter(|o| !o.is_empty()).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<ActivityLedger>,
    pub resume: Arc<ResumeEngine>,
    pub interceptor: Arc<dyn WakeInterceptor>,
    pub wake_timeout: Duration,
}

async fn wake(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = WakeRequest { query, headers };

    let Some(original) = state.interceptor.original_location(&request) else {
        return (StatusCode::BAD_REQUEST, "missing original path").into_response();
    };
    let Some(location) = redirect_location(&original) else {
        return (StatusCode::BAD_REQUEST, "invalid original path").into_response();
    };
    if !state.interceptor.should_wake(&request) {
        return (StatusCode::BAD_REQUEST, "request does not trigger a wake").into_response();
    }
    let Some(id) = state.interceptor.target(&request) else {
        return (StatusCode::BAD_REQUEST, "missing service name").into_response();
    };

    info!(target: "wake", "Received request to wake {} for {}", id, original);
    // A request arrived, so the next tick must not see the workload as idle.
    state.ledger.touch(&id);

    match state.resume.resume_and_wait(&id, state.wake_timeout).await {
        Ok(outcome) => {
            state.interceptor.on_resume_completed(&id, outcome).await;
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
        }
        Err(GatewayError::Timeout(after)) => {
            warn!(target: "wake", "{} not ready after {:?}", id, after);
            (
                StatusCode::GATEWAY_TIMEOUT,
                format!("{} did not become ready in time", id),
            )
                .into_response()
        }
        Err(e) => {
            warn!(target: "wake", "Failed to wake {}: {}", id, e);
            (StatusCode::SERVICE_UNAVAILABLE, format!("failed to wake {}: {}", id, e)).into_response()
        }
    }
}

/// Only paths on the proxied host are redirected to, and only when they
/// form a valid header value.
fn redirect_location(original: &str) -> Option<HeaderValue> {
    let path_only = original.starts_with('/') && !original.starts_with("//") && !original.starts_with("/\\");
    if !path_only {
        return None;
    }
    HeaderValue::from_str(original).ok()
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    #[serde(default)]
    namespace: Option<String>,
    name: String,
    /// When the request was served (RFC 3339); defaults to now.
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

async fn record_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> StatusCode {
    let namespace = query.namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let now = Utc::now();
    // A timestamp from the future would pin the workload awake.
    let observed = query.at.map_or(now, |at| at.min(now));
    state.ledger.update(&ServiceIdentity::new(namespace, query.name), observed);
    StatusCode::NO_CONTENT
}

async fn list_activity(State(state): State<AppState>) -> Json<BTreeMap<String, DateTime<Utc>>> {
    Json(
        state
            .ledger
            .snapshot()
            .into_iter()
            .map(|(id, at)| (id.to_string(), at))
            .collect(),
    )
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "tracked": state.ledger.len(),
        "resuming": state.resume.in_flight(),
    }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/wake", get(wake).post(wake))
        .route("/activity", get(list_activity).post(record_activity))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serves until the shutdown flag flips, then drains open requests.
pub async fn serve(port: u16, state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::AnnotationPolicyLoader;
    use crate::testing::FakeGateway;
    use axum::body::Body;
    use axum::http::Request;
    use kubenap_common::WorkloadSnapshot;
    use tower::ServiceExt;

    fn id() -> ServiceIdentity {
        ServiceIdentity::new("shop", "api")
    }

    fn setup(gateway: Arc<FakeGateway>) -> (Router, AppState) {
        let state = AppState {
            ledger: Arc::new(ActivityLedger::new()),
            resume: Arc::new(ResumeEngine::new(gateway, Arc::new(AnnotationPolicyLoader))),
            interceptor: Arc::new(QueryInterceptor),
            wake_timeout: Duration::from_secs(30),
        };
        (create_router(state.clone()), state)
    }

    fn suspended_gateway(replicas: i32) -> Arc<FakeGateway> {
        let gateway = Arc::new(FakeGateway::new());
        let mut snapshot = WorkloadSnapshot::new(id(), 0, 0);
        snapshot.original_replicas = Some(replicas);
        gateway.insert(snapshot);
        gateway
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn wake_resumes_and_redirects_to_original() {
        let gateway = suspended_gateway(3);
        let (app, state) = setup(gateway.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?namespace=shop&name=api&original=/api/v1/items")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/api/v1/items");
        assert_eq!(gateway.snapshot(&id()).replicas, 3);
        assert!(state.ledger.get(&id()).is_some());
    }

    #[tokio::test]
    async fn wake_without_original_is_rejected() {
        let (app, _) = setup(suspended_gateway(1));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?namespace=shop&name=api")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "missing original path");
    }

    #[tokio::test]
    async fn wake_with_header_breaking_original_is_rejected_before_resuming() {
        let gateway = suspended_gateway(3);
        let (app, state) = setup(gateway.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?namespace=shop&name=api&original=/x%0d%0aSet-Cookie:%20a=b")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "invalid original path");
        assert!(gateway.writes().is_empty());
        assert_eq!(gateway.snapshot(&id()).replicas, 0);
        assert!(state.ledger.get(&id()).is_none());
    }

    #[tokio::test]
    async fn wake_only_redirects_to_local_paths() {
        let gateway = suspended_gateway(3);
        let (app, _) = setup(gateway.clone());
        for original in ["https://evil.example/", "//evil.example/", "api/v1"] {
            let uri = format!(
                "/wake?namespace=shop&name=api&original={}",
                original.replace(':', "%3A").replace('/', "%2F")
            );
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", original);
        }
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn wake_without_name_is_rejected() {
        let gateway = suspended_gateway(1);
        let (app, _) = setup(gateway.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?original=/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn kubelet_probes_do_not_wake() {
        let gateway = suspended_gateway(1);
        let (app, _) = setup(gateway.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?namespace=shop&name=api&original=/healthz")
                    .header(header::USER_AGENT, "kube-probe/1.28")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_timeout_is_a_gateway_timeout() {
        let gateway = suspended_gateway(3);
        gateway.set_ready_delay(None);
        let (app, _) = setup(gateway);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?namespace=shop&name=api&original=/api/v1/items")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn wake_of_unknown_workload_is_unavailable() {
        let (app, _) = setup(Arc::new(FakeGateway::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/wake?namespace=shop&name=ghost&original=/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn activity_push_is_visible_in_listing() {
        let (app, state) = setup(Arc::new(FakeGateway::new()));
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activity?namespace=shop&name=api")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.ledger.get(&id()).is_some());

        let response = app
            .oneshot(Request::builder().uri("/activity").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listing: BTreeMap<String, DateTime<Utc>> =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert!(listing.contains_key("shop/api"));
    }

    #[tokio::test]
    async fn activity_push_keeps_the_reported_time() {
        let (app, state) = setup(Arc::new(FakeGateway::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activity?namespace=shop&name=api&at=2024-05-01T12:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let expected: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        assert_eq!(state.ledger.get(&id()), Some(expected));
    }

    #[tokio::test]
    async fn activity_push_clamps_future_times_and_rejects_garbage() {
        let (app, state) = setup(Arc::new(FakeGateway::new()));
        let before = Utc::now();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activity?namespace=shop&name=api&at=2999-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let recorded = state.ledger.get(&id()).unwrap();
        assert!(recorded >= before && recorded <= Utc::now());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activity?namespace=shop&name=web&at=yesterday")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.ledger.len(), 1);
    }

    #[tokio::test]
    async fn healthz_reports_tracked_services() {
        let (app, state) = setup(Arc::new(FakeGateway::new()));
        state.ledger.touch(&id());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["tracked"], 1);
        assert_eq!(health["resuming"], 0);
    }

    #[tokio::test]
    async fn activity_push_requires_a_name() {
        let (app, state) = setup(Arc::new(FakeGateway::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activity?namespace=shop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.ledger.is_empty());
    }
}
