//! axum router for the agent.
//!
//! - `POST /rpc/v1/apply_instance_cpu_mapping`: conductor-driven apply
//! - `POST /v1/notifications`: lifecycle notification intake (queued)
//! - `GET /healthz`

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use pinwheel_rpc::server::{accept, reply};
use pinwheel_rpc::{ApplyMappingReply, ApplyMappingRequest, FaultKind, RpcFault, RpcRequest, TOKEN_HEADER, routes};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use crate::dispatcher::Notification;
use crate::executor::PinExecutor;

pub const NOTIFICATIONS: &str = "/v1/notifications";

#[derive(Clone)]
pub struct AgentState {
    pub executor: Arc<PinExecutor>,
    pub notifications: mpsc::Sender<Notification>,
    pub token: Option<String>,
}

pub fn build_router(state: AgentState) -> Router {
    Router::new()
        .route(routes::APPLY_MAPPING, post(apply_mapping))
        .route(NOTIFICATIONS, post(notify))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn apply_mapping(
    State(state): State<AgentState>,
    headers: HeaderMap,
    body: Result<Json<RpcRequest<ApplyMappingRequest>>, JsonRejection>,
) -> Response {
    let req = match accept(&headers, body, state.token.as_deref()) {
        Ok(req) => req,
        Err(fault) => return reply::<()>(Err(fault)),
    };
    let mapping = req.payload.mapping;
    debug!(
        request_id = %req.context.request_id,
        instance_uuid = %mapping.instance_uuid,
        spec = %mapping.cpu_mappings,
        "apply requested"
    );

    // Spawned so a conductor timeout does not abort the pin loop midway.
    let executor = state.executor.clone();
    let task = tokio::spawn(async move {
        executor
            .apply(&mapping.instance_uuid, &mapping.cpu_mappings)
            .await
    });
    let result = match task.await {
        Ok(Ok(outcome)) => Ok(ApplyMappingReply {
            applied: outcome.applied(),
            vcpu_results: outcome.vcpu_results,
        }),
        Ok(Err(e)) => Err(e.to_fault()),
        Err(e) => {
            error!(error = %e, "apply task panicked");
            Err(RpcFault::new(FaultKind::Internal, "internal error"))
        }
    };
    reply(result)
}

async fn notify(
    State(state): State<AgentState>,
    headers: HeaderMap,
    body: Result<Json<Notification>, JsonRejection>,
) -> Response {
    if let Some(expected) = state.token.as_deref() {
        if headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) != Some(expected) {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
        }
    }
    let notification = match body {
        Ok(Json(notification)) => notification,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": rejection.body_text() }))).into_response();
        }
    };
    match state.notifications.try_send(notification) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(TrySendError::Full(n)) => {
            warn!(instance_uuid = %n.instance_uuid, "notification queue full, dropping");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "notification queue full" }))).into_response()
        }
        Err(TrySendError::Closed(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "dispatcher stopped" }))).into_response()
        }
    }
}

async fn healthz(State(state): State<AgentState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "maxcpu": state.executor.maxcpu(),
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use pinwheel_core::RequestContext;
    use pinwheel_hypervisor::SimulatedHypervisor;
    use pinwheel_state::{MappingRecord, MappingStatus};
    use tower::ServiceExt;

    use super::*;

    async fn app(
        queue: usize,
        token: Option<&str>,
    ) -> (Router, mpsc::Receiver<Notification>, Arc<SimulatedHypervisor>) {
        let hv = Arc::new(SimulatedHypervisor::new("compute-1", 1, 8).with_domain("vm-1", 1, 4));
        let executor = Arc::new(PinExecutor::new(hv.clone()).await.unwrap());
        let (tx, rx) = mpsc::channel(queue);
        let router = build_router(AgentState {
            executor,
            notifications: tx,
            token: token.map(str::to_string),
        });
        (router, rx, hv)
    }

    fn mapping(uuid: &str, spec: &str) -> MappingRecord {
        MappingRecord {
            id: 1,
            instance_uuid: uuid.into(),
            project_id: Some("p".into()),
            user_id: Some("u".into()),
            host: Some("compute-1".into()),
            cpu_mappings: spec.into(),
            status: MappingStatus::Pending,
            status_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn apply_request(uuid: &str, spec: &str, token: Option<&str>) -> Request<Body> {
        let envelope = RpcRequest::new(
            RequestContext::service("conductor"),
            ApplyMappingRequest {
                mapping: mapping(uuid, spec),
            },
        );
        let mut builder = Request::builder()
            .method("POST")
            .uri(routes::APPLY_MAPPING)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder
            .body(Body::from(serde_json::to_vec(&envelope).unwrap()))
            .unwrap()
    }

    fn notification_request(uuid: &str) -> Request<Body> {
        let n = Notification {
            event_type: "instance.create.end".into(),
            publisher_id: None,
            instance_uuid: uuid.into(),
            host: Some("compute-1".into()),
            metadata: HashMap::from([("vcpu-pinning".to_string(), "0".to_string())]),
        };
        Request::builder()
            .method("POST")
            .uri(NOTIFICATIONS)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&n).unwrap()))
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn apply_pins_domain() {
        let (app, _rx, hv) = app(4, None).await;
        let response = app.oneshot(apply_request("vm-1", "2-4", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["ok"]["applied"], true);
        assert_eq!(body["ok"]["vcpu_results"].as_array().unwrap().len(), 4);
        assert_eq!(hv.pins("vm-1").unwrap()[3].to_string(), "FFTTTFFF");
    }

    #[tokio::test]
    async fn apply_reports_partial_failure() {
        let (app, _rx, hv) = app(4, None).await;
        hv.fail_pin("vm-1", 2);
        let body = json(app.oneshot(apply_request("vm-1", "0-7", None)).await.unwrap()).await;
        assert_eq!(body["ok"]["applied"], false);
        assert_eq!(body["ok"]["vcpu_results"], serde_json::json!([true, true, false, true]));
    }

    #[tokio::test]
    async fn apply_faults() {
        let (app, _rx, _) = app(4, None).await;

        let response = app.clone().oneshot(apply_request("vm-1", "12", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["spec_error"]["reason"], "out_of_range");

        let response = app.oneshot(apply_request("ghost", "0", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"]["kind"], "instance_not_found");
    }

    #[tokio::test]
    async fn apply_requires_token() {
        let (app, _rx, hv) = app(4, Some("s3cret")).await;
        let response = app.clone().oneshot(apply_request("vm-1", "0", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(hv.pin_log().is_empty());

        let response = app.oneshot(apply_request("vm-1", "0", Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn notifications_are_queued() {
        let (app, mut rx, _) = app(1, None).await;

        let response = app.clone().oneshot(notification_request("vm-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app.oneshot(notification_request("vm-2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(rx.recv().await.unwrap().instance_uuid, "vm-1");
    }

    #[tokio::test]
    async fn undecodable_apply_gets_fault_envelope() {
        let (app, _rx, hv) = app(4, Some("s3cret")).await;
        let bad = |token: Option<&str>| {
            let mut builder = Request::builder()
                .method("POST")
                .uri(routes::APPLY_MAPPING)
                .header("content-type", "application/json");
            if let Some(token) = token {
                builder = builder.header(TOKEN_HEADER, token);
            }
            builder
                .body(Body::from(r#"{"version":"1.0","payload":{"mapping":7}}"#))
                .unwrap()
        };

        // No token: refused before the body is looked at.
        let response = app.clone().oneshot(bad(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["error"]["kind"], "unauthorized_request");

        let response = app.oneshot(bad(Some("s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["kind"], "bad_request");
        assert!(hv.pin_log().is_empty());
    }

    #[tokio::test]
    async fn undecodable_notification_is_bad_request() {
        let (app, _rx, _) = app(1, None).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(NOTIFICATIONS)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"event_type":"instance.create.end"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_reports_maxcpu() {
        let (app, _rx, _) = app(1, None).await;
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json(response).await["maxcpu"], 8);
    }
}
