//! axum router for the conductor.
//!
//! Mutating RPC handlers run the service call on a spawned task, so a caller
//! that hangs up mid-apply cannot leave a mapping stuck in `PENDING`.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use pinwheel_rpc::server::{accept, reply};
use pinwheel_rpc::{
    CreateMappingRequest, FaultKind, ReapplyMappingRequest, ReconcileHostReply, ReconcileHostRequest,
    ReconcileInstanceReply, ReconcileInstanceRequest, ReconcileInstancesRequest, RpcFault, RpcRequest,
    TOKEN_HEADER, routes,
};
use pinwheel_state::Upsert;
use tracing::error;

use crate::error::ConductorError;
use crate::service::MappingService;

/// Shared state for conductor handlers.
#[derive(Clone)]
pub struct ConductorState {
    pub service: Arc<MappingService>,
    pub token: Option<String>,
}

pub fn build_router(service: Arc<MappingService>, token: Option<String>) -> Router {
    let state = ConductorState { service, token };

    let rpc = Router::new()
        .route(routes::CREATE_MAPPING, post(create_mapping))
        .route(routes::RECONCILE_INSTANCE, post(reconcile_instance))
        .route(routes::RECONCILE_HOST, post(reconcile_host))
        .route(routes::RECONCILE_INSTANCES, post(reconcile_instances))
        .route(routes::REAPPLY_MAPPING, post(reapply_mapping));

    let inspect = Router::new()
        .route("/v1/instance_cpu_mappings", get(list_mappings))
        .route(
            "/v1/instance_cpu_mappings/{uuid}",
            get(get_mapping).delete(delete_mapping),
        )
        .route("/v1/hosts", get(list_hosts))
        .route("/v1/instances", get(list_instances));

    rpc.merge(inspect).with_state(state)
}

/// Run `fut` to completion even if the request is dropped.
async fn detached<T, F>(fut: F) -> Result<T, RpcFault>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ConductorError>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result.map_err(|e| e.to_fault()),
        Err(e) => {
            error!(error = %e, "conductor task panicked");
            Err(RpcFault::new(FaultKind::Internal, "internal error"))
        }
    }
}

// ── RPC ────────────────────────────────────────────────────────

async fn create_mapping(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    body: Result<Json<RpcRequest<CreateMappingRequest>>, JsonRejection>,
) -> Response {
    let req = match accept(&headers, body, state.token.as_deref()) {
        Ok(req) => req,
        Err(fault) => return reply::<()>(Err(fault)),
    };
    let service = state.service.clone();
    reply(detached(async move { service.create_mapping(&req.context, req.payload).await }).await)
}

async fn reconcile_instance(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    body: Result<Json<RpcRequest<ReconcileInstanceRequest>>, JsonRejection>,
) -> Response {
    let req = match accept(&headers, body, state.token.as_deref()) {
        Ok(req) => req,
        Err(fault) => return reply::<()>(Err(fault)),
    };
    let service = state.service.clone();
    reply(
        detached(async move {
            let mapping = service
                .reconcile_instance(&req.context, &req.payload.instance_uuid, &req.payload.host)
                .await?;
            Ok(ReconcileInstanceReply { mapping })
        })
        .await,
    )
}

async fn reconcile_host(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    body: Result<Json<RpcRequest<ReconcileHostRequest>>, JsonRejection>,
) -> Response {
    let req = match accept(&headers, body, state.token.as_deref()) {
        Ok(req) => req,
        Err(fault) => return reply::<()>(Err(fault)),
    };
    let result = state
        .service
        .reconcile_host(&req.context, &req.payload.host)
        .map(|outcome| match outcome {
            Upsert::Created => ReconcileHostReply {
                created: true,
                changed_fields: Vec::new(),
            },
            Upsert::Updated(fields) => ReconcileHostReply {
                created: false,
                changed_fields: fields.into_iter().map(str::to_string).collect(),
            },
            Upsert::Unchanged => ReconcileHostReply {
                created: false,
                changed_fields: Vec::new(),
            },
        })
        .map_err(|e| e.to_fault());
    reply(result)
}

async fn reconcile_instances(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    body: Result<Json<RpcRequest<ReconcileInstancesRequest>>, JsonRejection>,
) -> Response {
    let req = match accept(&headers, body, state.token.as_deref()) {
        Ok(req) => req,
        Err(fault) => return reply::<()>(Err(fault)),
    };
    let summary = state.service.reconcile_instances(
        &req.context,
        &req.payload.host_name,
        &req.payload.instances,
    );
    reply(Ok(summary))
}

async fn reapply_mapping(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    body: Result<Json<RpcRequest<ReapplyMappingRequest>>, JsonRejection>,
) -> Response {
    let req = match accept(&headers, body, state.token.as_deref()) {
        Ok(req) => req,
        Err(fault) => return reply::<()>(Err(fault)),
    };
    let service = state.service.clone();
    reply(
        detached(async move {
            service
                .reapply_mapping(&req.context, &req.payload.instance_uuid)
                .await
        })
        .await,
    )
}

// ── Inspection ─────────────────────────────────────────────────

/// Response wrapper for the inspection API.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn respond<T: serde::Serialize>(result: Result<T, ConductorError>) -> Response {
    match result {
        Ok(data) => Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        })
        .into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.to_fault().kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(ApiResponse::<()> {
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

fn authorized(headers: &HeaderMap, token: Option<&str>) -> Result<(), ConductorError> {
    match token {
        Some(expected) if headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) != Some(expected) => {
            Err(ConductorError::Unauthorized)
        }
        _ => Ok(()),
    }
}

/// GET /v1/instance_cpu_mappings
async fn list_mappings(State(state): State<ConductorState>, headers: HeaderMap) -> Response {
    respond(authorized(&headers, state.token.as_deref()).and_then(|_| state.service.list_mappings()))
}

/// GET /v1/instance_cpu_mappings/{uuid}
async fn get_mapping(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Response {
    respond(authorized(&headers, state.token.as_deref()).and_then(|_| state.service.get_mapping(&uuid)))
}

/// DELETE /v1/instance_cpu_mappings/{uuid}
async fn delete_mapping(
    State(state): State<ConductorState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Response {
    if let Err(e) = authorized(&headers, state.token.as_deref()) {
        return respond::<()>(Err(e));
    }
    respond(state.service.delete_mapping(&uuid).await.map(|_| uuid))
}

/// GET /v1/hosts
async fn list_hosts(State(state): State<ConductorState>, headers: HeaderMap) -> Response {
    respond(authorized(&headers, state.token.as_deref()).and_then(|_| state.service.list_hosts()))
}

/// GET /v1/instances
async fn list_instances(State(state): State<ConductorState>, headers: HeaderMap) -> Response {
    respond(authorized(&headers, state.token.as_deref()).and_then(|_| state.service.list_instances()))
}
