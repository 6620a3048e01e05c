//! Helpers shared by the conductor and agent axum routers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, warn};

use crate::proto::{FaultKind, RPC_API_VERSION, RpcFault, RpcReply, RpcRequest, TOKEN_HEADER};

/// Check the token header, then decode the envelope and check its protocol
/// version.
///
/// The body is only looked at once the token matches, so an unauthenticated
/// caller learns nothing about the payload shape.
pub fn accept<T>(
    headers: &HeaderMap,
    body: Result<Json<RpcRequest<T>>, JsonRejection>,
    expected_token: Option<&str>,
) -> Result<RpcRequest<T>, RpcFault> {
    if let Some(expected) = expected_token {
        let presented = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            warn!("rpc rejected: bad token");
            return Err(RpcFault::unauthorized());
        }
    }
    let Json(request) = body.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "rpc rejected: undecodable body");
        RpcFault::new(FaultKind::BadRequest, rejection.body_text())
    })?;
    if request.version != RPC_API_VERSION {
        return Err(RpcFault::new(
            FaultKind::VersionMismatch,
            format!(
                "unsupported rpc version {}, expected {RPC_API_VERSION}",
                request.version
            ),
        ));
    }
    Ok(request)
}

/// Turn a handler result into an HTTP response with an `RpcReply` body.
pub fn reply<T: Serialize>(result: Result<T, RpcFault>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(RpcReply::Ok(value))).into_response(),
        Err(fault) => {
            let status = StatusCode::from_u16(fault.kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(RpcReply::<T>::Error(fault))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use pinwheel_core::RequestContext;

    use super::*;

    fn request(version: &str) -> Result<Json<RpcRequest<()>>, JsonRejection> {
        let mut req = RpcRequest::new(RequestContext::service("test"), ());
        req.version = version.to_string();
        Ok(Json(req))
    }

    #[test]
    fn open_server_accepts_without_token() {
        assert!(accept(&HeaderMap::new(), request("1.0"), None).is_ok());
    }

    #[test]
    fn token_must_match() {
        let mut headers = HeaderMap::new();
        let err = accept(&headers, request("1.0"), Some("s3cret")).unwrap_err();
        assert_eq!(err.kind, FaultKind::UnauthorizedRequest);

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("wrong"));
        assert!(accept(&headers, request("1.0"), Some("s3cret")).is_err());

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(accept(&headers, request("1.0"), Some("s3cret")).is_ok());
    }

    #[test]
    fn version_mismatch_refused() {
        let err = accept(&HeaderMap::new(), request("2.0"), None).unwrap_err();
        assert_eq!(err.kind, FaultKind::VersionMismatch);
    }

    #[test]
    fn fault_status_code() {
        let response = reply::<()>(Err(RpcFault::new(FaultKind::MappingNotFound, "vm-1")));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(reply(Ok(1u8)).status(), StatusCode::OK);
    }
}
