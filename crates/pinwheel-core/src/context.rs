//! Request context propagated across RPC boundaries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is asking, and on behalf of which project.
///
/// Built once at the edge (API call, notification, tracker tick) and passed
/// explicitly to every store and executor operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl RequestContext {
    /// Context for work the service initiates itself (tracker ticks, dispatch).
    pub fn service(origin: &str) -> Self {
        Self {
            request_id: new_request_id(origin),
            project_id: None,
            user_id: None,
            is_admin: true,
        }
    }

    /// Context for a request made by a project user.
    pub fn for_user(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id("req"),
            project_id: Some(project_id.into()),
            user_id: Some(user_id.into()),
            is_admin: false,
        }
    }
}

fn new_request_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = RequestContext::service("tracker");
        let b = RequestContext::service("tracker");
        assert_ne!(a.request_id, b.request_id);
        assert!(a.request_id.starts_with("tracker-"));
        let suffix = a.request_id.trim_start_matches("tracker-");
        assert!(Uuid::parse_str(suffix).is_ok());
        assert!(a.is_admin);
    }

    #[test]
    fn user_context_is_not_admin() {
        let ctx = RequestContext::for_user("p1", "u1");
        assert!(!ctx.is_admin);
        assert_eq!(ctx.project_id.as_deref(), Some("p1"));
    }
}
