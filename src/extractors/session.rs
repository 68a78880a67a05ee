//! Request identity passed explicitly to permission checks and hooks.

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};

pub const ACTOR_ID_HEADER: &str = "X-Actor-Id";
pub const ROLES_HEADER: &str = "X-Roles";
pub const WORKSPACE_HEADER: &str = "X-Workspace";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub actor_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub workspace: Option<String>,
}

impl SessionContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn actor(actor_id: impl Into<String>, roles: &[&str]) -> Self {
        SessionContext {
            actor_id: Some(actor_id.into()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            workspace: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.actor_id.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A `SessionContext` placed in request extensions by upstream auth middleware wins;
/// otherwise the identity headers are read.
#[async_trait]
impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<SessionContext>() {
            return Ok(session.clone());
        }
        let roles = header(parts, ROLES_HEADER)
            .map(|r| {
                r.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(SessionContext {
            actor_id: header(parts, ACTOR_ID_HEADER),
            roles,
            workspace: header(parts, WORKSPACE_HEADER),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> SessionContext {
        let (mut parts, _) = req.into_parts();
        SessionContext::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn reads_identity_headers() {
        let req = Request::builder()
            .header(ACTOR_ID_HEADER, "42")
            .header(ROLES_HEADER, "admin, editor,")
            .body(())
            .unwrap();
        let s = extract(req).await;
        assert_eq!(s.actor_id.as_deref(), Some("42"));
        assert_eq!(s.roles, ["admin", "editor"]);
        assert!(s.workspace.is_none());
    }

    #[tokio::test]
    async fn extension_takes_precedence() {
        let mut req = Request::builder().header(ACTOR_ID_HEADER, "1").body(()).unwrap();
        req.extensions_mut().insert(SessionContext::actor("7", &["staff"]));
        assert_eq!(extract(req).await, SessionContext::actor("7", &["staff"]));
    }

    #[tokio::test]
    async fn anonymous_without_headers() {
        let s = extract(Request::new(())).await;
        assert!(!s.is_authenticated());
    }
}
