//! Permission checks: public operations, role lists and named row predicates.

use crate::config::{Access, CompiledResource, Operation};
use crate::error::AppError;
use crate::extractors::SessionContext;
use crate::service::hooks::HookRegistry;
use serde_json::Value;

/// Allows `op` on `resource` for `session`. Resources without permissions are open;
/// operations neither public nor listed under `authenticated` are forbidden.
pub fn authorize(
    resource: &CompiledResource,
    op: Operation,
    session: &SessionContext,
    hooks: &HookRegistry,
    target: Option<&Value>,
) -> Result<(), AppError> {
    let Some(perms) = &resource.permissions else {
        return Ok(());
    };
    if perms.public.contains(&op) {
        return Ok(());
    }
    if !session.is_authenticated() {
        return Err(AppError::Unauthorized);
    }
    let allowed = match perms.authenticated.get(&op) {
        None => false,
        Some(Access::Roles(roles)) => roles.iter().any(|r| r == "*" || session.has_role(r)),
        Some(Access::Predicate { predicate }) => hooks
            .predicate(predicate)
            .map(|p| p(session, target))
            .unwrap_or(false),
    };
    if allowed {
        Ok(())
    } else {
        tracing::debug!(resource = %resource.name, operation = %op, actor = ?session.actor_id, "permission denied");
        Err(AppError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ResourceSet};
    use serde_json::json;
    use std::sync::Arc;

    fn note() -> Arc<CompiledResource> {
        let set: ResourceSet = serde_json::from_value(json!({"resources": [
            {"name": "Note", "fields": [
                {"name": "id", "type": "integer", "sql": "integer", "primary_key": true},
                {"name": "owner", "type": "string", "sql": "text"}
            ], "meta": {"permissions": {
                "public": ["get", "list"],
                "authenticated": {
                    "post": ["*"],
                    "delete": ["admin"],
                    "patch": {"predicate": "is_owner"}
                }
            }}}
        ]}))
        .unwrap();
        resolve(&set).unwrap().by_name("Note").unwrap().clone()
    }

    fn hooks() -> HookRegistry {
        HookRegistry::new().with_predicate("is_owner", |s, target| {
            target.and_then(|t| t.get("owner")).and_then(Value::as_str) == s.actor_id.as_deref()
        })
    }

    #[test]
    fn public_operations_need_no_session() {
        let r = note();
        authorize(&r, Operation::List, &SessionContext::anonymous(), &hooks(), None).unwrap();
        assert!(matches!(
            authorize(&r, Operation::Post, &SessionContext::anonymous(), &hooks(), None),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn roles_and_wildcard() {
        let r = note();
        let user = SessionContext::actor("u1", &["staff"]);
        authorize(&r, Operation::Post, &user, &hooks(), None).unwrap();
        assert!(matches!(authorize(&r, Operation::Delete, &user, &hooks(), None), Err(AppError::Forbidden)));
        let admin = SessionContext::actor("u2", &["admin"]);
        authorize(&r, Operation::Delete, &admin, &hooks(), None).unwrap();
        assert!(matches!(authorize(&r, Operation::Put, &admin, &hooks(), None), Err(AppError::Forbidden)));
    }

    #[test]
    fn predicate_sees_target() {
        let r = note();
        let user = SessionContext::actor("u1", &[]);
        let mine = json!({"owner": "u1"});
        let theirs = json!({"owner": "u9"});
        authorize(&r, Operation::Patch, &user, &hooks(), Some(&mine)).unwrap();
        assert!(matches!(
            authorize(&r, Operation::Patch, &user, &hooks(), Some(&theirs)),
            Err(AppError::Forbidden)
        ));
    }
}
