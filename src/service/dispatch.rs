//! Request dispatcher: one pass of permission check, validation, optional verb override,
//! before-hook, statement, after-hook and response shaping per operation.

use crate::config::{CompiledResource, HookMode, Operation};
use crate::error::{AppError, FieldErrors};
use crate::extractors::SessionContext;
use crate::response::{created_key, ok, Updated};
use crate::service::contract::{split_list, Contract, MSG_EMPTY};
use crate::service::hooks::{spawn_after, AfterEvent, HookContext, ResourceHooks};
use crate::service::permissions::authorize;
use crate::sql::SelectField;
use crate::state::AppState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const MSG_FIELD_REQUIRED: &str = "This field is required";
pub const MSG_FIELD_EMPTY: &str = "This field cannot be empty";
pub const MSG_EMPTY_PAYLOAD: &str = "Payload cannot be empty";
pub const MSG_INVALID_INPUT: &str = "Invalid input type.";

/// Projection override from `select` names. Dotted names pick fields of a joined resource.
pub fn parse_selection(resource: &CompiledResource, names: &[String]) -> Result<Vec<SelectField>, FieldErrors> {
    let mut out: Vec<SelectField> = Vec::new();
    let mut bad: Vec<&str> = Vec::new();
    for name in names {
        match name.split_once('.') {
            Some((field, sub)) => {
                let known = resource
                    .join(field)
                    .map(|j| j.casts.contains_key(sub))
                    .unwrap_or(false);
                if !known {
                    bad.push(name.as_str());
                    continue;
                }
                match out.iter_mut().find(|s| s.name == field) {
                    Some(existing) => {
                        let subs = existing.sub.get_or_insert_with(Vec::new);
                        if !subs.iter().any(|s| s == sub) {
                            subs.push(sub.to_string());
                        }
                    }
                    None => out.push(SelectField {
                        name: field.to_string(),
                        sub: Some(vec![sub.to_string()]),
                    }),
                }
            }
            None => {
                let readable = resource.field(name).map(|f| f.is_readable()).unwrap_or(false)
                    && Some(name.as_str()) != resource.kid_column();
                if !readable {
                    bad.push(name.as_str());
                    continue;
                }
                if !out.iter().any(|s| &s.name == name) {
                    out.push(SelectField::plain(name));
                }
            }
        }
    }
    if bad.is_empty() {
        Ok(out)
    } else {
        Err(FieldErrors::single("select", format!("Invalid field name(s): {}.", bad.join(", "))))
    }
}

/// Validates a filter. For a kid, fields the read contract rejected are retried against
/// the kid's own contract; the request fails if nothing valid comes out of that.
pub fn validate_filter(
    resource: &CompiledResource,
    contract: &Contract,
    input: &Map<String, Value>,
) -> Result<Map<String, Value>, FieldErrors> {
    let err = match contract.validate(input) {
        Ok(valid) => return Ok(valid),
        Err(err) => err,
    };
    let Some(child) = &resource.contracts.child else {
        return Err(err.errors);
    };
    let child_keys: Vec<String> = err
        .errors
        .fields()
        .filter(|k| resource.is_child_field(k))
        .map(str::to_string)
        .collect();
    if child_keys.is_empty() {
        return Err(err.errors);
    }

    let mut remaining = err.errors.clone();
    let mut raw = Map::new();
    for key in &child_keys {
        remaining.remove(key);
        if let Some(v) = input.get(key) {
            raw.insert(key.clone(), v.clone());
        }
    }
    match child.validate(&raw) {
        Ok(extra) if remaining.is_empty() && !extra.is_empty() => {
            let mut merged = err.valid;
            merged.extend(extra);
            Ok(merged)
        }
        Ok(_) => Err(if remaining.is_empty() { err.errors } else { remaining }),
        Err(child_err) => {
            for (k, v) in child_err.errors.0 {
                remaining.0.insert(k, v);
            }
            Err(remaining)
        }
    }
}

fn envelope_part(body: &Map<String, Value>, key: &str, errors: &mut FieldErrors) -> Map<String, Value> {
    match body.get(key) {
        None | Some(Value::Null) => errors.push(key, MSG_FIELD_REQUIRED),
        Some(Value::Object(m)) if m.is_empty() => errors.push(key, MSG_FIELD_EMPTY),
        Some(Value::Object(m)) => return m.clone(),
        Some(_) => errors.push(key, MSG_INVALID_INPUT),
    }
    Map::new()
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        other => split_list(other)
            .last()
            .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false),
    }
}

/// Serves the generated operations of one resource for one request.
pub struct Dispatcher<'a> {
    state: &'a AppState,
    resource: Arc<CompiledResource>,
    session: SessionContext,
}

impl<'a> Dispatcher<'a> {
    pub fn for_route(state: &'a AppState, route: &str, session: SessionContext) -> Result<Self, AppError> {
        let resource = state
            .registry
            .by_route(route)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("resource '{}'", route)))?;
        Ok(Dispatcher {
            state,
            resource,
            session,
        })
    }

    pub fn resource(&self) -> &CompiledResource {
        &self.resource
    }

    fn guard(&self, op: Operation, target: Option<&Value>) -> Result<(), AppError> {
        if !self.resource.allows(op) {
            return Err(AppError::MethodNotAllowed(format!("{} on {}", op, self.resource.route)));
        }
        authorize(&self.resource, op, &self.session, &self.state.hooks, target)
    }

    fn hooks(&self) -> Option<Arc<dyn ResourceHooks>> {
        self.state.hooks.hooks(&self.resource.name).cloned()
    }

    fn context(&self) -> HookContext {
        HookContext {
            pool: self.state.pool.clone(),
            session: self.session.clone(),
            resource: self.resource.clone(),
        }
    }

    async fn overridden(
        &self,
        op: Operation,
        select: Option<&Map<String, Value>>,
        payload: &Map<String, Value>,
    ) -> Result<Option<Value>, AppError> {
        match self.hooks() {
            Some(h) if h.overrides().contains(&op) => {
                tracing::debug!(resource = %self.resource.name, operation = %op, "verb override");
                let select = select.cloned();
                Ok(Some(h.handle(&self.context(), op, select, payload.clone()).await?))
            }
            _ => Ok(None),
        }
    }

    async fn after(&self, event: AfterEvent) -> Result<(), AppError> {
        let Some(hooks) = self.hooks() else {
            return Ok(());
        };
        let ctx = self.context();
        match self.resource.hook_mode(event.operation()) {
            HookMode::Awaited => event.run(hooks.as_ref(), &ctx).await,
            HookMode::Background => {
                spawn_after(hooks, ctx, event, self.state.hook_failures.clone());
                Ok(())
            }
        }
    }

    fn selection(&self, input: &mut Map<String, Value>) -> Result<Option<Vec<SelectField>>, AppError> {
        let Some(raw) = input.remove("select") else {
            return Ok(None);
        };
        let names = split_list(&raw);
        if names.is_empty() {
            return Err(AppError::field("select", MSG_EMPTY));
        }
        parse_selection(&self.resource, &names)
            .map(Some)
            .map_err(AppError::Validation)
    }

    /// Moves a kid's own fields into its parent's extension column.
    fn pack(&self, payload: &mut Map<String, Value>) {
        let Some(column) = self.resource.kid_column() else {
            return;
        };
        let mut nested = Map::new();
        for name in &self.resource.child_fields {
            if let Some(v) = payload.remove(name) {
                nested.insert(name.clone(), v);
            }
        }
        if !nested.is_empty() {
            payload.insert(column.to_string(), Value::Object(nested));
        }
    }

    fn fill_pk_from_session(&self, payload: &mut Map<String, Value>) -> Result<(), AppError> {
        if !self.resource.pk_from_session {
            return Ok(());
        }
        let actor = self.session.actor_id.as_deref().ok_or(AppError::Unauthorized)?;
        let pk = &self.resource.pk;
        let numeric = self
            .resource
            .field(pk)
            .map(|f| f.descriptor.value_type.is_numeric())
            .unwrap_or(false);
        let value = if numeric {
            actor
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| AppError::field(pk, "Not a valid integer."))?
        } else {
            Value::String(actor.to_string())
        };
        payload.insert(pk.clone(), value);
        Ok(())
    }

    pub async fn get(&self, mut input: Map<String, Value>) -> Result<Response, AppError> {
        self.guard(Operation::Get, Some(&Value::Object(input.clone())))?;
        let selection = self.selection(&mut input)?;
        let mut filter = validate_filter(&self.resource, &self.resource.contracts.get, &input)
            .map_err(AppError::Validation)?;
        if let Some(body) = self.overridden(Operation::Get, None, &filter).await? {
            return Ok(Json(body).into_response());
        }
        if let Some(h) = self.hooks() {
            h.before_get(&self.context(), &mut filter).await?;
        }
        let row = self
            .state
            .crud()
            .get(&self.resource, &filter, selection.as_deref())
            .await?;
        Ok(Json(row).into_response())
    }

    pub async fn list(&self, mut input: Map<String, Value>) -> Result<Response, AppError> {
        self.guard(Operation::List, Some(&Value::Object(input.clone())))?;
        let page = self
            .resource
            .contracts
            .pagination
            .validate(&mut input)
            .map_err(|e| AppError::Validation(e.wrap("query")))?;
        let selection = self.selection(&mut input)?;
        let mut filter = validate_filter(&self.resource, &self.resource.contracts.list, &input)
            .map_err(AppError::Validation)?;
        if let Some(body) = self.overridden(Operation::List, None, &filter).await? {
            return Ok(Json(body).into_response());
        }
        if let Some(h) = self.hooks() {
            h.before_list(&self.context(), &mut filter).await?;
        }
        let page = self
            .state
            .crud()
            .list(&self.resource, &filter, &page, selection.as_deref())
            .await?;
        Ok(ok(page).into_response())
    }

    pub async fn post(&self, body: Value) -> Result<Response, AppError> {
        self.guard(Operation::Post, Some(&body))?;
        let Value::Object(input) = body else {
            return Err(AppError::field("_schema", MSG_INVALID_INPUT));
        };
        let mut payload = self
            .resource
            .contracts
            .post
            .validate(&input)
            .map_err(|e| AppError::Validation(e.errors))?;
        self.pack(&mut payload);
        self.fill_pk_from_session(&mut payload)?;
        if let Some(body) = self.overridden(Operation::Post, None, &payload).await? {
            return Ok((StatusCode::CREATED, Json(body)).into_response());
        }
        if let Some(h) = self.hooks() {
            h.before_post(&self.context(), &mut payload).await?;
        }
        let pk = self.state.crud().create(&self.resource, &payload).await?;
        tracing::debug!(resource = %self.resource.name, pk = %pk, "row created");
        self.after(AfterEvent::Post {
            pk: pk.clone(),
            payload,
        })
        .await?;
        Ok(created_key(&self.resource.pk, pk).into_response())
    }

    /// PUT and PATCH: body `{"select": {...}, "payload": {...}}`.
    pub async fn update(&self, op: Operation, body: Value) -> Result<Response, AppError> {
        self.guard(op, body.get("select"))?;
        let Value::Object(body) = body else {
            return Err(AppError::field("_schema", MSG_INVALID_INPUT));
        };

        let mut errors = FieldErrors::new();
        let select = envelope_part(&body, "select", &mut errors);
        let payload = envelope_part(&body, "payload", &mut errors);
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let select = validate_filter(&self.resource, &self.resource.contracts.get, &select)
            .map_err(|e| errors.insert_nested("select", e));
        let payload = self
            .resource
            .contracts
            .update
            .validate(&payload)
            .map_err(|e| errors.insert_nested("payload", e.errors));
        let (Ok(mut select), Ok(mut payload)) = (select, payload) else {
            return Err(AppError::Validation(errors));
        };

        if let Some(body) = self.overridden(op, Some(&select), &payload).await? {
            return Ok(Json(body).into_response());
        }
        if let Some(h) = self.hooks() {
            h.before_update(&self.context(), op, &mut select, &mut payload).await?;
        }
        self.pack(&mut payload);
        let updated = self
            .state
            .crud()
            .update(&self.resource, op, &select, &payload)
            .await?;
        self.after(AfterEvent::Update {
            op,
            select,
            payload,
            updated,
        })
        .await?;
        Ok(ok(Updated { updated }).into_response())
    }

    /// Filter from the query string and/or a JSON body; `deep=true` also prunes
    /// many-to-many references to the deleted rows.
    pub async fn delete(&self, mut query: Map<String, Value>, body: Option<Value>) -> Result<Response, AppError> {
        let deep = query.remove("deep").map(|v| is_truthy(&v)).unwrap_or(false);
        let mut input = query;
        match body {
            None | Some(Value::Null) => {}
            Some(Value::Object(m)) => input.extend(m),
            Some(_) => return Err(AppError::field("_schema", MSG_INVALID_INPUT)),
        }
        self.guard(Operation::Delete, Some(&Value::Object(input.clone())))?;
        if input.is_empty() {
            return Err(AppError::field("_schema", MSG_EMPTY_PAYLOAD));
        }
        let mut filter = validate_filter(&self.resource, &self.resource.contracts.delete, &input)
            .map_err(AppError::Validation)?;
        if let Some(body) = self.overridden(Operation::Delete, None, &filter).await? {
            return Ok(Json(body).into_response());
        }
        if let Some(h) = self.hooks() {
            h.before_delete(&self.context(), &mut filter).await?;
        }
        let deleted = self.state.crud().delete(&self.resource, &filter, deep).await?;
        self.after(AfterEvent::Delete {
            filter,
            deleted: deleted.clone(),
        })
        .await?;
        Ok(ok(deleted).into_response())
    }
}
