//! REST handlers.
//!
//! Every write goes through the repository first; the change is broadcast only
//! once the repository has returned a committed value, and only to the acting
//! user's connections. Write and broadcast run under the user's sequencing
//! lock (see [`Broadcaster::sequenced`](crate::Broadcaster::sequenced)).

use crate::auth::bearer_token;
use crate::error::{ServerError, ServerResult};
use crate::hub::UserId;
use crate::state::AppState;
use crate::ws;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tasksync_protocol::{
    AuthSession, AuthTokens, EntityId, EntityKind, List, ListPatch, Login, NewList, NewSubtask,
    NewTask, RefreshRequest, Registration, Reordered, Subtask, SubtaskPatch, Task, TaskPatch, User,
};

/// Builds the router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::upgrade))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/logout", post(logout))
        .route("/api/user/me", get(me))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/reorder", post(reorder_tasks))
        .route(
            "/api/tasks/:id",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/api/tasks/:id/subtasks", post(create_subtask))
        .route("/api/tasks/:id/subtasks/reorder", post(reorder_subtasks))
        .route("/api/subtasks/:id", put(update_subtask).delete(delete_subtask))
        .route("/api/lists", get(list_lists).post(create_list))
        .route("/api/lists/reorder", post(reorder_lists))
        .route("/api/lists/:id", put(update_list).delete(delete_list))
        .with_state(state)
}

/// The user a request acts for, taken from its bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ServerResult<Self> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ServerError::AuthenticationFailed("missing credential".into()))?;
        let token = bearer_token(header)
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed credential".into()))?;
        state.tokens.validate(token).map(AuthUser)
    }
}

/// Acknowledgement for writes that return no entity.
#[derive(Debug, Serialize)]
struct Message {
    message: &'static str,
}

fn ack(message: &'static str) -> Json<Message> {
    Json(Message { message })
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        connections: state.hub.connection_count(),
    })
}

// ============================================================================
// Auth
// ============================================================================

/// Runs password work on the blocking pool.
async fn blocking<T, F>(work: F) -> ServerResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ServerResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ServerError::Internal(format!("password task: {e}")))?
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<Registration>,
) -> ServerResult<(StatusCode, Json<AuthSession>)> {
    let users = Arc::clone(&state.users);
    let user = blocking(move || users.register(&request)).await?;
    let tokens = state.sessions.issue(user.id)?;
    tracing::info!(user = user.id, "account registered");
    Ok((StatusCode::CREATED, Json(AuthSession { user, tokens })))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<Login>,
) -> ServerResult<Json<AuthSession>> {
    let users = Arc::clone(&state.users);
    let user = blocking(move || users.authenticate(&request)).await?;
    let tokens = state.sessions.issue(user.id)?;
    tracing::debug!(user = user.id, "logged in");
    Ok(Json(AuthSession { user, tokens }))
}

async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ServerResult<Json<AuthTokens>> {
    let tokens = state.sessions.rotate(&request.refresh_token)?;
    Ok(Json(tokens))
}

/// The refresh token in the body is the credential: logging out must work
/// after the access token has expired.
async fn logout(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Json<Message> {
    if state.sessions.revoke(&request.refresh_token) {
        tracing::debug!("refresh session revoked");
    }
    ack("logged out")
}

async fn me(State(state): State<AppState>, AuthUser(user): AuthUser) -> ServerResult<Json<User>> {
    Ok(Json(state.users.get(user)?))
}

// ============================================================================
// Tasks
// ============================================================================

async fn list_tasks(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ServerResult<Json<Vec<Task>>> {
    Ok(Json(state.store.tasks(user)?))
}

async fn get_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
) -> ServerResult<Json<Task>> {
    Ok(Json(state.store.task(user, id)?))
}

async fn create_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(new): Json<NewTask>,
) -> ServerResult<(StatusCode, Json<Task>)> {
    let task = state.emitter.sequenced(user, |emitter| {
        let task = state.store.create_task(user, new)?;
        emitter.created(user, &task);
        Ok(task)
    })?;
    Ok((StatusCode::CREATED, Json(task.into_inner())))
}

async fn update_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
    Json(patch): Json<TaskPatch>,
) -> ServerResult<Json<Task>> {
    let task = state.emitter.sequenced(user, |emitter| {
        let task = state.store.update_task(user, id, &patch)?;
        emitter.updated(user, &task);
        Ok(task)
    })?;
    Ok(Json(task.into_inner()))
}

async fn delete_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
) -> ServerResult<Json<Message>> {
    state.emitter.sequenced(user, |emitter| {
        let deleted = state.store.delete_task(user, id)?;
        emitter.deleted(user, EntityKind::Task, &deleted);
        Ok(())
    })?;
    Ok(ack("task deleted"))
}

async fn reorder_tasks(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(order): Json<Reordered>,
) -> ServerResult<Json<Message>> {
    state.emitter.sequenced(user, |emitter| {
        let ids = state.store.reorder_tasks(user, &order.ordered_ids)?;
        emitter.reordered(user, EntityKind::Task, &ids);
        Ok(())
    })?;
    Ok(ack("tasks reordered"))
}

// ============================================================================
// Subtasks
// ============================================================================

async fn create_subtask(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(task_id): Path<EntityId>,
    Json(new): Json<NewSubtask>,
) -> ServerResult<(StatusCode, Json<Subtask>)> {
    let subtask = state.emitter.sequenced(user, |emitter| {
        let subtask = state.store.create_subtask(user, task_id, new)?;
        emitter.created(user, &subtask);
        Ok(subtask)
    })?;
    Ok((StatusCode::CREATED, Json(subtask.into_inner())))
}

async fn update_subtask(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
    Json(patch): Json<SubtaskPatch>,
) -> ServerResult<Json<Subtask>> {
    let subtask = state.emitter.sequenced(user, |emitter| {
        let subtask = state.store.update_subtask(user, id, &patch)?;
        emitter.updated(user, &subtask);
        Ok(subtask)
    })?;
    Ok(Json(subtask.into_inner()))
}

async fn delete_subtask(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
) -> ServerResult<Json<Message>> {
    state.emitter.sequenced(user, |emitter| {
        let deleted = state.store.delete_subtask(user, id)?;
        emitter.deleted(user, EntityKind::Subtask, &deleted);
        Ok(())
    })?;
    Ok(ack("subtask deleted"))
}

async fn reorder_subtasks(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(task_id): Path<EntityId>,
    Json(order): Json<Reordered>,
) -> ServerResult<Json<Message>> {
    state.emitter.sequenced(user, |emitter| {
        let ids = state.store.reorder_subtasks(user, task_id, &order.ordered_ids)?;
        emitter.reordered(user, EntityKind::Subtask, &ids);
        Ok(())
    })?;
    Ok(ack("subtasks reordered"))
}

// ============================================================================
// Lists
// ============================================================================

async fn list_lists(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ServerResult<Json<Vec<List>>> {
    Ok(Json(state.store.lists(user)?))
}

async fn create_list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(new): Json<NewList>,
) -> ServerResult<(StatusCode, Json<List>)> {
    let list = state.emitter.sequenced(user, |emitter| {
        let list = state.store.create_list(user, new)?;
        emitter.created(user, &list);
        Ok(list)
    })?;
    Ok((StatusCode::CREATED, Json(list.into_inner())))
}

async fn update_list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
    Json(patch): Json<ListPatch>,
) -> ServerResult<Json<List>> {
    let list = state.emitter.sequenced(user, |emitter| {
        let list = state.store.update_list(user, id, &patch)?;
        emitter.updated(user, &list);
        Ok(list)
    })?;
    Ok(Json(list.into_inner()))
}

async fn delete_list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<EntityId>,
) -> ServerResult<Json<Message>> {
    // Tasks in the list are removed with it; clients cascade on list_deleted.
    state.emitter.sequenced(user, |emitter| {
        let deleted = state.store.delete_list(user, id)?;
        emitter.deleted(user, EntityKind::List, &deleted);
        Ok(())
    })?;
    Ok(ack("list deleted"))
}

async fn reorder_lists(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(order): Json<Reordered>,
) -> ServerResult<Json<Message>> {
    state.emitter.sequenced(user, |emitter| {
        let ids = state.store.reorder_lists(user, &order.ordered_ids)?;
        emitter.reordered(user, EntityKind::List, &ids);
        Ok(())
    })?;
    Ok(ack("lists reordered"))
}
