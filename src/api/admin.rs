//! Admin API endpoints
//!
//! Instance administration endpoints. Like `/outbox`, these sit behind the
//! session layer in front of the service.

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::queue::TaskStatus;

/// Create admin router
///
/// Routes:
/// - POST /admin/users - Register a local user
/// - GET /admin/tasks?status=failed - Inspect the task queue
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user))
        .route("/tasks", get(list_tasks))
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    name: Option<String>,
    summary: Option<String>,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    id: String,
    username: String,
    inbox: String,
}

/// POST /admin/users
async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let user = state
        .register_user(&req.username, req.name, req.summary)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            id: user.ap_id,
            username: user.username,
            inbox: user.inbox,
        }),
    ))
}

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Deserialize)]
struct TaskQuery {
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    TaskStatus::Failed.as_str().to_string()
}

#[derive(Debug, Serialize)]
struct TaskInfo {
    id: String,
    kind: &'static str,
    target: String,
    depth: u32,
    attempts: u32,
    last_error: Option<String>,
    run_at: String,
}

/// GET /admin/tasks
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<TaskInfo>>, AppError> {
    let status: TaskStatus = query
        .status
        .parse()
        .map_err(|_| AppError::Validation(format!("unknown task status {}", query.status)))?;

    let tasks = state
        .queue
        .database()
        .tasks_with_status(status)
        .await?
        .into_iter()
        .map(|task| TaskInfo {
            kind: task.spec.kind.as_str(),
            target: task.spec.target,
            depth: task.spec.depth,
            attempts: task.attempts,
            last_error: task.last_error,
            run_at: task.run_at.to_rfc3339(),
            id: task.id,
        })
        .collect();
    Ok(Json(tasks))
}
