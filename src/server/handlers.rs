//! Intake request handlers.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::pipeline::{self, TaskKind, TaskSpec};
use crate::server::state::ServerState;

/// Unified response body.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub code: u16,
    pub msg: String,
}

impl ApiResponse {
    fn new(code: u16, msg: impl Into<String>) -> (StatusCode, Json<ApiResponse>) {
        (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(ApiResponse {
                code,
                msg: msg.into(),
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub project: String,
    #[serde(default, rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Serialize)]
struct RemoteCallRequest<'a> {
    project: &'a str,
    callback_url: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    r#type: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    category: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    #[serde(default)]
    pub project: String,
    #[serde(default, rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub finished_at: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub update_feishu: String,
    #[serde(default)]
    pub notify_feishu: String,
    #[serde(default)]
    pub step_durations: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub id: String,
}

/// `POST /update` — validated and forwarded to the upstream build service.
pub async fn update_handler(
    State(state): State<ServerState>,
    Json(req): Json<UpdateRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.project.is_empty() {
        return ApiResponse::new(400, "missing required field: project");
    }

    info!(
        "update request: project={}, type={}, category={}",
        req.project, req.task_type, req.category
    );

    let remote = RemoteCallRequest {
        project: &req.project,
        callback_url: state.ctx.settings.callback_url(),
        r#type: &req.task_type,
        category: &req.category,
    };

    let update_url = &state.ctx.settings.remote.update_url;
    let result = state
        .ctx
        .http_client
        .post(update_url)
        .json(&remote)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status() == StatusCode::OK => ApiResponse::new(200, "remote call succeeded"),
        Ok(resp) => {
            error!("upstream update answered {}", resp.status());
            ApiResponse::new(500, "remote call failed")
        }
        Err(e) => {
            error!("upstream update request failed: {}", e);
            ApiResponse::new(500, "remote call failed")
        }
    }
}

/// `POST /callback` — the entry point to the rollout pipelines. Only
/// `status == "success"` triggers a rollout; the pipeline runs detached and
/// the callback answers immediately.
pub async fn callback_handler(
    State(state): State<ServerState>,
    Json(req): Json<CallbackRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.project.is_empty() || req.tag.is_empty() {
        return ApiResponse::new(400, "missing required field: project/tag");
    }

    if req.status != "success" {
        info!("callback with status {}, skipping rollout", req.status);
        return ApiResponse::new(200, "callback acknowledged (not a success status)");
    }

    let settings = &state.ctx.settings;
    let kind = pipeline::classify(settings, &req.task_type, &req.project);

    // Input errors stop here; the pipelines assume a configured project.
    if kind != TaskKind::Web && settings.project_base(&req.project).is_none() {
        return ApiResponse::new(
            400,
            format!("no deployment directory configured for {}", req.project),
        );
    }

    let task_id = if req.task_id.is_empty() {
        pipeline::synthesize_task_id(&req.project, &req.tag)
    } else {
        req.task_id.clone()
    };

    info!(
        "build callback accepted: project={}, tag={}, kind={}, task={}",
        req.project,
        req.tag,
        kind.as_str(),
        task_id
    );

    let spec = TaskSpec {
        task_id: task_id.clone(),
        project: req.project,
        tag: req.tag,
        category: req.category,
        project_name: req.project_name,
        started_at: req.create_time,
        ops_url: req.update_feishu,
        pro_url: req.notify_feishu,
        step_durations: req.step_durations,
    };

    let cancel = state.ctx.registry.register(&task_id);
    let ctx = state.ctx.clone();
    tokio::spawn(async move {
        pipeline::run_task(ctx, spec, kind, cancel).await;
    });

    ApiResponse::new(200, "callback accepted")
}

/// `POST /api/task/cancel` — fire a task's cancellation signal.
pub async fn cancel_handler(
    State(state): State<ServerState>,
    Json(req): Json<CancelRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.id.is_empty() {
        return ApiResponse::new(400, "missing required field: id");
    }

    if state.ctx.registry.cancel(&req.id) {
        info!("cancellation signal sent for task {}", req.id);
        ApiResponse::new(200, "cancellation signal sent")
    } else {
        ApiResponse::new(404, "task not found or already finished")
    }
}

/// `GET /health` — liveness, outside the allow-list.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
