use axum::{
    extract::{Json, Path, State},
    http::header,
    middleware as axum_middleware,
    response::{Html, IntoResponse},
    routing::{any, get, post, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::{Error, Result};
use crate::hmr;
use crate::middleware;
use crate::projects::{CreateProject, FileUpdate, ProjectFile};
use crate::proxy;
use crate::state::AppState;
use crate::supervisor::InstanceStatus;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<ProjectFile>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFilesRequest {
    pub updates: Vec<FileUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDependencyRequest {
    pub package: Option<String>,
    #[serde(default)]
    pub dev: bool,
}

/// The full public router: auth-gated control plane, health surface,
/// static probe asset, preview proxy and HMR endpoints.
pub fn router(state: AppState) -> Router {
    let control = Router::new()
        .route("/projects", post(create_project))
        .route("/projects/:id", get(get_project).delete(delete_project))
        .route("/projects/:id/files", put(update_files).get(list_files))
        .route("/projects/:id/files/*path", get(read_file))
        .route("/projects/:id/preview/start", post(start_preview))
        .route("/projects/:id/preview/stop", post(stop_preview))
        .route("/projects/:id/reinstall", post(reinstall_dependencies))
        .route("/projects/:id/dependencies", post(add_dependency))
        .route(
            "/projects/:id/dependencies/:package",
            axum::routing::delete(remove_dependency),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_signature,
        ));

    let public = Router::new()
        .route("/", get(welcome))
        .route("/health", get(health))
        .route("/health/ready", get(health))
        .route("/health/live", get(health))
        .route("/health/metrics", get(metrics))
        .route("/metrics", get(metrics))
        .route("/health/debug/instances", get(debug_instances))
        .route("/static/visual-edit-script.js", get(probe_script));

    let preview = Router::new()
        .route("/p/:project_id", any(proxy::redirect_bare))
        .route("/p/:project_id/", any(proxy::proxy_root))
        .route("/p/:project_id/*tail", any(proxy::proxy_tail));

    let hmr_routes = Router::new()
        .route(&state.config.hmr_path, get(hmr::external_handler))
        .route(
            &format!("{}/:id", state.config.hmr_path),
            get(hmr::plain_ok),
        );

    Router::new()
        .merge(control)
        .merge(public)
        .merge(preview)
        .merge(hmr_routes)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            hmr::upgrade_interceptor,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProjectRequest>,
) -> Result<Json<Value>> {
    let (Some(project_id), Some(project_name)) = (body.project_id, body.project_name) else {
        return Err(Error::BadRequest(
            "projectId and projectName are required".to_string(),
        ));
    };

    let info = state
        .projects
        .create(CreateProject {
            project_id: project_id.clone(),
            project_name,
            description: body.description,
            files: body.files,
        })
        .await?;

    Ok(envelope(json!({
        "projectId": project_id,
        "dir": info.dir.display().to_string(),
        "port": info.port,
        "previewUrl": info.preview_url,
        "hmrUrl": info.hmr_url,
    })))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let status = state.projects.get_status(&id).await?;
    Ok(envelope(serde_json::to_value(status).unwrap_or_default()))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.projects.delete(&id).await?;
    Ok(envelope(json!({ "deleted": true })))
}

async fn update_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateFilesRequest>,
) -> Result<Json<Value>> {
    let applied = state.projects.update_files(&id, &body.updates).await?;
    Ok(envelope(json!({ "updated": applied })))
}

async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let files = state.projects.list_files(&id).await?;
    Ok(envelope(json!({ "files": files })))
}

async fn read_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Json<Value>> {
    match state.projects.read_file(&id, &path).await? {
        Some(content) => Ok(envelope(json!({ "path": path, "content": content }))),
        None => Err(Error::NotFound(format!("file {path} not found"))),
    }
}

async fn start_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let info = state.projects.start_preview(&id).await?;
    Ok(envelope(json!({
        "port": info.port,
        "previewUrl": info.preview_url,
        "hmrUrl": info.hmr_url,
    })))
}

async fn stop_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.projects.stop_preview(&id).await?;
    Ok(envelope(json!({ "stopped": true })))
}

async fn reinstall_dependencies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let info = state.projects.reinstall_dependencies(&id).await?;
    Ok(envelope(json!({
        "port": info.port,
        "previewUrl": info.preview_url,
        "hmrUrl": info.hmr_url,
    })))
}

async fn add_dependency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddDependencyRequest>,
) -> Result<Json<Value>> {
    let Some(package) = body.package else {
        return Err(Error::BadRequest("package is required".to_string()));
    };
    let result = state.projects.add_dependency(&id, &package, body.dev).await?;
    if !result.success {
        return Err(Error::InstallFailure(
            result.logs.last().cloned().unwrap_or_default(),
        ));
    }
    Ok(envelope(serde_json::to_value(result).unwrap_or_default()))
}

async fn remove_dependency(
    State(state): State<AppState>,
    Path((id, package)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let result = state.projects.remove_dependency(&id, &package).await?;
    if !result.success {
        return Err(Error::InstallFailure(
            result.logs.last().cloned().unwrap_or_default(),
        ));
    }
    Ok(envelope(serde_json::to_value(result).unwrap_or_default()))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let instances = state.supervisor.get_all();
    let count = |status: InstanceStatus| {
        instances.iter().filter(|i| i.status == status).count()
    };

    Json(json!({
        "vite": {
            "running": count(InstanceStatus::Running),
            "starting": count(InstanceStatus::Starting),
            "error": count(InstanceStatus::Error),
            "total": instances.len(),
        },
        "instances": instances,
        "uptime": state.started_at.elapsed().as_secs(),
        "memory": { "rss": process_memory_bytes() },
        "timestamp": Utc::now(),
    }))
}

async fn debug_instances(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "instances": state.supervisor.get_all(),
            "availablePorts": state.supervisor.available_ports(),
            "capacity": state.config.supervisor.max_instances,
            "template": state.projects.template().state(),
        },
    }))
}

async fn welcome(State(state): State<AppState>) -> Html<String> {
    let running = state.supervisor.running_count();
    let total = state.supervisor.get_all().len();
    let projects = state.projects.project_count().await;

    Html(format!(
        r#"<!doctype html>
<html>
  <head><title>Preview Orchestrator</title></head>
  <body>
    <h1>Preview Orchestrator</h1>
    <p>{projects} projects on disk, {running} running previews ({total} instances tracked).</p>
    <p>Previews are served under <code>/p/&lt;projectId&gt;/</code>.</p>
  </body>
</html>
"#
    ))
}

async fn probe_script() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        include_str!("../assets/visual-edit-script.js"),
    )
}

fn process_memory_bytes() -> u64 {
    let mut system = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    if system.refresh_process(pid) {
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    } else {
        0
    }
}
