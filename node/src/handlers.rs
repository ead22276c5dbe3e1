use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::wire::{
    self, CancelRequest, CancelResponse, DeleteRequest, DeleteResponse, ExistsResponse, PathQuery,
    SubmitJobRequest, ThrottleRequest, UpdateResponse,
};
use common::{AttemptStatus, ExecutorTask, JobId, JobStatus, NodeError, NodeId, NodeStatusSnapshot};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cluster::NodeService;
use crate::node::Node;

type AppState = Arc<Node>;

pub fn build_router(node: AppState) -> Router {
    Router::new()
        .route(wire::HEALTH, get(health))
        .route(wire::JOBS, post(submit_job).get(list_jobs))
        .route(wire::JOB, get(get_job))
        .route(wire::ATTEMPT_STATUSES, post(update_attempt_statuses))
        .route(wire::NODE_STATUS, post(update_node_status))
        .route(wire::NODE_ID, get(node_id))
        .route(wire::NODE_STOP, post(stop_node))
        .route(wire::EXECUTE, post(execute))
        .route(wire::CANCEL, post(cancel))
        .route(wire::DELETE, post(delete))
        .route(wire::THROTTLE, post(set_throttle))
        .route(wire::FS, get(read_file).put(write_file).delete(delete_path))
        .route(wire::FS_MKDIR, post(mkdir))
        .route(wire::FS_EXISTS, get(exists))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Error de servicio como respuesta HTTP: el cuerpo es el mensaje.
pub struct ApiError(NodeError);

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            NodeError::Io(e) if e.kind() == ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("error interno: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn node_id(State(node): State<AppState>) -> Json<NodeId> {
    Json(node.id())
}

async fn submit_job(
    State(node): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> ApiResult<Json<JobId>> {
    let id = node.submit_job(req.jar, req.input).await?;
    info!("job {} aceptado", id.qualified());
    Ok(Json(id))
}

async fn list_jobs(State(node): State<AppState>) -> Json<Vec<JobId>> {
    Json(node.job_manager().job_ids())
}

// El id llega calificado, ej: 00001-00003
async fn get_job(State(node): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<JobStatus>> {
    let id: JobId = id.parse()?;
    Ok(Json(node.job_manager().job_status(id)?))
}

async fn update_attempt_statuses(
    State(node): State<AppState>,
    Json(statuses): Json<Vec<AttemptStatus>>,
) -> Json<UpdateResponse> {
    let changed = node.job_manager().update_attempt_statuses(statuses);
    Json(UpdateResponse { changed })
}

async fn update_node_status(
    State(node): State<AppState>,
    Json(snapshot): Json<NodeStatusSnapshot>,
) -> Json<UpdateResponse> {
    let changed = node.load_balancer().update_status(snapshot);
    Json(UpdateResponse { changed })
}

async fn stop_node(State(node): State<AppState>) -> &'static str {
    node.stop();
    "ok"
}

async fn execute(State(node): State<AppState>, Json(task): Json<ExecutorTask>) -> ApiResult<&'static str> {
    node.executor().execute(task)?;
    Ok("ok")
}

async fn cancel(
    State(node): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<CancelResponse>> {
    let canceled = node
        .executor()
        .cancel(req.attempt, Duration::from_millis(req.timeout_ms))
        .await?;
    Ok(Json(CancelResponse { canceled }))
}

async fn delete(
    State(node): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = node.executor().delete(req.attempt).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn set_throttle(
    State(node): State<AppState>,
    Json(req): Json<ThrottleRequest>,
) -> ApiResult<&'static str> {
    node.executor().set_throttle(req.percent)?;
    Ok("ok")
}

/* ---------------- file system ---------------- */

async fn read_file(State(node): State<AppState>, Query(q): Query<PathQuery>) -> ApiResult<Vec<u8>> {
    Ok(node.fs().read(&q.path).await?)
}

async fn write_file(
    State(node): State<AppState>,
    Query(q): Query<PathQuery>,
    body: Bytes,
) -> ApiResult<&'static str> {
    node.fs().write(&q.path, &body).await?;
    Ok("ok")
}

async fn delete_path(
    State(node): State<AppState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = node.fs().delete(&q.path).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn mkdir(State(node): State<AppState>, Query(q): Query<PathQuery>) -> ApiResult<&'static str> {
    node.fs().mkdir(&q.path).await?;
    Ok("ok")
}

async fn exists(
    State(node): State<AppState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<ExistsResponse>> {
    let exists = node.fs().exists(&q.path).await?;
    Ok(Json(ExistsResponse { exists }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::cpu::FixedCpuProbe;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use common::api::PluginRegistry;
    use common::JobDescriptor;
    use tower::ServiceExt;

    fn router(dir: &std::path::Path) -> (Router, Arc<Node>) {
        let config = NodeConfig {
            fs_root_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        let node = Node::new(
            config,
            PluginRegistry::with_builtins(),
            Arc::new(FixedCpuProbe(0.0)),
        );
        (build_router(node.clone()), node)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = router(dir.path());
        let (status, body) = call(&app, "GET", "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn files_round_trip_through_the_fs_routes() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = router(dir.path());
        let uri = "/api/v1/fs?path=job%2Finput%2Fsplit-00000";

        let (status, _) = call(&app, "PUT", uri, Body::from("hola\n")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "GET", uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hola\n");

        let (_, body) = call(&app, "GET", "/api/v1/fs/exists?path=job%2Finput%2Fsplit-00000", Body::empty()).await;
        let resp: ExistsResponse = serde_json::from_slice(&body).unwrap();
        assert!(resp.exists);

        let (status, _) = call(&app, "GET", "/api/v1/fs?path=no-existe", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/v1/fs?path=..%2Fetc%2Fpasswd", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_or_malformed_job_ids_map_to_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = router(dir.path());
        let (status, _) = call(&app, "GET", "/api/v1/jobs/00001-00009", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/v1/jobs/cualquiera", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn throttle_out_of_range_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (app, node) = router(dir.path());
        let body = serde_json::to_vec(&ThrottleRequest { percent: 150.0 }).unwrap();
        let (status, _) = call(&app, "POST", wire::THROTTLE, Body::from(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body = serde_json::to_vec(&ThrottleRequest { percent: 30.0 }).unwrap();
        let (status, _) = call(&app, "POST", wire::THROTTLE, Body::from(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(node.executor().throttle(), 30.0);
    }

    #[tokio::test]
    async fn submitted_job_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = router(dir.path());
        let descriptor = JobDescriptor {
            mapper: "wordcount".into(),
            combiner: None,
            reducer: "wordcount".into(),
            input_format: "text".into(),
            output_format: "text".into(),
            properties: Default::default(),
        };
        let req = SubmitJobRequest {
            jar: descriptor.to_package(),
            input: b"hola mundo\n".to_vec(),
        };
        let (status, body) = call(&app, "POST", wire::JOBS, Body::from(serde_json::to_vec(&req).unwrap())).await;
        assert_eq!(status, StatusCode::OK);
        let id: JobId = serde_json::from_slice(&body).unwrap();

        let (_, body) = call(&app, "GET", wire::JOBS, Body::empty()).await;
        let ids: Vec<JobId> = serde_json::from_slice(&body).unwrap();
        assert_eq!(ids, vec![id]);

        let uri = format!("{}/{}", wire::JOBS, id.qualified());
        let (status, body) = call(&app, "GET", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let job: JobStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(job.map_tasks.len(), 1);

        let bad = SubmitJobRequest {
            jar: b"{}".to_vec(),
            input: b"x\n".to_vec(),
        };
        let (status, _) = call(&app, "POST", wire::JOBS, Body::from(serde_json::to_vec(&bad).unwrap())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submitted_input_keeps_non_utf8_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (app, node) = router(dir.path());
        let descriptor = JobDescriptor {
            mapper: "wordcount".into(),
            combiner: None,
            reducer: "wordcount".into(),
            input_format: "text".into(),
            output_format: "text".into(),
            properties: Default::default(),
        };
        let req = SubmitJobRequest {
            jar: descriptor.to_package(),
            input: vec![0xff, 0xfe, b'\n'],
        };
        let (status, body) = call(&app, "POST", wire::JOBS, Body::from(serde_json::to_vec(&req).unwrap())).await;
        assert_eq!(status, StatusCode::OK);
        let id: JobId = serde_json::from_slice(&body).unwrap();

        let split = node
            .fs()
            .read(&format!("{}/input/split-00000", id.qualified()))
            .await
            .unwrap();
        assert_eq!(split, vec![0xff, 0xfe, b'\n']);
    }
}
