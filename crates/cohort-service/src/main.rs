//! HTTP delivery for the cohort segmentation engine.
//!
//! Thin adapter: every handler decodes and validates a form, runs the
//! engine call on the blocking pool under the operation timeout, and maps
//! the result (or its error kind) onto a response. The expiration sweeper
//! starts once here and runs for the life of the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use cohort_core::{
    CohortError, CohortResult, EditMemberships, ErrorKind, HistoryQuery, HistoryService,
    NewSegment, NewUser, Segment, SegmentService, Sweeper, User, UserService,
};
use cohort_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cohort-service")]
#[command(about = "HTTP service for the cohort segmentation engine")]
struct Args {
    #[arg(long, default_value = "./cohort.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8001")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 10_000)]
    operation_timeout_ms: u64,
    #[arg(long, default_value_t = cohort_core::DEFAULT_SWEEP_INTERVAL.as_secs())]
    sweep_interval_secs: u64,
    #[arg(long, default_value_t = 5_000)]
    shutdown_grace_ms: u64,
}

#[derive(Clone)]
struct AppState {
    users: UserService<SqliteStore>,
    segments: SegmentService<SqliteStore, SqliteStore>,
    history: HistoryService<SqliteStore>,
    operation_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorPayload {
    code: ErrorKind,
    message: String,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    payload: ErrorPayload,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.payload }))).into_response()
    }
}

/// Exhaustive map from the closed error kind set to a response class.
/// A new kind cannot be added without extending this match.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: &CohortError) -> ServiceFailure {
    let kind = err.kind();
    let message = match kind {
        // Store-level detail stays in the log.
        ErrorKind::Internal => {
            tracing::error!(error = %err, "request failed");
            "internal server error".to_string()
        }
        ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::InvalidInput => {
            tracing::warn!(error = %err, "request rejected");
            err.to_string()
        }
    };

    ServiceFailure {
        status: status_for(kind),
        payload: ErrorPayload { code: kind, message },
    }
}

fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
    tracing::warn!(rejection = %rejection, "invalid request body");
    ServiceFailure {
        status: rejection.status(),
        payload: ErrorPayload {
            code: ErrorKind::InvalidInput,
            message: rejection.body_text(),
        },
    }
}

impl AppState {
    async fn run_blocking<T, F>(
        &self,
        operation: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AppState) -> CohortResult<T> + Send + 'static,
    {
        let state = self.clone();
        let handle = tokio::task::spawn_blocking(move || op(state));

        let joined = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                tracing::error!(operation, "operation timed out");
                failure(&CohortError::internal(operation, "timed out"))
            })?;

        let result = joined.map_err(|err| {
            tracing::error!(operation, error = %err, "operation join failure");
            failure(&CohortError::internal(operation, err))
        })?;

        result.map_err(|err| failure(&err))
    }
}

#[derive(Debug, Clone, Serialize)]
struct UserResponse {
    user: User,
}

#[derive(Debug, Clone, Serialize)]
struct SegmentResponse {
    segment: Segment,
}

#[derive(Debug, Clone, Serialize)]
struct SegmentsResponse {
    segments: Vec<Segment>,
    count: usize,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/user/create", post(user_create))
        .route(
            "/api/v1/user/:id",
            get(user_show).put(user_edit).delete(user_delete),
        )
        .route("/api/v1/user/:id/segments", get(user_segments))
        .route("/api/v1/user/:id/segments/edit", put(user_segments_edit))
        .route("/api/v1/segment/create", post(segment_create))
        .route(
            "/api/v1/segment/:slug",
            get(segment_show).delete(segment_delete),
        )
        .route("/api/v1/history", get(history_export))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn user_create(
    State(state): State<AppState>,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<Json<UserResponse>, ServiceFailure> {
    let Json(form) = payload.map_err(|rejection| invalid_json(&rejection))?;
    form.validate().map_err(|err| failure(&err))?;

    let user = state
        .run_blocking("create user", move |state| state.users.create_user(&form))
        .await?;

    Ok(Json(UserResponse { user }))
}

async fn user_show(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<UserResponse>, ServiceFailure> {
    let user = state
        .run_blocking("get user", move |state| state.users.user_by_id(user_id))
        .await?;

    Ok(Json(UserResponse { user }))
}

async fn user_edit(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<Json<UserResponse>, ServiceFailure> {
    let Json(form) = payload.map_err(|rejection| invalid_json(&rejection))?;
    form.validate().map_err(|err| failure(&err))?;

    let user = state
        .run_blocking("edit user", move |state| {
            state.users.edit_user(user_id, &form)
        })
        .await?;

    Ok(Json(UserResponse { user }))
}

async fn user_delete(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<serde_json::Value>, ServiceFailure> {
    state
        .run_blocking("delete user", move |state| {
            state.users.delete_user(user_id)
        })
        .await?;

    Ok(Json(serde_json::json!({ "deleted": user_id })))
}

async fn user_segments(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<SegmentsResponse>, ServiceFailure> {
    let segments = state
        .run_blocking("list user segments", move |state| {
            state.segments.user_segments(user_id)
        })
        .await?;

    let count = segments.len();
    Ok(Json(SegmentsResponse { segments, count }))
}

async fn user_segments_edit(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    payload: Result<Json<EditMemberships>, JsonRejection>,
) -> Result<Json<SegmentsResponse>, ServiceFailure> {
    let Json(form) = payload.map_err(|rejection| invalid_json(&rejection))?;
    form.validate().map_err(|err| failure(&err))?;

    let segments = state
        .run_blocking("edit user segments", move |state| {
            state.segments.edit_user_segments(user_id, &form)
        })
        .await?;

    let count = segments.len();
    Ok(Json(SegmentsResponse { segments, count }))
}

async fn segment_create(
    State(state): State<AppState>,
    payload: Result<Json<NewSegment>, JsonRejection>,
) -> Result<Json<SegmentResponse>, ServiceFailure> {
    let Json(form) = payload.map_err(|rejection| invalid_json(&rejection))?;
    form.validate().map_err(|err| failure(&err))?;

    let segment = state
        .run_blocking("create segment", move |state| {
            state.segments.create_segment(&form)
        })
        .await?;

    Ok(Json(SegmentResponse { segment }))
}

async fn segment_show(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<SegmentResponse>, ServiceFailure> {
    let segment = state
        .run_blocking("get segment", move |state| {
            state.segments.segment_by_slug(&slug)
        })
        .await?;

    Ok(Json(SegmentResponse { segment }))
}

async fn segment_delete(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceFailure> {
    let deleted = slug.clone();
    state
        .run_blocking("delete segment", move |state| {
            state.segments.delete_segment(&slug)
        })
        .await?;

    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn history_export(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ServiceFailure> {
    let export = state
        .run_blocking("export history", move |state| {
            state.history.month_csv(&query)
        })
        .await?;

    let disposition = format!("attachment; filename=\"{}\"", export.file_name);
    Ok((
        StatusCode::OK,
        [
            ("content-type", "text/csv; charset=utf-8".to_string()),
            ("content-disposition", disposition),
        ],
        export.csv,
    )
        .into_response())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "failed to listen for shutdown signal"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let store = Arc::new(SqliteStore::open(&args.db)?);
    store.migrate()?;

    // Process-lifetime background task; the handle is held so the worker is
    // only torn down when main returns. It is not drained on shutdown.
    let _sweeper = Sweeper::start(
        Arc::clone(&store),
        Duration::from_secs(args.sweep_interval_secs),
    )?;

    let state = AppState {
        users: UserService::new(Arc::clone(&store)),
        segments: SegmentService::new(Arc::clone(&store), Arc::clone(&store)),
        history: HistoryService::new(Arc::clone(&store)),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
    };

    // In-flight requests get a bounded grace period after the signal, then
    // the process goes down hard, matching the delivery contract.
    let grace = Duration::from_millis(args.shutdown_grace_ms);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tokio::time::sleep(grace).await;
            tracing::error!("shutdown grace period expired, terminating");
            std::process::exit(1);
        }
    });

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "server started");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let store = Arc::new(must(SqliteStore::open(&dir.path().join("cohort.sqlite3"))));
        must(store.migrate());
        AppState {
            users: UserService::new(Arc::clone(&store)),
            segments: SegmentService::new(Arc::clone(&store), Arc::clone(&store)),
            history: HistoryService::new(Arc::clone(&store)),
            operation_timeout: Duration::from_millis(2_500),
        }
    }

    fn temp_dir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        }
    }

    async fn request(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        let bytes = must(serde_json::to_vec(body));
        must(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(bytes)),
        )
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        must(Request::builder().method(method).uri(uri).body(Body::empty()))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = must(to_bytes(response.into_body(), 1024 * 1024).await);
        must(serde_json::from_slice(&bytes))
    }

    #[test]
    fn every_error_kind_maps_to_a_status() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorKind::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let wrapped = failure(&CohortError::internal(
            "insert user",
            "disk I/O error at offset 42",
        ));
        assert_eq!(wrapped.payload.message, "internal server error");
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let dir = temp_dir();
        let router = app(test_state(&dir));

        let response = request(router, empty_request("GET", "/api/v1/health")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn user_lifecycle_over_http() {
        let dir = temp_dir();
        let state = test_state(&dir);

        let created = request(
            app(state.clone()),
            json_request(
                "POST",
                "/api/v1/user/create",
                &serde_json::json!({
                    "username": "ada",
                    "firstName": "Ada",
                    "lastName": "Lovelace"
                }),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);
        let value = response_json(created).await;
        let user_id = value["user"]["userID"].clone();
        assert_eq!(value["user"]["username"], "ada");

        let shown = request(
            app(state.clone()),
            empty_request("GET", &format!("/api/v1/user/{user_id}")),
        )
        .await;
        assert_eq!(shown.status(), StatusCode::OK);

        let conflict = request(
            app(state),
            json_request(
                "POST",
                "/api/v1/user/create",
                &serde_json::json!({
                    "username": "ada",
                    "firstName": "Other",
                    "lastName": "Person"
                }),
            ),
        )
        .await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let value = response_json(conflict).await;
        assert_eq!(value["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn unknown_user_is_404_and_bad_percent_is_400() {
        let dir = temp_dir();
        let state = test_state(&dir);

        let missing = request(
            app(state.clone()),
            empty_request("GET", "/api/v1/user/404/segments"),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid = request(
            app(state),
            json_request(
                "POST",
                "/api/v1/segment/create",
                &serde_json::json!({ "slug": "beta", "percent": 0 }),
            ),
        )
        .await;
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        let value = response_json(invalid).await;
        assert_eq!(value["error"]["code"], "invalid_input");
    }

    #[tokio::test]
    async fn membership_edit_flow_over_http() {
        let dir = temp_dir();
        let state = test_state(&dir);

        let created = request(
            app(state.clone()),
            json_request(
                "POST",
                "/api/v1/user/create",
                &serde_json::json!({
                    "username": "ada",
                    "firstName": "Ada",
                    "lastName": "Lovelace"
                }),
            ),
        )
        .await;
        let user_id = response_json(created).await["user"]["userID"].clone();

        for slug in ["a", "b"] {
            let response = request(
                app(state.clone()),
                json_request(
                    "POST",
                    "/api/v1/segment/create",
                    &serde_json::json!({ "slug": slug, "percent": null }),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let first = request(
            app(state.clone()),
            json_request(
                "PUT",
                &format!("/api/v1/user/{user_id}/segments/edit"),
                &serde_json::json!({
                    "segmentsToAdd": [{ "segmentSlug": "a", "until": null }],
                    "segmentsToRemove": []
                }),
            ),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = request(
            app(state.clone()),
            json_request(
                "PUT",
                &format!("/api/v1/user/{user_id}/segments/edit"),
                &serde_json::json!({
                    "segmentsToAdd": [{ "segmentSlug": "b", "until": "2030-06-01 15:00" }],
                    "segmentsToRemove": ["a"]
                }),
            ),
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
        let value = response_json(second).await;
        assert_eq!(value["count"], 1);
        assert_eq!(value["segments"][0]["slug"], "b");

        let history = request(
            app(state),
            empty_request(
                "GET",
                &format!(
                    "/api/v1/history?year={}&month={}",
                    cohort_core::now_utc().year(),
                    u8::from(cohort_core::now_utc().month())
                ),
            ),
        )
        .await;
        assert_eq!(history.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_until_is_rejected_before_the_engine_runs() {
        let dir = temp_dir();
        let state = test_state(&dir);

        let created = request(
            app(state.clone()),
            json_request(
                "POST",
                "/api/v1/user/create",
                &serde_json::json!({
                    "username": "ada",
                    "firstName": "Ada",
                    "lastName": "Lovelace"
                }),
            ),
        )
        .await;
        let user_id = response_json(created).await["user"]["userID"].clone();

        let response = request(
            app(state),
            json_request(
                "PUT",
                &format!("/api/v1/user/{user_id}/segments/edit"),
                &serde_json::json!({
                    "segmentsToAdd": [{ "segmentSlug": "beta", "until": "June 1st" }],
                    "segmentsToRemove": []
                }),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
