#![forbid(unsafe_code)]

//! Axum API in front of the orchestration facade.
//!
//! Every route answers with the same `{success, data | error}` envelope. The
//! facade is synchronous and may block on yt-dlp for a long time, so each call
//! runs on the blocking pool. Authentication is expected to happen in front
//! of this process (reverse proxy); nothing here checks credentials.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{FromRequest, Path as AxumPath, Query, Request, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info};
use tubevault_tools::{
    config::{RuntimeArgs, RuntimeOverrides, resolve_runtime_config},
    error::{CoreError, CoreResult, ErrorKind},
    facade::Orchestrator,
    init_tracing,
    security::{ensure_not_root, ensure_private_dir},
    store::{SettingsPatch, SubscriptionPatch},
};

const API_PREFIX: &str = "/api/youtube";

#[derive(Parser, Debug)]
#[command(name = "backend")]
#[command(about = "HTTP API for downloads, subscriptions and scheduling")]
#[command(version)]
struct BackendArgs {
    #[command(flatten)]
    runtime: RuntimeArgs,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let config = resolve_runtime_config(RuntimeOverrides {
        host: args.host,
        port: args.port,
        ..RuntimeOverrides::from(args.runtime)
    })?;
    ensure_private_dir(&config.data_dir)?;
    let host = parse_host_arg(&config.host)?;

    let orchestrator =
        Orchestrator::from_config(&config).context("initializing orchestrator")?;
    let app = router(AppState {
        orchestrator: Arc::new(orchestrator),
    });

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEVAULT_HOST")
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/download", post(download))
        .route("/download/info", post(video_info))
        .route(
            "/subscriptions",
            get(list_subscriptions).post(add_subscription),
        )
        .route(
            "/subscriptions/{id}",
            patch(update_subscription).delete(remove_subscription),
        )
        .route("/subscriptions/{id}/fetch", post(fetch_now))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/schedule", get(get_schedule).post(update_schedule))
        .route("/logs", get(get_logs))
        .route("/run", post(start_run))
        .route("/tool/update", post(self_update));

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {err}");
    }
}

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

/// A completed call whose outcome is a failure: the record is still returned
/// so callers can see what was probed before things went wrong.
fn failed_outcome<T: Serialize>(message: Option<String>, data: T) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Envelope {
            success: false,
            data: Some(data),
            error: Some(message.unwrap_or_else(|| "operation failed".to_string())),
        }),
    )
        .into_response()
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Duplicate => StatusCode::CONFLICT,
            ErrorKind::Extraction | ErrorKind::Filesystem => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(Envelope::<()> {
                success: false,
                data: None,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections (bad syntax, missing fields, wrong content type)
/// answer with the envelope like every other error.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError {
                status: rejection.status(),
                message: rejection.body_text(),
            }),
        }
    }
}

/// Runs a facade call on the blocking pool.
async fn blocking<T, F>(state: &AppState, call: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Orchestrator) -> CoreResult<T> + Send + 'static,
{
    let orchestrator = state.orchestrator.clone();
    tokio::task::spawn_blocking(move || call(&orchestrator))
        .await
        .map_err(|err| ApiError::internal(format!("worker task failed: {err}")))?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    audio_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    audio_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    #[serde(default)]
    enabled: bool,
    hour: i64,
    minute: i64,
}

#[derive(Debug, Serialize)]
struct ScheduleView {
    enabled: bool,
    hour: u8,
    minute: u8,
    cron_expression: String,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    tail: Option<usize>,
}

async fn download(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DownloadRequest>,
) -> ApiResult<Response> {
    let url = request.url.unwrap_or_default();
    let audio_only = request.audio_only.unwrap_or(false);
    let outcome = blocking(&state, move |orchestrator| {
        orchestrator.download(&url, audio_only)
    })
    .await?;
    if outcome.success {
        Ok(ok(outcome))
    } else {
        Ok(failed_outcome(outcome.error.clone(), outcome))
    }
}

async fn video_info(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<InfoRequest>,
) -> ApiResult<Response> {
    let url = request.url.unwrap_or_default();
    let info = blocking(&state, move |orchestrator| orchestrator.get_video_info(&url)).await?;
    Ok(ok(info))
}

async fn list_subscriptions(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(ok(state.orchestrator.list_subscriptions()))
}

async fn add_subscription(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SubscribeRequest>,
) -> ApiResult<Response> {
    let subscription = blocking(&state, move |orchestrator| {
        orchestrator.add_subscription(
            request.url.as_deref().unwrap_or_default(),
            request.name.as_deref(),
            request.audio_only,
        )
    })
    .await?;
    Ok(ok(subscription))
}

async fn update_subscription(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    ApiJson(patch): ApiJson<SubscriptionPatch>,
) -> ApiResult<Response> {
    let updated = blocking(&state, move |orchestrator| {
        orchestrator.update_subscription(&id, &patch)
    })
    .await?;
    Ok(ok(updated))
}

async fn remove_subscription(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let removed = blocking(&state, move |orchestrator| orchestrator.remove_subscription(&id)).await?;
    Ok(ok(removed))
}

async fn fetch_now(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let outcome = blocking(&state, move |orchestrator| orchestrator.fetch_now(&id)).await?;
    if outcome.success {
        Ok(ok(outcome))
    } else {
        Ok(failed_outcome(outcome.error.clone(), outcome))
    }
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(ok(state.orchestrator.get_settings()))
}

async fn update_settings(
    State(state): State<AppState>,
    ApiJson(patch): ApiJson<SettingsPatch>,
) -> ApiResult<Response> {
    let settings = blocking(&state, move |orchestrator| orchestrator.update_settings(&patch)).await?;
    Ok(ok(settings))
}

fn schedule_view(orchestrator: &Orchestrator) -> ScheduleView {
    let schedule = orchestrator.get_schedule();
    ScheduleView {
        enabled: schedule.enabled,
        hour: schedule.hour,
        minute: schedule.minute,
        cron_expression: schedule.cron_expression(),
    }
}

async fn get_schedule(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(ok(schedule_view(&state.orchestrator)))
}

async fn update_schedule(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ScheduleRequest>,
) -> ApiResult<Response> {
    let view = blocking(&state, move |orchestrator| {
        orchestrator.update_schedule(request.enabled, request.hour, request.minute)?;
        Ok(schedule_view(orchestrator))
    })
    .await?;
    Ok(ok(view))
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let lines = blocking(&state, move |orchestrator| orchestrator.get_logs(query.tail)).await?;
    Ok(ok(lines))
}

/// Starts a manual run in the background; progress lands in the run log.
async fn start_run(State(state): State<AppState>) -> ApiResult<Response> {
    if state.orchestrator.is_running() {
        return Err(ApiError::conflict("a run is already in progress"));
    }
    let orchestrator = state.orchestrator.clone();
    tokio::task::spawn_blocking(move || {
        let report = orchestrator.run_now();
        info!(
            status = ?report.status,
            downloaded = report.downloaded(),
            "manual run from API finished"
        );
    });
    Ok(ok(serde_json::json!({ "status": "started" })))
}

async fn self_update(State(state): State<AppState>) -> ApiResult<Response> {
    let message = blocking(&state, |orchestrator| orchestrator.self_update()).await?;
    Ok(ok(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::{Value, json};
    use tempfile::{TempDir, tempdir};
    use tubevault_tools::{
        archive::MemoryArchive,
        extractor::{
            ChannelEntry, ExtractOutput, ExtractRequest, Extractor, ExtractorError, VideoMetadata,
        },
        facade::OrchestratorOptions,
    };

    /// Resolves every probe to one fixed video and fails every download.
    struct OfflineExtractor;

    impl Extractor for OfflineExtractor {
        fn probe(&self, _url: &str) -> Result<VideoMetadata, ExtractorError> {
            Ok(VideoMetadata {
                id: "offline0001".into(),
                title: Some("Offline".into()),
                channel: Some("Offline Channel".into()),
                channel_id: Some("UCOFFLINE".into()),
                ..VideoMetadata::default()
            })
        }

        fn list_recent(
            &self,
            _channel_url: &str,
            _limit: usize,
        ) -> Result<Vec<ChannelEntry>, ExtractorError> {
            Ok(Vec::new())
        }

        fn extract(&self, _request: &ExtractRequest) -> Result<ExtractOutput, ExtractorError> {
            Err(ExtractorError::Failed {
                program: "yt-dlp".into(),
                status: "exit status: 1".into(),
                diagnostic: "ERROR: unable to download video data: HTTP Error 403".into(),
            })
        }

        fn self_update(&self) -> Result<String, ExtractorError> {
            Ok("yt-dlp is up to date".into())
        }
    }

    fn test_state() -> (TempDir, AppState) {
        let temp = tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(OfflineExtractor),
            Arc::new(MemoryArchive::new()),
            OrchestratorOptions {
                data_dir: temp.path().join("data"),
                download_root: temp.path().join("nas"),
                media_library: None,
                listing_limit: 10,
                workers: 1,
            },
        );
        (
            temp,
            AppState {
                orchestrator: Arc::new(orchestrator),
            },
        )
    }

    async fn body_of(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn subscribe_request(url: &str) -> ApiJson<SubscribeRequest> {
        ApiJson(SubscribeRequest {
            url: Some(url.into()),
            name: None,
            audio_only: Some(true),
        })
    }

    #[tokio::test]
    async fn subscriptions_use_the_envelope_and_reject_duplicates() {
        let (_temp, state) = test_state();
        let response = add_subscription(
            State(state.clone()),
            subscribe_request("https://www.youtube.com/channel/UCXYZ"),
        )
        .await
        .into_response();
        let (status, body) = body_of(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["id"], json!("UCXYZ"));
        assert_eq!(body["data"]["audio_only"], json!(true));

        let response = add_subscription(
            State(state.clone()),
            subscribe_request("https://www.youtube.com/channel/UCXYZ/videos"),
        )
        .await
        .into_response();
        let (status, body) = body_of(response).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("already subscribed"));

        let (_, body) = body_of(list_subscriptions(State(state)).await.into_response()).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schedule_validation_is_a_bad_request() {
        let (_temp, state) = test_state();
        let response = update_schedule(
            State(state.clone()),
            ApiJson(ScheduleRequest {
                enabled: true,
                hour: 24,
                minute: 0,
            }),
        )
        .await
        .into_response();
        let (status, body) = body_of(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Hour must be between 0 and 23"));

        let (_, body) = body_of(get_schedule(State(state)).await.into_response()).await;
        assert_eq!(body["data"]["hour"], json!(2));
        assert_eq!(body["data"]["cron_expression"], json!("0 2 * * *"));
    }

    #[tokio::test]
    async fn settings_reconcile_through_the_api() {
        let (_temp, state) = test_state();
        let response = update_settings(
            State(state),
            ApiJson(SettingsPatch {
                quality_preset: Some("best".into()),
                ..SettingsPatch::default()
            }),
        )
        .await
        .into_response();
        let (status, body) = body_of(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["format_expression"], json!("best"));
        assert_eq!(body["data"]["quality_preset"], json!("best"));
    }

    #[tokio::test]
    async fn missing_url_is_rejected_before_any_call() {
        let (_temp, state) = test_state();
        let response = download(
            State(state),
            ApiJson(DownloadRequest {
                url: None,
                audio_only: None,
            }),
        )
        .await
        .into_response();
        let (status, body) = body_of(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Missing required field: url"));
    }

    #[tokio::test]
    async fn failed_download_reports_error_and_record() {
        let (_temp, state) = test_state();
        let response = download(
            State(state.clone()),
            ApiJson(DownloadRequest {
                url: Some("https://www.youtube.com/watch?v=offline0001".into()),
                audio_only: Some(false),
            }),
        )
        .await
        .into_response();
        let (status, body) = body_of(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("HTTP Error 403"));
        assert_eq!(body["data"]["error_kind"], json!("extraction"));
        assert_eq!(body["data"]["title"], json!("Offline"));

        let (_, logs) = body_of(
            get_logs(State(state), Query(LogsQuery { tail: Some(1) }))
                .await
                .into_response(),
        )
        .await;
        assert!(
            logs["data"][0]
                .as_str()
                .unwrap()
                .contains("Manual download: failed Offline")
        );
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let (_temp, state) = test_state();
        let response = remove_subscription(State(state.clone()), AxumPath("nope".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = fetch_now(State(state), AxumPath("nope".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn json_request(body: &'static str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn malformed_bodies_are_answered_with_the_envelope() {
        let Err(rejection) =
            ApiJson::<ScheduleRequest>::from_request(json_request(r#"{"hour": 3}"#), &()).await
        else {
            panic!("a schedule without a minute must be rejected");
        };
        let (status, body) = body_of(rejection.into_response()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("minute"));

        let Err(rejection) =
            ApiJson::<DownloadRequest>::from_request(json_request("{not json"), &()).await
        else {
            panic!("invalid JSON must be rejected");
        };
        let (status, body) = body_of(rejection.into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));

        let Ok(ApiJson(request)) = ApiJson::<ScheduleRequest>::from_request(
            json_request(r#"{"enabled": true, "hour": 4, "minute": 15}"#),
            &(),
        )
        .await
        else {
            panic!("a complete schedule must be accepted");
        };
        assert_eq!((request.hour, request.minute), (4, 15));
    }

    #[tokio::test]
    async fn self_update_passes_through() {
        let (_temp, state) = test_state();
        let (status, body) = body_of(self_update(State(state)).await.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!("yt-dlp is up to date"));
    }

    #[test]
    fn routes_are_nested_under_the_api_prefix() {
        let (_temp, state) = test_state();
        // Building the router validates every path pattern.
        let _ = router(state);
        assert_eq!(API_PREFIX, "/api/youtube");
    }

    #[test]
    fn host_argument_must_be_an_ip() {
        assert!(parse_host_arg("127.0.0.1").is_ok());
        assert!(parse_host_arg("localhost").is_err());
    }
}
