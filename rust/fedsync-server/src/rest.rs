//! A HTTP API for starting and observing tasks.
//!
//! Every response body is JSON. Failed requests are answered with `{"error": "<message>"}` and a
//! matching status code.

use std::{convert::Infallible, fmt::Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use warp::{
    filters::body::BodyDeserializeError,
    http::StatusCode,
    reject::MethodNotAllowed,
    reply::{Json, WithStatus},
    Filter,
};

use crate::{
    orchestrator::{Orchestrator, StartError, SyncRequest, TrainingRequest},
    runtime::{TrainingExample, TrainingSettings},
    settings::ApiSettings,
    tasks::{TaskError, TaskId, TaskKind},
};
use fedsync_core::SyncFrequency;

/// The privacy parameters of a sync request. Missing values are taken from the settings.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PrivacyParams {
    pub epsilon: Option<f64>,
    pub delta: Option<f64>,
    pub clip_norm: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SyncBody {
    #[serde(default)]
    pub privacy_settings: PrivacyParams,
    #[serde(default)]
    pub sync_frequency: SyncFrequency,
}

impl From<SyncBody> for SyncRequest {
    fn from(body: SyncBody) -> Self {
        Self {
            epsilon: body.privacy_settings.epsilon,
            delta: body.privacy_settings.delta,
            clip_norm: body.privacy_settings.clip_norm,
            frequency: body.sync_frequency,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainBody {
    #[serde(default)]
    pub training_data: Vec<TrainingExample>,
    #[serde(default)]
    pub settings: TrainingSettings,
}

impl From<TrainBody> for TrainingRequest {
    fn from(body: TrainBody) -> Self {
        Self {
            examples: body.training_data,
            settings: body.settings,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadBody {
    pub model_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStarted {
    pub message: String,
    pub sync_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrainingStarted {
    pub message: String,
    pub training_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadStarted {
    pub message: String,
    pub download_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Builds the routes of the API.
pub fn routes(
    orchestrator: Orchestrator,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    let start_sync = warp::path!("api" / "sync")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_start_sync);

    let sync_progress = warp::path!("api" / "sync" / TaskId / "progress")
        .and(warp::get())
        .and(with_kind(TaskKind::Sync))
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_progress);

    let sync_schedule = warp::path!("api" / "sync" / "schedule")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_schedule);

    let sync_status = warp::path!("api" / "sync" / "status")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_sync_status);

    let start_training = warp::path!("api" / "train")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_start_training);

    let training_progress = warp::path!("api" / "train" / TaskId / "progress")
        .and(warp::get())
        .and(with_kind(TaskKind::Training))
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_progress);

    let training_stats = warp::path!("api" / "train" / "stats")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_training_stats);

    let start_download = warp::path!("api" / "model" / "download")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_start_download);

    let download_progress = warp::path!("api" / "model" / "download" / TaskId / "progress")
        .and(warp::get())
        .and(with_kind(TaskKind::Download))
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_progress);

    let model_status = warp::path!("api" / "model" / "status")
        .and(warp::get())
        .and(with_orchestrator(orchestrator))
        .and_then(handle_model_status);

    start_sync
        .or(sync_progress)
        .or(sync_schedule)
        .or(sync_status)
        .or(start_training)
        .or(training_progress)
        .or(training_stats)
        .or(start_download)
        .or(download_progress)
        .or(model_status)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Starts a HTTP server at the configured address.
///
/// # Errors
/// Fails if the server can't be bound to the address.
pub async fn serve(api_settings: ApiSettings, orchestrator: Orchestrator) -> Result<(), RestError> {
    let (address, server) =
        warp::serve(routes(orchestrator)).try_bind_ephemeral(api_settings.bind_address)?;
    info!("listening on http://{}", address);
    server.await;
    Ok(())
}

/// Handles and responds to a request to start a synchronization.
async fn handle_start_sync(
    body: SyncBody,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.start_sync(body.into()) {
        Ok(sync_id) => json_reply(
            &SyncStarted {
                message: "sync started".into(),
                sync_id,
            },
            StatusCode::OK,
        ),
        Err(err) => start_error_reply(err),
    })
}

/// Handles and responds to a request to start a training run.
async fn handle_start_training(
    body: TrainBody,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.start_training(body.into()) {
        Ok(training_id) => json_reply(
            &TrainingStarted {
                message: "training started".into(),
                training_id,
            },
            StatusCode::OK,
        ),
        Err(err) => start_error_reply(err),
    })
}

/// Handles and responds to a request to download a model.
async fn handle_start_download(
    body: DownloadBody,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.start_download(body.model_id) {
        Ok(download_id) => json_reply(
            &DownloadStarted {
                message: "download started".into(),
                download_id,
            },
            StatusCode::OK,
        ),
        Err(err) => start_error_reply(err),
    })
}

/// Handles and responds to a request for the progress of a task.
async fn handle_progress(
    id: TaskId,
    kind: TaskKind,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.task(id, kind) {
        Ok(task) => json_reply(&task, StatusCode::OK),
        Err(err @ TaskError::NotFound(_)) => error_reply(err, StatusCode::NOT_FOUND),
        Err(err) => internal_error_reply(err),
    })
}

/// Handles and responds to a request for the synchronization schedule.
async fn handle_schedule(orchestrator: Orchestrator) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.schedule().await {
        Ok(schedule) => json_reply(&schedule, StatusCode::OK),
        Err(err) => internal_error_reply(err),
    })
}

/// Handles and responds to a request for the synchronization status.
async fn handle_sync_status(orchestrator: Orchestrator) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.sync_status().await {
        Ok(status) => json_reply(&status, StatusCode::OK),
        Err(err) => internal_error_reply(err),
    })
}

/// Handles and responds to a request for the training statistics.
async fn handle_training_stats(orchestrator: Orchestrator) -> Result<impl warp::Reply, Infallible> {
    Ok(match orchestrator.training_stats().await {
        Ok(stats) => json_reply(&stats, StatusCode::OK),
        Err(err) => internal_error_reply(err),
    })
}

/// Handles and responds to a request for the status of the active model.
async fn handle_model_status(orchestrator: Orchestrator) -> Result<impl warp::Reply, Infallible> {
    Ok(json_reply(&orchestrator.model_status(), StatusCode::OK))
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> WithStatus<Json> {
    warp::reply::with_status(warp::reply::json(body), status)
}

fn error_reply(err: impl Display, status: StatusCode) -> WithStatus<Json> {
    json_reply(
        &ErrorBody {
            error: err.to_string(),
        },
        status,
    )
}

fn start_error_reply(err: StartError) -> WithStatus<Json> {
    warn!("failed to start task: {}", err);
    let status = match err {
        StartError::ModelBusy(_) => StatusCode::CONFLICT,
        StartError::InvalidParameter(_)
        | StartError::NoModelLoaded
        | StartError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    };
    error_reply(err, status)
}

fn internal_error_reply(err: impl Display) -> WithStatus<Json> {
    error!("failed to handle request: {:#}", err);
    error_reply(err, StatusCode::INTERNAL_SERVER_ERROR)
}

/// Converts an orchestrator into a `warp` filter.
fn with_orchestrator(
    orchestrator: Orchestrator,
) -> impl Filter<Extract = (Orchestrator,), Error = Infallible> + Clone {
    warp::any().map(move || orchestrator.clone())
}

/// Converts a task kind into a `warp` filter.
fn with_kind(kind: TaskKind) -> impl Filter<Extract = (TaskKind,), Error = Infallible> + Clone {
    warp::any().map(move || kind)
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<WithStatus<Json>, Infallible> {
    let reply = if err.is_not_found() {
        error_reply("not found", StatusCode::NOT_FOUND)
    } else if let Some(body_err) = err.find::<BodyDeserializeError>() {
        error_reply(body_err, StatusCode::BAD_REQUEST)
    } else if err.find::<MethodNotAllowed>().is_some() {
        error_reply("method not allowed", StatusCode::METHOD_NOT_ALLOWED)
    } else {
        error!("unhandled rejection: {:?}", err);
        error_reply("internal server error", StatusCode::INTERNAL_SERVER_ERROR)
    };
    Ok(reply)
}

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("failed to bind the server: {0}")]
    Bind(#[from] warp::Error),
}
