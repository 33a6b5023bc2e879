use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dispatch::{
    AddExecutionLogEntryRequest, DequeueRequest, HeartbeatRequest, MarkCompleteRequest,
    MarkErroredRequest, MultiQueueDispatcher, SingleQueueDispatcher,
    UpdateExecutionLogEntryRequest,
};
use crate::error::DispatchError;
use crate::scheduler::job::{Job, Record};

/// Error body returned with every 400 and 500 response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// Unparseable request body
    BadRequest(String),
    /// Finalization matched no record owned by the caller
    NotFound,
    Dispatch(DispatchError),
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError::Dispatch(e)
    }
}

impl ApiError {
    /// Mark-* routes report an unowned or missing record as 404.
    fn for_finalize(e: DispatchError) -> Self {
        match e {
            DispatchError::UnknownJob => ApiError::NotFound,
            other => ApiError::Dispatch(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(error) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, Json(serde_json::Value::Null)).into_response(),
            ApiError::Dispatch(e) => {
                tracing::error!(error = %e, "Handler failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: e.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// JSON body extractor that rejects anything unparseable with a 400,
/// whatever the content type header says.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        serde_json::from_slice(&body)
            .map(JsonBody)
            .map_err(|e| ApiError::BadRequest(format!("malformed request body: {e}")))
    }
}

type ApiResult = Result<Response, ApiError>;

fn job_response(job: Option<Job>) -> Response {
    match job {
        Some(job) => Json(job).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Routes for one queue, mounted under `/queue/<name>/`.
pub fn queue_router<R: Record>(dispatcher: Arc<SingleQueueDispatcher<R>>) -> Router {
    let base = format!("/queue/{}", dispatcher.queue_name());

    Router::new()
        .route(&format!("{base}/dequeue"), post(dequeue::<R>))
        .route(
            &format!("{base}/addExecutionLogEntry"),
            post(add_execution_log_entry::<R>),
        )
        .route(
            &format!("{base}/updateExecutionLogEntry"),
            post(update_execution_log_entry::<R>),
        )
        .route(&format!("{base}/markComplete"), post(mark_complete::<R>))
        .route(&format!("{base}/markErrored"), post(mark_errored::<R>))
        .route(&format!("{base}/markFailed"), post(mark_failed::<R>))
        .route(&format!("{base}/heartbeat"), post(heartbeat::<R>))
        .with_state(dispatcher)
}

/// Shared routes for executors polling several queues.
pub fn multi_queue_router(dispatcher: Arc<MultiQueueDispatcher>) -> Router {
    Router::new()
        .route("/queue/dequeue", post(multi_dequeue))
        .route("/queue/heartbeat", post(multi_heartbeat))
        .with_state(dispatcher)
}

async fn dequeue<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<DequeueRequest>,
) -> ApiResult {
    Ok(job_response(dispatcher.dequeue(&req).await?))
}

async fn add_execution_log_entry<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<AddExecutionLogEntryRequest>,
) -> ApiResult {
    let entry_id = dispatcher.add_execution_log_entry(&req).await?;
    Ok(Json(entry_id).into_response())
}

async fn update_execution_log_entry<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<UpdateExecutionLogEntryRequest>,
) -> ApiResult {
    dispatcher.update_execution_log_entry(&req).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn mark_complete<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<MarkCompleteRequest>,
) -> ApiResult {
    dispatcher
        .mark_complete(&req)
        .await
        .map_err(ApiError::for_finalize)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn mark_errored<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<MarkErroredRequest>,
) -> ApiResult {
    dispatcher
        .mark_errored(&req)
        .await
        .map_err(ApiError::for_finalize)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn mark_failed<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<MarkErroredRequest>,
) -> ApiResult {
    dispatcher
        .mark_failed(&req)
        .await
        .map_err(ApiError::for_finalize)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn heartbeat<R: Record>(
    State(dispatcher): State<Arc<SingleQueueDispatcher<R>>>,
    JsonBody(req): JsonBody<HeartbeatRequest>,
) -> ApiResult {
    Ok(Json(dispatcher.heartbeat(&req).await?).into_response())
}

async fn multi_dequeue(
    State(dispatcher): State<Arc<MultiQueueDispatcher>>,
    JsonBody(req): JsonBody<DequeueRequest>,
) -> ApiResult {
    Ok(job_response(dispatcher.dequeue(&req).await?))
}

async fn multi_heartbeat(
    State(dispatcher): State<Arc<MultiQueueDispatcher>>,
    JsonBody(req): JsonBody<HeartbeatRequest>,
) -> ApiResult {
    Ok(Json(dispatcher.heartbeat(&req).await?).into_response())
}
