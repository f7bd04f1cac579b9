//! `POST /_events`: the invocation boundary.
//!
//! Each notification runs the pipeline once and is answered once: 200 for
//! every non-failing outcome, 500 when the run failed.

use crate::{
    errors::AppError,
    models::{event::EventNotification, pipeline::PipelineOutcome},
    services::pipeline::Pipeline,
};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub async fn handle_event(
    State(pipeline): State<Pipeline>,
    Json(event): Json<EventNotification>,
) -> Result<Response, AppError> {
    let record = event
        .first_record()
        .ok_or_else(|| AppError::bad_request("event notification carries no records"))?;
    if event.records.len() > 1 {
        tracing::warn!(
            "notification carries {} records; only the first is processed",
            event.records.len()
        );
    }

    if let Some(size) = record.s3.object.size {
        tracing::debug!("notification reports {} bytes", size);
    }

    let outcome = pipeline
        .run(&record.s3.bucket.name, &record.s3.object.key)
        .await;

    let status = if outcome.is_failure() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    let mut body = json!({
        "outcome": outcome.kind(),
        "message": outcome.describe(),
    });
    if let PipelineOutcome::Committed(savings) = outcome {
        body["savings_percent"] = json!(savings);
    }

    Ok((status, Json(body)).into_response())
}
