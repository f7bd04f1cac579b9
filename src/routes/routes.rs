//! Defines routes for the optimizer service.
//!
//! ## Structure
//! - **Invocation**
//!   - `POST   /_events` — run the pipeline for an S3 event notification
//!
//! - **Bucket-level endpoints**
//!   - `PUT    /{bucket}` — create bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` — upload object
//!   - `GET    /{bucket}/{*key}` — download object
//!   - `HEAD   /{bucket}/{*key}` — retrieve metadata only
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.png`. Bucket
//! names cannot start with `_`, so `/_events` never shadows a bucket.

use crate::{
    handlers::{
        event_handlers::handle_event,
        health_handlers::{healthz, readyz},
        object_handlers::{create_bucket, get_object, head_object, upload_object},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router carrying `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/_events", post(handle_event))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(upload_object).get(get_object).head(head_object),
        )
        // Bucket-level routes
        .route("/{bucket}", put(create_bucket))
}
