//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> schema, disk and codec checks

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, process::Stdio};
use tokio::{fs, process::Command};
use uuid::Uuid;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// - `sqlite`: the bucket table answers, i.e. the schema is migrated.
/// - `disk`: a probe file can be written, read back and removed under the
///   storage root.
/// - `jpegtran`: the JPEG codec can be launched. Advisory only; PNG
///   optimization does not need it, so it never fails readiness.
///
/// HTTP 200 when every required check passes, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let sqlite = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM buckets")
        .fetch_one(&*state.storage.db)
        .await;
    checks.insert("sqlite", CheckStatus::required(sqlite.map(|_| ())));

    let probe = state
        .storage
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));
    checks.insert("disk", CheckStatus::required(disk_round_trip(&probe).await));

    let jpegtran = Command::new(&state.pipeline.config().jpegtran_bin)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    checks.insert("jpegtran", CheckStatus::advisory(jpegtran.map(|_| ())));

    let ready = checks.values().all(|check| check.ok || !check.required);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
    };
    (status, Json(body))
}

async fn disk_round_trip(path: &std::path::Path) -> std::io::Result<()> {
    fs::write(path, b"readyz").await?;
    let read = fs::read(path).await;
    let _ = fs::remove_file(path).await;
    if read? == b"readyz" {
        Ok(())
    } else {
        Err(std::io::Error::other("file content mismatch"))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    required: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn required<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        Self::from_result(result, true)
    }

    fn advisory<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        Self::from_result(result, false)
    }

    fn from_result<E: std::fmt::Display>(result: Result<(), E>, required: bool) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                required,
                error: None,
            },
            Err(err) => Self {
                ok: false,
                required,
                error: Some(err.to_string()),
            },
        }
    }
}
