//! Lossless recompression of PNG and JPEG payloads.
//!
//! The pipeline only sees the [`ImageOptimizer`] trait. [`CodecOptimizer`] is
//! the production implementation: oxipng in-process for PNG, and `jpegtran`
//! as a child process for JPEG.

use crate::models::pipeline::ImageFormat;
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, process::Stdio};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{format} codec rejected the image: {message}")]
    Codec { format: ImageFormat, message: String },
    #[error("{format} codec produced no output")]
    EmptyOutput { format: ImageFormat },
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("optimizer worker stopped: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type TransformResult<T> = Result<T, TransformError>;

/// Format-specific lossless optimizers.
#[async_trait]
pub trait ImageOptimizer: Send + Sync {
    async fn optimize_png(&self, bytes: Bytes, level: u8) -> TransformResult<Bytes>;

    async fn optimize_jpeg(&self, bytes: Bytes, progressive: bool) -> TransformResult<Bytes>;
}

/// oxipng's strongest preset. Higher levels are clamped to it.
const OXIPNG_MAX_PRESET: u8 = 6;

#[derive(Clone, Debug)]
pub struct CodecOptimizer {
    jpegtran_bin: String,
}

impl CodecOptimizer {
    pub fn new(jpegtran_bin: impl Into<String>) -> Self {
        Self {
            jpegtran_bin: jpegtran_bin.into(),
        }
    }
}

#[async_trait]
impl ImageOptimizer for CodecOptimizer {
    async fn optimize_png(&self, bytes: Bytes, level: u8) -> TransformResult<Bytes> {
        let preset = level.min(OXIPNG_MAX_PRESET);
        let output = tokio::task::spawn_blocking(move || {
            let options = oxipng::Options::from_preset(preset);
            oxipng::optimize_from_memory(&bytes, &options)
        })
        .await?
        .map_err(|err| TransformError::Codec {
            format: ImageFormat::Png,
            message: err.to_string(),
        })?;

        non_empty(ImageFormat::Png, output)
    }

    async fn optimize_jpeg(&self, bytes: Bytes, progressive: bool) -> TransformResult<Bytes> {
        let mut command = Command::new(&self.jpegtran_bin);
        command.args(["-copy", "all", "-optimize"]);
        if progressive {
            command.arg("-progressive");
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_err = |source: io::Error| TransformError::Spawn {
            program: self.jpegtran_bin.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_err)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stdin not captured")))?;

        // Feed stdin concurrently so a full stdout pipe cannot stall the child.
        let feeder = tokio::spawn(async move {
            stdin.write_all(&bytes).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await.map_err(spawn_err)?;
        let fed = feeder.await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransformError::Codec {
                format: ImageFormat::Jpeg,
                message: format!("{} ({})", stderr.trim(), output.status),
            });
        }
        fed_cleanly(fed).map_err(spawn_err)?;

        non_empty(ImageFormat::Jpeg, output.stdout)
    }
}

/// jpegtran may exit before draining its input, e.g. on trailing bytes past
/// the end-of-image marker. After a clean exit a closed pipe is not an error.
fn fed_cleanly(fed: io::Result<()>) -> io::Result<()> {
    match fed {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

fn non_empty(format: ImageFormat, output: Vec<u8>) -> TransformResult<Bytes> {
    if output.is_empty() {
        Err(TransformError::EmptyOutput { format })
    } else {
        Ok(Bytes::from(output))
    }
}
