//! Values passed between pipeline stages, and the terminal outcome.

use crate::services::pipeline::PipelineError;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::{fmt, str::Utf8Error};

/// Identifies the object an event is about. The key is always decoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub bucket: String,
    pub key: String,
}

impl ObjectReference {
    /// Build a reference from a notification's bucket and form-encoded key.
    pub fn from_event(bucket: impl Into<String>, raw_key: &str) -> Result<Self, Utf8Error> {
        Ok(Self {
            bucket: bucket.into(),
            key: decode_key(raw_key)?,
        })
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Decode a notification key: `+` is a space, then `%XX` escapes.
///
/// A literal plus arrives as `%2B`, so substituting before percent-decoding
/// is safe.
pub fn decode_key(raw: &str) -> Result<String, Utf8Error> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
}

/// Raster formats the pipeline knows how to recompress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    /// Format an extension (without dot, any case) stands for.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Png => f.write_str("PNG"),
            ImageFormat::Jpeg => f.write_str("JPEG"),
        }
    }
}

/// Full object body as fetched.
#[derive(Clone, Debug)]
pub struct ObjectPayload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OptimizationResult {
    pub bytes: Bytes,
    pub original_size: u64,
    pub optimized_size: u64,
}

impl OptimizationResult {
    pub fn new(original_size: u64, bytes: Bytes) -> Self {
        Self {
            optimized_size: bytes.len() as u64,
            original_size,
            bytes,
        }
    }

    pub fn is_smaller(&self) -> bool {
        self.optimized_size < self.original_size
    }

    /// Relative reduction in percent, rounded to two decimals.
    pub fn savings_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        let saved = self.original_size as f64 - self.optimized_size as f64;
        let percent = saved * 100.0 / self.original_size as f64;
        (percent * 100.0).round() / 100.0
    }
}

/// Terminal result of one invocation. Exactly one is produced per run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Rejected(String),
    Skipped(String),
    Committed(f64),
    Discarded(String),
    Failed(PipelineError),
}

impl PipelineOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineOutcome::Rejected(_) => "rejected",
            PipelineOutcome::Skipped(_) => "skipped",
            PipelineOutcome::Committed(_) => "committed",
            PipelineOutcome::Discarded(_) => "discarded",
            PipelineOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PipelineOutcome::Failed(_))
    }

    /// Human-readable one-liner reported back to the caller.
    pub fn describe(&self) -> String {
        match self {
            PipelineOutcome::Rejected(reason)
            | PipelineOutcome::Skipped(reason)
            | PipelineOutcome::Discarded(reason) => reason.clone(),
            PipelineOutcome::Committed(savings) => format!("optimized, saved {:.2}%", savings),
            PipelineOutcome::Failed(err) => err.to_string(),
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.describe())
    }
}

impl From<PipelineError> for PipelineOutcome {
    fn from(err: PipelineError) -> Self {
        PipelineOutcome::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_form_encoded_keys() {
        assert_eq!(decode_key("my%20photo.png").unwrap(), "my photo.png");
        assert_eq!(decode_key("my+photo.png").unwrap(), "my photo.png");
        assert_eq!(decode_key("a%2Bb.png").unwrap(), "a+b.png");
        assert_eq!(
            decode_key("dir/%E2%9C%93.png").unwrap(),
            "dir/\u{2713}.png"
        );
        assert!(decode_key("bad%FF.png").is_err());
    }

    #[test]
    fn two_encodings_resolve_to_the_same_reference() {
        let a = ObjectReference::from_event("b", "my+photo.png").unwrap();
        let b = ObjectReference::from_event("b", "my%20photo.png").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn references_render_as_bucket_slash_key() {
        let reference = ObjectReference::from_event("assets", "img/my+photo.png").unwrap();
        assert_eq!(reference.to_string(), "assets/img/my photo.png");
    }

    #[test]
    fn pipeline_errors_become_failed_outcomes() {
        use crate::services::storage_service::StorageError;

        let outcome = PipelineOutcome::from(PipelineError::from(StorageError::InvalidObjectKey));
        assert!(outcome.is_failure());
        assert_eq!(outcome.to_string(), "failed: storage fault: invalid object key");
    }

    #[test]
    fn savings_are_rounded_to_two_decimals() {
        let result = OptimizationResult::new(1000, Bytes::from(vec![0; 700]));
        assert_eq!(result.savings_percent(), 30.0);
        assert!(result.is_smaller());

        let result = OptimizationResult::new(3, Bytes::from(vec![0; 2]));
        assert_eq!(result.savings_percent(), 33.33);

        let result = OptimizationResult::new(0, Bytes::new());
        assert_eq!(result.savings_percent(), 0.0);
        assert!(!result.is_smaller());
    }

    #[test]
    fn extensions_map_to_formats() {
        assert_eq!(ImageFormat::from_extension("PNG"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_extension("jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("gif"), None);
    }
}
