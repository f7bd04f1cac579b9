//! The optimization pipeline: format gate → eligibility → fetch → transform →
//! commit decision.
//!
//! Every stage returns `Result<T, PipelineOutcome>`; `Err` carries the
//! terminal outcome and `?` stops the run there. A run yields exactly one
//! outcome and the only side effect it can leave behind is the commit write.

use crate::{
    config::OptimConfig,
    models::{
        metadata::{OPTIMIZED_TAG, OPTIMIZED_VALUE, ObjectMetadata},
        pipeline::{ImageFormat, ObjectPayload, ObjectReference, OptimizationResult, PipelineOutcome},
    },
    services::{
        optimizer::{ImageOptimizer, TransformError},
        storage_service::StorageError,
        store::{ObjectStore, PutObject},
    },
};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DISCARD_REASON: &str = "optimized file not smaller than original";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage fault: {0}")]
    Storage(#[from] StorageError),
    #[error("transform fault: {0}")]
    Transform(#[from] TransformError),
}

type Stage<T> = Result<T, PipelineOutcome>;

/// Runs one object through the stages. Cheap to clone; holds no mutable state.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    optimizer: Arc<dyn ImageOptimizer>,
    config: Arc<OptimConfig>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        optimizer: Arc<dyn ImageOptimizer>,
        config: Arc<OptimConfig>,
    ) -> Self {
        Self {
            store,
            optimizer,
            config,
        }
    }

    pub fn config(&self) -> &OptimConfig {
        &self.config
    }

    /// Process the object named by a notification (`raw_key` still encoded).
    pub async fn run(&self, bucket: &str, raw_key: &str) -> PipelineOutcome {
        let span = info_span!("optimize", bucket = %bucket, key = %raw_key);
        async move {
            let outcome = match self.drive(bucket, raw_key).await {
                Ok(outcome) | Err(outcome) => outcome,
            };
            match &outcome {
                PipelineOutcome::Failed(err) => error!("optimization failed: {}", err),
                other => info!("{}", other),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, bucket: &str, raw_key: &str) -> Stage<PipelineOutcome> {
        let (reference, format) = self.format_gate(bucket, raw_key)?;
        let meta = self.check_eligibility(&reference).await?;
        let ObjectPayload {
            bytes,
            content_type,
        } = self.fetch(&reference).await?;
        let result = self.transform(format, bytes).await?;
        let content_type = content_type.or_else(|| meta.content_type.clone());
        self.commit(&reference, meta, content_type, result).await
    }

    /// Decode the key and match it against the configured extensions.
    fn format_gate(&self, bucket: &str, raw_key: &str) -> Stage<(ObjectReference, ImageFormat)> {
        let reference = ObjectReference::from_event(bucket, raw_key).map_err(|err| {
            info!("Key is not valid UTF-8 once decoded: {}", err);
            PipelineOutcome::Rejected("object key is not valid UTF-8".into())
        })?;

        info!("BUCKET: {}", reference.bucket);
        info!("KEY: {}", reference.key);

        match self.config.format_for(&reference.key) {
            Some(format) => {
                info!("Detected {} image", format);
                Ok((reference, format))
            }
            None => {
                info!("Not a supported image");
                Err(PipelineOutcome::Rejected(format!(
                    "`{}` is not a supported image",
                    reference.key
                )))
            }
        }
    }

    /// Head probe plus the already-optimized and size predicates.
    async fn check_eligibility(&self, reference: &ObjectReference) -> Stage<ObjectMetadata> {
        let meta = self
            .store
            .head_object(&reference.bucket, &reference.key)
            .await
            .map_err(failed)?;

        info!("File size is {} bytes", meta.content_length);

        if meta.is_optimized() {
            if self.config.enforce_already_optimized_skip {
                info!("Image is already optimized. Skipping.");
                return Err(PipelineOutcome::Skipped("image is already optimized".into()));
            }
            info!("Image is tagged as optimized; skip enforcement is off, reprocessing");
        }

        if let Some(max) = self.config.max_source_size {
            if meta.content_length > max {
                info!("Image is larger than configured threshold ({} bytes). Skipping.", max);
                return Err(PipelineOutcome::Skipped(format!(
                    "image is larger than {} bytes",
                    max
                )));
            }
        }

        Ok(meta)
    }

    async fn fetch(&self, reference: &ObjectReference) -> Stage<ObjectPayload> {
        let payload = self
            .store
            .get_object(&reference.bucket, &reference.key)
            .await
            .map_err(failed)?;
        debug!("Got {} ({} bytes)", reference, payload.bytes.len());
        Ok(payload)
    }

    async fn transform(&self, format: ImageFormat, bytes: Bytes) -> Stage<OptimizationResult> {
        let original_size = bytes.len() as u64;
        let optimized = match format {
            ImageFormat::Png => {
                self.optimizer
                    .optimize_png(bytes, self.config.png_level)
                    .await
            }
            ImageFormat::Jpeg => {
                self.optimizer
                    .optimize_jpeg(bytes, self.config.jpeg_progressive)
                    .await
            }
        }
        .map_err(failed)?;

        let result = OptimizationResult::new(original_size, optimized);
        info!(
            "Optimized! Final file size is {} bytes (was {})",
            result.optimized_size, result.original_size
        );
        Ok(result)
    }

    /// Persist the result if it is smaller, tagged so it is never reprocessed.
    async fn commit(
        &self,
        reference: &ObjectReference,
        meta: ObjectMetadata,
        content_type: Option<String>,
        result: OptimizationResult,
    ) -> Stage<PipelineOutcome> {
        if !result.is_smaller() {
            warn!(
                "Optimized file is {} bytes, original {}; not writing",
                result.optimized_size, result.original_size
            );
            return Ok(PipelineOutcome::Discarded(DISCARD_REASON.into()));
        }

        let savings = result.savings_percent();
        let mut custom_tags = meta.custom_tags;
        custom_tags.insert(OPTIMIZED_TAG.into(), OPTIMIZED_VALUE.into());

        let destination = self.config.destination_for(&reference.bucket).to_string();
        self.store
            .put_object(PutObject {
                bucket: destination.clone(),
                key: reference.key.clone(),
                body: result.bytes,
                content_type,
                custom_tags,
                storage_class: meta.storage_class,
                acl: self.config.acl,
            })
            .await
            .map_err(failed)?;

        info!("done! wrote {}/{}", destination, reference.key);
        Ok(PipelineOutcome::Committed(savings))
    }
}

fn failed(err: impl Into<PipelineError>) -> PipelineOutcome {
    PipelineOutcome::from(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::object::CannedAcl,
        services::{optimizer::TransformResult, storage_service::StorageService},
    };
    use async_trait::async_trait;
    use std::{
        collections::{BTreeMap, HashMap},
        sync::Mutex,
    };
    use tempfile::TempDir;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Head(String, String),
        Get(String, String),
        Put(String, String),
    }

    /// In-memory store that records every call it receives.
    #[derive(Default)]
    struct RecordingStore {
        objects: Mutex<HashMap<(String, String), (ObjectMetadata, Bytes)>>,
        calls: Mutex<Vec<Call>>,
        puts: Mutex<Vec<PutObject>>,
        fail_get: bool,
        fail_put: bool,
    }

    impl RecordingStore {
        fn with_object(bucket: &str, key: &str, size: usize, tags: &[(&str, &str)]) -> Self {
            let store = Self::default();
            let meta = ObjectMetadata {
                content_length: size as u64,
                content_type: Some("image/png".into()),
                storage_class: "STANDARD_IA".into(),
                custom_tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            store.objects.lock().unwrap().insert(
                (bucket.to_string(), key.to_string()),
                (meta, Bytes::from(vec![7u8; size])),
            );
            store
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn puts(&self) -> Vec<PutObject> {
            self.puts.lock().unwrap().clone()
        }

        fn lookup(&self, bucket: &str, key: &str) -> Result<(ObjectMetadata, Bytes), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| StorageError::ObjectNotFound {
                    bucket: bucket.into(),
                    key: key.into(),
                })
        }
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Head(bucket.into(), key.into()));
            self.lookup(bucket, key).map(|(meta, _)| meta)
        }

        async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectPayload, StorageError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Get(bucket.into(), key.into()));
            if self.fail_get {
                return Err(StorageError::Io(std::io::Error::other("connection reset")));
            }
            self.lookup(bucket, key).map(|(meta, bytes)| ObjectPayload {
                bytes,
                content_type: meta.content_type,
            })
        }

        async fn put_object(&self, request: PutObject) -> Result<(), StorageError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Put(request.bucket.clone(), request.key.clone()));
            if self.fail_put {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.puts.lock().unwrap().push(request);
            Ok(())
        }
    }

    /// Optimizer returning a fixed-size output, or a codec error when `output` is None.
    struct FixedOptimizer {
        output: Option<usize>,
        calls: Mutex<Vec<(ImageFormat, u8, bool)>>,
    }

    impl FixedOptimizer {
        fn returning(size: usize) -> Self {
            Self {
                output: Some(size),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                output: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn produce(&self, format: ImageFormat) -> TransformResult<Bytes> {
            match self.output {
                Some(size) => Ok(Bytes::from(vec![1u8; size])),
                None => Err(TransformError::Codec {
                    format,
                    message: "corrupt image".into(),
                }),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ImageOptimizer for FixedOptimizer {
        async fn optimize_png(&self, _bytes: Bytes, level: u8) -> TransformResult<Bytes> {
            self.calls
                .lock()
                .unwrap()
                .push((ImageFormat::Png, level, false));
            self.produce(ImageFormat::Png)
        }

        async fn optimize_jpeg(&self, _bytes: Bytes, progressive: bool) -> TransformResult<Bytes> {
            self.calls
                .lock()
                .unwrap()
                .push((ImageFormat::Jpeg, 0, progressive));
            self.produce(ImageFormat::Jpeg)
        }
    }

    fn pipeline(
        store: &Arc<RecordingStore>,
        optimizer: &Arc<FixedOptimizer>,
        config: OptimConfig,
    ) -> Pipeline {
        Pipeline::new(store.clone(), optimizer.clone(), Arc::new(config))
    }

    fn head(key: &str) -> Call {
        Call::Head("assets".into(), key.into())
    }

    fn get(key: &str) -> Call {
        Call::Get("assets".into(), key.into())
    }

    #[tokio::test]
    async fn unsupported_key_is_rejected_without_storage_calls() {
        let store = Arc::new(RecordingStore::default());
        let optimizer = Arc::new(FixedOptimizer::returning(1));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "doc.txt")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Rejected(_)));
        assert!(store.calls().is_empty());
        assert_eq!(optimizer.call_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_key_is_rejected_without_storage_calls() {
        let store = Arc::new(RecordingStore::default());
        let optimizer = Arc::new(FixedOptimizer::returning(1));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "bad%FF.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Rejected(_)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn smaller_output_is_committed_with_tag() {
        let store = Arc::new(RecordingStore::with_object(
            "assets",
            "photo.png",
            5000,
            &[("author", "ana")],
        ));
        let optimizer = Arc::new(FixedOptimizer::returning(3000));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "photo.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Committed(s) if s == 40.0));
        assert_eq!(outcome.describe(), "optimized, saved 40.00%");
        assert_eq!(
            store.calls(),
            vec![
                head("photo.png"),
                get("photo.png"),
                Call::Put("assets".into(), "photo.png".into())
            ]
        );

        let puts = store.puts();
        let put = &puts[0];
        assert_eq!(put.body.len(), 3000);
        assert_eq!(put.custom_tags.get("optimized").map(String::as_str), Some("yes"));
        assert_eq!(put.custom_tags.get("author").map(String::as_str), Some("ana"));
        assert_eq!(put.custom_tags.len(), 2);
        assert_eq!(put.content_type.as_deref(), Some("image/png"));
        assert_eq!(put.storage_class, "STANDARD_IA");
        assert_eq!(put.acl, CannedAcl::PublicRead);
        assert_eq!(optimizer.calls.lock().unwrap()[0], (ImageFormat::Png, 7, false));
    }

    #[tokio::test]
    async fn tagged_object_is_skipped_when_enforced() {
        let store = Arc::new(RecordingStore::with_object(
            "assets",
            "photo.png",
            5000,
            &[("optimized", "yes")],
        ));
        let optimizer = Arc::new(FixedOptimizer::returning(3000));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "photo.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Skipped(_)));
        assert_eq!(store.calls(), vec![head("photo.png")]);
        assert_eq!(optimizer.call_count(), 0);
    }

    #[tokio::test]
    async fn tagged_object_is_reprocessed_when_not_enforced() {
        let store = Arc::new(RecordingStore::with_object(
            "assets",
            "photo.png",
            5000,
            &[("optimized", "yes")],
        ));
        let optimizer = Arc::new(FixedOptimizer::returning(4000));
        let config = OptimConfig {
            enforce_already_optimized_skip: false,
            ..OptimConfig::default()
        };
        let outcome = pipeline(&store, &optimizer, config)
            .run("assets", "photo.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Committed(s) if s == 20.0));
        assert_eq!(store.puts().len(), 1);
    }

    #[tokio::test]
    async fn oversized_object_is_skipped_regardless_of_tag() {
        for tags in [&[][..], &[("optimized", "yes")][..]] {
            let store = Arc::new(RecordingStore::with_object("assets", "big.png", 5001, tags));
            let optimizer = Arc::new(FixedOptimizer::returning(10));
            let config = OptimConfig {
                max_source_size: Some(5000),
                enforce_already_optimized_skip: false,
                ..OptimConfig::default()
            };
            let outcome = pipeline(&store, &optimizer, config)
                .run("assets", "big.png")
                .await;

            assert!(matches!(outcome, PipelineOutcome::Skipped(_)));
            assert_eq!(store.calls(), vec![head("big.png")]);
            assert_eq!(optimizer.call_count(), 0);
        }
    }

    #[tokio::test]
    async fn object_at_the_size_limit_is_processed() {
        let store = Arc::new(RecordingStore::with_object("assets", "edge.png", 5000, &[]));
        let optimizer = Arc::new(FixedOptimizer::returning(2500));
        let config = OptimConfig {
            max_source_size: Some(5000),
            ..OptimConfig::default()
        };
        let outcome = pipeline(&store, &optimizer, config)
            .run("assets", "edge.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Committed(s) if s == 50.0));
    }

    #[tokio::test]
    async fn output_not_smaller_is_discarded() {
        for output in [5000, 6000] {
            let store = Arc::new(RecordingStore::with_object("assets", "photo.png", 5000, &[]));
            let optimizer = Arc::new(FixedOptimizer::returning(output));
            let outcome = pipeline(&store, &optimizer, OptimConfig::default())
                .run("assets", "photo.png")
                .await;

            match outcome {
                PipelineOutcome::Discarded(reason) => assert_eq!(reason, DISCARD_REASON),
                other => panic!("expected discard, got {:?}", other),
            }
            assert!(store.puts().is_empty());
            assert!(!store.calls().iter().any(|c| matches!(c, Call::Put(..))));
        }
    }

    #[tokio::test]
    async fn encoded_key_is_decoded_for_every_storage_call() {
        let store = Arc::new(RecordingStore::with_object("assets", "my photo (1).png", 100, &[]));
        let optimizer = Arc::new(FixedOptimizer::returning(90));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "my%20photo+%281%29.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Committed(_)));
        assert_eq!(
            store.calls(),
            vec![
                head("my photo (1).png"),
                get("my photo (1).png"),
                Call::Put("assets".into(), "my photo (1).png".into())
            ]
        );
    }

    #[tokio::test]
    async fn destination_override_redirects_the_write() {
        let store = Arc::new(RecordingStore::with_object("assets", "photo.png", 1000, &[]));
        let optimizer = Arc::new(FixedOptimizer::returning(700));
        let config = OptimConfig {
            destination_bucket: Some("optimized".into()),
            acl: CannedAcl::Private,
            ..OptimConfig::default()
        };
        let outcome = pipeline(&store, &optimizer, config)
            .run("assets", "photo.png")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Committed(s) if s == 30.0));
        let puts = store.puts();
        assert_eq!(puts[0].bucket, "optimized");
        assert_eq!(puts[0].key, "photo.png");
        assert_eq!(puts[0].acl, CannedAcl::Private);
    }

    #[tokio::test]
    async fn jpeg_keys_use_the_jpeg_optimizer() {
        let store = Arc::new(RecordingStore::with_object("assets", "shot.JPG", 1000, &[]));
        let optimizer = Arc::new(FixedOptimizer::returning(900));
        let config = OptimConfig {
            jpeg_progressive: false,
            ..OptimConfig::default()
        };
        let outcome = pipeline(&store, &optimizer, config)
            .run("assets", "shot.JPG")
            .await;

        assert!(matches!(outcome, PipelineOutcome::Committed(_)));
        assert_eq!(
            optimizer.calls.lock().unwrap().clone(),
            vec![(ImageFormat::Jpeg, 0, false)]
        );
    }

    #[tokio::test]
    async fn probe_failure_stops_the_run() {
        let store = Arc::new(RecordingStore::default());
        let optimizer = Arc::new(FixedOptimizer::returning(1));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "missing.png")
            .await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(PipelineError::Storage(StorageError::ObjectNotFound { .. }))
        ));
        assert_eq!(store.calls(), vec![head("missing.png")]);
        assert_eq!(optimizer.call_count(), 0);
    }

    #[tokio::test]
    async fn codec_failure_is_not_passed_through() {
        let store = Arc::new(RecordingStore::with_object("assets", "photo.png", 1000, &[]));
        let optimizer = Arc::new(FixedOptimizer::failing());
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "photo.png")
            .await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(PipelineError::Transform(_))
        ));
        assert!(store.puts().is_empty());
        assert_eq!(store.calls(), vec![head("photo.png"), get("photo.png")]);
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let store = Arc::new(RecordingStore {
            fail_put: true,
            ..RecordingStore::with_object("assets", "photo.png", 1000, &[])
        });
        let optimizer = Arc::new(FixedOptimizer::returning(10));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "photo.png")
            .await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(PipelineError::Storage(StorageError::Io(_)))
        ));
        assert_eq!(outcome.kind(), "failed");
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_stops_before_the_optimizer() {
        let store = Arc::new(RecordingStore {
            fail_get: true,
            ..RecordingStore::with_object("assets", "photo.png", 1000, &[])
        });
        let optimizer = Arc::new(FixedOptimizer::returning(10));
        let outcome = pipeline(&store, &optimizer, OptimConfig::default())
            .run("assets", "photo.png")
            .await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(PipelineError::Storage(_))
        ));
        assert_eq!(optimizer.call_count(), 0);
        assert_eq!(store.calls(), vec![head("photo.png"), get("photo.png")]);
    }

    #[tokio::test]
    async fn rerun_against_local_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageService::new(Arc::new(memory_pool().await), dir.path()));
        storage.create_bucket("assets", "local".into()).await.unwrap();
        storage
            .put_object(PutObject {
                bucket: "assets".into(),
                key: "logo.png".into(),
                body: Bytes::from(vec![9u8; 400]),
                content_type: Some("image/png".into()),
                custom_tags: BTreeMap::from([("team".to_string(), "web".to_string())]),
                storage_class: "STANDARD".into(),
                acl: CannedAcl::Private,
            })
            .await
            .unwrap();

        let optimizer = Arc::new(FixedOptimizer::returning(100));
        let pipeline = Pipeline::new(
            storage.clone(),
            optimizer.clone(),
            Arc::new(OptimConfig::default()),
        );

        let first = pipeline.run("assets", "logo.png").await;
        assert!(matches!(first, PipelineOutcome::Committed(s) if s == 75.0));

        let head = storage.head_object("assets", "logo.png").await.unwrap();
        assert_eq!(head.content_length, 100);
        assert!(head.is_optimized());
        assert_eq!(head.custom_tags.get("team").map(String::as_str), Some("web"));

        let second = pipeline.run("assets", "logo.png").await;
        assert!(matches!(second, PipelineOutcome::Skipped(_)));
        assert_eq!(optimizer.call_count(), 1);
    }
}
