//! The narrow storage interface the pipeline consumes.

use crate::{
    models::{metadata::ObjectMetadata, object::CannedAcl, pipeline::ObjectPayload},
    services::storage_service::StorageResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Everything a single object write carries.
#[derive(Clone, Debug)]
pub struct PutObject {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub custom_tags: BTreeMap<String, String>,
    pub storage_class: String,
    pub acl: CannedAcl,
}

/// Object storage as seen by the pipeline: head, get, put.
///
/// Implementors must be `Send + Sync`; one store handle is shared by every
/// concurrent invocation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata-only probe. No body is transferred.
    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMetadata>;

    /// Full body plus content type.
    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectPayload>;

    /// Write (or overwrite) an object. Either fully succeeds or leaves the
    /// previous version in place.
    async fn put_object(&self, request: PutObject) -> StorageResult<()>;
}
