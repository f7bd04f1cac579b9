//! src/services/storage_service.rs
//!
//! StorageService — the local object store the pipeline reads from and
//! commits to. SQLite holds object records and custom tags; payloads live on
//! disk sharded beneath `base_path/{bucket}/{shard}/{shard}/{version_id}`,
//! one file per write, so a record only ever names a fully written payload.

use crate::{
    models::{
        bucket::Bucket,
        metadata::{MetadataEntry, ObjectMetadata},
        object::{CannedAcl, DEFAULT_STORAGE_CLASS, Object},
        pipeline::ObjectPayload,
    },
    services::store::{ObjectStore, PutObject},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Attributes stored alongside a payload on every write.
#[derive(Clone, Debug, Default)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    pub custom_tags: BTreeMap<String, String>,
    pub storage_class: Option<String>,
    pub acl: CannedAcl,
}

/// StorageService provides the S3-like operations the optimizer needs:
/// - Create a bucket
/// - Upload an object (writes bytes to disk, upserts its record and tags)
/// - Get an object (record from SQLite, payload from disk)
/// - Head an object (record and tags only)
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Basic key validation.
    ///
    /// Rejects keys that begin with `/` or have a `..` segment.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        if name.trim() != name {
            return Err(invalid("cannot begin or end with whitespace"));
        }

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Validate region string against SUPPORTED_REGIONS (case-insensitive).
    fn ensure_region_valid(&self, region: &str) -> StorageResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StorageError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard directories from MD5(bucket/key), as lowercase hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// base_path/bucket/{shard}/{shard}/{version_id}. Parent directories may
    /// not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str, version_id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(version_id.to_string());
        path
    }

    /// Fetch bucket metadata from SQLite. Returns BucketNotFound if missing.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<sqlx::sqlite::Sqlite, Bucket>(
            "SELECT id, name, owner_id, region, created_at
             FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch an object record by key. Returns ObjectNotFound if missing.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, filename, version_id, content_type, size_bytes,
                    etag, storage_class, acl, last_modified
             FROM objects
             WHERE key = ? AND bucket_id = ?",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Custom tags of an object, keyed by tag name.
    async fn fetch_tags(&self, object_id: Uuid) -> StorageResult<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<_, MetadataEntry>(
            "SELECT id, object_id, key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a new version file.
    /// - Computes MD5/etag and size while streaming.
    /// - Points the record at that version and replaces its tags in one
    ///   transaction.
    /// - Removes the previous version's file once the transaction committed.
    ///
    /// The previous payload is never touched before the commit, so a write
    /// that fails or is dropped part way leaves the old object readable and
    /// consistent. At worst an unreferenced version file stays behind.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        attrs: ObjectAttributes,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let version_id = Uuid::new_v4();
        let file_path = self.object_path(&bucket_rec.name, key, version_id);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let (size_bytes, etag) = match write_version(&file_path, stream).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(StorageError::Io(err));
            }
        };

        let (object, replaced) = match self
            .commit_object(&bucket_rec, key, version_id, size_bytes, etag, attrs)
            .await
        {
            Ok(committed) => committed,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(err);
            }
        };

        if let Some(old_version) = replaced {
            let old_path = self.object_path(&bucket_rec.name, key, old_version);
            if let Err(err) = fs::remove_file(&old_path).await {
                warn!("failed to remove replaced payload {:?}: {}", old_path, err);
            }
        }

        debug!(
            "stored {}/{} ({} bytes, etag {:?})",
            bucket_rec.name, key, object.size_bytes, object.etag
        );
        Ok(object)
    }

    /// Upsert the record and its tags in one transaction. Returns the stored
    /// record and the version it replaced, if any.
    async fn commit_object(
        &self,
        bucket_rec: &Bucket,
        key: &str,
        version_id: Uuid,
        size_bytes: i64,
        etag: String,
        attrs: ObjectAttributes,
    ) -> StorageResult<(Object, Option<Uuid>)> {
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        let storage_class = attrs
            .storage_class
            .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string());

        let mut tx = self.db.begin().await?;

        let replaced = sqlx::query_scalar::<_, Uuid>(
            "SELECT version_id FROM objects WHERE bucket_id = ? AND key = ?",
        )
        .bind(bucket_rec.id)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, filename, version_id, content_type,
                size_bytes, etag, storage_class, acl, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                filename = excluded.filename,
                version_id = excluded.version_id,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                storage_class = excluded.storage_class,
                acl = excluded.acl,
                last_modified = excluded.last_modified
            RETURNING id, bucket_id, key, filename, version_id, content_type,
                      size_bytes, etag, storage_class, acl, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket_rec.id)
        .bind(key)
        .bind(&filename)
        .bind(version_id)
        .bind(attrs.content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(&storage_class)
        .bind(attrs.acl)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;

        for (name, value) in &attrs.custom_tags {
            sqlx::query(
                "INSERT INTO object_metadata (id, object_id, key, value) VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(object.id)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok((object, replaced))
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, BTreeMap<String, String>, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;
        let tags = self.fetch_tags(object.id).await?;

        let file_path = self.object_path(&bucket_rec.name, key, object.version_id);
        let file = File::open(&file_path)
            .await
            .map_err(|err| missing_payload(err, bucket, key))?;

        Ok((object, tags, file))
    }

    /// Fetch an object record and its custom tags, without the payload.
    pub async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, BTreeMap<String, String>)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;
        let tags = self.fetch_tags(object.id).await?;
        Ok((object, tags))
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Validates name and region. Returns BucketAlreadyExists on a name
    /// conflict.
    pub async fn create_bucket(&self, name: &str, region: String) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: Uuid::new_v4(),
            region: normalized_region,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner_id, region, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.owner_id)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn head_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMetadata> {
        let (object, custom_tags) = self.get_object_metadata(bucket, key).await?;
        Ok(ObjectMetadata {
            content_length: object.size_bytes.max(0) as u64,
            content_type: object.content_type,
            storage_class: object.storage_class,
            custom_tags,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectPayload> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key, object.version_id);
        let bytes = fs::read(&file_path)
            .await
            .map_err(|err| missing_payload(err, bucket, key))?;

        Ok(ObjectPayload {
            bytes: Bytes::from(bytes),
            content_type: object.content_type,
        })
    }

    async fn put_object(&self, request: PutObject) -> StorageResult<()> {
        let PutObject {
            bucket,
            key,
            body,
            content_type,
            custom_tags,
            storage_class,
            acl,
        } = request;

        let attrs = ObjectAttributes {
            content_type,
            custom_tags,
            storage_class: Some(storage_class),
            acl,
        };
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(body) });
        self.upload_object_stream(&bucket, &key, attrs, stream)
            .await
            .map(|_| ())
    }
}

/// Drain `stream` into a new file at `path`, fsync it, and return its size
/// and MD5 hex digest.
async fn write_version<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();

    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((size_bytes, format!("{:x}", digest.compute())))
}

fn missing_payload(err: io::Error, bucket: &str, key: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StorageError::Io(err)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
