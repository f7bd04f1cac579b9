//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Storage class recorded when an uploader does not name one.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Represents a single object (blob) within a bucket.
///
/// The `Object` struct stores its metadata, not the actual content bytes.
/// Custom tags live in their own table, see [`super::metadata::MetadataEntry`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Names the payload file of the current version. Every write gets a
    /// fresh one.
    pub version_id: Uuid,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload, lowercase hex.
    pub etag: Option<String>,

    /// Storage class (e.g., STANDARD, INFREQUENT_ACCESS).
    pub storage_class: String,

    /// Canned access-control policy applied on the last write.
    pub acl: CannedAcl,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,
}

/// S3 canned ACLs, spelled the way the `x-amz-acl` header spells them.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum CannedAcl {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
    AwsExecRead,
}

impl CannedAcl {
    pub const ALL: [CannedAcl; 7] = [
        CannedAcl::Private,
        CannedAcl::PublicRead,
        CannedAcl::PublicReadWrite,
        CannedAcl::AuthenticatedRead,
        CannedAcl::BucketOwnerRead,
        CannedAcl::BucketOwnerFullControl,
        CannedAcl::AwsExecRead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CannedAcl::Private => "private",
            CannedAcl::PublicRead => "public-read",
            CannedAcl::PublicReadWrite => "public-read-write",
            CannedAcl::AuthenticatedRead => "authenticated-read",
            CannedAcl::BucketOwnerRead => "bucket-owner-read",
            CannedAcl::BucketOwnerFullControl => "bucket-owner-full-control",
            CannedAcl::AwsExecRead => "aws-exec-read",
        }
    }
}

impl fmt::Display for CannedAcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CannedAcl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        CannedAcl::ALL
            .into_iter()
            .find(|acl| acl.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown canned ACL `{}`", s))
    }
}
