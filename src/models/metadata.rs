//! User-defined object metadata: the stored tag rows and the head-probe view.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Custom tag marking an object as already run through the optimizer.
pub const OPTIMIZED_TAG: &str = "optimized";
/// Value of [`OPTIMIZED_TAG`] written on commit.
pub const OPTIMIZED_VALUE: &str = "yes";

/// One custom tag (`x-amz-meta-*`) attached to an object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MetadataEntry {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Tag name, without the `x-amz-meta-` prefix.
    pub key: String,

    /// Tag value as plain text.
    pub value: String,
}

/// What a head probe reports about an object, without its body.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub storage_class: String,
    pub custom_tags: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// True when the object carries `optimized=yes`.
    pub fn is_optimized(&self) -> bool {
        self.custom_tags
            .get(OPTIMIZED_TAG)
            .is_some_and(|value| value == OPTIMIZED_VALUE)
    }
}
