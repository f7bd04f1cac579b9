//! S3-style event notification documents, as delivered to `POST /_events`.
//!
//! Only the fields the pipeline reads are modelled; everything else in the
//! notification (event name, principal, sequencer, ...) is ignored.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct EventNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEntity {
    /// Form-encoded key (`+` for space, `%XX` escapes).
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl EventNotification {
    /// The record this invocation acts on. Notifications carry one.
    pub fn first_record(&self) -> Option<&EventRecord> {
        self.records.first()
    }
}
