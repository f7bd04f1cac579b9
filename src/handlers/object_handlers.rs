//! HTTP handlers for the local object store.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::object::{CannedAcl, Object},
    services::storage_service::{ObjectAttributes, StorageService},
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::{collections::BTreeMap, io};
use tokio_util::io::ReaderStream;

const META_PREFIX: &str = "x-amz-meta-";
const STORAGE_CLASS_HEADER: &str = "x-amz-storage-class";
const ACL_HEADER: &str = "x-amz-acl";

/// Minimal request body for `PUT /{bucket}` (create bucket).
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
}

/// Upload an object to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let attrs = attributes_from_headers(&headers)?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = service
        .upload_object_stream(&bucket, &key, attrs, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            response.headers_mut().insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, tags, file) = service.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    set_object_headers(response.headers_mut(), &meta, &tags);
    Ok(response)
}

/// HEAD `/{bucket}/{*key}` — same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, tags) = service.get_object_metadata(&bucket, &key).await?;

    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &meta, &tags);
    Ok(response)
}

/// PUT `/{bucket}` — create bucket. The JSON body is optional.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: Option<CreateBucketReq> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid bucket request: {}", err)))?
    };
    let region = payload
        .and_then(|p| p.location_constraint)
        .unwrap_or_else(|| "local".into());

    service.create_bucket(&bucket, region).await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CreateBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
            r#"<Location>/{}</Location>"#,
            r#"</CreateBucketResult>"#
        ),
        xml_escape(&bucket)
    );
    let mut response = Response::new(Body::from(xml));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    Ok(response)
}

/// Content type, `x-amz-meta-*` tags, storage class and canned ACL of an upload.
fn attributes_from_headers(headers: &HeaderMap) -> Result<ObjectAttributes, AppError> {
    let header_str = |name: &str| -> Result<Option<String>, AppError> {
        headers
            .get(name)
            .map(|value| {
                value
                    .to_str()
                    .map(str::to_string)
                    .map_err(|_| AppError::bad_request(format!("header `{}` is not valid text", name)))
            })
            .transpose()
    };

    let mut custom_tags = BTreeMap::new();
    for (name, value) in headers {
        if let Some(tag) = name.as_str().strip_prefix(META_PREFIX) {
            let value = value.to_str().map_err(|_| {
                AppError::bad_request(format!("header `{}` is not valid text", name))
            })?;
            custom_tags.insert(tag.to_string(), value.to_string());
        }
    }

    let acl = match header_str(ACL_HEADER)? {
        Some(raw) => raw.parse::<CannedAcl>().map_err(AppError::bad_request)?,
        None => CannedAcl::default(),
    };

    Ok(ObjectAttributes {
        content_type: header_str(header::CONTENT_TYPE.as_str())?,
        custom_tags,
        storage_class: header_str(STORAGE_CLASS_HEADER)?,
        acl,
    })
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object, tags: &BTreeMap<String, String>) {
    let content_type = meta
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.storage_class) {
        headers.insert(HeaderName::from_static(STORAGE_CLASS_HEADER), value);
    }

    for (tag, value) in tags {
        let name = HeaderName::try_from(format!("{}{}", META_PREFIX, tag.to_ascii_lowercase()));
        match (name, HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!("tag `{}` cannot be expressed as a header; omitted", tag),
        }
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
