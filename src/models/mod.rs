//! Data models for the optimizer service.
//!
//! `bucket`, `object` and `metadata` map to the local store's SQLite tables
//! via `sqlx::FromRow`; `event` and `pipeline` describe one invocation.

pub mod bucket;
pub mod event;
pub mod metadata;
pub mod object;
pub mod pipeline;
