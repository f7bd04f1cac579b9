//! Shared state handed to every handler.

use crate::services::{pipeline::Pipeline, storage_service::StorageService};
use axum::extract::FromRef;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub pipeline: Pipeline,
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}

impl FromRef<AppState> for Pipeline {
    fn from_ref(state: &AppState) -> Self {
        state.pipeline.clone()
    }
}
