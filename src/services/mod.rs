pub mod optimizer;
pub mod pipeline;
pub mod storage_service;
pub mod store;
