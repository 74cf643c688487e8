pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod normalizers;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod store;
pub mod tools;

pub use crate::{
    config::AppConfig,
    error::{ExecutionError, ParseError, ScanError},
    executor::{CancelToken, ProcessRunner, ToolRunner},
    orchestrator::{CancelOutcome, ScanHandle, ScanOrchestrator},
    progress::ProgressBroadcaster,
    store::{MemoryScanStore, ScanStore},
};
