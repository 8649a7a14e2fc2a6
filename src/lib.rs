pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod hypervisor;
pub mod monitoring;
pub mod utils;

// Re-exports
pub use api::routes::{create_router, AppState};
pub use crate::config::Settings;
pub use crate::core::{DomId, SystemState};
pub use errors::{BalancerError, BalancerResult};
pub use hypervisor::Backends;
pub type AsyncMutex<T> = tokio::sync::Mutex<T>;
