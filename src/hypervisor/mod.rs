//! Seams to the outside world: hypervisor control, the configuration store,
//! and the clock used for bounded waits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Backend, HypervisorSettings};
use crate::core::domain::DomId;
use crate::errors::{HypervisorError, StoreError};
use crate::monitoring::notifier::{LogNotifier, Notifier};
use crate::utils::mib;

pub mod sim;
pub mod xenstore;
pub mod xl;

pub use sim::{Behavior, SimClock, SimHost};
pub use xenstore::XenstoreCli;
pub use xl::XlHypervisor;

/// Committed memory of one running domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainMemory {
    pub domid: DomId,
    pub memory_actual: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysInfo {
    pub total_memory: u64,
    pub free_memory: u64,
}

/// Hypervisor control interface. All figures are bytes.
pub trait Hypervisor: Send + Sync {
    fn list_domains(&self) -> Result<Vec<DomainMemory>, HypervisorError>;

    fn physinfo(&self) -> Result<PhysInfo, HypervisorError>;

    fn set_max_mem(&self, domid: DomId, bytes: u64) -> Result<(), HypervisorError>;

    fn set_target_mem(&self, domid: DomId, bytes: u64) -> Result<(), HypervisorError>;
}

/// Hierarchical, path-addressed key/value store.
pub trait ConfigStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError>;

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError>;

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.read(path)?.is_some())
    }
}

pub fn domain_path(domid: DomId, key: &str) -> String {
    format!("/local/domain/{}/{}", domid, key)
}

#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// The collaborators a `SystemState` drives.
#[derive(Clone)]
pub struct Backends {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub store: Arc<dyn ConfigStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    pub fn from_settings(settings: &HypervisorSettings) -> Self {
        match settings.backend {
            Backend::Xl => Self {
                hypervisor: Arc::new(XlHypervisor::new(&settings.xl_path)),
                store: Arc::new(XenstoreCli::from_settings(settings)),
                notifier: Arc::new(LogNotifier),
                clock: Arc::new(TokioClock),
            },
            Backend::Sim => {
                let host = Arc::new(SimHost::new(mib(settings.sim_total_mib)));
                Self {
                    hypervisor: host.clone(),
                    store: host.clone(),
                    notifier: Arc::new(LogNotifier),
                    clock: Arc::new(SimClock::realtime(host)),
                }
            }
        }
    }
}
