use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::domain::{DomId, Registry};
use crate::errors::HypervisorError;
use crate::hypervisor::{domain_path, ConfigStore, Hypervisor};
use crate::utils::KIB;

/// Reads committed memory and static caps for tracked domains.
#[derive(Clone)]
pub struct Telemetry {
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<dyn ConfigStore>,
    all_phys_mem: u64,
}

impl Telemetry {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<dyn ConfigStore>,
        all_phys_mem: u64,
    ) -> Self {
        Self {
            hypervisor,
            store,
            all_phys_mem,
        }
    }

    pub fn all_phys_mem(&self) -> u64 {
        self.all_phys_mem
    }

    /// Update `memory_actual` and `memory_maximum` of every tracked domain the
    /// hypervisor lists. Untracked domains are ignored.
    pub fn refresh(&self, registry: &mut Registry) -> Result<(), HypervisorError> {
        for listed in self.hypervisor.list_domains()? {
            let Some(dom) = registry.get_mut(listed.domid) else {
                continue;
            };
            dom.memory_actual = Some(listed.memory_actual);
            dom.memory_maximum = Some(self.static_max(listed.domid));
        }
        Ok(())
    }

    pub fn running_domains(&self) -> Result<Vec<DomId>, HypervisorError> {
        Ok(self
            .hypervisor
            .list_domains()?
            .into_iter()
            .map(|listed| listed.domid)
            .collect())
    }

    /// Current host free memory, queried fresh every call.
    pub fn free_memory(&self) -> Result<u64, HypervisorError> {
        Ok(self.hypervisor.physinfo()?.free_memory)
    }

    /// Domain name for diagnostics, falling back to the id.
    pub fn domain_name(&self, domid: DomId) -> String {
        match self.store.read(&domain_path(domid, "name")) {
            Ok(Some(name)) if !name.is_empty() => name,
            _ => format!("domain-{}", domid),
        }
    }

    /// Static cap from the store in KiB. Domains without one (the control
    /// domain) may use all of host memory.
    fn static_max(&self, domid: DomId) -> u64 {
        let path = domain_path(domid, "memory/static-max");
        match self.store.read(&path) {
            Ok(Some(raw)) => match raw.trim().parse::<u64>() {
                Ok(kib) => kib.saturating_mul(KIB).min(self.all_phys_mem),
                Err(_) => {
                    warn!(domid, value = %raw, "Unparseable static-max, using host total");
                    self.all_phys_mem
                }
            },
            Ok(None) => self.all_phys_mem,
            Err(e) => {
                debug!(domid, error = %e, "Could not read static-max");
                self.all_phys_mem
            }
        }
    }
}
