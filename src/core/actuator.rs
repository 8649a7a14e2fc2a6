use std::sync::Arc;
use tracing::debug;

use crate::core::domain::DomainState;
use crate::errors::handlers::{absorb_hypervisor, absorb_store, Absorbed};
use crate::hypervisor::{domain_path, ConfigStore, Hypervisor};
use crate::utils::KIB;

/// Headroom above the balloon target granted to the domain's hard cap.
pub const MAX_MEM_SLACK: u64 = 1024 * KIB;

/// Applies balloon targets through the hypervisor and records them in the store.
#[derive(Clone)]
pub struct Actuator {
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<dyn ConfigStore>,
}

impl Actuator {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, store: Arc<dyn ConfigStore>) -> Self {
        Self { hypervisor, store }
    }

    /// Record `target` on `dom`, then try to apply it. Hypervisor failures are
    /// absorbed and the store write is attempted regardless.
    pub fn set_target(&self, dom: &mut DomainState, target: u64) -> Absorbed {
        dom.last_target = target;
        let domid = dom.id;
        debug!(domid, target, "Setting balloon target");

        let mut outcome = absorb_hypervisor(
            "set_max_mem",
            domid,
            self.hypervisor
                .set_max_mem(domid, target.saturating_add(MAX_MEM_SLACK)),
        );
        if outcome == Absorbed::Ok {
            outcome = absorb_hypervisor(
                "set_target_mem",
                domid,
                self.hypervisor.set_target_mem(domid, target),
            );
        }

        let path = domain_path(domid, "memory/target");
        let stored = absorb_store(domid, self.store.write(&path, &(target / KIB).to_string()));
        if outcome == Absorbed::Ok {
            stored
        } else {
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{Behavior, SimHost};
    use crate::utils::mib;

    fn setup() -> (Arc<SimHost>, Actuator) {
        let host = Arc::new(SimHost::new(mib(2048)));
        host.add_domain(1, mib(512), Some(mib(1024)), Behavior::Cooperative);
        let actuator = Actuator::new(host.clone(), host.clone());
        (host, actuator)
    }

    #[test]
    fn applies_target_with_cap_slack() {
        let (host, actuator) = setup();
        let mut dom = DomainState::new(1);

        assert_eq!(actuator.set_target(&mut dom, mib(400)), Absorbed::Ok);
        assert_eq!(dom.last_target, mib(400));
        assert_eq!(host.target(1), Some(mib(400)));
        assert_eq!(host.max_mem(1), Some(mib(400) + MAX_MEM_SLACK));
        assert_eq!(
            host.store_value("/local/domain/1/memory/target").as_deref(),
            Some("409600")
        );
    }

    #[test]
    fn records_target_even_when_domain_is_gone() {
        let (host, actuator) = setup();
        host.mark_gone(1);
        let mut dom = DomainState::new(1);

        assert_eq!(actuator.set_target(&mut dom, mib(300)), Absorbed::Transient);
        assert_eq!(dom.last_target, mib(300));
        assert_eq!(host.target(1), Some(mib(512)));
        assert_eq!(
            host.store_value("/local/domain/1/memory/target").as_deref(),
            Some("307200")
        );
    }
}
