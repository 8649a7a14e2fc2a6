// Shared fixtures: a simulated host wired into a SystemState.

#![allow(dead_code)]

use std::sync::Arc;
use vm_mem_balancer::config::Settings;
use vm_mem_balancer::core::{DomId, SystemState};
use vm_mem_balancer::hypervisor::{Backends, Behavior, ConfigStore, SimClock, SimHost};
use vm_mem_balancer::monitoring::RecordingNotifier;
use vm_mem_balancer::utils::mib;

pub struct Harness {
    pub host: Arc<SimHost>,
    pub clock: Arc<SimClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub settings: Settings,
    pub state: SystemState,
}

/// Defaults with preference equal to reported usage, which keeps the
/// arithmetic in scenarios readable.
pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.planner.cache_factor = 1.0;
    settings
}

pub fn harness(total_mib: u64, settings: Settings) -> Harness {
    let host = Arc::new(SimHost::new(mib(total_mib)));
    let clock = Arc::new(SimClock::new(host.clone()));
    let notifier = Arc::new(RecordingNotifier::new());
    let backends = Backends {
        hypervisor: host.clone(),
        store: host.clone(),
        notifier: notifier.clone(),
        clock: clock.clone(),
    };
    let state = SystemState::new(&settings, backends).expect("simulated host always answers");
    Harness {
        host,
        clock,
        notifier,
        settings,
        state,
    }
}

pub struct Guest {
    pub id: DomId,
    pub actual_mib: u64,
    pub used_mib: u64,
    pub behavior: Behavior,
}

pub fn guest(id: DomId, actual_mib: u64, used_mib: u64, behavior: Behavior) -> Guest {
    Guest {
        id,
        actual_mib,
        used_mib,
        behavior,
    }
}

impl Harness {
    pub fn disable_balancing(&self) {
        self.host
            .write(&self.settings.balancer.disable_path, "1")
            .expect("simulated store accepts writes");
    }

    pub fn enable_balancing(&self) {
        self.host.remove_store_value(&self.settings.balancer.disable_path);
    }

    /// Start guests and feed their usage without letting any pass run.
    /// Balancing stays disabled afterwards.
    pub async fn seed(&mut self, guests: &[Guest]) {
        self.disable_balancing();
        for g in guests {
            self.host.add_domain(g.id, mib(g.actual_mib), Some(mib(4096)), g.behavior);
            self.state.add_domain(g.id);
        }
        for g in guests {
            self.state
                .report_meminfo(g.id, &mib(g.used_mib).to_string())
                .await
                .expect("domain is tracked");
        }
    }

    pub fn targets_for(&self, id: DomId) -> Vec<u64> {
        self.host
            .target_log()
            .into_iter()
            .filter(|(domid, _)| *domid == id)
            .map(|(_, target)| target)
            .collect()
    }
}
