//! Convergence supervisor.
//!
//! `SystemState` owns the registry and drives every pass: refresh telemetry,
//! plan, drop insignificant plans, then apply with bounded waits. Callers hold
//! it behind one async mutex so passes never interleave.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Settings;
use crate::core::actuator::Actuator;
use crate::core::domain::{DomId, DomainState, DomainStatus, Registry};
use crate::core::meminfo;
use crate::core::planner::{self, MemsetRequest, PlannerParams};
use crate::core::telemetry::Telemetry;
use crate::errors::{BalancerError, BalancerResult, MeminfoError};
use crate::hypervisor::{Backends, Clock, ConfigStore};
use crate::monitoring::notifier::{Condition, Notifier};
use crate::utils::{mib, KIB};

/// A domain whose actual trails its target by more than this is re-pinned
/// after a balloon request so it cannot grab the freed memory back.
pub const INHIBIT_SLACK: u64 = 200 * KIB;

#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Free memory the host keeps in reserve.
    pub free_mem_left: u64,
    /// Free memory below which every plan counts as significant.
    pub free_mem_min: u64,
    pub all_phys_mem: u64,
    pub retry_delay: Duration,
    pub apply_retries: u32,
    pub balloon_iterations: u32,
    pub min_total_transfer: u64,
    pub min_change_under_pref: u64,
}

impl Thresholds {
    pub fn from_settings(settings: &Settings, all_phys_mem: u64) -> Self {
        Self {
            free_mem_left: settings.balancer.free_mem_left(),
            free_mem_min: settings.balancer.free_mem_min(),
            all_phys_mem,
            retry_delay: settings.balancer.retry_delay(),
            apply_retries: settings.balancer.apply_retries,
            balloon_iterations: settings.balancer.balloon_iterations,
            min_total_transfer: mib(settings.planner.min_total_transfer_mib),
            min_change_under_pref: mib(settings.planner.min_change_under_pref_mib),
        }
    }

    /// Tolerance for calling a domain converged on its target.
    pub fn margin(&self) -> u64 {
        self.free_mem_left / 4
    }

    fn has_headroom(&self, free: u64, growth: u64) -> bool {
        (free as i128 - growth as i128) * 10 >= 9 * self.free_mem_left as i128
    }
}

/// What happened to a guest memory report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { mem_used: u64 },
    Rejected(MeminfoError),
}

pub struct SystemState {
    registry: Registry,
    thresholds: Thresholds,
    params: PlannerParams,
    telemetry: Telemetry,
    actuator: Actuator,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ConfigStore>,
    disable_path: String,
}

impl SystemState {
    pub fn new(settings: &Settings, backends: Backends) -> BalancerResult<Self> {
        let all_phys_mem = backends.hypervisor.physinfo()?.total_memory;
        info!(
            total_memory = all_phys_mem,
            free_mem_left = settings.balancer.free_mem_left(),
            "Initialising memory balancer"
        );

        Ok(Self {
            registry: Registry::new(),
            thresholds: Thresholds::from_settings(settings, all_phys_mem),
            params: PlannerParams::from(&settings.planner),
            telemetry: Telemetry::new(
                backends.hypervisor.clone(),
                backends.store.clone(),
                all_phys_mem,
            ),
            actuator: Actuator::new(backends.hypervisor, backends.store.clone()),
            notifier: backends.notifier,
            clock: backends.clock,
            store: backends.store,
            disable_path: settings.balancer.disable_path.clone(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn domain(&self, id: DomId) -> Option<&DomainState> {
        self.registry.get(id)
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn planner_params(&self) -> &PlannerParams {
        &self.params
    }

    pub fn add_domain(&mut self, id: DomId) {
        info!(domid = id, "Tracking domain");
        self.registry.add(id);
    }

    pub fn del_domain(&mut self, id: DomId) -> bool {
        let removed = self.registry.remove(id).is_some();
        if removed {
            info!(domid = id, "Stopped tracking domain");
        }
        removed
    }

    /// Track every domain the hypervisor currently runs. Returns how many were new.
    pub fn adopt_running_domains(&mut self) -> BalancerResult<usize> {
        let mut adopted = 0;
        for id in self.telemetry.running_domains()? {
            if !self.registry.contains(id) {
                self.add_domain(id);
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    pub fn set_target(&mut self, id: DomId, target: u64) -> BalancerResult<()> {
        let dom = self
            .registry
            .get_mut(id)
            .ok_or(BalancerError::UnknownDomain(id))?;
        self.actuator.set_target(dom, target);
        Ok(())
    }

    /// Ingest a guest usage report and, if it is accepted, run a balance pass.
    /// A rejected report leaves the domain's previous estimate in place.
    pub async fn report_meminfo(&mut self, id: DomId, blob: &str) -> BalancerResult<IngestOutcome> {
        let limit = self.thresholds.all_phys_mem;
        let dom = self
            .registry
            .get_mut(id)
            .ok_or(BalancerError::UnknownDomain(id))?;

        match meminfo::ingest(dom, blob, limit) {
            Ok(mem_used) => {
                debug!(domid = id, mem_used, "Accepted meminfo");
                self.balance().await;
                Ok(IngestOutcome::Accepted { mem_used })
            }
            Err(e) => {
                warn!(domid = id, error = %e, "Discarding meminfo sample");
                Ok(IngestOutcome::Rejected(e))
            }
        }
    }

    /// One best-effort balance pass.
    pub async fn balance(&mut self) {
        let span = info_span!("balance", pass = %Uuid::new_v4());
        self.balance_pass().instrument(span).await
    }

    async fn balance_pass(&mut self) {
        if let Err(e) = self.telemetry.refresh(&mut self.registry) {
            warn!(error = %e, "Telemetry refresh failed, skipping pass");
            return;
        }
        self.clear_outdated_error_markers();
        if self.balancing_disabled() {
            debug!("Balancing disabled by override");
            return;
        }

        let free = match self.telemetry.free_memory() {
            Ok(free) => free,
            Err(e) => {
                warn!(error = %e, "Could not read host free memory");
                return;
            }
        };
        let delta = signed(free) - signed(self.thresholds.free_mem_left);
        let requests = planner::balance(delta, &self.registry, &self.params);

        if !self.is_significant(free, &requests) {
            debug!(free, requests = requests.len(), "Plan not significant");
            return;
        }
        info!(free, requests = requests.len(), "Applying balance plan");
        self.apply(&requests).await;
    }

    /// Whether a plan is worth the churn of applying it.
    pub fn is_significant(&self, free: u64, requests: &[MemsetRequest]) -> bool {
        if requests.is_empty() {
            return false;
        }
        let shortfall = self.thresholds.free_mem_left.saturating_sub(free);
        if shortfall > self.thresholds.min_change_under_pref {
            return true;
        }

        let mut total_transfer: u64 = 0;
        for rq in requests {
            let Some(dom) = self.registry.get(rq.domid) else {
                continue;
            };
            total_transfer = total_transfer.saturating_add(rq.target.abs_diff(dom.last_target));

            let under_pref = planner::preference(dom, &self.params)
                .is_some_and(|pref| dom.last_target > 0 && dom.last_target < pref);
            if under_pref && rq.target > dom.last_target.saturating_add(self.thresholds.min_change_under_pref) {
                return true;
            }
        }

        total_transfer.saturating_add(free.abs_diff(self.thresholds.free_mem_left))
            > self.thresholds.min_total_transfer
    }

    async fn apply(&mut self, requests: &[MemsetRequest]) {
        let before = self.registry.actual_by_id();
        for (index, rq) in requests.iter().enumerate() {
            if !self.wait_for_headroom(rq).await {
                self.handle_stall(&requests[..index], rq, &before);
                return;
            }
            if let Some(dom) = self.registry.get_mut(rq.domid) {
                self.actuator.set_target(dom, rq.target);
            }
        }
    }

    /// Growing a domain must leave at least 90% of the reserve free. Waits up
    /// to `apply_retries` delays for donors to release memory.
    async fn wait_for_headroom(&mut self, rq: &MemsetRequest) -> bool {
        for attempt in 0..=self.thresholds.apply_retries {
            if attempt > 0 {
                self.clock.sleep(self.thresholds.retry_delay).await;
                if let Err(e) = self.telemetry.refresh(&mut self.registry) {
                    warn!(error = %e, "Telemetry refresh failed while waiting");
                }
            }

            let Some(actual) = self.registry.get(rq.domid).and_then(|d| d.memory_actual) else {
                return true;
            };
            if rq.target <= actual {
                return true;
            }
            match self.telemetry.free_memory() {
                Ok(free) if self.thresholds.has_headroom(free, rq.target - actual) => return true,
                Ok(free) => debug!(domid = rq.domid, free, attempt, "Waiting for donors"),
                Err(e) => warn!(error = %e, "Could not read host free memory"),
            }
        }
        false
    }

    /// Donors did not release memory in time. Flag the ones lagging behind,
    /// give the stalled recipient what is safely free, and stop.
    fn handle_stall(
        &mut self,
        earlier: &[MemsetRequest],
        stalled: &MemsetRequest,
        before: &BTreeMap<DomId, Option<u64>>,
    ) {
        if let Err(e) = self.telemetry.refresh(&mut self.registry) {
            warn!(error = %e, "Telemetry refresh failed after stall");
        }

        let margin = self.thresholds.margin();
        let mut raised = Vec::new();
        for rq in earlier {
            let Some(dom) = self.registry.get_mut(rq.domid) else {
                continue;
            };
            if dom.memory_actual.is_none() || dom.converged(margin) {
                continue;
            }
            let unchanged = before.get(&rq.domid).copied().flatten() == dom.memory_actual;
            if unchanged {
                warn!(domid = dom.id, actual = ?dom.memory_actual, "Domain did not react to memory request");
                if !dom.no_progress {
                    dom.no_progress = true;
                    raised.push((dom.id, Condition::NoProgress));
                }
            } else {
                warn!(domid = dom.id, actual = ?dom.memory_actual, "Domain reacts slowly to memory request");
                if !dom.slow_memset_react {
                    dom.slow_memset_react = true;
                    raised.push((dom.id, Condition::SlowMemsetReact));
                }
            }
        }
        for (id, condition) in raised {
            self.notifier.raise(&self.telemetry.domain_name(id), condition);
        }

        let free = match self.telemetry.free_memory() {
            Ok(free) => free,
            Err(e) => {
                warn!(error = %e, "Could not read host free memory, aborting pass");
                return;
            }
        };
        let Some(dom) = self.registry.get_mut(stalled.domid) else {
            return;
        };
        let Some(actual) = dom.memory_actual else {
            return;
        };
        let target = free
            .saturating_add(actual)
            .saturating_sub(self.thresholds.free_mem_left)
            .clamp(actual, stalled.target.max(actual));
        warn!(domid = stalled.domid, planned = stalled.target, target, "Aborting pass after stall");
        self.actuator.set_target(dom, target);
    }

    /// Drop failure flags of domains that have since reached their target.
    pub fn clear_outdated_error_markers(&mut self) {
        let margin = self.thresholds.margin();
        let mut cleared = Vec::new();
        for dom in self.registry.iter_mut() {
            if !dom.converged(margin) {
                continue;
            }
            if dom.no_progress {
                dom.no_progress = false;
                cleared.push((dom.id, Condition::NoProgress));
            }
            if dom.slow_memset_react {
                dom.slow_memset_react = false;
                cleared.push((dom.id, Condition::SlowMemsetReact));
            }
        }
        for (id, condition) in cleared {
            self.notifier.clear(&self.telemetry.domain_name(id), condition);
        }
    }

    pub fn balancing_disabled(&self) -> bool {
        match self.store.exists(&self.disable_path) {
            Ok(present) => present,
            Err(e) => {
                debug!(error = %e, "Could not read balancing override");
                false
            }
        }
    }

    /// Free `amount` bytes for the host. Returns false when donors cannot
    /// cover it within the iteration budget.
    pub async fn request_balloon(&mut self, amount: u64) -> bool {
        let span = info_span!("balloon", pass = %Uuid::new_v4(), amount);
        self.balloon_loop(amount).instrument(span).await
    }

    async fn balloon_loop(&mut self, amount: u64) -> bool {
        self.reset_no_progress();

        let mut previous: Option<BTreeMap<DomId, Option<u64>>> = None;
        for iteration in 0..self.thresholds.balloon_iterations {
            if let Err(e) = self.telemetry.refresh(&mut self.registry) {
                warn!(iteration, error = %e, "Telemetry refresh failed");
                self.clock.sleep(self.thresholds.retry_delay).await;
                continue;
            }
            let free = match self.telemetry.free_memory() {
                Ok(free) => free,
                Err(e) => {
                    warn!(iteration, error = %e, "Could not read host free memory");
                    self.clock.sleep(self.thresholds.retry_delay).await;
                    continue;
                }
            };
            debug!(iteration, free, "Balloon iteration");

            if free >= amount.saturating_add(self.thresholds.free_mem_min) {
                self.inhibit_balloon_up();
                info!(free, "Balloon request satisfied");
                return true;
            }

            if let Some(previous) = previous.take() {
                self.flag_stuck_donors(&previous);
            }

            let need = amount
                .saturating_add(self.thresholds.free_mem_left)
                .saturating_sub(free);
            let requests = planner::balloon(need, &self.registry, &self.params);
            if requests.is_empty() {
                info!(need, free, "Not enough memory can be reclaimed");
                return false;
            }

            let mut applied = BTreeMap::new();
            for rq in &requests {
                if let Some(dom) = self.registry.get_mut(rq.domid) {
                    self.actuator.set_target(dom, rq.target);
                    applied.insert(rq.domid, dom.memory_actual);
                }
            }
            previous = Some(applied);
            self.clock.sleep(self.thresholds.retry_delay).await;
        }

        warn!(amount, "Balloon request ran out of iterations");
        false
    }

    fn reset_no_progress(&mut self) {
        let mut cleared = Vec::new();
        for dom in self.registry.iter_mut().filter(|dom| dom.no_progress) {
            dom.no_progress = false;
            cleared.push(dom.id);
        }
        for id in cleared {
            self.notifier.clear(&self.telemetry.domain_name(id), Condition::NoProgress);
        }
    }

    fn flag_stuck_donors(&mut self, previous: &BTreeMap<DomId, Option<u64>>) {
        let mut raised = Vec::new();
        for (id, before) in previous {
            let Some(dom) = self.registry.get_mut(*id) else {
                continue;
            };
            if dom.memory_actual == *before && !dom.no_progress {
                info!(domid = id, actual = ?dom.memory_actual, "Domain stuck, excluding from donors");
                dom.no_progress = true;
                raised.push(*id);
            }
        }
        for id in raised {
            self.notifier.raise(&self.telemetry.domain_name(id), Condition::NoProgress);
        }
    }

    /// Re-pin domains still below their target to what they hold now.
    pub fn inhibit_balloon_up(&mut self) {
        for dom in self.registry.iter_mut() {
            let Some(actual) = dom.memory_actual else {
                continue;
            };
            if actual.saturating_add(INHIBIT_SLACK) < dom.last_target {
                debug!(domid = dom.id, actual, last_target = dom.last_target, "Inhibiting balloon up");
                self.actuator.set_target(dom, actual);
            }
        }
    }

    pub fn status(&self) -> Vec<DomainStatus> {
        self.registry
            .iter()
            .map(|dom| DomainStatus {
                id: dom.id,
                memory_actual: dom.memory_actual,
                memory_maximum: dom.memory_maximum,
                mem_used: dom.mem_used,
                preference: planner::preference(dom, &self.params),
                last_target: dom.last_target,
                no_progress: dom.no_progress,
                slow_memset_react: dom.slow_memset_react,
            })
            .collect()
    }
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
