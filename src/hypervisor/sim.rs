//! In-process simulated host.
//!
//! Domains move toward their balloon target only when the host ticks, and a
//! `SimClock` ticks the host instead of (or in addition to) sleeping. That keeps
//! convergence loops deterministic in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{domain_path, Clock, ConfigStore, DomainMemory, Hypervisor, PhysInfo};
use crate::core::domain::DomId;
use crate::errors::{HypervisorError, StoreError};
use crate::utils::KIB;

/// How a simulated guest reacts to balloon targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reaches its target on the next tick.
    Cooperative,
    /// Never changes its memory.
    Stuck,
    /// Moves at most `step` bytes per tick.
    Slow { step: u64 },
}

impl Behavior {
    fn step(&self, wanted: u64) -> u64 {
        match *self {
            Behavior::Cooperative => wanted,
            Behavior::Stuck => 0,
            Behavior::Slow { step } => wanted.min(step),
        }
    }
}

#[derive(Debug, Clone)]
struct SimDomain {
    actual: u64,
    max_mem: u64,
    target: u64,
    behavior: Behavior,
}

#[derive(Debug, Default)]
struct SimInner {
    total: u64,
    domains: BTreeMap<DomId, SimDomain>,
    store: BTreeMap<String, String>,
    gone: BTreeSet<DomId>,
    target_log: Vec<(DomId, u64)>,
    ticks: u64,
}

impl SimInner {
    fn free(&self) -> u64 {
        let committed: u64 = self.domains.values().map(|d| d.actual).sum();
        self.total.saturating_sub(committed)
    }
}

pub struct SimHost {
    inner: Mutex<SimInner>,
}

impl SimHost {
    pub fn new(total_memory: u64) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                total: total_memory,
                ..Default::default()
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a domain holding `actual` bytes. `static_max` lands in the store
    /// the way a toolstack would publish it.
    pub fn add_domain(&self, domid: DomId, actual: u64, static_max: Option<u64>, behavior: Behavior) {
        let mut inner = self.inner();
        let max_mem = static_max.unwrap_or(inner.total);
        inner.domains.insert(
            domid,
            SimDomain {
                actual,
                max_mem,
                target: actual,
                behavior,
            },
        );
        inner
            .store
            .insert(domain_path(domid, "name"), format!("dom{}", domid));
        if let Some(max) = static_max {
            inner
                .store
                .insert(domain_path(domid, "memory/static-max"), (max / KIB).to_string());
        }
    }

    pub fn remove_domain(&self, domid: DomId) {
        let mut inner = self.inner();
        inner.domains.remove(&domid);
        let prefix = domain_path(domid, "");
        inner.store.retain(|path, _| !path.starts_with(&prefix));
    }

    pub fn set_behavior(&self, domid: DomId, behavior: Behavior) {
        if let Some(dom) = self.inner().domains.get_mut(&domid) {
            dom.behavior = behavior;
        }
    }

    /// Make hypervisor calls for `domid` fail as if it were shutting down.
    pub fn mark_gone(&self, domid: DomId) {
        self.inner().gone.insert(domid);
    }

    pub fn actual(&self, domid: DomId) -> Option<u64> {
        self.inner().domains.get(&domid).map(|d| d.actual)
    }

    pub fn target(&self, domid: DomId) -> Option<u64> {
        self.inner().domains.get(&domid).map(|d| d.target)
    }

    pub fn max_mem(&self, domid: DomId) -> Option<u64> {
        self.inner().domains.get(&domid).map(|d| d.max_mem)
    }

    pub fn free_memory(&self) -> u64 {
        self.inner().free()
    }

    /// Every balloon target the hypervisor accepted, in call order.
    pub fn target_log(&self) -> Vec<(DomId, u64)> {
        self.inner().target_log.clone()
    }

    pub fn ticks(&self) -> u64 {
        self.inner().ticks
    }

    pub fn store_value(&self, path: &str) -> Option<String> {
        self.inner().store.get(path).cloned()
    }

    pub fn remove_store_value(&self, path: &str) {
        self.inner().store.remove(path);
    }

    /// Advance every domain one step toward its target. Shrinks run first so
    /// the memory they release is available to growing domains.
    pub fn tick(&self) {
        let mut inner = self.inner();
        inner.ticks += 1;

        let mut free = inner.free();
        for dom in inner.domains.values_mut() {
            if dom.target < dom.actual {
                let step = dom.behavior.step(dom.actual - dom.target);
                dom.actual -= step;
                free += step;
            }
        }
        for dom in inner.domains.values_mut() {
            let ceiling = dom.target.min(dom.max_mem);
            if ceiling > dom.actual {
                let step = dom.behavior.step(ceiling - dom.actual).min(free);
                dom.actual += step;
                free -= step;
            }
        }
    }
}

impl Hypervisor for SimHost {
    fn list_domains(&self) -> Result<Vec<DomainMemory>, HypervisorError> {
        Ok(self
            .inner()
            .domains
            .iter()
            .map(|(domid, dom)| DomainMemory {
                domid: *domid,
                memory_actual: dom.actual,
            })
            .collect())
    }

    fn physinfo(&self) -> Result<PhysInfo, HypervisorError> {
        let inner = self.inner();
        Ok(PhysInfo {
            total_memory: inner.total,
            free_memory: inner.free(),
        })
    }

    fn set_max_mem(&self, domid: DomId, bytes: u64) -> Result<(), HypervisorError> {
        let mut inner = self.inner();
        if inner.gone.contains(&domid) {
            return Err(HypervisorError::DomainGone { domid });
        }
        let dom = inner
            .domains
            .get_mut(&domid)
            .ok_or(HypervisorError::DomainGone { domid })?;
        dom.max_mem = bytes;
        Ok(())
    }

    fn set_target_mem(&self, domid: DomId, bytes: u64) -> Result<(), HypervisorError> {
        let mut inner = self.inner();
        if inner.gone.contains(&domid) {
            return Err(HypervisorError::DomainGone { domid });
        }
        let dom = inner
            .domains
            .get_mut(&domid)
            .ok_or(HypervisorError::DomainGone { domid })?;
        dom.target = bytes;
        inner.target_log.push((domid, bytes));
        Ok(())
    }
}

impl ConfigStore for SimHost {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner().store.get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        self.inner().store.insert(path.to_string(), value.to_string());
        Ok(())
    }
}

/// Clock that advances a `SimHost` on every sleep.
pub struct SimClock {
    host: Arc<SimHost>,
    realtime: bool,
    sleeps: AtomicU32,
}

impl SimClock {
    /// Ticks without waiting; for tests.
    pub fn new(host: Arc<SimHost>) -> Self {
        Self {
            host,
            realtime: false,
            sleeps: AtomicU32::new(0),
        }
    }

    /// Sleeps for real, then ticks; for running the daemon against the simulator.
    pub fn realtime(host: Arc<SimHost>) -> Self {
        Self {
            realtime: true,
            ..Self::new(host)
        }
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Clock for SimClock {
    async fn sleep(&self, duration: Duration) {
        if self.realtime {
            tokio::time::sleep(duration).await;
        }
        self.host.tick();
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}
