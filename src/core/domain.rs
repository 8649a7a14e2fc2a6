use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::meminfo::Meminfo;

/// Hypervisor domain id. Domain 0 is the privileged control domain.
pub type DomId = u32;

pub const CONTROL_DOMAIN: DomId = 0;

/// Everything the balancer knows about one live domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainState {
    pub id: DomId,
    /// Last sanitized sample from the guest, `None` until one arrives.
    pub meminfo: Option<Meminfo>,
    /// Bytes currently committed, as reported by the hypervisor.
    pub memory_actual: Option<u64>,
    /// Static cap in bytes.
    pub memory_maximum: Option<u64>,
    pub mem_used: Option<u64>,
    /// Last target handed to the actuator, in bytes.
    pub last_target: u64,
    pub no_progress: bool,
    pub slow_memset_react: bool,
}

impl DomainState {
    pub fn new(id: DomId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// True once the domain holds no more than `margin` above its last target.
    pub fn converged(&self, margin: u64) -> bool {
        self.memory_actual
            .is_some_and(|actual| actual <= self.last_target.saturating_add(margin))
    }
}

/// Read-only view of a domain served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainStatus {
    pub id: DomId,
    pub memory_actual: Option<u64>,
    pub memory_maximum: Option<u64>,
    pub mem_used: Option<u64>,
    pub preference: Option<u64>,
    pub last_target: u64,
    pub no_progress: bool,
    pub slow_memset_react: bool,
}

/// One state record per live domain, ordered by id so passes are deterministic.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    domains: BTreeMap<DomId, DomainState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `id`. Re-adding a tracked domain resets its record.
    pub fn add(&mut self, id: DomId) {
        self.domains.insert(id, DomainState::new(id));
    }

    pub fn remove(&mut self, id: DomId) -> Option<DomainState> {
        self.domains.remove(&id)
    }

    pub fn get(&self, id: DomId) -> Option<&DomainState> {
        self.domains.get(&id)
    }

    pub fn get_mut(&mut self, id: DomId) -> Option<&mut DomainState> {
        self.domains.get_mut(&id)
    }

    pub fn contains(&self, id: DomId) -> bool {
        self.domains.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<DomId> {
        self.domains.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainState> {
        self.domains.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DomainState> {
        self.domains.values_mut()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// `memory_actual` of every domain, for progress detection.
    pub fn actual_by_id(&self) -> BTreeMap<DomId, Option<u64>> {
        self.domains
            .iter()
            .map(|(id, dom)| (*id, dom.memory_actual))
            .collect()
    }
}

impl FromIterator<DomainState> for Registry {
    fn from_iter<I: IntoIterator<Item = DomainState>>(iter: I) -> Self {
        Self {
            domains: iter.into_iter().map(|dom| (dom.id, dom)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_domains() {
        let mut registry = Registry::new();
        registry.add(3);
        registry.add(1);
        assert_eq!(registry.ids(), vec![1, 3]);
        assert_eq!(registry.get(3).unwrap().last_target, 0);
        assert!(registry.get(3).unwrap().meminfo.is_none());

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_adding_resets_state() {
        let mut registry = Registry::new();
        registry.add(5);
        registry.get_mut(5).unwrap().no_progress = true;
        registry.add(5);
        assert!(!registry.get(5).unwrap().no_progress);
    }

    #[test]
    fn convergence_respects_margin() {
        let mut dom = DomainState::new(2);
        assert!(!dom.converged(10), "unknown actual is never converged");

        dom.last_target = 100;
        dom.memory_actual = Some(110);
        assert!(dom.converged(10));
        dom.memory_actual = Some(111);
        assert!(!dom.converged(10));
    }
}
