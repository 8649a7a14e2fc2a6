//! Allocation planning.
//!
//! Everything here is a pure function of a borrowed registry: the planner
//! proposes `(domain, target)` requests and the supervisor decides whether and
//! how to apply them. Domains without a usage sample, without telemetry, or
//! flagged `no_progress` are left out of every plan.

use serde::Serialize;
use std::cmp::Reverse;

use crate::config::PlannerSettings;
use crate::core::domain::{DomId, DomainState, Registry, CONTROL_DOMAIN};
use crate::utils::mib;

/// Shaves proportional targets so rounding never hands out more than exists.
const ROUNDING_GUARD: f64 = 0.999;

#[derive(Debug, Clone)]
pub struct PlannerParams {
    /// Multiplier on reported usage leaving room for page cache.
    pub cache_factor: f64,
    /// Extra headroom for the control domain, which serves every guest's I/O.
    pub control_domain_boost: u64,
    /// No target is ever proposed below this.
    pub reserved_floor: u64,
    /// Donors closer than this to their preference are not asked to shrink
    /// while the host is short.
    pub donor_min_excess: u64,
    /// Over-asks balloon donors slightly so rounding in the guest cannot stall a request.
    pub balloon_safety_factor: f64,
}

impl Default for PlannerParams {
    fn default() -> Self {
        Self::from(&PlannerSettings::default())
    }
}

impl From<&PlannerSettings> for PlannerParams {
    fn from(settings: &PlannerSettings) -> Self {
        Self {
            cache_factor: settings.cache_factor,
            control_domain_boost: mib(settings.control_domain_boost_mib),
            reserved_floor: mib(settings.reserved_floor_mib),
            donor_min_excess: mib(settings.donor_min_excess_mib),
            balloon_safety_factor: settings.balloon_safety_factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemsetRequest {
    pub domid: DomId,
    pub target: u64,
}

impl MemsetRequest {
    pub fn new(domid: DomId, target: u64) -> Self {
        Self { domid, target }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: DomId,
    actual: u64,
    maximum: u64,
    pref: u64,
}

impl Candidate {
    fn is_donor(&self) -> bool {
        self.actual > self.pref
    }

    fn is_recipient(&self) -> bool {
        self.actual < self.pref && self.actual < self.maximum
    }

    fn need(&self) -> i128 {
        self.pref as i128 - self.actual as i128
    }
}

/// Memory the domain should hold for its current demand, or `None` when the
/// domain has not reported usage yet or has no telemetry.
pub fn preference(dom: &DomainState, params: &PlannerParams) -> Option<u64> {
    dom.meminfo.as_ref()?;
    let used = dom.mem_used?;
    let maximum = dom.memory_maximum?;

    let mut pref = (used as f64 * params.cache_factor) as u64;
    if dom.id == CONTROL_DOMAIN {
        pref = pref.saturating_add(params.control_domain_boost);
    }
    Some(clamp_target(pref, maximum, params.reserved_floor))
}

fn clamp_target(target: u64, maximum: u64, floor: u64) -> u64 {
    target.max(floor.min(maximum)).min(maximum)
}

fn candidates(registry: &Registry, params: &PlannerParams) -> Vec<Candidate> {
    registry
        .iter()
        .filter(|dom| !dom.no_progress)
        .filter_map(|dom| {
            Some(Candidate {
                id: dom.id,
                actual: dom.memory_actual?,
                maximum: dom.memory_maximum?,
                pref: preference(dom, params)?,
            })
        })
        .collect()
}

/// Plan targets that move host free memory by `delta` bytes (positive:
/// surplus to hand out, negative: memory to reclaim). Shrink requests always
/// come before grow requests.
pub fn balance(delta: i64, registry: &Registry, params: &PlannerParams) -> Vec<MemsetRequest> {
    let candidates = candidates(registry, params);
    if candidates.is_empty() {
        return Vec::new();
    }

    let total_need: i128 = candidates.iter().map(Candidate::need).sum();
    let available = delta as i128 - total_need;
    if available > 0 {
        balance_with_surplus(&candidates, available, params)
    } else {
        balance_with_shortage(&candidates, delta as i128, params)
    }
}

/// Everyone can sit at preference with memory to spare: hand the rest out
/// proportionally to preference.
fn balance_with_surplus(
    candidates: &[Candidate],
    available: i128,
    params: &PlannerParams,
) -> Vec<MemsetRequest> {
    let total_pref: u128 = candidates.iter().map(|c| c.pref as u128).sum();
    if total_pref == 0 {
        return Vec::new();
    }

    let mut shrink = Vec::new();
    let mut grow = Vec::new();
    for c in candidates {
        let share = available as f64 * c.pref as f64 / total_pref as f64;
        let target = ((c.pref as f64 + share) * ROUNDING_GUARD) as u64;
        let target = clamp_target(target, c.maximum, params.reserved_floor);
        if target < c.actual {
            shrink.push(MemsetRequest::new(c.id, target));
        } else if target > c.actual {
            grow.push((c.need(), MemsetRequest::new(c.id, target)));
        }
    }

    grow.sort_by_key(|(need, rq)| (Reverse(*need), rq.domid));
    shrink.extend(grow.into_iter().map(|(_, rq)| rq));
    shrink
}

/// Not enough for everyone's preference: pull donors down to preference and
/// give what that frees to the neediest recipients. If even that leaves the
/// host short, squeeze donors below preference in proportion to it.
fn balance_with_shortage(
    candidates: &[Candidate],
    delta: i128,
    params: &PlannerParams,
) -> Vec<MemsetRequest> {
    let donors: Vec<&Candidate> = candidates.iter().filter(|c| c.is_donor()).collect();

    let mut requests = Vec::new();
    let mut free_after = delta;
    for d in &donors {
        let excess = d.actual - d.pref;
        if excess < params.donor_min_excess {
            continue;
        }
        free_after += excess as i128;
        requests.push(MemsetRequest::new(d.id, d.pref));
    }

    if free_after >= 0 {
        let mut recipients: Vec<&Candidate> =
            candidates.iter().filter(|c| c.is_recipient()).collect();
        recipients.sort_by_key(|c| (Reverse(c.need()), c.id));

        let mut budget = free_after as u64;
        for r in recipients {
            if budget == 0 {
                break;
            }
            let give = (r.pref - r.actual).min(budget);
            let target = clamp_target(r.actual + give, r.maximum, params.reserved_floor);
            if target > r.actual {
                budget = budget.saturating_sub(target - r.actual);
                requests.push(MemsetRequest::new(r.id, target));
            }
        }
        return requests;
    }

    let shortfall = (-free_after) as f64;
    let total_pref: f64 = donors.iter().map(|d| d.pref as f64).sum();
    if total_pref <= 0.0 {
        return requests;
    }

    donors
        .iter()
        .filter_map(|d| {
            let cut = shortfall * d.pref as f64 / total_pref;
            let target = (d.pref as f64 - cut).max(0.0) as u64;
            let target = clamp_target(target, d.maximum, params.reserved_floor);
            (target < d.actual).then(|| MemsetRequest::new(d.id, target))
        })
        .collect()
}

/// Plan shrink-only targets that free `amount` bytes for the host itself.
/// Returns nothing when the donors together cannot cover `amount`.
pub fn balloon(amount: u64, registry: &Registry, params: &PlannerParams) -> Vec<MemsetRequest> {
    if amount == 0 {
        return Vec::new();
    }

    let donors: Vec<(Candidate, u64)> = candidates(registry, params)
        .into_iter()
        .filter(Candidate::is_donor)
        .map(|c| (c, c.actual - c.pref))
        .collect();
    let available: u128 = donors.iter().map(|(_, excess)| *excess as u128).sum();
    if available < amount as u128 {
        return Vec::new();
    }

    let scale = amount as f64 / available as f64;
    donors
        .into_iter()
        .filter_map(|(c, excess)| {
            let borrowed = (excess as f64 * scale * params.balloon_safety_factor) as u64;
            let target = clamp_target(
                c.actual.saturating_sub(borrowed),
                c.maximum,
                params.reserved_floor,
            );
            (target < c.actual).then(|| MemsetRequest::new(c.id, target))
        })
        .collect()
}
