// Balance pass scenarios against the simulated host.

mod common;

use anyhow::Result;
use common::{guest, harness, settings};
use vm_mem_balancer::hypervisor::Behavior;
use vm_mem_balancer::monitoring::Condition;
use vm_mem_balancer::utils::mib;

// Host with 10 MiB free: A holds 200 but wants 100, B holds 50 but wants 150.
fn scenario() -> common::Harness {
    harness(260, settings())
}

#[tokio::test]
async fn test_shrinks_donor_before_growing_recipient() -> Result<()> {
    let mut h = scenario();
    h.seed(&[
        guest(1, 200, 100, Behavior::Cooperative),
        guest(2, 50, 150, Behavior::Cooperative),
    ])
    .await;
    assert!(h.host.target_log().is_empty(), "disabled passes must not actuate");

    h.enable_balancing();
    h.state.balance().await;

    assert_eq!(h.host.target_log(), vec![(1, mib(100)), (2, mib(110))]);
    // B was only raised once A had released its memory.
    assert_eq!(h.clock.sleeps(), 1);
    assert_eq!(h.host.actual(1), Some(mib(100)));

    let a = h.state.domain(1).unwrap();
    assert!(!a.no_progress && !a.slow_memset_react);
    Ok(())
}

#[tokio::test]
async fn test_stuck_donor_is_flagged_and_recipient_not_raised() -> Result<()> {
    let mut h = scenario();
    h.seed(&[
        guest(1, 200, 100, Behavior::Stuck),
        guest(2, 50, 150, Behavior::Cooperative),
    ])
    .await;
    h.enable_balancing();
    h.state.balance().await;

    assert_eq!(h.clock.sleeps(), h.settings.balancer.apply_retries);
    let a = h.state.domain(1).unwrap();
    assert!(a.no_progress);
    assert!(!a.slow_memset_react);
    assert_eq!(h.notifier.active(), vec![("dom1".to_string(), Condition::NoProgress)]);

    // Free memory never allowed B past its current allocation.
    assert_eq!(h.targets_for(2), vec![mib(50)]);
    assert!(h.host.actual(2).unwrap() <= mib(50));
    Ok(())
}

#[tokio::test]
async fn test_slow_donor_is_flagged_slow_and_recipient_gets_what_is_free() -> Result<()> {
    let mut h = scenario();
    h.seed(&[
        guest(1, 200, 100, Behavior::Slow { step: mib(10) }),
        guest(2, 50, 150, Behavior::Cooperative),
    ])
    .await;
    h.enable_balancing();
    h.state.balance().await;

    let a = h.state.domain(1).unwrap();
    assert!(a.slow_memset_react);
    assert!(!a.no_progress);
    assert_eq!(
        h.notifier.active(),
        vec![("dom1".to_string(), Condition::SlowMemsetReact)]
    );

    // Five ticks freed 50 MiB on top of the 10 already free; B gets what
    // exceeds the reserve.
    assert_eq!(h.targets_for(2), vec![mib(60)]);
    Ok(())
}

#[tokio::test]
async fn test_flags_clear_once_domain_catches_up() -> Result<()> {
    let mut h = scenario();
    h.seed(&[
        guest(1, 200, 100, Behavior::Stuck),
        guest(2, 50, 150, Behavior::Cooperative),
    ])
    .await;
    h.enable_balancing();
    h.state.balance().await;
    assert!(h.state.domain(1).unwrap().no_progress);

    h.host.set_behavior(1, Behavior::Cooperative);
    h.host.tick();
    h.state.balance().await;

    assert!(!h.state.domain(1).unwrap().no_progress);
    assert!(h.notifier.active().is_empty());
    let cleared = h
        .notifier
        .events()
        .into_iter()
        .any(|e| !e.raised && e.condition == Condition::NoProgress);
    assert!(cleared);

    // With A back at its preference B finally gets its share.
    assert_eq!(h.targets_for(2).last().copied(), Some(mib(110)));
    Ok(())
}

#[tokio::test]
async fn test_override_disables_balancing() -> Result<()> {
    let mut h = scenario();
    h.seed(&[
        guest(1, 200, 100, Behavior::Cooperative),
        guest(2, 50, 150, Behavior::Cooperative),
    ])
    .await;

    h.state.balance().await;
    assert!(h.state.balancing_disabled());
    assert!(h.host.target_log().is_empty());
    // Telemetry is still collected.
    assert_eq!(h.state.domain(2).unwrap().memory_actual, Some(mib(50)));
    Ok(())
}

#[tokio::test]
async fn test_small_adjustments_are_skipped() -> Result<()> {
    let mut h = harness(600, settings());
    h.seed(&[guest(1, 545, 540, Behavior::Cooperative)]).await;
    h.state.set_target(1, mib(545))?;

    h.enable_balancing();
    h.state.balance().await;

    assert_eq!(h.targets_for(1), vec![mib(545)]);
    Ok(())
}

#[tokio::test]
async fn test_small_plan_runs_while_host_is_short_of_reserve() -> Result<()> {
    // 30 MiB free against a 50 MiB reserve, domain 25 MiB over its preference.
    let mut h = harness(330, settings());
    h.seed(&[guest(1, 300, 275, Behavior::Cooperative)]).await;
    h.state.set_target(1, mib(300))?;

    h.enable_balancing();
    h.state.balance().await;

    // The reserve is restored with the few MiB left over handed back.
    let targets = h.targets_for(1);
    assert_eq!(targets.len(), 2);
    assert!(targets[1] >= mib(275) && targets[1] <= mib(280), "{:?}", targets);
    assert_eq!(h.state.domain(1).unwrap().last_target, targets[1]);
    Ok(())
}

#[tokio::test]
async fn test_domains_without_reports_are_left_alone() -> Result<()> {
    let mut h = harness(2048, settings());
    h.seed(&[guest(1, 300, 200, Behavior::Cooperative)]).await;
    h.host.add_domain(2, mib(900), Some(mib(4096)), Behavior::Cooperative);
    h.state.add_domain(2);

    h.enable_balancing();
    h.state.balance().await;

    assert!(h.targets_for(2).is_empty());
    assert!(!h.targets_for(1).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_targets_stay_within_static_maximum() -> Result<()> {
    let mut h = harness(8192, settings());
    h.disable_balancing();
    h.host.add_domain(1, mib(200), Some(mib(512)), Behavior::Cooperative);
    h.host.add_domain(2, mib(200), Some(mib(4096)), Behavior::Cooperative);
    for id in [1, 2] {
        h.state.add_domain(id);
        h.state.report_meminfo(id, &mib(400).to_string()).await?;
    }

    h.enable_balancing();
    h.state.balance().await;

    assert!(h.targets_for(1).iter().all(|t| *t <= mib(512)));
    assert!(h.targets_for(2).iter().all(|t| *t <= mib(4096)));
    assert_eq!(h.state.domain(1).unwrap().memory_maximum, Some(mib(512)));
    Ok(())
}
