// Balloon requests: the host asks for memory back from its guests.

mod common;

use anyhow::Result;
use common::{guest, harness, settings};
use vm_mem_balancer::hypervisor::Behavior;
use vm_mem_balancer::monitoring::Condition;
use vm_mem_balancer::utils::mib;

#[tokio::test]
async fn test_cooperative_donors_satisfy_request() -> Result<()> {
    let mut h = harness(2048, settings());
    h.seed(&[
        guest(1, 1000, 200, Behavior::Cooperative),
        guest(2, 800, 300, Behavior::Cooperative),
    ])
    .await;

    let amount = mib(600);
    assert!(h.state.request_balloon(amount).await);

    let minimum = h.state.thresholds().free_mem_min;
    assert!(h.host.free_memory() >= amount + minimum);
    assert!(h.clock.sleeps() < h.settings.balancer.balloon_iterations);
    // The larger donor gave up more.
    let given_1 = mib(1000) - h.host.actual(1).unwrap();
    let given_2 = mib(800) - h.host.actual(2).unwrap();
    assert!(given_1 > given_2);
    Ok(())
}

#[tokio::test]
async fn test_already_free_memory_needs_no_donors() -> Result<()> {
    let mut h = harness(4096, settings());
    h.seed(&[guest(1, 1000, 200, Behavior::Cooperative)]).await;

    assert!(h.state.request_balloon(mib(1024)).await);
    assert!(h.host.target_log().is_empty());
    assert_eq!(h.clock.sleeps(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stuck_donor_is_excluded_and_request_fails() -> Result<()> {
    let mut h = harness(2048, settings());
    h.seed(&[
        guest(1, 1000, 200, Behavior::Stuck),
        guest(2, 800, 300, Behavior::Slow { step: mib(1) }),
    ])
    .await;

    assert!(!h.state.request_balloon(mib(600)).await);

    // Every iteration of the budget was spent waiting on the slow donor.
    assert_eq!(h.clock.sleeps(), h.settings.balancer.balloon_iterations);
    assert!(h.state.domain(1).unwrap().no_progress);
    assert!(!h.state.domain(2).unwrap().no_progress);
    assert_eq!(
        h.notifier.active(),
        vec![("dom1".to_string(), Condition::NoProgress)]
    );
    // Only the first iteration asked the stuck domain for anything.
    assert_eq!(h.targets_for(1).len(), 1);
    assert_eq!(
        h.targets_for(2).len(),
        h.settings.balancer.balloon_iterations as usize
    );
    Ok(())
}

#[tokio::test]
async fn test_request_beyond_donor_excess_fails_immediately() -> Result<()> {
    let mut h = harness(2048, settings());
    h.seed(&[
        guest(1, 1000, 900, Behavior::Cooperative),
        guest(2, 800, 700, Behavior::Cooperative),
    ])
    .await;

    assert!(!h.state.request_balloon(mib(1024)).await);
    assert_eq!(h.clock.sleeps(), 0);
    assert!(h.host.target_log().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_new_request_gives_stuck_domains_another_chance() -> Result<()> {
    let mut h = harness(2048, settings());
    h.seed(&[
        guest(1, 1000, 200, Behavior::Stuck),
        guest(2, 800, 300, Behavior::Slow { step: mib(1) }),
    ])
    .await;
    assert!(!h.state.request_balloon(mib(600)).await);
    assert!(h.state.domain(1).unwrap().no_progress);

    h.host.set_behavior(1, Behavior::Cooperative);
    h.host.set_behavior(2, Behavior::Cooperative);
    assert!(h.state.request_balloon(mib(600)).await);

    assert!(!h.state.domain(1).unwrap().no_progress);
    assert!(h.targets_for(1).len() > 1);
    assert!(h.notifier.active().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_success_pins_domains_that_were_still_growing() -> Result<()> {
    let mut h = harness(2048, settings());
    h.seed(&[
        guest(1, 1000, 200, Behavior::Cooperative),
        guest(2, 400, 300, Behavior::Stuck),
    ])
    .await;
    // Domain 2 was promised more than it has picked up so far.
    h.state.set_target(2, mib(700))?;

    assert!(h.state.request_balloon(mib(400)).await);
    assert_eq!(h.state.domain(2).unwrap().last_target, mib(400));
    assert_eq!(h.host.target(2), Some(mib(400)));
    Ok(())
}
