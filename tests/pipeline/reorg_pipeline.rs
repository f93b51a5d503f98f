use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use projblock::{IngestConfig, IngestStrategy, SyncEvent};
use tokio::time::sleep;

use crate::support::chain::MockChain;
use crate::support::helpers::{
    arm_ingestion, assert_is_contiguous, committed_heights, fast_poll_config, harness,
    init_tracing, wait_for_checkpoint, HEADERS,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_at_the_tip_is_unwound_and_replayed() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(16);
    let mut fixture = harness(fast_poll_config(0), chain);

    fixture.dispatcher.start().await?;
    arm_ingestion(&fixture.dispatcher, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 15, Duration::from_secs(10)).await?;

    let abandoned_hash = fixture
        .chain
        .hash_at(12)
        .expect("height 12 exists")
        .to_string();

    // Rewrite everything above height 10 and extend the replacement branch
    // past the old tip so the next fetch exposes the fork.
    fixture.chain.force_reorg(10, 10)?;
    fixture.chain.set_tip_limit(20);

    wait_for_checkpoint(&fixture.projection_store, 20, Duration::from_secs(15)).await?;

    let telemetry = fixture.dispatcher.telemetry();
    assert_eq!(telemetry.reorgs_started(), 1);
    assert_eq!(telemetry.reorgs_resolved(), 1);

    let events = fixture.publisher.events().await;
    assert!(
        events
            .iter()
            .any(|event| matches!(event, SyncEvent::ReorgStarted { height: 15, .. })),
        "fork should be announced at the tip it was detected on"
    );
    assert!(
        events
            .iter()
            .any(|event| matches!(event, SyncEvent::ReorgFinished { height: 10, .. })),
        "recovery should resolve at the fork point"
    );

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 21, "0..=20 after the replacement branch");
    assert_is_contiguous(&heights);

    assert!(
        fixture
            .projection_store
            .row(HEADERS.collection(), &abandoned_hash)
            .await
            .is_none(),
        "rows from the abandoned branch must be rolled back"
    );
    let replacement_hash = fixture
        .chain
        .hash_at(12)
        .expect("height 12 exists on the new branch")
        .to_string();
    assert!(
        fixture
            .projection_store
            .row(HEADERS.collection(), &replacement_hash)
            .await
            .is_some(),
        "the replacement block at the same height must be projected"
    );

    fixture.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_deeper_than_the_lookback_window_is_fatal() -> Result<()> {
    init_tracing();
    let config = IngestConfig::builder()
        .strategy(IngestStrategy::PollProvider)
        .start_height(0)
        .fetch_concurrency(3)
        .poll_interval(Duration::from_millis(5))
        .max_poll_interval(Duration::from_millis(40))
        .reorg_window_size(4)
        .command_retry_initial_backoff(Duration::from_millis(5))
        .command_retry_max_backoff(Duration::from_millis(20))
        .build()?;
    let chain = MockChain::new(12);
    let mut fixture = harness(config, chain);

    fixture.dispatcher.start().await?;
    arm_ingestion(&fixture.dispatcher, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 11, Duration::from_secs(10)).await?;

    // The fork sits at height 2 while the walk can only look 4 blocks back.
    fixture.chain.force_reorg(2, 15)?;
    fixture.chain.advance_tip_by(6);

    let telemetry = fixture.dispatcher.telemetry();
    let started = Instant::now();
    while telemetry.reorgs_started() == 0 {
        if started.elapsed() > Duration::from_secs(5) {
            bail!("fork was never detected");
        }
        sleep(Duration::from_millis(25)).await;
    }
    sleep(Duration::from_millis(500)).await;

    let err = fixture
        .dispatcher
        .stop()
        .await
        .expect_err("an unresolvable fork must abort the pipeline");
    let message = format!("{err:#}");
    assert!(
        message.contains("block sync pipeline aborted"),
        "unexpected error: {message}"
    );
    assert!(
        message.contains("common ancestor"),
        "unexpected error: {message}"
    );
    assert_eq!(telemetry.reorgs_resolved(), 0);
    Ok(())
}
