use std::time::Duration;

use anyhow::Result;
use projblock::SyncEvent;
use serde_json::json;

use crate::support::chain::MockChain;
use crate::support::helpers::{
    arm_ingestion, assert_is_contiguous, committed_heights, dispatcher_over, fast_poll_config,
    harness, init_tracing, wait_for_checkpoint, HEADERS,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_projects_the_whole_chain() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(24);
    let mut fixture = harness(fast_poll_config(0), chain);

    fixture.dispatcher.start().await?;
    arm_ingestion(&fixture.dispatcher, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 23, Duration::from_secs(10)).await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 24, "one row per block");
    assert_eq!(heights.first(), Some(&0));
    assert_eq!(heights.last(), Some(&23));
    assert_is_contiguous(&heights);

    let hash = fixture
        .chain
        .hash_at(12)
        .expect("height 12 exists")
        .to_string();
    let row = fixture
        .projection_store
        .row(HEADERS.collection(), &hash)
        .await
        .expect("row for height 12 should exist");
    assert_eq!(row.get("tx_count"), Some(&json!(0)));
    assert_eq!(row.get(HEADERS.height_field()), Some(&json!(12)));

    let telemetry = fixture.dispatcher.telemetry();
    assert_eq!(telemetry.projected_blocks(), 24);
    assert_eq!(telemetry.commit_failures(), 0);
    assert_eq!(telemetry.reorgs_started(), 0);

    let events = fixture.publisher.events().await;
    assert!(!events.is_empty(), "progress events should be published");
    let mut covered = 0;
    for event in &events {
        match event {
            SyncEvent::BatchAccepted {
                first_height,
                last_height,
                ..
            } => covered += last_height - first_height + 1,
            other => panic!("unexpected event during a clean sync: {other:?}"),
        }
    }
    assert_eq!(covered, 24, "accepted batches should cover the chain once");

    fixture.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_follows_tip_growth() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(40);
    chain.set_tip_limit(11);
    let mut fixture = harness(fast_poll_config(0), chain);

    fixture.dispatcher.start().await?;
    arm_ingestion(&fixture.dispatcher, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 11, Duration::from_secs(10)).await?;

    fixture.chain.advance_tip_by(12);
    wait_for_checkpoint(&fixture.projection_store, 23, Duration::from_secs(10)).await?;

    fixture.chain.set_tip_limit(39);
    wait_for_checkpoint(&fixture.projection_store, 39, Duration::from_secs(10)).await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 40);
    assert_is_contiguous(&heights);

    fixture.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_from_the_projection_checkpoint() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(20);
    chain.set_tip_limit(9);
    let mut fixture = harness(fast_poll_config(0), chain);

    fixture.dispatcher.start().await?;
    arm_ingestion(&fixture.dispatcher, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 9, Duration::from_secs(10)).await?;
    fixture.dispatcher.stop().await?;

    fixture.chain.set_tip_limit(19);
    let restart_publisher = std::sync::Arc::new(projblock::RecordingPublisher::new());
    let mut restarted = dispatcher_over(
        fast_poll_config(0),
        fixture.chain.clone(),
        &fixture.event_store,
        &fixture.projection_store,
        &restart_publisher,
    );

    restarted.start().await?;
    arm_ingestion(&restarted, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 19, Duration::from_secs(10)).await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 20, "no block projected twice, none skipped");
    assert_is_contiguous(&heights);

    let events = restart_publisher.events().await;
    match events.first() {
        Some(SyncEvent::BatchAccepted { first_height, .. }) => {
            assert_eq!(
                *first_height, 10,
                "resume should continue past the checkpoint, not refetch history"
            );
        }
        other => panic!("expected an accepted batch after restart, got {other:?}"),
    }

    restarted.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_fetch_failures_are_retried() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(12);
    chain.fail_next_fetches(3);
    let mut fixture = harness(fast_poll_config(0), chain);

    fixture.dispatcher.start().await?;
    arm_ingestion(&fixture.dispatcher, 0).await?;
    wait_for_checkpoint(&fixture.projection_store, 11, Duration::from_secs(10)).await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 12);
    assert_is_contiguous(&heights);
    assert!(
        fixture.dispatcher.telemetry().provider_retries() >= 3,
        "each scripted failure should be retried"
    );

    fixture.dispatcher.stop().await?;
    Ok(())
}
