use std::time::Duration;

use anyhow::Result;
use projblock::{IngestConfig, IngestStrategy, PushOutcome, SyncEvent};
use tokio::time::sleep;

use crate::support::chain::MockChain;
use crate::support::helpers::{
    arm_ingestion, assert_is_contiguous, committed_heights, harness, init_tracing,
    wait_for_checkpoint, wait_for_push_floor, HEADERS,
};

fn push_config() -> IngestConfig {
    IngestConfig::builder()
        .strategy(IngestStrategy::WebhookPush)
        .start_height(0)
        .command_retry_initial_backoff(Duration::from_millis(5))
        .command_retry_max_backoff(Duration::from_millis(20))
        .build()
        .expect("test config should build")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pushed_blocks_are_validated_and_projected() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(16);
    let mut fixture = harness(push_config(), chain);

    fixture.dispatcher.start().await?;
    let gate = fixture
        .dispatcher
        .push_gate()
        .expect("push strategy exposes a gate");
    arm_ingestion(&fixture.dispatcher, 0).await?;
    sleep(Duration::from_millis(100)).await;

    for height in 0..=11 {
        let block = fixture.chain.block_at(height).expect("height exists");
        assert_eq!(
            gate.push(block).await,
            PushOutcome::Admitted,
            "in-order push at height {height}"
        );
    }
    wait_for_checkpoint(&fixture.projection_store, 11, Duration::from_secs(10)).await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 12);
    assert_is_contiguous(&heights);

    let redelivered = fixture.chain.block_at(5).expect("height exists");
    assert_eq!(
        gate.push(redelivered).await,
        PushOutcome::Duplicate { height: 5 }
    );
    let skipped = fixture.chain.block_at(14).expect("height exists");
    assert_eq!(
        gate.push(skipped).await,
        PushOutcome::Gap {
            height: 14,
            expected: 12
        }
    );

    fixture.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pushed_fork_re_arms_the_gate_at_the_fork_point() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(10);
    let mut fixture = harness(push_config(), chain);

    fixture.dispatcher.start().await?;
    let gate = fixture
        .dispatcher
        .push_gate()
        .expect("push strategy exposes a gate");
    arm_ingestion(&fixture.dispatcher, 0).await?;
    sleep(Duration::from_millis(100)).await;

    for height in 0..=9 {
        let block = fixture.chain.block_at(height).expect("height exists");
        assert_eq!(gate.push(block).await, PushOutcome::Admitted);
    }
    wait_for_checkpoint(&fixture.projection_store, 9, Duration::from_secs(10)).await?;

    let abandoned_hash = fixture
        .chain
        .hash_at(8)
        .expect("height 8 exists")
        .to_string();

    // Replace everything above height 6, then push the first block past the
    // old tip; its parent comes from the new branch and exposes the fork.
    fixture.chain.force_reorg(6, 8)?;
    let fork_block = fixture.chain.block_at(10).expect("new branch reaches 10");
    assert_eq!(gate.push(fork_block).await, PushOutcome::Admitted);

    wait_for_push_floor(&gate, 7, Duration::from_secs(10)).await?;

    for height in 7..=14 {
        let block = fixture.chain.block_at(height).expect("height exists");
        assert_eq!(
            gate.push(block).await,
            PushOutcome::Admitted,
            "replay push at height {height}"
        );
    }
    wait_for_checkpoint(&fixture.projection_store, 14, Duration::from_secs(10)).await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 15, "0..=14 after the replacement branch");
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
        .hash_at(8)
        .expect("height 8 exists on the new branch")
        .to_string();
    assert!(
        fixture
            .projection_store
            .row(HEADERS.collection(), &replacement_hash)
            .await
            .is_some(),
        "the replacement block at the same height must be projected"
    );

    let events = fixture.publisher.events().await;
    assert!(
        events
            .iter()
            .any(|event| matches!(event, SyncEvent::ReorgFinished { height: 6, .. })),
        "recovery should resolve at the fork point"
    );

    fixture.dispatcher.stop().await?;
    Ok(())
}
