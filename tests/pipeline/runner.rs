use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use projblock::{
    EventPublisher, EventStore, IngestConfig, IngestStrategy, MemoryEventStore,
    MemoryProjectionStore, ProjectionStore, RecordingPublisher, Runner, SyncDispatcherParams,
};
use tokio::time::{sleep, timeout};

use crate::support::chain::MockChain;
use crate::support::helpers::{
    assert_is_contiguous, committed_heights, fast_poll_config, init_tracing, wait_for_checkpoint,
    HeaderProjection,
};

struct RunnerFixture {
    runner: Runner,
    projection_store: Arc<MemoryProjectionStore>,
}

fn runner_fixture(config: IngestConfig, chain: MockChain) -> RunnerFixture {
    let projection_store = Arc::new(MemoryProjectionStore::new());
    let runner = Runner::new(SyncDispatcherParams {
        config,
        provider: Arc::new(chain),
        projection: Arc::new(HeaderProjection),
        event_store: Arc::new(MemoryEventStore::new()) as Arc<dyn EventStore>,
        projection_store: Arc::clone(&projection_store) as Arc<dyn ProjectionStore>,
        publisher: Arc::new(RecordingPublisher::new()) as Arc<dyn EventPublisher>,
    });
    RunnerFixture {
        runner,
        projection_store,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(30);
    let mut fixture = runner_fixture(fast_poll_config(0), chain);

    fixture.runner.start().await?;
    wait_for_checkpoint(&fixture.projection_store, 9, Duration::from_secs(10)).await?;
    fixture.runner.stop().await?;

    fixture.runner.start().await?;
    wait_for_checkpoint(&fixture.projection_store, 29, Duration::from_secs(15)).await?;
    fixture.runner.stop().await?;

    let heights = committed_heights(&fixture.projection_store).await;
    assert_eq!(heights.len(), 30, "no block projected twice, none skipped");
    assert_is_contiguous(&heights);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_when_the_provider_stays_dark() -> Result<()> {
    init_tracing();
    let config = IngestConfig::builder()
        .strategy(IngestStrategy::PollProvider)
        .start_height(0)
        .fetch_concurrency(2)
        .poll_interval(Duration::from_millis(5))
        .max_poll_interval(Duration::from_millis(40))
        .fetch_retry_attempts(2)
        .command_retry_initial_backoff(Duration::from_millis(5))
        .command_retry_max_backoff(Duration::from_millis(20))
        .build()?;
    let chain = MockChain::new(8);
    chain.set_offline(true);
    let mut fixture = runner_fixture(config, chain);

    let err = timeout(Duration::from_secs(10), fixture.runner.run_until_ctrl_c())
        .await
        .expect("runner should give up before the timeout")
        .expect_err("an unreachable provider must abort the pipeline");
    let message = format!("{err:#}");
    assert!(
        message.contains("block sync pipeline aborted"),
        "unexpected error: {message}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_cancellation_stops_the_runner() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(8);
    let mut fixture = runner_fixture(fast_poll_config(0), chain);

    let token = fixture.runner.cancellation_token();
    tokio::spawn(async move {
        sleep(Duration::from_millis(150)).await;
        token.cancel();
    });

    timeout(Duration::from_secs(10), fixture.runner.run_until_ctrl_c())
        .await
        .expect("cancellation should end the run")?;
    Ok(())
}
