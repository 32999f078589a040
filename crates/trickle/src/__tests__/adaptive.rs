//! Commit cadence and transaction lifecycle under scripted idle state.

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use serde_json::json;

  use crate::__tests__::helpers::{
    StoreEventKind, TestContext, TestIndexer, await_completion, item_consumer_def, tracked_job, wait_until,
  };
  use crate::SchedulerConfig;

  #[tokio::test(start_paused = true)]
  async fn test_commit_cadence_stays_within_bounds_while_idle() {
    // One token per pass keeps each pass small, so virtual time advances
    // 32ms per pause and the commit clock dominates.
    let config = SchedulerConfig {
      max_tokens_per_batch: 1,
      initial_token_budget: 1,
      ..Default::default()
    };
    let ctx = TestContext::spawn_with(config);
    ctx.set_idle(Some(Duration::from_secs(60)));
    ctx
      .handle
      .register_indexer(TestIndexer::new("test").with_worker("bulk", item_consumer_def()))
      .await
      .unwrap();

    let items = (0..400).map(|i| json!(i)).collect();
    let (job, mut done) = tracked_job("bulk", items);
    ctx.handle.enqueue(job).await.unwrap();
    await_completion(&mut done).await;

    let commits = ctx.commit_times();
    assert!(!commits.is_empty(), "an idle system must commit during a long job");

    let first = commits[0] - ctx.spawned_at;
    assert!(
      first > Duration::from_millis(5000),
      "committed before the minimum cadence: {first:?}"
    );
    assert!(
      first < Duration::from_millis(20_000),
      "commit violated the maximum cadence: {first:?}"
    );
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_final_commit_is_deferred_while_user_is_active() {
    let ctx = TestContext::spawn();
    // Idle provider present, user active.
    ctx.set_idle(Some(Duration::ZERO));
    ctx
      .handle
      .register_indexer(TestIndexer::new("test").with_worker("quick", item_consumer_def()))
      .await
      .unwrap();

    let (job, mut done) = tracked_job("quick", vec![json!(1), json!(2)]);
    ctx.handle.enqueue(job).await.unwrap();
    await_completion(&mut done).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The batch ended with its transaction open; nothing committed yet.
    assert!(ctx.commit_times().is_empty(), "commit must wait for idle");

    // The user walks away; the deferred commit flushes.
    ctx.set_idle(Some(Duration::from_secs(10)));
    let log = ctx.store_log.clone();
    wait_until(move || {
      log
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.kind == StoreEventKind::Commit)
    })
    .await;
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhaustion_commits_immediately_when_idle() {
    let ctx = TestContext::spawn();
    ctx.set_idle(Some(Duration::from_secs(60)));
    ctx
      .handle
      .register_indexer(TestIndexer::new("test").with_worker("quick", item_consumer_def()))
      .await
      .unwrap();

    let (job, mut done) = tracked_job("quick", vec![json!(1)]);
    ctx.handle.enqueue(job).await.unwrap();
    await_completion(&mut done).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = ctx.store_events();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
      kinds,
      vec![StoreEventKind::Begin, StoreEventKind::Commit],
      "idle exhaustion pays the commit right away"
    );
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_next_batch_adopts_a_dangling_transaction() {
    let ctx = TestContext::spawn();
    ctx.set_idle(Some(Duration::ZERO));
    ctx
      .handle
      .register_indexer(TestIndexer::new("test").with_worker("quick", item_consumer_def()))
      .await
      .unwrap();

    let (first, mut first_done) = tracked_job("quick", vec![json!(1)]);
    ctx.handle.enqueue(first).await.unwrap();
    await_completion(&mut first_done).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (second, mut second_done) = tracked_job("quick", vec![json!(1)]);
    ctx.handle.enqueue(second).await.unwrap();
    await_completion(&mut second_done).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // One transaction spans both bursts: the second batch adopted the
    // first one's open transaction instead of opening its own.
    let begins = ctx
      .store_events()
      .iter()
      .filter(|e| e.kind == StoreEventKind::Begin)
      .count();
    assert_eq!(begins, 1);
    assert!(ctx.commit_times().is_empty());
    ctx.teardown().await;
  }
}
