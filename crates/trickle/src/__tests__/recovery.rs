//! Failure containment: recover hooks, cleanup, kill, and purge.

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};
  use std::time::Duration;

  use serde_json::json;

  use crate::__tests__::helpers::{
    AlwaysFails, Flaky, HoldsAsync, TestContext, TestIndexer, await_completion, item_consumer_def, tracked_job,
    wait_until,
  };
  use crate::{CompletionHandle, SchedulerConfig, WorkerDefinition, WorkerFrame};

  fn counting_cleanup(counter: Arc<AtomicUsize>) -> impl Fn(&mut crate::Job) + Send + 'static {
    move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn holding_def(slot: Arc<Mutex<Option<CompletionHandle>>>) -> WorkerDefinition {
    WorkerDefinition::new(move |_| {
      Box::new(HoldsAsync {
        slot: slot.clone(),
        parked: false,
      }) as Box<dyn WorkerFrame>
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_fatal_failure_cleans_up_once_and_moves_on() {
    let ctx = TestContext::spawn();
    let cleanups = Arc::new(AtomicUsize::new(0));

    ctx
      .handle
      .register_indexer(
        TestIndexer::new("test")
          .with_worker(
            "bad",
            WorkerDefinition::new(|_| Box::new(AlwaysFails) as Box<dyn WorkerFrame>)
              .with_cleanup(counting_cleanup(cleanups.clone())),
          )
          .with_worker("known", item_consumer_def()),
      )
      .await
      .unwrap();

    let (bad, mut bad_done) = tracked_job("bad", vec![json!(1)]);
    let (good, mut good_done) = tracked_job("known", vec![json!(1)]);
    ctx.handle.enqueue(bad).await.unwrap();
    ctx.handle.enqueue(good).await.unwrap();

    // The failing job is abandoned silently; the queue keeps moving.
    await_completion(&mut good_done).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(bad_done.try_recv().is_err(), "abandoned job must not report completion");
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_recover_hook_retries_and_cleanup_never_runs() {
    let ctx = TestContext::spawn();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let recoveries = Arc::new(AtomicUsize::new(0));

    let recover_count = recoveries.clone();
    ctx
      .handle
      .register_indexer(
        TestIndexer::new("test").with_worker(
          "flaky",
          WorkerDefinition::new(|_| Box::new(Flaky { failures: 1 }) as Box<dyn WorkerFrame>)
            .with_recover(move |_, contexts, _| {
              recover_count.fetch_add(1, Ordering::SeqCst);
              // Retry the entry frame in place.
              assert_eq!(contexts.len(), 1);
              Some(1)
            })
            .with_cleanup(counting_cleanup(cleanups.clone())),
        ),
      )
      .await
      .unwrap();

    let (job, mut done) = tracked_job("flaky", vec![json!(1), json!(2)]);
    ctx.handle.enqueue(job).await.unwrap();

    await_completion(&mut done).await;
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    assert_eq!(cleanups.load(Ordering::SeqCst), 0, "recovered job must not be cleaned up");
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovery_retry_ceiling_turns_fatal() {
    let config = SchedulerConfig {
      max_recovery_attempts: 3,
      ..Default::default()
    };
    let ctx = TestContext::spawn_with(config);
    let cleanups = Arc::new(AtomicUsize::new(0));

    ctx
      .handle
      .register_indexer(
        TestIndexer::new("test")
          .with_worker(
            "hopeless",
            WorkerDefinition::new(|_| Box::new(AlwaysFails) as Box<dyn WorkerFrame>)
              .with_recover(|_, _, _| Some(1))
              .with_cleanup(counting_cleanup(cleanups.clone())),
          )
          .with_worker("known", item_consumer_def()),
      )
      .await
      .unwrap();

    let (bad, _bad_done) = tracked_job("hopeless", vec![json!(1)]);
    let (good, mut good_done) = tracked_job("known", vec![json!(1)]);
    ctx.handle.enqueue(bad).await.unwrap();
    ctx.handle.enqueue(good).await.unwrap();

    await_completion(&mut good_done).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1, "job must be abandoned exactly once");
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_kill_active_job_unblocks_a_stalled_suspension() {
    let ctx = TestContext::spawn();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<CompletionHandle>>> = Arc::default();

    ctx
      .handle
      .register_indexer(
        TestIndexer::new("test")
          .with_worker("hold", holding_def(slot.clone()).with_cleanup(counting_cleanup(cleanups.clone())))
          .with_worker("known", item_consumer_def()),
      )
      .await
      .unwrap();

    let (stalled, mut stalled_done) = tracked_job("hold", vec![]);
    let (good, mut good_done) = tracked_job("known", vec![json!(1)]);
    ctx.handle.enqueue(stalled).await.unwrap();
    ctx.handle.enqueue(good).await.unwrap();

    // Wait until the first job is hired and parked on its completion. The
    // second job cannot run behind the stalled suspension.
    let hired = slot.clone();
    wait_until(move || hired.lock().unwrap().is_some()).await;
    assert!(good_done.try_recv().is_err());

    ctx.handle.kill_active_job().await.unwrap();

    await_completion(&mut good_done).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(stalled_done.try_recv().is_err());

    // The dead job's completion firing late must be harmless.
    let stale = slot.lock().unwrap().take().unwrap();
    stale.resume(Some(json!("too late")));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (again, mut again_done) = tracked_job("known", vec![json!(1)]);
    ctx.handle.enqueue(again).await.unwrap();
    await_completion(&mut again_done).await;
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_kill_with_no_active_job_is_idempotent() {
    let ctx = TestContext::spawn();
    ctx
      .handle
      .register_indexer(TestIndexer::new("test").with_worker("known", item_consumer_def()))
      .await
      .unwrap();

    ctx.handle.kill_active_job().await.unwrap();
    ctx.handle.kill_active_job().await.unwrap();

    let (job, mut done) = tracked_job("known", vec![json!(1)]);
    ctx.handle.enqueue(job).await.unwrap();
    await_completion(&mut done).await;
    ctx.teardown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_purge_spares_the_hired_job() {
    let ctx = TestContext::spawn();
    let canceled = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<CompletionHandle>>> = Arc::default();

    let cancel_count = canceled.clone();
    ctx
      .handle
      .register_indexer(
        TestIndexer::new("test")
          .with_worker("hold", holding_def(slot.clone()))
          .with_worker(
            "cancellable",
            item_consumer_def().with_job_canceled(move |_| {
              cancel_count.fetch_add(1, Ordering::SeqCst);
            }),
          ),
      )
      .await
      .unwrap();

    let (active, mut active_done) = tracked_job("hold", vec![]);
    let (queued, mut queued_done) = tracked_job("cancellable", vec![json!(1)]);
    ctx.handle.enqueue(active).await.unwrap();
    ctx.handle.enqueue(queued).await.unwrap();

    let hired = slot.clone();
    wait_until(move || hired.lock().unwrap().is_some()).await;

    // Purge matches everything, but only touches the still-queued job.
    ctx.handle.purge_jobs(|_| true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(canceled.load(Ordering::SeqCst), 1);

    // The hired job keeps running to completion.
    let release = slot.lock().unwrap().take().unwrap();
    release.resume(Some(json!("released")));
    let value = await_completion(&mut active_done).await;
    assert_eq!(value, Some(json!("released")));
    assert!(queued_done.try_recv().is_err(), "purged job must not run");
    ctx.teardown().await;
  }
}
