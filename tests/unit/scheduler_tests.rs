//! Unit tests for cancellable delayed actions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assessment_relay::orchestrator::scheduler::Scheduler;
use tokio_util::sync::CancellationToken;

fn counter_action(counter: &Arc<AtomicUsize>) -> impl std::future::Future<Output = ()> + Send + 'static {
    let counter = Arc::clone(counter);
    async move {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn action_runs_after_its_delay() {
    let scheduler = Scheduler::new(&CancellationToken::new());
    let fired = Arc::new(AtomicUsize::new(0));

    scheduler.schedule("tick", Duration::from_millis(100), counter_action(&fired));
    assert_eq!(scheduler.pending(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_prevents_pending_actions() {
    let scheduler = Scheduler::new(&CancellationToken::new());
    let fired = Arc::new(AtomicUsize::new(0));

    scheduler.schedule("first", Duration::from_millis(100), counter_action(&fired));
    scheduler.schedule("second", Duration::from_millis(200), counter_action(&fired));
    scheduler.cancel_all();
    scheduler.drain().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(scheduler.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn actions_scheduled_after_cancel_are_dropped() {
    let scheduler = Scheduler::new(&CancellationToken::new());
    let fired = Arc::new(AtomicUsize::new(0));
    scheduler.cancel_all();

    scheduler.schedule("late", Duration::ZERO, counter_action(&fired));

    assert_eq!(scheduler.pending(), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_reaches_the_scheduler() {
    let parent = CancellationToken::new();
    let scheduler = Scheduler::new(&parent);
    let fired = Arc::new(AtomicUsize::new(0));

    scheduler.schedule("orphan", Duration::from_millis(100), counter_action(&fired));
    parent.cancel();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(scheduler.is_cancelled());
}
