use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex},
};

use futures_util::FutureExt;
use tokio::sync::watch;

pub type Operation = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Operation>,
    // Operations taken into the current pass that have not started yet.
    snapshot_left: usize,
    running: bool,
}

/// Runs asynchronous operations for one entity strictly one after another, in
/// enqueue order.
///
/// A drain pass snapshots everything pending and runs it; work enqueued meanwhile
/// is picked up by a further pass of the same drain before the queue goes idle.
/// Operations are expected to handle their own errors. A panic is caught and
/// logged so the drain still completes.
#[derive(Clone)]
pub struct OperationQueue {
    label: Arc<str>,
    state: Arc<Mutex<QueueState>>,
    // Number of drains that have finished; bumped under the state lock.
    drained: Arc<watch::Sender<u64>>,
}

impl OperationQueue {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
            drained: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Queues `op` and starts a drain if none is running. Must be called from
    /// within a tokio runtime.
    pub fn enqueue<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let start = {
            let mut state = self.lock();
            state.pending.push_back(Box::pin(op));
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            tokio::spawn(self.clone().drain());
        }
    }

    /// Resolves once the drain in flight at call time has finished, including
    /// anything enqueued before it finishes. Resolves immediately when idle.
    pub fn current_run(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.drained.subscribe();
        let target = {
            let state = self.lock();
            state.running.then(|| *rx.borrow_and_update() + 1)
        };
        async move {
            if let Some(target) = target {
                let _ = rx.wait_for(|done| *done >= target).await;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Operations queued that have not started yet. Called from inside an
    /// operation, this counts exactly the work queued behind it.
    pub fn waiting(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.snapshot_left
    }

    async fn drain(self) {
        let mut pass: u32 = 0;
        loop {
            let snapshot: Vec<Operation> = {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    state.running = false;
                    self.drained.send_modify(|n| *n += 1);
                    break;
                }
                let ops: Vec<Operation> = state.pending.drain(..).collect();
                state.snapshot_left = ops.len();
                ops
            };

            pass = pass.saturating_add(1);
            tracing::trace!(queue = %self.label, pass, ops = snapshot.len(), "drain pass");

            for op in snapshot {
                {
                    let mut state = self.lock();
                    state.snapshot_left = state.snapshot_left.saturating_sub(1);
                }
                if AssertUnwindSafe(op).catch_unwind().await.is_err() {
                    tracing::error!(queue = %self.label, "queued operation panicked");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        order: Arc<Mutex<Vec<usize>>>,
        in_flight: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn op(&self, id: usize, delay_ms: u64) -> impl Future<Output = ()> + Send + 'static {
            let recorder = self.clone();
            async move {
                if recorder.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                    recorder.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                tokio::task::yield_now().await;
                recorder.order.lock().unwrap().push(id);
                recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fn order(&self) -> Vec<usize> {
            self.order.lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_enqueue_order_without_overlap() {
        let queue = OperationQueue::new("test");
        let recorder = Recorder::default();
        // Earlier ops sleep longer; ordering must still hold.
        for id in 0..8 {
            queue.enqueue(recorder.op(id, 80 - id as u64 * 10));
        }
        queue.current_run().await;

        assert_eq!(recorder.order(), (0..8).collect::<Vec<_>>());
        assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
        assert!(!queue.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_enqueue_runs_after_current_snapshot() {
        let queue = OperationQueue::new("test");
        let recorder = Recorder::default();

        let inner_queue = queue.clone();
        let inner_recorder = recorder.clone();
        queue.enqueue(async move {
            inner_queue.enqueue(inner_recorder.op(3, 1));
            inner_recorder.op(1, 5).await;
        });
        queue.enqueue(recorder.op(2, 5));

        queue.current_run().await;
        assert_eq!(recorder.order(), vec![1, 2, 3]);
        assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn current_run_waits_for_work_enqueued_mid_drain() {
        let queue = OperationQueue::new("test");
        let recorder = Recorder::default();
        queue.enqueue(recorder.op(1, 50));
        let done = queue.current_run();

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(recorder.op(2, 50));

        done.await;
        assert_eq!(recorder.order(), vec![1, 2]);
    }

    #[tokio::test]
    async fn current_run_is_ready_when_idle() {
        let queue = OperationQueue::new("idle");
        tokio::time::timeout(Duration::from_secs(1), queue.current_run())
            .await
            .expect("idle queue should resolve immediately");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_counts_work_behind_the_running_op() {
        let queue = OperationQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            let q = queue.clone();
            let seen = seen.clone();
            queue.enqueue(async move {
                seen.lock().unwrap().push(q.waiting());
            });
        }
        queue.current_run().await;
        assert_eq!(*seen.lock().unwrap(), vec![2, 1, 0]);
    }

    fn queue_should_explode() -> bool {
        true
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_operation_does_not_stall_the_queue() {
        let queue = OperationQueue::new("test");
        let recorder = Recorder::default();
        queue.enqueue(async {
            if queue_should_explode() {
                panic!("boom");
            }
        });
        queue.enqueue(recorder.op(1, 1));

        queue.current_run().await;
        assert_eq!(recorder.order(), vec![1]);
        assert!(!queue.is_running());
    }

    proptest! {
        #[test]
        fn order_matches_enqueue_order(delays in proptest::collection::vec(0u64..20, 1..24)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let (order, overlaps) = rt.block_on(async {
                let queue = OperationQueue::new("prop");
                let recorder = Recorder::default();
                for (id, delay) in delays.iter().enumerate() {
                    queue.enqueue(recorder.op(id, *delay));
                }
                queue.current_run().await;
                (recorder.order(), recorder.overlaps.load(Ordering::SeqCst))
            });
            prop_assert_eq!(order, (0..delays.len()).collect::<Vec<_>>());
            prop_assert_eq!(overlaps, 0);
        }
    }
}
