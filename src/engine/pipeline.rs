//! Bounded pipeline: runs async units of work with at most N executing at once.
//!
//! Units are started in submission order. A submission either starts a new
//! slot task (when fewer than N are running) or waits in a FIFO queue; a slot
//! task that finishes a unit immediately picks up the next queued input, so a
//! slow unit only ever occupies its own slot.
//!
//! Results are collected through [`BoundedPipeline::try_take_completed`] and
//! [`BoundedPipeline::wait_for_any`]. In ordered mode results are released in
//! submission order; otherwise in completion order. A unit's error is handed
//! to whoever takes that unit's result, exactly once.
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;

/// Errors reported by the pipeline, or carried by a unit's result.
#[derive(Debug, Error)]
pub enum PipelineError<E> {
    /// Non-blocking submission while queued plus running units are at the bound
    #[error("Pipeline at capacity ({capacity} units queued or running)")]
    CapacityExceeded { capacity: usize },
    /// Submission after [`BoundedPipeline::complete`]
    #[error("Pipeline no longer accepts work")]
    Closed,
    /// The unit's own error
    #[error("{0}")]
    Unit(E),
    /// The unit panicked while running
    #[error("Unit panicked: {0}")]
    Panicked(String),
}

/// Pipeline behavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Units executing at once (0 is treated as 1)
    pub max_concurrency: usize,
    /// Bound on queued plus running units; `None` = unbounded
    pub capacity: Option<usize>,
    /// Release results in submission order
    pub ordered: bool,
    /// Slots shared with other pipelines; a unit holds one of these as well
    /// as one of its own pipeline's slots while it runs
    pub shared_slots: Option<Arc<Semaphore>>,
}

impl PipelineConfig {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            capacity: None,
            ordered: false,
            shared_slots: None,
        }
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_shared_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.shared_slots = Some(slots);
        self
    }
}

/// Lifecycle of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Completed,
    Faulted,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => UnitState::Pending,
            1 => UnitState::Running,
            2 => UnitState::Completed,
            _ => UnitState::Faulted,
        }
    }
}

/// Returned by a submission; identifies the unit and exposes its state.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    seq: u64,
    state: Arc<AtomicU8>,
}

impl UnitHandle {
    /// Zero-based submission index.
    pub fn index(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }
}

type Worker<In, Out, E> = Arc<dyn Fn(In) -> BoxFuture<'static, Result<Out, E>> + Send + Sync>;
type UnitResult<Out, E> = Result<Out, PipelineError<E>>;

struct Queued<In> {
    seq: u64,
    input: In,
    state: Arc<AtomicU8>,
    admission: Option<OwnedSemaphorePermit>,
}

struct Completion<Out, E> {
    seq: u64,
    result: UnitResult<Out, E>,
}

/// Queue and running-slot count, guarded together so a finishing slot and a
/// new submission never both miss the queued input.
struct Slots<In> {
    waiting: VecDeque<Queued<In>>,
    running: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission-controlled worker pool with ordered or unordered consumption.
pub struct BoundedPipeline<In, Out, E> {
    worker: Worker<In, Out, E>,
    max_concurrency: usize,
    capacity: Option<(usize, Arc<Semaphore>)>,
    shared_slots: Option<Arc<Semaphore>>,
    ordered: bool,
    slots: Arc<Mutex<Slots<In>>>,
    tasks: JoinSet<()>,
    tx: mpsc::UnboundedSender<Completion<Out, E>>,
    rx: mpsc::UnboundedReceiver<Completion<Out, E>>,
    /// Completed out of turn (ordered mode only)
    held: BTreeMap<u64, UnitResult<Out, E>>,
    ready: VecDeque<UnitResult<Out, E>>,
    next_seq: u64,
    next_release: u64,
    /// Submitted units whose completion has not been received yet
    outstanding: usize,
    closed: bool,
}

impl<In, Out, E> BoundedPipeline<In, Out, E>
where
    In: Send + 'static,
    Out: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut>(config: PipelineConfig, worker: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, E>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let capacity = config
            .capacity
            .map(|c| (c.max(1), Arc::new(Semaphore::new(c.max(1)))));
        Self {
            worker: Arc::new(move |input| worker(input).boxed()),
            max_concurrency: config.max_concurrency.max(1),
            capacity,
            shared_slots: config.shared_slots,
            ordered: config.ordered,
            slots: Arc::new(Mutex::new(Slots {
                waiting: VecDeque::new(),
                running: 0,
            })),
            tasks: JoinSet::new(),
            tx,
            rx,
            held: BTreeMap::new(),
            ready: VecDeque::new(),
            next_seq: 0,
            next_release: 0,
            outstanding: 0,
            closed: false,
        }
    }

    /// Submits a unit, suspending while the pipeline is at its capacity bound.
    pub async fn submit(&mut self, input: In) -> Result<UnitHandle, PipelineError<E>> {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        let admission = match &self.capacity {
            Some((_, permits)) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::Closed)?,
            ),
            None => None,
        };
        Ok(self.enqueue(input, admission))
    }

    /// Submits a unit without waiting; fails with
    /// [`PipelineError::CapacityExceeded`] when at the capacity bound.
    pub fn try_submit(&mut self, input: In) -> Result<UnitHandle, PipelineError<E>> {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        let admission = match &self.capacity {
            Some((capacity, permits)) => match permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => {
                    return Err(PipelineError::CapacityExceeded {
                        capacity: *capacity,
                    })
                }
                Err(TryAcquireError::Closed) => return Err(PipelineError::Closed),
            },
            None => None,
        };
        Ok(self.enqueue(input, admission))
    }

    fn enqueue(&mut self, input: In, admission: Option<OwnedSemaphorePermit>) -> UnitHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding += 1;

        let state = Arc::new(AtomicU8::new(UnitState::Pending as u8));
        let unit = Queued {
            seq,
            input,
            state: state.clone(),
            admission,
        };

        let mut slots = lock(&self.slots);
        if slots.running < self.max_concurrency && slots.waiting.is_empty() {
            slots.running += 1;
            drop(slots);
            self.tasks.spawn(run_slot(
                unit,
                self.worker.clone(),
                self.slots.clone(),
                self.shared_slots.clone(),
                self.tx.clone(),
            ));
        } else {
            slots.waiting.push_back(unit);
        }

        UnitHandle { seq, state }
    }

    /// Takes the next releasable result, if any, without waiting.
    pub fn try_take_completed(&mut self) -> Option<UnitResult<Out, E>> {
        self.collect();
        self.ready.pop_front()
    }

    /// Suspends until a result can be taken. Returns `false` once nothing is
    /// queued, running, or waiting to be taken.
    pub async fn wait_for_any(&mut self) -> bool {
        loop {
            self.collect();
            if !self.ready.is_empty() {
                return true;
            }
            if self.outstanding == 0 {
                return false;
            }
            match self.rx.recv().await {
                Some(completion) => self.accept(completion),
                None => return false,
            }
        }
    }

    /// Stops accepting submissions. Queued and running units still complete.
    pub fn complete(&mut self) {
        self.closed = true;
    }

    /// Completes the pipeline and returns every remaining result in release order.
    pub async fn drain(&mut self) -> Vec<UnitResult<Out, E>> {
        self.complete();
        let mut results = Vec::new();
        while self.wait_for_any().await {
            while let Some(result) = self.try_take_completed() {
                results.push(result);
            }
        }
        results
    }

    /// Closes the pipeline, drops queued inputs and aborts running units.
    /// Returns the number of units discarded, including results not yet taken.
    pub fn abort(&mut self) -> usize {
        self.closed = true;
        {
            let mut slots = lock(&self.slots);
            slots.waiting.clear();
            slots.running = 0;
        }
        self.tasks.abort_all();
        while self.rx.try_recv().is_ok() {}
        let discarded = self.outstanding + self.held.len() + self.ready.len();
        self.outstanding = 0;
        self.held.clear();
        self.ready.clear();
        discarded
    }

    /// Units submitted but not yet taken.
    pub fn in_flight(&self) -> usize {
        self.outstanding + self.held.len() + self.ready.len()
    }

    /// Slots currently executing (or about to execute) a unit.
    pub fn running(&self) -> usize {
        lock(&self.slots).running
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    fn collect(&mut self) {
        while let Ok(completion) = self.rx.try_recv() {
            self.accept(completion);
        }
        // Reap finished slot tasks so the set doesn't grow with the run
        while self.tasks.try_join_next().is_some() {}
    }

    fn accept(&mut self, completion: Completion<Out, E>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if !self.ordered {
            self.ready.push_back(completion.result);
            return;
        }
        self.held.insert(completion.seq, completion.result);
        while let Some(result) = self.held.remove(&self.next_release) {
            self.ready.push_back(result);
            self.next_release += 1;
        }
    }
}

impl<In, Out, E> fmt::Debug for BoundedPipeline<In, Out, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPipeline")
            .field("max_concurrency", &self.max_concurrency)
            .field("capacity", &self.capacity.as_ref().map(|(c, _)| *c))
            .field("ordered", &self.ordered)
            .field("outstanding", &self.outstanding)
            .field("held", &self.held.len())
            .field("ready", &self.ready.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// One slot: runs `first`, then keeps pulling queued units until none remain.
async fn run_slot<In, Out, E>(
    first: Queued<In>,
    worker: Worker<In, Out, E>,
    slots: Arc<Mutex<Slots<In>>>,
    shared_slots: Option<Arc<Semaphore>>,
    tx: mpsc::UnboundedSender<Completion<Out, E>>,
) where
    In: Send + 'static,
    Out: Send + 'static,
    E: Send + 'static,
{
    let mut next = Some(first);
    while let Some(unit) = next {
        let Queued {
            seq,
            input,
            state,
            admission,
        } = unit;

        let result = run_unit(&worker, input, shared_slots.as_ref(), &state).await;
        let final_state = if result.is_ok() {
            UnitState::Completed
        } else {
            UnitState::Faulted
        };
        state.store(final_state as u8, Ordering::Release);

        // Receiver gone means the pipeline was dropped; nothing left to report to
        let _ = tx.send(Completion { seq, result });
        drop(admission);

        next = {
            let mut guard = lock(&slots);
            let unit = guard.waiting.pop_front();
            if unit.is_none() {
                guard.running = guard.running.saturating_sub(1);
            }
            unit
        };
    }
}

async fn run_unit<In, Out, E>(
    worker: &Worker<In, Out, E>,
    input: In,
    shared_slots: Option<&Arc<Semaphore>>,
    state: &AtomicU8,
) -> UnitResult<Out, E> {
    let _shared = match shared_slots {
        Some(slots) => match slots.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return Err(PipelineError::Closed),
        },
        None => None,
    };

    state.store(UnitState::Running as u8, Ordering::Release);
    match AssertUnwindSafe(async move { worker(input).await }).catch_unwind().await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(PipelineError::Unit(e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(PipelineError::Panicked(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Tracks how many units run at once.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn delayed_pipeline(
        config: PipelineConfig,
        gauge: Arc<Gauge>,
    ) -> BoundedPipeline<(usize, u64), usize, String> {
        BoundedPipeline::new(config, move |(id, delay_ms): (usize, u64)| {
            let gauge = gauge.clone();
            async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                gauge.exit();
                Ok(id)
            }
        })
    }

    async fn take_all<Out, E: fmt::Debug>(
        pipeline: &mut BoundedPipeline<impl Send + 'static, Out, E>,
    ) -> Vec<Out>
    where
        Out: Send + 'static,
        E: Send + 'static,
    {
        let mut out = Vec::new();
        while pipeline.wait_for_any().await {
            while let Some(result) = pipeline.try_take_completed() {
                out.push(result.unwrap());
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_mode_respects_bound_and_order() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(2).ordered(true), gauge.clone());

        for (id, delay) in [(0, 50), (1, 10), (2, 40), (3, 5), (4, 20)] {
            pipeline.submit((id, delay)).await.unwrap();
        }
        assert!(pipeline.running() <= 2);

        let out = take_all(&mut pipeline).await;
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_mode_yields_completion_order() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(3), gauge);

        for (id, delay) in [(0, 30), (1, 10), (2, 20)] {
            pipeline.submit((id, delay)).await.unwrap();
        }

        let out = take_all(&mut pipeline).await;
        assert_eq!(out, vec![1, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_unit_does_not_block_later_units() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(2), gauge);

        pipeline.submit((0, 1_000)).await.unwrap();
        for id in 1..5 {
            pipeline.submit((id, 10)).await.unwrap();
        }

        let out = take_all(&mut pipeline).await;
        assert_eq!(out, vec![1, 2, 3, 4, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_results_are_held_back() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(2).ordered(true), gauge);

        pipeline.submit((0, 100)).await.unwrap();
        pipeline.submit((1, 10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Unit 1 finished but unit 0 has not been taken yet
        assert!(pipeline.try_take_completed().is_none());
        assert_eq!(pipeline.in_flight(), 2);

        assert!(pipeline.wait_for_any().await);
        assert_eq!(pipeline.try_take_completed().unwrap().unwrap(), 0);
        assert_eq!(pipeline.try_take_completed().unwrap().unwrap(), 1);
        assert!(!pipeline.wait_for_any().await);
    }

    #[tokio::test]
    async fn test_fault_delivered_with_its_unit() {
        let mut pipeline: BoundedPipeline<u32, u32, String> =
            BoundedPipeline::new(PipelineConfig::new(2).ordered(true), |n: u32| async move {
                if n == 1 {
                    Err(format!("unit {n} failed"))
                } else {
                    Ok(n * 10)
                }
            });

        for n in 0..3 {
            pipeline.submit(n).await.unwrap();
        }

        let results = pipeline.drain().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &0);
        match &results[1] {
            Err(PipelineError::Unit(msg)) => assert_eq!(msg, "unit 1 failed"),
            other => panic!("Expected unit fault, got {:?}", other),
        }
        assert_eq!(results[2].as_ref().unwrap(), &20);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported() {
        let mut pipeline: BoundedPipeline<u32, u32, String> =
            BoundedPipeline::new(PipelineConfig::new(1), |n: u32| async move {
                if n == 0 {
                    panic!("boom");
                }
                Ok(n)
            });

        pipeline.submit(0).await.unwrap();
        pipeline.submit(1).await.unwrap();

        let results = pipeline.drain().await;
        assert!(matches!(&results[0], Err(PipelineError::Panicked(msg)) if msg == "boom"));
        assert_eq!(results[1].as_ref().unwrap(), &1);
    }

    #[tokio::test]
    async fn test_panic_before_first_await_is_reported() {
        // The worker panics while building its future, not while polling it
        let mut pipeline: BoundedPipeline<u32, u32, String> =
            BoundedPipeline::new(PipelineConfig::new(2), |n: u32| {
                if n == 0 {
                    panic!("eager boom");
                }
                async move { Ok(n) }
            });

        pipeline.submit(0).await.unwrap();
        pipeline.submit(1).await.unwrap();
        assert!(pipeline.wait_for_any().await);

        let results = pipeline.drain().await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(PipelineError::Panicked(msg)) if msg == "eager boom")));
        assert!(results.iter().any(|r| matches!(r, Ok(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_submit_capacity_exceeded() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(1).with_capacity(2), gauge);

        pipeline.try_submit((0, 100)).unwrap();
        pipeline.try_submit((1, 100)).unwrap();
        match pipeline.try_submit((2, 100)) {
            Err(PipelineError::CapacityExceeded { capacity }) => assert_eq!(capacity, 2),
            other => panic!("Expected CapacityExceeded, got {:?}", other.map(|h| h.index())),
        }

        // Capacity frees as soon as a unit finishes
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pipeline.try_submit((2, 10)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_submit_waits_for_capacity() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(1).with_capacity(1), gauge);

        let start = tokio::time::Instant::now();
        pipeline.submit((0, 100)).await.unwrap();
        pipeline.submit((1, 10)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        let out = take_all(&mut pipeline).await;
        assert_eq!(out, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_complete_rejects_submissions() {
        let mut pipeline: BoundedPipeline<u32, u32, String> =
            BoundedPipeline::new(PipelineConfig::new(1), |n: u32| async move { Ok(n) });
        pipeline.submit(1).await.unwrap();
        pipeline.complete();

        assert!(matches!(pipeline.submit(2).await, Err(PipelineError::Closed)));
        assert!(matches!(pipeline.try_submit(3), Err(PipelineError::Closed)));

        // Work submitted before completion still finishes
        let results = pipeline.drain().await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_drained() {
        let mut pipeline: BoundedPipeline<u32, u32, String> =
            BoundedPipeline::new(PipelineConfig::new(4), |n: u32| async move { Ok(n) });
        assert!(!pipeline.wait_for_any().await);
        assert!(pipeline.try_take_completed().is_none());
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_tracks_state() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(1), gauge);

        let first = pipeline.submit((0, 50)).await.unwrap();
        let second = pipeline.submit((1, 50)).await.unwrap();
        assert_eq!(second.index(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.state(), UnitState::Running);
        assert_eq!(second.state(), UnitState::Pending);

        take_all(&mut pipeline).await;
        assert_eq!(first.state(), UnitState::Completed);
        assert_eq!(second.state(), UnitState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_slots_bound_across_pipelines() {
        let gauge = Arc::new(Gauge::default());
        let shared = Arc::new(Semaphore::new(2));
        let mut a = delayed_pipeline(
            PipelineConfig::new(2).with_shared_slots(shared.clone()),
            gauge.clone(),
        );
        let mut b = delayed_pipeline(
            PipelineConfig::new(2).with_shared_slots(shared),
            gauge.clone(),
        );

        for id in 0..3 {
            a.submit((id, 20)).await.unwrap();
            b.submit((id, 20)).await.unwrap();
        }

        let (out_a, out_b) = tokio::join!(take_all(&mut a), take_all(&mut b));
        assert_eq!(out_a.len(), 3);
        assert_eq!(out_b.len(), 3);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_discards_work() {
        let gauge = Arc::new(Gauge::default());
        let mut pipeline = delayed_pipeline(PipelineConfig::new(1), gauge);
        for id in 0..3 {
            pipeline.submit((id, 1_000)).await.unwrap();
        }

        assert_eq!(pipeline.abort(), 3);
        assert!(pipeline.is_closed());
        assert!(!pipeline.wait_for_any().await);
    }
}
