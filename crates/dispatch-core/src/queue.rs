//! Task queue - Mutex + Condvar FIFO shared by the readiness loop and workers
//!
//! Design:
//! - One `VecDeque` guarded by a `Mutex`, together with the `shutting_down`
//!   flag. Enqueue, dequeue and the shutdown transition are all serialized
//!   on that one lock, so a consumer can never see "empty and running" while
//!   a shutdown is half-applied.
//! - Consumers park on a `Condvar` and re-check both conditions on every
//!   wake. No timeouts, no spinning.
//! - Once `shutting_down` is set, consumers get `Dequeued::Stop` even if
//!   items remain. Leftovers belong to the drain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Result of a blocking dequeue
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    /// Head of the queue, now owned by the caller
    Task(T),
    /// Shutdown was requested; the caller must stop consuming
    Stop,
}

/// Enqueue failure. The task is handed back so the caller can release it.
pub enum EnqueueError<T> {
    /// Shutdown already began
    ShuttingDown(T),
    /// Bounded queue is at capacity
    Full(T),
    /// Growing the queue failed
    Alloc(T),
}

impl<T> EnqueueError<T> {
    /// Recover the rejected task
    pub fn into_inner(self) -> T {
        match self {
            Self::ShuttingDown(t) | Self::Full(t) | Self::Alloc(t) => t,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::ShuttingDown(_) => "shutting down",
            Self::Full(_) => "queue full",
            Self::Alloc(_) => "allocation failed",
        }
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnqueueError({})", self.reason())
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enqueue rejected: {}", self.reason())
    }
}

struct State<T> {
    items: VecDeque<T>,
    shutting_down: bool,
}

/// FIFO task queue with blocking consumers.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    /// `None` = unbounded
    capacity: Option<usize>,
    /// Consumers currently inside `Condvar::wait`. Only modified under the lock.
    parked: AtomicUsize,
}

impl<T> TaskQueue<T> {
    /// Unbounded queue
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Queue that rejects pushes once `capacity` items are pending.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                shutting_down: false,
            }),
            cond: Condvar::new(),
            capacity,
            parked: AtomicUsize::new(0),
        }
    }

    // Nothing panics while holding the lock, so a poisoned state is still consistent.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail and wake one parked consumer. Never blocks on
    /// anything but the queue lock.
    pub fn enqueue(&self, task: T) -> Result<(), EnqueueError<T>> {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(EnqueueError::ShuttingDown(task));
            }
            if let Some(cap) = self.capacity {
                if state.items.len() >= cap {
                    return Err(EnqueueError::Full(task));
                }
            }
            if state.items.try_reserve(1).is_err() {
                return Err(EnqueueError::Alloc(task));
            }
            state.items.push_back(task);
        }
        if self.parked.load(Ordering::Acquire) > 0 {
            self.cond.notify_one();
        }
        Ok(())
    }

    /// Block until a task is available or shutdown is requested.
    pub fn dequeue_blocking(&self) -> Dequeued<T> {
        let mut state = self.lock();
        loop {
            if state.shutting_down {
                return Dequeued::Stop;
            }
            if let Some(task) = state.items.pop_front() {
                return Dequeued::Task(task);
            }
            self.parked.fetch_add(1, Ordering::AcqRel);
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            self.parked.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Non-blocking pop. `None` when empty or shutting down.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        if state.shutting_down {
            return None;
        }
        state.items.pop_front()
    }

    /// Flip `shutting_down` under the lock and wake every consumer.
    ///
    /// Returns `false` if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        let first = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.shutting_down, true)
        };
        self.cond.notify_all();
        first
    }

    /// Remove every remaining task and hand each one to `release`.
    ///
    /// Tasks are taken out under the lock and released after it is dropped.
    /// Returns how many were removed.
    pub fn drain_with<F: FnMut(T)>(&self, mut release: F) -> usize {
        let leftovers = {
            let mut state = self.lock();
            debug_assert!(state.shutting_down, "drain before shutdown");
            std::mem::take(&mut state.items)
        };
        let n = leftovers.len();
        leftovers.into_iter().for_each(&mut release);
        n
    }

    /// Drop every remaining task without processing it.
    pub fn drain_and_discard(&self) -> usize {
        self.drain_with(drop)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Consumers currently blocked in `dequeue_blocking` (diagnostics)
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Counts drops so tests can assert each item is released exactly once.
    struct Tracked {
        id: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = TaskQueue::new();
        for i in 0..100u32 {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.len(), 100);
        for i in 0..100u32 {
            assert_eq!(q.dequeue_blocking(), Dequeued::Task(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_stop_after_shutdown_even_with_items() {
        let q = TaskQueue::new();
        q.enqueue(1u32).unwrap();
        assert!(q.begin_shutdown());
        assert!(!q.begin_shutdown());
        assert_eq!(q.dequeue_blocking(), Dequeued::Stop);
        assert_eq!(q.try_dequeue(), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_enqueue_after_shutdown_hands_task_back() {
        let q = TaskQueue::new();
        q.begin_shutdown();
        let err = q.enqueue(5u32).unwrap_err();
        assert!(matches!(err, EnqueueError::ShuttingDown(_)));
        assert_eq!(err.into_inner(), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn test_bounded_rejects_when_full() {
        let q = TaskQueue::with_capacity(Some(2));
        q.enqueue(1u32).unwrap();
        q.enqueue(2u32).unwrap();
        let err = q.enqueue(3u32).unwrap_err();
        assert_eq!(err.reason(), "queue full");
        assert_eq!(err.into_inner(), 3);
        assert_eq!(q.try_dequeue(), Some(1));
        q.enqueue(4u32).unwrap();
    }

    #[test]
    fn test_drain_releases_each_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = TaskQueue::new();
        for id in 0..3 {
            q.enqueue(Tracked { id, drops: drops.clone() }).unwrap();
        }
        q.begin_shutdown();
        assert_eq!(q.drain_and_discard(), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert!(q.is_empty());
        assert_eq!(q.drain_and_discard(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drain_with_sees_fifo_order() {
        let q = TaskQueue::new();
        for i in 0..4u32 {
            q.enqueue(i).unwrap();
        }
        q.begin_shutdown();
        let mut seen = Vec::new();
        assert_eq!(q.drain_with(|t| seen.push(t)), 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_blocked_consumer_woken_by_enqueue() {
        let q = Arc::new(TaskQueue::new());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.dequeue_blocking())
        };
        wait_until(|| q.parked_count() == 1);
        q.enqueue(42u32).unwrap();
        assert_eq!(consumer.join().unwrap(), Dequeued::Task(42));
        assert_eq!(q.parked_count(), 0);
    }

    #[test]
    fn test_shutdown_wakes_all_consumers() {
        let q: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.dequeue_blocking())
            })
            .collect();
        wait_until(|| q.parked_count() == 4);
        q.begin_shutdown();
        for c in consumers {
            assert_eq!(c.join().unwrap(), Dequeued::Stop);
        }
    }

    #[test]
    fn test_parked_consumer_stays_parked() {
        // A consumer on an empty queue must sit in the condvar, not spin.
        let q: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.dequeue_blocking())
        };
        wait_until(|| q.parked_count() == 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.parked_count(), 1);
        assert!(!consumer.is_finished());
        q.begin_shutdown();
        assert_eq!(consumer.join().unwrap(), Dequeued::Stop);
    }

    #[test]
    fn test_concurrent_no_loss_no_duplication() {
        const PRODUCED: u32 = 10_000;
        let q: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Dequeued::Task(t) = q.dequeue_blocking() {
                        got.push(t);
                    }
                    got
                })
            })
            .collect();

        for i in 0..PRODUCED {
            q.enqueue(i).unwrap();
        }
        wait_until(|| q.is_empty());
        q.begin_shutdown();

        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..PRODUCED).collect::<Vec<_>>());
    }

    #[test]
    fn test_tracked_ids_survive_roundtrip() {
        let drops = Arc::new(AtomicUsize::new(0));
        let q = TaskQueue::new();
        q.enqueue(Tracked { id: 9, drops: drops.clone() }).unwrap();
        match q.dequeue_blocking() {
            Dequeued::Task(t) => assert_eq!(t.id, 9),
            Dequeued::Stop => panic!("unexpected stop"),
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
