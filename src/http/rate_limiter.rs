//! Fixed-window admission limiter.
//!
//! The pool holds `capacity` permits. A single ticker task resets the count
//! to full capacity once per window; it is an absolute reset, not a sliding
//! window, so a full burst is always possible right after a tick.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::error::{AppError, Result};

struct PoolState {
    available: usize,
    // Oldest waiter at the front. A dropped receiver means the waiter was cancelled.
    waiters: VecDeque<oneshot::Sender<()>>,
    closed: bool,
}

impl PoolState {
    /// Hand free permits to queued waiters in FIFO order.
    fn grant_waiters(&mut self) {
        while self.available > 0 {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.available -= 1;
            }
        }
    }

    fn has_live_waiters(&mut self) -> bool {
        while let Some(front) = self.waiters.front() {
            if !front.is_closed() {
                return true;
            }
            self.waiters.pop_front();
        }
        false
    }
}

pub struct PermitPool {
    capacity: usize,
    window: Duration,
    state: Mutex<PoolState>,
    shutdown_tx: broadcast::Sender<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PermitPool")
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl PermitPool {
    /// Create a full pool and start its ticker on the current Tokio runtime.
    ///
    /// Construction is the tick at time zero; the first timed reset fires one
    /// `window` later. Fails without spawning anything if `capacity` or
    /// `window` is zero.
    pub fn start(capacity: usize, window: Duration) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(AppError::InvalidConfiguration(
                "request limit must be positive".into(),
            ));
        }
        if window.is_zero() {
            return Err(AppError::InvalidConfiguration(
                "window duration must be positive".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::Init(format!("Permit pool needs a Tokio runtime: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let pool = Arc::new(Self {
            capacity,
            window,
            state: Mutex::new(PoolState {
                available: capacity,
                waiters: VecDeque::new(),
                closed: false,
            }),
            shutdown_tx,
            ticker: Mutex::new(None),
        });

        let handle = runtime.spawn(run_ticker(Arc::downgrade(&pool), window, shutdown_rx));
        *pool.ticker.lock() = Some(handle);

        info!(capacity, window_ms = window.as_millis() as u64, "Permit pool started");
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Number of callers currently queued in `acquire`, cancelled ones excluded.
    pub fn waiting(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait for a permit. Waiters are served in arrival order.
    ///
    /// Dropping the returned future before it completes does not consume a
    /// permit. After shutdown, residual permits are still handed out and
    /// `Shutdown` is returned once none remain.
    pub async fn acquire(&self) -> Result<()> {
        let rx = {
            let mut state = self.state.lock();
            if state.available > 0 && !state.has_live_waiters() {
                state.available -= 1;
                return Ok(());
            }
            if state.closed {
                return Err(AppError::Shutdown);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        trace!("Permit pool exhausted, waiting for a permit");
        let mut waiter = Waiter {
            pool: self,
            rx: Some(rx),
        };
        waiter.wait().await
    }

    /// Like `acquire`, but gives up with `Cancelled` after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Cancelled),
        }
    }

    /// Race `acquire` against `cancel`; the permit is untouched if `cancel` wins.
    pub async fn acquire_until<F>(&self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.acquire() => result,
            _ = cancel => Err(AppError::Cancelled),
        }
    }

    /// Take a permit without waiting. Never overtakes queued waiters.
    pub fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.available > 0 && !state.has_live_waiters() {
            state.available -= 1;
            return Ok(());
        }
        if state.closed {
            return Err(AppError::Shutdown);
        }
        Err(AppError::NoPermits)
    }

    /// Return one permit, clamped at capacity. The oldest waiter gets it first.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.available = (state.available + 1).min(self.capacity);
        state.grant_waiters();
    }

    /// Reset to full capacity regardless of the current count.
    pub(crate) fn tick(&self) {
        let mut state = self.state.lock();
        let before = state.available;
        state.available = self.capacity;
        state.grant_waiters();
        trace!(before, after = state.available, "Permit window reset");
    }

    /// Stop the ticker and fail every queued waiter with `Shutdown`.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the senders wakes the waiters with a closed channel.
            state.waiters.clear();
        }

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        info!("Permit pool shut down");
    }
}

impl Drop for PermitPool {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

/// A queued `acquire` call. Returns a permit it was granted but never observed.
struct Waiter<'a> {
    pool: &'a PermitPool,
    rx: Option<oneshot::Receiver<()>>,
}

impl Waiter<'_> {
    async fn wait(&mut self) -> Result<()> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(AppError::Cancelled);
        };
        let result = rx.await;
        self.rx = None;
        result.map_err(|_| AppError::Shutdown)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                debug!("Waiter cancelled after grant, returning permit");
                self.pool.release();
            }
        }
    }
}

async fn run_ticker(pool: Weak<PermitPool>, window: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = interval_at(Instant::now() + window, window);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.tick();
            }
            _ = shutdown.recv() => break,
        }
    }

    debug!("Permit ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_rejects_zero_capacity() {
        let err = PermitPool::start(0, WINDOW).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_rejects_zero_window() {
        let err = PermitPool::start(5, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_requires_runtime() {
        let err = PermitPool::start(5, WINDOW).unwrap_err();
        assert!(matches!(err, AppError::Init(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_block_until_tick() {
        let pool = PermitPool::start(5, WINDOW).unwrap();
        let start = Instant::now();

        for _ in 0..5 {
            pool.acquire().await.unwrap();
        }
        assert_eq!(pool.available(), 0);
        assert!(start.elapsed() < Duration::from_millis(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let blocked_at = Instant::now();
        pool.acquire().await.unwrap();

        let waited = blocked_at.elapsed();
        assert!(waited >= Duration::from_millis(890), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(910), "waited {:?}", waited);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_resets_to_capacity() {
        let pool = PermitPool::start(3, WINDOW).unwrap();
        pool.try_acquire().unwrap();
        pool.try_acquire().unwrap();
        assert_eq!(pool.available(), 1);

        pool.tick();
        assert_eq!(pool.available(), 3);

        pool.tick();
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_clamped() {
        let pool = PermitPool::start(2, WINDOW).unwrap();
        pool.release();
        pool.release();
        assert_eq!(pool.available(), 2);

        pool.try_acquire().unwrap();
        pool.release();
        pool.release();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_exhausted() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();
        assert!(matches!(pool.try_acquire(), Err(AppError::NoPermits)));
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_fifo() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire().await.unwrap();
                order.lock().push(i);
            }));
            // let each task enqueue before the next one starts
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.waiting(), 3);

        for _ in 0..3 {
            pool.release();
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_does_not_overtake_waiters() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.waiting(), 1);

        // The released permit goes straight to the queued waiter.
        pool.release();
        assert!(matches!(pool.try_acquire(), Err(AppError::NoPermits)));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_consumes_nothing() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();

        let err = pool
            .acquire_timeout(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.available(), 0);

        pool.release();
        assert_eq!(pool.available(), 1);
        pool.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_cancel() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_until(async {
                    let _ = cancel_rx.await;
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        cancel_tx.send(()).unwrap();

        assert!(matches!(task.await.unwrap(), Err(AppError::Cancelled)));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_to_dropped_waiter_is_returned() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();

        let mut fut = Box::pin(pool.acquire());
        // Poll once so the waiter is queued.
        assert!(futures_util::poll!(fut.as_mut()).is_pending());
        assert_eq!(pool.waiting(), 1);

        // Grant lands in the channel, then the caller gives up before observing it.
        pool.release();
        drop(fut);

        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_waiters() {
        let pool = PermitPool::start(1, WINDOW).unwrap();
        pool.try_acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;

        pool.shutdown();
        assert!(matches!(waiter.await.unwrap(), Err(AppError::Shutdown)));
        assert!(pool.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_residual_permits() {
        let pool = PermitPool::start(2, WINDOW).unwrap();
        pool.shutdown();

        pool.acquire().await.unwrap();
        pool.try_acquire().unwrap();
        assert!(matches!(pool.acquire().await, Err(AppError::Shutdown)));
        assert!(matches!(pool.try_acquire(), Err(AppError::Shutdown)));

        // Ticker is stopped: no refill after a window passes.
        tokio::time::sleep(WINDOW * 3).await;
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_refills_every_window() {
        let pool = PermitPool::start(2, WINDOW).unwrap();
        pool.try_acquire().unwrap();
        pool.try_acquire().unwrap();

        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 2);

        pool.try_acquire().unwrap();
        tokio::time::sleep(WINDOW).await;
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stress_counter_stays_in_bounds() {
        let capacity = 8;
        let pool = PermitPool::start(capacity, Duration::from_millis(5)).unwrap();
        let granted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..32 {
            let pool = pool.clone();
            let granted = granted.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    match (i + j) % 3 {
                        0 => {
                            if pool.acquire_timeout(Duration::from_millis(20)).await.is_ok() {
                                granted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        1 => {
                            let _ = pool.try_acquire();
                        }
                        _ => pool.release(),
                    }
                    assert!(pool.available() <= capacity);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(pool.available() <= capacity);
        assert!(granted.load(Ordering::Relaxed) > 0);
        pool.shutdown();
    }

    #[derive(Debug, Clone)]
    enum Op {
        TryAcquire,
        Release,
        Tick,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::TryAcquire), Just(Op::Release), Just(Op::Tick)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn available_stays_within_bounds(
            capacity in 1usize..16,
            ops in proptest::collection::vec(op_strategy(), 0..200)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let pool = PermitPool::start(capacity, WINDOW).unwrap();
                let mut model = capacity;

                for op in &ops {
                    match op {
                        Op::TryAcquire => {
                            let ok = pool.try_acquire().is_ok();
                            prop_assert_eq!(ok, model > 0);
                            if ok {
                                model -= 1;
                            }
                        }
                        Op::Release => {
                            pool.release();
                            model = (model + 1).min(capacity);
                        }
                        Op::Tick => {
                            pool.tick();
                            model = capacity;
                        }
                    }
                    prop_assert_eq!(pool.available(), model);
                    prop_assert!(pool.available() <= capacity);
                }
                Ok(())
            })?;
        }
    }
}
