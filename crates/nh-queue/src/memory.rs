//! In-memory queue implementation.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nh_common::{ErrorCode, Message, NotifyError, Receipt, Result};

use crate::{DispatchHandler, NotificationQueue, QueueConfig, QueueItem, QueueStats};

/// A message whose retries are exhausted (or that failed terminally).
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: Message,
    pub code: ErrorCode,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

struct ScheduledEntry {
    fire_at: Instant,
    seq: u64,
    item: QueueItem,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    // Reversed so the BinaryHeap pops the earliest fire time first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    config: QueueConfig,
    ready_tx: mpsc::Sender<QueueItem>,
    running: AtomicBool,
    stop: nh_common::CancelToken,
    seq: AtomicU64,
    depth: AtomicUsize,
    in_flight: AtomicUsize,
    scheduled: Mutex<BinaryHeap<ScheduledEntry>>,
    scheduler_wake: Notify,
    idle: Notify,
    dead: Mutex<VecDeque<DeadLetter>>,
    total_enqueued: AtomicU64,
    total_dispatched: AtomicU64,
    total_retried: AtomicU64,
    total_dead_lettered: AtomicU64,
}

impl Shared {
    /// Returns the item on failure so callers decide its fate.
    fn schedule(&self, item: QueueItem, delay: Duration) -> std::result::Result<(), QueueItem> {
        let mut heap = self.scheduled.lock();
        if heap.len() >= self.config.scheduled_capacity {
            return Err(item);
        }
        heap.push(ScheduledEntry {
            fire_at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            item,
        });
        drop(heap);
        self.scheduler_wake.notify_one();
        Ok(())
    }

    fn dead_letter(&self, mut item: QueueItem, error: NotifyError) {
        warn!(
            message_id = %item.message.id,
            code = %error.code,
            attempts = item.attempts,
            "message dead-lettered"
        );
        {
            let mut dead = self.dead.lock();
            if dead.len() == self.config.dead_letter_capacity {
                dead.pop_front();
            }
            dead.push_back(DeadLetter {
                message: item.message.clone(),
                code: error.code,
                error: error.to_string(),
                attempts: item.attempts,
                failed_at: Utc::now(),
            });
        }
        self.total_dead_lettered.fetch_add(1, Ordering::Relaxed);
        item.complete(Err(error));
    }
}

/// Bounded FIFO with a delay scheduler and a worker pool.
pub struct MemoryQueue {
    shared: Arc<Shared>,
    ready_rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                ready_tx,
                running: AtomicBool::new(true),
                stop: nh_common::CancelToken::new(),
                seq: AtomicU64::new(0),
                depth: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                scheduled: Mutex::new(BinaryHeap::new()),
                scheduler_wake: Notify::new(),
                idle: Notify::new(),
                dead: Mutex::new(VecDeque::new()),
                total_enqueued: AtomicU64::new(0),
                total_dispatched: AtomicU64::new(0),
                total_retried: AtomicU64::new(0),
                total_dead_lettered: AtomicU64::new(0),
            }),
            ready_rx: Mutex::new(Some(ready_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the scheduler and worker tasks. Call once.
    pub fn start(&self, handler: Arc<dyn DispatchHandler>) -> Result<()> {
        let rx = self.ready_rx.lock().take().ok_or_else(|| {
            NotifyError::new(ErrorCode::InvalidConfig, "queue already started")
        })?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(scheduler_loop(Arc::clone(&self.shared))));

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.shared.config.worker_count.max(1);
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                Arc::clone(&rx),
                Arc::clone(&handler),
                worker_id,
            )));
        }
        info!(workers = workers, capacity = self.shared.config.capacity, "memory queue started");
        Ok(())
    }

    /// Dead letters currently retained, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead.lock().iter().cloned().collect()
    }

    fn push_ready(&self, item: QueueItem) -> Result<()> {
        match self.shared.ready_tx.try_send(item) {
            Ok(()) => {
                self.shared.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(NotifyError::new(
                ErrorCode::QueueFull,
                format!("queue at capacity ({})", self.shared.config.capacity),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(NotifyError::from_code(ErrorCode::QueueClosed))
            }
        }
    }
}

#[async_trait]
impl NotificationQueue for MemoryQueue {
    fn enqueue(&self, item: QueueItem) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(NotifyError::from_code(ErrorCode::QueueClosed));
        }
        self.shared.total_enqueued.fetch_add(1, Ordering::Relaxed);

        if item.message.is_scheduled() {
            // Fire time is anchored to the message's creation, not the
            // enqueue instant.
            let fire_at = item.message.fire_at().expect("scheduled message has delay");
            let remaining = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(
                message_id = %item.message.id,
                delay_ms = remaining.as_millis() as u64,
                "scheduling delayed message"
            );
            return self
                .shared
                .schedule(item, remaining)
                .map_err(|_| NotifyError::new(ErrorCode::QueueFull, "scheduled set at capacity"));
        }
        self.push_ready(item)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.shared.depth.load(Ordering::Relaxed),
            scheduled: self.shared.scheduled.lock().len(),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            dead_letters: self.shared.dead.lock().len(),
            total_enqueued: self.shared.total_enqueued.load(Ordering::Relaxed),
            total_dispatched: self.shared.total_dispatched.load(Ordering::Relaxed),
            total_retried: self.shared.total_retried.load(Ordering::Relaxed),
            total_dead_lettered: self.shared.total_dead_lettered.load(Ordering::Relaxed),
        }
    }

    async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping memory queue");
        self.shared.stop.cancel();
        self.shared.scheduler_wake.notify_waiters();
    }

    async fn drained(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.shared.depth.load(Ordering::SeqCst) == 0
                && self.shared.in_flight.load(Ordering::SeqCst) == 0
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = self.shared.idle.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}

async fn scheduler_loop(shared: Arc<Shared>) {
    enum Next {
        Idle,
        WaitUntil(Instant),
        Fire,
    }

    debug!("queue scheduler started");
    loop {
        let next = {
            let heap = shared.scheduled.lock();
            match heap.peek() {
                None => Next::Idle,
                Some(entry) if entry.fire_at <= Instant::now() => Next::Fire,
                Some(entry) => Next::WaitUntil(entry.fire_at),
            }
        };

        match next {
            Next::Fire => {
                let entry = shared.scheduled.lock().pop();
                let Some(entry) = entry else { continue };
                let mut item = entry.item;
                if item.cancel.is_cancelled() {
                    item.complete(Err(NotifyError::new(
                        ErrorCode::Cancelled,
                        "cancelled while scheduled",
                    )));
                    continue;
                }
                // Promotion applies backpressure instead of dropping.
                tokio::select! {
                    permit = shared.ready_tx.reserve() => match permit {
                        Ok(permit) => {
                            shared.depth.fetch_add(1, Ordering::Relaxed);
                            permit.send(item);
                        }
                        Err(_) => {
                            item.complete(Err(NotifyError::from_code(ErrorCode::QueueClosed)));
                            break;
                        }
                    },
                    _ = shared.stop.cancelled() => {
                        item.complete(Err(NotifyError::from_code(ErrorCode::QueueClosed)));
                        break;
                    }
                }
            }
            Next::WaitUntil(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = shared.scheduler_wake.notified() => {}
                    _ = shared.stop.cancelled() => break,
                }
            }
            Next::Idle => {
                tokio::select! {
                    _ = shared.scheduler_wake.notified() => {}
                    _ = shared.stop.cancelled() => break,
                }
            }
        }
    }

    // Anything still scheduled will never fire.
    let remaining: Vec<ScheduledEntry> = shared.scheduled.lock().drain().collect();
    for entry in remaining {
        let mut item = entry.item;
        item.complete(Err(NotifyError::from_code(ErrorCode::QueueClosed)));
    }
    debug!("queue scheduler exited");
}

async fn worker_loop(
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    handler: Arc<dyn DispatchHandler>,
    worker_id: usize,
) {
    debug!(worker_id, "queue worker started");
    loop {
        let item = {
            let mut rx = rx.lock().await;
            if shared.stop.is_cancelled() {
                // Drain what is already queued, then exit.
                rx.try_recv().ok()
            } else {
                tokio::select! {
                    item = rx.recv() => item,
                    _ = shared.stop.cancelled() => rx.try_recv().ok(),
                }
            }
        };
        let Some(mut item) = item else { break };

        shared.depth.fetch_sub(1, Ordering::Relaxed);
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        process(&shared, handler.as_ref(), &mut item).await;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.idle.notify_waiters();
    }
    debug!(worker_id, "queue worker exited");
}

async fn process(shared: &Arc<Shared>, handler: &dyn DispatchHandler, item: &mut QueueItem) {
    if item.cancel.is_cancelled() {
        item.complete(Err(NotifyError::new(
            ErrorCode::Cancelled,
            "cancelled before dispatch",
        )));
        return;
    }

    let result = handler.dispatch(item.message.clone(), &item.cancel).await;
    if item.cancel.is_cancelled() {
        // Cancelled mid-dispatch: the handle observes the cancellation,
        // not whatever partial outcome dispatch salvaged.
        item.complete(Err(NotifyError::new(
            ErrorCode::Cancelled,
            "cancelled during dispatch",
        )));
        return;
    }
    match result {
        Ok(receipt) => {
            shared.total_dispatched.fetch_add(1, Ordering::Relaxed);
            item.complete(Ok(receipt));
        }
        Err(error)
            if error.is_retryable()
                && item.attempts < shared.config.retry.max_retries
                && !shared.stop.is_cancelled() =>
        {
            let delay = shared.config.retry.delay_for(item.attempts);
            warn!(
                message_id = %item.message.id,
                code = %error.code,
                attempt = item.attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "transient dispatch failure, re-scheduling"
            );
            shared.total_retried.fetch_add(1, Ordering::Relaxed);
            let retry_item = QueueItem {
                message: item.message.clone(),
                attempts: item.attempts + 1,
                completion: item.completion.take(),
                cancel: item.cancel.clone(),
            };
            if let Err(returned) = shared.schedule(retry_item, delay) {
                // Scheduled set full; the original failure stands.
                shared.dead_letter(returned, error);
            }
        }
        Err(error) => {
            let dead_item = QueueItem {
                message: item.message.clone(),
                attempts: item.attempts,
                completion: item.completion.take(),
                cancel: item.cancel.clone(),
            };
            shared.dead_letter(dead_item, error);
        }
    }
}
