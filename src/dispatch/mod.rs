//! Hand-off of due jobs to workers.
//!
//! The engine and the manager push job ids through a [`Dispatcher`]. The
//! bundled [`QueueDispatcher`] is an in-process tokio channel. Delayed
//! dispatches are parked in a single timer task; a newer dispatch for the
//! same job replaces the parked one.

use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::job::ScheduledJob;
use crate::core::types::JobId;

/// Errors raised when handing a job to a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The receiving side is gone.
    #[error("dispatch queue closed")]
    Closed,

    /// Transport-specific failure.
    #[error("dispatch failed: {0}")]
    Other(String),
}

/// Transport that hands a job to a worker.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Enqueue `job`, optionally after `delay`.
    async fn dispatch(&self, job: &ScheduledJob, delay: Option<Duration>)
    -> Result<(), DispatchError>;

    /// Dispatches accepted but not yet consumed, including delayed ones.
    fn size(&self) -> usize;
}

enum TimerRequest {
    /// Deliver `id` at `deadline`, replacing any parked delivery of it.
    Park { id: JobId, deadline: Instant },
    /// Drop a parked delivery of `id`.
    Unpark(JobId),
}

/// In-process dispatcher backed by an unbounded tokio channel.
///
/// Must be created inside a Tokio runtime; it spawns the timer task.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<JobId>,
    timer: mpsc::UnboundedSender<TimerRequest>,
    pending: Arc<AtomicUsize>,
}

/// Receiving end of a [`QueueDispatcher`].
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<JobId>,
    pending: Arc<AtomicUsize>,
}

impl QueueDispatcher {
    /// Create a dispatcher and the receiver a worker consumes.
    pub fn new() -> (Self, DispatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer, timer_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_timer(timer_rx, tx.clone(), Arc::clone(&pending)));

        (
            Self {
                tx,
                timer,
                pending: Arc::clone(&pending),
            },
            DispatchReceiver { rx, pending },
        )
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(
        &self,
        job: &ScheduledJob,
        delay: Option<Duration>,
    ) -> Result<(), DispatchError> {
        if self.tx.is_closed() {
            return Err(DispatchError::Closed);
        }

        let id = job.id.clone();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let sent = match delay.filter(|d| !d.is_zero()) {
            None => {
                let _ = self.timer.send(TimerRequest::Unpark(id.clone()));
                self.tx.send(id).is_ok()
            }
            Some(delay) => self
                .timer
                .send(TimerRequest::Park {
                    id,
                    deadline: Instant::now() + delay,
                })
                .is_ok(),
        };
        if !sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Delivers parked dispatches when they come due.
///
/// Runs until every dispatcher handle is dropped and nothing is parked.
async fn run_timer(
    mut requests: mpsc::UnboundedReceiver<TimerRequest>,
    tx: mpsc::UnboundedSender<JobId>,
    pending: Arc<AtomicUsize>,
) {
    let mut queue: BinaryHeap<Reverse<(Instant, u64, JobId)>> = BinaryHeap::new();
    // Live entry per job; heap entries with another sequence are stale.
    let mut parked: HashMap<JobId, u64> = HashMap::new();
    let mut sequence: u64 = 0;
    let mut open = true;

    while open || !parked.is_empty() {
        let next = queue.peek().map(|Reverse((deadline, _, _))| *deadline);

        tokio::select! {
            request = requests.recv(), if open => match request {
                Some(TimerRequest::Park { id, deadline }) => {
                    sequence += 1;
                    if parked.insert(id.clone(), sequence).is_some() {
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    queue.push(Reverse((deadline, sequence, id)));
                }
                Some(TimerRequest::Unpark(id)) => {
                    if parked.remove(&id).is_some() {
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                None => open = false,
            },

            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                while let Some(Reverse((deadline, _, _))) = queue.peek()
                    && *deadline <= now
                {
                    let Some(Reverse((_, seq, id))) = queue.pop() else {
                        break;
                    };
                    if parked.get(&id) != Some(&seq) {
                        continue;
                    }
                    parked.remove(&id);
                    if tx.send(id).is_err() {
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }

        if queue.len() > parked.len() * 2 + 64 {
            queue.retain(|Reverse((_, seq, id))| parked.get(id) == Some(seq));
        }
    }
}

impl DispatchReceiver {
    /// Wait for the next dispatched job id.
    pub async fn recv(&mut self) -> Option<JobId> {
        let id = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }

    /// Take a dispatched job id without waiting.
    pub fn try_recv(&mut self) -> Option<JobId> {
        let id = self.rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }
}
