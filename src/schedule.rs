//! Periodic background tasks with cooperative shutdown.
//!
//! Both the bucket decay drivers and the secret sweeper are "run this every
//! `period` until told to stop" loops; they share this utility.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{trace, warn};

/// Longest period accepted for decay and sweep intervals (30 days).
pub const MAX_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Owner side of a shutdown broadcast.
///
/// Dropping the `Shutdown` also releases every subscribed task.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a shutdown broadcaster in the "running" state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Get a signal that resolves once shutdown is triggered.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Tell every subscriber to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of a [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is triggered or the broadcaster is dropped.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawn a task on `handle` that calls `tick` once per `period`.
///
/// The first tick fires one full `period` after spawning. The task ends when
/// `tick` returns [`ControlFlow::Break`] or when `signal` fires. `period`
/// must be non-zero. A period too long to schedule never ticks; the task
/// then only waits for `signal`.
pub fn spawn_periodic<F>(
    handle: &Handle,
    period: Duration,
    mut signal: ShutdownSignal,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    handle.spawn(async move {
        let Some(start) = Instant::now().checked_add(period) else {
            warn!(period = ?period, "Period too long to schedule, task will never tick");
            signal.triggered().await;
            return;
        };
        let mut ticker = time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signal.triggered() => {
                    trace!("Periodic task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if tick().is_break() {
                        break;
                    }
                }
            }
        }
    })
}
