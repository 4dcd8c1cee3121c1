//! The countdown timer primitive.
//!
//! A [`Countdown`] delivers exactly one signal per elapsed second and a
//! single terminal [`CountdownSignal::Expired`], then stops. It holds no
//! emergency state of its own: the caller supplies an async callback and
//! owns all business logic, which keeps the primitive reusable and the
//! engine's state machine the single source of truth.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Errors from the timer primitive.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// A countdown must run for at least one whole second.
    #[error("countdown duration must be at least 1 second (got {0})")]
    InvalidDuration(u32),
}

/// One signal from a running countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownSignal {
    /// A whole second elapsed; `seconds_remaining` seconds are left.
    Tick { seconds_remaining: u32 },
    /// The countdown reached zero. Always the final signal.
    Expired,
}

/// A cancellable, pausable one-shot countdown.
///
/// Construction validates the duration; [`start`] spawns the ticking task
/// and hands back a [`CountdownHandle`] for cancel/pause control.
///
/// [`start`]: Countdown::start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    duration_secs: u32,
}

impl Countdown {
    /// Creates a countdown of `duration_secs` whole seconds.
    ///
    /// Rejected before any task is spawned, so a failed call has no side
    /// effects.
    pub fn new(duration_secs: u32) -> Result<Self, TimerError> {
        if duration_secs == 0 {
            return Err(TimerError::InvalidDuration(duration_secs));
        }
        Ok(Self { duration_secs })
    }

    /// Spawns the countdown task and begins ticking.
    ///
    /// `on_signal` is awaited once per elapsed second with
    /// [`CountdownSignal::Tick`] carrying the new remaining time, and once
    /// more with [`CountdownSignal::Expired`] when the countdown reaches
    /// zero. Ticks arrive in strictly decreasing remaining-time order; a
    /// stalled host scheduler delays ticks but never double-delivers one.
    pub fn start<F, Fut>(self, mut on_signal: F) -> CountdownHandle
    where
        F: FnMut(CountdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (pause_tx, mut pause_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let task_cancelled = cancelled.clone();
        let task = tokio::spawn(async move {
            let start = Instant::now() + Duration::from_secs(1);
            let mut ticker = interval_at(start, Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut seconds_remaining = self.duration_secs;
            loop {
                // Hold here while paused; remaining time is frozen.
                if *pause_rx.borrow() {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        changed = pause_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            ticker.reset();
                        }
                    }
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if task_cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                        seconds_remaining = seconds_remaining.saturating_sub(1);
                        if seconds_remaining == 0 {
                            on_signal(CountdownSignal::Expired).await;
                            break;
                        }
                        on_signal(CountdownSignal::Tick { seconds_remaining }).await;
                    }
                }
            }
            debug!("countdown task finished");
        });

        CountdownHandle {
            cancelled,
            pause_tx,
            shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running countdown.
///
/// Dropping the handle also stops the countdown; [`cancel`] is the explicit
/// form and takes effect without waiting for the task to be polled.
///
/// [`cancel`]: CountdownHandle::cancel
#[derive(Debug)]
pub struct CountdownHandle {
    cancelled: Arc<AtomicBool>,
    pause_tx: watch::Sender<bool>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl CountdownHandle {
    /// Stops the countdown. Idempotent; a no-op after expiry or a prior
    /// cancel. No new signal delivery begins after this returns (a delivery
    /// already in flight may still complete).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.shutdown_tx.send(()).ok();
    }

    /// Freezes the countdown. No signals are delivered while paused and the
    /// remaining time is preserved.
    pub fn pause(&self) {
        self.pause_tx.send(true).ok();
    }

    /// Resumes a paused countdown. The next tick lands a full second after
    /// the resume.
    pub fn resume(&self) {
        self.pause_tx.send(false).ok();
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once the countdown task has exited, whether by expiry or
    /// cancellation.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    type SignalRx = mpsc::UnboundedReceiver<CountdownSignal>;

    fn collecting_callback() -> (
        SignalRx,
        impl FnMut(CountdownSignal) -> std::future::Ready<()> + Send + 'static,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = move |signal| {
            tx.send(signal).ok();
            std::future::ready(())
        };
        (rx, callback)
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert_eq!(Countdown::new(0), Err(TimerError::InvalidDuration(0)));
        assert!(Countdown::new(1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_one_signal_per_second_then_expires() {
        let (mut rx, callback) = collecting_callback();
        let handle = Countdown::new(3).unwrap().start(callback);

        assert_eq!(
            rx.recv().await,
            Some(CountdownSignal::Tick { seconds_remaining: 2 })
        );
        assert_eq!(
            rx.recv().await,
            Some(CountdownSignal::Tick { seconds_remaining: 1 })
        );
        assert_eq!(rx.recv().await, Some(CountdownSignal::Expired));
        assert_eq!(rx.recv().await, None);
        assert!(!handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn one_second_countdown_expires_immediately() {
        let (mut rx, callback) = collecting_callback();
        let _handle = Countdown::new(1).unwrap().start(callback);

        assert_eq!(rx.recv().await, Some(CountdownSignal::Expired));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_signals() {
        let (mut rx, callback) = collecting_callback();
        let handle = Countdown::new(10).unwrap().start(callback);

        assert_eq!(
            rx.recv().await,
            Some(CountdownSignal::Tick { seconds_remaining: 9 })
        );
        handle.cancel();
        assert!(handle.is_cancelled());

        // The task drops its sender on exit, so the channel closes instead
        // of delivering another tick.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (mut rx, callback) = collecting_callback();
        let handle = Countdown::new(5).unwrap().start(callback);

        handle.cancel();
        handle.cancel();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_remaining_time() {
        let (mut rx, callback) = collecting_callback();
        let handle = Countdown::new(3).unwrap().start(callback);

        assert_eq!(
            rx.recv().await,
            Some(CountdownSignal::Tick { seconds_remaining: 2 })
        );

        handle.pause();
        let silence = timeout(Duration::from_secs(30), rx.recv()).await;
        assert!(silence.is_err(), "no signal may be delivered while paused");

        handle.resume();
        assert_eq!(
            rx.recv().await,
            Some(CountdownSignal::Tick { seconds_remaining: 1 })
        );
        assert_eq!(rx.recv().await, Some(CountdownSignal::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_paused_stops_the_task() {
        let (mut rx, callback) = collecting_callback();
        let handle = Countdown::new(5).unwrap().start(callback);

        handle.pause();
        handle.cancel();
        assert_eq!(rx.recv().await, None);
    }
}
