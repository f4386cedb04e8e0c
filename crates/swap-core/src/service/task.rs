//! # Scheduled Tasks
//!
//! Cancellable background loops and one-shot timers. A task owns a watch
//! channel used as its shutdown signal plus the join handle; `stop()` sends
//! the signal and aborts the handle, so no callback runs after `stop()`
//! returns control to the runtime.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to a spawned loop or timer.
pub struct ScheduledTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, first tick immediately. Missed ticks are skipped.
    pub fn every<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
            }
        });
        Self::from_parts(name.into(), shutdown, handle)
    }

    /// Run `tick` after `initial`, then after whatever delay it returns;
    /// `None` ends the loop.
    pub fn adaptive<F, Fut>(name: impl Into<String>, initial: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<Duration>> + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
                match tick().await {
                    Some(next) => delay = next,
                    None => break,
                }
            }
        });
        Self::from_parts(name.into(), shutdown, handle)
    }

    /// Run `job` once after `delay` unless stopped first.
    pub fn after<Fut>(name: impl Into<String>, delay: Duration, job: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => job.await,
                _ = rx.changed() => {}
            }
        });
        Self::from_parts(name.into(), shutdown, handle)
    }

    fn from_parts(name: String, shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        debug!("[task] started {}", name);
        Self {
            name,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and abort. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            debug!("[task] stopped {}", self.name);
        }
    }

    /// Loop ended or task was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
