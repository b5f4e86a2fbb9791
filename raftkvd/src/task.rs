//! Worker scaffolding: auto-joining threads and coalescing triggers.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

pub struct AutoJoinHandle {
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from(thread::spawn(f))
    }
}

impl From<JoinHandle<()>> for AutoJoinHandle {
    fn from(value: JoinHandle<()>) -> Self {
        Self {
            join_handle: Some(value),
        }
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        self.join_handle
            .take()
            .expect("Missing join handle")
            .join()
            .expect("Task thread panicked");
    }
}

pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Wakes a periodic worker ahead of its interval. Triggers coalesce: while
/// one wake-up is queued, further triggers are dropped.
#[derive(Clone)]
pub struct Trigger {
    tx: flume::Sender<()>,
}

impl Trigger {
    pub fn new() -> (Trigger, flume::Receiver<()>) {
        let (tx, rx) = flume::bounded(1);
        (Trigger { tx }, rx)
    }

    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Block until the next scheduled run: the interval elapsing or an explicit
/// trigger. `false` means every trigger handle is gone and the worker should
/// exit.
pub fn await_tick(ticks: &flume::Receiver<()>, interval: Duration) -> bool {
    match ticks.recv_timeout(interval) {
        Ok(()) | Err(flume::RecvTimeoutError::Timeout) => true,
        Err(flume::RecvTimeoutError::Disconnected) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn trigger_wakes_before_the_interval() {
        let (trigger, ticks) = Trigger::new();
        trigger.trigger();

        let started = Instant::now();
        assert!(await_tick(&ticks, Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn triggers_coalesce() {
        let (trigger, ticks) = Trigger::new();
        for _ in 0..10 {
            trigger.trigger();
        }

        assert!(await_tick(&ticks, Duration::from_secs(1)));
        // the remaining nine collapsed into nothing
        assert!(ticks.try_recv().is_err());
    }

    #[test]
    fn dropping_the_trigger_stops_the_worker() {
        let (trigger, ticks) = Trigger::new();
        drop(trigger);
        assert!(!await_tick(&ticks, Duration::from_millis(10)));
    }
}
