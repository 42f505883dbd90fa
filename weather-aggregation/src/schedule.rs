//! Background tasks that run on a fixed cadence until stopped.
//!
//! Each task owns a named thread. Waiting between ticks happens on a stop
//! channel with a timeout, so a stop request is observed immediately rather
//! than after the current interval elapses.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

/// Handle to a running periodic task.
pub struct PeriodicTask {
    name: String,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PeriodicTask {
    /// Runs `tick` right away and then once per `interval`.
    ///
    /// An `Err` or a panic inside one tick is logged and does not cancel
    /// later ticks.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let task_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                loop {
                    match panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(task = %task_name, error = ?err, "periodic task failed"),
                        Err(_) => warn!(task = %task_name, "periodic task panicked"),
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(task = %task_name, "periodic task stopped");
                let _ = done_tx.send(());
            })
            .with_context(|| format!("failed to spawn periodic task {name}"))?;

        Ok(Self {
            name,
            stop_tx,
            done_rx,
            thread: Some(thread),
        })
    }

    /// Asks the task to stop and waits up to `grace` for it to finish.
    ///
    /// A task still busy after `grace` is detached; its thread exits on its
    /// own once the current tick returns.
    pub fn stop(mut self, grace: Duration) {
        self.halt(grace);
    }

    fn halt(&mut self, grace: Duration) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if thread.thread().id() == thread::current().id() {
            // Dropped from inside its own tick; the loop sees the stop signal next.
            return;
        }
        match self.done_rx.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(task = %self.name, ?grace, "periodic task did not stop in time, detaching");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.halt(Duration::from_secs(30));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use anyhow::anyhow;

    use super::*;

    #[test]
    fn ticks_immediately_and_repeatedly() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::spawn("test-ticker", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("spawn");

        thread::sleep(Duration::from_millis(100));
        task.stop(Duration::from_secs(1));
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn failing_ticks_keep_running() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::spawn("test-failing", Duration::from_millis(5), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                return Err(anyhow!("tick {n} failed"));
            }
            if n == 3 {
                panic!("tick {n} panicked");
            }
            Ok(())
        })
        .expect("spawn");

        thread::sleep(Duration::from_millis(100));
        task.stop(Duration::from_secs(1));
        assert!(count.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn stop_does_not_wait_for_interval() {
        let task = PeriodicTask::spawn("test-slow", Duration::from_secs(3600), || Ok(()))
            .expect("spawn");
        let started = Instant::now();
        task.stop(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
