use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A tick that is already running is finished first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Runs a tick function on its own thread: once after `initial_delay`, then
/// again `interval` after each tick finishes.
#[derive(Debug)]
pub struct PeriodicWorker;

impl PeriodicWorker {
    pub fn spawn<F>(
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        mut tick: F,
    ) -> io::Result<WorkerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut wait = initial_delay;
                loop {
                    // Sleeping on the channel doubles as the shutdown check.
                    match shutdown_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    tick();
                    wait = interval;
                }
                debug!(worker = %thread_name, "periodic worker stopped");
            })?;

        Ok(WorkerHandle {
            name: name.to_string(),
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn ticks_repeatedly_until_shut_down() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = PeriodicWorker::spawn(
            "test-ticker",
            Duration::from_millis(5),
            Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }

    #[test]
    fn shutdown_during_initial_delay_never_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = PeriodicWorker::spawn(
            "test-idle",
            Duration::from_secs(60),
            Duration::from_secs(60),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert_eq!(handle.name(), "test-idle");

        handle.shutdown();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
