use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The pool has been shut down and accepts no more tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Fixed number of worker threads pulling tasks from one shared queue.
///
/// The queue itself is unbounded; how much work gets accepted is decided by
/// the caller.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let join = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(join);
        }

        Ok(Self {
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn execute<F>(&self, task: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(Box::new(task)).map_err(|_| PoolClosed),
            None => Err(PoolClosed),
        }
    }

    /// Stop accepting tasks, let the workers drain what is queued and join
    /// them. Idempotent.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<mpsc::Receiver<Task>>) {
    loop {
        // Hold the receiver lock only while waiting, never while running.
        let task = {
            let rx = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match task {
            Ok(task) => task(),
            Err(_) => break,
        }
    }
    debug!(worker = ?thread::current().name(), "worker stopped");
}
