//! Default worker pool.
//!
//! The endpoint consumes any [`Executor`]; this fixed-size pool is what
//! `start` creates when the embedder does not supply one. Tasks flow through
//! an unbounded channel drained by `worker-{i}` threads.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::handler::Executor;

type Job = Box<dyn FnOnce() + Send>;

pub struct ThreadPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ThreadPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            running: AtomicBool::new(true),
        })
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Job) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // dropping the sender lets workers drain and exit
            self.tx.lock().take();
            let workers = std::mem::take(&mut *self.workers.lock());
            for worker in workers {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_tasks() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            assert!(pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn rejects_after_shutdown() {
        let pool = ThreadPool::new(1).unwrap();
        pool.shutdown();
        assert!(!pool.execute(Box::new(|| {})));
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let pool = ThreadPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
