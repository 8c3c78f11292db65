//! Background worker pools for flushes and compactions.
//!
//! Each pool owns a fixed set of named threads fed from a single
//! crossbeam channel. Jobs report a [`JobOutcome`] so the submitter can
//! distinguish "version installed" from "nothing to do" and from errors
//! that deserve a retry versus errors that poison the engine.

use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;

use crate::error::Error;

/// What a background job accomplished.
#[derive(Debug)]
pub enum JobOutcome {
    /// A new version was installed (flush or compaction landed).
    Installed,
    /// The job ran but found no work.
    Nothing,
    /// Transient failure; the submitter may reschedule.
    Retry(Error),
    /// Unrecoverable failure; the engine should stop accepting writes.
    Fatal(Error),
}

type Job = Box<dyn FnOnce() -> JobOutcome + Send + 'static>;

/// Fixed-size pool of worker threads.
///
/// Dropping the pool closes the channel and joins every worker, so any
/// job already queued finishes before drop returns.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let thread_name = format!("{name}-{i}");
            let builder = std::thread::Builder::new().name(thread_name.clone());
            let handle = builder
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match job() {
                            JobOutcome::Installed | JobOutcome::Nothing => {}
                            JobOutcome::Retry(e) => {
                                log::warn!("{thread_name}: job failed, will be retried: {e}");
                            }
                            JobOutcome::Fatal(e) => {
                                log::error!("{thread_name}: job failed permanently: {e}");
                            }
                        }
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"));
            workers.push(handle);
        }
        ThreadPool {
            tx: Some(tx),
            workers,
        }
    }

    /// Queue a job. Returns false if the pool is already shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() -> JobOutcome + Send + 'static,
    {
        match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs and wait for queued work to drain.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_queued_jobs_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new("test-worker", 2);
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                JobOutcome::Nothing
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut pool = ThreadPool::new("test-worker", 1);
        pool.shutdown();
        assert!(!pool.submit(|| JobOutcome::Nothing));
    }
}
