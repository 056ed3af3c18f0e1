//! The serialized I/O queue.
//!
//! A single worker thread executes submitted tasks in submission order
//! while the submitting thread blocks on the result. Namespace operations
//! hand whiteout maintenance and opaque-marker probes to this queue when
//! they must proceed regardless of the calling thread's effective
//! credentials.

use std::sync::mpsc;
use std::thread;

use log::error;
use parking_lot::Mutex;

use crate::errors::{Errno, Result};

type Task = Box<dyn FnOnce() + Send>;

/// Handle to the worker; owned by the mount and stopped on unmount.
#[derive(Debug)]
pub(crate) struct Sioq {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Sioq {
    /// Starts the worker thread.
    pub(crate) fn start() -> Result<Sioq> {
        let (tx, rx) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name("unionfs-sioq".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .map_err(|_| Errno::ENOMEM)?;
        Ok(Sioq {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Runs `f` on the worker and blocks until it completes.
    ///
    /// Tasks submitted from any thread execute in the order their submits
    /// acquired the queue; the submitting thread is suspended until its own
    /// task has run.
    pub(crate) fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let task: Task = Box::new(move || {
            let _ = done_tx.send(f());
        });
        {
            let guard = self.tx.lock();
            match guard.as_ref() {
                Some(tx) => tx.send(task).map_err(|_| Errno::EIO)?,
                None => {
                    error!("unionfs: sioq used after shutdown");
                    return Err(Errno::EIO);
                }
            }
        }
        done_rx.recv().map_err(|_| Errno::EIO)
    }

    /// Stops the worker after draining queued tasks.
    pub(crate) fn stop(&self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("unionfs: sioq worker panicked");
            }
        }
    }
}

impl Drop for Sioq {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_tasks_and_returns_results() {
        let sioq = Sioq::start().unwrap();
        assert_eq!(sioq.run(|| 40 + 2).unwrap(), 42);
        sioq.stop();
        assert_eq!(sioq.run(|| 0).unwrap_err(), Errno::EIO);
    }

    #[test]
    fn executes_in_submission_order() {
        let sioq = Arc::new(Sioq::start().unwrap());
        let seen = Arc::new(AtomicUsize::new(0));
        for i in 0..32 {
            let seen = Arc::clone(&seen);
            let order = sioq
                .run(move || seen.fetch_add(1, Ordering::SeqCst) == i)
                .unwrap();
            assert!(order);
        }
    }
}
