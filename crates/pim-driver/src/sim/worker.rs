//! Per-rank worker threads
//!
//! Every rank owns one thread fed through an unbounded channel, so work
//! queued on a rank runs in submission order. A [`Pending`] counter tracks
//! queued jobs plus detached callback threads; `sync` waits for it to drain
//! and collects the first error raised meanwhile.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{DriverError, Result};

pub(crate) type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

thread_local! {
    /// `(driver id, rank)` when the current thread is a rank worker.
    static CURRENT_RANK: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

#[derive(Default)]
struct PendingState {
    count: usize,
    error: Option<DriverError>,
}

/// Outstanding work of one rank.
#[derive(Default)]
pub(crate) struct Pending {
    state: Mutex<PendingState>,
    idle: Condvar,
}

impl Pending {
    pub fn begin(&self) {
        self.state.lock().count += 1;
    }

    pub fn finish(&self, result: Result<()>) {
        let mut state = self.state.lock();
        if let Err(err) = result {
            tracing::debug!(error = %err, "queued_work_failed");
            state.error.get_or_insert(err);
        }
        state.count -= 1;
        if state.count == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until nothing is outstanding, then hand over the recorded error.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.count > 0 {
            self.idle.wait(&mut state);
        }
        state.error.take().map_or(Ok(()), Err)
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().count == 0
    }
}

pub(crate) struct RankWorker {
    driver_id: u64,
    rank: usize,
    sender: Option<Sender<Job>>,
    pending: Arc<Pending>,
    thread: Option<JoinHandle<()>>,
}

impl RankWorker {
    pub fn spawn(driver_id: u64, rank: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);

        let thread = thread::Builder::new()
            .name(format!("pim-rank-{rank}"))
            .spawn(move || {
                CURRENT_RANK.with(|current| current.set(Some((driver_id, rank))));
                for job in receiver {
                    worker_pending.finish(job());
                }
            })
            .map_err(|err| DriverError::system(format!("failed to spawn worker for rank {rank}: {err}")))?;

        Ok(Self {
            driver_id,
            rank,
            sender: Some(sender),
            pending,
            thread: Some(thread),
        })
    }

    /// Whether the calling thread is this rank's worker.
    pub fn is_current(&self) -> bool {
        CURRENT_RANK.with(|current| current.get()) == Some((self.driver_id, self.rank))
    }

    pub fn pending(&self) -> &Arc<Pending> {
        &self.pending
    }

    /// Queue `job`; its error, if any, is reported by the next [`Pending::wait`].
    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DriverError::internal(format!("rank {} worker stopped", self.rank)))?;
        self.pending.begin();
        if sender.send(job).is_err() {
            self.pending.finish(Ok(()));
            return Err(DriverError::internal(format!("rank {} worker stopped", self.rank)));
        }
        Ok(())
    }

    /// Queue `job` and hand back a receiver for its result. Runs the job
    /// inline when called from this rank's own worker.
    pub fn request<T, F>(&self, job: F) -> Result<Reply<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_current() {
            return Ok(Reply::Ready(job()));
        }
        let (sender, receiver) = channel::bounded(1);
        self.submit(Box::new(move || {
            // The requester may have given up waiting; the result is then dropped.
            let _ = sender.send(job());
            Ok(())
        }))?;
        Ok(Reply::Queued(receiver))
    }

    /// Queue `job` and wait for its result.
    pub fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.request(job)?.wait()
    }

    /// Wait for the work queued on this rank. A no-op on the worker itself,
    /// whose queue cannot progress before the current job returns.
    pub fn sync(&self) -> Result<()> {
        if self.is_current() {
            return Ok(());
        }
        self.pending.wait()
    }
}

impl Drop for RankWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if !self.is_current() && thread.join().is_err() {
                tracing::warn!(rank = self.rank, "rank worker panicked");
            }
        }
    }
}

/// Result of a job submitted with [`RankWorker::request`].
pub(crate) enum Reply<T> {
    Ready(Result<T>),
    Queued(channel::Receiver<Result<T>>),
}

impl<T> Reply<T> {
    pub fn wait(self) -> Result<T> {
        match self {
            Reply::Ready(result) => result,
            Reply::Queued(receiver) => receiver
                .recv()
                .map_err(|_| DriverError::internal("rank worker dropped a request"))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        let worker = RankWorker::spawn(u64::MAX, 0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            worker
                .submit(Box::new(move || {
                    log.lock().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        worker.sync().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn sync_reports_first_queued_error_once() {
        let worker = RankWorker::spawn(u64::MAX, 1).unwrap();
        worker.submit(Box::new(|| Err(DriverError::internal("first")))).unwrap();
        worker.submit(Box::new(|| Err(DriverError::internal("second")))).unwrap();
        assert_eq!(worker.sync(), Err(DriverError::internal("first")));
        assert_eq!(worker.sync(), Ok(()));
    }

    #[test]
    fn run_returns_job_value() {
        let worker = RankWorker::spawn(u64::MAX, 2).unwrap();
        assert_eq!(worker.run(|| Ok(41 + 1)).unwrap(), 42);
        assert!(worker.pending().is_idle());
    }

    #[test]
    fn nested_request_from_worker_runs_inline() {
        let worker = Arc::new(RankWorker::spawn(u64::MAX, 3).unwrap());
        let inner = Arc::clone(&worker);
        let value = worker.run(move || inner.run(|| Ok(7))).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn detached_work_is_tracked() {
        let worker = RankWorker::spawn(u64::MAX, 4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let pending = Arc::clone(worker.pending());
        pending.begin();
        let flag = Arc::clone(&done);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(1, Ordering::SeqCst);
            pending.finish(Ok(()));
        });
        worker.sync().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
