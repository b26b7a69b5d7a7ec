//! Serial task executor
//!
//! Timer callbacks and connectivity notifications run one at a time, in
//! submission order, on a dedicated worker thread. Each task takes the wake
//! lock when it is queued and gives it back when it has run, whether it
//! returned or panicked, so the device cannot sleep between a notification
//! arriving and the manager reacting to it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::wake_lock::{SipWakeLock, WakeLockOwner};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    owner: WakeLockOwner,
    task: Task,
}

/// Single-threaded FIFO executor
pub struct SerialExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    wake_lock: Arc<SipWakeLock>,
    next_task: AtomicU64,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Spawn the worker thread
    pub fn new(name: &str, wake_lock: Arc<SipWakeLock>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker_lock = wake_lock.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(receiver, worker_lock))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            wake_lock,
            next_task: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `task`; it runs after every task submitted before it
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let owner = WakeLockOwner::Task(self.next_task.fetch_add(1, Ordering::Relaxed));
        self.wake_lock.acquire(owner);
        let job = Job {
            owner,
            task: Box::new(task),
        };
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            warn!("executor is shut down; task dropped");
            self.wake_lock.release(owner);
        }
    }

    /// Block until every task queued so far has run
    ///
    /// Safe to call from inside an async runtime, though it blocks that
    /// thread. Called from a task on this executor it returns at once.
    pub fn flush(&self) {
        if self.on_worker() {
            warn!("flush from an executor task ignored");
            return;
        }
        let (done, wait) = std_mpsc::sync_channel(1);
        self.execute(move || {
            let _ = done.send(());
        });
        // a dropped task after shutdown also ends the wait
        let _ = wait.recv();
    }

    fn on_worker(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |worker| worker.thread().id() == thread::current().id())
    }

    /// Stop accepting tasks, drain the queue and join the worker
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("executor worker terminated abnormally");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(mut receiver: mpsc::UnboundedReceiver<Job>, wake_lock: Arc<SipWakeLock>) {
    debug!("executor worker started");
    while let Some(job) = receiver.blocking_recv() {
        let _scope = wake_lock.adopt(job.owner);
        if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(job.task)) {
            let message = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(owner = ?job.owner, %message, "executor task panicked");
        }
    }
    debug!("executor worker stopped");
}
