use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Job = Box<dyn FnOnce() -> TaskResult + Send + 'static>;

struct Task {
    name: String,
    job: Job,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
    }

    fn done(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.idle.notify_all();
            }
        }
    }
}

/// Fixed set of worker threads for work the caller does not wait on.
///
/// Each task runs at most once. Failures and panics are logged and the
/// task is dropped; nothing is retried.
pub struct TaskPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl TaskPool {
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending::default());

        let handles = (0..workers.max(1))
            .filter_map(|n| {
                let receiver = Arc::clone(&receiver);
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("libreread-worker-{}", n))
                    .spawn(move || worker_loop(receiver, pending))
                    .map_err(|err| error!("failed to start worker {}: {}", n, err))
                    .ok()
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            pending,
        }
    }

    /// Queues `job`. Returns `false` if the pool has been shut down.
    pub fn submit<F>(&self, name: &str, job: F) -> bool
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        self.pending.add();
        let task = Task {
            name: name.to_string(),
            job: Box::new(job),
        };
        if sender.send(task).is_err() {
            self.pending.done();
            return false;
        }
        debug!("queued background task {}", name);
        true
    }

    /// Blocks until every queued task has finished.
    pub fn wait_idle(&self) {
        let Ok(mut count) = self.pending.count.lock() else {
            return;
        };
        while *count > 0 {
            count = match self.pending.idle.wait(count) {
                Ok(count) => count,
                Err(_) => return,
            };
        }
    }

    /// Stops accepting work, finishes what is queued and joins the workers.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("background worker exited abnormally");
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Task>>>, pending: Arc<Pending>) {
    loop {
        let task = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(task) = task else {
            return;
        };

        let Task { name, job } = task;
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => debug!("background task {} finished", name),
            Ok(Err(err)) => error!("background task {} failed: {}", name, err),
            Err(_) => error!("background task {} panicked", name),
        }
        pending.done();
    }
}
