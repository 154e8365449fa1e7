// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task scheduling primitives.
//!
//! The pipeline never owns threads itself. It posts owned tasks to a
//! host-provided [`TaskRunner`]: foreground tasks run serialized on the
//! embedder's event loop and may touch host-heap objects, worker tasks run
//! on a thread pool and may not. [`TaskManager`] adds cancellation on top:
//! tasks registered with a manager become no-ops once the manager is
//! cancelled, and `cancel_and_wait` joins whatever is still running.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// An owned unit of work, executed at most once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The host's scheduling surface.
///
/// Both methods accept owned tasks and guarantee eventual execution unless
/// the embedding shuts down. Foreground tasks are serialized; worker tasks
/// run in parallel.
pub trait TaskRunner: Send + Sync {
    fn post_foreground(&self, task: Task);
    fn post_worker(&self, task: Task);
    /// Number of threads backing `post_worker`.
    fn num_worker_threads(&self) -> usize;
}

struct ManagerInner {
    canceled: AtomicBool,
    /// Number of registered tasks currently executing their body.
    running: Mutex<usize>,
    idle: Condvar,
}

/// Tracks tasks so they can be cancelled as a group.
///
/// A cancelled task that has not started yet runs as a no-op; a task that is
/// mid-flight is joined by [`TaskManager::cancel_and_wait`].
#[derive(Clone)]
pub struct TaskManager(Arc<ManagerInner>);

impl TaskManager {
    pub fn new() -> Self {
        Self(Arc::new(ManagerInner {
            canceled: AtomicBool::new(false),
            running: Mutex::new(0),
            idle: Condvar::new(),
        }))
    }

    pub fn canceled(&self) -> bool {
        self.0.canceled.load(Ordering::Acquire)
    }

    /// Wrap `f` so that it participates in cancellation.
    pub fn register(&self, f: impl FnOnce() + Send + 'static) -> Task {
        let inner = Arc::clone(&self.0);
        Box::new(move || {
            {
                // The check and the increment must be one atomic step with
                // respect to `cancel_and_wait`, hence both under the lock.
                let mut running = inner.running.lock();
                if inner.canceled.load(Ordering::Relaxed) {
                    return;
                }
                *running += 1;
            }
            f();
            let mut running = inner.running.lock();
            *running -= 1;
            if *running == 0 {
                inner.idle.notify_all();
            }
        })
    }

    /// Prevent all not-yet-started tasks from running and block until every
    /// in-flight task has finished. Idempotent.
    pub fn cancel_and_wait(&self) {
        let mut running = self.0.running.lock();
        self.0.canceled.store(true, Ordering::Release);
        while *running > 0 {
            self.0.idle.wait(&mut running);
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

struct ForegroundQueue {
    queue: Mutex<VecDeque<Task>>,
    nonempty: Condvar,
}

/// The default [`TaskRunner`]: a fixed worker-thread pool plus a foreground
/// queue the embedder drains explicitly with [`PumpRunner::pump`].
///
/// An embedding with its own event loop would implement [`TaskRunner`]
/// directly; this runner exists for hosts (and tests) that want the pipeline
/// to bring its own threads.
pub struct PumpRunner {
    foreground: ForegroundQueue,
    workers: crossbeam_channel::Sender<Task>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PumpRunner {
    pub fn new(num_workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let threads = (0..num_workers)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("riptide-worker-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            foreground: ForegroundQueue {
                queue: Mutex::new(VecDeque::new()),
                nonempty: Condvar::new(),
            },
            workers: tx,
            threads: Mutex::new(threads),
        }
    }

    /// Run foreground tasks on the calling thread until the queue is empty,
    /// including tasks posted while pumping. Returns how many tasks ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.foreground.queue.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Block until a foreground task is queued or `timeout` elapses. Returns
    /// whether a task is available.
    pub fn wait_for_foreground_task(&self, timeout: Duration) -> bool {
        let mut queue = self.foreground.queue.lock();
        if !queue.is_empty() {
            return true;
        }
        self.foreground.nonempty.wait_for(&mut queue, timeout);
        !queue.is_empty()
    }
}

impl TaskRunner for PumpRunner {
    fn post_foreground(&self, task: Task) {
        let mut queue = self.foreground.queue.lock();
        queue.push_back(task);
        self.foreground.nonempty.notify_all();
    }

    fn post_worker(&self, task: Task) {
        // The channel only disconnects when the pool is being dropped, at
        // which point the task is allowed to vanish.
        let _ = self.workers.send(task);
    }

    fn num_worker_threads(&self) -> usize {
        self.threads.lock().len()
    }
}

impl Drop for PumpRunner {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain outstanding tasks and
        // exit their receive loops.
        let (closed, _) = crossbeam_channel::unbounded();
        self.workers = closed;
        for handle in self.threads.get_mut().drain(..) {
            // The last strong reference to the runner can die on a worker
            // thread (a task dropping the final module handle); that thread
            // must not join itself, it exits on its own once the channel is
            // closed.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
