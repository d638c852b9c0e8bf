// Copyright 2026 Commlink Contributors

//! Work-dispatch queue with per-group serialization.
//!
//! One shared queue feeds a fixed pool of worker threads.  A worker scans
//! for the first item whose group (if any) is not currently executing,
//! skipping items whose group is busy, marks the group busy, and runs the
//! item outside the lock.  Items sharing a group therefore execute in
//! submission order and never overlap; items with no group or distinct
//! groups run concurrently up to the pool size.  The scan is O(n) in the
//! worst case, which is acceptable while concurrent group counts stay
//! small relative to the worker pool.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use slog::{debug, Logger};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct GroupUsage {
    running: bool,
    outstanding: usize,
}

struct WorkRec {
    task: Task,
    group: Option<u64>,
}

struct State {
    queue: VecDeque<WorkRec>,
    groups: HashMap<u64, GroupUsage>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

pub struct WorkQueue {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
    log: Logger,
}

struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl WorkQueue {
    pub fn new(worker_count: usize, log: Logger) -> WorkQueue {
        assert!(worker_count > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                groups: HashMap::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let workers = (0..worker_count)
            .map(|id| Worker::new(id, Arc::clone(&shared)))
            .collect();
        WorkQueue {
            shared,
            workers,
            log,
        }
    }

    /// Enqueues `task`.  Tasks sharing a group key run in submission order
    /// and never concurrently with each other; a `None` group imposes no
    /// ordering.
    pub fn submit<F>(&self, group: Option<u64>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().expect("work queue poisoned");
        if state.shutdown {
            debug!(self.log, "dropping task submitted after shutdown");
            return;
        }
        if let Some(g) = group {
            state
                .groups
                .entry(g)
                .and_modify(|u| u.outstanding += 1)
                .or_insert(GroupUsage {
                    running: false,
                    outstanding: 1,
                });
        }
        state.queue.push_back(WorkRec {
            task: Box::new(task),
            group,
        });
        drop(state);
        self.shared.available.notify_one();
    }

    /// Drains remaining work and joins the workers.
    pub fn shutdown(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("work queue poisoned");
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            debug!(self.log, "joining worker"; "worker" => worker.id);
            if worker.thread.join().is_err() {
                debug!(self.log, "worker panicked"; "worker" => worker.id);
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl Worker {
    fn new(id: usize, shared: Arc<Shared>) -> Worker {
        let thread = thread::Builder::new()
            .name(format!("commlink-worker-{}", id))
            .spawn(move || Worker::run(shared))
            .expect("failed to spawn worker thread");
        Worker { id, thread }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let mut state = shared.state.lock().expect("work queue poisoned");
            let rec = loop {
                let runnable = state.queue.iter().position(|r| match r.group {
                    None => true,
                    Some(g) => !state.groups[&g].running,
                });
                match runnable {
                    Some(idx) => {
                        let rec = state
                            .queue
                            .remove(idx)
                            .expect("scanned index out of range");
                        if let Some(g) = rec.group {
                            state
                                .groups
                                .get_mut(&g)
                                .expect("group entry missing")
                                .running = true;
                        }
                        break Some(rec);
                    }
                    None => {
                        if state.shutdown && state.queue.is_empty() {
                            break None;
                        }
                        state = shared
                            .available
                            .wait(state)
                            .expect("work queue poisoned");
                    }
                }
            };
            let rec = match rec {
                Some(rec) => rec,
                None => return,
            };
            drop(state);

            (rec.task)();

            if let Some(g) = rec.group {
                let mut state = shared.state.lock().expect("work queue poisoned");
                let usage = state.groups.get_mut(&g).expect("group entry missing");
                usage.running = false;
                usage.outstanding -= 1;
                if usage.outstanding == 0 {
                    state.groups.remove(&g);
                }
                drop(state);
                // a skipped item in this group may be runnable now
                shared.available.notify_all();
            }
        }
    }
}
