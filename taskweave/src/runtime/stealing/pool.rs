use crate::runtime::global_control::{GlobalControl, Parameter};
use crate::runtime::stealing::{Shared, worker};
use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error};

/// The dedicated worker threads of an arena.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns one thread per dedicated slot. On failure the threads that did
    /// start are shut down and joined before the error is returned.
    pub(crate) fn start(shared: &Arc<Shared>) -> Result<Self> {
        let num_workers = shared.cfg.worker_threads;
        let mut handles = Vec::with_capacity(num_workers);

        for slot in 0..num_workers {
            match spawn_worker_thread(Arc::clone(shared), slot) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.shutdown();
                    let pool = Self {
                        handles: Mutex::new(handles),
                    };
                    if let Err(join_err) = pool.join_all() {
                        error!(error = %join_err, "failed to join workers after spawn error");
                    }
                    return Err(e);
                }
            }
        }

        debug!(workers = num_workers, "thread pool started");

        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Joins every worker thread. The current thread is skipped (and detached)
    /// when it is itself a worker of this pool, which happens when the last
    /// arena handle is dropped from inside a task.
    pub(crate) fn join_all(&self) -> Result<()> {
        let current: ThreadId = thread::current().id();
        let mut handles = self.handles.lock();

        let errors = handles
            .drain(..)
            .filter(|handle| handle.thread().id() != current)
            .filter_map(|handle| {
                let id = handle.thread().id();
                handle.join().err().map(|_| id)
            })
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", errors.len()))
        }
    }
}

fn spawn_worker_thread(shared: Arc<Shared>, slot: usize) -> Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(shared.cfg.thread_name.next_name());

    let stack_size = shared
        .cfg
        .thread_stack_size
        .or_else(|| GlobalControl::active_value(Parameter::ThreadStackSize));

    if let Some(stack_size) = stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || worker::run_dedicated(shared, slot))
        .with_context(|| format!("failed to spawn worker thread for slot {slot}"))
}
