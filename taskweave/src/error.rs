use crate::task::{State, TaskRef};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;

/// A centralized error type for all task and arena operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The task slab is at its configured capacity. Nothing was linked into
    /// any reference count chain, so the scheduler state is untouched.
    #[error("task slab is full ({capacity} live tasks), cannot allocate new task")]
    Exhausted { capacity: usize },

    /// The handle points to a slot that was freed, and possibly reused by
    /// another task since.
    #[error("stale task reference {0}")]
    StaleTask(TaskRef),

    #[error("invalid task state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: State, to: State },

    #[error("cannot recycle task {task} while it has {children} live children")]
    LiveChildren { task: TaskRef, children: u64 },

    /// A task body panicked. The first panic captured in a group is
    /// surfaced, siblings were cancelled.
    #[error("task panicked: {0}")]
    Panicked(TaskPanic),

    #[error("arena is shutting down")]
    Shutdown,

    /// A catch-all for any other type of unexpected error.
    #[error("an unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Contract violations are programming errors on the caller side, as
    /// opposed to runtime conditions like exhaustion or panics.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::StaleTask(_) | Error::InvalidTransition { .. } | Error::LiveChildren { .. }
        )
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panicked(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Panic payload captured from a task body.
///
/// The payload is kept so that `TaskGroup::wait` can resume the original
/// panic on the waiting thread.
pub struct TaskPanic {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl TaskPanic {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Self {
            message,
            payload: Mutex::new(Some(payload)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Takes the original payload out. Returns `None` if it was already taken.
    pub fn take_payload(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.payload.lock().take()
    }

    /// Resumes unwinding with the original payload.
    pub fn resume(self) -> ! {
        match self.take_payload() {
            Some(payload) => std::panic::resume_unwind(payload),
            None => panic!("{}", self.message),
        }
    }
}

impl fmt::Debug for TaskPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskPanic").field(&self.message).finish()
    }
}

impl fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
