//! # Kernel Errors
//!
//! Failures reported to thread-mode callers of the kernel API.
//!
//! Interrupt-level code never returns these: there is nothing above a
//! handler to report to, so an invariant violation there panics instead.

use core::fmt;

use crate::task::{TaskId, TaskState};

/// Errors returned by the kernel's task-management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// Every slot of the task pool is in use.
    PoolExhausted,
    /// The id does not name a live task.
    InvalidId(TaskId),
    /// The task is not in a state that allows the operation.
    InvalidState {
        /// The task the operation was aimed at.
        id: TaskId,
        /// Its state at the time of the call.
        state: TaskState,
    },
    /// The idle task cannot be destroyed, suspended or re-prioritised.
    IdleTask,
    /// The operation needs a running scheduler.
    NotStarted,
    /// The scheduler was already started.
    AlreadyStarted,
    /// There is no Ready task to dispatch.
    NoRunnableTask,
    /// A wait ended without a recorded result, because the task was
    /// suspended while waiting and later resumed.
    WaitAbandoned,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::PoolExhausted => write!(f, "task pool exhausted"),
            KernelError::InvalidId(id) => write!(f, "{} is not a live task", id),
            KernelError::InvalidState { id, state } => {
                write!(f, "{} cannot do that while {:?}", id, state)
            }
            KernelError::IdleTask => write!(f, "operation not allowed on the idle task"),
            KernelError::NotStarted => write!(f, "scheduler not started"),
            KernelError::AlreadyStarted => write!(f, "scheduler already started"),
            KernelError::NoRunnableTask => write!(f, "no runnable task"),
            KernelError::WaitAbandoned => write!(f, "wait abandoned"),
        }
    }
}

impl core::error::Error for KernelError {}
