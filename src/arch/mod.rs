//! # Architecture Abstraction Layer
//!
//! The narrow contract the scheduler needs from the platform. Everything
//! register-level lives behind [`HardwareBridge`], so the scheduling core is
//! portable and can be exercised on a host with a fake bridge.
//!
//! A context switch is done in two phases. Kernel code running under the
//! critical section picks the outgoing and incoming tasks and publishes
//! their contexts through two single-slot [`HandoffCell`]s. The deferred
//! switch interrupt later reads both cells and performs the raw register
//! save and restore without calling back into the kernel.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::syscall::SyscallId;

pub mod frame;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m;

#[cfg(test)]
pub(crate) mod mock;

pub use frame::Stack;

/// Registers saved and restored across a switch.
///
/// Only the callee-saved bank and the process stack pointer are kept here:
/// the exception mechanism itself stacks R0–R3, R12, LR, PC and xPSR on the
/// task's own stack. The layout is read by assembly, so field order and
/// `repr(C)` must not change.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    /// R4–R11.
    pub registers: [u32; 8],
    /// Process stack pointer; points at the stacked exception frame.
    pub stack_pointer: usize,
}

impl TaskContext {
    /// A context with every register cleared.
    pub const EMPTY: TaskContext = TaskContext::new(0);

    /// A context that resumes on the frame at `stack_pointer`.
    pub const fn new(stack_pointer: usize) -> Self {
        Self {
            registers: [0; 8],
            stack_pointer,
        }
    }
}

/// Platform services required by the kernel core.
pub trait HardwareBridge {
    /// Publish the context the next switch saves the outgoing registers to.
    fn publish_current_context(&self, context: NonNull<TaskContext>);

    /// Publish the context the next switch (or first-task load) restores.
    fn publish_next_context(&self, context: NonNull<TaskContext>);

    /// Arm the deferred switch interrupt. Idempotent while already pending.
    fn trigger_deferred_switch(&self);

    /// Trap into privileged handling. Returns once the trap handler has
    /// returned to the caller, which for a switch may be much later.
    fn raise_supervisor_call(&self, id: SyscallId);

    /// Build a synthetic return frame for `entry` on `stack` and return the
    /// initial stack pointer.
    fn init_stack(&self, stack: &mut Stack, entry: u32) -> usize;
}

/// Single-slot cell used to hand a context over to the switch handler.
///
/// Only ever accessed from the supervisor call handler, the tick handler
/// and the deferred switch handler. The tick and switch handlers share a
/// priority level, so the kernel never publishes while a switch is reading
/// the cell; the supervisor call is only raised from thread mode, when no
/// switch can be pending.
#[repr(transparent)]
pub struct HandoffCell(AtomicPtr<TaskContext>);

impl HandoffCell {
    /// An empty cell.
    pub const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    /// Overwrite the cell with `context`.
    pub fn publish(&self, context: NonNull<TaskContext>) {
        self.0.store(context.as_ptr(), Ordering::Release);
    }

    /// Take the published context, leaving the cell empty.
    pub fn take(&self) -> Option<NonNull<TaskContext>> {
        NonNull::new(self.0.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Has nothing been published since the last take?
    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire).is_null()
    }
}

impl Default for HandoffCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_publish_and_take() {
        let cell = HandoffCell::new();
        assert!(cell.is_empty());
        assert_eq!(cell.take(), None);

        let mut a = TaskContext::new(0x2000_0100);
        let mut b = TaskContext::new(0x2000_0200);
        cell.publish(NonNull::from(&mut a));
        // A later publish overwrites the earlier one
        cell.publish(NonNull::from(&mut b));
        assert!(!cell.is_empty());

        let taken = cell.take().unwrap();
        assert_eq!(taken, NonNull::from(&mut b));
        assert!(cell.is_empty());
        assert_eq!(cell.take(), None);
    }

    #[test]
    fn test_context_layout() {
        assert_eq!(core::mem::offset_of!(TaskContext, registers), 0);
        assert_eq!(
            core::mem::offset_of!(TaskContext, stack_pointer),
            8 * core::mem::size_of::<u32>()
        );
    }
}
