//! # Syscall Protocol
//!
//! The two privileged operations behind a context switch.
//!
//! - **LoadNextTask** (`svc #0`) dispatches the very first task. The
//!   kernel picks it and publishes its context as "next"; the trap handler
//!   then restores the callee-saved bank and process stack pointer from it
//!   and returns straight into thread mode on the task's synthetic frame.
//!   Nothing is saved, as there is no current task yet.
//! - **ExecuteContextSwitch** (`svc #1`) is the general case. The kernel
//!   picks the outgoing and incoming tasks, publishes both contexts and arms
//!   the deferred switch interrupt, which tail-chains from the trap and
//!   does the save and restore in one uninterruptible pass.
//!
//! Unknown call numbers are ignored. Every call site is fixed at build
//! time, so there is nobody to report them to.

use crate::arch::HardwareBridge;
use crate::kernel::Kernel;

/// Supervisor call numbers. The value is the immediate of the `svc`
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SyscallId {
    LoadNextTask = 0,
    ExecuteContextSwitch = 1,
}

impl SyscallId {
    /// Decode an `svc` immediate.
    pub const fn from_number(number: u8) -> Option<SyscallId> {
        match number {
            0 => Some(SyscallId::LoadNextTask),
            1 => Some(SyscallId::ExecuteContextSwitch),
            _ => None,
        }
    }

    /// The `svc` immediate for this call.
    pub const fn number(self) -> u8 {
        self as u8
    }
}

/// What the trap handler must do once [`dispatch`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyscallOutcome {
    /// Restore the published "next" context and return into it.
    RestoreNext,
    /// Return to the caller as usual.
    Return,
}

/// Kernel half of the supervisor call handler.
///
/// Runs in handler mode, above the tick and switch interrupts, so it never
/// races them. Must not be reached with interrupts masked.
pub fn dispatch<B: HardwareBridge, const N: usize>(
    kernel: &Kernel<B, N>,
    number: u8,
) -> SyscallOutcome {
    match SyscallId::from_number(number) {
        Some(SyscallId::LoadNextTask) => {
            match kernel.with_scheduler(|s| s.load_next_task(kernel.bridge())) {
                Ok(_) => SyscallOutcome::RestoreNext,
                Err(e) => {
                    // Kernel::start checks this before trapping, so the
                    // caller simply gets control back.
                    error!("cannot load first task: {}", e);
                    SyscallOutcome::Return
                }
            }
        }
        Some(SyscallId::ExecuteContextSwitch) => {
            if kernel.with_scheduler(|s| s.switch_context(kernel.bridge())) {
                kernel.bridge().trigger_deferred_switch();
            }
            SyscallOutcome::Return
        }
        None => {
            trace!("ignoring svc #{=u8}", number);
            SyscallOutcome::Return
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::{trampoline, MockBridge};
    use crate::scheduler::Preemption;
    use crate::task::{Priority, TaskOptions, TaskState};

    fn work(_: usize) {}
    fn idle(_: usize) {}

    fn kernel() -> Kernel<MockBridge, 4> {
        Kernel::with_preemption(MockBridge::new(), trampoline, Preemption::Priority)
    }

    #[test]
    fn test_decode_numbers() {
        assert_eq!(SyscallId::from_number(0), Some(SyscallId::LoadNextTask));
        assert_eq!(SyscallId::from_number(1), Some(SyscallId::ExecuteContextSwitch));
        assert_eq!(SyscallId::from_number(2), None);
        assert_eq!(SyscallId::ExecuteContextSwitch.number(), 1);
    }

    #[test]
    fn test_unknown_call_is_ignored() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        for number in [2u8, 7, 0xFF] {
            assert_eq!(dispatch(&kernel, number), SyscallOutcome::Return);
        }
        assert!(!kernel.bridge().switch_pending());
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn test_load_next_task_restores_first_task() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        let task = kernel
            .create_task(work, TaskOptions::with_priority(Priority::High))
            .unwrap();

        assert_eq!(dispatch(&kernel, 0), SyscallOutcome::RestoreNext);
        assert_eq!(kernel.current(), Some(task));
        assert!(!kernel.bridge().switch_pending());

        kernel.bridge().restore_next();
        let sp = kernel.with_scheduler(|s| s.tasks().stack_pointer(task));
        assert_eq!(kernel.bridge().cpu().stack_pointer, sp);

        // A second load is refused and control returns to the caller
        assert_eq!(dispatch(&kernel, 0), SyscallOutcome::Return);
        assert_eq!(kernel.current(), Some(task));
    }

    #[test]
    fn test_load_without_tasks_returns() {
        let kernel = kernel();
        assert_eq!(dispatch(&kernel, 0), SyscallOutcome::Return);
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn test_context_switch_arms_deferred_interrupt() {
        let kernel = kernel();
        let idle_id = kernel.init(idle).unwrap();
        let task = kernel.create_task(work, TaskOptions::default()).unwrap();
        dispatch(&kernel, 0);
        kernel.bridge().restore_next();
        assert_eq!(kernel.current(), Some(task));

        // Nothing to switch to while the task is still Running
        assert_eq!(dispatch(&kernel, 1), SyscallOutcome::Return);
        assert!(!kernel.bridge().switch_pending());

        kernel.with_scheduler(|s| s.sleep(10)).unwrap();
        assert_eq!(dispatch(&kernel, 1), SyscallOutcome::Return);
        assert!(kernel.bridge().switch_pending());
        assert_eq!(kernel.current(), Some(idle_id));
        assert!(kernel.bridge().complete_switch());
        kernel.with_scheduler(|s| {
            assert_eq!(s.tasks().state(task), TaskState::Waiting);
            assert_eq!(s.tasks().state(idle_id), TaskState::Running);
        });
    }
}
