//! # Kernel Configuration
//!
//! Compile-time constants governing the task pool, the tick and the
//! preemption policy. All limits are fixed at compile time; there is no dynamic
//! allocation.

use crate::scheduler::Preemption;

/// Maximum number of tasks the kernel can manage simultaneously,
/// including the idle task. Bounds the static task pool.
pub const MAX_TASKS: usize = 16;

/// Per-task stack size in 32-bit words. Must hold the deepest call chain
/// of the task plus the 8-word hardware exception frame.
pub const TASK_STACK_WORDS: usize = 256;

/// System clock frequency in Hz (STM32F103 running from the PLL).
pub const SYSTEM_CLOCK_HZ: u32 = 72_000_000;

/// SysTick frequency in Hz. One tick is the kernel's unit of time for
/// sleep and timeout accounting.
pub const TICK_HZ: u32 = 1000;

/// Ticks a task may run before it is rotated out in favour of another
/// Ready task of the same priority.
pub const TIME_SLICE_TICKS: u32 = 1;

/// Preemption policy used by the global kernel instance.
pub const DEFAULT_PREEMPTION: Preemption = Preemption::RoundRobin {
    slice: TIME_SLICE_TICKS,
};

/// Placeholder written into R0–R3 of a freshly built exception frame.
/// Reading it back in a task means a scratch register was used before
/// being written.
pub const SCRATCH_SENTINEL: u32 = 0xCDCD_CDCD;

/// Initial program status word: only the Thumb bit is set.
pub const INITIAL_XPSR: u32 = 0x0100_0000;

/// SVCall priority. Highest of the three kernel exceptions so that a
/// supervisor call is never held off by a tick or a pending switch.
pub const SVCALL_PRIORITY: u8 = 0x00;

/// PendSV and SysTick priority. They share one level so neither can
/// preempt the other, which is what makes the context handoff lock-free.
pub const SWITCH_PRIORITY: u8 = 0x10;
