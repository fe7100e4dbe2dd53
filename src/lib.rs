//! # rtcore
//!
//! A small preemptive real-time kernel core for single-core ARM Cortex-M
//! microcontrollers.
//!
//! ## Overview
//!
//! rtcore runs a fixed set of statically allocated tasks under a
//! tick-driven, priority-based preemptive scheduler:
//!
//! - **The most urgent Ready task always runs**; equal priorities share the
//!   CPU round-robin
//! - **Tasks block** by sleeping for a number of ticks or waiting on an
//!   opaque handle, with an optional timeout
//! - **Context switches are two-phase**: kernel code decides under a
//!   critical section, an exception handler moves the registers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├─────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init · create_task · start · sleep · wait · signal    │
//! ├───────────────────────┬──────────────────┬──────────────┤
//! │  Scheduler            │  Syscalls        │  Sync        │
//! │  scheduler.rs         │  syscall.rs      │  sync.rs     │
//! │  ─ tick()             │  ─ LoadNextTask  │  ─ Shared<T> │
//! │  ─ select()           │  ─ ExecuteCon-   │              │
//! │  ─ switch_context()   │    textSwitch    │              │
//! ├───────────────────────┴──────────────────┴──────────────┤
//! │           Task Store (task.rs) · Slot Pool (pool.rs)    │
//! │      TaskId · Priority · TaskState · WaitConditions     │
//! ├─────────────────────────────────────────────────────────┤
//! │         Hardware Bridge (arch/mod.rs, arch/frame.rs)    │
//! │        TaskContext · HandoffCell · exception frame      │
//! ├─────────────────────────────────────────────────────────┤
//! │              Cortex-M Port (arch/cortex_m.rs)           │
//! │           SVCall · PendSV · SysTick · priorities        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: all state is statically allocated
//! - **Fixed-size task pool**: [`config::MAX_TASKS`] slots, each with an
//!   inline stack of [`config::TASK_STACK_WORDS`] words
//! - **Critical sections**: `critical_section::with`, nesting and
//!   PRIMASK-preserving on Cortex-M
//!
//! Everything above the Cortex-M port is target independent and is unit
//! tested on the host against a fake bridge.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod fmt;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod pool;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod task;

pub use error::KernelError;
pub use kernel::Kernel;
pub use task::{Handle, Priority, TaskId, TaskOptions, TaskState, Timeout, WaitResult};

/// The process-wide kernel instance, driven by the Cortex-M exception
/// handlers.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub static KERNEL: Kernel<arch::cortex_m::CortexM> =
    Kernel::new(arch::cortex_m::CortexM, arch::cortex_m::task_entry);
