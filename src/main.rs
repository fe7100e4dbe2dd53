//! # rtcore Example Firmware
//!
//! Exercises the scheduler with five tasks on an STM32F103:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `heartbeat` | High | Sleeps 500 ticks, then does a short burst |
//! | `worker` ×2 | Medium | Never block; share the CPU round-robin |
//! | `consumer` | Low | Waits on `DATA_READY` with a 100-tick timeout |
//! | `producer` | Low | Signals `DATA_READY` every 250 ticks |
//!
//! ## Expected Behavior
//!
//! 1. `heartbeat` preempts whatever runs whenever its sleep ends.
//! 2. The two workers alternate on every tick.
//! 3. The Low tasks only run if the workers are suspended; `heartbeat`
//!    suspends and resumes them in turn so that the waiter sees both
//!    signals and timeouts.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use rtcore::arch::cortex_m as port;
use rtcore::{Handle, Priority, TaskId, TaskOptions, Timeout, WaitResult, KERNEL};

const DATA_READY: Handle = Handle(1);

/// Slot indices of the two workers, once created.
static WORKERS: [AtomicUsize; 2] = [AtomicUsize::new(usize::MAX), AtomicUsize::new(usize::MAX)];

/// Wait outcomes seen by `consumer`, for inspection in a debugger.
static RECEIVED: AtomicU32 = AtomicU32::new(0);
static MISSED: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Task routines
// ---------------------------------------------------------------------------

/// Wakes twice a second and flips the workers between running and
/// suspended.
fn heartbeat(_: usize) {
    let mut beats: u32 = 0;
    loop {
        let _ = KERNEL.sleep(500);
        beats = beats.wrapping_add(1);
        for worker in WORKERS.iter() {
            let index = worker.load(Ordering::Relaxed);
            let Some(id) = worker_id(index) else {
                continue;
            };
            let _ = if beats % 2 == 1 {
                KERNEL.suspend(id)
            } else {
                KERNEL.resume(id)
            };
        }
    }
}

/// CPU-bound; only preemption takes it off the CPU.
fn worker(parameter: usize) {
    let mut counter = parameter;
    loop {
        counter = counter.wrapping_add(1);
    }
}

fn consumer(_: usize) {
    loop {
        let counter = match KERNEL.wait_for_object(DATA_READY, Timeout::After(100)) {
            Ok(WaitResult::ObjSignaled) => &RECEIVED,
            Ok(WaitResult::Timedout) => &MISSED,
            Err(_) => continue,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn producer(_: usize) {
    loop {
        let _ = KERNEL.sleep(250);
        KERNEL.signal(DATA_READY);
    }
}

fn worker_id(index: usize) -> Option<TaskId> {
    KERNEL.with_scheduler(|s| s.tasks().ids().find(|id| id.index() == index))
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let Some(peripherals) = cortex_m::Peripherals::take() else {
        panic!("core peripherals already taken");
    };

    if KERNEL.init(port::idle).is_err() {
        panic!("failed to create the idle task");
    }

    let tasks: [(fn(usize), Priority, usize); 5] = [
        (heartbeat, Priority::High, 0),
        (worker, Priority::Medium, 0),
        (worker, Priority::Medium, 1000),
        (consumer, Priority::Low, 0),
        (producer, Priority::Low, 0),
    ];
    let mut workers = 0;
    for (routine, priority, parameter) in tasks {
        let options = TaskOptions {
            priority,
            parameter,
            ..TaskOptions::default()
        };
        let Ok(id) = KERNEL.create_task(routine, options) else {
            panic!("failed to create task");
        };
        if priority == Priority::Medium {
            WORKERS[workers].store(id.index(), Ordering::Relaxed);
            workers += 1;
        }
    }

    // Does not return
    port::start(peripherals)
}
