//! # Kernel
//!
//! Top-level kernel API. A [`Kernel`] owns the hardware bridge, the task
//! entry trampoline and the scheduler behind a critical-section lock. All
//! thread-mode operations go through here.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► KERNEL.init(idle)        ← Create the idle task
//!         ├─► KERNEL.create_task(..)   ← Register tasks (×N)
//!         └─► arch::cortex_m::start()  ← Launch scheduler (no return)
//!               ├─► Configure SysTick
//!               ├─► Set exception priorities
//!               └─► KERNEL.start()      ← svc #0 into the first task
//! ```
//!
//! ## Switch requests
//!
//! An operation that leaves the running task unable or unwilling to run
//! updates the scheduler under the critical section, then, after leaving
//! it, raises the ExecuteContextSwitch supervisor call. The supervisor call
//! is synchronous and faults if raised with interrupts masked, which is why
//! it is never issued from inside the lock.

use crate::arch::HardwareBridge;
use crate::config::{DEFAULT_PREEMPTION, MAX_TASKS};
use crate::error::KernelError;
use crate::scheduler::{Destroyed, Preemption, Scheduler};
use crate::sync::Shared;
use crate::syscall::SyscallId;
use crate::task::{
    EntryPoint, Handle, Priority, Routine, TaskId, TaskOptions, Tick, Timeout, WaitResult,
};

/// The kernel instance.
pub struct Kernel<B: HardwareBridge, const N: usize = MAX_TASKS> {
    bridge: B,
    trampoline: EntryPoint,
    scheduler: Shared<Scheduler<N>>,
}

impl<B: HardwareBridge, const N: usize> Kernel<B, N> {
    /// A kernel using [`DEFAULT_PREEMPTION`]. Every task starts executing
    /// at `trampoline`, which must call [`Kernel::run_current`].
    pub const fn new(bridge: B, trampoline: EntryPoint) -> Self {
        Self::with_preemption(bridge, trampoline, DEFAULT_PREEMPTION)
    }

    pub const fn with_preemption(bridge: B, trampoline: EntryPoint, preemption: Preemption) -> Self {
        Self {
            bridge,
            trampoline,
            scheduler: Shared::new(Scheduler::new(preemption)),
        }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Run `f` on the scheduler inside the critical section.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler<N>) -> R) -> R {
        self.scheduler.lock(f)
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Create the idle task. Must be called once, before [`Kernel::start`].
    pub fn init(&self, idle: Routine) -> Result<TaskId, KernelError> {
        let id = self.with_scheduler(|s| s.create_idle(&self.bridge, self.trampoline, idle))?;
        info!("kernel initialised, idle task {}", id);
        Ok(id)
    }

    /// Create a task. If the kernel is running and the new task outranks the
    /// caller, the caller is preempted before this returns.
    pub fn create_task(&self, routine: Routine, options: TaskOptions) -> Result<TaskId, KernelError> {
        let (id, preempt) = self.with_scheduler(|s| {
            let id = s.create(&self.bridge, self.trampoline, routine, options)?;
            Ok::<_, KernelError>((id, s.is_started() && s.switch_due()))
        })?;
        if preempt {
            self.request_switch();
        }
        Ok(id)
    }

    /// Dispatch the first task.
    ///
    /// On the target this does not return once it succeeds: the calling
    /// context is abandoned for the first task.
    pub fn start(&self) -> Result<(), KernelError> {
        self.with_scheduler(|s| s.check_can_start())?;
        info!("starting scheduler");
        self.bridge.raise_supervisor_call(SyscallId::LoadNextTask);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Running task
    // -----------------------------------------------------------------------

    /// Let another Ready task of the same priority run.
    pub fn yield_now(&self) -> Result<(), KernelError> {
        self.with_scheduler(|s| s.yield_now())?;
        self.request_switch();
        Ok(())
    }

    /// Block the calling task for `interval` ticks.
    pub fn sleep(&self, interval: Tick) -> Result<(), KernelError> {
        self.with_scheduler(|s| s.sleep(interval))?;
        self.request_switch();
        Ok(())
    }

    /// Block the calling task until `source` is signalled or `timeout`
    /// elapses.
    ///
    /// Fails with [`KernelError::WaitAbandoned`] if the wait ended without
    /// either, which happens when the task is suspended while waiting.
    pub fn wait_for_object(&self, source: Handle, timeout: Timeout) -> Result<WaitResult, KernelError> {
        let id = self.with_scheduler(|s| {
            s.wait_for_object(source, timeout)?;
            s.running().ok_or(KernelError::NotStarted)
        })?;
        self.request_switch();
        self.with_scheduler(|s| s.take_wait_result(id))
            .ok_or(KernelError::WaitAbandoned)
    }

    /// Terminate the calling task.
    pub fn exit(&self) -> ! {
        if let Some(id) = self.current() {
            if let Err(e) = self.with_scheduler(|s| s.destroy(id)) {
                error!("{} cannot exit: {}", id, e);
            }
        }
        loop {
            // A Dormant task is never selected again, so the first switch
            // does not come back.
            self.request_switch();
        }
    }

    /// Body of the task entry trampoline: run the current task's routine,
    /// then terminate the task when it returns.
    pub fn run_current(&self) -> ! {
        self.call_current();
        self.exit()
    }

    fn call_current(&self) {
        if let Some((routine, parameter)) = self.with_scheduler(|s| s.running_entry()) {
            routine(parameter);
        }
    }

    // -----------------------------------------------------------------------
    // Other tasks
    // -----------------------------------------------------------------------

    /// Wake every task waiting for `source`. Returns how many were woken.
    ///
    /// Thread mode only. An interrupt handler must not call this, as it
    /// could land between a published switch and the switch itself.
    pub fn signal(&self, source: Handle) -> usize {
        let (woken, preempt) = self.with_scheduler(|s| (s.signal(source), s.switch_due()));
        if preempt {
            self.request_switch();
        }
        woken
    }

    /// Take a task out of scheduling until [`Kernel::resume`].
    pub fn suspend(&self, id: TaskId) -> Result<(), KernelError> {
        if self.with_scheduler(|s| s.suspend(id))? {
            self.request_switch();
        }
        Ok(())
    }

    pub fn resume(&self, id: TaskId) -> Result<(), KernelError> {
        if self.with_scheduler(|s| s.resume(id))? {
            self.request_switch();
        }
        Ok(())
    }

    pub fn set_priority(&self, id: TaskId, priority: Priority) -> Result<(), KernelError> {
        if self.with_scheduler(|s| s.set_priority(id, priority))? {
            self.request_switch();
        }
        Ok(())
    }

    /// Destroy a task. Destroying the calling task does not return on the
    /// target.
    pub fn destroy(&self, id: TaskId) -> Result<(), KernelError> {
        if self.with_scheduler(|s| s.destroy(id))? == Destroyed::Deferred {
            self.request_switch();
        }
        Ok(())
    }

    /// Current tick count.
    pub fn now(&self) -> Tick {
        self.with_scheduler(|s| s.now())
    }

    /// The calling task, once started.
    pub fn current(&self) -> Option<TaskId> {
        self.with_scheduler(|s| s.running())
    }

    // -----------------------------------------------------------------------
    // Platform hooks
    // -----------------------------------------------------------------------

    /// Timer interrupt hook.
    pub fn on_tick(&self) {
        if self.with_scheduler(|s| s.tick(&self.bridge)) {
            self.bridge.trigger_deferred_switch();
        }
    }

    fn request_switch(&self) {
        self.bridge
            .raise_supervisor_call(SyscallId::ExecuteContextSwitch);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::vec;

    use super::*;
    use crate::arch::mock::{trampoline, MockBridge};
    use crate::syscall::{self, SyscallOutcome};
    use crate::task::TaskState;

    fn work(_: usize) {}
    fn idle(_: usize) {}

    fn kernel() -> Kernel<MockBridge, 6> {
        Kernel::with_preemption(MockBridge::new(), trampoline, Preemption::Priority)
    }

    /// Play the hardware: execute every supervisor call raised so far, then
    /// any deferred switch they armed.
    fn service(kernel: &Kernel<MockBridge, 6>) {
        for id in kernel.bridge().take_syscalls() {
            if syscall::dispatch(kernel, id.number()) == SyscallOutcome::RestoreNext {
                kernel.bridge().restore_next();
            }
            kernel.bridge().complete_switch();
        }
    }

    fn tick(kernel: &Kernel<MockBridge, 6>) {
        kernel.on_tick();
        kernel.bridge().complete_switch();
    }

    fn state(kernel: &Kernel<MockBridge, 6>, id: TaskId) -> TaskState {
        kernel.with_scheduler(|s| s.tasks().state(id))
    }

    #[test]
    fn test_init_once() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        assert_eq!(kernel.init(idle), Err(KernelError::IdleTask));
    }

    #[test]
    fn test_start() {
        let kernel = kernel();
        assert_eq!(kernel.start(), Err(KernelError::NoRunnableTask));
        assert!(kernel.bridge().take_syscalls().is_empty());

        let idle_id = kernel.init(idle).unwrap();
        let task = kernel.create_task(work, TaskOptions::default()).unwrap();
        // Not started: nothing to preempt
        assert!(kernel.bridge().take_syscalls().is_empty());

        kernel.start().unwrap();
        assert_eq!(kernel.bridge().take_syscalls(), vec![SyscallId::LoadNextTask]);
        syscall::dispatch(&kernel, SyscallId::LoadNextTask.number());
        kernel.bridge().restore_next();
        assert_eq!(kernel.current(), Some(task));
        assert_eq!(state(&kernel, idle_id), TaskState::Ready);
        assert_eq!(kernel.start(), Err(KernelError::AlreadyStarted));
    }

    #[test]
    fn test_yield_round_robin() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        let a = kernel.create_task(work, TaskOptions::default()).unwrap();
        let b = kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        assert_eq!(kernel.current(), Some(a));
        kernel.yield_now().unwrap();
        assert_eq!(
            kernel.bridge().take_syscalls(),
            vec![SyscallId::ExecuteContextSwitch]
        );
        syscall::dispatch(&kernel, SyscallId::ExecuteContextSwitch.number());
        assert!(kernel.bridge().complete_switch());
        assert_eq!(kernel.current(), Some(b));

        kernel.yield_now().unwrap();
        service(&kernel);
        assert_eq!(kernel.current(), Some(a));
    }

    #[test]
    fn test_sleep_and_tick() {
        let kernel = kernel();
        let idle_id = kernel.init(idle).unwrap();
        let task = kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        kernel.sleep(3).unwrap();
        service(&kernel);
        assert_eq!(kernel.current(), Some(idle_id));

        tick(&kernel);
        tick(&kernel);
        assert_eq!(kernel.current(), Some(idle_id));
        tick(&kernel);
        assert_eq!(kernel.now(), 3);
        assert_eq!(kernel.current(), Some(task));
        assert_eq!(kernel.bridge().switches(), 2);
    }

    #[test]
    fn test_idle_task_cannot_block() {
        let kernel = kernel();
        let idle_id = kernel.init(idle).unwrap();
        kernel.start().unwrap();
        service(&kernel);
        assert_eq!(kernel.current(), Some(idle_id));
        assert_eq!(kernel.sleep(1), Err(KernelError::IdleTask));
        assert_eq!(
            kernel.wait_for_object(Handle(1), Timeout::Forever),
            Err(KernelError::IdleTask)
        );
        assert_eq!(kernel.destroy(idle_id), Err(KernelError::IdleTask));
        assert!(kernel.bridge().take_syscalls().is_empty());
    }

    #[test]
    fn test_blocking_before_start() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        assert_eq!(kernel.sleep(1), Err(KernelError::NotStarted));
        assert_eq!(kernel.yield_now(), Err(KernelError::NotStarted));
        assert_eq!(
            kernel.wait_for_object(Handle(1), Timeout::After(1)),
            Err(KernelError::NotStarted)
        );
        assert!(kernel.bridge().take_syscalls().is_empty());
    }

    #[test]
    fn test_creating_higher_priority_task_preempts() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        kernel
            .create_task(work, TaskOptions::with_priority(Priority::Low))
            .unwrap();
        assert!(kernel.bridge().take_syscalls().is_empty());

        let urgent = kernel
            .create_task(work, TaskOptions::with_priority(Priority::Critical))
            .unwrap();
        service(&kernel);
        assert_eq!(kernel.current(), Some(urgent));
    }

    #[test]
    fn test_signal_preempts_for_urgent_waiter() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        let waiter = kernel
            .create_task(work, TaskOptions::with_priority(Priority::High))
            .unwrap();
        let signaller = kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        // The mock does not block, so the call comes straight back with
        // the wait still pending.
        assert_eq!(
            kernel.wait_for_object(Handle(3), Timeout::Forever),
            Err(KernelError::WaitAbandoned)
        );
        service(&kernel);
        assert_eq!(kernel.current(), Some(signaller));
        assert_eq!(state(&kernel, waiter), TaskState::Waiting);

        assert_eq!(kernel.signal(Handle(4)), 0);
        assert!(kernel.bridge().take_syscalls().is_empty());
        assert_eq!(kernel.signal(Handle(3)), 1);
        service(&kernel);
        assert_eq!(kernel.current(), Some(waiter));
        assert_eq!(
            kernel.with_scheduler(|s| s.take_wait_result(waiter)),
            Some(WaitResult::ObjSignaled)
        );
    }

    #[test]
    fn test_suspend_resume() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        let a = kernel
            .create_task(work, TaskOptions::with_priority(Priority::High))
            .unwrap();
        let b = kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        kernel.suspend(a).unwrap();
        service(&kernel);
        assert_eq!(kernel.current(), Some(b));

        kernel.resume(a).unwrap();
        assert_eq!(
            kernel.bridge().take_syscalls(),
            vec![SyscallId::ExecuteContextSwitch]
        );
        syscall::dispatch(&kernel, SyscallId::ExecuteContextSwitch.number());
        kernel.bridge().complete_switch();
        assert_eq!(kernel.current(), Some(a));
        assert!(kernel.resume(a).is_err());
    }

    #[test]
    fn test_destroy() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        let a = kernel.create_task(work, TaskOptions::default()).unwrap();
        let b = kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        kernel.destroy(b).unwrap();
        assert!(kernel.bridge().take_syscalls().is_empty());
        assert_eq!(kernel.destroy(b), Err(KernelError::InvalidId(b)));

        kernel.destroy(a).unwrap();
        assert_eq!(state(&kernel, a), TaskState::Dormant);
        service(&kernel);
        assert_ne!(kernel.current(), Some(a));
        tick(&kernel);
        assert!(!kernel.with_scheduler(|s| s.tasks().is_allocated(a)));
    }

    #[test]
    fn test_set_priority() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        kernel.create_task(work, TaskOptions::default()).unwrap();
        let b = kernel.create_task(work, TaskOptions::default()).unwrap();
        kernel.start().unwrap();
        service(&kernel);

        kernel.set_priority(b, Priority::High).unwrap();
        service(&kernel);
        assert_eq!(kernel.current(), Some(b));
    }

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn record(parameter: usize) {
        SEEN.store(parameter, Ordering::SeqCst);
    }

    #[test]
    fn test_routine_gets_parameter() {
        let kernel = kernel();
        kernel.init(idle).unwrap();
        kernel
            .create_task(
                record,
                TaskOptions {
                    parameter: 0x5A5A,
                    ..TaskOptions::default()
                },
            )
            .unwrap();
        kernel.start().unwrap();
        service(&kernel);

        kernel.call_current();
        assert_eq!(SEEN.load(Ordering::SeqCst), 0x5A5A);
    }
}
