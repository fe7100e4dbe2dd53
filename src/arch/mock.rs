//! Host-side fake of the hardware bridge.
//!
//! Stands in for the Cortex-M port in unit tests. It keeps a fake CPU
//! register bank and performs the same save-then-restore the deferred
//! switch handler does, so the two-phase switch can be checked end to end.

use core::cell::{Cell, RefCell};
use std::vec::Vec;

use super::{frame, HandoffCell, HardwareBridge, Stack, TaskContext};
use crate::syscall::SyscallId;

/// Entry trampoline for tasks created in tests. Never actually executed.
pub(crate) extern "C" fn trampoline() -> ! {
    panic!("task trampoline invoked on the host");
}

pub(crate) struct MockBridge {
    current: HandoffCell,
    next: HandoffCell,
    cpu: Cell<TaskContext>,
    switch_pending: Cell<bool>,
    switches: Cell<usize>,
    syscalls: RefCell<Vec<SyscallId>>,
}

impl MockBridge {
    pub(crate) fn new() -> Self {
        Self {
            current: HandoffCell::new(),
            next: HandoffCell::new(),
            cpu: Cell::new(TaskContext::EMPTY),
            switch_pending: Cell::new(false),
            switches: Cell::new(0),
            syscalls: RefCell::new(Vec::new()),
        }
    }

    /// What the load-next-task trap does after the kernel has run: restore
    /// the published context into the CPU, saving nothing.
    pub(crate) fn restore_next(&self) {
        let next = self.next.take().expect("no next context published");
        // SAFETY: the kernel published a pointer into a live task slot.
        self.cpu.set(unsafe { next.as_ptr().read() });
    }

    /// Run the deferred switch handler if it is pending: save the CPU into
    /// the current context, then restore the next one. Returns whether a
    /// switch ran.
    pub(crate) fn complete_switch(&self) -> bool {
        if !self.switch_pending.replace(false) {
            return false;
        }
        let current = self.current.take().expect("no current context published");
        let next = self.next.take().expect("no next context published");
        // SAFETY: the kernel published pointers into live task slots and
        // does not touch them until the switch has run.
        unsafe {
            current.as_ptr().write(self.cpu.get());
            self.cpu.set(next.as_ptr().read());
        }
        self.switches.set(self.switches.get() + 1);
        true
    }

    /// The running task clobbers its callee-saved registers.
    pub(crate) fn scribble(&self, value: u32) {
        let mut cpu = self.cpu.get();
        cpu.registers = [value; 8];
        cpu.stack_pointer = cpu.stack_pointer.wrapping_sub(4);
        self.cpu.set(cpu);
    }

    pub(crate) fn cpu(&self) -> TaskContext {
        self.cpu.get()
    }

    pub(crate) fn switch_pending(&self) -> bool {
        self.switch_pending.get()
    }

    pub(crate) fn switches(&self) -> usize {
        self.switches.get()
    }

    pub(crate) fn take_syscalls(&self) -> Vec<SyscallId> {
        self.syscalls.take()
    }
}

impl HardwareBridge for MockBridge {
    fn publish_current_context(&self, context: core::ptr::NonNull<TaskContext>) {
        self.current.publish(context);
    }

    fn publish_next_context(&self, context: core::ptr::NonNull<TaskContext>) {
        self.next.publish(context);
    }

    fn trigger_deferred_switch(&self) {
        self.switch_pending.set(true);
    }

    fn raise_supervisor_call(&self, id: SyscallId) {
        self.syscalls.borrow_mut().push(id);
    }

    fn init_stack(&self, stack: &mut Stack, entry: u32) -> usize {
        frame::write_exception_frame(stack, entry)
    }
}
