//! # Cortex-M Port Layer
//!
//! Hardware-specific code for ARMv7-M without an FPU (Cortex-M3 class,
//! such as the STM32F103). Implements the supervisor call handler, the
//! PendSV context switch, the SysTick hook and interrupt priorities.
//!
//! ## Context Switch Mechanism
//!
//! The processor uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. The PendSV handler saves R4–R11 and the PSP into the
//! outgoing task's [`TaskContext`] and reloads them from the incoming one.
//! Both contexts were published by the kernel before PendSV was pended.
//!
//! ## Exception Priorities
//!
//! - SVCall: [`SVCALL_PRIORITY`] (highest), so a trap is taken at once
//! - PendSV and SysTick: [`SWITCH_PRIORITY`], the same level, so neither
//!   can interrupt the other and a switch completes before the next tick

use core::arch::{asm, naked_asm};
use core::mem::offset_of;

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use super::{frame, HandoffCell, HardwareBridge, Stack, TaskContext};
use crate::config::{SVCALL_PRIORITY, SWITCH_PRIORITY, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::syscall::{self, SyscallId, SyscallOutcome};
use crate::KERNEL;

const _: () = assert!(offset_of!(TaskContext, registers) == 0);
const _: () = assert!(offset_of!(TaskContext, stack_pointer) == 32);

/// Context the next switch saves the running task into.
static CURRENT_CONTEXT: HandoffCell = HandoffCell::new();

/// Context the next switch, or the first-task load, restores.
static NEXT_CONTEXT: HandoffCell = HandoffCell::new();

/// The Cortex-M hardware bridge.
pub struct CortexM;

impl HardwareBridge for CortexM {
    fn publish_current_context(&self, context: core::ptr::NonNull<TaskContext>) {
        CURRENT_CONTEXT.publish(context);
    }

    fn publish_next_context(&self, context: core::ptr::NonNull<TaskContext>) {
        NEXT_CONTEXT.publish(context);
    }

    fn trigger_deferred_switch(&self) {
        SCB::set_pendsv();
    }

    fn raise_supervisor_call(&self, id: SyscallId) {
        // Everything the kernel wrote must be visible to the handler
        cortex_m::asm::dmb();
        // SAFETY: the handlers below only touch kernel state and the
        // handoff cells. The immediate must be a literal.
        unsafe {
            match id {
                SyscallId::LoadNextTask => asm!("svc #0"),
                SyscallId::ExecuteContextSwitch => asm!("svc #1"),
            }
        }
    }

    fn init_stack(&self, stack: &mut Stack, entry: u32) -> usize {
        frame::write_exception_frame(stack, entry)
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Configure the tick and exception priorities, then launch the first task.
/// **Does not return.**
///
/// [`KERNEL`] must have been initialised and given its tasks.
pub fn start(mut peripherals: cortex_m::Peripherals) -> ! {
    set_interrupt_priorities(&mut peripherals.SCB);
    configure_systick(&mut peripherals.SYST);

    if let Err(e) = KERNEL.start() {
        error!("cannot start: {}", e);
        panic!("kernel start failed");
    }
    // The first task runs on its own stack; nothing comes back here.
    loop {
        cortex_m::asm::wfi();
    }
}

/// Routine for the idle task: sleep until the next interrupt.
pub fn idle(_: usize) {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Configure SysTick to fire at [`TICK_HZ`] from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// SVCall above everything the kernel uses; PendSV and SysTick together
/// below it.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: called before the first task runs, so no priority-based
    // critical section is in progress.
    unsafe {
        scb.set_priority(SystemHandler::SVCall, SVCALL_PRIORITY);
        scb.set_priority(SystemHandler::PendSV, SWITCH_PRIORITY);
        scb.set_priority(SystemHandler::SysTick, SWITCH_PRIORITY);
    }
}

/// First code of every task.
pub extern "C" fn task_entry() -> ! {
    KERNEL.run_current()
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// SysTick exception handler, the scheduler tick entry point.
#[unsafe(no_mangle)]
pub extern "C" fn SysTick() {
    KERNEL.on_tick();
}

/// SVCall exception handler.
///
/// Finds the stacked exception frame of the caller, hands it to
/// [`svc_dispatch`], and on [`SyscallOutcome::RestoreNext`] exits through
/// [`restore_next_context`] instead of returning to the caller.
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn SVCall() {
    naked_asm!(r#"
    // r0 = the caller's exception frame, on whichever stack it used
    tst     lr, #4
    ite     eq
    mrseq   r0, msp
    mrsne   r0, psp

    // r4 keeps the stack 8-byte aligned
    push    {{ r4, lr }}
    bl      {dispatch}
    pop     {{ r4, lr }}

    cbz     r0, 1f
    b       {restore}

    1:
    bx      lr
    "#,
    dispatch = sym svc_dispatch,
    restore = sym restore_next_context,
    );
}

/// Decode the call number from the `svc` instruction and run the kernel
/// side of the call. Returns 1 if the next context must be restored.
unsafe extern "C" fn svc_dispatch(frame: *const u32) -> u32 {
    // SAFETY: `frame` is the hardware-stacked frame. Word 6 is the return
    // address, just past the 16-bit `svc` instruction whose low byte is the
    // immediate.
    let number = unsafe {
        let pc = frame.add(6).read() as *const u8;
        pc.sub(2).read()
    };
    match syscall::dispatch(&KERNEL, number) {
        SyscallOutcome::RestoreNext => 1,
        SyscallOutcome::Return => 0,
    }
}

/// Load R4–R11 and PSP from the published next context and return to
/// Thread mode on the process stack. Nothing is saved.
#[unsafe(naked)]
unsafe extern "C" fn restore_next_context() {
    naked_asm!(r#"
    ldr     r0, ={next}
    ldr     r1, [r0]

    ldmia   r1, {{ r4 - r11 }}
    ldr     r2, [r1, {sp_offset}]
    msr     psp, r2

    // the context is consumed
    movs    r2, #0
    str     r2, [r0]

    // EXC_RETURN: Thread mode, process stack, no FPU state
    ldr     lr, =0xFFFFFFFD
    bx      lr
    "#,
    next = sym NEXT_CONTEXT,
    sp_offset = const offset_of!(TaskContext, stack_pointer),
    );
}

/// PendSV Handler: the deferred half of a context switch.
///
/// On entry the hardware has stacked R0–R3, R12, LR, PC and xPSR onto the
/// outgoing task's process stack. We store R4–R11 and the PSP into the
/// current context, load them from the next context, clear the handoff
/// cells, and return on the incoming task's process stack.
///
/// It is a naked function because we do not want the compiler pushing
/// anything or re-using registers containing precious task state.
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn PendSV() {
    // NOTE: This code must NOT touch r4-r11 before they are saved. It can
    // only touch r0-r3 and r12, which the hardware stacked on entry.
    naked_asm!(r#"
    cpsid   i

    // r1 = the current context, if any
    ldr     r0, ={current}
    ldr     r1, [r0]
    cbz     r1, 1f

    mrs     r2, psp
    stmia   r1, {{ r4 - r11 }}
    str     r2, [r1, {sp_offset}]
    movs    r2, #0
    str     r2, [r0]

    1:
    // r1 = the next context; without one, resume the same task
    ldr     r0, ={next}
    ldr     r1, [r0]
    cbz     r1, 2f

    ldmia   r1, {{ r4 - r11 }}
    ldr     r2, [r1, {sp_offset}]
    msr     psp, r2
    movs    r2, #0
    str     r2, [r0]

    2:
    ldr     lr, =0xFFFFFFFD
    cpsie   i
    dsb
    isb
    bx      lr
    "#,
    current = sym CURRENT_CONTEXT,
    next = sym NEXT_CONTEXT,
    sp_offset = const offset_of!(TaskContext, stack_pointer),
    );
}
