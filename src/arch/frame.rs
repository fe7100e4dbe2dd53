//! Task stacks and the synthetic exception frame.

use core::cell::UnsafeCell;

use crate::config::{INITIAL_XPSR, SCRATCH_SENTINEL, TASK_STACK_WORDS};

/// Words in a basic (no FPU) exception frame: R0–R3, R12, LR, PC, xPSR.
pub const FRAME_WORDS: usize = 8;

const _: () = assert!(TASK_STACK_WORDS >= FRAME_WORDS);

/// A task stack of [`TASK_STACK_WORDS`] words.
///
/// Aligned on 8 bytes as required by AAPCS. The contents sit in an
/// `UnsafeCell` because the task writes to its stack through the process
/// stack pointer, behind the kernel's back.
#[repr(C, align(8))]
pub struct Stack {
    words: UnsafeCell<[u32; TASK_STACK_WORDS]>,
}

impl Stack {
    /// A zeroed stack.
    pub const fn new() -> Self {
        Self {
            words: UnsafeCell::new([0; TASK_STACK_WORDS]),
        }
    }

    /// Address of the lowest word.
    pub fn base(&self) -> usize {
        self.words.get() as usize
    }

    /// Address one past the highest word. Nothing is ever written here,
    /// as this is a full-descending stack.
    pub fn top(&self) -> usize {
        self.base() + TASK_STACK_WORDS * core::mem::size_of::<u32>()
    }

    /// The stack contents, lowest address first.
    pub fn words_mut(&mut self) -> &mut [u32; TASK_STACK_WORDS] {
        self.words.get_mut()
    }
}

impl Default for Stack {
    fn default() -> Self {
        Stack::new()
    }
}

/// A helper for pushing words into a full-descending stack.
pub(crate) struct StackPusher<'a> {
    words: &'a mut [u32],
    next: usize,
}

impl<'a> StackPusher<'a> {
    /// Start pushing from the top of `words`.
    pub(crate) fn new(words: &'a mut [u32]) -> Self {
        let next = words.len();
        Self { words, next }
    }

    /// Push a word, moving the stack pointer down.
    pub(crate) fn push(&mut self, value: u32) {
        let Some(next) = self.next.checked_sub(1) else {
            panic!("stack overflow while building a frame");
        };
        self.next = next;
        self.words[next] = value;
    }

    /// Index of the last word pushed.
    pub(crate) fn current(&self) -> usize {
        self.next
    }
}

/// Build the frame an exception return unstacks, so that the first
/// dispatch of a task "returns" straight into `entry`.
///
/// From the top down: xPSR with the Thumb bit, PC = `entry`, LR, R12, then
/// R3 to R0 filled with [`SCRATCH_SENTINEL`]. Returns the address of the R0
/// slot, which is the task's initial process stack pointer.
pub fn write_exception_frame(stack: &mut Stack, entry: u32) -> usize {
    let base = stack.base();
    let mut pusher = StackPusher::new(stack.words_mut());

    // xPSR
    pusher.push(INITIAL_XPSR);
    // PC. Bit 0 marks a Thumb address in a branch target, but a stacked
    // return address must be halfword aligned.
    pusher.push(entry & !1);
    // LR. The entry trampoline never returns.
    pusher.push(0);
    // R12
    pusher.push(0);
    // R3 - R0
    for _ in 0..4 {
        pusher.push(SCRATCH_SENTINEL);
    }

    base + pusher.current() * core::mem::size_of::<u32>()
}
