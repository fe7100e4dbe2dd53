//! # Task Records
//!
//! Defines the task model and the [`TaskStore`], a slot pool specialised to
//! [`Task`] records with typed, field-level accessors.
//!
//! Ids are handed out by [`TaskStore::create`] only. Every accessor assumes
//! it is given a live id; passing anything else is a kernel bug and panics.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;

use crate::arch::{HardwareBridge, Stack, TaskContext};
use crate::config::MAX_TASKS;
use crate::error::KernelError;
use crate::pool::{SlotPool, Vacant};

/// The kernel's unit of time. Wraps at the platform word width.
pub type Tick = u32;

/// A task's entry routine. Receives the raw parameter given at creation.
pub type Routine = fn(usize);

/// First code a new task executes. Looks up the task's routine and
/// parameter and calls it; never returns.
pub type EntryPoint = extern "C" fn() -> !;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies a task. Only valid while the task's slot is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

impl TaskId {
    /// Slot index of this task.
    pub const fn index(self) -> usize {
        self.0
    }

    pub(crate) const fn from_index(index: usize) -> TaskId {
        TaskId(index)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "T{:03}", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TaskId {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "T{=usize:03}", self.0);
    }
}

/// Opaque handle of an object a task can wait for.
///
/// The kernel only compares handles; what they name (a semaphore, an event
/// flag, a queue) is up to the layer that signals them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle(pub u32);

// ---------------------------------------------------------------------------
// Priority and state
// ---------------------------------------------------------------------------

/// Scheduling priority. Lower value means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    #[default]
    Low = 3,
    /// Reserved for the idle task, which is always Ready.
    Idle = 4,
}

impl Priority {
    /// Number of priority levels.
    pub const LEVELS: usize = Priority::Idle as usize + 1;

    /// Position of this level, `0` being the most urgent.
    pub const fn level(self) -> usize {
        self as usize
    }
}

/// Execution state of a task.
///
/// ```text
///               select                     sleep / wait
///   ┌───────┐ ─────────► ┌─────────┐ ──────────────────► ┌─────────┐
///   │ Ready │            │ Running │                     │ Waiting │
///   └───────┘ ◄───────── └─────────┘                     └─────────┘
///     ▲   ▲   preempt / yield  │ destroy self                 │
///     │   │                    ▼                              │
///     │   │               ┌─────────┐                         │
///     │   │               │ Dormant │ ── reclaimed after      │
///     │   │               └─────────┘    the switch away      │
///     │   └────────── signalled / timed out ──────────────────┘
///     │ resume
///   ┌───────────┐
///   │ Suspended │ ◄── suspend (from Ready, Running or Waiting)
///   └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    /// Eligible to run.
    Ready,
    /// Owns the CPU. At most one task is in this state.
    Running,
    /// Blocked on a sleep or an object, see [`WaitConditions`].
    Waiting,
    /// Taken out of scheduling until resumed.
    Suspended,
    /// Destroyed while running; its slot is reclaimed once the switch away
    /// from it has completed.
    Dormant,
}

// ---------------------------------------------------------------------------
// Wait conditions
// ---------------------------------------------------------------------------

/// How long a wait-for-object may last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Wait until signalled, however long that takes.
    Forever,
    /// Give up after this many ticks.
    After(Tick),
}

/// Why a task is Waiting. Only present while it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitConditions {
    /// Sleeping for `interval` ticks counted from `start`.
    Sleep { interval: Tick, start: Tick },
    /// Waiting for `source` to be signalled.
    WaitForObject {
        source: Handle,
        timeout: Timeout,
        start: Tick,
    },
}

impl WaitConditions {
    /// Has the wait run out of time at tick `now`?
    ///
    /// Uses wrapping arithmetic, so a wait that straddles the tick counter
    /// wrapping still expires on time.
    pub fn has_expired(&self, now: Tick) -> bool {
        let (interval, start) = match *self {
            WaitConditions::Sleep { interval, start } => (interval, start),
            WaitConditions::WaitForObject {
                timeout: Timeout::After(interval),
                start,
                ..
            } => (interval, start),
            WaitConditions::WaitForObject {
                timeout: Timeout::Forever,
                ..
            } => return false,
        };
        now.wrapping_sub(start) >= interval
    }

    /// The object waited for, if any.
    pub fn source(&self) -> Option<Handle> {
        match *self {
            WaitConditions::Sleep { .. } => None,
            WaitConditions::WaitForObject { source, .. } => Some(source),
        }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitResult {
    /// The object was signalled first.
    ObjSignaled,
    /// The interval elapsed first.
    Timedout,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Options for [`TaskStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskOptions {
    /// Scheduling priority.
    pub priority: Priority,
    /// Raw argument handed to the routine.
    pub parameter: usize,
    /// Start in [`TaskState::Suspended`] instead of [`TaskState::Ready`].
    pub suspended: bool,
}

impl TaskOptions {
    /// Default options at the given priority.
    pub const fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            parameter: 0,
            suspended: false,
        }
    }
}

/// One schedulable unit.
///
/// Tasks live in the [`TaskStore`] and never move, so the address of their
/// context can be handed to the switch handler.
pub struct Task {
    /// Saved registers. Written by the switch handler while the task is
    /// switched out, hence the `UnsafeCell`.
    context: UnsafeCell<TaskContext>,
    stack: Stack,
    priority: Priority,
    state: TaskState,
    parameter: usize,
    routine: Option<Routine>,
    wait: Option<WaitConditions>,
    wait_result: Option<WaitResult>,
}

impl Vacant for Task {
    const VACANT: Self = Task {
        context: UnsafeCell::new(TaskContext::EMPTY),
        stack: Stack::new(),
        priority: Priority::Idle,
        state: TaskState::Suspended,
        parameter: 0,
        routine: None,
        wait: None,
        wait_result: None,
    };
}

// ---------------------------------------------------------------------------
// Task store
// ---------------------------------------------------------------------------

/// Fixed-capacity store of [`Task`] records.
pub struct TaskStore<const N: usize = MAX_TASKS> {
    pool: SlotPool<Task, N>,
}

impl<const N: usize> TaskStore<N> {
    /// An empty store.
    pub const fn new() -> Self {
        Self {
            pool: SlotPool::new(),
        }
    }

    /// Create a task.
    ///
    /// `trampoline` is the first code the task executes; it reaches the
    /// user `routine` and its parameter through this store. The new task is
    /// Ready, or Suspended if `options.suspended` is set.
    ///
    /// Fails with [`KernelError::PoolExhausted`] if every slot is in use,
    /// leaving existing tasks untouched.
    pub fn create<B: HardwareBridge>(
        &mut self,
        bridge: &B,
        trampoline: EntryPoint,
        routine: Routine,
        options: TaskOptions,
    ) -> Result<TaskId, KernelError> {
        let index = self
            .pool
            .allocate()
            .map_err(|_| KernelError::PoolExhausted)?;
        let id = TaskId(index);

        let task = self.pool.at_mut(index);
        let stack_pointer = bridge.init_stack(&mut task.stack, trampoline as usize as u32);
        *task.context.get_mut() = TaskContext::new(stack_pointer);
        task.priority = options.priority;
        task.parameter = options.parameter;
        task.routine = Some(routine);
        task.wait = None;
        task.wait_result = None;
        task.state = if options.suspended {
            TaskState::Suspended
        } else {
            TaskState::Ready
        };

        debug!(
            "created {} priority={} state={}",
            id,
            task.priority,
            task.state
        );
        Ok(id)
    }

    /// Free a task's slot. Freeing a dead id does nothing.
    pub fn destroy(&mut self, id: TaskId) {
        self.pool.free(id.0);
    }

    /// Is `id` a live task?
    pub fn is_allocated(&self, id: TaskId) -> bool {
        self.pool.is_allocated(id.0)
    }

    /// All live tasks, in id order.
    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.pool.ids().map(TaskId)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn priority(&self, id: TaskId) -> Priority {
        self.task(id).priority
    }

    pub fn set_priority(&mut self, id: TaskId, priority: Priority) {
        self.task_mut(id).priority = priority;
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        self.task(id).state
    }

    pub fn set_state(&mut self, id: TaskId, state: TaskState) {
        self.task_mut(id).state = state;
    }

    /// Address of the task's saved context, for the switch handler.
    pub fn context(&self, id: TaskId) -> NonNull<TaskContext> {
        // SAFETY: points into a live slot of the pool, never null
        unsafe { NonNull::new_unchecked(self.task(id).context.get()) }
    }

    /// A copy of the task's saved context.
    pub fn saved_context(&self, id: TaskId) -> TaskContext {
        // SAFETY: the switch handler only writes a context while it runs,
        // and kernel code never runs at the same time as the switch.
        unsafe { *self.task(id).context.get() }
    }

    /// Saved process stack pointer.
    pub fn stack_pointer(&self, id: TaskId) -> usize {
        self.saved_context(id).stack_pointer
    }

    pub fn set_stack_pointer(&mut self, id: TaskId, stack_pointer: usize) {
        self.task_mut(id).context.get_mut().stack_pointer = stack_pointer;
    }

    pub fn routine(&self, id: TaskId) -> Option<Routine> {
        self.task(id).routine
    }

    pub fn parameter(&self, id: TaskId) -> usize {
        self.task(id).parameter
    }

    /// What the task waits for. `None` unless it is Waiting.
    pub fn wait_conditions(&self, id: TaskId) -> Option<&WaitConditions> {
        self.task(id).wait.as_ref()
    }

    pub fn wait_conditions_mut(&mut self, id: TaskId) -> &mut Option<WaitConditions> {
        &mut self.task_mut(id).wait
    }

    /// How the task's last wait ended, if it has not been collected yet.
    pub fn wait_result(&self, id: TaskId) -> Option<WaitResult> {
        self.task(id).wait_result
    }

    pub fn set_wait_result(&mut self, id: TaskId, result: Option<WaitResult>) {
        self.task_mut(id).wait_result = result;
    }

    #[track_caller]
    fn task(&self, id: TaskId) -> &Task {
        self.pool.at(id.0)
    }

    #[track_caller]
    fn task_mut(&mut self, id: TaskId) -> &mut Task {
        self.pool.at_mut(id.0)
    }
}

impl<const N: usize> Default for TaskStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
