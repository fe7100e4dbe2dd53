//! # Scheduler
//!
//! Tick-driven, priority-based preemptive scheduler over the [`TaskStore`].
//!
//! ## Tick Algorithm
//!
//! At each SysTick interrupt:
//! 1. **Reclaim**: free the slot of a task that destroyed itself, now that
//!    the switch away from it has happened
//! 2. **Count**: increment the tick counter (wrapping)
//! 3. **Timeouts**: every Waiting task whose interval has elapsed becomes
//!    Ready with [`WaitResult::Timedout`]
//! 4. **Time slice**: under [`Preemption::RoundRobin`], account the tick to
//!    the running task and rotate among equal priorities once the slice is
//!    used up
//! 5. **Decide**: if the running task is no longer the one to run, publish
//!    both contexts and tell the caller to arm the deferred switch
//!
//! ## Selection
//!
//! The most urgent level holding a Ready (or the Running) task wins. Within
//! that level tasks are taken round-robin, starting after the task last
//! dispatched from the level, so no task of a level is starved by a lower
//! id. The idle task keeps the Idle level populated, so there is always a
//! candidate once the kernel is initialised.
//!
//! The scheduler never blocks and every operation is O(capacity). It is
//! only touched under the critical section or from the tick and switch
//! interrupts, which share a priority level.

use crate::arch::HardwareBridge;
use crate::config::MAX_TASKS;
use crate::error::KernelError;
use crate::task::{
    EntryPoint, Handle, Priority, Routine, TaskId, TaskOptions, TaskState, TaskStore, Tick,
    Timeout, WaitConditions, WaitResult,
};

/// When a running task loses the CPU to another Ready task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Preemption {
    /// Only a strictly more urgent task preempts. Equal priorities take
    /// turns only when the running task yields or blocks.
    Priority,
    /// As `Priority`, and additionally rotate among Ready tasks of the
    /// running task's priority every `slice` ticks.
    RoundRobin { slice: u32 },
}

/// How [`Scheduler::destroy`] disposed of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Destroyed {
    /// The slot was freed.
    Immediately,
    /// The task was running. It is now Dormant and its slot is freed after
    /// the next context switch, which the caller must request.
    Deferred,
}

/// The central scheduler state.
pub struct Scheduler<const N: usize = MAX_TASKS> {
    /// All tasks, by id.
    tasks: TaskStore<N>,

    /// Monotonic tick counter. Wraps at `Tick::MAX`.
    ticks: Tick,

    /// The task marked Running. `None` until the first task is loaded.
    running: Option<TaskId>,

    /// Last task dispatched from each priority level.
    rotation: [Option<TaskId>; Priority::LEVELS],

    /// Ticks the running task has used of its slice.
    slice_used: u32,

    preemption: Preemption,

    /// The always-Ready task at the Idle level.
    idle: Option<TaskId>,

    /// A Dormant task waiting for its slot to be freed.
    reclaim: Option<TaskId>,
}

impl<const N: usize> Scheduler<N> {
    /// Create a scheduler with no tasks.
    pub const fn new(preemption: Preemption) -> Self {
        Self {
            tasks: TaskStore::new(),
            ticks: 0,
            running: None,
            rotation: [None; Priority::LEVELS],
            slice_used: 0,
            preemption,
            idle: None,
            reclaim: None,
        }
    }

    /// The task store, for inspection.
    pub fn tasks(&self) -> &TaskStore<N> {
        &self.tasks
    }

    /// Current tick count.
    pub fn now(&self) -> Tick {
        self.ticks
    }

    /// The task marked Running.
    pub fn running(&self) -> Option<TaskId> {
        self.running
    }

    /// Has the first task been loaded?
    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// The idle task, once created.
    pub fn idle(&self) -> Option<TaskId> {
        self.idle
    }

    pub fn preemption(&self) -> Preemption {
        self.preemption
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    /// Create a task. See [`TaskStore::create`].
    pub fn create<B: HardwareBridge>(
        &mut self,
        bridge: &B,
        trampoline: EntryPoint,
        routine: Routine,
        options: TaskOptions,
    ) -> Result<TaskId, KernelError> {
        self.reclaim_dormant();
        self.tasks.create(bridge, trampoline, routine, options)
    }

    /// Create the idle task. Only one may exist.
    pub fn create_idle<B: HardwareBridge>(
        &mut self,
        bridge: &B,
        trampoline: EntryPoint,
        routine: Routine,
    ) -> Result<TaskId, KernelError> {
        if self.idle.is_some() {
            return Err(KernelError::IdleTask);
        }
        let id = self.create(
            bridge,
            trampoline,
            routine,
            TaskOptions::with_priority(Priority::Idle),
        )?;
        self.idle = Some(id);
        Ok(id)
    }

    /// Destroy a task.
    ///
    /// Any task but the running one is freed on the spot. The running task
    /// cannot lose its slot while its registers are still live, so it is
    /// marked Dormant and reclaimed at the first scheduler entry after the
    /// switch away from it.
    pub fn destroy(&mut self, id: TaskId) -> Result<Destroyed, KernelError> {
        self.reclaim_dormant();
        self.check_live(id)?;
        if self.idle == Some(id) {
            return Err(KernelError::IdleTask);
        }
        let state = self.tasks.state(id);
        if state == TaskState::Dormant {
            return Err(KernelError::InvalidState { id, state });
        }

        if self.running == Some(id) {
            self.tasks.set_state(id, TaskState::Dormant);
            *self.tasks.wait_conditions_mut(id) = None;
            self.reclaim = Some(id);
            debug!("{} destroyed itself, reclaim deferred", id);
            Ok(Destroyed::Deferred)
        } else {
            self.tasks.destroy(id);
            debug!("destroyed {}", id);
            Ok(Destroyed::Immediately)
        }
    }

    /// Take a task out of scheduling. A Waiting task abandons its wait.
    ///
    /// Returns `true` if the running task suspended itself, in which case
    /// the caller must request a switch.
    pub fn suspend(&mut self, id: TaskId) -> Result<bool, KernelError> {
        self.check_live(id)?;
        if self.idle == Some(id) {
            return Err(KernelError::IdleTask);
        }
        match self.tasks.state(id) {
            state @ (TaskState::Ready | TaskState::Running | TaskState::Waiting) => {
                self.tasks.set_state(id, TaskState::Suspended);
                *self.tasks.wait_conditions_mut(id) = None;
                debug!("suspended {}", id);
                Ok(state == TaskState::Running)
            }
            TaskState::Suspended => Ok(false),
            state @ TaskState::Dormant => Err(KernelError::InvalidState { id, state }),
        }
    }

    /// Make a Suspended task Ready again.
    ///
    /// Returns whether a switch is now due.
    pub fn resume(&mut self, id: TaskId) -> Result<bool, KernelError> {
        self.check_live(id)?;
        let state = self.tasks.state(id);
        if state != TaskState::Suspended {
            return Err(KernelError::InvalidState { id, state });
        }
        self.tasks.set_state(id, TaskState::Ready);
        debug!("resumed {}", id);
        Ok(self.switch_due())
    }

    /// Change a task's priority.
    ///
    /// Returns whether a switch is now due.
    pub fn set_priority(&mut self, id: TaskId, priority: Priority) -> Result<bool, KernelError> {
        self.check_live(id)?;
        if self.idle == Some(id) {
            return Err(KernelError::IdleTask);
        }
        self.tasks.set_priority(id, priority);
        Ok(self.switch_due())
    }

    /// Routine and parameter of the running task, for the entry trampoline.
    pub fn running_entry(&self) -> Option<(Routine, usize)> {
        let id = self.running?;
        Some((self.tasks.routine(id)?, self.tasks.parameter(id)))
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Give up the CPU. The running task stays Ready; the caller must
    /// request a switch.
    pub fn yield_now(&mut self) -> Result<(), KernelError> {
        let id = self.running.ok_or(KernelError::NotStarted)?;
        if self.tasks.state(id) == TaskState::Running {
            self.tasks.set_state(id, TaskState::Ready);
        }
        Ok(())
    }

    /// Block the running task for `interval` ticks. It becomes Ready with
    /// [`WaitResult::Timedout`] on the first tick at least `interval` ticks
    /// from now. The caller must request a switch.
    pub fn sleep(&mut self, interval: Tick) -> Result<(), KernelError> {
        let id = self.running.ok_or(KernelError::NotStarted)?;
        let start = self.ticks;
        self.block(id, WaitConditions::Sleep { interval, start })
    }

    /// Block the running task until `source` is signalled or `timeout`
    /// elapses. The caller must request a switch.
    pub fn wait_for_object(&mut self, source: Handle, timeout: Timeout) -> Result<(), KernelError> {
        let id = self.running.ok_or(KernelError::NotStarted)?;
        let start = self.ticks;
        self.block(
            id,
            WaitConditions::WaitForObject {
                source,
                timeout,
                start,
            },
        )
    }

    /// Wake every task waiting for `source` with
    /// [`WaitResult::ObjSignaled`]. Returns how many were woken.
    pub fn signal(&mut self, source: Handle) -> usize {
        let mut woken = 0;
        for index in 0..N {
            let id = TaskId::from_index(index);
            if !self.tasks.is_allocated(id) {
                continue;
            }
            let waiting = self
                .tasks
                .wait_conditions(id)
                .is_some_and(|wait| wait.source() == Some(source));
            if waiting && self.finish_wait(id, WaitResult::ObjSignaled) {
                woken += 1;
            }
        }
        woken
    }

    /// Collect how the task's last wait ended.
    pub fn take_wait_result(&mut self, id: TaskId) -> Option<WaitResult> {
        let result = self.tasks.wait_result(id);
        self.tasks.set_wait_result(id, None);
        result
    }

    fn block(&mut self, id: TaskId, wait: WaitConditions) -> Result<(), KernelError> {
        if self.idle == Some(id) {
            return Err(KernelError::IdleTask);
        }
        let state = self.tasks.state(id);
        if state != TaskState::Running {
            return Err(KernelError::InvalidState { id, state });
        }
        self.tasks.set_state(id, TaskState::Waiting);
        *self.tasks.wait_conditions_mut(id) = Some(wait);
        self.tasks.set_wait_result(id, None);
        trace!("{} waiting", id);
        Ok(())
    }

    /// End a wait with `result`. The signal and timeout paths both come
    /// through here; whichever arrives first takes the wait record, and the
    /// other finds nothing to do.
    fn finish_wait(&mut self, id: TaskId, result: WaitResult) -> bool {
        if self.tasks.state(id) != TaskState::Waiting {
            return false;
        }
        if self.tasks.wait_conditions_mut(id).take().is_none() {
            return false;
        }
        self.tasks.set_state(id, TaskState::Ready);
        self.tasks.set_wait_result(id, Some(result));
        trace!("{} ready: {}", id, result);
        true
    }

    // -----------------------------------------------------------------------
    // Tick and switch decisions
    // -----------------------------------------------------------------------

    /// Scheduler tick, called from the timer interrupt.
    ///
    /// Returns `true` if it published a switch, in which case the caller
    /// must arm the deferred switch interrupt.
    pub fn tick<B: HardwareBridge>(&mut self, bridge: &B) -> bool {
        self.reclaim_dormant();
        self.ticks = self.ticks.wrapping_add(1);
        if self.running.is_none() {
            return false;
        }

        self.expire_waits();
        let rotate = self.slice_expired();
        if self.is_switch_due(rotate) {
            self.dispatch(bridge, rotate)
        } else {
            if rotate {
                // Nobody to rotate to, start a fresh slice
                self.slice_used = 0;
            }
            false
        }
    }

    /// Is the running task no longer the one that should run?
    pub fn switch_due(&self) -> bool {
        self.is_switch_due(false)
    }

    /// Pick the next task and publish the switch to it, if it is not the
    /// running task. Returns `true` if a switch was published and the
    /// deferred switch interrupt must be armed.
    pub fn switch_context<B: HardwareBridge>(&mut self, bridge: &B) -> bool {
        self.reclaim_dormant();
        self.dispatch(bridge, false)
    }

    /// Mark the first task Running and publish its context for the
    /// load-next-task trap.
    pub fn load_next_task<B: HardwareBridge>(&mut self, bridge: &B) -> Result<TaskId, KernelError> {
        self.check_can_start()?;
        let id = self.select(false).ok_or(KernelError::NoRunnableTask)?;
        self.make_running(id);
        bridge.publish_next_context(self.tasks.context(id));
        info!("scheduler started with {}", id);
        Ok(id)
    }

    /// Could [`Scheduler::load_next_task`] succeed?
    pub fn check_can_start(&self) -> Result<(), KernelError> {
        if self.running.is_some() {
            return Err(KernelError::AlreadyStarted);
        }
        if self.select(false).is_none() {
            return Err(KernelError::NoRunnableTask);
        }
        Ok(())
    }

    /// The task that should run next.
    ///
    /// Without `rotate`, the running task keeps the CPU against tasks of its
    /// own priority. With it, the next task of that priority in round-robin
    /// order is picked, which may be the running task again if it is alone.
    pub fn select(&self, rotate: bool) -> Option<TaskId> {
        let best = self
            .tasks
            .ids()
            .filter(|&id| self.is_candidate(id))
            .map(|id| self.tasks.priority(id))
            .min()?;

        if !rotate {
            if let Some(running) = self.running {
                if self.tasks.state(running) == TaskState::Running
                    && self.tasks.priority(running) == best
                {
                    return Some(running);
                }
            }
        }

        let after = self.rotation[best.level()].map_or(N - 1, TaskId::index);
        (1..=N)
            .map(|offset| TaskId::from_index((after + offset) % N))
            .find(|&id| {
                self.tasks.is_allocated(id)
                    && self.is_candidate(id)
                    && self.tasks.priority(id) == best
            })
    }

    fn is_candidate(&self, id: TaskId) -> bool {
        matches!(
            self.tasks.state(id),
            TaskState::Ready | TaskState::Running
        )
    }

    fn is_switch_due(&self, rotate: bool) -> bool {
        let Some(running) = self.running else {
            return false;
        };
        match self.select(rotate) {
            Some(next) => next != running || self.tasks.state(running) != TaskState::Running,
            None => false,
        }
    }

    fn slice_expired(&mut self) -> bool {
        match self.preemption {
            Preemption::Priority => false,
            Preemption::RoundRobin { slice } => {
                self.slice_used = self.slice_used.saturating_add(1);
                self.slice_used >= slice
            }
        }
    }

    fn expire_waits(&mut self) {
        let now = self.ticks;
        for index in 0..N {
            let id = TaskId::from_index(index);
            if !self.tasks.is_allocated(id) {
                continue;
            }
            let expired = self
                .tasks
                .wait_conditions(id)
                .is_some_and(|wait| wait.has_expired(now));
            if expired {
                self.finish_wait(id, WaitResult::Timedout);
            }
        }
    }

    /// Move the Running mark to the selected task and, if that is a
    /// different task, publish outgoing and incoming contexts.
    fn dispatch<B: HardwareBridge>(&mut self, bridge: &B, rotate: bool) -> bool {
        let Some(outgoing) = self.running else {
            return false;
        };
        let Some(incoming) = self.select(rotate) else {
            // Interrupt level: nothing to report to, and nothing to run.
            panic!("no runnable task, the idle task is missing");
        };

        if self.tasks.state(outgoing) == TaskState::Running {
            self.tasks.set_state(outgoing, TaskState::Ready);
        }
        self.make_running(incoming);
        if incoming == outgoing {
            return false;
        }

        trace!("switch {} -> {}", outgoing, incoming);
        bridge.publish_current_context(self.tasks.context(outgoing));
        bridge.publish_next_context(self.tasks.context(incoming));
        true
    }

    fn make_running(&mut self, id: TaskId) {
        self.tasks.set_state(id, TaskState::Running);
        self.rotation[self.tasks.priority(id).level()] = Some(id);
        self.running = Some(id);
        self.slice_used = 0;
    }

    /// Free the slot of a task that destroyed itself. Every scheduler entry
    /// after the switch away from it runs once the switch handler is done
    /// with its context, because the tick and the switch share a priority
    /// level and the supervisor call is only raised from thread mode.
    fn reclaim_dormant(&mut self) {
        if let Some(id) = self.reclaim {
            if self.running != Some(id) {
                self.tasks.destroy(id);
                self.reclaim = None;
                debug!("reclaimed {}", id);
            }
        }
    }

    fn check_live(&self, id: TaskId) -> Result<(), KernelError> {
        if self.tasks.is_allocated(id) {
            Ok(())
        } else {
            Err(KernelError::InvalidId(id))
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
