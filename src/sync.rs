//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. All shared scheduler state
//! must be accessed within a critical section to prevent data races between
//! thread mode and the interrupt handlers.
//!
//! The critical section itself comes from the `critical-section` crate. On
//! the target, `cortex-m` provides the single-core implementation, which
//! saves PRIMASK, masks interrupts and restores the saved mask on exit, so
//! sections nest.

use core::cell::RefCell;

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
///
/// Keep critical sections short: they delay the tick and every other
/// interrupt. Never raise a supervisor call from inside one.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// State shared between thread mode and interrupt handlers.
pub struct Shared<T> {
    inner: critical_section::Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` on the value inside a critical section.
    ///
    /// # Panics
    /// If called re-entrantly from within `f`.
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}
