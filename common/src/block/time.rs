//! Clocks used by the state machines.
use std::cell::RefCell;
use std::rc::Rc;

use super::BlockTime;

pub use herald_net::time::{LocalDuration, LocalTime};

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Return the local time as seconds since Epoch.
    /// This is the same representation as used in block header timestamps.
    fn block_time(&self) -> BlockTime;
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

impl Clock for LocalTime {
    fn block_time(&self) -> BlockTime {
        self.as_secs() as BlockTime
    }

    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// A clock whose time is set by its owner.
pub trait AdjustableClock: Clock {
    /// Set the current local time.
    fn set(&mut self, time: LocalTime);
}

impl AdjustableClock for LocalTime {
    fn set(&mut self, time: LocalTime) {
        *self = time;
    }
}

/// Clock with interior mutability. Lets tests move time forward while a state
/// machine holds a copy of the clock.
#[derive(Debug, Clone)]
pub struct RefClock<T: Clock> {
    inner: Rc<RefCell<T>>,
}

impl RefClock<LocalTime> {
    /// Elapse time.
    pub fn elapse(&self, duration: LocalDuration) {
        self.inner.borrow_mut().elapse(duration)
    }

    /// Set the time.
    pub fn set(&self, time: LocalTime) {
        *self.inner.borrow_mut() = time;
    }
}

impl<T: Clock> From<T> for RefClock<T> {
    fn from(other: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(other)),
        }
    }
}

impl<T: Clock> Clock for RefClock<T> {
    fn block_time(&self) -> BlockTime {
        self.inner.borrow().block_time()
    }

    fn local_time(&self) -> LocalTime {
        self.inner.borrow().local_time()
    }
}

impl AdjustableClock for RefClock<LocalTime> {
    fn set(&mut self, time: LocalTime) {
        *self.inner.borrow_mut() = time;
    }
}
