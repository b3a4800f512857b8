//! Counting semaphores with timeout-bounded waits.
//!
//! A run owns exactly three of them, bundled in a [`SemaphoreTriple`]:
//!
//! - `space` counts free queue slots and starts at the queue capacity,
//! - `item` counts filled queue slots and starts at zero,
//! - `mutex` is a binary semaphore guarding the queue itself.
//!
//! Each counter is a `usize` behind a [`Mutex`] paired with a [`Condvar`].
//! A waiter whose deadline expires re-checks the counter while holding the
//! lock, so a signal that races with the expiry is either taken by that waiter
//! or stays in the counter for the next one.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::errors::{JobqError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreId {
    Space,
    Item,
    Mutex,
}

impl SemaphoreId {
    pub const ALL: [SemaphoreId; 3] = [SemaphoreId::Space, SemaphoreId::Item, SemaphoreId::Mutex];

    /// Position of this counter in the semaphore set.
    #[inline]
    pub fn slot(self) -> usize {
        match self {
            SemaphoreId::Space => 0,
            SemaphoreId::Item => 1,
            SemaphoreId::Mutex => 2,
        }
    }

    pub fn initial_value(self, capacity: usize) -> usize {
        match self {
            SemaphoreId::Space => capacity,
            SemaphoreId::Item => 0,
            SemaphoreId::Mutex => 1,
        }
    }

    pub fn max_value(self, capacity: usize) -> usize {
        match self {
            SemaphoreId::Space | SemaphoreId::Item => capacity,
            SemaphoreId::Mutex => 1,
        }
    }
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemaphoreId::Space => "space",
            SemaphoreId::Item => "item",
            SemaphoreId::Mutex => "mutex",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Acquired,
    TimedOut,
}

#[derive(Debug)]
struct Counter {
    value: usize,
    closed: bool,
}

/// A counting semaphore bounded to `[0, max]`.
#[derive(Debug)]
pub struct Semaphore {
    id: SemaphoreId,
    max: usize,
    state: Mutex<Counter>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(id: SemaphoreId, initial: usize, max: usize) -> Result<Semaphore> {
        if initial > max {
            return Err(JobqError::SemaphoreInit { semaphore: id, value: initial });
        }
        Ok(Semaphore {
            id,
            max,
            state: Mutex::new(Counter { value: initial, closed: false }),
            available: Condvar::new(),
        })
    }

    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    /// Blocks until the counter is positive, then decrements it.
    ///
    /// A zero `timeout` waits forever. Otherwise the wait gives up after
    /// `timeout` and returns [`WaitOutcome::TimedOut`] with the counter left
    /// untouched.
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        if timeout.is_zero() {
            self.acquire()?;
            return Ok(WaitOutcome::Acquired);
        }
        let state = self.state.lock()?;
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |c| c.value == 0 && !c.closed)?;
        if state.closed {
            return Err(JobqError::Closed(self.id));
        }
        if state.value == 0 {
            return Ok(WaitOutcome::TimedOut);
        }
        state.value -= 1;
        Ok(WaitOutcome::Acquired)
    }

    /// Untimed wait.
    pub fn acquire(&self) -> Result<()> {
        let state = self.state.lock()?;
        let mut state = self.available.wait_while(state, |c| c.value == 0 && !c.closed)?;
        if state.closed {
            return Err(JobqError::Closed(self.id));
        }
        state.value -= 1;
        Ok(())
    }

    /// Increments the counter and wakes at most one waiter.
    pub fn signal(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(JobqError::Closed(self.id));
        }
        if state.value >= self.max {
            return Err(JobqError::SemaphoreOverflow { semaphore: self.id, max: self.max });
        }
        state.value += 1;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Rejects further waits and signals and releases every blocked waiter.
    pub fn close(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    /// Current counter value. Diagnostics only; nothing may branch on it.
    pub fn value(&self) -> Result<usize> {
        Ok(self.state.lock()?.value)
    }
}

/// The `space` / `item` / `mutex` semaphores of one run.
#[derive(Debug)]
pub struct SemaphoreTriple {
    space: Semaphore,
    item: Semaphore,
    mutex: Semaphore,
}

impl SemaphoreTriple {
    pub fn new(capacity: usize) -> Result<SemaphoreTriple> {
        let make = |id: SemaphoreId| Semaphore::new(id, id.initial_value(capacity), id.max_value(capacity));
        Ok(SemaphoreTriple {
            space: make(SemaphoreId::Space)?,
            item: make(SemaphoreId::Item)?,
            mutex: make(SemaphoreId::Mutex)?,
        })
    }

    #[inline]
    pub fn get(&self, which: SemaphoreId) -> &Semaphore {
        match which {
            SemaphoreId::Space => &self.space,
            SemaphoreId::Item => &self.item,
            SemaphoreId::Mutex => &self.mutex,
        }
    }

    pub fn wait(&self, which: SemaphoreId, timeout: Duration) -> Result<WaitOutcome> {
        self.get(which).wait(timeout)
    }

    pub fn signal(&self, which: SemaphoreId) -> Result<()> {
        self.get(which).signal()
    }

    /// Takes `mutex` without a timeout. The permit gives it back on
    /// [`MutexPermit::release`], or on drop if the holder bails out early.
    pub fn lock(&self) -> Result<MutexPermit<'_>> {
        self.mutex.acquire()?;
        Ok(MutexPermit { triple: self, released: false })
    }

    pub fn close(&self) {
        for id in SemaphoreId::ALL {
            self.get(id).close();
        }
    }

    pub fn value(&self, which: SemaphoreId) -> Result<usize> {
        self.get(which).value()
    }
}

/// Holds `mutex` of a [`SemaphoreTriple`].
pub struct MutexPermit<'a> {
    triple: &'a SemaphoreTriple,
    released: bool,
}

impl MutexPermit<'_> {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.triple.signal(SemaphoreId::Mutex)
    }
}

impl Drop for MutexPermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.triple.signal(SemaphoreId::Mutex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn initial_values_follow_capacity() -> Result<()> {
        let triple = SemaphoreTriple::new(4)?;
        assert_eq!(triple.value(SemaphoreId::Space)?, 4);
        assert_eq!(triple.value(SemaphoreId::Item)?, 0);
        assert_eq!(triple.value(SemaphoreId::Mutex)?, 1);
        Ok(())
    }

    #[test]
    fn initial_value_above_bound_is_an_init_error() {
        let err = Semaphore::new(SemaphoreId::Mutex, 2, 1).unwrap_err();
        assert!(matches!(err, JobqError::SemaphoreInit { semaphore: SemaphoreId::Mutex, value: 2 }));
    }

    #[test]
    fn timed_out_wait_leaves_counter_untouched() -> Result<()> {
        let sem = Semaphore::new(SemaphoreId::Item, 0, 3)?;
        let start = Instant::now();
        assert_eq!(sem.wait(SHORT)?, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= SHORT);
        assert_eq!(sem.value()?, 0);
        Ok(())
    }

    #[test]
    fn wait_takes_an_available_permit_immediately() -> Result<()> {
        let sem = Semaphore::new(SemaphoreId::Space, 2, 2)?;
        assert_eq!(sem.wait(SHORT)?, WaitOutcome::Acquired);
        assert_eq!(sem.wait(Duration::ZERO)?, WaitOutcome::Acquired);
        assert_eq!(sem.value()?, 0);
        assert_eq!(sem.wait(SHORT)?, WaitOutcome::TimedOut);
        Ok(())
    }

    #[test]
    fn signal_wakes_a_blocked_waiter() -> Result<()> {
        let sem = Arc::new(Semaphore::new(SemaphoreId::Item, 0, 1)?);
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait(Duration::ZERO))
        };
        thread::sleep(SHORT);
        sem.signal()?;
        assert_eq!(waiter.join().expect("waiter panicked")?, WaitOutcome::Acquired);
        assert_eq!(sem.value()?, 0);
        Ok(())
    }

    #[test]
    fn signal_past_the_bound_overflows() -> Result<()> {
        let sem = Semaphore::new(SemaphoreId::Mutex, 1, 1)?;
        let err = sem.signal().unwrap_err();
        assert!(matches!(err, JobqError::SemaphoreOverflow { semaphore: SemaphoreId::Mutex, max: 1 }));
        assert_eq!(sem.value()?, 1);
        Ok(())
    }

    #[test]
    fn close_releases_waiters_with_an_error() -> Result<()> {
        let sem = Arc::new(Semaphore::new(SemaphoreId::Item, 0, 1)?);
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait(Duration::ZERO))
        };
        thread::sleep(SHORT);
        sem.close();
        let err = waiter.join().expect("waiter panicked").unwrap_err();
        assert!(matches!(err, JobqError::Closed(SemaphoreId::Item)));
        assert!(matches!(sem.signal(), Err(JobqError::Closed(_))));
        Ok(())
    }

    #[test]
    fn no_signal_is_lost_to_an_expiring_wait() -> Result<()> {
        const SIGNALS: usize = 400;
        let sem = Arc::new(Semaphore::new(SemaphoreId::Item, 0, SIGNALS)?);
        let acquired = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let acquired = Arc::clone(&acquired);
                thread::spawn(move || -> Result<()> {
                    // Very short deadlines make expiry and signal race constantly.
                    loop {
                        match sem.wait(Duration::from_micros(50))? {
                            WaitOutcome::Acquired => {
                                acquired.fetch_add(1, Ordering::SeqCst);
                            }
                            WaitOutcome::TimedOut => {
                                if acquired.load(Ordering::SeqCst) >= SIGNALS / 2 {
                                    return Ok(());
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for _ in 0..SIGNALS {
            sem.signal()?;
        }
        for waiter in waiters {
            waiter.join().expect("waiter panicked")?;
        }
        assert_eq!(acquired.load(Ordering::SeqCst) + sem.value()?, SIGNALS);
        Ok(())
    }

    #[test]
    fn dropped_permit_gives_mutex_back() -> Result<()> {
        let triple = SemaphoreTriple::new(1)?;
        {
            let _permit = triple.lock()?;
            assert_eq!(triple.value(SemaphoreId::Mutex)?, 0);
        }
        assert_eq!(triple.value(SemaphoreId::Mutex)?, 1);
        triple.lock()?.release()?;
        assert_eq!(triple.value(SemaphoreId::Mutex)?, 1);
        Ok(())
    }
}
