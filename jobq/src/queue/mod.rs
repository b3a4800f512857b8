use std::sync::{Mutex, TryLockError};

use super::errors::{JobqError, Result};

/// One unit of simulated work.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Job {
    // Run-wide sequence id, stamped on push. Zero until deposited.
    pub id: u64,
    pub producer: usize,
    // In time units.
    pub duration: u64,
}

impl Job {
    pub fn new(producer: usize, duration: u64) -> Job {
        Job {
            id: 0,
            producer: producer,
            duration: duration,
        }
    }
}

/// Fixed-capacity FIFO ring of jobs.
///
/// `push`/`pop` assume the caller already went through the matching `space`
/// or `item` wait, so a full push or an empty pop is a protocol fault and
/// reported as such rather than blocking.
#[derive(Debug)]
pub struct JobQueue {
    slots: Vec<Option<Job>>,
    head: usize,
    len: usize,
    next_id: u64,
}

impl JobQueue {
    /// Fails with [`JobqError::QueueAllocation`] instead of aborting when
    /// the slots cannot be allocated.
    pub fn with_capacity(capacity: usize) -> Result<JobQueue> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| JobqError::QueueAllocation { capacity: capacity })?;
        slots.resize(capacity, None);
        Ok(JobQueue {
            slots: slots,
            head: 0,
            len: 0,
            next_id: 1,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.len
    }

    #[inline]
    fn wrap(&self, index: usize) -> usize {
        index % self.capacity()
    }

    /// Appends `job` at the tail and returns it with its sequence id set.
    pub fn push(&mut self, mut job: Job) -> Result<Job> {
        if self.len >= self.capacity() {
            return Err(JobqError::QueueFull { capacity: self.capacity() });
        }
        job.id = self.next_id;
        self.next_id += 1;
        let tail = self.wrap(self.head + self.len);
        self.slots[tail] = Some(job);
        self.len += 1;
        Ok(job)
    }

    /// Removes the head job.
    pub fn pop(&mut self) -> Result<Job> {
        if self.len == 0 {
            return Err(JobqError::QueueEmpty);
        }
        let job = self.slots[self.head].take().ok_or(JobqError::QueueEmpty)?;
        self.head = self.wrap(self.head + 1);
        self.len -= 1;
        Ok(job)
    }
}

/// The job queue as shared between workers.
///
/// Access is serialised by the `mutex` semaphore, not by the lock in here:
/// the lock is only ever tried, never waited on, and finding it taken means
/// two workers got past `mutex` at once.
#[derive(Debug)]
pub struct SharedQueue {
    inner: Mutex<JobQueue>,
}

impl SharedQueue {
    pub fn new(capacity: usize) -> Result<SharedQueue> {
        Ok(SharedQueue {
            inner: Mutex::new(JobQueue::with_capacity(capacity)?),
        })
    }

    pub fn with_exclusive<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce(&mut JobQueue) -> R,
    {
        match self.inner.try_lock() {
            Ok(mut queue) => Ok(f(&mut queue)),
            Err(TryLockError::WouldBlock) => Err(JobqError::ExclusionViolated),
            Err(TryLockError::Poisoned(_)) => Err(JobqError::PoisonedLock),
        }
    }
}
