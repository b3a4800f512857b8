use std::sync::Arc;

use log::{info, trace};

use super::core::*;
use super::errors::Result;
use super::queue::Job;
use super::semaphore::{SemaphoreId, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    WaitingForItem,
    WaitingForMutex,
    Removing,
    Signalling,
    Consuming,
    Done,
}

pub struct Consumer {
    id: usize,
    state: ConsumerState,
    ctx: Arc<RunContext>,
}

impl Consumer {
    pub fn new(id: usize, ctx: Arc<RunContext>) -> Consumer {
        Consumer {
            id: id,
            state: ConsumerState::WaitingForItem,
            ctx: ctx,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    #[inline]
    fn transition(&mut self, next: ConsumerState) {
        trace!("consumer {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Takes and executes jobs until none arrives within the run timeout.
    ///
    /// There is no end-of-stream marker: a timed out `item` wait is how a
    /// consumer learns that producers are finished.
    pub fn run(mut self) -> WorkerResult {
        let mut consumed = Vec::new();
        let outcome = self.drain(&mut consumed);

        self.transition(ConsumerState::Done);
        WorkerReport::finish(Role::Consumer, self.id, outcome, consumed)
    }

    fn drain(&mut self, consumed: &mut Vec<Job>) -> Result<WorkerExit> {
        let ctx = Arc::clone(&self.ctx);
        let timeout = ctx.config.wait_timeout();

        loop {
            if ctx.is_closing() {
                info!("consumer {}: run is closing, stopping early", self.id);
                return Ok(WorkerExit::Interrupted);
            }

            self.transition(ConsumerState::WaitingForItem);
            if ctx.semaphores.wait(SemaphoreId::Item, timeout)? == WaitOutcome::TimedOut {
                info!("consumer {}: no jobs left after {:?}, exiting", self.id, timeout);
                return Ok(WorkerExit::TimedOut);
            }

            self.transition(ConsumerState::WaitingForMutex);
            let permit = ctx.semaphores.lock()?;

            self.transition(ConsumerState::Removing);
            let job = ctx.queue.with_exclusive(|queue| queue.pop())??;
            info!(
                "consumer {}: job id {} picked up, duration {}",
                self.id, job.id, job.duration
            );

            self.transition(ConsumerState::Signalling);
            permit.release()?;
            ctx.semaphores.signal(SemaphoreId::Space)?;

            // Outside the critical section, so consumers overlap.
            self.transition(ConsumerState::Consuming);
            ctx.sleep_units(job.duration);
            info!("consumer {}: job id {} completed", self.id, job.id);
            consumed.push(job);
        }
    }
}
