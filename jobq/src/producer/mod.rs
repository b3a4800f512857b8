use std::ops::RangeInclusive;
use std::sync::Arc;

use log::{info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::core::*;
use super::errors::Result;
use super::queue::Job;
use super::semaphore::{SemaphoreId, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Generating,
    WaitingForSpace,
    WaitingForMutex,
    Depositing,
    Signalling,
    Done,
}

/// Think times and job durations, both in time units.
pub struct RandomJobs {
    rng: StdRng,
    think: RangeInclusive<u64>,
    duration: RangeInclusive<u64>,
}

impl RandomJobs {
    pub fn new(cfg: &RunConfig, producer: usize) -> RandomJobs {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(producer as u64)),
            None => StdRng::from_entropy(),
        };
        RandomJobs {
            rng: rng,
            think: cfg.min_think..=cfg.max_think,
            duration: cfg.min_duration..=cfg.max_duration,
        }
    }

    #[inline]
    pub fn think_time(&mut self) -> u64 {
        self.rng.gen_range(self.think.clone())
    }

    #[inline]
    pub fn duration(&mut self) -> u64 {
        self.rng.gen_range(self.duration.clone())
    }
}

pub struct Producer {
    id: usize,
    quota: usize,
    state: ProducerState,
    jobs: RandomJobs,
    ctx: Arc<RunContext>,
}

impl Producer {
    pub fn new(id: usize, quota: usize, ctx: Arc<RunContext>) -> Producer {
        let jobs = RandomJobs::new(&ctx.config, id);
        Producer {
            id: id,
            quota: quota,
            state: ProducerState::Generating,
            jobs: jobs,
            ctx: ctx,
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    #[inline]
    fn transition(&mut self, next: ProducerState) {
        trace!("producer {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    fn generate(&mut self) -> Job {
        self.transition(ProducerState::Generating);
        self.ctx.sleep_units(self.jobs.think_time());
        Job::new(self.id, self.jobs.duration())
    }

    /// Deposits `quota` jobs, or fewer if no slot frees up within the run
    /// timeout or the run is closing.
    pub fn run(mut self) -> WorkerResult {
        let mut deposited = Vec::with_capacity(self.quota);
        let outcome = self.deposit_quota(&mut deposited);

        self.transition(ProducerState::Done);
        info!("producer {}: done, {} job(s) deposited", self.id, deposited.len());
        WorkerReport::finish(Role::Producer, self.id, outcome, deposited)
    }

    fn deposit_quota(&mut self, deposited: &mut Vec<Job>) -> Result<WorkerExit> {
        let ctx = Arc::clone(&self.ctx);
        let timeout = ctx.config.wait_timeout();

        while deposited.len() < self.quota {
            if ctx.is_closing() {
                info!("producer {}: run is closing, stopping early", self.id);
                return Ok(WorkerExit::Interrupted);
            }
            let job = self.generate();

            self.transition(ProducerState::WaitingForSpace);
            if ctx.semaphores.wait(SemaphoreId::Space, timeout)? == WaitOutcome::TimedOut {
                warn!("producer {}: no free slot within {:?}, giving up", self.id, timeout);
                return Ok(WorkerExit::TimedOut);
            }

            self.transition(ProducerState::WaitingForMutex);
            let permit = ctx.semaphores.lock()?;

            self.transition(ProducerState::Depositing);
            let job = ctx.queue.with_exclusive(|queue| queue.push(job))??;
            info!(
                "producer {}: job id {} deposited, duration {}",
                self.id, job.id, job.duration
            );

            self.transition(ProducerState::Signalling);
            permit.release()?;
            ctx.semaphores.signal(SemaphoreId::Item)?;
            deposited.push(job);
        }
        Ok(WorkerExit::Completed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use crate::errors::JobqError;

    fn quick_config() -> RunConfig {
        RunConfig {
            time_unit_ms: 1,
            timeout: 30,
            min_think: 0,
            max_think: 1,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn seeded_jobs_are_reproducible_and_in_range() {
        let cfg = quick_config();
        let mut a = RandomJobs::new(&cfg, 1);
        let mut b = RandomJobs::new(&cfg, 1);
        for _ in 0..50 {
            let duration = a.duration();
            assert_eq!(duration, b.duration());
            assert!((cfg.min_duration..=cfg.max_duration).contains(&duration));
            assert!(a.think_time() <= cfg.max_think);
            b.think_time();
        }
    }

    #[test]
    fn fills_the_queue_then_times_out_without_a_consumer() -> Result<()> {
        let ctx = RunContext::new(quick_config(), 2, Arc::new(AtomicBool::new(false)))?;
        let report = Producer::new(1, 5, Arc::clone(&ctx)).run()?;

        assert_eq!(report.exit, WorkerExit::TimedOut);
        assert_eq!(report.handled(), 2);
        assert_eq!(report.jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ctx.semaphores.value(SemaphoreId::Space)?, 0);
        assert_eq!(ctx.semaphores.value(SemaphoreId::Item)?, 2);
        assert_eq!(ctx.semaphores.value(SemaphoreId::Mutex)?, 1);
        assert_eq!(ctx.queue.with_exclusive(|q| q.len())?, 2);
        Ok(())
    }

    #[test]
    fn completes_its_quota_when_space_allows() -> Result<()> {
        let ctx = RunContext::new(quick_config(), 4, Arc::new(AtomicBool::new(false)))?;
        let report = Producer::new(3, 4, Arc::clone(&ctx)).run()?;
        assert_eq!(report.exit, WorkerExit::Completed);
        assert_eq!(report.role, Role::Producer);
        assert!(report.jobs.iter().all(|j| j.producer == 3));
        assert_eq!(ctx.semaphores.value(SemaphoreId::Item)?, 4);
        Ok(())
    }

    #[test]
    fn failure_after_deposits_keeps_them_in_the_report() -> Result<()> {
        let ctx = RunContext::new(quick_config(), 3, Arc::new(AtomicBool::new(false)))?;
        let report = Producer::new(1, 2, Arc::clone(&ctx)).run()?;
        assert_eq!(report.handled(), 2);
        // A stray `space` signal lets the fourth deposit reach a full ring.
        ctx.semaphores.signal(SemaphoreId::Space)?;

        let failure = Producer::new(2, 3, Arc::clone(&ctx)).run().unwrap_err();
        assert!(matches!(failure.error, JobqError::QueueFull { capacity: 3 }));
        assert_eq!(failure.report.exit, WorkerExit::Failed);
        assert_eq!(failure.report.handled(), 1);
        Ok(())
    }

    #[test]
    fn closing_run_stops_before_generating() -> Result<()> {
        let ctx = RunContext::new(quick_config(), 4, Arc::new(AtomicBool::new(false)))?;
        ctx.request_close();
        let report = Producer::new(1, 4, Arc::clone(&ctx)).run()?;
        assert_eq!(report.exit, WorkerExit::Interrupted);
        assert_eq!(report.handled(), 0);
        assert_eq!(ctx.semaphores.value(SemaphoreId::Space)?, 4);
        Ok(())
    }
}
