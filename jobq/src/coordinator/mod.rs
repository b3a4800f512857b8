//! Run lifecycle: set up the semaphores and the queue, spawn every worker,
//! join them and tear everything down again.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};

use super::consumer::Consumer;
use super::core::*;
use super::errors::{JobqError, Result};
use super::producer::Producer;
use super::semaphore::SemaphoreId;

/// Starts worker threads.
pub trait Spawn {
    fn spawn<F, T>(&self, name: String, f: F) -> io::Result<JoinHandle<T>>
        where F: FnOnce() -> T + Send + 'static,
              T: Send + 'static;
}

/// Named OS threads.
#[derive(Default, Debug, Clone, Copy)]
pub struct ThreadSpawner;

impl Spawn for ThreadSpawner {
    fn spawn<F, T>(&self, name: String, f: F) -> io::Result<JoinHandle<T>>
        where F: FnOnce() -> T + Send + 'static,
              T: Send + 'static,
    {
        thread::Builder::new().name(name).spawn(f)
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub key: String,
    // Every joined worker, failed ones included with exit `Failed`.
    pub reports: Vec<WorkerReport>,
    // Workers that ended with a semaphore or queue error.
    pub failures: Vec<(String, JobqError)>,
    // Counter values and queue length after every worker joined.
    pub space: usize,
    pub item: usize,
    pub leftover: usize,
}

impl RunSummary {
    fn handled_by(&self, role: Role) -> usize {
        self.reports
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.handled())
            .sum()
    }

    pub fn deposited(&self) -> usize {
        self.handled_by(Role::Producer)
    }

    pub fn consumed(&self) -> usize {
        self.handled_by(Role::Consumer)
    }
}

type Worker = (String, JoinHandle<WorkerResult>);

pub struct Coordinator<S: Spawn = ThreadSpawner> {
    config: RunConfig,
    closing: Arc<AtomicBool>,
    spawner: S,
}

impl Coordinator<ThreadSpawner> {
    pub fn new(config: RunConfig) -> Coordinator<ThreadSpawner> {
        Coordinator::with_spawner(config, ThreadSpawner)
    }
}

impl<S: Spawn> Coordinator<S> {
    pub fn with_spawner(config: RunConfig, spawner: S) -> Coordinator<S> {
        Coordinator {
            config: config,
            closing: Arc::new(AtomicBool::new(false)),
            spawner: spawner,
        }
    }

    /// Raising this flag makes workers stop at their next loop turn.
    pub fn closing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closing)
    }

    pub fn run(&self, params: &RunParams) -> Result<RunSummary> {
        self.config.validate()?;
        let key = run_key(&self.config);

        // Dropping `set` on an early return releases the segment again.
        let mut set = SemaphoreSet::create(&self.config.data_dir, &key, params.workers())?;
        for id in SemaphoreId::ALL.iter() {
            set.init(*id, id.initial_value(params.queue_size))?;
        }
        let ctx = RunContext::new(self.config.clone(), params.queue_size, Arc::clone(&self.closing))?;
        info!(
            "run '{}': queue size {}, {} producer(s) x {} job(s), {} consumer(s)",
            key, params.queue_size, params.producers, params.jobs_per_producer, params.consumers
        );

        let mut workers = Vec::with_capacity(params.workers());
        let spawned = self.spawn_all(&ctx, params, &mut workers);
        if let Err(e) = &spawned {
            error!("{}; stopping the {} worker(s) already running", e, workers.len());
            ctx.request_close();
        }

        let mut reports = Vec::with_capacity(workers.len());
        let mut failures = Vec::new();
        let mut join_failure = None;
        for (slot, (name, handle)) in workers.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(report)) => {
                    info!("{} joined: {:?} after {} job(s)", name, report.exit, report.handled());
                    set.record(slot, report.handled());
                    reports.push(report);
                }
                Ok(Err(failure)) => {
                    error!("{}", failure);
                    set.record(slot, failure.report.handled());
                    reports.push(failure.report);
                    failures.push((name, failure.error));
                }
                Err(_) => {
                    error!("could not join {}", name);
                    join_failure.get_or_insert(name);
                }
            }
        }

        let summary = RunSummary {
            key: key,
            reports: reports,
            failures: failures,
            space: ctx.semaphores.value(SemaphoreId::Space).unwrap_or(0),
            item: ctx.semaphores.value(SemaphoreId::Item).unwrap_or(0),
            leftover: ctx.queue.with_exclusive(|q| q.len()).unwrap_or(0),
        };
        if summary.leftover > 0 {
            warn!("{} job(s) left unconsumed", summary.leftover);
        }

        ctx.semaphores.close();
        set.close();
        info!(
            "run '{}' finished: {} deposited, {} consumed",
            summary.key,
            summary.deposited(),
            summary.consumed()
        );

        spawned?;
        if let Some(worker) = join_failure {
            return Err(JobqError::ThreadJoin { worker: worker });
        }
        Ok(summary)
    }

    // Consumers first; both sides block correctly whichever starts first.
    fn spawn_all(&self, ctx: &Arc<RunContext>, params: &RunParams, workers: &mut Vec<Worker>) -> Result<()> {
        for id in 1..=params.consumers {
            let consumer = Consumer::new(id, Arc::clone(ctx));
            self.spawn_worker(format!("consumer {}", id), move || consumer.run(), workers)?;
        }
        for id in 1..=params.producers {
            let producer = Producer::new(id, params.jobs_per_producer, Arc::clone(ctx));
            self.spawn_worker(format!("producer {}", id), move || producer.run(), workers)?;
        }
        Ok(())
    }

    fn spawn_worker<F>(&self, name: String, f: F, workers: &mut Vec<Worker>) -> Result<()>
        where F: FnOnce() -> WorkerResult + Send + 'static,
    {
        let handle = self
            .spawner
            .spawn(name.clone(), f)
            .map_err(|e| JobqError::ThreadCreation { worker: name.clone(), source: e })?;
        workers.push((name, handle));
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::{tempdir, TempDir};

    fn quick_config(dir: &TempDir) -> RunConfig {
        RunConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            time_unit_ms: 1,
            timeout: 200,
            min_think: 0,
            max_think: 2,
            min_duration: 1,
            max_duration: 3,
            ..Default::default()
        }
    }

    // Fails once `left` threads have been handed out.
    struct LimitedSpawner {
        left: AtomicUsize,
    }

    impl Spawn for LimitedSpawner {
        fn spawn<F, T>(&self, name: String, f: F) -> io::Result<JoinHandle<T>>
            where F: FnOnce() -> T + Send + 'static,
                  T: Send + 'static,
        {
            let left = self.left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "thread limit reached"));
            }
            self.left.store(left - 1, Ordering::SeqCst);
            ThreadSpawner.spawn(name, f)
        }
    }

    // Every worker thread dies before doing anything.
    struct PanickingSpawner;

    impl Spawn for PanickingSpawner {
        fn spawn<F, T>(&self, name: String, f: F) -> io::Result<JoinHandle<T>>
            where F: FnOnce() -> T + Send + 'static,
                  T: Send + 'static,
        {
            thread::Builder::new().name(name).spawn(move || -> T {
                drop(f);
                panic!("worker died")
            })
        }
    }

    fn links_left(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn spawn_failure_joins_running_workers_and_cleans_up() -> Result<()> {
        let dir = tempdir()?;
        let spawner = LimitedSpawner { left: AtomicUsize::new(2) };
        let coordinator = Coordinator::with_spawner(quick_config(&dir), spawner);
        let params = RunParams::new(2, 3, 2, 1)?;

        match coordinator.run(&params) {
            Err(JobqError::ThreadCreation { worker, .. }) => assert_eq!(worker, "producer 2"),
            other => panic!("expected a thread creation failure, got {:?}", other),
        }
        assert_eq!(links_left(dir.path()), 0);
        Ok(())
    }

    #[test]
    fn panicked_worker_is_a_join_failure() -> Result<()> {
        let dir = tempdir()?;
        let coordinator = Coordinator::with_spawner(quick_config(&dir), PanickingSpawner);
        let params = RunParams::new(1, 1, 1, 1)?;

        let err = coordinator.run(&params).unwrap_err();
        assert!(matches!(err, JobqError::ThreadJoin { ref worker } if worker == "consumer 1"));
        assert_eq!(err.exit_code(), crate::errors::EXIT_THREAD_JOIN);
        assert_eq!(links_left(dir.path()), 0);
        Ok(())
    }

    #[test]
    fn invalid_config_creates_nothing() -> Result<()> {
        let dir = tempdir()?;
        let config = RunConfig { min_duration: 5, max_duration: 1, ..quick_config(&dir) };
        let err = Coordinator::new(config).run(&RunParams::new(1, 1, 1, 1)?).unwrap_err();
        assert!(matches!(err, JobqError::InvalidConfig(_)));
        assert_eq!(links_left(dir.path()), 0);
        Ok(())
    }

    #[test]
    fn summary_counts_by_role() -> Result<()> {
        let dir = tempdir()?;
        let summary = Coordinator::new(quick_config(&dir)).run(&RunParams::new(3, 4, 2, 2)?)?;
        assert_eq!(summary.reports.len(), 4);
        assert_eq!(summary.deposited(), 8);
        assert_eq!(summary.consumed(), 8);
        assert!(summary.failures.is_empty());
        Ok(())
    }

    #[test]
    fn failed_workers_still_count_towards_the_totals() {
        let report = |role, exit, jobs: usize| WorkerReport {
            role: role,
            id: 1,
            exit: exit,
            jobs: (0..jobs).map(|_| crate::queue::Job::new(1, 1)).collect(),
        };
        let summary = RunSummary {
            key: "totals".to_string(),
            reports: vec![
                report(Role::Producer, WorkerExit::Failed, 2),
                report(Role::Consumer, WorkerExit::TimedOut, 1),
                report(Role::Consumer, WorkerExit::Failed, 1),
            ],
            failures: vec![("producer 1".to_string(), JobqError::QueueFull { capacity: 1 })],
            space: 0,
            item: 0,
            leftover: 0,
        };
        assert_eq!(summary.deposited(), 2);
        assert_eq!(summary.consumed(), 2);
    }
}
