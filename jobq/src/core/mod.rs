use std::env;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

use super::errors::{JobqError, Result};
use super::queue::{Job, SharedQueue};
use super::semaphore::{SemaphoreId, SemaphoreTriple};

pub static DEFAULT_KEY_PREFIX: &'static str = "jobq-sem";

pub const ARG_NAMES: [&'static str; 4] = [
    "queue size",
    "number of jobs per producer",
    "number of producers",
    "number of consumers",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data_dir: String,
    pub key_prefix: String,
    // Reusing a fixed key makes a leftover link collide with the next run.
    pub key: Option<String>,
    pub time_unit_ms: u64,
    // In time units. Consumers only stop by timing out, so it must be positive.
    pub timeout: u64,
    pub min_think: u64,
    pub max_think: u64,
    pub min_duration: u64,
    pub max_duration: u64,
    pub seed: Option<u64>,
    pub log_level: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            data_dir: env::temp_dir().to_string_lossy().into_owned(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key: None,
            time_unit_ms: 1000,
            timeout: 10,
            min_think: 1,
            max_think: 5,
            min_duration: 1,
            max_duration: 10,
            seed: None,
            log_level: "info".to_string(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.time_unit_ms == 0 {
            return Err(JobqError::InvalidConfig("time_unit_ms must be positive".to_string()));
        }
        if self.timeout == 0 {
            return Err(JobqError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.min_think > self.max_think {
            return Err(JobqError::InvalidConfig(format!(
                "min_think {} is larger than max_think {}",
                self.min_think, self.max_think
            )));
        }
        if self.min_duration == 0 || self.min_duration > self.max_duration {
            return Err(JobqError::InvalidConfig(format!(
                "job durations must satisfy 0 < min_duration <= max_duration, got {}..={}",
                self.min_duration, self.max_duration
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn units(&self, n: u64) -> Duration {
        Duration::from_millis(self.time_unit_ms.saturating_mul(n))
    }

    /// `space`/`item` wait timeout.
    #[inline]
    pub fn wait_timeout(&self) -> Duration {
        self.units(self.timeout)
    }
}

/// The four validated run parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub queue_size: usize,
    pub jobs_per_producer: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl RunParams {
    pub fn new(
        queue_size: usize,
        jobs_per_producer: usize,
        producers: usize,
        consumers: usize,
    ) -> Result<RunParams> {
        let values = [queue_size, jobs_per_producer, producers, consumers];
        for (name, value) in ARG_NAMES.iter().zip(values.iter()) {
            if *value == 0 {
                return Err(JobqError::InvalidArgument { name: *name, value: value.to_string() });
            }
        }
        Ok(RunParams {
            queue_size: queue_size,
            jobs_per_producer: jobs_per_producer,
            producers: producers,
            consumers: consumers,
        })
    }

    /// Parses the four positional arguments, in [`ARG_NAMES`] order.
    pub fn parse<S: AsRef<str>>(args: &[S; 4]) -> Result<RunParams> {
        let mut values = [0usize; 4];
        for (i, arg) in args.iter().enumerate() {
            values[i] = parse_positive(ARG_NAMES[i], arg.as_ref())?;
        }
        RunParams::new(values[0], values[1], values[2], values[3])
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.producers + self.consumers
    }
}

fn parse_positive(name: &'static str, arg: &str) -> Result<usize> {
    match arg.trim().parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(JobqError::InvalidArgument { name: name, value: arg.to_string() }),
    }
}

/// Per-run semaphore set registered in a keyed shared memory segment.
///
/// Slot layout, one `u32` each: `space`, `item`, `mutex`, then one
/// bookkeeping slot per worker. The three counter slots hold the initial
/// values as registered at setup; the live counters are the in-process
/// [`SemaphoreTriple`] and are never mirrored back here. Worker slots are
/// written once, when the worker is joined.
pub struct SemaphoreSet {
    key: String,
    link_path: PathBuf,
    shmem: Shmem,
    slots: usize,
}

static RUN_KEY_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn run_key(cfg: &RunConfig) -> String {
    match &cfg.key {
        Some(key) => key.clone(),
        None => format!(
            "{}-{}-{}",
            cfg.key_prefix,
            process::id(),
            RUN_KEY_COUNTER.fetch_add(1, Ordering::SeqCst)
        ),
    }
}

impl SemaphoreSet {
    pub fn create(data_dir: &str, key: &str, workers: usize) -> Result<SemaphoreSet> {
        let link_path = Path::new(data_dir).join(key);
        let slots = SemaphoreId::ALL.len() + workers;
        let shmem = ShmemConf::new()
            .size(slots * mem::size_of::<u32>())
            .flink(&link_path)
            .create()
            .map_err(|e| match e {
                ShmemError::LinkExists => JobqError::SemaphoreExists { key: key.to_string() },
                e => JobqError::SemaphoreCreate { key: key.to_string(), source: e },
            })?;
        debug!("semaphore set '{}' created with {} slots at {}", key, slots, link_path.display());
        Ok(SemaphoreSet {
            key: key.to_string(),
            link_path: link_path,
            shmem: shmem,
            slots: slots,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn link_path(&self) -> &Path {
        &self.link_path
    }

    #[inline]
    fn write(&mut self, slot: usize, value: u32) {
        debug_assert!(slot < self.slots);
        unsafe {
            let base = self.shmem.as_ptr() as *mut u32;
            base.add(slot).write_volatile(value);
        }
    }

    pub fn read(&self, slot: usize) -> Option<u32> {
        if slot >= self.slots {
            return None;
        }
        unsafe {
            let base = self.shmem.as_ptr() as *const u32;
            Some(base.add(slot).read_volatile())
        }
    }

    /// Registers a counter's initial value. Later waits and signals do not
    /// update the slot.
    pub fn init(&mut self, id: SemaphoreId, value: usize) -> Result<()> {
        let registered = u32::try_from(value)
            .map_err(|_| JobqError::SemaphoreInit { semaphore: id, value: value })?;
        self.write(id.slot(), registered);
        Ok(())
    }

    /// Records the number of jobs the `worker`th worker handled.
    pub fn record(&mut self, worker: usize, handled: usize) {
        let slot = SemaphoreId::ALL.len() + worker;
        if slot < self.slots {
            self.write(slot, u32::try_from(handled).unwrap_or(u32::MAX));
        }
    }

    pub fn worker_slot(&self, worker: usize) -> Option<u32> {
        self.read(SemaphoreId::ALL.len() + worker)
    }

    /// Releases the segment and removes its link.
    pub fn close(self) {
        debug!("semaphore set '{}' released", self.key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// How a worker's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    // Producer generated its whole quota.
    Completed,
    TimedOut,
    // The run's closing flag was raised.
    Interrupted,
    // A semaphore or queue error; the error travels in a `WorkerFailure`.
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub role: Role,
    pub id: usize,
    pub exit: WorkerExit,
    // Deposited or consumed, in order.
    pub jobs: Vec<Job>,
}

impl WorkerReport {
    /// Builds the worker's result from how its loop ended. Jobs handled
    /// before an error stay in the report.
    pub fn finish(role: Role, id: usize, outcome: Result<WorkerExit>, jobs: Vec<Job>) -> WorkerResult {
        match outcome {
            Ok(exit) => Ok(WorkerReport { role: role, id: id, exit: exit, jobs: jobs }),
            Err(error) => Err(WorkerFailure {
                error: error,
                report: WorkerReport { role: role, id: id, exit: WorkerExit::Failed, jobs: jobs },
            }),
        }
    }

    #[inline]
    pub fn handled(&self) -> usize {
        self.jobs.len()
    }
}

/// A worker that ended on an error, with what it handled up to then.
#[derive(Debug)]
pub struct WorkerFailure {
    pub error: JobqError,
    pub report: WorkerReport,
}

pub type WorkerResult = std::result::Result<WorkerReport, WorkerFailure>;

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed after {} job(s): {}",
            self.report.role,
            self.report.id,
            self.report.handled(),
            self.error
        )
    }
}

impl std::error::Error for WorkerFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<WorkerFailure> for JobqError {
    fn from(failure: WorkerFailure) -> Self {
        failure.error
    }
}

/// Everything the workers of one run share.
pub struct RunContext {
    pub config: RunConfig,
    pub semaphores: SemaphoreTriple,
    pub queue: SharedQueue,
    closing: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(config: RunConfig, capacity: usize, closing: Arc<AtomicBool>) -> Result<Arc<RunContext>> {
        Ok(Arc::new(RunContext {
            config: config,
            semaphores: SemaphoreTriple::new(capacity)?,
            queue: SharedQueue::new(capacity)?,
            closing: closing,
        }))
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Simulated work.
    pub fn sleep_units(&self, n: u64) {
        thread::sleep(self.config.units(n));
    }
}

/// Raises `closing` on SIGHUP, SIGINT, SIGQUIT and SIGTERM.
pub fn watch_signals(closing: &Arc<AtomicBool>) -> Result<()> {
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(closing))?;
    }
    info!("stopping workers on SIGHUP, SIGINT, SIGQUIT or SIGTERM");
    Ok(())
}
