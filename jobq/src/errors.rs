use std::{fmt, io};

use super::semaphore::SemaphoreId;

pub type Result<T> = std::result::Result<T, JobqError>;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ARGUMENT_COUNT: i32 = 1;
pub const EXIT_INVALID_ARGUMENT: i32 = 2;
pub const EXIT_SEMAPHORE_CREATE: i32 = 3;
pub const EXIT_SEMAPHORE_INIT: i32 = 4;
pub const EXIT_THREAD_JOIN: i32 = 5;
pub const EXIT_THREAD_CREATION: i32 = 6;
pub const EXIT_WORKER_FAILED: i32 = 7;

#[derive(Debug)]
pub enum JobqError {
    InvalidArgument { name: &'static str, value: String },
    InvalidConfig(String),
    SemaphoreCreate { key: String, source: shared_memory::ShmemError },
    // A link with this key is left over from another run.
    SemaphoreExists { key: String },
    SemaphoreInit { semaphore: SemaphoreId, value: usize },
    SemaphoreOverflow { semaphore: SemaphoreId, max: usize },
    Closed(SemaphoreId),
    PoisonedLock,
    QueueFull { capacity: usize },
    QueueEmpty,
    QueueAllocation { capacity: usize },
    ExclusionViolated,
    ThreadCreation { worker: String, source: io::Error },
    ThreadJoin { worker: String },
    WorkerFailed { failed: usize },
    Io(io::Error),
}

impl JobqError {
    /// Process exit code the command line reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobqError::InvalidArgument { .. }
            | JobqError::InvalidConfig(_)
            | JobqError::QueueAllocation { .. } => EXIT_INVALID_ARGUMENT,
            JobqError::SemaphoreCreate { .. } | JobqError::SemaphoreExists { .. } => EXIT_SEMAPHORE_CREATE,
            JobqError::SemaphoreInit { .. } => EXIT_SEMAPHORE_INIT,
            JobqError::ThreadJoin { .. } => EXIT_THREAD_JOIN,
            JobqError::ThreadCreation { .. } => EXIT_THREAD_CREATION,
            _ => EXIT_WORKER_FAILED,
        }
    }
}

impl fmt::Display for JobqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobqError::InvalidArgument { name, value } => {
                write!(f, "Invalid argument: {} must be a positive integer, got '{}'", name, value)
            }
            JobqError::InvalidConfig(s) => write!(f, "Invalid configuration: {}", s),
            JobqError::SemaphoreCreate { key, source } => {
                write!(f, "Could not create semaphore set '{}': {}", key, source)
            }
            JobqError::SemaphoreExists { key } => write!(
                f,
                "Semaphore set '{}' already exists (another run is alive or was not cleaned up)",
                key
            ),
            JobqError::SemaphoreInit { semaphore, value } => {
                write!(f, "Could not initialise semaphore '{}' to {}", semaphore, value)
            }
            JobqError::SemaphoreOverflow { semaphore, max } => {
                write!(f, "Signal on semaphore '{}' would exceed its bound {}", semaphore, max)
            }
            JobqError::Closed(semaphore) => write!(f, "Semaphore '{}' is closed", semaphore),
            JobqError::PoisonedLock => write!(f, "Mutex was poisoned"),
            JobqError::QueueFull { capacity } => {
                write!(f, "Push into a full job queue (capacity {})", capacity)
            }
            JobqError::QueueEmpty => write!(f, "Pop from an empty job queue"),
            JobqError::QueueAllocation { capacity } => {
                write!(f, "Could not allocate a job queue of {} slots", capacity)
            }
            JobqError::ExclusionViolated => {
                write!(f, "Job queue entered by two threads at once")
            }
            JobqError::ThreadCreation { worker, source } => {
                write!(f, "Could not create thread for {}: {}", worker, source)
            }
            JobqError::ThreadJoin { worker } => write!(f, "Could not join thread of {}", worker),
            JobqError::WorkerFailed { failed } => write!(f, "{} worker(s) failed", failed),
            JobqError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for JobqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobqError::SemaphoreCreate { source, .. } => Some(source),
            JobqError::ThreadCreation { source, .. } => Some(source),
            JobqError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for JobqError {
    fn from(err: io::Error) -> Self {
        JobqError::Io(err)
    }
}

// Poisoning only happens when a worker panicked while holding a counter lock.
impl<T> From<std::sync::PoisonError<T>> for JobqError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        JobqError::PoisonedLock
    }
}
