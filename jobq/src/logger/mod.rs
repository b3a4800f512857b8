//! Status sink: every `log` record becomes one line on standard error.

use std::io::{self, Write};
use std::thread;

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

use super::errors::{JobqError, Result};

struct StderrLogger {
    level: LevelFilter,
}

static LOGGER: OnceCell<StderrLogger> = OnceCell::new();

fn timestamp() -> String {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    if unsafe { libc::localtime_r(&now, &mut tm) }.is_null() {
        return String::from("????-??-?? ??:??:??");
    }
    format!(
        "{:0>4}-{:0>2}-{:0>2} {:0>2}:{:0>2}:{:0>2}",
        tm.tm_year + 1900, /* years since 1900 */
        tm.tm_mon + 1,     /* months since Jan: [0, 11] */
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

fn format_line(time: &str, thread: &str, record: &Record) -> String {
    format!(
        "{} {:<5} [{}] {}: {}",
        time,
        record.level(),
        thread,
        record.module_path().unwrap_or("unknown"),
        record.args()
    )
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let current = thread::current();
        let line = format_line(&timestamp(), current.name().unwrap_or("main"), record);
        // One write per line so lines of different workers never interleave.
        let _ = writeln!(io::stderr().lock(), "{}", line);
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| JobqError::InvalidConfig(format!("unknown log level '{}'", level)))
}

/// Installs the stderr logger. Only the first call in a process has effect.
pub fn init(level: LevelFilter) {
    let logger = LOGGER.get_or_init(|| StderrLogger { level: level });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.level);
    }
}
