//! Append-only file log for the orchestrator.
//!
//! - ERROR: a task needs human attention (parked after a failure, merge aborted)
//! - WARN: recoverable trouble (ambiguous agent output, retries, prune failures)
//! - INFO: board transitions, admissions, merges
//! - DEBUG: git and process traces
//! - TRACE: agent transcript lines
//!
//! The threshold is INFO unless `--debug` is passed or `LANEKEEPER_LOG` names
//! a level (`LANEKEEPER_LOG=trace`). Nothing is written before [`init`] or
//! [`init_at`] picks a file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

pub const LOG_ENV: &str = "LANEKEEPER_LOG";

static SINK: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim();
        LogLevel::ALL
            .into_iter()
            .find(|level| level.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown log level '{}'", wanted))
    }
}

/// Threshold from the `--debug` flag and the raw `LANEKEEPER_LOG` value.
/// An explicit level wins; `1`/`true` mean DEBUG like the flag.
pub fn resolve_level(debug_flag: bool, env_value: Option<&str>) -> LogLevel {
    let from_env = env_value.and_then(|value| match value.trim() {
        "1" => Some(LogLevel::Debug),
        v if v.eq_ignore_ascii_case("true") => Some(LogLevel::Debug),
        v => v.parse().ok(),
    });
    match from_env {
        Some(level) => level,
        None if debug_flag => LogLevel::Debug,
        None => LogLevel::Info,
    }
}

/// Log to `~/.lanekeeper/lanekeeper.log`.
pub fn init(debug: bool) {
    let Some(dir) = dirs::home_dir().map(|home| home.join(".lanekeeper")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_ok() {
        init_at(&dir.join("lanekeeper.log"), debug);
    }
}

/// Log to `path`, truncating it. Only the first call picks the file.
pub fn init_at(path: &Path, debug: bool) {
    let env_value = std::env::var(LOG_ENV).ok();
    set_level(resolve_level(debug, env_value.as_deref()));
    if SINK.set(path.to_path_buf()).is_ok() {
        let _ = std::fs::write(path, "");
    }
}

pub fn set_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::SeqCst);
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

pub fn write(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = SINK.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(
            file,
            "{} {:<5} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.label(),
            msg
        );
    }
}

/// INFO.
#[macro_export]
macro_rules! llog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! llog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! llog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Skips formatting entirely below the threshold.
#[macro_export]
macro_rules! llog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::write($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! llog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::write($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
