// src/logger.rs
//
// House logging: a global level filter plus an optional file sink,
// mirrored by a small macro so call sites read like plain log statements.

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    sync::{Mutex, RwLock},
};

lazy_static::lazy_static! {
    static ref CURRENT_LOG_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

pub fn set_log_level(level: LogLevel) {
    let mut log_level = CURRENT_LOG_LEVEL.write().unwrap();
    *log_level = level;
}

pub fn get_log_level() -> LogLevel {
    *CURRENT_LOG_LEVEL.read().unwrap()
}

/// Opens (creating/appending) the log file sink used alongside stdout.
/// Call once at startup; a failure to open is logged to stdout and the
/// sink stays disabled rather than aborting the daemon.
pub fn set_log_file(path: &str) {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => *LOG_FILE.lock().unwrap() = Some(file),
        Err(err) => println!("[{}]: failed to open log file {}: {}", LogLevel::Error, path, err),
    }
}

#[doc(hidden)]
pub fn write_line(level: LogLevel, line: &str) {
    let stamped = format!("[{}]: {}", level, line);
    println!("{}", stamped);
    if let Some(file) = LOG_FILE.lock().unwrap().as_mut() {
        let plain = format!("[{:?}]: {}\n", level, line);
        let _ = file.write_all(plain.as_bytes());
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        {
            let current_level = $crate::logger::get_log_level();
            if $level <= current_level {
                $crate::logger::write_line($level, &format!($($arg)*));
            }
        }
    };
}

#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Eq, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log_str = match self {
            LogLevel::Error => "Error".bold().red(),
            LogLevel::Warn => "Warn".bold().yellow(),
            LogLevel::Info => "Info".bold().green(),
            LogLevel::Debug => "Debug".bold().blue(),
            LogLevel::Trace => "Trace".bold().magenta(),
        };
        write!(f, "{}", log_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_matches_verbosity() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn default_level_is_info() {
        assert_eq!(get_log_level(), LogLevel::Info);
    }
}
