use std::env;
use std::fmt::Arguments;
use std::io::Write;

/// Severity of a log line. The maximum level that is actually written
/// is picked up once from the `KEYMUX_LOG` environment variable.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

lazy_static! {
    static ref MAX_LEVEL: LogLevel = init_level();
}

fn init_level() -> LogLevel {
    match env::var("KEYMUX_LOG") {
        Ok(val) => match val.as_str() {
            "fatal" => LogLevel::LogFatal,
            "error" => LogLevel::LogError,
            "warn" => LogLevel::LogWarn,
            "info" => LogLevel::LogInfo,
            "debug" => LogLevel::LogDebug,
            _ => LogLevel::LogWarn,
        },
        Err(_) => LogLevel::LogWarn,
    }
}

pub fn is_logging(level: LogLevel) -> bool {
    level <= *MAX_LEVEL
}

pub fn write_log(level: LogLevel, module: &str, args: Arguments) {
    let label = match level {
        LogLevel::LogFatal => "FATAL",
        LogLevel::LogError => "ERROR",
        LogLevel::LogWarn => "WARN",
        LogLevel::LogInfo => "INFO",
        LogLevel::LogDebug => "DEBUG",
    };
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    // A failed write to stderr is not something we can report.
    let _ = writeln!(handle, "[{} {}] {}", label, module, args);
}

macro_rules! log {
    ($level:expr, $($args:tt)+) => {
        if crate::log::is_logging($level) {
            crate::log::write_log($level, module_path!(), format_args!($($args)+));
        }
    };
}
