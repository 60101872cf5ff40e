use owo_colors::OwoColorize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl Level {
    fn parse(s: &str) -> Option<Level> {
        match s.to_uppercase().as_str() {
            "ERROR" => Some(Level::Error),
            "WARN" | "WARNING" => Some(Level::Warn),
            "INFO" => Some(Level::Info),
            "DEBUG" => Some(Level::Debug),
            _ => None,
        }
    }
}

static LEVEL: OnceLock<Level> = OnceLock::new();

/// Reads `LOG_LEVEL` once and caches it; unrecognised values fall back to
/// `INFO` with a one-time warning.
pub fn level() -> Level {
    *LEVEL.get_or_init(|| match std::env::var("LOG_LEVEL") {
        Ok(raw) => Level::parse(&raw).unwrap_or_else(|| {
            eprintln!(
                "{}",
                format!("⚠️  unrecognised LOG_LEVEL={raw:?}, defaulting to INFO").yellow()
            );
            Level::Info
        }),
        Err(_) => Level::Info,
    })
}

pub fn enabled(l: Level) -> bool {
    l <= level()
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        use owo_colors::OwoColorize;
        if $crate::util::log::enabled($crate::util::log::Level::Error) {
            eprintln!("{} {}", "❌".red(), format!($($arg)*).red());
        }
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        use owo_colors::OwoColorize;
        if $crate::util::log::enabled($crate::util::log::Level::Warn) {
            eprintln!("{} {}", "⚠️".yellow(), format!($($arg)*).yellow());
        }
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        use owo_colors::OwoColorize;
        if $crate::util::log::enabled($crate::util::log::Level::Info) {
            println!("{} {}", "🔧".cyan(), format!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        use owo_colors::OwoColorize;
        if $crate::util::log::enabled($crate::util::log::Level::Debug) {
            println!("{} {}", "•".dimmed(), format!($($arg)*).dimmed());
        }
    }};
}
