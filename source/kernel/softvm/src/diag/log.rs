// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-mm-team
//! PUBLIC API: log_* macros, emit(level,target,args), install_console()
//! DEPENDS_ON: an installed Console (the kernel UART, or a test capture)
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission;
//!             records are dropped while no console is installed

use alloc::string::String;
use core::fmt::{Arguments, Write};

use spin::Mutex;

/// Logging severity used by the VM subsystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Line-oriented output device receiving formatted log records.
pub trait Console: Sync {
    /// Writes one complete record, without the trailing newline.
    fn write_line(&self, line: &str);
}

static CONSOLE: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

/// Routes all subsequent records to `console`, replacing any previous one.
pub fn install_console(console: &'static dyn Console) {
    *CONSOLE.lock() = Some(console);
}

/// Detaches the current console; records are dropped afterwards.
pub fn remove_console() {
    *CONSOLE.lock() = None;
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    let console = match *CONSOLE.lock() {
        Some(console) => console,
        None => return,
    };

    let mut line = String::new();
    let _ = write!(line, "[{} {}] ", level.tag(), target);
    let _ = line.write_fmt(args);
    console.write_line(&line);
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{boxed::Box, vec::Vec};

    struct Capture(Mutex<Vec<String>>);

    impl Console for Capture {
        fn write_line(&self, line: &str) {
            self.0.lock().push(String::from(line));
        }
    }

    #[test]
    fn records_carry_level_and_target() {
        let capture: &'static Capture = Box::leak(Box::new(Capture(Mutex::new(Vec::new()))));
        install_console(capture);
        log_warn!(target: "log-selftest", "frames left: {}", 3);
        remove_console();
        log_warn!(target: "log-selftest", "dropped");

        let lines = capture.0.lock();
        assert!(lines.iter().any(|l| l == "[WARN log-selftest] frames left: 3"));
        assert!(!lines.iter().any(|l| l.ends_with("dropped")));
    }
}
