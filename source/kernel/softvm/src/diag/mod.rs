// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: structured logging and the fatal-error channel.

#[macro_use]
pub mod log;

use alloc::string::String;
use core::fmt::Write;

/// Reports a broken kernel invariant and halts.
///
/// The message is logged at error level first so it reaches the console even
/// when the panic path prints nothing useful.
#[cold]
pub fn fatal(args: core::fmt::Arguments<'_>) -> ! {
    let mut buffer = String::new();
    let _ = write!(buffer, "{args}");
    log_error!(target: "fatal", "{}", buffer);
    panic!("vm: {}", buffer);
}

/// Halts with a formatted message; see [`fatal`].
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)+) => {
        $crate::diag::fatal(format_args!($($arg)+))
    };
}

/// Halts unless the condition holds.
#[macro_export]
macro_rules! kassert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::diag::fatal(format_args!(concat!("assertion failed: ", stringify!($cond))));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::diag::fatal(format_args!($($arg)+));
        }
    };
}
