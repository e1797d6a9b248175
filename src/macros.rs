// src/macros.rs

//! Internal logging macros.
//!
//! With the `logging` feature each macro emits a `tracing` event under the
//! `mom_broker` target. Without it, warnings and errors still go to stderr
//! since the default reporter speaks through them; info and debug only
//! type-check their arguments.

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_event {
    ($level:ident, $($arg:tt)*) => {
        tracing::event!(target: "mom_broker", tracing::Level::$level, $($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_event {
    (ERROR, $($arg:tt)*) => {
        eprintln!("[mom_broker] ERROR {}", format_args!($($arg)*))
    };
    (WARN, $($arg:tt)*) => {
        eprintln!("[mom_broker] WARN {}", format_args!($($arg)*))
    };
    ($level:ident, $($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::macros::log_event!(ERROR, $($arg)*)
    };
}

macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::macros::log_event!(WARN, $($arg)*)
    };
}

macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::macros::log_event!(INFO, $($arg)*)
    };
}

macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::macros::log_event!(DEBUG, $($arg)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_event;
pub(crate) use log_info;
pub(crate) use log_warn;
