// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (level gating, line format)
//! PUBLIC API: log_* macros, emit(level,target,args), set_sink(), LogSink
//! DEPENDS_ON: spin::Mutex (sink registration)
//! INVARIANTS: Debug/Trace only in debug builds or with `debug_log`; single-line emission;
//!             never called from the NMI path
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt::{self, Arguments, Write};

use spin::Mutex;

/// Logging severity used by the kernel.
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
            Level::Debug | Level::Trace => cfg!(any(debug_assertions, feature = "debug_log")),
            _ => true,
        }
    }
}

/// Destination for log lines (UART on hardware, a buffer in tests).
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

static SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);

/// Installs the log destination. Lines emitted before this are dropped.
pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

struct SinkWriter(&'static dyn LogSink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    // Copy the sink out so a slow sink never runs under the registration lock.
    let Some(sink) = *SINK.lock() else {
        return;
    };
    let mut writer = SinkWriter(sink);
    let _ = write_line(&mut writer, level, target, args);
}

fn write_line<W: Write>(
    w: &mut W,
    level: Level,
    target: &str,
    args: Arguments<'_>,
) -> fmt::Result {
    write!(w, "[{} {}] ", level.tag(), target)?;
    w.write_fmt(args)?;
    w.write_char('\n')
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit(
            $crate::diag::log::Level::Error,
            module_path!(),
            format_args!($($arg)+),
        );
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit(
            $crate::diag::log::Level::Warn,
            module_path!(),
            format_args!($($arg)+),
        );
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit(
            $crate::diag::log::Level::Info,
            module_path!(),
            format_args!($($arg)+),
        );
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit(
            $crate::diag::log::Level::Debug,
            module_path!(),
            format_args!($($arg)+),
        );
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit(
            $crate::diag::log::Level::Trace,
            module_path!(),
            format_args!($($arg)+),
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn line_format_has_level_and_target() {
        let mut out = String::new();
        write_line(&mut out, Level::Warn, "ec", format_args!("killed {}", 7)).unwrap();
        assert_eq!(out, "[WARN ec] killed 7\n");
    }

    #[test]
    fn error_and_info_always_enabled() {
        assert!(Level::Error.enabled());
        assert!(Level::Info.enabled());
    }
}
