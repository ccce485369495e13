//! Level-gated logging into the debug ring.
//!
//! Macro family:
//!
//! | Macro | Release build | Filtered | Use |
//! |-------|--------------|----------|-----|
//! | [`mklog!`] | active (Debug/Trace compiled out) | yes | operational logging |
//! | [`mklog_always!`] | active | no | boot banner, lifecycle milestones |
//! | [`mkdbg!`] | compiled out | no | developer diagnostics |
//!
//! Messages land in the debug ring unconditionally and on the serial port
//! on bare metal. The hot path for a suppressed message is one relaxed
//! atomic load.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Severity, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

/// Sentinel: all filtered output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are kept.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Set the runtime filter.
#[inline]
pub fn set_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Suppress all filtered output. `mklog_always!` is unaffected.
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// True if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

struct Sink;

impl fmt::Write for Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::debug_ring::write(s.as_bytes());
        #[cfg(target_os = "none")]
        crate::serial::write(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // The ring absorbs everything; a format error cannot happen for a
    // ring sink, so the result is irrelevant.
    let _ = Sink.write_fmt(args);
}

/// Unconditional output: boot banner, per-PP lifecycle milestones.
#[macro_export]
macro_rules! mklog_always {
    () => {{
        $crate::log::_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Level-filtered output. `Debug` and `Trace` are additionally compiled out
/// in release builds.
#[macro_export]
macro_rules! mklog {
    (Error, $($arg:tt)+) => {{
        if $crate::log::enabled($crate::Level::Error) {
            $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::log::enabled($crate::Level::Warn) {
            $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::log::enabled($crate::Level::Info) {
            $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::log::enabled($crate::Level::Debug) {
            $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::log::enabled($crate::Level::Trace) {
            $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Debug-build-only print, never filtered. Compiled out in release.
#[macro_export]
macro_rules! mkdbg {
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log::_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_is_ordered() {
        set_level(Level::Warn);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        set_level(Level::Trace);
        assert!(enabled(Level::Trace));
    }

    #[test]
    fn messages_reach_the_ring() {
        set_level(Level::Trace);
        mklog_always!("ring probe {}", 42);
        let mut out = [0u8; 4096];
        let (n, _) = crate::debug_ring::drain(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert!(text.contains("ring probe 42"));
    }
}
