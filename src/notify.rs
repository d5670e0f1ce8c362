//! Change Notifier / Error Reporter
//!
//! Caller-supplied hooks the engine calls back into:
//! - [`ErrorReporter`]: picks a [`RecoverStrategy`] when a store fails its
//!   integrity checks on load
//! - [`ContentChangeListener`]: told when another process changed a shared
//!   store
//! - [`LogHandler`]: receives engine log lines instead of `tracing`
//!
//! A [`Handlers`] table is owned by the [`Registry`](crate::Registry) and
//! shared with every store it opens. It holds at most one hook of each kind;
//! registering replaces the previous hook, unregistering disables the path.
//! Run one registry per process so that there is exactly one of each.
//!
//! Hooks run synchronously on the caller's thread. The error reporter runs
//! while the store's lock is held and must not call back into that store.
//! Hooks may call into the registry, including while it is opening a store.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::LogLevel;

/// Kind of integrity failure found while loading a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Content CRC does not match the meta file
    CrcCheckFail,

    /// Recorded content size does not fit in the data file
    FileLength,
}

/// What to do with a store that failed its integrity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverStrategy {
    /// Drop the content and start empty
    Discard,

    /// Keep the longest run of well-formed records and rewrite the file
    Recover,
}

impl RecoverStrategy {
    /// Map a raw strategy code; anything unrecognized (including -1) is `Discard`
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => RecoverStrategy::Recover,
            _ => RecoverStrategy::Discard,
        }
    }
}

/// Chooses a recovery strategy for a failed store
pub trait ErrorReporter: Send + Sync {
    fn on_error(&self, mmap_id: &str, kind: ErrorType) -> RecoverStrategy;
}

impl<F> ErrorReporter for F
where
    F: Fn(&str, ErrorType) -> RecoverStrategy + Send + Sync,
{
    fn on_error(&self, mmap_id: &str, kind: ErrorType) -> RecoverStrategy {
        self(mmap_id, kind)
    }
}

/// Advisory notice that another process changed a store
pub trait ContentChangeListener: Send + Sync {
    fn on_content_changed(&self, mmap_id: &str);
}

impl<F> ContentChangeListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_content_changed(&self, mmap_id: &str) {
        self(mmap_id)
    }
}

/// Receives redirected engine log lines
pub trait LogHandler: Send + Sync {
    fn log(&self, level: LogLevel, file: &str, line: u32, function: &str, message: &str);
}

impl<F> LogHandler for F
where
    F: Fn(LogLevel, &str, u32, &str, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, file: &str, line: u32, function: &str, message: &str) {
        self(level, file, line, function, message)
    }
}

/// Hook table shared by a registry and its stores
pub struct Handlers {
    error: RwLock<Option<Arc<dyn ErrorReporter>>>,
    content: RwLock<Option<Arc<dyn ContentChangeListener>>>,
    log: RwLock<Option<Arc<dyn LogHandler>>>,
    level: AtomicU8,
}

impl Handlers {
    pub fn new(level: LogLevel) -> Self {
        Self {
            error: RwLock::new(None),
            content: RwLock::new(None),
            log: RwLock::new(None),
            level: AtomicU8::new(level as u8),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn set_error_reporter(&self, reporter: Option<Arc<dyn ErrorReporter>>) {
        *self.error.write() = reporter;
    }

    pub fn set_content_listener(&self, listener: Option<Arc<dyn ContentChangeListener>>) {
        *self.content.write() = listener;
    }

    pub fn set_log_handler(&self, handler: Option<Arc<dyn LogHandler>>) {
        *self.log.write() = handler;
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Ask the reporter what to do; `Discard` when none is registered
    pub fn report_error(&self, mmap_id: &str, kind: ErrorType) -> RecoverStrategy {
        // Clone out so the reporter runs without the table lock
        let reporter = self.error.read().clone();
        match reporter {
            Some(r) => r.on_error(mmap_id, kind),
            None => RecoverStrategy::Discard,
        }
    }

    pub fn notify_content_changed(&self, mmap_id: &str) {
        let listener = self.content.read().clone();
        if let Some(l) = listener {
            l.on_content_changed(mmap_id);
        }
    }

    /// Emit one engine log line. Use the `kv_log!` macro rather than calling
    /// this directly.
    pub fn log(
        &self,
        level: LogLevel,
        file: &str,
        line: u32,
        function: &str,
        args: fmt::Arguments<'_>,
    ) {
        let threshold = self.log_level();
        if threshold == LogLevel::None || level < threshold {
            return;
        }

        let handler = self.log.read().clone();
        if let Some(h) = handler {
            h.log(level, file, line, function, &args.to_string());
            return;
        }

        match level {
            LogLevel::Debug => tracing::debug!(target: "mapkv", "{}", args),
            LogLevel::Info => tracing::info!(target: "mapkv", "{}", args),
            LogLevel::Warning => tracing::warn!(target: "mapkv", "{}", args),
            LogLevel::Error => tracing::error!(target: "mapkv", "{}", args),
            LogLevel::None => {}
        }
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("error", &self.error.read().is_some())
            .field("content", &self.content.read().is_some())
            .field("log", &self.log.read().is_some())
            .field("level", &self.log_level())
            .finish()
    }
}

/// Log through a [`Handlers`] table: `kv_log!(handlers, Warning, "...", args)`
macro_rules! kv_log {
    ($handlers:expr, $level:ident, $($arg:tt)+) => {
        $handlers.log(
            $crate::config::LogLevel::$level,
            file!(),
            line!(),
            module_path!(),
            format_args!($($arg)+),
        )
    };
}
