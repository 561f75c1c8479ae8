//! Logging initialization and the in-memory console sink.
//!
//! Everything the engine reports goes through `tracing`. The optional
//! [`ConsoleLayer`] keeps the most recent warnings and errors in a bounded
//! [`ConsoleLog`] so an on-screen debug console can show shader compile
//! failures and validation messages without scraping stdout.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::{EnvFilter, prelude::*};

const DEFAULT_FILTER: &str = "info,lumen=debug,naga=warn";

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - A formatted stdout layer with targets and thread ids
///
/// # Example
/// ```
/// lumen_core::init_logging();
/// tracing::info!("Renderer initialized");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber_fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Same as [`init_logging`], plus a console sink holding the last `capacity`
/// warnings and errors.
pub fn init_logging_with_console(capacity: usize) -> ConsoleLog {
    let console = ConsoleLog::new(capacity);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber_fmt::layer().with_target(true).with_thread_ids(true))
        .with(ConsoleLayer::new(console.clone(), Level::WARN))
        .init();

    console
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.target, self.message)
    }
}

/// Bounded, shareable buffer of recent log lines.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    lines: Arc<Mutex<VecDeque<ConsoleLine>>>,
    capacity: usize,
}

impl ConsoleLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ConsoleLine>> {
        // A panic while holding the lock leaves the deque intact.
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, line: ConsoleLine) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of the buffered lines, oldest first.
    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.lock().iter().cloned().collect()
    }

    /// Returns true if any buffered line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|line| line.message.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// `tracing-subscriber` layer feeding a [`ConsoleLog`].
pub struct ConsoleLayer {
    log: ConsoleLog,
    max_level: Level,
}

impl ConsoleLayer {
    /// Captures events at `max_level` or more severe.
    pub fn new(log: ConsoleLog, max_level: Level) -> Self {
        Self { log, max_level }
    }
}

impl<S: Subscriber> Layer<S> for ConsoleLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater.
        if *metadata.level() > self.max_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            message.push_str(&visitor.fields);
        }

        self.log.push(ConsoleLine {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(max_level: Level, f: impl FnOnce()) -> ConsoleLog {
        let log = ConsoleLog::new(8);
        let subscriber =
            tracing_subscriber::registry().with(ConsoleLayer::new(log.clone(), max_level));
        tracing::subscriber::with_default(subscriber, f);
        log
    }

    #[test]
    fn test_console_layer_captures_warnings_and_errors() {
        let log = capture(Level::WARN, || {
            tracing::info!("ignored");
            tracing::warn!("watch out");
            tracing::error!(shader = "blit", "compile failed");
        });

        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].level, Level::WARN);
        assert_eq!(lines[0].message, "watch out");
        assert_eq!(lines[1].level, Level::ERROR);
        assert!(lines[1].message.starts_with("compile failed"));
        assert!(lines[1].message.contains("shader=blit"));
    }

    #[test]
    fn test_console_log_is_bounded() {
        let log = ConsoleLog::new(2);
        for i in 0..5 {
            log.push(ConsoleLine {
                level: Level::WARN,
                target: "test".into(),
                message: format!("line {}", i),
            });
        }
        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "line 3");
        assert_eq!(lines[1].message, "line 4");
        assert!(log.contains("line 4"));
        assert!(!log.contains("line 0"));
    }

    #[test]
    fn test_console_line_display() {
        let line = ConsoleLine {
            level: Level::ERROR,
            target: "lumen_rhi::shader".into(),
            message: "bad".into(),
        };
        assert_eq!(line.to_string(), "[ERROR] lumen_rhi::shader: bad");
    }
}
