//! In-memory tail of server log lines.
//!
//! [`LogBuffer`] is a `tracing_subscriber` layer installed next to the
//! formatting layer. Each event becomes one line formatted as
//! `[<rfc3339 ts>] [LEVEL] message key=value ...`.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Lines kept by default.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Shared bounded ring of formatted log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// Empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a preformatted line, evicting the oldest past capacity.
    pub fn push(&self, line: String) {
        let mut lines = self.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last `limit` lines, or, when `since` matches the timestamp prefix
    /// of a stored line, every line from the first such match onward.
    #[must_use]
    pub fn lines(&self, limit: usize, since: Option<&str>) -> Vec<String> {
        let lines = self.lock();
        if let Some(since) = since.filter(|since| !since.is_empty()) {
            let prefix = format!("[{since}");
            if let Some(idx) = lines.iter().position(|line| line.starts_with(&prefix)) {
                return lines.iter().skip(idx).cloned().collect();
            }
        }
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Number of stored lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been logged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

impl<S> Layer<S> for LogBuffer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let level = event.metadata().level();
        self.push(format!(
            "[{timestamp}] [{level}] {}{}",
            visitor.message, visitor.fields
        ));
    }
}
