//! Capture `tracing` events so tests can assert on what was logged.
use std::{collections::BTreeMap, fmt, sync::Arc};

use observability_deps::tracing::{
    self, Event, Metadata, Subscriber,
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    subscriber::DefaultGuard,
};
use parking_lot::Mutex;

/// One captured event, as `field name -> rendered value`.
///
/// The event level is stored under `level` and the message under `message`.
pub type LogLine = BTreeMap<String, String>;

type SharedLines = Arc<Mutex<Vec<LogLine>>>;

/// Captures every event emitted on the current thread while it is alive.
///
/// Upon creation it registers itself as the thread-local default
/// subscriber; the previous default is restored on drop.
pub struct TracingCapture {
    lines: SharedLines,
    _guard: DefaultGuard,
}

impl fmt::Debug for TracingCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingCapture")
            .field("lines", &self.lines.lock().len())
            .finish_non_exhaustive()
    }
}

impl TracingCapture {
    /// Create a new capture and register it for the current thread.
    #[expect(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        let lines = SharedLines::default();
        let subscriber = CaptureSubscriber {
            lines: Arc::clone(&lines),
        };
        let _guard = tracing::subscriber::set_default(subscriber);

        Self { lines, _guard }
    }

    /// All lines captured so far.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// Captured lines whose `message` equals `message`.
    pub fn lines_with_message(&self, message: &str) -> Vec<LogLine> {
        self.lines()
            .into_iter()
            .filter(|line| line.get("message").map(String::as_str) == Some(message))
            .collect()
    }
}

impl fmt::Display for TracingCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            for (k, v) in line {
                write!(f, "{k} = {v}; ")?;
            }
        }
        Ok(())
    }
}

struct CaptureSubscriber {
    lines: SharedLines,
}

impl Subscriber for CaptureSubscriber {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = LineVisitor::default();
        visitor
            .line
            .insert("level".to_owned(), event.metadata().level().to_string());
        event.record(&mut visitor);
        self.lines.lock().push(visitor.line);
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

#[derive(Debug, Default)]
struct LineVisitor {
    line: LogLine,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.line.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.line
            .insert(field.name().to_owned(), format!("{value:?}"));
    }
}
