//! Progress events emitted while a migration runs.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Stage of the run an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Introspection,
    Schema,
    Constraints,
    Transfer,
    Routines,
    Finished,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Introspection => "introspection",
            Phase::Schema => "schema",
            Phase::Constraints => "constraints",
            Phase::Transfer => "transfer",
            Phase::Routines => "routines",
            Phase::Finished => "finished",
        }
    }
}

/// Completed versus expected units (rows for transfers, items otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counters {
    pub done: u64,
    pub total: u64,
}

/// Progress update for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Table, constraint or routine the event concerns.
    pub item: String,
    pub phase: Phase,
    pub counters: Counters,
}

impl ProgressEvent {
    pub fn new(item: impl Into<String>, phase: Phase, done: u64, total: u64) -> Self {
        Self {
            item: item.into(),
            phase,
            counters: Counters { done, total },
        }
    }
}

/// Receives progress events. Called inline, so implementations should return
/// quickly.
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Logs each event at INFO.
#[derive(Debug, Default)]
pub struct TracingListener;

impl ProgressListener for TracingListener {
    fn on_event(&self, event: &ProgressEvent) {
        info!(
            phase = event.phase.as_str(),
            done = event.counters.done,
            total = event.counters.total,
            "{}: progress",
            event.item
        );
    }
}

/// Writes each event as one JSON line.
pub struct JsonLinesListener {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesListener {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }
}

impl ProgressListener for JsonLinesListener {
    fn on_event(&self, event: &ProgressEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            // Progress output is best-effort.
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_json_lines_listener() {
        let buf = SharedBuf::default();
        let listener = JsonLinesListener::new(Box::new(buf.clone()));
        listener.on_event(&ProgressEvent::new("dbo.orders", Phase::Transfer, 1000, 2500));
        listener.on_event(&ProgressEvent::new("dbo.orders", Phase::Transfer, 2000, 2500));

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"item":"dbo.orders","phase":"transfer","counters":{"done":1000,"total":2500}}"#
        );
    }
}
