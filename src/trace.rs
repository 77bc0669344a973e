//! Execution trace sink.
//!
//! While recording is enabled every job slice contributes a begin and an
//! end event tagged with the worker index and the job's `(type, id)` pair.
//! Flushing serializes the whole stream into the Chrome-tracing JSON
//! dialect (`{"traceEvents": [...]}`), readable in `chrome://tracing` or
//! Perfetto. Disabling the sink flushes, as does scheduler teardown.

use crate::job::Tags;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to write trace file")]
    Io(#[from] std::io::Error),

    #[error("failed to encode trace events")]
    Encode(#[from] serde_json::Error),
}

/// One recorded job slice.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Span {
    pub(crate) worker: usize,
    pub(crate) begin_us: u64,
    pub(crate) end_us: u64,
    pub(crate) tags: Tags,
}

pub(crate) struct TraceSink {
    enabled: AtomicBool,
    epoch: Instant,
    path: PathBuf,
    /// One buffer per worker; each is only ever locked by its own worker
    /// and, transiently, by a flush.
    buffers: Box<[Mutex<Vec<Span>>]>,
    names: Mutex<HashMap<i32, String>>,
}

impl TraceSink {
    pub(crate) fn new(workers: usize, path: PathBuf) -> TraceSink {
        TraceSink {
            enabled: AtomicBool::new(false),
            epoch: Instant::now(),
            path,
            buffers: (0..workers).map(|_| Mutex::new(Vec::new())).collect(),
            names: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Stops recording and flushes what was captured.
    pub(crate) fn disable(&self) -> Result<(), TraceError> {
        self.enabled.store(false, Ordering::Release);
        self.flush()
    }

    /// Microseconds since the sink was created.
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub(crate) fn record(&self, worker: usize, begin_us: u64, end_us: u64, tags: Tags) {
        debug_assert!(worker < self.buffers.len());
        self.buffers[worker].lock().push(Span {
            worker,
            begin_us,
            end_us,
            tags,
        });
    }

    /// Registers a display name for a tag type, like the `types` table the
    /// trace viewer groups events by.
    pub(crate) fn name_type(&self, ty: i32, name: impl Into<String>) {
        self.names.lock().insert(ty, name.into());
    }

    pub(crate) fn flush_if_enabled(&self) -> Result<(), TraceError> {
        if self.enabled() { self.flush() } else { Ok(()) }
    }

    pub(crate) fn flush(&self) -> Result<(), TraceError> {
        let mut spans: Vec<Span> = Vec::new();
        for buffer in self.buffers.iter() {
            spans.append(&mut buffer.lock());
        }
        spans.sort_by_key(|s| s.begin_us);

        let names = self.names.lock();
        let mut events = Vec::with_capacity(spans.len() * 2);
        for span in &spans {
            let name = names
                .get(&span.tags.ty)
                .cloned()
                .unwrap_or_else(|| format!("type-{}", span.tags.ty));
            events.push(TraceEvent {
                name,
                cat: "job",
                ph: "B",
                pid: 0,
                tid: span.worker,
                ts: span.begin_us,
                args: Some(EventArgs {
                    ty: span.tags.ty,
                    id: span.tags.id,
                }),
            });
            events.push(TraceEvent {
                name: String::new(),
                cat: "job",
                ph: "E",
                pid: 0,
                tid: span.worker,
                ts: span.end_us,
                args: None,
            });
        }

        let file = File::create(&self.path)?;
        serde_json::to_writer(BufWriter::new(file), &TraceFile { trace_events: events })?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn spans(&self) -> Vec<Span> {
        self.buffers.iter().flat_map(|b| b.lock().clone()).collect()
    }
}

#[derive(Serialize)]
struct TraceFile {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<TraceEvent>,
}

#[derive(Serialize)]
struct TraceEvent {
    name: String,
    cat: &'static str,
    ph: &'static str,
    pid: u32,
    tid: usize,
    ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<EventArgs>,
}

#[derive(Serialize)]
struct EventArgs {
    #[serde(rename = "type")]
    ty: i32,
    id: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("magpie-{}-{}.json", tag, std::process::id()))
    }

    #[test]
    fn flush_writes_chrome_tracing_dialect() {
        let path = temp_path("sink");
        let sink = TraceSink::new(2, path.clone());
        sink.enable();
        sink.record(0, 10, 20, Tags::new(1, 100));
        sink.record(1, 15, 30, Tags::new(2, 200));
        sink.name_type(1, "driver");
        sink.disable().unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let events = parsed["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["ph"], "B");
        assert_eq!(events[0]["name"], "driver");
        assert_eq!(events[0]["args"]["type"], 1);
        assert_eq!(events[1]["ph"], "E");
        assert_eq!(events[2]["name"], "type-2");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn flush_drains_the_buffers() {
        let path = temp_path("drain");
        let sink = TraceSink::new(1, path.clone());
        sink.record(0, 1, 2, Tags::NONE);
        sink.flush().unwrap();
        assert!(sink.spans().is_empty());
        std::fs::remove_file(path).ok();
    }
}
