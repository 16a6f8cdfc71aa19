use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Mutex, PoisonError},
    time::Instant,
};

use serde_json::{json, Value};

use crate::VmError;

#[derive(Debug, Clone)]
struct Event {
    category: String,
    name: String,
    start_us: u128,
    duration_us: u128,
    flops: Option<u64>,
}

/// Collects complete ("X") events in the Chrome tracing format. Shared by
/// concurrent runs, so events are kept behind a lock.
#[derive(Debug)]
pub struct ChromeTracing {
    origin: Instant,
    events: Mutex<Vec<Event>>,
}

/// Records one event spanning its own lifetime.
pub struct ScopedEvent<'a> {
    tracing: &'a ChromeTracing,
    category: &'static str,
    name: String,
    start: Instant,
    flops: Option<u64>,
}

impl ChromeTracing {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            events: Mutex::new(vec![]),
        }
    }

    pub fn scoped_event(
        &self,
        category: &'static str,
        name: impl Into<String>,
        flops: Option<u64>,
    ) -> ScopedEvent<'_> {
        ScopedEvent {
            tracing: self,
            category,
            name: name.into(),
            start: Instant::now(),
            flops,
        }
    }

    pub fn num_events(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn to_json(&self) -> Value {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let events = events
            .iter()
            .map(|e| {
                let mut event = json!({
                    "cat": e.category,
                    "name": e.name,
                    "ph": "X",
                    "ts": e.start_us as u64,
                    "dur": e.duration_us as u64,
                    "pid": 0,
                    "tid": 0,
                });
                if let Some(flops) = e.flops {
                    event["args"] = json!({ "flops": flops });
                }
                event
            })
            .collect::<Vec<_>>();
        json!({ "traceEvents": events })
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), VmError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &self.to_json())
            .map_err(|e| VmError::Message(format!("Failed to write trace: {e}").into()))?;
        writer.flush()?;
        Ok(())
    }
}

impl Default for ChromeTracing {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedEvent<'_> {
    fn drop(&mut self) {
        let event = Event {
            category: self.category.to_string(),
            name: std::mem::take(&mut self.name),
            start_us: self.start.duration_since(self.tracing.origin).as_micros(),
            duration_us: self.start.elapsed().as_micros(),
            flops: self.flops,
        };
        self.tracing
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[test]
fn scoped_events() {
    let tracing = ChromeTracing::new();
    {
        let _e = tracing.scoped_event("Op", "Add", Some(6));
        let _f = tracing.scoped_event("Run", "run", None);
    }
    assert_eq!(tracing.num_events(), 2);
    let json = tracing.to_json();
    let events = json["traceEvents"].as_array().unwrap();
    // Inner scopes drop first.
    assert_eq!(events[0]["name"], "run");
    assert_eq!(events[1]["name"], "Add");
    assert_eq!(events[1]["args"]["flops"], 6);
    assert_eq!(events[1]["ph"], "X");
    assert!(events[0].get("args").is_none());
}
