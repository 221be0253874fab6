// Event sinks for the experiment events logger

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};

use crate::pt_interface::{Event, EventSink};

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::DiscoveryPhaseCompleted { .. } => "discovery_phase_completed",
        Event::DiscoveryTimedOut { .. } => "discovery_timed_out",
        Event::ExperimentStarted { .. } => "experiment_started",
        Event::ExperimentStopping { .. } => "experiment_stopping",
        Event::ExperimentReported { .. } => "experiment_reported",
    }
}

fn event_detail(event: &Event) -> String {
    match event {
        Event::DiscoveryPhaseCompleted { phase, elapsed } => {
            format!("phase={} elapsed_ms={}", phase, elapsed.as_millis())
        }
        Event::DiscoveryTimedOut { phase, missing } => format!("phase={} missing={}", phase, missing),
        Event::ExperimentStarted {
            participants,
            degraded,
        } => format!("participants={} degraded={}", participants, degraded),
        Event::ExperimentStopping { elapsed } => format!("elapsed_ms={}", elapsed.as_millis()),
        Event::ExperimentReported { participants } => format!("participants={}", participants),
    }
}

// ============================================================================
// Console Logging Sink
// ============================================================================

/// Forwards events to the `log` facade at info level
pub struct ConsoleEventSink {
    enabled: bool,
}

impl ConsoleEventSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl EventSink for ConsoleEventSink {
    fn log(&mut self, elapsed: Duration, event: Event) {
        if !self.enabled {
            return;
        }

        info!(
            "{:>8}ms {:<26} {}",
            elapsed.as_millis(),
            event_name(&event),
            event_detail(&event)
        );
    }
}

// ============================================================================
// CSV Event Sink
// ============================================================================

/// One row per event: `time_ms,event,detail`
pub struct CsvEventSink {
    writer: BufWriter<File>,
}

impl CsvEventSink {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "time_ms,event,detail")?;

        Ok(Self { writer })
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl EventSink for CsvEventSink {
    fn log(&mut self, elapsed: Duration, event: Event) {
        let result = writeln!(
            self.writer,
            "{},{},{}",
            elapsed.as_millis(),
            event_name(&event),
            event_detail(&event)
        );

        if let Err(e) = result {
            warn!("failed to write event to CSV: {}", e);
        }
    }
}

impl Drop for CsvEventSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

// ============================================================================
// Collector Event Sink (In-Memory)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub elapsed: Duration,
    pub event: Event,
}

/// Collects events in memory. Clones share the same buffer, so one clone can
/// be handed to a `System` while the other is inspected afterwards.
#[derive(Clone, Default)]
pub struct CollectorEventSink {
    events: Rc<RefCell<Vec<EventRecord>>>,
}

impl CollectorEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.borrow().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.borrow().iter().map(|r| event_name(&r.event)).collect()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl EventSink for CollectorEventSink {
    fn log(&mut self, elapsed: Duration, event: Event) {
        self.events.borrow_mut().push(EventRecord { elapsed, event });
    }
}

// ============================================================================
// Multi Sink (Combine Multiple Sinks)
// ============================================================================

#[derive(Default)]
pub struct MultiEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for MultiEventSink {
    fn log(&mut self, elapsed: Duration, event: Event) {
        for sink in &mut self.sinks {
            sink.log(elapsed, event.clone());
        }
    }
}
