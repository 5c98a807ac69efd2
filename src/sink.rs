use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    io::{self, Write},
    sync::Mutex,
};

use crate::protocol::TelemetryEvent;

/// ASCII bell, rendered by most terminals as an audible beep
pub const BELL: &str = "\x07";

/// Presentation side of the client
///
/// Implementations are called from the notification path and must return
/// promptly. They report nothing back: a sink that fails to write swallows
/// the error so the session keeps running.
pub trait EventSink: Send + Sync {
    /// Present a decoded event
    fn emit(&self, event: &TelemetryEvent, timestamp: DateTime<Local>);

    /// Raise the external alert; called only for wet alerts
    fn alert(&self, event: &TelemetryEvent);

    /// Present a lifecycle notice (connected, subscribed, link lost...)
    fn notice(&self, _message: &str) {}
}

/// Human-readable terminal output
pub struct ConsoleSink<W: Write + Send = io::Stdout> {
    out: Mutex<W>,
    bell: bool,
}

impl ConsoleSink {
    /// Console sink on standard output with the audible bell enabled
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout(), true)
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    /// Create a console sink over any writer
    pub const fn new(out: W, bell: bool) -> Self {
        Self {
            out: Mutex::new(out),
            bell,
        }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

impl<W: Write + Send> EventSink for ConsoleSink<W> {
    fn emit(&self, event: &TelemetryEvent, timestamp: DateTime<Local>) {
        self.write_line(&format!("[{}] {event}", timestamp.format("%H:%M:%S")));
    }

    fn alert(&self, _event: &TelemetryEvent) {
        let bell = if self.bell { BELL } else { "" };
        self.write_line(&format!("🚨 WET ALERT DETECTED! 🚨{bell}"));
    }

    fn notice(&self, message: &str) {
        self.write_line(message);
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: String,
    alert: bool,
    event: &'a TelemetryEvent,
}

/// One JSON object per event, for piping into other tools
///
/// Lifecycle notices go to standard error so the event stream stays clean.
pub struct JsonLinesSink<W: Write + Send = io::Stdout> {
    out: Mutex<W>,
}

impl JsonLinesSink {
    /// JSON sink on standard output
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Create a JSON sink over any writer
    pub const fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &TelemetryEvent, timestamp: DateTime<Local>) {
        let record = JsonRecord {
            timestamp: timestamp.to_rfc3339(),
            alert: event.is_alert(),
            event,
        };
        if let (Ok(line), Ok(mut out)) = (serde_json::to_string(&record), self.out.lock()) {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }

    fn alert(&self, _event: &TelemetryEvent) {
        let _ = write!(io::stderr(), "{BELL}");
    }

    fn notice(&self, message: &str) {
        let _ = writeln!(io::stderr(), "{message}");
    }
}
