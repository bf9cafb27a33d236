//! Machine-readable command event side channel.
//!
//! The execution engine reports the start, completion and failure of each
//! devfile command through an [`EventSink`]. The sink is purely observational:
//! control flow never depends on it, and a sink that drops events cannot
//! affect a push. The JSON sink produces one serialized event per line for
//! consumption by a machine-readable CLI mode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// A lifecycle event of one devfile command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommandEvent {
    /// A command began executing in its container.
    #[serde(rename_all = "camelCase")]
    CommandStarted {
        /// Devfile command id.
        command_id: String,
        /// Alias of the container unit the command ran in.
        component_alias: String,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// A command finished; `exit_code` is zero on success.
    #[serde(rename_all = "camelCase")]
    CommandFinished {
        /// Devfile command id.
        command_id: String,
        /// Alias of the container unit the command ran in.
        component_alias: String,
        /// Remote process exit code.
        exit_code: i64,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// A command could not be executed (transport failure).
    #[serde(rename_all = "camelCase")]
    CommandErrored {
        /// Devfile command id.
        command_id: String,
        /// Alias of the container unit the command ran in.
        component_alias: String,
        /// Human-readable failure description.
        message: String,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
}

/// Receiver of command lifecycle events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Implementations must not block the caller for long.
    fn emit(&self, event: &CommandEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &CommandEvent) {}
}

/// Sink writing one JSON object per line to the wrapped writer.
pub struct JsonEventSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonEventSink<W> {
    /// Wrap a writer (typically stdout) for JSON-lines event output.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for JsonEventSink<W> {
    fn emit(&self, event: &CommandEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut writer) = self.writer.lock() {
            if writeln!(writer, "{}", line).is_err() {
                warn!("failed to write machine event");
            }
        }
    }
}

/// Sink forwarding events into a tokio channel.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<CommandEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommandEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &CommandEvent) {
        // A closed receiver means nobody is listening anymore.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> CommandEvent {
        CommandEvent::CommandStarted {
            command_id: "build".to_string(),
            component_alias: "runtime".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_json_sink_writes_one_line_per_event() {
        let sink = JsonEventSink::new(Vec::new());
        sink.emit(&started());
        sink.emit(&CommandEvent::CommandFinished {
            command_id: "build".to_string(),
            component_alias: "runtime".to_string(),
            exit_code: 0,
            timestamp: Utc::now(),
        });

        let buf = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"commandStarted\""));
        assert!(lines[1].contains("\"exitCode\":0"));
    }

    #[test]
    fn test_channel_sink_delivers_events() {
        let (sink, mut receiver) = ChannelEventSink::new();
        sink.emit(&started());
        let event = receiver.try_recv().unwrap();
        match event {
            CommandEvent::CommandStarted { command_id, .. } => assert_eq!(command_id, "build"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (sink, receiver) = ChannelEventSink::new();
        drop(receiver);
        sink.emit(&started());
    }
}
