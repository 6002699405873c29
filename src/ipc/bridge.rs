//! JSON-line transport for the IPC types: events out on stdout, commands
//! in from a stdin reader thread.

use std::io::{self, BufRead, Write};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{VoiceCommand, VoiceEvent};
use crate::error::VoiceError;

/// Write one event as a single JSON line and flush.
pub fn write_event<W: Write>(out: &mut W, event: &VoiceEvent) -> io::Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Emit an event on stdout. A closed pipe is not an error worth reporting.
pub fn emit_event(event: &VoiceEvent) {
    if let Err(e) = write_event(&mut io::stdout().lock(), event) {
        debug!(error = %e, "Event not delivered");
    }
}

/// Error event without a category (bad input, unknown persona).
pub fn emit_error(message: &str) {
    emit_event(&VoiceEvent::Error {
        kind: None,
        message: message.to_string(),
    });
}

/// Error event for a pipeline failure.
pub fn emit_voice_error(err: &VoiceError) {
    emit_event(&VoiceEvent::Error {
        kind: Some(err.kind()),
        message: err.to_string(),
    });
}

/// Parse one command line. `{"type": ...}` is accepted in place of
/// `{"command": ...}`.
pub fn parse_command(line: &str) -> Result<VoiceCommand, serde_json::Error> {
    let mut value: Value = serde_json::from_str(line)?;
    if let Value::Object(obj) = &mut value {
        if !obj.contains_key("command") {
            if let Some(kind) = obj.remove("type") {
                obj.insert("command".into(), kind);
            }
        }
    }
    serde_json::from_value(value)
}

/// Forward every parseable line of `input` to `tx` until the input ends or
/// the receiver is gone. Bad lines are reported as error events.
pub fn read_commands<R: BufRead>(input: R, tx: &mpsc::UnboundedSender<VoiceCommand>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Command input failed");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_command(line) {
            Ok(cmd) => {
                debug!(?cmd, "Command received");
                if tx.send(cmd).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, input = line, "Rejected command");
                emit_error(&format!("Invalid JSON command: {e}"));
            }
        }
    }
}

/// Read commands from stdin on a dedicated thread. The channel closes when
/// the host closes stdin.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<VoiceCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        read_commands(io::stdin().lock(), &tx);
        debug!("stdin closed");
    });
    rx
}
