//! Structured operational logging for synjoin.
//!
//! Provides a [`Logger`] that writes events to stderr and optionally to a log
//! file. Stdout is reserved for the classified-flow stream, so nothing in here
//! ever touches it. Output is either human-readable plain text or
//! newline-delimited JSON (NDJSON); both carry a timestamp and the process ID.

use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct operational events synjoin can log.
///
/// The `#[serde(tag = "event")]` attribute puts an `"event"` key in JSON output
/// so consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Informational startup / status message.
    Info { message: &'a str },

    /// Non-fatal configuration or runtime warning.
    Warning { message: &'a str },

    /// A worker thread entered its main loop.
    WorkerStarted { worker: &'a str, detail: &'a str },

    /// An input line could not be parsed and was dropped.
    MalformedRecord {
        source: &'a str,
        error:  &'a str,
        length: usize,
        data:   &'a str,
    },

    /// A record replaced a pending one with the same flow ID.
    DuplicateFlow { source: &'a str, flow_id: &'a str },

    /// An input source returned end-of-file.
    SourceClosed { source: &'a str },

    /// A conntrack output row did not have the expected shape.
    MalformedConntrackRow { row: &'a str },

    /// The conntrack tool could not be run.
    ConntrackUnavailable { error: &'a str },

    /// A classified flow could not be written to the output stream.
    OutputFailed { error: &'a str },

    /// The watchdog found a worker thread that is no longer running.
    WorkerDied { worker: &'a str },

    /// A graceful shutdown started; the process exits after `delay_secs`.
    ShutdownRequested { reason: &'a str, delay_secs: f64 },

    /// A fast shutdown started; the process exits after `delay_ms`.
    FastShutdown { reason: &'a str, delay_ms: u128 },

    /// Periodic table sizes and counters.
    Statistics {
        elapsed_secs:   u64,
        syn_table:      usize,
        con_table:      usize,
        ct_syn_table:   usize,
        ct_con_table:   usize,
        ct_cycles:      u64,
        flows:          u64,
        syn_scans:      u64,
        no_syns:        u64,
        best_guesses:   u64,
        headers:        u64,
        connections:    u64,
        header_dups:    u64,
        connection_dups: u64,
    },

    /// Session summary emitted right before exit.
    SessionSummary {
        duration_secs: u64,
        flows:         u64,
        syn_scans:     u64,
        no_syns:       u64,
        headers:       u64,
        connections:   u64,
    },
}

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe structured logger.
///
/// Constructed once in `main` and passed as an `Arc<Logger>` to every worker.
/// Writes are serialised so lines are never interleaved.
pub struct Logger {
    json:   bool,
    pid:    u32,
    file:   Option<Mutex<BufWriter<std::fs::File>>>,
}

pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(json: bool, log_path: Option<&str>) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };

        Ok(Self { json, pid: std::process::id(), file })
    }

    /// Logs a single [`Event`] to stderr and, if configured, the log file.
    pub fn log(&self, event: &Event) {
        let line = self.format(event);

        // `Stderr::lock` serialises whole lines across threads.
        let _ = writeln!(io::stderr().lock(), "{}", line);

        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    /// Shorthand for an [`Event::Info`] with a formatted message.
    pub fn info(&self, message: &str) {
        self.log(&Event::Info { message });
    }

    /// Shorthand for an [`Event::Warning`] with a formatted message.
    pub fn warn(&self, message: &str) {
        self.log(&Event::Warning { message });
    }

    fn format(&self, event: &Event) -> String {
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string();

        if self.json {
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert("timestamp".to_string(), serde_json::Value::String(timestamp));
                obj.insert("pid".to_string(), serde_json::Value::from(self.pid));
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            format!("{} [PID {}] {}", timestamp, self.pid, plain_text(event))
        }
    }
}

/// Formats an [`Event`] as human-readable text (no timestamp or PID).
fn plain_text(event: &Event) -> String {
    match event {
        Event::Info { message } =>
            format!("[INFO] {}", message),

        Event::Warning { message } =>
            format!("[WARNING] {}", message),

        Event::WorkerStarted { worker, detail } =>
            format!("[{}] Thread started, {}", worker, detail),

        Event::MalformedRecord { source, error, length, data } =>
            format!(
                "[ERROR] Parsing JSON from {} failed. Message: {}, length: {}, data: {}",
                source, error, length, data.trim_end()
            ),

        Event::DuplicateFlow { source, flow_id } =>
            format!("[WARNING] Duplicate {} flow ID {}, keeping the newer record", source, flow_id),

        Event::SourceClosed { source } =>
            format!("[ERROR] Read zero bytes from {}. Closed?", source),

        Event::MalformedConntrackRow { row } =>
            format!("[CONNTRACK] Skipping malformed row: {}", row),

        Event::ConntrackUnavailable { error } =>
            format!(
                "[CONNTRACK] ERROR: conntrack could not be run ({}). Try: \"apt-get install conntrack\"",
                error
            ),

        Event::OutputFailed { error } =>
            format!("[ERROR] Writing event to output failed: {}", error),

        Event::WorkerDied { worker } =>
            format!("[WATCHDOG] Thread {} died, shutting down...", worker),

        Event::ShutdownRequested { reason, delay_secs } =>
            format!("[SHUTDOWN] {}. Shutdown in {:.1}sec, re-trigger to speed up...", reason, delay_secs),

        Event::FastShutdown { reason, delay_ms } =>
            format!("[SHUTDOWN] {}. Fast shutdown in {}ms...", reason, delay_ms),

        Event::Statistics {
            elapsed_secs, syn_table, con_table, ct_syn_table, ct_con_table, ct_cycles,
            flows, syn_scans, no_syns, best_guesses,
            headers, connections, header_dups, connection_dups,
        } => format!(
            "[STATS] after {}s: syn_table={} con_table={} ct_syn_table={} ct_con_table={} ct_cycles={} | \
             flows={} syn_scans={} no_syns={} best_guesses={} | \
             headers={} connections={} header_dups={} connection_dups={}",
            elapsed_secs, syn_table, con_table, ct_syn_table, ct_con_table, ct_cycles,
            flows, syn_scans, no_syns, best_guesses,
            headers, connections, header_dups, connection_dups
        ),

        Event::SessionSummary { duration_secs, flows, syn_scans, no_syns, headers, connections } =>
            format!(
                "[SUMMARY] duration={}s flows={} syn_scans={} no_syns={} headers={} connections={} ...bye!",
                duration_secs, flows, syn_scans, no_syns, headers, connections
            ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn json_lines_carry_tag_timestamp_and_pid() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("synjoin.log");
        let logger = Logger::new(true, path.to_str()).unwrap();

        logger.log(&Event::SourceClosed { source: "/tmp/header_json.tpm" });

        let text = fs::read_to_string(&path).unwrap();
        let val: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(val["event"], "source_closed");
        assert_eq!(val["source"], "/tmp/header_json.tpm");
        assert_eq!(val["pid"], std::process::id());
        assert!(val["timestamp"].is_string());
    }

    #[test]
    fn plain_text_lines_name_the_process() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("synjoin.log");
        let logger = Logger::new(false, path.to_str()).unwrap();

        logger.log(&Event::WorkerDied { worker: "scan-detector" });

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains(&format!("[PID {}]", std::process::id())));
        assert!(text.contains("Thread scan-detector died"));
    }

    #[test]
    fn statistics_report_conntrack_cycles() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("synjoin.log");
        let stats = Event::Statistics {
            elapsed_secs: 60, syn_table: 3, con_table: 1, ct_syn_table: 7, ct_con_table: 7,
            ct_cycles: 58, flows: 10, syn_scans: 2, no_syns: 0, best_guesses: 1,
            headers: 15, connections: 11, header_dups: 0, connection_dups: 0,
        };

        Logger::new(false, path.to_str()).unwrap().log(&stats);
        Logger::new(true, path.to_str()).unwrap().log(&stats);

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().contains("ct_cycles=58 |"));
        let val: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(val["event"], "statistics");
        assert_eq!(val["ct_cycles"], 58);
    }
}
