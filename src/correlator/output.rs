//! Serialized output stream for classified flows.
//!
//! The matcher and the scan detector write through the same [`EventSink`].
//! Its mutex guarantees that concurrent emitters never interleave partial JSON
//! lines; no ordering is implied between events of different kinds.

use crate::correlator::types::{OutputEvent, SharedStats};
use std::io::{self, BufWriter, Write};
use std::sync::Mutex;

pub struct EventSink {
    writer: Mutex<Box<dyn Write + Send>>,
    stats:  SharedStats,
}

impl EventSink {
    pub fn new(writer: Box<dyn Write + Send>, stats: SharedStats) -> Self {
        Self { writer: Mutex::new(writer), stats }
    }

    /// Sink writing to the process's standard output.
    pub fn stdout(stats: SharedStats) -> Self {
        Self::new(Box::new(BufWriter::new(io::stdout())), stats)
    }

    /// Writes one event as a single JSON line and flushes it.
    ///
    /// The event counts as emitted once the line is handed to the writer;
    /// the per-kind counter is bumped even if the flush fails, since the
    /// record has already left its table.
    pub fn emit(&self, event: &OutputEvent) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        self.stats.record(event.kind);

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output writer lock poisoned"))?;
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::fixtures::{con, SharedBuf};
    use crate::correlator::types::SessionStats;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_emitters_write_whole_lines() {
        let buf   = SharedBuf::default();
        let stats = SessionStats::new();
        let sink  = Arc::new(EventSink::new(Box::new(buf.clone()), Arc::clone(&stats)));

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for port in 0..50u16 {
                        let ev = OutputEvent::no_syn(con("10.0.0.1", port, 80 + n, 0.0));
                        sink.emit(&ev).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let lines = buf.json_lines();
        assert_eq!(lines.len(), 200);
        assert!(lines.iter().all(|l| l["event_type"] == "no_syn"));
        assert_eq!(stats.no_syn_count.load(Ordering::Relaxed), 200);
    }
}
