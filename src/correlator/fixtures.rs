//! Record builders and capture buffers shared by the unit tests.

use crate::correlator::config::CorrelatorConfig;
use crate::correlator::output::EventSink;
use crate::correlator::types::{ConnectionRecord, SessionStats, Shutdown, SynRecord};
use crate::correlator::Correlator;
use crate::logger::Logger;
use serde_json::{json, Value};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

pub fn syn_json(src: &str, sport: u16, dport: u16, unixtime: f64) -> Value {
    json!({
        "timestamp": "2026-10-16T12:00:00.000000",
        "unixtime": unixtime,
        "IP": { "src_addr": src, "dest_addr": "192.168.2.99", "ttl": 64 },
        "TCP": { "src_port": sport, "dest_port": dport, "proxied": "false", "flags": "SYN" }
    })
}

pub fn con_json(src: &str, sport: u16, dport: u16, unixtime: f64) -> Value {
    json!({
        "origin": "MADCAT",
        "timestamp": "2026-10-16T12:00:02.000000",
        "src_ip": src,
        "src_port": sport,
        "dest_ip": "192.168.2.99",
        "dest_port": dport,
        "proto": "TCP",
        "event_type": "flow",
        "unixtime": unixtime,
        "FLOW": { "state": "closed", "reason": "timeout" }
    })
}

pub fn syn(src: &str, sport: u16, dport: u16, unixtime: f64) -> SynRecord {
    serde_json::from_value(syn_json(src, sport, dport, unixtime)).unwrap()
}

pub fn proxied_syn(src: &str, sport: u16, dport: u16, unixtime: f64) -> SynRecord {
    let mut rec = syn(src, sport, dport, unixtime);
    rec.tcp.extra.insert("proxied".into(), json!("true"));
    rec
}

pub fn con(src: &str, sport: u16, dport: u16, unixtime: f64) -> ConnectionRecord {
    serde_json::from_value(con_json(src, sport, dport, unixtime)).unwrap()
}

/// Cloneable in-memory writer for inspecting what a sink produced.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn json_lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A correlator writing its events into the returned buffer.
pub fn correlator(cfg: CorrelatorConfig) -> (Correlator, SharedBuf) {
    let buf    = SharedBuf::default();
    let stats  = SessionStats::new();
    let sink   = EventSink::new(Box::new(buf.clone()), Arc::clone(&stats));
    let logger = Arc::new(Logger::new(false, None).unwrap());
    (Correlator::new(cfg, sink, logger, stats, Shutdown::new()), buf)
}
