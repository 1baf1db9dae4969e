use crate::correlator::flow::FlowId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Value of the `origin` field on every emitted event.
pub const ORIGIN: &str = "MADCAT";

/// Connection-tracking verdict attached to SYN and connection records.
///
/// SYN records only ever carry `None` or `Found`; `Changed` and `Failed` are
/// produced by connection reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtStatus {
    /// The kernel has no entry for this flow.
    None,
    /// The kernel reports the flow and its ports agree with the record.
    Found,
    /// The kernel reports a different original source port (DNAT rewrite);
    /// the record was corrected.
    Changed,
    /// The tracking lookup itself could not be completed.
    Failed,
}

/// IP header object delivered by the header source.
///
/// Only the addresses are interpreted. Every other header field is carried in
/// `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpHeader {
    pub src_addr:  String,
    pub dest_addr: String,
    #[serde(flatten)]
    pub extra:     Map<String, Value>,
}

/// TCP header object delivered by the header source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpHeader {
    pub src_port:  u16,
    pub dest_port: u16,
    #[serde(flatten)]
    pub extra:     Map<String, Value>,
}

impl TcpHeader {
    /// Whether the port monitor proxied this flow to a backend.
    ///
    /// The monitor writes `"proxied"` as the string `"true"`/`"false"`; a JSON
    /// boolean is accepted too. Only an explicit false counts as direct, so a
    /// header without the field gets the longer proxy wait.
    pub fn is_proxied(&self) -> bool {
        match self.extra.get("proxied") {
            Some(Value::Bool(b))   => *b,
            Some(Value::String(s)) => !s.eq_ignore_ascii_case("false"),
            _                      => true,
        }
    }
}

/// One observed TCP SYN, as read from the header source.
#[derive(Debug, Clone, Deserialize)]
pub struct SynRecord {
    #[serde(default)]
    pub timestamp: String,
    pub unixtime:  f64,
    #[serde(rename = "IP")]
    pub ip:        IpHeader,
    #[serde(rename = "TCP")]
    pub tcp:       TcpHeader,
    /// Unset until the scan detector first looks at the record.
    #[serde(skip)]
    pub ct_status: Option<CtStatus>,
}

impl SynRecord {
    pub fn flow_id(&self) -> FlowId {
        FlowId::new(&self.ip.src_addr, self.tcp.dest_port, self.tcp.src_port)
    }
}

fn default_proto() -> String {
    "TCP".to_string()
}

/// One accepted connection, as read from the connection source.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionRecord {
    #[serde(default)]
    pub timestamp:  String,
    pub src_ip:     String,
    pub src_port:   u16,
    pub dest_ip:    String,
    pub dest_port:  u16,
    #[serde(default = "default_proto")]
    pub proto:      String,
    #[serde(default)]
    pub event_type: String,
    pub unixtime:   f64,
    #[serde(rename = "FLOW", default)]
    pub flow:       Option<Value>,
    /// Only set when connection tracking is enabled.
    #[serde(skip)]
    pub ct_status:  Option<CtStatus>,
}

impl ConnectionRecord {
    pub fn flow_id(&self) -> FlowId {
        FlowId::new(&self.src_ip, self.dest_port, self.src_port)
    }
}

/// Which of the three classifications an [`OutputEvent`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Accepted,
    NoSyn,
    SynScan,
}

/// A classified flow, written once as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct OutputEvent {
    #[serde(skip)]
    pub kind:             EventKind,
    pub origin:           &'static str,
    pub timestamp:        String,
    pub src_ip:           String,
    pub src_port:         u16,
    pub dest_ip:          String,
    pub dest_port:        u16,
    pub proto:            String,
    pub event_type:       String,
    pub unixtime:         f64,
    /// `null` on accepted and no_syn events whose connection had no flow
    /// object; absent on syn_scan.
    #[serde(rename = "FLOW", skip_serializing_if = "Option::is_none")]
    pub flow:             Option<Value>,
    #[serde(rename = "IP")]
    pub ip:               IpHeader,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp:              Option<TcpHeader>,
    pub ct_status:        Option<CtStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_guess_match: Option<bool>,
}

impl OutputEvent {
    /// Combines a connection with its SYN.
    ///
    /// The source port is taken from the SYN: after a best-guess match it is
    /// the only trustworthy value. `best_guess` is `None` when best-guess
    /// matching is disabled, so the field is left out entirely.
    pub fn accepted(con: ConnectionRecord, syn: SynRecord, best_guess: Option<bool>) -> Self {
        OutputEvent {
            kind:             EventKind::Accepted,
            origin:           ORIGIN,
            timestamp:        con.timestamp,
            src_ip:           con.src_ip,
            src_port:         syn.tcp.src_port,
            dest_ip:          con.dest_ip,
            dest_port:        con.dest_port,
            proto:            con.proto,
            event_type:       con.event_type,
            unixtime:         con.unixtime,
            flow:             Some(con.flow.unwrap_or(Value::Null)),
            ip:               syn.ip,
            tcp:              Some(syn.tcp),
            ct_status:        con.ct_status,
            best_guess_match: best_guess,
        }
    }

    /// A connection whose SYN never showed up. The addresses are copied into
    /// the `IP` object so downstream enrichment finds them where it expects.
    pub fn no_syn(con: ConnectionRecord) -> Self {
        let ip = IpHeader {
            src_addr:  con.src_ip.clone(),
            dest_addr: con.dest_ip.clone(),
            extra:     Map::new(),
        };
        OutputEvent {
            kind:             EventKind::NoSyn,
            origin:           ORIGIN,
            timestamp:        con.timestamp,
            src_ip:           con.src_ip,
            src_port:         con.src_port,
            dest_ip:          con.dest_ip,
            dest_port:        con.dest_port,
            proto:            con.proto,
            event_type:       "no_syn".to_string(),
            unixtime:         con.unixtime,
            flow:             Some(con.flow.unwrap_or(Value::Null)),
            ip,
            tcp:              None,
            ct_status:        con.ct_status,
            best_guess_match: None,
        }
    }

    /// A SYN that never turned into a connection.
    pub fn syn_scan(syn: SynRecord) -> Self {
        OutputEvent {
            kind:             EventKind::SynScan,
            origin:           ORIGIN,
            timestamp:        syn.timestamp,
            src_ip:           syn.ip.src_addr.clone(),
            src_port:         syn.tcp.src_port,
            dest_ip:          syn.ip.dest_addr.clone(),
            dest_port:        syn.tcp.dest_port,
            proto:            "TCP".to_string(),
            event_type:       "syn_scan".to_string(),
            unixtime:         syn.unixtime,
            flow:             None,
            ip:               syn.ip,
            tcp:              Some(syn.tcp),
            ct_status:        Some(syn.ct_status.unwrap_or(CtStatus::None)),
            best_guess_match: None,
        }
    }
}

/// Current wall-clock time as fractional Unix seconds, the unit the monitor
/// uses for `unixtime`.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Running counters reported in the periodic statistics and the session summary.
#[derive(Default)]
pub struct SessionStats {
    pub hdr_count:        AtomicU64,
    pub hdr_warn_count:   AtomicU64,
    pub con_count:        AtomicU64,
    pub con_warn_count:   AtomicU64,
    pub flow_count:       AtomicU64,
    pub syn_scan_count:   AtomicU64,
    pub no_syn_count:     AtomicU64,
    pub best_guess_count: AtomicU64,
    pub ct_cycles:        AtomicU64,
}

pub type SharedStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(SessionStats::default())
    }

    pub fn record(&self, kind: EventKind) {
        let counter = match kind {
            EventKind::Accepted => &self.flow_count,
            EventKind::NoSyn    => &self.no_syn_count,
            EventKind::SynScan  => &self.syn_scan_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide shutdown state shared by every worker.
///
/// A graceful shutdown lets the matcher and scan detector keep draining the
/// tables while new SYNs and `no_syn` verdicts are refused. A fast shutdown
/// stops every loop.
#[derive(Default)]
pub struct Shutdown {
    graceful: AtomicBool,
    fast:     AtomicBool,
    fatal:    AtomicBool,
    requests: AtomicU32,
}

pub type ShutdownFlag = Arc<Shutdown>;

/// Slice length used by [`Shutdown::sleep`] when polling the fast flag.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

impl Shutdown {
    pub fn new() -> ShutdownFlag {
        Arc::new(Shutdown::default())
    }

    /// Starts a graceful shutdown. Returns `false` if one was already running.
    pub fn begin_graceful(&self) -> bool {
        !self.graceful.swap(true, Ordering::SeqCst)
    }

    /// Handles one external termination request: the first starts a graceful
    /// shutdown, any later one forces a fast shutdown. Returns `true` when the
    /// request escalated to fast.
    pub fn request(&self) -> bool {
        let previous = self.requests.fetch_add(1, Ordering::SeqCst);
        if previous == 0 && self.begin_graceful() {
            return false;
        }
        self.force(false);
        true
    }

    /// Stops every loop. `fatal` marks the shutdown as caused by an error,
    /// which turns into a non-zero exit status.
    pub fn force(&self, fatal: bool) {
        if fatal {
            self.fatal.store(true, Ordering::SeqCst);
        }
        self.graceful.store(true, Ordering::SeqCst);
        self.fast.store(true, Ordering::SeqCst);
    }

    pub fn in_progress(&self) -> bool {
        self.graceful.load(Ordering::SeqCst)
    }

    pub fn is_fast(&self) -> bool {
        self.fast.load(Ordering::SeqCst)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Sleeps for `dur`, waking early on a fast shutdown.
    /// Returns `false` if the sleep was cut short.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_fast() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::fixtures::syn_json;
    use serde_json::json;

    #[test]
    fn syn_record_keeps_unknown_header_fields() {
        let syn: SynRecord =
            serde_json::from_value(syn_json("1.2.3.4", 5555, 80, 1.0)).unwrap();
        assert_eq!(syn.flow_id().as_str(), "1.2.3.4_80+5555");
        assert_eq!(syn.ip.extra.get("ttl"), Some(&json!(64)));
        assert!(!syn.tcp.is_proxied());
        assert!(syn.ct_status.is_none());
    }

    #[test]
    fn proxied_accepts_string_and_bool() {
        let mut tcp: TcpHeader =
            serde_json::from_value(json!({"src_port": 1, "dest_port": 2, "proxied": "true"})).unwrap();
        assert!(tcp.is_proxied());
        tcp.extra.insert("proxied".into(), json!(true));
        assert!(tcp.is_proxied());
        tcp.extra.insert("proxied".into(), json!("false"));
        assert!(!tcp.is_proxied());
        tcp.extra.insert("proxied".into(), json!(false));
        assert!(!tcp.is_proxied());
        tcp.extra.remove("proxied");
        assert!(tcp.is_proxied());
    }

    #[test]
    fn no_syn_copies_addresses_into_ip_object() {
        let con: ConnectionRecord = serde_json::from_value(json!({
            "timestamp": "t", "src_ip": "1.2.3.4", "src_port": 5555,
            "dest_ip": "192.168.2.99", "dest_port": 80, "proto": "TCP",
            "event_type": "flow", "unixtime": 2.0, "FLOW": {"state": "closed"}
        }))
        .unwrap();
        let out = serde_json::to_value(OutputEvent::no_syn(con)).unwrap();
        assert_eq!(out["event_type"], "no_syn");
        assert_eq!(out["IP"], json!({"src_addr": "1.2.3.4", "dest_addr": "192.168.2.99"}));
        assert_eq!(out["FLOW"]["state"], "closed");
        assert!(out.get("TCP").is_none());
        assert!(out.get("best_guess_match").is_none());
        assert_eq!(out["ct_status"], Value::Null);
    }

    #[test]
    fn accepted_takes_source_port_from_syn() {
        let syn: SynRecord =
            serde_json::from_value(syn_json("1.2.3.4", 40005, 80, 1.0)).unwrap();
        let con: ConnectionRecord = serde_json::from_value(json!({
            "src_ip": "1.2.3.4", "src_port": 40000, "dest_ip": "192.168.2.99",
            "dest_port": 80, "event_type": "flow", "unixtime": 2.0
        }))
        .unwrap();
        let out = serde_json::to_value(OutputEvent::accepted(con, syn, Some(true))).unwrap();
        assert_eq!(out["origin"], ORIGIN);
        assert_eq!(out["src_port"], 40005);
        assert_eq!(out["event_type"], "flow");
        assert_eq!(out["proto"], "TCP");
        assert_eq!(out["TCP"]["flags"], "SYN");
        assert_eq!(out["best_guess_match"], true);
        assert_eq!(out.get("FLOW"), Some(&Value::Null));
    }

    #[test]
    fn flow_is_null_when_the_connection_has_none() {
        let con: ConnectionRecord = serde_json::from_value(json!({
            "src_ip": "1.2.3.4", "src_port": 5555, "dest_ip": "192.168.2.99",
            "dest_port": 80, "event_type": "flow", "unixtime": 2.0
        }))
        .unwrap();
        let out = serde_json::to_value(OutputEvent::no_syn(con)).unwrap();
        assert_eq!(out.get("FLOW"), Some(&Value::Null));

        let syn: SynRecord =
            serde_json::from_value(syn_json("1.2.3.4", 5555, 80, 1.0)).unwrap();
        let out = serde_json::to_value(OutputEvent::syn_scan(syn)).unwrap();
        assert!(out.get("FLOW").is_none());
    }

    #[test]
    fn syn_scan_defaults_ct_status_to_none() {
        let syn: SynRecord =
            serde_json::from_value(syn_json("1.2.3.4", 5555, 80, 1.0)).unwrap();
        let out = serde_json::to_value(OutputEvent::syn_scan(syn)).unwrap();
        assert_eq!(out["event_type"], "syn_scan");
        assert_eq!(out["ct_status"], "None");
        assert_eq!(out["dest_ip"], "192.168.2.99");
    }

    #[test]
    fn second_request_escalates_to_fast() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.request());
        assert!(shutdown.in_progress());
        assert!(!shutdown.is_fast());
        assert!(shutdown.request());
        assert!(shutdown.is_fast());
        assert!(!shutdown.is_fatal());
        assert!(!shutdown.sleep(Duration::from_secs(5)));
    }
}
