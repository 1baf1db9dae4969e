//! Connection-tracking sampler and the snapshot it maintains.
//!
//! Once per [`CT_INTERVAL`] the sampler runs `conntrack -L -ptcp` and folds
//! the rows into two tables:
//!
//! - the connection-keyed table maps the post-DNAT flow ID a connection
//!   record carries to the original source port, so reconciliation can undo
//!   the rewrite;
//! - the SYN-keyed table says whether a SYN's flow is still alive in the
//!   kernel, so the scan detector does not report slow but live flows.
//!
//! SYN-keyed entries age through [`Liveness`] and stay around for a grace
//! period after the kernel forgets them, which absorbs a missed sample or
//! two. Each cycle's stamp is taken before the tool runs and published only
//! once both tables are complete, under their locks: a reader that waited for
//! a stamp at least as new as its record sees a snapshot that includes it.

use crate::correlator::config::CT_INTERVAL;
use crate::correlator::error::{CorrelatorError, Result};
use crate::correlator::flow::FlowId;
use crate::correlator::parsers::{parse_conntrack_row, RowParse};
use crate::correlator::types::{unix_now, ConnectionRecord, CtStatus, SharedStats, Shutdown};
use crate::logger::{Event, SharedLogger};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex, PoisonError};

/// Where snapshot rows come from. The production source shells out to the
/// `conntrack` tool; tests feed canned output.
pub trait ConntrackSource: Send + Sync {
    fn query(&self) -> Result<String>;
}

/// Runs `conntrack -L -ptcp [-d <host>]`.
pub struct ConntrackCommand {
    host_address: Option<String>,
}

impl ConntrackCommand {
    pub fn new(host_address: Option<String>) -> Self {
        Self { host_address }
    }
}

impl ConntrackSource for ConntrackCommand {
    fn query(&self) -> Result<String> {
        let mut cmd = Command::new("conntrack");
        cmd.args(["-L", "-ptcp"]);
        if let Some(host) = &self.host_address {
            cmd.args(["-d", host]);
        }
        let output = cmd
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(CorrelatorError::ConntrackUnavailable)?;
        if !output.status.success() {
            return Err(CorrelatorError::ConntrackFailed(output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Per-entry aging state of a SYN-keyed snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Reported by the kernel in the latest sample, with its kernel timeout.
    Fresh { timeout: u32 },
    /// Missing from recent samples; counts the kernel timeout down by one
    /// per cycle.
    Stale { remaining: u32 },
    /// Kernel timeout exhausted; kept `remaining` more cycles before eviction.
    Grace { remaining: u32 },
}

impl Liveness {
    /// Advances the state by one sampler cycle. `None` means evict.
    pub fn age(self, grace: u32) -> Option<Liveness> {
        match self {
            Liveness::Fresh { timeout }          => Some(Liveness::Stale { remaining: timeout }),
            Liveness::Stale { remaining: 0 }     => Some(Liveness::Grace { remaining: grace }),
            Liveness::Stale { remaining }        => Some(Liveness::Stale { remaining: remaining - 1 }),
            Liveness::Grace { remaining: 0 }     => None,
            Liveness::Grace { remaining }        => Some(Liveness::Grace { remaining: remaining - 1 }),
        }
    }
}

#[derive(Debug, Clone)]
struct SynCtEntry {
    /// Connection-keyed entry created from the same kernel row.
    con_key:  FlowId,
    liveness: Liveness,
}

#[derive(Debug, Clone, Copy)]
struct ConCtEntry {
    org_src_port: Option<u16>,
}

/// Stamp of the most recently published snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct Publication {
    /// Unix time captured right before the tool ran.
    pub last_update: f64,
    /// Number of snapshots published so far.
    pub sequence:    u64,
}

/// The published conntrack snapshot shared with the ingest and scan workers.
pub struct ConntrackState {
    con_map:   Mutex<HashMap<FlowId, ConCtEntry>>,
    syn_map:   Mutex<HashMap<FlowId, SynCtEntry>>,
    published: Mutex<Publication>,
    fresh:     Condvar,
    grace:     u32,
}

impl ConntrackState {
    pub fn new(grace: u32) -> Self {
        Self {
            con_map:   Mutex::new(HashMap::new()),
            syn_map:   Mutex::new(HashMap::new()),
            published: Mutex::new(Publication::default()),
            fresh:     Condvar::new(),
            grace,
        }
    }

    /// Runs one sampler cycle: queries `source`, ages the SYN-keyed entries,
    /// merges the rows and publishes the result stamped with `stamp`.
    ///
    /// Returns the number of rows that were merged. A failing source is
    /// returned as-is; nothing is aged or published in that case.
    pub fn cycle(&self, source: &dyn ConntrackSource, stamp: f64, logger: &SharedLogger) -> Result<usize> {
        // The tool runs without the tables locked; readers only ever wait on
        // the in-memory merge below.
        let text = source.query()?;

        let mut con_map = self.con_map.lock().unwrap_or_else(PoisonError::into_inner);
        let mut syn_map = self.syn_map.lock().unwrap_or_else(PoisonError::into_inner);

        let mut evicted = Vec::new();
        syn_map.retain(|_, entry| match entry.liveness.age(self.grace) {
            Some(next) => {
                entry.liveness = next;
                true
            }
            None => {
                evicted.push(entry.con_key.clone());
                false
            }
        });
        for key in &evicted {
            con_map.remove(key);
        }

        let mut merged = 0;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match parse_conntrack_row(line) {
                RowParse::Tracked(row) => {
                    con_map.insert(row.con_key.clone(), ConCtEntry { org_src_port: row.org_src_port });
                    let previous = syn_map.insert(
                        row.syn_key,
                        SynCtEntry {
                            con_key:  row.con_key.clone(),
                            liveness: Liveness::Fresh { timeout: row.timeout },
                        },
                    );
                    if let Some(prev) = previous {
                        if prev.con_key != row.con_key {
                            con_map.remove(&prev.con_key);
                        }
                    }
                    merged += 1;
                }
                RowParse::Ignored   => {}
                RowParse::Malformed => logger.log(&Event::MalformedConntrackRow { row: line }),
            }
        }

        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        published.last_update = stamp;
        published.sequence += 1;
        self.fresh.notify_all();
        Ok(merged)
    }

    pub fn publication(&self) -> Publication {
        *self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a snapshot stamped at or after `unixtime` is published,
    /// or until one more snapshot has been published since the call started,
    /// whichever comes first. Returns `false` only on a fast shutdown.
    pub fn wait_until_fresh(&self, unixtime: f64, shutdown: &Shutdown) -> bool {
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let start = published.sequence;
        while published.last_update < unixtime && published.sequence == start {
            if shutdown.is_fast() {
                return false;
            }
            published = self
                .fresh
                .wait_timeout(published, CT_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Corrects a connection record against the snapshot and returns its
    /// (possibly new) flow ID.
    ///
    /// - no entry: `None`, record untouched
    /// - entry with a different original source port: source port rewritten,
    ///   `Changed`
    /// - entry with the same port: `Found`
    /// - unusable entry or poisoned table: `Failed`, record untouched
    pub fn reconcile(&self, con: &mut ConnectionRecord) -> FlowId {
        let id = con.flow_id();
        let status = match self.con_map.lock() {
            Err(_)  => CtStatus::Failed,
            Ok(map) => match map.get(&id).map(|e| e.org_src_port) {
                None                                      => CtStatus::None,
                Some(None)                                => CtStatus::Failed,
                Some(Some(port)) if port != con.src_port  => {
                    con.src_port = port;
                    CtStatus::Changed
                }
                Some(Some(_))                             => CtStatus::Found,
            },
        };
        con.ct_status = Some(status);
        con.flow_id()
    }

    /// Whether the kernel still tracks (or recently tracked) this SYN's flow.
    pub fn is_live(&self, syn_id: &FlowId) -> bool {
        self.syn_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(syn_id)
    }

    pub fn con_len(&self) -> usize {
        self.con_map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn syn_len(&self) -> usize {
        self.syn_map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Sampler thread body. Runs until a fast shutdown; a failing conntrack
/// query ends it with an error, which the supervisor treats as fatal.
pub fn run_sampler(
    state:    &ConntrackState,
    source:   &dyn ConntrackSource,
    shutdown: &Shutdown,
    logger:   &SharedLogger,
    stats:    &SharedStats,
) -> Result<()> {
    logger.log(&Event::WorkerStarted {
        worker: "CONNTRACK LOOKUP",
        detail: "sampling the kernel connection table",
    });

    while !shutdown.is_fast() {
        let stamp = unix_now();
        if let Err(e) = state.cycle(source, stamp, logger) {
            logger.log(&Event::ConntrackUnavailable { error: &e.to_string() });
            return Err(e);
        }
        stats.ct_cycles.fetch_add(1, Ordering::Relaxed);
        shutdown.sleep(CT_INTERVAL);
    }
    Ok(())
}
