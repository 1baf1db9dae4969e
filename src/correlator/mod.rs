//! Correlation engine entry point.
//!
//! Five workers share one [`Correlator`]:
//!
//! | thread         | role                                                    |
//! |----------------|---------------------------------------------------------|
//! | `syn-ingest`   | header pipe → SYN table                                 |
//! | `con-ingest`   | connection pipe → (conntrack reconcile) → connection table |
//! | `matcher`      | joins the tables, emits `accepted` / `no_syn`           |
//! | `scan-detector`| expires unmatched SYNs as `syn_scan`                    |
//! | `conntrack`    | samples the kernel table (only with `--enable-conntrack`) |
//!
//! The calling thread becomes the supervisor: it polls the workers once per
//! [`WATCHDOG_INTERVAL`], logs statistics and drives the shutdown phases.

pub mod config;
pub mod conntrack;
pub mod error;
pub mod eviction;
pub mod flow;
pub mod ingest;
pub mod matcher;
pub mod output;
pub mod parsers;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;

use crate::correlator::config::{CorrelatorConfig, FAST_SHUTDOWN_DELAY, WATCHDOG_INTERVAL};
use crate::correlator::conntrack::{run_sampler, ConntrackCommand, ConntrackState};
use crate::correlator::error::{CorrelatorError, Result};
use crate::correlator::eviction::run_scan_detector;
use crate::correlator::ingest::{run_connection_ingest, run_syn_ingest};
use crate::correlator::matcher::run_matcher;
use crate::correlator::output::EventSink;
use crate::correlator::store::CorrelationStore;
use crate::correlator::types::{SharedStats, ShutdownFlag};
use crate::logger::{Event, SharedLogger};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Everything the workers share. Built once, handed out as an `Arc`.
pub struct Correlator {
    pub cfg:       CorrelatorConfig,
    pub store:     CorrelationStore,
    /// Present only when connection tracking is enabled.
    pub conntrack: Option<ConntrackState>,
    pub sink:      EventSink,
    pub logger:    SharedLogger,
    pub stats:     SharedStats,
    pub shutdown:  ShutdownFlag,
}

pub type SharedCorrelator = Arc<Correlator>;

impl Correlator {
    pub fn new(
        cfg:      CorrelatorConfig,
        sink:     EventSink,
        logger:   SharedLogger,
        stats:    SharedStats,
        shutdown: ShutdownFlag,
    ) -> Self {
        let conntrack = cfg
            .enable_conntrack
            .then(|| ConntrackState::new(cfg.ct_status_grace));
        Self {
            cfg,
            store: CorrelationStore::new(),
            conntrack,
            sink,
            logger,
            stats,
            shutdown,
        }
    }

    /// Starts a graceful shutdown unless one is already running, and says so
    /// in the log.
    pub fn request_shutdown(&self, reason: &str) {
        if self.shutdown.begin_graceful() {
            self.logger.log(&Event::ShutdownRequested {
                reason,
                delay_secs: self.cfg.graceful_delay().as_secs_f64(),
            });
        }
    }

    /// Stops every loop right away; `fatal` turns into exit status 1.
    pub fn force_shutdown(&self, reason: &str, fatal: bool) {
        self.shutdown.force(fatal);
        self.logger.log(&Event::FastShutdown {
            reason,
            delay_ms: FAST_SHUTDOWN_DELAY.as_millis(),
        });
    }

    /// Escalates a worker's structural error to the matching shutdown phase.
    fn worker_failed(&self, worker: &str, err: CorrelatorError) {
        match &err {
            CorrelatorError::SourceClosed(path) => {
                self.logger.log(&Event::SourceClosed { source: &path.display().to_string() });
                self.request_shutdown("Input source closed");
            }
            CorrelatorError::ConntrackUnavailable(_) | CorrelatorError::ConntrackFailed(_) => {
                self.force_shutdown("Connection tracking failed", true);
            }
            _ => {
                self.logger.warn(&format!("{} stopped: {}", worker, err));
                self.request_shutdown("Worker stopped");
            }
        }
    }

    fn log_statistics(&self, started: Instant) {
        let (ct_syn_table, ct_con_table) = match &self.conntrack {
            Some(ct) => (ct.syn_len(), ct.con_len()),
            None     => (0, 0),
        };
        let s = &self.stats;
        self.logger.log(&Event::Statistics {
            elapsed_secs:    started.elapsed().as_secs(),
            syn_table:       self.store.syn_count(),
            con_table:       self.store.con_count(),
            ct_syn_table,
            ct_con_table,
            ct_cycles:       s.ct_cycles.load(Ordering::Relaxed),
            flows:           s.flow_count.load(Ordering::Relaxed),
            syn_scans:       s.syn_scan_count.load(Ordering::Relaxed),
            no_syns:         s.no_syn_count.load(Ordering::Relaxed),
            best_guesses:    s.best_guess_count.load(Ordering::Relaxed),
            headers:         s.hdr_count.load(Ordering::Relaxed),
            connections:     s.con_count.load(Ordering::Relaxed),
            header_dups:     s.hdr_warn_count.load(Ordering::Relaxed),
            connection_dups: s.con_warn_count.load(Ordering::Relaxed),
        });
    }
}

// ── Workers ──────────────────────────────────────────────────────────────────

type WorkerBody = fn(&Correlator) -> Result<()>;

struct Worker {
    name:     &'static str,
    handle:   thread::JoinHandle<()>,
}

fn spawn_worker(ctx: &SharedCorrelator, name: &'static str, body: WorkerBody) -> Result<Worker> {
    let shared = Arc::clone(ctx);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(e) = body(&shared) {
                shared.worker_failed(name, e);
            }
        })
        .map_err(|source| CorrelatorError::Spawn { name, source })?;
    Ok(Worker { name, handle })
}

fn run_conntrack(ctx: &Correlator) -> Result<()> {
    let Some(state) = &ctx.conntrack else { return Ok(()) };
    let source = ConntrackCommand::new(ctx.cfg.host_address.clone());
    run_sampler(state, &source, &ctx.shutdown, &ctx.logger, &ctx.stats)
}

/// Runs the correlator until shutdown and returns the process exit status.
///
/// # Errors
/// Returns [`CorrelatorError::Spawn`] if a worker thread cannot be started;
/// workers already running are stopped first.
pub fn start_correlator(ctx: SharedCorrelator) -> Result<i32> {
    let mut plan: Vec<(&'static str, WorkerBody)> = Vec::new();
    if ctx.conntrack.is_some() {
        plan.push(("conntrack", run_conntrack as WorkerBody));
    }
    plan.push(("syn-ingest", run_syn_ingest as WorkerBody));
    plan.push(("con-ingest", run_connection_ingest as WorkerBody));
    plan.push(("matcher", run_matcher as WorkerBody));
    plan.push(("scan-detector", run_scan_detector as WorkerBody));

    let mut workers = Vec::with_capacity(plan.len());
    for (name, body) in plan {
        match spawn_worker(&ctx, name, body) {
            Ok(w)  => workers.push(w),
            Err(e) => {
                ctx.shutdown.force(true);
                return Err(e);
            }
        }
    }

    Ok(supervise(&ctx, &workers))
}

// ── Supervisor ───────────────────────────────────────────────────────────────

/// Watchdog and shutdown driver. Returns once the process may exit.
fn supervise(ctx: &Correlator, workers: &[Worker]) -> i32 {
    let started        = Instant::now();
    let mut next_stats = started;
    let mut deadline: Option<Instant> = None;

    loop {
        let now = Instant::now();

        if ctx.shutdown.is_fast() {
            thread::sleep(FAST_SHUTDOWN_DELAY);
            break;
        }

        if !ctx.shutdown.in_progress() {
            if let Some(dead) = workers.iter().find(|w| w.handle.is_finished()) {
                ctx.logger.log(&Event::WorkerDied { worker: dead.name });
                ctx.request_shutdown("Worker thread died");
            }
        }

        if ctx.shutdown.in_progress() && deadline.is_none() {
            deadline = Some(now + ctx.cfg.graceful_delay());
        }
        if let Some(d) = deadline {
            if now >= d {
                break;
            }
        }

        if now >= next_stats {
            ctx.log_statistics(started);
            next_stats = now + ctx.cfg.stats_interval;
        }

        let nap = match deadline {
            Some(d) => WATCHDOG_INTERVAL.min(d.saturating_duration_since(now)),
            None    => WATCHDOG_INTERVAL,
        };
        ctx.shutdown.sleep(nap.max(Duration::from_millis(1)));
    }

    ctx.log_statistics(started);
    if ctx.shutdown.is_fatal() { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::config::test_config;
    use crate::correlator::fixtures::correlator;

    #[test]
    fn closed_source_starts_graceful_shutdown() {
        let (ctx, _) = correlator(test_config());
        let ctx = Arc::new(ctx);
        ctx.worker_failed(
            "syn-ingest",
            CorrelatorError::SourceClosed("/tmp/header_json.tpm".into()),
        );
        assert!(ctx.shutdown.in_progress());
        assert!(!ctx.shutdown.is_fast());
    }

    #[test]
    fn conntrack_failure_is_fatal() {
        let (ctx, _) = correlator(test_config());
        ctx.worker_failed(
            "conntrack",
            CorrelatorError::ConntrackUnavailable(std::io::ErrorKind::NotFound.into()),
        );
        assert!(ctx.shutdown.is_fast());
        assert!(ctx.shutdown.is_fatal());
    }

    #[test]
    fn supervisor_exits_after_fast_shutdown_with_status() {
        let (ctx, _) = correlator(test_config());
        let ctx = Arc::new(ctx);
        let worker = spawn_worker(&ctx, "idle", |c| {
            c.shutdown.sleep(Duration::from_secs(30));
            Ok(())
        })
        .unwrap();

        ctx.force_shutdown("test", true);
        assert_eq!(supervise(&ctx, std::slice::from_ref(&worker)), 1);
    }

    #[test]
    fn dead_worker_triggers_graceful_shutdown() {
        let mut cfg = test_config();
        cfg.syn_timeout = 0.0;
        let (ctx, _) = correlator(cfg);
        let ctx = Arc::new(ctx);
        let worker = spawn_worker(&ctx, "short-lived", |_| Ok(())).unwrap();
        while !worker.handle.is_finished() {
            thread::yield_now();
        }

        assert_eq!(supervise(&ctx, std::slice::from_ref(&worker)), 0);
        assert!(ctx.shutdown.in_progress());
    }
}
