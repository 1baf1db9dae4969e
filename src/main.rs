mod cli;
mod correlator;
mod logger;

use cli::Cli;
use clap::Parser;
use correlator::config::{CorrelatorConfig, FAST_SHUTDOWN_DELAY};
use correlator::output::EventSink;
use correlator::types::{SessionStats, SharedStats, Shutdown};
use correlator::{start_correlator, Correlator, SharedCorrelator};
use logger::{Event, Logger, SharedLogger};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

fn main() {
    let cli = Cli::parse();
    let session_start = Instant::now();

    // The log goes to stderr; stdout carries the event stream only.
    let logger: SharedLogger = match Logger::new(cli.json, cli.log_file.as_deref()) {
        Ok(l)  => Arc::new(l),
        Err(e) => {
            eprintln!("synjoin: cannot open log file: {}", e);
            std::process::exit(1);
        }
    };

    let cfg = cli.correlator_config();
    log_config(&logger, &cfg);
    for warning in cfg.warnings() {
        logger.warn(&warning);
    }

    let stats    = SessionStats::new();
    let shutdown = Shutdown::new();
    let sink     = EventSink::stdout(Arc::clone(&stats));
    let ctx: SharedCorrelator = Arc::new(Correlator::new(
        cfg,
        sink,
        Arc::clone(&logger),
        Arc::clone(&stats),
        Arc::clone(&shutdown),
    ));

    register_shutdown_handler(Arc::clone(&ctx));

    let status = match start_correlator(ctx) {
        Ok(status) => status,
        Err(e) => {
            logger.log(&Event::Warning { message: &format!("Correlator error: {}", e) });
            1
        }
    };

    print_summary(&logger, &stats, session_start);
    std::process::exit(status);
}

/// First SIGINT/SIGTERM: graceful shutdown. Any further one: fast shutdown.
fn register_shutdown_handler(ctx: SharedCorrelator) {
    let handler_ctx = Arc::clone(&ctx);
    let result = ctrlc::set_handler(move || {
        let ctx = &handler_ctx;
        if ctx.shutdown.request() {
            ctx.logger.log(&Event::FastShutdown {
                reason:   "Signal received again",
                delay_ms: FAST_SHUTDOWN_DELAY.as_millis(),
            });
        } else {
            ctx.logger.log(&Event::ShutdownRequested {
                reason:     "Signal received",
                delay_secs: ctx.cfg.graceful_delay().as_secs_f64(),
            });
        }
    });
    if let Err(e) = result {
        ctx.logger.warn(&format!("Cannot register signal handler: {}", e));
    }
}

/// Logs the resolved configuration, one setting per line.
fn log_config(logger: &SharedLogger, cfg: &CorrelatorConfig) {
    let best_guess = match cfg.best_guess_timeout {
        Some(t) => format!("on, after {}s", t),
        None    => "off".to_string(),
    };
    let lines = [
        format!("header pipe:          {}", cfg.header_fifo.display()),
        format!("connection pipe:      {}", cfg.connection_fifo.display()),
        format!("host address:         {}", cfg.host_address.as_deref().unwrap_or("-")),
        format!("con wait:             {}s", cfg.con_wait),
        format!("syn timeout:          {}s", cfg.syn_timeout),
        format!("syn wait proxy:       {}s", cfg.syn_wait_proxy),
        format!("syn empty queue:      {}", cfg.syn_empty_queue),
        format!("conntrack:            {}", cfg.enable_conntrack),
        format!("ct status grace time: {}", cfg.ct_status_grace),
        format!("best guess:           {}", best_guess),
        format!("stats interval:       {}s", cfg.stats_interval.as_secs()),
    ];
    logger.info("Starting synjoin with config:");
    for line in &lines {
        logger.info(line);
    }
}

fn print_summary(logger: &SharedLogger, stats: &SharedStats, session_start: Instant) {
    logger.log(&Event::SessionSummary {
        duration_secs: session_start.elapsed().as_secs(),
        flows:         stats.flow_count.load(Ordering::Relaxed),
        syn_scans:     stats.syn_scan_count.load(Ordering::Relaxed),
        no_syns:       stats.no_syn_count.load(Ordering::Relaxed),
        headers:       stats.hdr_count.load(Ordering::Relaxed),
        connections:   stats.con_count.load(Ordering::Relaxed),
    });
}
