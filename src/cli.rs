use crate::correlator::config::CorrelatorConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// synjoin: SYN/connection correlator for honeypot TCP port monitors.
///
/// Reads SYN header events and accepted-connection events from two named
/// pipes, joins them per flow and writes one JSON line per classified flow
/// (accepted connection, SYN scan, or connection without SYN) to stdout.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "synjoin",
    version = "0.2.0",
    about   = "Correlates TCP SYNs with accepted connections and reports scans",
    long_about = None,
)]
pub struct Cli {
    // ── Inputs ───────────────────────────────────────────────────────────────

    /// Named pipe carrying TCP/IP header events (SYNs), one JSON object per line.
    #[arg(long = "header-fifo", value_name = "PATH", default_value = "/tmp/header_json.tpm")]
    pub header_fifo: PathBuf,

    /// Named pipe carrying connection events, one JSON object per line.
    #[arg(long = "connection-fifo", value_name = "PATH", default_value = "/tmp/connect_json.tpm")]
    pub connection_fifo: PathBuf,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write the operational log to this file in addition to stderr.
    ///
    /// The file is created if it does not exist and appended to if it does.
    /// Classified flows always go to stdout, never to this file.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit operational log entries as newline-delimited JSON.
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Seconds between two statistics reports in the operational log.
    #[arg(long = "stats-interval", value_name = "SECS", default_value_t = 10)]
    pub stats_interval: u64,

    // ── Timing ───────────────────────────────────────────────────────────────

    /// Seconds the matcher waits after startup so the input threads can drain
    /// old data from the pipes. Also added to --syn-timeout before a
    /// connection is reported without SYN.
    #[arg(long = "con-wait", value_name = "SECS", default_value_t = 10.0, value_parser = parse_secs)]
    pub con_wait: f64,

    /// Seconds after which an unmatched SYN is reported as a SYN scan.
    #[arg(long = "syn-timeout", value_name = "SECS", default_value_t = 70.0, value_parser = parse_secs)]
    pub syn_timeout: f64,

    /// Seconds after which an unmatched SYN on a proxied port is reported as
    /// a SYN scan. Should be larger than --syn-timeout.
    #[arg(long = "syn-wait-proxy", value_name = "SECS", default_value_t = 100.0, value_parser = parse_secs)]
    pub syn_wait_proxy: f64,

    /// Hold back "no_syn" verdicts until no SYN is pending.
    #[arg(long = "syn-empty-queue")]
    pub syn_empty_queue: bool,

    // ── Connection tracking ──────────────────────────────────────────────────

    /// Sample the kernel conntrack table to correct DNAT-rewritten source
    /// ports and to keep live flows from being reported as scans.
    /// Requires the `conntrack` tool and root privileges.
    #[arg(long = "enable-conntrack")]
    pub enable_conntrack: bool,

    /// Address the port monitor listens on; passed to `conntrack -d`.
    #[arg(long = "hostaddress", value_name = "ADDR")]
    pub host_address: Option<String>,

    /// Seconds a conntrack entry is kept after the kernel dropped it.
    #[arg(long = "ct-status-grace-time", value_name = "SECS", default_value_t = 5)]
    pub ct_status_grace_time: u32,

    /// Match connections by source IP and destination port only once they
    /// are older than --best-guess-timeout (recovers DNAT-rewritten flows).
    #[arg(long = "best-guess")]
    pub best_guess: bool,

    /// Seconds before best-guess matching is tried for a connection.
    #[arg(long = "best-guess-timeout", value_name = "SECS", default_value_t = 60.0, value_parser = parse_secs)]
    pub best_guess_timeout: f64,
}

/// Parses a timeout in seconds. Every timeout ends up in a `Duration`, so it
/// has to be finite and non-negative.
fn parse_secs(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("expected a finite number of seconds >= 0, got {}", s));
    }
    Ok(secs)
}

impl Cli {
    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            host_address:       self.host_address.clone(),
            con_wait:           self.con_wait,
            syn_timeout:        self.syn_timeout,
            syn_wait_proxy:     self.syn_wait_proxy,
            syn_empty_queue:    self.syn_empty_queue,
            enable_conntrack:   self.enable_conntrack,
            ct_status_grace:    self.ct_status_grace_time,
            best_guess_timeout: self.best_guess.then_some(self.best_guess_timeout),
            header_fifo:        self.header_fifo.clone(),
            connection_fifo:    self.connection_fifo.clone(),
            stats_interval:     Duration::from_secs(self.stats_interval.max(1)),
        }
    }
}
