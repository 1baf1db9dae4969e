use std::path::PathBuf;
use std::time::Duration;

/// How often the conntrack sampler takes a new snapshot of the kernel table.
///
/// Also the bound on how long an ingest or scan worker may wait for a fresh
/// snapshot, and the unit in which snapshot countdowns are decremented.
pub const CT_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between two matcher passes while connections are pending, and
/// between two scan detector passes.
pub const PASS_INTERVAL: Duration = Duration::from_secs(1);

/// How often the supervisor checks that every worker thread is still alive.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between a fast shutdown request and process exit.
pub const FAST_SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

/// Slack added to the graceful shutdown wait so the last scan pass can run.
pub const GRACEFUL_SLACK: Duration = Duration::from_millis(100);

/// Resolved correlator settings.
///
/// All timeouts are in seconds, the unit of the monitor's `unixtime` field, so
/// they can be compared against record timestamps without conversion.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Address the port monitor listens on; used as the conntrack `-d` filter.
    pub host_address:       Option<String>,
    /// Matcher warm-up after startup; also the slack a connection gets on
    /// top of `syn_timeout` before it is reported as `no_syn`.
    pub con_wait:           f64,
    /// Age after which an unmatched, non-proxied SYN is a scan.
    pub syn_timeout:        f64,
    /// Age after which an unmatched, proxied SYN is a scan.
    pub syn_wait_proxy:     f64,
    /// Hold back `no_syn` verdicts until the SYN table is empty.
    pub syn_empty_queue:    bool,
    pub enable_conntrack:   bool,
    /// Sampler cycles a vanished conntrack entry is kept around.
    pub ct_status_grace:    u32,
    /// Age after which best-guess matching is tried, `None` when disabled.
    pub best_guess_timeout: Option<f64>,
    pub header_fifo:        PathBuf,
    pub connection_fifo:    PathBuf,
    pub stats_interval:     Duration,
}

impl CorrelatorConfig {
    /// Age after which an unmatched connection is reported as `no_syn`.
    pub fn no_syn_after(&self) -> f64 {
        self.con_wait + self.syn_timeout
    }

    /// Scan timeout for a SYN, depending on whether it was proxied.
    pub fn scan_timeout(&self, proxied: bool) -> f64 {
        if proxied { self.syn_wait_proxy } else { self.syn_timeout }
    }

    /// How long a graceful shutdown waits before exiting: long enough for
    /// every pending SYN to be reported as a scan.
    pub fn graceful_delay(&self) -> Duration {
        Duration::from_secs_f64(self.syn_timeout.max(0.0)) + GRACEFUL_SLACK
    }

    /// Human-readable problems with the configured values. None of them stop
    /// the correlator; they are logged at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.enable_conntrack && self.host_address.is_none() {
            out.push(
                "connection tracking is enabled but no host address is set; \
                 conntrack will not be filtered by destination"
                    .to_string(),
            );
        }
        if self.syn_wait_proxy < self.syn_timeout {
            out.push(format!(
                "syn-wait-proxy ({}s) is below syn-timeout ({}s); proxied SYNs may be reported before their connection",
                self.syn_wait_proxy, self.syn_timeout
            ));
        }
        if let Some(bg) = self.best_guess_timeout {
            if bg >= self.syn_timeout {
                out.push(format!(
                    "best-guess-timeout ({}s) is not below syn-timeout ({}s); best-guess matches will rarely happen",
                    bg, self.syn_timeout
                ));
            }
            if self.syn_empty_queue {
                out.push(
                    "syn-empty-queue together with best-guess may defer no_syn verdicts indefinitely \
                     while SYNs keep arriving"
                        .to_string(),
                );
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> CorrelatorConfig {
    CorrelatorConfig {
        host_address:       Some("192.168.2.99".to_string()),
        con_wait:           10.0,
        syn_timeout:        60.0,
        syn_wait_proxy:     90.0,
        syn_empty_queue:    false,
        enable_conntrack:   false,
        ct_status_grace:    5,
        best_guess_timeout: None,
        header_fifo:        PathBuf::from("/tmp/header_json.tpm"),
        connection_fifo:    PathBuf::from("/tmp/connect_json.tpm"),
        stats_interval:     Duration::from_secs(10),
    }
}
