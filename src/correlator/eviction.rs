//! Scan detector: evicts SYNs that never turned into a connection.
//!
//! Once per [`PASS_INTERVAL`] every pending SYN is checked against its
//! effective timeout (`syn_timeout`, or `syn_wait_proxy` when the port
//! monitor proxied the flow). An expired SYN is emitted as `syn_scan` and
//! removed under the SYN-table lock, so the matcher can never join a SYN
//! that has already been reported.
//!
//! With connection tracking on, a SYN whose flow the kernel still tracks is
//! left alone: the handshake may simply be slow. Before deciding, the pass
//! waits for a snapshot at least as new as the newest pending SYN, without
//! holding the SYN lock; SYNs the published snapshot does not yet cover are
//! skipped until the next pass.

use crate::correlator::config::PASS_INTERVAL;
use crate::correlator::error::Result;
use crate::correlator::types::{unix_now, CtStatus, OutputEvent};
use crate::correlator::Correlator;
use crate::logger::Event;
use std::time::Duration;

/// Runs one scan pass as of `now` (Unix seconds). Returns the number of
/// scans emitted.
pub fn scan_pass(ctx: &Correlator, now: f64) -> usize {
    let cfg = &ctx.cfg;

    // Newest snapshot stamp the pass may rely on.
    let horizon = match &ctx.conntrack {
        Some(ct) => {
            if let Some(newest) = ctx.store.with_syns(|syns| syns.newest_unixtime()) {
                if !ct.wait_until_fresh(newest, &ctx.shutdown) {
                    return 0;
                }
            }
            Some(ct.publication().last_update)
        }
        None => None,
    };

    ctx.store.with_syns(|syns| {
        let mut emitted = 0;
        for id in syns.keys() {
            let Some(syn) = syns.get_mut(&id) else { continue };

            let live = match (&ctx.conntrack, horizon) {
                (Some(ct), Some(stamp)) => {
                    if syn.unixtime > stamp {
                        continue;
                    }
                    // Once seen by the kernel, a SYN stays `Found`.
                    let live = ct.is_live(&id);
                    if live {
                        syn.ct_status = Some(CtStatus::Found);
                    } else {
                        syn.ct_status.get_or_insert(CtStatus::None);
                    }
                    live
                }
                _ => {
                    syn.ct_status.get_or_insert(CtStatus::None);
                    false
                }
            };

            let timeout = cfg.scan_timeout(syn.tcp.is_proxied());
            if live || now - syn.unixtime <= timeout {
                continue;
            }

            if let Some(syn) = syns.take(&id) {
                if let Err(e) = ctx.sink.emit(&OutputEvent::syn_scan(syn)) {
                    ctx.logger.log(&Event::OutputFailed { error: &e.to_string() });
                }
                emitted += 1;
            }
        }
        emitted
    })
}

/// Scan detector thread body.
pub fn run_scan_detector(ctx: &Correlator) -> Result<()> {
    let latch = Duration::from_secs_f64((3.0 * ctx.cfg.con_wait).max(0.0));
    ctx.logger.log(&Event::WorkerStarted {
        worker: "OUTPUT SYN-SCANS",
        detail: &format!(
            "waiting a max. of {:.1}s for the first matcher pass",
            latch.as_secs_f64()
        ),
    });
    ctx.store.wait_first_pass(latch);
    ctx.logger.info("[OUTPUT SYN-SCANS] running");

    while !ctx.shutdown.is_fast() {
        scan_pass(ctx, unix_now());
        ctx.shutdown.sleep(PASS_INTERVAL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::config::test_config;
    use crate::correlator::conntrack::tests::{quiet_logger, row, CannedSource};
    use crate::correlator::fixtures::{correlator, proxied_syn, syn};
    use std::sync::atomic::Ordering;

    #[test]
    fn unanswered_syn_is_a_scan_after_syn_timeout() {
        let (ctx, buf) = correlator(test_config());
        let s = syn("1.2.3.4", 5555, 80, 0.0);
        ctx.store.insert_syn(s.flow_id(), s);

        assert_eq!(scan_pass(&ctx, 59.0), 0);
        assert_eq!(ctx.store.syn_count(), 1);

        assert_eq!(scan_pass(&ctx, 60.5), 1);
        assert_eq!(ctx.store.syn_count(), 0);
        let out = buf.json_lines();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["event_type"], "syn_scan");
        assert_eq!(out[0]["ct_status"], "None");
        assert_eq!(out[0]["TCP"]["src_port"], 5555);
        assert_eq!(ctx.stats.syn_scan_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn proxied_syn_gets_the_longer_wait() {
        let (ctx, buf) = correlator(test_config());
        let s = proxied_syn("1.2.3.4", 5555, 80, 0.0);
        ctx.store.insert_syn(s.flow_id(), s);

        assert_eq!(scan_pass(&ctx, 61.0), 0);
        assert_eq!(scan_pass(&ctx, 90.5), 1);
        assert_eq!(buf.json_lines()[0]["TCP"]["proxied"], "true");
    }

    #[test]
    fn header_without_proxied_field_waits_like_a_proxied_one() {
        let (ctx, _) = correlator(test_config());
        let mut s = syn("1.2.3.4", 5555, 80, 0.0);
        s.tcp.extra.remove("proxied");
        ctx.store.insert_syn(s.flow_id(), s);

        assert_eq!(scan_pass(&ctx, 61.0), 0);
        assert_eq!(scan_pass(&ctx, 90.5), 1);
    }

    #[test]
    fn live_conntrack_entry_defers_the_scan() {
        let mut cfg = test_config();
        cfg.enable_conntrack = true;
        cfg.ct_status_grace  = 0;
        let (ctx, buf) = correlator(cfg);
        let s = syn("1.2.3.4", 5555, 80, 0.0);
        ctx.store.insert_syn(s.flow_id(), s);

        let ct = ctx.conntrack.as_ref().unwrap();
        let listing = row("1.2.3.4", 5555, 80, 5555, 0);
        let source = CannedSource::new(&[&listing, ""]);
        let logger = quiet_logger();

        ct.cycle(&source, 1.0, &logger).unwrap();
        assert_eq!(scan_pass(&ctx, 100.0), 0);
        let status = ctx.store.with_syns(|s| s.get(&s.keys()[0]).and_then(|r| r.ct_status));
        assert_eq!(status, Some(CtStatus::Found));

        // Fresh(0) -> Stale(0) -> Grace(0) -> evicted
        for stamp in [2.0, 3.0, 4.0] {
            ct.cycle(&source, stamp, &logger).unwrap();
        }
        assert_eq!(scan_pass(&ctx, 101.0), 1);
        assert_eq!(buf.json_lines()[0]["ct_status"], "Found");
    }

    #[test]
    fn syn_never_tracked_scans_with_status_none() {
        let mut cfg = test_config();
        cfg.enable_conntrack = true;
        let (ctx, buf) = correlator(cfg);
        let s = syn("1.2.3.4", 5555, 80, 0.0);
        ctx.store.insert_syn(s.flow_id(), s);

        let ct = ctx.conntrack.as_ref().unwrap();
        ct.cycle(&CannedSource::new(&[""]), 1.0, &quiet_logger()).unwrap();

        assert_eq!(scan_pass(&ctx, 100.0), 1);
        assert_eq!(buf.json_lines()[0]["ct_status"], "None");
    }

    #[test]
    fn syns_newer_than_the_snapshot_wait_for_the_next_pass() {
        let mut cfg = test_config();
        cfg.enable_conntrack = true;
        let (ctx, buf) = correlator(cfg);
        let ct = ctx.conntrack.as_ref().unwrap();
        ct.cycle(&CannedSource::new(&[""]), 5.0, &quiet_logger()).unwrap();
        ct.cycle(&CannedSource::new(&[""]), 6.0, &quiet_logger()).unwrap();

        let s = syn("1.2.3.4", 5555, 80, 10.0);
        ctx.store.insert_syn(s.flow_id(), s);

        let scanner = std::thread::scope(|scope| {
            let handle = scope.spawn(|| scan_pass(&ctx, 100.0));
            std::thread::sleep(Duration::from_millis(50));
            ct.cycle(&CannedSource::new(&[""]), 11.0, &quiet_logger()).unwrap();
            handle.join().unwrap()
        });

        assert_eq!(scanner, 1);
        assert_eq!(buf.json_lines().len(), 1);
    }
}
