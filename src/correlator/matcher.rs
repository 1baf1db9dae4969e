//! Matching engine: joins pending connections with their SYNs.
//!
//! A pass holds both table locks for its whole duration and runs in two
//! phases. Phase one takes every exact flow-ID match. Phase two, only with
//! best-guess enabled, lets connections older than `best_guess_timeout` claim
//! the oldest SYN with the same source IP and destination port. Because
//! phase one has already consumed every exact pair, a relaxed match can never
//! steal a SYN that belongs to another pending connection.
//!
//! Connections left over after both phases become `no_syn` once they are
//! older than `con_wait + syn_timeout`, unless a shutdown is running or the
//! empty-queue policy holds them back.

use crate::correlator::config::PASS_INTERVAL;
use crate::correlator::error::Result;
use crate::correlator::flow::FlowId;
use crate::correlator::store::{ConTable, SynTable};
use crate::correlator::types::{unix_now, OutputEvent};
use crate::correlator::Correlator;
use crate::logger::Event;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Outcome counts of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub exact:      usize,
    pub best_guess: usize,
    pub no_syn:     usize,
    pub pending:    usize,
}

fn emit(ctx: &Correlator, event: OutputEvent) {
    if let Err(e) = ctx.sink.emit(&event) {
        ctx.logger.log(&Event::OutputFailed { error: &e.to_string() });
    }
}

/// Pending connection IDs, oldest first.
fn by_age(cons: &ConTable) -> Vec<FlowId> {
    let mut ids: Vec<(&FlowId, f64)> = cons.iter().map(|(id, c)| (id, c.unixtime)).collect();
    ids.sort_by(|a, b| a.1.total_cmp(&b.1));
    ids.into_iter().map(|(id, _)| id.clone()).collect()
}

/// Runs one matching pass as of `now` (Unix seconds).
pub fn match_pass(ctx: &Correlator, now: f64) -> PassReport {
    let cfg           = &ctx.cfg;
    let shutting_down = ctx.shutdown.in_progress();
    let flag          = cfg.best_guess_timeout.map(|_| false);

    ctx.store.with_tables(|cons: &mut ConTable, syns: &mut SynTable| {
        let mut report = PassReport::default();

        // Phase one: exact flow IDs.
        for id in by_age(cons) {
            if !syns.contains(&id) {
                continue;
            }
            if let (Some(con), Some(syn)) = (cons.remove(&id), syns.take(&id)) {
                emit(ctx, OutputEvent::accepted(con, syn, flag));
                report.exact += 1;
            }
        }

        // Phase two: relaxed key, then the no_syn verdict.
        for id in by_age(cons) {
            let Some(con) = cons.remove(&id) else { continue };
            let age = now - con.unixtime;

            if let Some(limit) = cfg.best_guess_timeout {
                if age > limit {
                    if let Some((_, syn)) = syns.take_relaxed(&id.relaxed()) {
                        ctx.stats.best_guess_count.fetch_add(1, Ordering::Relaxed);
                        emit(ctx, OutputEvent::accepted(con, syn, Some(true)));
                        report.best_guess += 1;
                        continue;
                    }
                }
            }

            let held_back = cfg.syn_empty_queue && !syns.is_empty();
            if !shutting_down && !held_back && age > cfg.no_syn_after() {
                emit(ctx, OutputEvent::no_syn(con));
                report.no_syn += 1;
            } else {
                cons.insert(id, con);
                report.pending += 1;
            }
        }

        report
    })
}

/// Matcher thread body.
pub fn run_matcher(ctx: &Correlator) -> Result<()> {
    let warm_up = Duration::from_secs_f64(ctx.cfg.con_wait.max(0.0));
    ctx.logger.log(&Event::WorkerStarted {
        worker: "OUTPUT CONNECTIONS",
        detail: &format!(
            "waiting {:.1}s for input threads to gather old data in the pipes",
            warm_up.as_secs_f64()
        ),
    });
    if !ctx.shutdown.sleep(warm_up) {
        return Ok(());
    }
    ctx.logger.info("[OUTPUT CONNECTIONS] running");

    while !ctx.shutdown.is_fast() {
        if !ctx.store.wait_for_connections(PASS_INTERVAL) {
            continue;
        }
        match_pass(ctx, unix_now());
        ctx.store.mark_first_pass();
        ctx.shutdown.sleep(PASS_INTERVAL);
    }
    Ok(())
}
