//! Ingest workers for the two monitor streams.
//!
//! Both read one JSON object per line. A line that does not parse is logged
//! and dropped; the stream itself keeps going. A zero-length read means the
//! writer went away, which ends the worker with
//! [`CorrelatorError::SourceClosed`] and starts a graceful shutdown.

use crate::correlator::error::{CorrelatorError, Result};
use crate::correlator::types::{ConnectionRecord, Shutdown, SynRecord};
use crate::correlator::Correlator;
use crate::logger::{Event, Logger};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::Ordering;

const HEADER_SOURCE:     &str = "header stream";
const CONNECTION_SOURCE: &str = "connection stream";

pub fn open_source(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CorrelatorError::SourceOpen { path: path.to_path_buf(), source })
}

/// Hands every non-blank line of `reader` to `handle` until the source
/// closes or a fast shutdown is requested.
///
/// Lines are passed as raw bytes so a stray non-UTF-8 byte costs one record,
/// not the stream.
pub fn read_records<R: BufRead>(
    mut reader: R,
    path:       &Path,
    shutdown:   &Shutdown,
    mut handle: impl FnMut(&[u8]),
) -> Result<()> {
    let mut line = Vec::with_capacity(4096);
    while !shutdown.is_fast() {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|source| CorrelatorError::SourceRead { path: path.to_path_buf(), source })?;
        if n == 0 {
            return Err(CorrelatorError::SourceClosed(path.to_path_buf()));
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        handle(&line);
    }
    Ok(())
}

fn parse_record<T: DeserializeOwned>(line: &[u8], source: &str, logger: &Logger) -> Option<T> {
    match serde_json::from_slice(line) {
        Ok(record) => Some(record),
        Err(e) => {
            let data = String::from_utf8_lossy(line);
            logger.log(&Event::MalformedRecord {
                source,
                error:  &e.to_string(),
                length: line.len(),
                data:   &data,
            });
            None
        }
    }
}

// ── SYN table builder ────────────────────────────────────────────────────────

/// Parses one header line and files the SYN under its flow ID.
///
/// While a shutdown is in progress lines are dropped: a SYN arriving now
/// could not be answered before exit and would only turn into a false scan.
pub fn ingest_syn(ctx: &Correlator, line: &[u8]) {
    if ctx.shutdown.in_progress() {
        return;
    }
    let Some(record) = parse_record::<SynRecord>(line, HEADER_SOURCE, &ctx.logger) else {
        return;
    };
    ctx.stats.hdr_count.fetch_add(1, Ordering::Relaxed);

    let id = record.flow_id();
    if ctx.store.insert_syn(id.clone(), record) {
        ctx.stats.hdr_warn_count.fetch_add(1, Ordering::Relaxed);
        ctx.logger.log(&Event::DuplicateFlow { source: HEADER_SOURCE, flow_id: id.as_str() });
    }
}

pub fn run_syn_ingest(ctx: &Correlator) -> Result<()> {
    let path = &ctx.cfg.header_fifo;
    ctx.logger.log(&Event::WorkerStarted {
        worker: "SYN TABLE BUILDER",
        detail: &format!("reading {}", path.display()),
    });
    let reader = open_source(path)?;
    read_records(reader, path, &ctx.shutdown, |line| ingest_syn(ctx, line))
}

// ── Connection table builder ─────────────────────────────────────────────────

/// Parses one connection line, reconciles it against the conntrack snapshot
/// when tracking is on, and files it under its (possibly corrected) flow ID.
pub fn ingest_connection(ctx: &Correlator, line: &[u8]) {
    let Some(mut record) = parse_record::<ConnectionRecord>(line, CONNECTION_SOURCE, &ctx.logger) else {
        return;
    };
    ctx.stats.con_count.fetch_add(1, Ordering::Relaxed);

    let id = match &ctx.conntrack {
        Some(ct) => {
            if !ct.wait_until_fresh(record.unixtime, &ctx.shutdown) {
                return;
            }
            ct.reconcile(&mut record)
        }
        None => record.flow_id(),
    };

    if ctx.store.insert_connection(id.clone(), record) {
        ctx.stats.con_warn_count.fetch_add(1, Ordering::Relaxed);
        ctx.logger.log(&Event::DuplicateFlow { source: CONNECTION_SOURCE, flow_id: id.as_str() });
    }
}

pub fn run_connection_ingest(ctx: &Correlator) -> Result<()> {
    let path = &ctx.cfg.connection_fifo;
    ctx.logger.log(&Event::WorkerStarted {
        worker: "CONNECTION TABLE BUILDER",
        detail: &format!("reading {}", path.display()),
    });
    let reader = open_source(path)?;
    read_records(reader, path, &ctx.shutdown, |line| ingest_connection(ctx, line))
}
