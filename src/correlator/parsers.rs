//! Parser for `conntrack -L -ptcp` output rows.
//!
//! A row looks like
//!
//! ```text
//! tcp 6 431999 ESTABLISHED src=X dst=h sport=D dport=B src=h dst=A sport=l dport=C [ASSURED] mark=0 use=1
//! tcp 6 119 SYN_SENT src=X dst=h sport=D dport=B [UNREPLIED] src=h dst=A sport=l dport=C mark=0 use=1
//! ```
//!
//! The first `src/dst/sport/dport` group is the origin direction as the kernel
//! saw it before NAT, the second is the reply direction. The port monitor's
//! connection source reports the post-DNAT view `A_B+C`; the SYN source reports
//! the pre-NAT view `X_B+D`.

use crate::correlator::flow::FlowId;

/// Shortest row the kernel emits for the states we track.
const MIN_FIELDS: usize = 14;

/// One conntrack entry for a state the correlator cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtRow {
    /// Seconds the kernel will keep the entry without further traffic.
    pub timeout:      u32,
    /// Key as the connection source sees the flow (`A_B+C`).
    pub con_key:      FlowId,
    /// Key as the SYN source sees the flow (`X_B+D`).
    pub syn_key:      FlowId,
    /// Original source port `D`; `None` if the kernel printed something
    /// that is not a port.
    pub org_src_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowParse {
    Tracked(CtRow),
    /// Well-formed, but in a state that says nothing about our flows.
    Ignored,
    Malformed,
}

#[derive(Default)]
struct Direction<'a> {
    src:   Option<&'a str>,
    dst:   Option<&'a str>,
    sport: Option<&'a str>,
    dport: Option<&'a str>,
}

impl<'a> Direction<'a> {
    fn complete(&self) -> bool {
        self.src.is_some() && self.dst.is_some() && self.sport.is_some() && self.dport.is_some()
    }

    /// Stores `value` under `key` unless already set. Returns `false` when
    /// the slot was taken, i.e. the token belongs to the next direction.
    fn set(&mut self, key: &str, value: &'a str) -> bool {
        let slot = match key {
            "src"   => &mut self.src,
            "dst"   => &mut self.dst,
            "sport" => &mut self.sport,
            "dport" => &mut self.dport,
            _       => return true,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }
}

pub fn parse_conntrack_row(row: &str) -> RowParse {
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return RowParse::Malformed;
    }

    match fields[3] {
        "ESTABLISHED" | "CLOSE" | "SYN_SENT" => {}
        _ => return RowParse::Ignored,
    }

    let timeout = match fields[2].parse::<u32>() {
        Ok(t)  => t,
        Err(_) => return RowParse::Malformed,
    };

    let mut origin = Direction::default();
    let mut reply  = Direction::default();
    for field in &fields[4..] {
        let Some((key, value)) = field.split_once('=') else { continue };
        if !origin.set(key, value) {
            reply.set(key, value);
        }
    }
    if !origin.complete() || !reply.complete() {
        return RowParse::Malformed;
    }

    // `complete()` guarantees every slot below is filled.
    let (Some(x), Some(d), Some(b)) = (origin.src, origin.sport, origin.dport) else {
        return RowParse::Malformed;
    };
    let (Some(a), Some(c)) = (reply.dst, reply.dport) else {
        return RowParse::Malformed;
    };

    RowParse::Tracked(CtRow {
        timeout,
        con_key:      FlowId::from_parts(a, b, c),
        syn_key:      FlowId::from_parts(x, b, d),
        org_src_port: d.parse().ok(),
    })
}
