//! Flow identifiers used to join SYN records against connection records.
//!
//! A [`FlowId`] is rendered as `srcIP_destPort+srcPort`. Both sides of the
//! join (header stream and connection stream) build it from the same three
//! fields, so string equality is the primary match predicate. The part before
//! the `+` is the [`RelaxedKey`], used by best-guess matching when a DNAT
//! rewrite has changed the source port on one side.

use std::fmt;

/// Join key for one half-open or established TCP flow.
///
/// Not unique over time: source ports get reused, so a key is only unique
/// within the lifetime of one table entry.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Debug)]
pub struct FlowId(String);

/// `srcIP_destPort`, the flow ID with its source port dropped.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Debug)]
pub struct RelaxedKey(String);

impl FlowId {
    pub fn new(src_ip: &str, dest_port: u16, src_port: u16) -> Self {
        FlowId(format!("{}_{}+{}", src_ip, dest_port, src_port))
    }

    /// Builds a key from raw conntrack fields, which arrive as text.
    pub fn from_parts(src_ip: &str, dest_port: &str, src_port: &str) -> Self {
        FlowId(format!("{}_{}+{}", src_ip, dest_port, src_port))
    }

    pub fn relaxed(&self) -> RelaxedKey {
        let prefix = match self.0.rfind('+') {
            Some(idx) => &self.0[..idx],
            None      => self.0.as_str(),
        };
        RelaxedKey(prefix.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RelaxedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_source_dest_port_and_source_port() {
        let id = FlowId::new("1.2.3.4", 80, 5555);
        assert_eq!(id.as_str(), "1.2.3.4_80+5555");
        assert_eq!(id, FlowId::from_parts("1.2.3.4", "80", "5555"));
    }

    #[test]
    fn relaxed_key_ignores_source_port() {
        let a = FlowId::new("10.0.0.1", 443, 40000);
        let b = FlowId::new("10.0.0.1", 443, 40005);
        assert_ne!(a, b);
        assert_eq!(a.relaxed(), b.relaxed());
        assert_eq!(a.relaxed().to_string(), "10.0.0.1_443");
    }

    #[test]
    fn relaxed_key_keeps_ipv6_colons() {
        let id = FlowId::new("fe80::1", 22, 1000);
        assert_eq!(id.relaxed().to_string(), "fe80::1_22");
    }
}
