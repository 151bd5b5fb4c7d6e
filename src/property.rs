//! Property Engine: parses a property document, merges the policy
//! manager's reply back in, and enumerates the ranked transport list a
//! flow should try.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-value priority in a property document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Optional = 0,
    Requested = 1,
    Immutable = 2,
}

impl Precedence {
    fn from_raw(raw: &Value) -> Option<Self> {
        let n = raw.as_i64()?;
        match n {
            0 => Some(Precedence::Optional),
            1 => Some(Precedence::Requested),
            2 => Some(Precedence::Immutable),
            _ => None,
        }
    }
}

/// A single `{value, precedence}` entry in the `transport` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEntry {
    pub value: String,
    pub precedence: Value,
}

/// The property document exchanged with the PM and consulted by the Flow
/// State Machine. `transport` is modeled explicitly since its shape drives
/// selection; every other top-level key is preserved verbatim in `extra`
/// so the PM round-trip doesn't lose fields this core doesn't interpret.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PropertyDocument {
    #[serde(default)]
    pub transport: Vec<TransportEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PropertyDocument {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|_| Error::InvalidProperty)
    }

    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| Error::InvalidProperty)
    }

    /// Merges an unsolicited or requested PM reply document back into
    /// `self`. The reply's `transport` entries replace ours outright
    /// (the PM is authoritative once consulted); unrecognized keys in the
    /// reply are merged into `extra`, overwriting on key collision.
    pub fn merge_reply(&mut self, reply: PropertyDocument) {
        if !reply.transport.is_empty() {
            self.transport = reply.transport;
        }
        for (k, v) in reply.extra {
            self.extra.insert(k, v);
        }
    }

    /// Three-pass enumeration over `transport`: collect precedence-2
    /// entries, then precedence-1, then precedence-0, capped at
    /// `max_num_proto`. Entries with a missing, non-integer, or
    /// out-of-range precedence are logged and skipped. Fails with
    /// `InvalidProperty` if more than one entry is at precedence 2.
    pub fn enabled_transports(&self, max_num_proto: usize) -> Result<Vec<String>> {
        let mut immutable = Vec::new();
        let mut requested = Vec::new();
        let mut optional = Vec::new();

        for entry in &self.transport {
            match Precedence::from_raw(&entry.precedence) {
                Some(Precedence::Immutable) => immutable.push(entry.value.clone()),
                Some(Precedence::Requested) => requested.push(entry.value.clone()),
                Some(Precedence::Optional) => optional.push(entry.value.clone()),
                None => {
                    tracing::debug!(
                        value = %entry.value,
                        precedence = %entry.precedence,
                        "skipping transport entry with invalid precedence"
                    );
                }
            }
        }

        if immutable.len() > 1 {
            return Err(Error::InvalidProperty);
        }

        let mut ordered = immutable;
        ordered.extend(requested);
        ordered.extend(optional);
        ordered.truncate(max_num_proto);

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(entries: &[(&str, i64)]) -> PropertyDocument {
        PropertyDocument {
            transport: entries
                .iter()
                .map(|(v, p)| TransportEntry {
                    value: v.to_string(),
                    precedence: Value::from(*p),
                })
                .collect(),
            extra: Map::new(),
        }
    }

    #[test]
    fn orders_by_precedence_descending() {
        let d = doc(&[("UDP", 0), ("TCP", 2), ("SCTP", 1)]);
        assert_eq!(
            d.enabled_transports(8).unwrap(),
            vec!["TCP".to_string(), "SCTP".to_string(), "UDP".to_string()]
        );
    }

    #[test]
    fn caps_at_max_num_proto() {
        let d = doc(&[("A", 0), ("B", 0), ("C", 0)]);
        assert_eq!(d.enabled_transports(2).unwrap().len(), 2);
    }

    #[test]
    fn rejects_more_than_one_immutable() {
        let d = doc(&[("TCP", 2), ("SCTP", 2)]);
        assert!(matches!(
            d.enabled_transports(8),
            Err(Error::InvalidProperty)
        ));
    }

    #[test]
    fn skips_invalid_precedence_without_failing() {
        let mut d = doc(&[("TCP", 1)]);
        d.transport.push(TransportEntry {
            value: "SCTP".to_string(),
            precedence: Value::String("not-a-number".to_string()),
        });
        assert_eq!(d.enabled_transports(8).unwrap(), vec!["TCP".to_string()]);
    }

    #[test]
    fn round_trips_through_serialize_parse() {
        let d = doc(&[("TCP", 1), ("UDP", 0)]);
        let wire = d.to_wire().unwrap();
        let back = PropertyDocument::parse(&wire).unwrap();
        assert_eq!(back.enabled_transports(8).unwrap(), vec!["TCP", "UDP"]);
    }

    #[test]
    fn merge_reply_preserves_unknown_keys() {
        let mut d = doc(&[("TCP", 1)]);
        d.extra.insert("flow_group".to_string(), Value::from("a"));

        let mut reply = PropertyDocument::default();
        reply
            .extra
            .insert("congestion_control".to_string(), Value::from("reno"));

        d.merge_reply(reply);

        assert_eq!(d.extra.get("flow_group").unwrap(), "a");
        assert_eq!(d.extra.get("congestion_control").unwrap(), "reno");
        assert_eq!(d.enabled_transports(8).unwrap(), vec!["TCP"]);
    }
}
