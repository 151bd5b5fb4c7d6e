//! Read-only telemetry snapshot. Runs on the loop thread, so no locking is
//! required — it simply walks whatever `Flow`s `Context` currently owns.

use crate::flow::{Flow, FlowState};
use serde_json::{json, Value};

/// Builds the JSON document for one flow: remote host, socket type,
/// chosen protocol stack (as its wire integer), and port. Flows that
/// haven't chosen a candidate yet report `null` for the connection-shaped
/// fields rather than being omitted, so a snapshot always lists every
/// live flow.
fn flow_json(flow: &Flow) -> Value {
    match &flow.chosen {
        Some(candidate) => json!({
            "remote_host": candidate.dest.ip().to_string(),
            "port": candidate.dest.port(),
            "socket_type": socket_type_name(candidate.stack as i32),
            "protocol_stack": candidate.stack as i32,
            "state": state_name(flow.state),
        }),
        None => json!({
            "remote_host": Value::Null,
            "port": Value::Null,
            "socket_type": Value::Null,
            "protocol_stack": Value::Null,
            "state": state_name(flow.state),
        }),
    }
}

fn socket_type_name(stack: i32) -> &'static str {
    match stack {
        1 => "SOCK_STREAM",
        2 => "SOCK_SEQPACKET",
        3 | 4 => "SOCK_DGRAM",
        5 => "SOCK_SEQPACKET",
        _ => "unknown",
    }
}

fn state_name(state: FlowState) -> &'static str {
    match state {
        FlowState::Idle => "IDLE",
        FlowState::Resolving => "RESOLVING",
        FlowState::Connecting => "CONNECTING",
        FlowState::Open => "OPEN",
        FlowState::Closing => "CLOSING",
        FlowState::Closed => "CLOSED",
        FlowState::Error => "ERROR",
    }
}

/// Builds a full snapshot document: the per-flow array plus a total count.
pub fn snapshot<'a>(flows: impl Iterator<Item = &'a Flow>) -> Value {
    let entries: Vec<Value> = flows.map(flow_json).collect();
    json!({
        "flow_count": entries.len(),
        "flows": entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{CandidateId, FlowId, Stack};
    use crate::property::PropertyDocument;

    #[test]
    fn snapshot_reports_count_and_idle_flow() {
        let flow = Flow::new(FlowId(0), PropertyDocument::default());
        let snap = snapshot(std::iter::once(&flow));
        assert_eq!(snap["flow_count"], 1);
        assert_eq!(snap["flows"][0]["state"], "IDLE");
        assert!(snap["flows"][0]["remote_host"].is_null());
    }

    #[test]
    fn snapshot_reports_chosen_candidate_of_open_flow() {
        let mut flow = Flow::new(FlowId(1), PropertyDocument::default());
        flow.state = FlowState::Open;
        flow.chosen = Some(crate::flow::Candidate {
            id: CandidateId(0),
            source: "192.0.2.1".parse().unwrap(),
            dest: "203.0.113.9:443".parse().unwrap(),
            stack: Stack::Tcp,
            internal: false,
        });

        let snap = snapshot(std::iter::once(&flow));
        assert_eq!(snap["flows"][0]["remote_host"], "203.0.113.9");
        assert_eq!(snap["flows"][0]["port"], 443);
        assert_eq!(snap["flows"][0]["protocol_stack"], 1);
        assert_eq!(snap["flows"][0]["socket_type"], "SOCK_STREAM");
    }
}
