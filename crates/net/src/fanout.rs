//! RPC forwarding tree.
//!
//! A message aimed at N nodes is not sent N times. The sender splits the
//! target list into up to `fanout` contiguous chunks, contacts the head of
//! each chunk, and embeds the chunk's tail in the forward directive; the
//! head repeats the split for its tail. Replies aggregate on the way back
//! up, so the originator ends with exactly one `RetDataInfo` per target —
//! failed subtrees are filled in with synthetic `ResponseForwardFailed`
//! records rather than dropped.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use quarry_proto::{Envelope, ErrorCode, ForwardDirective, MsgBody, MsgType, RetDataInfo};

use crate::msgio::send_recv_one;

/// Split `nodes` into up to `fanout` contiguous chunks, earlier chunks no
/// smaller than later ones. Returns `(head, tail)` per chunk.
pub fn split_tree(nodes: &[String], fanout: usize) -> Vec<(String, Vec<String>)> {
    let fanout = fanout.max(1);
    let nchunks = nodes.len().min(fanout);
    let mut out = Vec::with_capacity(nchunks);
    if nchunks == 0 {
        return out;
    }
    let base = nodes.len() / nchunks;
    let extra = nodes.len() % nchunks;
    let mut start = 0;
    for i in 0..nchunks {
        let size = base + usize::from(i < extra);
        let chunk = &nodes[start..start + size];
        out.push((chunk[0].clone(), chunk[1..].to_vec()));
        start += size;
    }
    out
}

/// Number of hops needed to cover `n` nodes at the given fan-out.
pub fn tree_depth(n: usize, fanout: usize) -> u32 {
    let fanout = fanout.max(2);
    let mut depth = 0u32;
    let mut reach = 1usize;
    while reach < n.max(1) {
        reach = reach.saturating_mul(fanout).saturating_add(1);
        depth += 1;
    }
    depth
}

/// One failure record per node of a lost subtree.
pub fn failed_records(head: &str, tail: &[String], code: ErrorCode) -> Vec<RetDataInfo> {
    std::iter::once(head)
        .chain(tail.iter().map(String::as_str))
        .map(|name| RetDataInfo {
            msg_type: MsgType::ResponseForwardFailed as u16,
            rc: code.as_u32(),
            node_name: name.to_string(),
            body: None,
        })
        .collect()
}

/// Fan `body` out to `nodes` and collect one record per node.
///
/// `addrs` maps node names to `host:port`. A node without an address is
/// reported as forward-failed without any traffic. The per-hop timeout comes
/// from the directive; the wait at each level is scaled by the remaining
/// subtree depth, bounding total time to roughly `timeout * depth`.
pub async fn send_recv_msgs(
    addrs: &HashMap<String, String>,
    nodes: &[String],
    env_template: &Envelope,
    fanout: u16,
    timeout: Duration,
) -> Vec<RetDataInfo> {
    let chunks = split_tree(nodes, fanout as usize);
    let mut tasks = Vec::with_capacity(chunks.len());

    for (head, tail) in chunks {
        let addr = addrs.get(&head).cloned();
        let mut env = env_template.clone();
        env.forward = ForwardDirective {
            fanout,
            timeout_ms: timeout.as_millis() as u32,
            nodes: tail.clone(),
        };
        let hop_budget = timeout * (tree_depth(tail.len() + 1, fanout as usize) + 1);
        tasks.push(tokio::spawn(async move {
            let Some(addr) = addr else {
                return failed_records(&head, &tail, ErrorCode::InvalidNodeName);
            };
            match send_recv_one(&addr, &env, hop_budget).await {
                Ok(reply) => match reply.body {
                    MsgBody::ForwardAggregate { records } => {
                        reconcile_records(&head, &tail, records)
                    }
                    other => {
                        debug!(node = %head, msg_type = ?other.msg_type(),
                               "unexpected fan-out reply type");
                        failed_records(&head, &tail, ErrorCode::UnexpectedMessage)
                    }
                },
                Err(err) => {
                    debug!(node = %head, %err, "fan-out send failed");
                    failed_records(&head, &tail, err.error_code())
                }
            }
        }));
    }

    let mut records = Vec::with_capacity(nodes.len());
    for task in tasks {
        match task.await {
            Ok(mut recs) => records.append(&mut recs),
            Err(_) => {}
        }
    }
    records
}

/// Guarantee exactly one record per subtree node: missing nodes get
/// synthetic failures, stray extras are dropped.
fn reconcile_records(
    head: &str,
    tail: &[String],
    records: Vec<RetDataInfo>,
) -> Vec<RetDataInfo> {
    let mut expected: Vec<&str> = std::iter::once(head)
        .chain(tail.iter().map(String::as_str))
        .collect();
    let mut out = Vec::with_capacity(expected.len());
    for rec in records {
        if let Some(pos) = expected.iter().position(|n| *n == rec.node_name) {
            expected.remove(pos);
            out.push(rec);
        }
    }
    for name in expected {
        out.push(RetDataInfo {
            msg_type: MsgType::ResponseForwardFailed as u16,
            rc: ErrorCode::ForwardFailed.as_u32(),
            node_name: name.to_string(),
            body: None,
        });
    }
    out
}

/// Return code carried by a result record, looking inside aggregated bodies
/// when present.
pub fn record_return_code(rec: &RetDataInfo) -> u32 {
    match rec.body.as_deref() {
        Some(MsgBody::Rc { rc }) => *rc,
        Some(MsgBody::LaunchTasksResponse { rc, .. }) => *rc,
        Some(MsgBody::ReattachTasksResponse { rc, .. }) => *rc,
        _ => rec.rc,
    }
}
