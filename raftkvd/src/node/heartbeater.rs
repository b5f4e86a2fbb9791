//! Leader heartbeat: replicates the buffered log suffix to every peer and
//! advances the quorum-applied position from their answers.
use std::sync::Arc;
use std::time::Instant;

use raftkvd_api::{AppendRequest, Method, NodeId, Response};
use tracing::debug;

use crate::node::NodeShared;
use crate::state::Role;
use crate::task::{await_tick, AutoJoinHandle, PanicGuard};

pub(crate) fn spawn(shared: Arc<NodeShared>, ticks: flume::Receiver<()>) -> AutoJoinHandle {
    AutoJoinHandle::spawn(move || {
        let guard = PanicGuard::new("heartbeater", shared.panic_flag());
        while !shared.is_node_shutting_down() {
            if !await_tick(&ticks, shared.params.heartbeat_interval) {
                break;
            }
            if shared.is_node_shutting_down() {
                break;
            }
            run(&shared);
        }
        guard.done();
    })
}

fn run(shared: &Arc<NodeShared>) {
    let batches = {
        let state = shared.state();
        if state.role != Role::Leader {
            return;
        }

        let mut batches = Vec::new();
        for peer in shared.peer_ids() {
            let mut records = Vec::new();
            if let Some(first) = state.buffered_log.first() {
                let next_ts = state.next_timestamps[peer.idx()];
                // peers behind the buffered suffix get an empty heartbeat;
                // the stale-node agent owns their catch-up
                if next_ts >= first.ts {
                    let start = (next_ts - first.ts) as usize;
                    records = state
                        .buffered_log
                        .iter()
                        .skip(start)
                        .take(shared.params.rpc_max_batch)
                        .cloned()
                        .collect();
                }
            }
            if !records.is_empty() {
                debug!(%peer, count = records.len(), "sending records");
            }
            batches.push((
                peer,
                AppendRequest {
                    term: state.current_term,
                    applied_ts: state.applied_ts,
                    records,
                },
            ));
        }
        batches
    };

    for (peer, request) in batches {
        let shared = shared.clone();
        let handle = shared.handle.clone();
        handle.spawn(async move {
            let result = shared
                .bus
                .request(
                    peer,
                    Method::Append,
                    request.encode(),
                    shared.params.heartbeat_timeout,
                )
                .await;
            match result.and_then(|body| Ok(Response::decode(&body)?)) {
                Ok(response) => on_append_response(&shared, peer, response),
                Err(err) => debug!(%peer, %err, "heartbeat failed"),
            }
        });
    }
}

fn on_append_response(shared: &Arc<NodeShared>, peer: NodeId, response: Response) {
    let subscribers = {
        let mut state = shared.state();
        if !response.success {
            debug!(%peer, "peer rejected heartbeat");
            return;
        }
        state.next_timestamps[peer.idx()] = response.next_ts;
        state.durable_timestamps[peer.idx()] = response.durable_ts;
        state.follower_heartbeats[peer.idx()] = Some(Instant::now());
        debug!(
            %peer,
            next_ts = %response.next_ts,
            durable_ts = %response.durable_ts,
            "peer acknowledged heartbeat"
        );
        state.advance_applied_timestamp();
        state.pick_subscribers()
    };
    for subscriber in subscribers {
        let _ = subscriber.send(true);
    }
}
