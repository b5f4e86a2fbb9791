//! Stale-node recovery agent: brings peers that fell behind the in-memory
//! log suffix back up to date with a snapshot stream plus changelog replay.
use std::cmp;
use std::sync::Arc;

use raftkvd_api::{
    AppendRequest, LogIndex, LogRecord, Method, NodeId, Operation, RecoverySnapshot, Response,
    TermId,
};
use tracing::{debug, info, warn};

use crate::node::NodeShared;
use crate::state::Role;
use crate::store::{self, Snapshot};
use crate::task::{await_tick, AutoJoinHandle, PanicGuard};

pub(crate) fn spawn(shared: Arc<NodeShared>, ticks: flume::Receiver<()>) -> AutoJoinHandle {
    AutoJoinHandle::spawn(move || {
        let guard = PanicGuard::new("stale-recovery", shared.panic_flag());
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
    let (term, stale_peers) = {
        let state = shared.state();
        if state.role != Role::Leader {
            return;
        }
        // anything below the buffered suffix cannot be served by heartbeats
        let floor = state
            .buffered_log
            .first()
            .map(|record| record.ts)
            .unwrap_or(state.applied_ts);
        let stale_peers: Vec<(NodeId, LogIndex)> = shared
            .peer_ids()
            .filter(|peer| state.next_timestamps[peer.idx()] < floor)
            .map(|peer| (peer, state.next_timestamps[peer.idx()]))
            .collect();
        (state.current_term, stale_peers)
    };

    for (peer, next) in stale_peers {
        if shared.is_node_shutting_down() {
            return;
        }
        recover_peer(shared, term, peer, next);
    }
}

fn recover_peer(shared: &Arc<NodeShared>, term: TermId, peer: NodeId, mut next: LogIndex) {
    info!(%peer, from = %next, "starting recovery");

    let dir = &shared.params.data_dir;
    let snapshots = match store::discover_snapshots(dir) {
        Ok(snapshots) => snapshots,
        Err(err) => {
            warn!(%err, "snapshot discovery failed");
            return;
        }
    };

    // newest readable snapshot that still covers the peer's position
    for number in snapshots.iter().rev() {
        let path = store::snapshot_path(dir, LogIndex(*number as i64));
        let Some(snapshot) = store::read_snapshot(&path) else {
            warn!(number, "skipping snapshot that does not parse cleanly");
            continue;
        };
        if snapshot.applied_ts < next {
            // older snapshots cannot help either
            break;
        }
        if !stream_snapshot(shared, term, peer, &snapshot) {
            return;
        }
        next = snapshot.applied_ts.next();
        break;
    }

    replay_changelogs(shared, term, peer, next);
}

/// Stream the snapshot in `rpc_max_batch`-operation chunks. Every chunk
/// carries the stream identity; `start`/`end` delimit it.
fn stream_snapshot(
    shared: &Arc<NodeShared>,
    term: TermId,
    peer: NodeId,
    snapshot: &Snapshot,
) -> bool {
    info!(%peer, ts = %snapshot.applied_ts, entries = snapshot.fsm.len(), "sending snapshot");
    let size = snapshot.fsm.len() as u64;
    let mut start = true;
    let mut operations = Vec::new();

    for (key, value) in &snapshot.fsm {
        operations.push(Operation {
            key: key.clone(),
            value: value.clone(),
        });
        if operations.len() >= shared.params.rpc_max_batch {
            let chunk = RecoverySnapshot {
                term,
                applied_ts: snapshot.applied_ts,
                size,
                start,
                end: false,
                operations: std::mem::take(&mut operations),
            };
            if !send_chunk(shared, peer, chunk) {
                return false;
            }
            start = false;
        }
        if shared.is_node_shutting_down() {
            return false;
        }
    }

    let last = RecoverySnapshot {
        term,
        applied_ts: snapshot.applied_ts,
        size,
        start,
        end: true,
        operations,
    };
    send_chunk(shared, peer, last)
}

fn send_chunk(shared: &Arc<NodeShared>, peer: NodeId, chunk: RecoverySnapshot) -> bool {
    let result = shared.handle.block_on(shared.bus.request(
        peer,
        Method::Recover,
        chunk.encode(),
        shared.params.heartbeat_timeout,
    ));
    match result.and_then(|body| Ok(Response::decode(&body)?)) {
        Ok(response) if response.success => true,
        Ok(_) => {
            debug!(%peer, "peer rejected snapshot chunk");
            false
        }
        Err(err) => {
            debug!(%peer, %err, "failed to send snapshot chunk");
            false
        }
    }
}

fn replay_changelogs(shared: &Arc<NodeShared>, _term: TermId, peer: NodeId, next: LogIndex) {
    info!(%peer, from = %next, "replaying changelogs");
    let dir = &shared.params.data_dir;
    let changelogs = match store::discover_changelogs(dir) {
        Ok(changelogs) => changelogs,
        Err(err) => {
            warn!(%err, "changelog discovery failed");
            return;
        }
    };

    // Pick the files that may contain records at or past `next` (newest
    // first, stop below it), then replay oldest first so rewrites of a
    // truncated suffix win.
    let mut replay = Vec::new();
    for number in changelogs.iter().rev() {
        let path = store::changelog_path(dir, *number);
        let header_ts = match store::open_changelog(&path) {
            Ok(Some((header_ts, _))) => header_ts,
            Ok(None) => continue,
            Err(err) => {
                warn!(number, %err, "skipping unreadable changelog");
                continue;
            }
        };
        replay.push(*number);
        if header_ts < next {
            break;
        }
    }

    let mut records: Vec<LogRecord> = Vec::new();
    for number in replay.into_iter().rev() {
        let path = store::changelog_path(dir, number);
        let Ok(Some((_, mut reader))) = store::open_changelog(&path) else {
            continue;
        };
        while let Some(record) = reader.read_log_record() {
            if record.ts < next {
                continue;
            }
            let idx = (record.ts - next) as usize;
            if records.len() <= idx {
                records.resize(idx + 1, LogRecord::default());
            }
            records[idx] = record;
        }
    }

    // the term may have moved while we were reading files; recheck before
    // speaking for it
    let term = {
        let state = shared.state();
        if state.role != Role::Leader {
            return;
        }
        state.current_term
    };

    let mut new_next = next;
    for batch in records.chunks(shared.params.rpc_max_batch) {
        if shared.is_node_shutting_down() {
            return;
        }
        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            debug!(%peer, from = %first.ts, to = %last.ts, "sending changelog records");
        }
        let request = AppendRequest {
            term,
            // replication by replay does not advance the peer's commit; the
            // next heartbeat does
            applied_ts: LogIndex::NONE,
            records: batch.to_vec(),
        };
        let result = shared.handle.block_on(shared.bus.request(
            peer,
            Method::Append,
            request.encode(),
            shared.params.heartbeat_timeout,
        ));
        match result.and_then(|body| Ok(Response::decode(&body)?)) {
            Ok(response) if response.success => new_next = response.next_ts,
            Ok(_) => {
                debug!(%peer, "peer rejected changelog replay");
                return;
            }
            Err(err) => {
                debug!(%peer, %err, "failed to send changelog records");
                return;
            }
        }
    }

    info!(%peer, next = %new_next, "recovery acknowledged");
    let mut state = shared.state();
    let slot = &mut state.next_timestamps[peer.idx()];
    *slot = cmp::max(*slot, new_next);
}
