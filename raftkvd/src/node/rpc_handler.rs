//! RPC server: accepts member and client connections, decodes frames and
//! runs the consensus handlers.
use std::cmp;
use std::sync::Arc;
use std::time::Instant;

use raftkvd_api::net::{self, Frame};
use raftkvd_api::{
    AppendRequest, ClientRequest, ClientResponse, LogIndex, LogRecord, Method, NodeId, OpType,
    Operation, RecoverySnapshot, Response, VoteRequest,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::ioutil::BufferedFile;
use crate::node::NodeShared;
use crate::state::{RecoverySink, Role};
use crate::store;

pub(crate) struct RpcHandler {
    #[allow(unused)]
    join_handle: tokio::task::JoinHandle<()>,
}

impl RpcHandler {
    pub fn new(shared: Arc<NodeShared>, listener: std::net::TcpListener) -> anyhow::Result<Self> {
        let handle = shared.handle.clone();
        let join_handle = handle.spawn(async move {
            let listener =
                tokio::net::TcpListener::from_std(listener).expect("listener registration");
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        trace!(%peer_addr, "accepted connection");
                        tokio::spawn(serve_connection(shared.clone(), stream));
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                }
            }
        });
        Ok(Self { join_handle })
    }
}

async fn serve_connection(shared: Arc<NodeShared>, stream: TcpStream) {
    let (mut read_half, write_half) = stream.into_split();

    // responses may finish out of order (an Append waits on the flusher
    // while a Vote flies past it); a writer task serializes them
    let (response_tx, mut responses) = mpsc::channel::<Frame>(64);
    let writer = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(frame) = responses.recv().await {
            if net::write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        match net::read_frame(&mut read_half, shared.params.max_message_size).await {
            Ok(Some(frame)) => {
                let shared = shared.clone();
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let my_id = shared.params.id;
                    if let Some(body) = dispatch(&shared, frame.sender, frame.method, &frame.body).await {
                        let _ = response_tx
                            .send(Frame {
                                request_id: frame.request_id,
                                method: frame.method,
                                sender: my_id,
                                body,
                            })
                            .await;
                    }
                });
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "connection read failed");
                break;
            }
        }
    }

    drop(response_tx);
    let _ = writer.await;
}

async fn dispatch(
    shared: &Arc<NodeShared>,
    sender: NodeId,
    method: u8,
    body: &[u8],
) -> Option<Vec<u8>> {
    match Method::from(method) {
        Method::Vote => {
            let request = decode_or_log::<VoteRequest>(body)?;
            Some(handle_vote(shared, request).encode())
        }
        Method::Append => {
            let request = decode_or_log::<AppendRequest>(body)?;
            Some(handle_append(shared, sender, request).await.encode())
        }
        Method::Client => {
            let request = decode_or_log::<ClientRequest>(body)?;
            Some(handle_client(shared, request).await.encode())
        }
        Method::Recover => {
            let request = decode_or_log::<RecoverySnapshot>(body)?;
            Some(handle_recovery_snapshot(shared, request).encode())
        }
        Method::Other => {
            debug!(method, "request with unknown method");
            None
        }
    }
}

fn decode_or_log<T: WireDecode>(body: &[u8]) -> Option<T> {
    match T::decode_wire(body) {
        Ok(message) => Some(message),
        Err(err) => {
            debug!(%err, "undecodable request body");
            None
        }
    }
}

/// Monomorphic decode entry points, so the dispatcher can stay generic.
trait WireDecode: Sized {
    fn decode_wire(body: &[u8]) -> binrw::BinResult<Self>;
}

macro_rules! impl_wire_decode {
    ($($ty:ty),* $(,)?) => {$(
        impl WireDecode for $ty {
            fn decode_wire(body: &[u8]) -> binrw::BinResult<Self> {
                Self::decode(body)
            }
        }
    )*};
}

impl_wire_decode!(VoteRequest, AppendRequest, ClientRequest, RecoverySnapshot);

fn handle_vote(shared: &Arc<NodeShared>, request: VoteRequest) -> Response {
    info!(
        candidate = %request.vote_for,
        ts = %request.ts,
        term = %request.term,
        "received vote request"
    );
    let mut state = shared.state();
    if !shared.is_member(request.vote_for) {
        return state.create_response(false);
    }

    let outcome = state.decide_vote(&request);
    if outcome.start_election {
        shared.triggers.elector.trigger();
    }
    if outcome.grant {
        // persisted before answering; the grant must survive a crash
        shared.vote_store().store(&request);
        state.leader_id = Some(request.vote_for);
        info!(candidate = %request.vote_for, "granted vote");
        state.create_response(true)
    } else {
        info!(
            candidate = %request.vote_for,
            their_ts = %request.ts,
            my_ts = %state.durable_ts,
            "denied vote"
        );
        state.create_response(false)
    }
}

async fn handle_append(
    shared: &Arc<NodeShared>,
    sender: NodeId,
    request: AppendRequest,
) -> Response {
    let (mut flush_event, has_new_records) = {
        let mut state = shared.state();
        if !shared.is_member(sender) {
            return state.create_response(false);
        }
        if request.term < state.current_term {
            return state.create_response(false);
        }
        if request.term > state.current_term {
            info!(term = %request.term, "stale term, becoming follower");
            state.current_term = request.term;
        }
        state.role = Role::Follower;
        state.latest_heartbeat = Some(Instant::now());
        state.leader_id = Some(sender);

        let has_new_records = state.integrate_records(request.records);
        let target = cmp::min(request.applied_ts, state.durable_ts);
        state.advance_to(target);
        (state.flush_event.subscribe(), has_new_records)
    };

    if has_new_records {
        shared.triggers.flusher.trigger();
    }

    // the reply is held back until the appended records are durable
    if flush_event.changed().await.is_err() {
        return shared.state().create_response(false);
    }
    shared.state().create_response(true)
}

async fn handle_client(shared: &Arc<NodeShared>, request: ClientRequest) -> ClientResponse {
    let commit = {
        let mut state = shared.state();
        match state.role {
            Role::Follower => {
                return match state.leader_id {
                    Some(leader) => {
                        debug!(%leader, "redirecting client to the leader");
                        ClientResponse {
                            success: false,
                            should_retry: true,
                            retry_to: leader,
                            entries: Vec::new(),
                        }
                    }
                    None => ClientResponse::failure(),
                };
            }
            Role::Candidate => return ClientResponse::failure(),
            Role::Leader => {}
        }
        if state.applied_ts < state.read_barrier_ts {
            // a fresh leader may not serve reads until it caught up with
            // everything it acknowledged in earlier terms
            return ClientResponse::failure();
        }

        let mut writes = Vec::new();
        let mut entries = Vec::new();
        for op in request.operations {
            match op.op {
                OpType::Read => entries.push(Operation {
                    value: state.fsm.get(&op.key).cloned().unwrap_or_default(),
                    key: op.key,
                }),
                OpType::Write => writes.push(Operation {
                    key: op.key,
                    value: op.value,
                }),
            }
        }
        if !entries.is_empty() {
            // reads are served straight from the FSM; mixing in writes is
            // rejected but the read results still come back
            return ClientResponse {
                success: writes.is_empty(),
                should_retry: false,
                retry_to: NodeId::NONE,
                entries,
            };
        }

        let ts = state.next_ts;
        state.next_ts = ts.next();
        debug!(%ts, "handling client write");
        let (commit_tx, commit_rx) = oneshot::channel();
        state.commit_subscribers.insert(ts, commit_tx);
        state.buffered_log.push(LogRecord {
            ts,
            operations: writes,
        });
        commit_rx
    };

    shared.triggers.sender.trigger();
    shared.triggers.flusher.trigger();

    match commit.await {
        Ok(_) => ClientResponse {
            success: true,
            should_retry: false,
            retry_to: NodeId::NONE,
            entries: Vec::new(),
        },
        // leadership changed under the request; the write may or may not
        // survive, the client decides whether to retry
        Err(_) => ClientResponse::failure(),
    }
}

fn handle_recovery_snapshot(shared: &Arc<NodeShared>, request: RecoverySnapshot) -> Response {
    let mut state = shared.state();
    if state.role != Role::Follower {
        info!("not a follower, ignoring snapshot");
        return state.create_response(false);
    }
    if request.applied_ts <= state.applied_ts || request.term != state.current_term {
        info!(
            ts = %request.applied_ts,
            term = %request.term,
            my_ts = %state.applied_ts,
            my_term = %state.current_term,
            "ignoring snapshot"
        );
        return state.create_response(false);
    }

    let id = (request.term, request.applied_ts);
    if state.recovery.as_ref().map(|sink| sink.id) != Some(id) {
        if !request.start {
            info!("ignoring new snapshot without start marker");
            return state.create_response(false);
        }
        // a second attempt may overwrite an earlier partial file
        let path = store::snapshot_path(&shared.params.data_dir, request.applied_ts);
        let mut io = BufferedFile::create(&path);
        io.write_i64(request.size as i64);
        io.write_i64(request.applied_ts.0);
        info!(ts = %request.applied_ts, size = request.size, "start writing snapshot");
        state.recovery = Some(RecoverySink {
            io,
            id,
            remaining: request.size,
        });
    }

    {
        let sink = state.recovery.as_mut().expect("present: checked above");
        for op in &request.operations {
            sink.io.write_log_record(&LogRecord {
                ts: LogIndex::ZERO,
                operations: vec![op.clone()],
            });
            sink.remaining = sink.remaining.saturating_sub(1);
        }
    }
    for op in request.operations {
        state.fsm.insert(op.key, op.value);
    }

    if request.end {
        let remaining = state.recovery.as_ref().expect("present: checked above").remaining;
        if remaining == 0 {
            state
                .recovery
                .as_mut()
                .expect("present: checked above")
                .io
                .sync();
            state.applied_ts = request.applied_ts;
            state.durable_ts = cmp::max(state.durable_ts, state.applied_ts);
            state.next_ts = state.durable_ts.next();
            info!(applied_ts = %request.applied_ts, "recovery snapshot synced");
        } else {
            info!(remaining, "incomplete recovery snapshot discarded");
            state.recovery = None;
            return state.create_response(false);
        }
    }
    state.create_response(true)
}
