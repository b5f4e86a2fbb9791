//! Election driver: watches the heartbeat freshness and campaigns for
//! leadership when the quorum looks dead.
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::Rng;
use raftkvd_api::{Method, NodeId, Response, TermId, VoteRequest};
use tracing::{debug, info};

use crate::node::NodeShared;
use crate::state::Role;
use crate::task::{await_tick, AutoJoinHandle, PanicGuard};

pub(crate) fn spawn(shared: Arc<NodeShared>, ticks: flume::Receiver<()>) -> AutoJoinHandle {
    AutoJoinHandle::spawn(move || {
        let guard = PanicGuard::new("elector", shared.panic_flag());
        while !shared.is_node_shutting_down() {
            if !await_tick(&ticks, shared.params.election_timeout) {
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
    let members = shared.params.members.len();
    let term = {
        let mut state = shared.state();
        let now = Instant::now();
        let latest_heartbeat = match state.role {
            Role::Leader => {
                // a leader judges its own health by the median peer
                // round-trip: fresh means a quorum still follows
                let mut times: Vec<Option<Instant>> = state
                    .follower_heartbeats
                    .iter()
                    .enumerate()
                    .filter(|(id, _)| *id != shared.params.id.idx())
                    .map(|(_, time)| *time)
                    .collect();
                if times.is_empty() {
                    return;
                }
                times.sort_unstable();
                times[(members / 2).min(times.len() - 1)]
            }
            _ => state.latest_heartbeat,
        };
        if latest_heartbeat
            .is_some_and(|heartbeat| heartbeat + shared.params.election_timeout > now)
        {
            return;
        }

        info!("starting elections");
        state.current_term = state.current_term.next();
        state.voted_for_me.clear();
        state.role = Role::Candidate;
        state.leader_id = None;
        state.latest_heartbeat = Some(now);
        state.current_term
    };

    // desynchronize colliding candidates with a random fraction of the
    // election timeout
    let fraction = rand::thread_rng().gen_range(0..members as u32);
    thread::sleep(shared.params.election_timeout * fraction / (2 * members as u32));

    let request = {
        let mut state = shared.state();
        if state.current_term != term {
            return;
        }
        if state.leader_id.is_some_and(|leader| leader != shared.params.id) {
            // somebody got our vote during the sleep
            return;
        }
        state.leader_id = Some(shared.params.id);
        let self_vote = VoteRequest {
            term,
            ts: state.durable_ts,
            vote_for: shared.params.id,
        };
        shared.vote_store().store(&self_vote);
        state.voted_for_me.insert(shared.params.id);
        self_vote
    };

    for peer in shared.peer_ids() {
        let shared = shared.clone();
        let handle = shared.handle.clone();
        handle.spawn(async move {
            let result = shared
                .bus
                .request(
                    peer,
                    Method::Vote,
                    request.encode(),
                    shared.params.heartbeat_timeout,
                )
                .await;
            match result.and_then(|body| Ok(Response::decode(&body)?)) {
                Ok(response) => on_vote_response(&shared, peer, term, response),
                Err(err) => debug!(%peer, %err, "vote request failed"),
            }
        });
    }
}

fn on_vote_response(shared: &Arc<NodeShared>, peer: NodeId, term: TermId, response: Response) {
    if !response.success {
        return;
    }
    let mut state = shared.state();
    state.next_timestamps[peer.idx()] = response.next_ts;
    state.durable_timestamps[peer.idx()] = response.durable_ts;
    state.follower_heartbeats[peer.idx()] = Some(Instant::now());

    if state.current_term != term {
        return;
    }
    info!(%peer, durable_ts = %response.durable_ts, "granted vote");
    state.voted_for_me.insert(peer);

    let majority = shared.params.members.len() / 2;
    if state.voted_for_me.len() > majority && state.role != Role::Leader {
        state.transition_to_leader();
        info!(
            applied_ts = %state.applied_ts,
            read_barrier_ts = %state.read_barrier_ts,
            "becoming leader"
        );
    }
}
