mod elector;
mod flusher;
mod heartbeater;
mod rotator;
mod rpc_handler;
mod stale_recovery;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use raftkvd_api::{LogIndex, NodeId, TermId};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

use crate::bus::Bus;
use crate::ioutil::BufferedFile;
use crate::node::rpc_handler::RpcHandler;
use crate::state::{NodeState, Role};
use crate::store::{self, VoteStore};
use crate::task::{AutoJoinHandle, Trigger};

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    pub id: NodeId,

    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub listen: SocketAddr,

    /// Address of every cluster member, indexed by node id
    pub members: Vec<SocketAddr>,

    /// Base path where changelogs, snapshots and the vote record live
    pub data_dir: PathBuf,

    #[builder(default = Parameters::DEFAULT_HEARTBEAT_TIMEOUT)]
    pub heartbeat_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: Duration,
    #[builder(default = Parameters::DEFAULT_ELECTION_TIMEOUT)]
    pub election_timeout: Duration,
    #[builder(default = Parameters::DEFAULT_ROTATE_INTERVAL)]
    pub rotate_interval: Duration,
    #[builder(default = Parameters::DEFAULT_FLUSH_INTERVAL)]
    pub flush_interval: Duration,

    /// Most records (or snapshot operations) per RPC
    #[builder(default = Parameters::DEFAULT_RPC_MAX_BATCH)]
    pub rpc_max_batch: usize,
    /// Applied records linger in the buffer this far behind `applied_ts`
    #[builder(default = Parameters::DEFAULT_APPLIED_BACKLOG)]
    pub applied_backlog: i64,
    #[builder(default = Parameters::DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
}

impl Parameters {
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_ROTATE_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
    pub const DEFAULT_RPC_MAX_BATCH: usize = 128;
    pub const DEFAULT_APPLIED_BACKLOG: i64 = 1024;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 10;
}

pub(crate) struct Triggers {
    pub elector: Trigger,
    pub flusher: Trigger,
    pub rotator: Trigger,
    pub sender: Trigger,
    pub stale_agent: Trigger,
}

impl Triggers {
    fn wake_all(&self) {
        self.elector.trigger();
        self.flusher.trigger();
        self.rotator.trigger();
        self.sender.trigger();
        self.stale_agent.trigger();
    }
}

pub(crate) struct NodeShared {
    pub params: Parameters,

    is_node_shutting_down: Arc<AtomicBool>,

    /// The one exclusive lock over the node's authoritative state
    state: Mutex<NodeState>,
    /// Active changelog; lock order is changelog before state
    changelog: Mutex<BufferedFile>,
    vote_store: Mutex<VoteStore>,

    pub bus: Bus,
    pub handle: tokio::runtime::Handle,
    pub triggers: Triggers,
}

impl NodeShared {
    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().expect("locking failed")
    }

    pub fn changelog(&self) -> MutexGuard<'_, BufferedFile> {
        self.changelog.lock().expect("locking failed")
    }

    pub fn vote_store(&self) -> MutexGuard<'_, VoteStore> {
        self.vote_store.lock().expect("locking failed")
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn panic_flag(&self) -> Arc<AtomicBool> {
        self.is_node_shutting_down.clone()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.params.members.len() as u64)
            .map(NodeId)
            .filter(|id| *id != self.params.id)
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        (id.0 as usize) < self.params.members.len()
    }
}

/// Point-in-time view of a node's consensus position, for operators and
/// tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: Role,
    pub term: TermId,
    pub leader_id: Option<NodeId>,
    pub durable_ts: LogIndex,
    pub applied_ts: LogIndex,
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    local_addr: SocketAddr,
    shared: Arc<NodeShared>,
}

impl NodeCtrl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
        self.shared.triggers.wake_all();
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.shared.state();
        NodeStatus {
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            durable_ts: state.durable_ts,
            applied_ts: state.applied_ts,
        }
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    local_addr: SocketAddr,
    shared: Arc<NodeShared>,
    /// Periodic workers; joined before the runtime goes away so their
    /// outstanding RPCs can still complete
    workers: Vec<AutoJoinHandle>,
    #[allow(unused)]
    rpc_handler: RpcHandler,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Node {
    pub fn new(params: Parameters) -> anyhow::Result<Self> {
        info!(
            id = %params.id,
            listen = %params.listen,
            "data-dir" = %params.data_dir.display(),
            "Starting raftkvd"
        );
        anyhow::ensure!(
            (params.id.0 as usize) < params.members.len(),
            "node id {} outside the {}-member cluster",
            params.id,
            params.members.len()
        );

        std::fs::create_dir_all(&params.data_dir)?;
        let vote_store = VoteStore::new(&params.data_dir);
        let (state, changelog) = recover(&params, &vote_store)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        let listener = std::net::TcpListener::bind(params.listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let (elector_trigger, elector_ticks) = Trigger::new();
        let (flusher_trigger, flusher_ticks) = Trigger::new();
        let (rotator_trigger, rotator_ticks) = Trigger::new();
        let (sender_trigger, sender_ticks) = Trigger::new();
        let (stale_trigger, stale_ticks) = Trigger::new();

        let bus = Bus::new(
            params.id,
            params.members.clone(),
            params.max_message_size,
            runtime.handle(),
        );

        let shared = Arc::new(NodeShared {
            is_node_shutting_down: is_node_shutting_down.clone(),
            state: Mutex::new(state),
            changelog: Mutex::new(changelog),
            vote_store: Mutex::new(vote_store),
            bus,
            handle: runtime.handle().clone(),
            triggers: Triggers {
                elector: elector_trigger,
                flusher: flusher_trigger,
                rotator: rotator_trigger,
                sender: sender_trigger,
                stale_agent: stale_trigger,
            },
            params,
        });

        let rpc_handler = RpcHandler::new(shared.clone(), listener)?;
        let workers = vec![
            elector::spawn(shared.clone(), elector_ticks),
            flusher::spawn(shared.clone(), flusher_ticks),
            rotator::spawn(shared.clone(), rotator_ticks),
            heartbeater::spawn(shared.clone(), sender_ticks),
            stale_recovery::spawn(shared.clone(), stale_ticks),
        ];

        Ok(Node {
            is_node_shutting_down,
            stop_on_drop: true,
            local_addr,
            shared,
            workers,
            rpc_handler,
            runtime: Some(runtime),
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            local_addr: self.local_addr,
            shared: self.shared.clone(),
        }
    }

    /// Block until the node stops (a signal or `NodeCtrl::stop`).
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        while !self.is_node_shutting_down.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        drop(self);
        info!("Node finished");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
        self.shared.triggers.wake_all();
        // joins the worker threads while the runtime can still complete
        // their outstanding RPCs
        self.workers.clear();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Startup recovery: newest clean snapshot, then the changelog suffix, then
/// a fresh active changelog and the persisted vote.
fn recover(
    params: &Parameters,
    vote_store: &VoteStore,
) -> anyhow::Result<(NodeState, BufferedFile)> {
    let dir = &params.data_dir;
    let snapshots = store::discover_snapshots(dir)?;
    let changelogs = store::discover_changelogs(dir)?;

    let mut state = NodeState::new(params.id, params.members.len());
    if let Some(last) = snapshots.last() {
        state.current_changelog = last + 1;
    }
    if let Some(last) = changelogs.last() {
        state.current_changelog = state.current_changelog.max(last + 1);
    }

    for number in snapshots.iter().rev() {
        let path = store::snapshot_path(dir, LogIndex(*number as i64));
        if let Some(snapshot) = store::read_snapshot(&path) {
            state.applied_ts = snapshot.applied_ts;
            state.durable_ts = snapshot.applied_ts;
            state.next_ts = snapshot.applied_ts.next();
            state.fsm = snapshot.fsm;
            break;
        }
        warn!(number, "skipping snapshot that does not parse cleanly");
    }

    // Figure out which changelogs still matter (newest first, stop at the
    // first whose header is covered by the snapshot), then replay them
    // oldest first so that rewrites of a truncated suffix win.
    let mut replay = Vec::new();
    for number in changelogs.iter().rev() {
        let path = store::changelog_path(dir, *number);
        let Some((header_ts, _)) = store::open_changelog(&path)? else {
            continue;
        };
        replay.push(*number);
        if header_ts <= state.applied_ts {
            break;
        }
    }
    for number in replay.into_iter().rev() {
        let path = store::changelog_path(dir, number);
        let Some((header_ts, mut reader)) = store::open_changelog(&path)? else {
            continue;
        };
        debug!(number, limit_ts = %header_ts, "replaying changelog");
        while let Some(record) = reader.read_log_record() {
            if record.ts <= state.applied_ts {
                continue;
            }
            let idx = (record.ts - state.applied_ts) as usize - 1;
            if state.buffered_log.len() <= idx {
                state
                    .buffered_log
                    .resize(idx + 1, raftkvd_api::LogRecord::default());
            }
            state.next_ts = state.next_ts.max(record.ts.next());
            state.durable_ts = state.durable_ts.max(record.ts);
            state.buffered_log[idx] = record;
        }
    }

    let mut changelog = BufferedFile::create(&store::changelog_path(dir, state.current_changelog));
    changelog.write_i64(state.durable_ts.0);

    if let Some(vote) = vote_store.recover() {
        state.current_term = vote.term;
        state.leader_id = Some(vote.vote_for);
    }

    info!(
        term = %state.current_term,
        durable_ts = %state.durable_ts,
        applied_ts = %state.applied_ts,
        changelog = state.current_changelog,
        "recovered persistent state"
    );
    Ok((state, changelog))
}
