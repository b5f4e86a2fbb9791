//! Periodic rotator: closes the active changelog and writes a full snapshot
//! of the FSM next to it.
use std::sync::Arc;

use raftkvd_api::LogIndex;
use tracing::info;

use crate::ioutil::BufferedFile;
use crate::node::NodeShared;
use crate::store;
use crate::task::{await_tick, AutoJoinHandle, PanicGuard};

pub(crate) fn spawn(shared: Arc<NodeShared>, ticks: flume::Receiver<()>) -> AutoJoinHandle {
    AutoJoinHandle::spawn(move || {
        let guard = PanicGuard::new("rotator", shared.panic_flag());
        while !shared.is_node_shutting_down() {
            if !await_tick(&ticks, shared.params.rotate_interval) {
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
    // Switch to a fresh changelog under both locks so no record lands in
    // between; the FSM is cloned at the same instant, giving the snapshot a
    // point-in-time view consistent with applied_ts even while new writes
    // keep flowing.
    let (snapshot_ts, fsm) = {
        let mut changelog = shared.changelog();
        let mut state = shared.state();
        if state.applied_ts < LogIndex::ZERO {
            return;
        }
        state.current_changelog += 1;
        let path = store::changelog_path(&shared.params.data_dir, state.current_changelog);
        changelog.flush();
        *changelog = BufferedFile::create(&path);
        changelog.write_i64(state.durable_ts.0);
        (state.applied_ts, state.fsm.clone())
    };

    let path = store::snapshot_path(&shared.params.data_dir, snapshot_ts);
    store::write_snapshot(&path, snapshot_ts, &fsm);
    info!(ts = %snapshot_ts, entries = fsm.len(), "wrote snapshot");
}
