//! Periodic flusher: moves the buffered log suffix into the active changelog
//! and advances the node's durable position.
use std::sync::Arc;

use raftkvd_api::LogRecord;
use tracing::debug;

use crate::node::NodeShared;
use crate::state::Role;
use crate::task::{await_tick, AutoJoinHandle, PanicGuard};

pub(crate) fn spawn(shared: Arc<NodeShared>, ticks: flume::Receiver<()>) -> AutoJoinHandle {
    AutoJoinHandle::spawn(move || {
        let guard = PanicGuard::new("flusher", shared.panic_flag());
        while !shared.is_node_shutting_down() {
            if !await_tick(&ticks, shared.params.flush_interval) {
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
    // the changelog lock is held for the whole cycle so records stay
    // consecutive on disk; lock order is changelog before state
    let mut changelog = shared.changelog();

    let (to_flush, to_deliver, new_durable_ts) = {
        let mut state = shared.state();

        // the prefix that fell far enough behind the applied position can
        // leave memory
        let mut erase = 0;
        while erase < state.buffered_log.len()
            && state.buffered_log[erase].ts + shared.params.applied_backlog <= state.applied_ts
        {
            erase += 1;
        }
        if erase > 0 {
            debug!(up_to = %state.buffered_log[erase - 1].ts, "erasing applied buffer prefix");
        }

        let to_flush: Vec<LogRecord> = state.buffered_log[state.flushed_index..].to_vec();
        state.buffered_log.drain(..erase);
        state.flushed_index = state.buffered_log.len();

        let to_deliver = state.swap_flush_event();
        let new_durable_ts = state
            .buffered_log
            .last()
            .map(|record| record.ts)
            .unwrap_or(state.durable_ts);
        (to_flush, to_deliver, new_durable_ts)
    };

    if let (Some(first), Some(last)) = (to_flush.first(), to_flush.last()) {
        debug!(from = %first.ts, to = %last.ts, "writing records to changelog");
    }
    for record in &to_flush {
        changelog.write_log_record(record);
    }
    changelog.sync();

    let subscribers = {
        let mut state = shared.state();
        state.durable_ts = new_durable_ts;
        if state.role == Role::Leader {
            state.advance_applied_timestamp();
            state.pick_subscribers()
        } else {
            Vec::new()
        }
    };
    for subscriber in subscribers {
        let _ = subscriber.send(true);
    }
    let _ = to_deliver.send(true);
}
