//! Request/response message bus between cluster members.
//!
//! One outgoing connection task per peer. Requests are written with a fresh
//! request id and completed when the matching response frame arrives; replies
//! may come back out of order. Connection failures fail every in-flight
//! request; delivery is at most once and timeouts surface as errors, so a
//! caller treats any error as a missed round-trip and retries on its next
//! cycle.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use raftkvd_api::net::{self, Frame};
use raftkvd_api::{Method, NodeId};
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum BusError {
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
    #[error("response decoding error: {0}")]
    Decoding(#[from] binrw::Error),
}

pub type BusResult<T> = std::result::Result<T, BusError>;

struct OutgoingRequest {
    method: Method,
    body: Vec<u8>,
    deadline: Instant,
    reply: oneshot::Sender<Vec<u8>>,
}

pub struct Bus {
    peers: Vec<Option<mpsc::Sender<OutgoingRequest>>>,
}

impl Bus {
    /// Spawn one connection task per peer on the node's runtime.
    pub fn new(
        my_id: NodeId,
        members: Vec<SocketAddr>,
        max_message_size: usize,
        handle: &tokio::runtime::Handle,
    ) -> Self {
        let peers = members
            .into_iter()
            .enumerate()
            .map(|(idx, addr)| {
                if idx == my_id.idx() {
                    None
                } else {
                    let (tx, rx) = mpsc::channel(64);
                    handle.spawn(peer_loop(my_id, addr, rx, max_message_size));
                    Some(tx)
                }
            })
            .collect();
        Self { peers }
    }

    /// Send an encoded request and await the raw response body.
    pub async fn request(
        &self,
        peer: NodeId,
        method: Method,
        body: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<Vec<u8>> {
        let tx = self
            .peers
            .get(peer.idx())
            .and_then(|peer| peer.as_ref())
            .ok_or(BusError::UnknownPeer(peer))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        // try_send keeps an unreachable peer from backing callers up behind
        // a full queue; a dropped request is just a missed round-trip
        tx.try_send(OutgoingRequest {
            method,
            body,
            deadline,
            reply: reply_tx,
        })
        .map_err(|_| BusError::Disconnected)?;

        match time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => Err(BusError::Timeout),
        }
    }
}

async fn peer_loop(
    my_id: NodeId,
    addr: SocketAddr,
    mut requests: mpsc::Receiver<OutgoingRequest>,
    max_message_size: usize,
) {
    let mut next_request_id: u64 = 0;

    loop {
        let Some((conn, first_request)) = connect_peer(addr, &mut requests).await else {
            return;
        };
        let (read_half, mut write_half) = conn.into_split();

        // A dedicated reader keeps partial frame reads out of the select
        // below; its channel closing doubles as the disconnect signal.
        let (response_tx, mut responses) = mpsc::channel::<Frame>(64);
        let reader = tokio::spawn(read_responses(read_half, response_tx, max_message_size));

        let mut in_flight: HashMap<u64, (Instant, oneshot::Sender<Vec<u8>>)> = HashMap::new();
        let mut first_request = Some(first_request);
        loop {
            let request = match first_request.take() {
                Some(request) => Some(request),
                None => tokio::select! {
                    request = requests.recv() => {
                        let Some(request) = request else {
                            reader.abort();
                            return;
                        };
                        Some(request)
                    }
                    response = responses.recv() => {
                        let Some(frame) = response else {
                            debug!(%addr, "peer connection closed");
                            break;
                        };
                        if let Some((_, reply)) = in_flight.remove(&frame.request_id) {
                            let _ = reply.send(frame.body);
                        }
                        None
                    }
                },
            };

            if let Some(request) = request {
                let now = Instant::now();
                if request.deadline <= now {
                    continue;
                }
                in_flight.retain(|_, (deadline, _)| now < *deadline);

                let request_id = next_request_id;
                next_request_id += 1;
                let frame = Frame {
                    request_id,
                    method: request.method.into(),
                    sender: my_id,
                    body: request.body,
                };
                if let Err(err) = net::write_frame(&mut write_half, &frame).await {
                    debug!(%addr, %err, "peer connection write failed");
                    break;
                }
                in_flight.insert(request_id, (request.deadline, request.reply));
            }
        }

        reader.abort();
        // dropping the in-flight map fails every pending request
    }
}

async fn read_responses(
    mut read_half: OwnedReadHalf,
    responses: mpsc::Sender<Frame>,
    max_message_size: usize,
) {
    loop {
        match net::read_frame(&mut read_half, max_message_size).await {
            Ok(Some(frame)) => {
                if responses.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                debug!(%err, "peer response read failed");
                return;
            }
        }
    }
}

/// Connect lazily: wait for a request, then dial with retry, discarding
/// requests that expire while the peer is unreachable. `None` means the
/// request channel itself is gone.
async fn connect_peer(
    addr: SocketAddr,
    requests: &mut mpsc::Receiver<OutgoingRequest>,
) -> Option<(TcpStream, OutgoingRequest)> {
    loop {
        // wait until somebody actually wants to talk to this peer
        let request = requests.recv().await?;
        if request.deadline <= Instant::now() {
            continue;
        }

        match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(conn)) => return Some((conn, request)),
            Ok(Err(err)) => {
                debug!(%addr, %err, "failed to connect to peer");
            }
            Err(_) => {
                debug!(%addr, "failed to connect to peer: timeout");
            }
        }
        time::sleep(RECONNECT_DELAY).await;
    }
}
