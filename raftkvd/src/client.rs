//! Key-value client.
//!
//! Talks to any member, follows leader redirects and backs off while the
//! cluster is electing. One request is in flight at a time, so responses are
//! matched to requests by order.
use std::net::SocketAddr;
use std::time::Duration;

use raftkvd_api::net::{self, Frame};
use raftkvd_api::{ClientOperation, ClientRequest, ClientResponse, Method, NodeId};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time;

const MAX_ATTEMPTS: usize = 64;
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data decoding error: {0}")]
    Decoding(#[from] binrw::Error),
    #[error("connection closed")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("request rejected after {0} attempts")]
    Unavailable(usize),
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    members: Vec<SocketAddr>,
    request_timeout: Duration,
    max_message_size: usize,
    /// Member we currently believe is the leader
    target: usize,
    conn: Option<TcpStream>,
    next_request_id: u64,
}

impl Client {
    pub fn new(members: Vec<SocketAddr>) -> Self {
        Self {
            members,
            request_timeout: Duration::from_secs(5),
            max_message_size: 64 << 10,
            target: 0,
            conn: None,
            next_request_id: 0,
        }
    }

    pub async fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.request(vec![ClientOperation::write(key, value)])
            .await?;
        Ok(())
    }

    /// Read a key from the leader's FSM; absent keys read as empty.
    pub async fn get(&mut self, key: impl Into<String>) -> Result<String> {
        let response = self.request(vec![ClientOperation::read(key)]).await?;
        Ok(response
            .entries
            .into_iter()
            .next()
            .map(|entry| entry.value)
            .unwrap_or_default())
    }

    pub async fn request(&mut self, operations: Vec<ClientOperation>) -> Result<ClientResponse> {
        let request = ClientRequest { operations };
        for _attempt in 0..MAX_ATTEMPTS {
            match self.try_request(&request).await {
                Ok(response) if response.success => return Ok(response),
                Ok(response) if response.should_retry => {
                    // a follower told us who leads
                    let leader = response.retry_to.0 as usize;
                    if leader < self.members.len() && leader != self.target {
                        self.target = leader;
                        self.conn = None;
                    } else {
                        time::sleep(RETRY_DELAY).await;
                    }
                }
                Ok(_) => {
                    // candidate or a leader still behind its read barrier
                    self.rotate_target();
                    time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    tracing::debug!(%err, target = self.target, "client request failed");
                    self.rotate_target();
                    time::sleep(RETRY_DELAY).await;
                }
            }
        }
        Err(ClientError::Unavailable(MAX_ATTEMPTS))
    }

    fn rotate_target(&mut self) {
        self.target = (self.target + 1) % self.members.len();
        self.conn = None;
    }

    async fn try_request(&mut self, request: &ClientRequest) -> Result<ClientResponse> {
        if self.conn.is_none() {
            let addr = self.members[self.target];
            let conn = time::timeout(self.request_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| ClientError::Timeout)??;
            self.conn = Some(conn);
        }
        let max_message_size = self.max_message_size;
        let conn = self.conn.as_mut().expect("just connected");

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let frame = Frame {
            request_id,
            method: Method::Client.into(),
            sender: NodeId::NONE,
            body: request.encode(),
        };

        let exchange = async {
            net::write_frame(conn, &frame).await?;
            loop {
                match net::read_frame(conn, max_message_size).await? {
                    Some(response) if response.request_id == request_id => {
                        return Ok(ClientResponse::decode(&response.body)?);
                    }
                    // stale response from an abandoned attempt
                    Some(_) => continue,
                    None => return Err(ClientError::Disconnected),
                }
            }
        };
        match time::timeout(self.request_timeout, exchange).await {
            Ok(result) => {
                if result.is_err() {
                    self.conn = None;
                }
                result
            }
            Err(_) => {
                self.conn = None;
                Err(ClientError::Timeout)
            }
        }
    }
}
