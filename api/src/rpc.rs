//! Request/response bodies of the four consensus RPCs.
use binrw::binrw;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::log::wire_message;
use crate::{LogIndex, LogRecord, NodeId, Operation, TermId};

/// Method selector carried in every request frame.
#[derive(FromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[repr(u8)]
pub enum Method {
    /// Candidate asking for an election grant
    Vote = 1,
    /// Leader replicating records / heartbeating
    Append = 2,
    /// Client read/write request
    Client = 3,
    /// Leader streaming a full-state snapshot to a stale follower
    Recover = 4,
    #[num_enum(default)]
    Other = 255,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: TermId,
    /// Candidate's durable log position; voters ahead of it deny
    pub ts: LogIndex,
    pub vote_for: NodeId,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: TermId,
    /// Quorum-acknowledged position the follower may apply up to
    pub applied_ts: LogIndex,

    #[br(temp)]
    #[bw(calc = records.len() as u32)]
    record_count: u32,
    #[br(count = record_count)]
    pub records: Vec<LogRecord>,
}

/// Common reply of `Vote`, `Append` and `Recover`, reporting the responder's
/// log position either way.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub term: TermId,
    pub durable_ts: LogIndex,
    pub next_ts: LogIndex,
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    pub success: bool,
}

#[binrw]
#[brw(repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Read = 0,
    Write = 1,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOperation {
    pub op: OpType,

    #[br(temp)]
    #[bw(calc = key.len() as u32)]
    key_len: u32,
    #[br(count = key_len, try_map = |raw: Vec<u8>| String::from_utf8(raw))]
    #[bw(map = |k: &String| k.clone().into_bytes())]
    pub key: String,

    #[br(temp)]
    #[bw(calc = value.len() as u32)]
    value_len: u32,
    #[br(count = value_len, try_map = |raw: Vec<u8>| String::from_utf8(raw))]
    #[bw(map = |v: &String| v.clone().into_bytes())]
    pub value: String,
}

impl ClientOperation {
    pub fn read(key: impl Into<String>) -> Self {
        Self {
            op: OpType::Read,
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn write(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: OpType::Write,
            key: key.into(),
            value: value.into(),
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    #[br(temp)]
    #[bw(calc = operations.len() as u32)]
    operation_count: u32,
    #[br(count = operation_count)]
    pub operations: Vec<ClientOperation>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    pub success: bool,
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    pub should_retry: bool,
    /// Leader to retry against; meaningful only with `should_retry`
    pub retry_to: NodeId,

    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    entry_count: u32,
    #[br(count = entry_count)]
    pub entries: Vec<Operation>,
}

impl ClientResponse {
    pub fn failure() -> Self {
        Self {
            success: false,
            should_retry: false,
            retry_to: NodeId::NONE,
            entries: Vec::new(),
        }
    }
}

/// One chunk of a full-state snapshot stream.
///
/// Every chunk of a stream carries the same `(term, applied_ts)` identity and
/// the total entry count; `start`/`end` delimit the stream.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub term: TermId,
    pub applied_ts: LogIndex,
    pub size: u64,
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    pub start: bool,
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    pub end: bool,

    #[br(temp)]
    #[bw(calc = operations.len() as u32)]
    operation_count: u32,
    #[br(count = operation_count)]
    pub operations: Vec<Operation>,
}

wire_message!(
    VoteRequest,
    AppendRequest,
    Response,
    ClientRequest,
    ClientResponse,
    RecoverySnapshot,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_from_wire_byte() {
        assert_eq!(Method::from(1u8), Method::Vote);
        assert_eq!(Method::from(4u8), Method::Recover);
        assert_eq!(Method::from(77u8), Method::Other);
        assert_eq!(u8::from(Method::Append), 2);
    }

    #[test]
    fn response_serde() {
        let response = Response {
            term: TermId(3),
            durable_ts: LogIndex(17),
            next_ts: LogIndex(18),
            success: true,
        };
        assert_eq!(Response::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn append_request_serde() {
        let request = AppendRequest {
            term: TermId(2),
            applied_ts: LogIndex::NONE,
            records: vec![LogRecord {
                ts: LogIndex(0),
                operations: vec![Operation {
                    key: "a".into(),
                    value: "1".into(),
                }],
            }],
        };
        assert_eq!(AppendRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn client_round_trip() {
        let request = ClientRequest {
            operations: vec![
                ClientOperation::write("a", "1"),
                ClientOperation::read("b"),
            ],
        };
        assert_eq!(ClientRequest::decode(&request.encode()).unwrap(), request);

        let response = ClientResponse {
            success: true,
            should_retry: false,
            retry_to: NodeId::NONE,
            entries: vec![Operation {
                key: "b".into(),
                value: String::new(),
            }],
        };
        assert_eq!(
            ClientResponse::decode(&response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn recovery_snapshot_serde() {
        let chunk = RecoverySnapshot {
            term: TermId(5),
            applied_ts: LogIndex(100),
            size: 3,
            start: true,
            end: false,
            operations: vec![Operation {
                key: "k".into(),
                value: "v".into(),
            }],
        };
        assert_eq!(RecoverySnapshot::decode(&chunk.encode()).unwrap(), chunk);
    }
}
