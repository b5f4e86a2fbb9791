//! Log record structures
//!
//! The replicated log is a totally ordered sequence of records, each carrying
//! the write operations of one client request. The same encoding is used on
//! the wire and in the on-disk changelog/snapshot files, so byte equality of
//! two encoded records is the divergence test between leader and follower.
use binrw::binrw;

use crate::LogIndex;

/// A single key-value write (or, in snapshot files, one FSM entry).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Operation {
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

/// One replicated log entry.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogRecord {
    pub ts: LogIndex,

    #[br(temp)]
    #[bw(calc = operations.len() as u32)]
    operation_count: u32,
    #[br(count = operation_count)]
    pub operations: Vec<Operation>,
}

/// Encode/decode helpers for the little-endian wire form.
macro_rules! wire_message {
    ($($ty:ty),* $(,)?) => {$(
        impl $ty {
            pub fn encode(&self) -> Vec<u8> {
                use ::binrw::BinWrite as _;
                let mut buf = ::std::io::Cursor::new(Vec::new());
                self.write(&mut buf).expect("can't fail");
                buf.into_inner()
            }

            pub fn decode(bytes: &[u8]) -> ::binrw::BinResult<Self> {
                use ::binrw::BinRead as _;
                Self::read(&mut ::std::io::Cursor::new(bytes))
            }
        }
    )*};
}

pub(crate) use wire_message;

wire_message!(LogRecord);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_record_serde() {
        let record = LogRecord {
            ts: LogIndex(42),
            operations: vec![
                Operation {
                    key: "alpha".into(),
                    value: "1".into(),
                },
                Operation {
                    key: "beta".into(),
                    value: String::new(),
                },
            ],
        };

        let encoded = record.encode();
        assert_eq!(LogRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn identical_records_encode_identically() {
        let a = LogRecord {
            ts: LogIndex(1),
            operations: vec![Operation {
                key: "k".into(),
                value: "v".into(),
            }],
        };
        let b = a.clone();
        assert_eq!(a.encode(), b.encode());

        let c = LogRecord {
            ts: LogIndex(1),
            operations: vec![Operation {
                key: "k".into(),
                value: "w".into(),
            }],
        };
        assert_ne!(a.encode(), c.encode());
    }

    #[test]
    fn truncated_record_fails_to_decode() {
        let record = LogRecord {
            ts: LogIndex(3),
            operations: vec![Operation {
                key: "key".into(),
                value: "value".into(),
            }],
        };
        let encoded = record.encode();
        assert!(LogRecord::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
