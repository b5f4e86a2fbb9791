mod log;
pub mod net;
mod rpc;

use binrw::binrw;
use derive_more::Display;
use std::num::ParseIntError;
use std::ops;
use std::str::FromStr;

pub use self::log::*;
pub use self::rpc::*;

/// Index of a node within the fixed cluster membership.
#[binrw]
#[brw(little)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Sender id used by parties that are not cluster members (clients).
    pub const NONE: NodeId = NodeId(u64::MAX);

    pub fn idx(self) -> usize {
        usize::try_from(self.0).expect("node id out of range")
    }
}

impl FromStr for NodeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FromStr::from_str(s).map(Self)
    }
}

/// Election epoch; monotonically increasing.
#[binrw]
#[brw(little)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display, Default)]
pub struct TermId(pub u64);

impl TermId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Gapless log index ("ts") assigned by the leader of a term.
///
/// Freshly started nodes sit below the first real index, hence the signed
/// representation and the `NONE` sentinel.
#[binrw]
#[brw(little)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display, Default)]
pub struct LogIndex(pub i64);

impl LogIndex {
    pub const NONE: LogIndex = LogIndex(-1);
    pub const ZERO: LogIndex = LogIndex(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub fn prev(self) -> Self {
        Self(self.0 - 1)
    }
}

impl ops::Add<i64> for LogIndex {
    type Output = Self;

    fn add(self, rhs: i64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl ops::Sub<LogIndex> for LogIndex {
    type Output = i64;

    fn sub(self, rhs: LogIndex) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_index_arithmetic() {
        assert_eq!(LogIndex::NONE.next(), LogIndex::ZERO);
        assert_eq!(LogIndex(7).prev(), LogIndex(6));
        assert_eq!(LogIndex(7) - LogIndex(3), 4);
        assert_eq!(LogIndex(7) + 3, LogIndex(10));
        assert!(LogIndex::NONE < LogIndex::ZERO);
    }
}
