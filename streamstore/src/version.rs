//! Expected-version sentinels for optimistic concurrency.
//!
//! Every append states what the caller believes the stream looks like. The
//! store compares that expectation against the stream head inside the append
//! transaction and rejects the write with a concurrency error on mismatch.

/// Sentinel accepted by stream reads for "start from the last message".
pub const STREAM_VERSION_END: i64 = i64::MAX;

/// The version a stream is expected to be at when appending.
///
/// The raw wire encoding uses negative sentinels: `Any = -2`, `Empty = -1`,
/// and any non-negative value is an exact 0-based version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No expectation. Conflicting appends are retried internally until they
    /// land at some version.
    Any,
    /// The stream must not contain any messages.
    Empty,
    /// The stream head must be exactly this 0-based version.
    Exact(i64),
}

impl ExpectedVersion {
    const ANY_RAW: i64 = -2;
    const EMPTY_RAW: i64 = -1;

    /// Decodes the raw sentinel encoding. Returns `None` for values below
    /// `-2`, which no encoding produces.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            Self::ANY_RAW => Some(ExpectedVersion::Any),
            Self::EMPTY_RAW => Some(ExpectedVersion::Empty),
            v if v >= 0 => Some(ExpectedVersion::Exact(v)),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::ANY_RAW,
            ExpectedVersion::Empty => Self::EMPTY_RAW,
            ExpectedVersion::Exact(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_maps_raw_sentinels() {
        assert_eq!(ExpectedVersion::from_raw(-2), Some(ExpectedVersion::Any));
        assert_eq!(ExpectedVersion::from_raw(-1), Some(ExpectedVersion::Empty));
        assert_eq!(
            ExpectedVersion::from_raw(7),
            Some(ExpectedVersion::Exact(7))
        );
        assert_eq!(ExpectedVersion::from_raw(-3), None);
    }

    #[test]
    fn raw_encoding_round_trips() {
        for version in [
            ExpectedVersion::Any,
            ExpectedVersion::Empty,
            ExpectedVersion::Exact(0),
            ExpectedVersion::Exact(41),
        ] {
            assert_eq!(ExpectedVersion::from_raw(version.as_raw()), Some(version));
        }
    }
}
