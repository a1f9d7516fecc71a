//! Global positions in the all-stream.
//!
//! A position is a 63-bit integer assigned by the store's global sequence. It
//! is strictly increasing across the store but not dense: a rolled-back or
//! still-uncommitted append leaves a hole behind. Positions cross API
//! boundaries as decimal strings, so `Position` keeps its string form in
//! `Display`, `FromStr`, and serde while all arithmetic stays on the `i64`.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A global position in the all-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(i64);

impl Position {
    /// The position before any message: reading forward from here returns the
    /// whole store.
    pub const START: Position = Position(0);

    /// The sentinel for "the end of the all-stream". Reading backward from
    /// here returns the tail; reading forward returns an empty, ended page.
    pub const END: Position = Position(i64::MAX);

    pub fn new(value: i64) -> Self {
        Position(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// The position just after this one.
    pub fn next(self) -> Position {
        Position(self.0.saturating_add(1))
    }

    /// The position just before this one, clamped at [`Position::START`].
    pub fn prev(self) -> Position {
        Position((self.0 - 1).max(0))
    }
}

impl From<i64> for Position {
    fn from(value: i64) -> Self {
        Position(value)
    }
}

impl From<Position> for i64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing a position from a string.
#[derive(Debug, thiserror::Error)]
#[error("position must be a non-negative decimal integer")]
pub struct ParsePositionError;

impl FromStr for Position {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s.parse().map_err(|_| ParsePositionError)?;
        if value < 0 {
            return Err(ParsePositionError);
        }
        Ok(Position(value))
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
