use anyhow::bail;
use std::{
    fmt::{self, Formatter},
    ops::{Index, IndexMut},
    str::FromStr,
};

/// one of the two ends of a mirrored link
///
/// [`Left`] faces the client: it accepts one socket per logical
/// connection and fans the stream out over every configured path.
/// [`Right`] faces the server: it accepts the fanned-out sockets and
/// collapses them back onto a single stream.
///
/// [`Left`]: Side::Left
/// [`Right`]: Side::Right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// the complement of this side
    pub fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// a pair of values addressed by [`Side`]
///
/// used for the per-side peer lists and byte counters of a connection
/// so that the side tag never degrades into a string or a map lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerSide<T> {
    left: T,
    right: T,
}

impl<T> PerSide<T> {
    pub fn new(left: T, right: T) -> Self {
        Self { left, right }
    }
}

impl<T> Index<Side> for PerSide<T> {
    type Output = T;
    fn index(&self, side: Side) -> &T {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

impl<T> IndexMut<Side> for PerSide<T> {
    fn index_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            invalid => bail!("invalid side {:?}, should be left or right", invalid),
        }
    }
}
