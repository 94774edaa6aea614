use std::{cmp::Ordering, ops::Deref};

use crate::constants::WRAP_HALF;

#[derive(PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNr(pub u16);

impl Deref for SeqNr {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u16> for SeqNr {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SeqNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for SeqNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// True if `a` is newer than `b`, treating the u16 space as a circle.
pub fn is_greater(a: u16, b: u16) -> bool {
    (a > b && a - b <= WRAP_HALF) || (a < b && b - a > WRAP_HALF)
}

impl SeqNr {
    pub fn is_greater_than(self, other: SeqNr) -> bool {
        is_greater(self.0, other.0)
    }
}

impl std::ops::Add<u16> for SeqNr {
    type Output = SeqNr;

    fn add(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u16> for SeqNr {
    type Output = SeqNr;

    fn sub(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl std::ops::Sub<SeqNr> for SeqNr {
    type Output = u16;

    // Forward distance from rhs to self.
    fn sub(self, rhs: SeqNr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl std::ops::AddAssign<u16> for SeqNr {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl std::ops::SubAssign<u16> for SeqNr {
    fn sub_assign(&mut self, rhs: u16) {
        *self = *self - rhs;
    }
}

impl std::cmp::PartialOrd for SeqNr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::Ord for SeqNr {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else if is_greater(self.0, other.0) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}
