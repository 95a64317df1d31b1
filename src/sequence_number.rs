use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// Sequence number of a sequenced packet (DATA or FIN) in one direction of a connection.
///
/// Numbering starts at [SequenceNumber::FIRST]; [SequenceNumber::ZERO] is used in the
///  'ack sequence' header field to say that nothing was received yet. The numbers are 64 bit,
///  so they are never wrapped around or reused while a connection is open.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceNumber(u64);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.saturating_add(1))
    }

    /// iterate over the half-open range `self..upper_bound`
    pub fn to(&self, upper_bound: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        (self.0..upper_bound.0).map(SequenceNumber)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u64) -> Self::Output {
        SequenceNumber(self.0.saturating_add(rhs))
    }
}

impl Sub<u64> for SequenceNumber {
    type Output = Option<SequenceNumber>;

    fn sub(self, rhs: u64) -> Self::Output {
        self.0.checked_sub(rhs).map(SequenceNumber)
    }
}
