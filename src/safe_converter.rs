//! Integer conversions between wire fields, buffer lengths and statistics counters, so `as`
//!  casts do not spread through the codebase.

/// Widening conversions that are lossless on every supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

/// wire length fields to buffer lengths
#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// lengths and counts to statistics counters
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// Narrowing conversion for values whose range was checked before, e.g. a payload length that
///  was validated against the maximum datagram size.
///
/// NB: panics if the value is out of range, which is a bug in the caller
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        u16::try_from(self).expect("length should have been checked against the maximum datagram size")
    }
}
