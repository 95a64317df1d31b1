use std::fmt::{Display, Formatter};

use crate::ccb::CloseReason;

/// Failures surfaced to the producer / consumer of a connection. Transient network problems
///  (loss, corruption, reordering, duplicates) are never reported this way, they are absorbed
///  by the protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionError {
    /// The peer stopped answering liveness probes or connection attempts
    PeerUnresponsive,
    /// The connection was closed before all data was delivered (drain timeout or forced close)
    ClosedBeforeDrain,
    /// The peer started sending, but the connection was not opened locally in time
    SetupTimeout,
    /// The connection is closed or closing for the requested operation
    Closed,
    /// The timeout passed by the caller elapsed
    Timeout,
    PayloadTooLarge { len: usize, max: usize },
}

impl ConnectionError {
    /// The error that operations on a connection fail with after it was closed for `reason`
    pub fn for_close_reason(reason: CloseReason) -> ConnectionError {
        match reason {
            CloseReason::Normal => ConnectionError::Closed,
            CloseReason::PeerUnresponsive => ConnectionError::PeerUnresponsive,
            CloseReason::DrainTimeout => ConnectionError::ClosedBeforeDrain,
            CloseReason::SetupTimeout => ConnectionError::SetupTimeout,
        }
    }
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::PeerUnresponsive => write!(f, "peer is unresponsive"),
            ConnectionError::ClosedBeforeDrain => write!(f, "connection was closed before all data was delivered"),
            ConnectionError::SetupTimeout => write!(f, "connection was not opened in time"),
            ConnectionError::Closed => write!(f, "connection is closed"),
            ConnectionError::Timeout => write!(f, "timed out"),
            ConnectionError::PayloadTooLarge { len, max } => write!(f, "payload of {} bytes exceeds the maximum of {} bytes", len, max),
        }
    }
}

impl std::error::Error for ConnectionError {}
