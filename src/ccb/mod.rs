//! The connection control block (CCB): all per-connection protocol state and the connection
//!  state machine.
//!
//! ```ascii
//!   SETUP ----> ESTABLISHED ----> DRAINING ----> CLOSED(reason)
//!     |              |                              ^
//!     +--------------+------------------------------+
//! ```
//!
//! A CCB is either opened locally (by the consumer calling `open`), or created passively when
//!  the peer's packets arrive for a connection that is not open yet. A passive CCB caches
//!  sequenced packets until it is opened or its accept timeout expires.
//!
//! The CCB itself does no I/O and reads no clock - callers pass in `now`, which keeps the state
//!  machine deterministic under test.

pub mod handshake;
pub mod liveness_state;
pub mod receive_state;
pub mod send_state;

use std::fmt::{Display, Formatter};

use tokio::time::Instant;
use tracing::debug;

use crate::ccb::handshake::Handshake;
use crate::ccb::liveness_state::LivenessState;
use crate::ccb::receive_state::ReceiveState;
use crate::ccb::send_state::SendState;
use crate::config::InterconnectConfig;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CloseReason {
    Normal,
    PeerUnresponsive,
    DrainTimeout,
    SetupTimeout,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Setup,
    Established,
    Draining,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Setup => write!(f, "SETUP"),
            ConnectionState::Established => write!(f, "ESTABLISHED"),
            ConnectionState::Draining => write!(f, "DRAINING"),
            ConnectionState::Closed(reason) => write!(f, "CLOSED({:?})", reason),
        }
    }
}

#[derive(Debug)]
pub struct Ccb {
    state: ConnectionState,
    is_locally_opened: bool,
    is_locally_closed: bool,
    created_at: Instant,
    drain_deadline: Option<Instant>,

    pub send: SendState,
    pub receive: ReceiveState,
    pub liveness: LivenessState,
    pub handshake: Handshake,
}

impl Ccb {
    fn new(config: &InterconnectConfig, is_locally_opened: bool, now: Instant) -> Ccb {
        Ccb {
            state: ConnectionState::Setup,
            is_locally_opened,
            is_locally_closed: false,
            created_at: now,
            drain_deadline: None,
            send: SendState::new(config),
            receive: ReceiveState::new(config),
            liveness: LivenessState::new(config, now),
            handshake: Handshake::new(config, now),
        }
    }

    /// a CCB for a connection opened by the local consumer, starting the handshake
    pub fn new_opened(config: &InterconnectConfig, now: Instant) -> Ccb {
        Self::new(config, true, now)
    }

    /// a CCB for a connection the peer started sending on before it was opened locally
    pub fn new_passive(config: &InterconnectConfig, now: Instant) -> Ccb {
        Self::new(config, false, now)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_locally_opened(&self) -> bool {
        self.is_locally_opened
    }

    pub fn is_locally_closed(&self) -> bool {
        self.is_locally_closed
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn drain_deadline(&self) -> Option<Instant> {
        self.drain_deadline
    }

    /// Local open of a passive CCB. Returns `false` if the CCB was opened before.
    pub fn mark_opened(&mut self) -> bool {
        if self.is_locally_opened {
            return false;
        }
        self.is_locally_opened = true;
        true
    }

    /// Transition SETUP -> ESTABLISHED, returning `true` if the state changed
    pub fn establish(&mut self) -> bool {
        if self.state != ConnectionState::Setup {
            return false;
        }
        debug!("connection established");
        self.state = ConnectionState::Established;
        true
    }

    /// Transition to DRAINING, starting the drain timeout. Returns `true` if the state changed.
    pub fn start_draining(&mut self, now: Instant, config: &InterconnectConfig) -> bool {
        match self.state {
            ConnectionState::Setup | ConnectionState::Established => {
                debug!("connection draining");
                self.state = ConnectionState::Draining;
                self.drain_deadline = Some(now + config.drain_timeout);
                true
            }
            ConnectionState::Draining | ConnectionState::Closed(_) => false,
        }
    }

    pub fn mark_locally_closed(&mut self) {
        self.is_locally_closed = true;
    }

    /// DRAINING is complete when everything sent was acknowledged and either the local side
    ///  initiated the close or the consumer saw the end of the peer's stream
    pub fn is_drained(&self) -> bool {
        self.state == ConnectionState::Draining
            && self.send.is_idle()
            && (self.is_locally_closed || self.receive.is_end_of_stream_consumed())
    }

    pub fn is_drain_overdue(&self, now: Instant) -> bool {
        self.state == ConnectionState::Draining
            && self.drain_deadline.map(|d| now >= d).unwrap_or(false)
    }

    pub fn is_accept_overdue(&self, now: Instant, config: &InterconnectConfig) -> bool {
        self.state == ConnectionState::Setup
            && !self.is_locally_opened
            && now >= self.created_at + config.accept_timeout
    }

    /// Enter CLOSED, releasing every buffer the CCB holds. Returns `true` if the state changed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state.is_closed() {
            return false;
        }
        debug!("connection closed: {:?}", reason);
        self.state = ConnectionState::Closed(reason);
        self.send.release_all();
        self.receive.release_all();
        true
    }
}
