use tokio::time::Instant;

use crate::config::InterconnectConfig;
use crate::exponential_backoff::ExponentialBackoff;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeAction {
    Nothing,
    SendConnect,
    GiveUp,
}

/// Retry schedule for CONNECT packets of a locally opened connection in SETUP state. The first
///  attempt is due immediately.
#[derive(Debug)]
pub struct Handshake {
    num_attempts: u32,
    next_attempt_at: Instant,
    backoff: ExponentialBackoff,
}

impl Handshake {
    pub fn new(config: &InterconnectConfig, now: Instant) -> Handshake {
        Handshake {
            num_attempts: 0,
            next_attempt_at: now,
            backoff: ExponentialBackoff::new(config.connect_retry_interval, config.max_rto.max(config.connect_retry_interval), 16, 0.0),
        }
    }

    pub fn num_attempts(&self) -> u32 {
        self.num_attempts
    }

    pub fn poll(&mut self, now: Instant, max_attempts: u32) -> HandshakeAction {
        if now < self.next_attempt_at {
            return HandshakeAction::Nothing;
        }
        if self.num_attempts >= max_attempts {
            return HandshakeAction::GiveUp;
        }

        self.num_attempts += 1;
        self.next_attempt_at = now + self.backoff.next_delay();
        HandshakeAction::SendConnect
    }
}
