use std::time::Duration;

use tokio::time::Instant;

use crate::config::InterconnectConfig;
use crate::exponential_backoff::ExponentialBackoff;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LivenessAction {
    Nothing,
    /// send a STATUS_QUERY with the given probe number
    SendProbe(u64),
    /// all probes went unanswered
    Unresponsive,
}

/// Per-connection bookkeeping for detecting a dead peer. A connection that received nothing
///  for a while is probed, and the probes are repeated with exponential backoff. Any inbound
///  packet resets the state.
#[derive(Debug)]
pub struct LivenessState {
    last_activity: Instant,
    num_outstanding_probes: u32,
    next_probe_at: Option<Instant>,
    probe_counter: u64,
    backoff: ExponentialBackoff,
}

impl LivenessState {
    pub fn new(config: &InterconnectConfig, now: Instant) -> LivenessState {
        LivenessState {
            last_activity: now,
            num_outstanding_probes: 0,
            next_probe_at: None,
            probe_counter: 0,
            backoff: ExponentialBackoff::new(config.probe_interval, config.max_probe_interval, config.probe_backoff_factor_eighths, config.probe_jitter),
        }
    }

    pub fn on_traffic(&mut self, now: Instant) {
        self.last_activity = now;
        if self.num_outstanding_probes > 0 {
            self.num_outstanding_probes = 0;
            self.next_probe_at = None;
            self.backoff.reset();
        }
    }

    pub fn num_outstanding_probes(&self) -> u32 {
        self.num_outstanding_probes
    }

    pub fn poll(&mut self, now: Instant, idle_threshold: Duration, max_probes: u32) -> LivenessAction {
        let is_due = match self.next_probe_at {
            None => now >= self.last_activity + idle_threshold,
            Some(t) => now >= t,
        };
        if !is_due {
            return LivenessAction::Nothing;
        }

        if self.num_outstanding_probes >= max_probes {
            return LivenessAction::Unresponsive;
        }

        self.num_outstanding_probes += 1;
        self.probe_counter += 1;
        self.next_probe_at = Some(now + self.backoff.next_delay());
        LivenessAction::SendProbe(self.probe_counter)
    }
}
