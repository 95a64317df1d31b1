//! Congestion window in packets, AIMD with slow start.
//!
//! Below the slow start threshold, every acknowledged packet grows the window by one packet.
//!  Above it, the window grows by one packet per window's worth of acknowledged packets
//!  (additive increase). Loss halves the window (multiplicative decrease), and the threshold
//!  moves to the halved window.

use std::cmp::{max, min};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct CongestionWindow {
    cwnd: u32,
    cwnd_cnt: u32,
    slow_start_threshold: u32,
    ceiling: u32,
}

impl CongestionWindow {
    pub fn new(initial_window: u32, ceiling: u32) -> CongestionWindow {
        let ceiling = max(ceiling, 1);
        CongestionWindow {
            cwnd: initial_window.clamp(1, ceiling),
            cwnd_cnt: 0,
            slow_start_threshold: ceiling,
            ceiling,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd < self.slow_start_threshold
    }

    pub fn on_ack(&mut self, num_acked: u32) {
        if self.cwnd == self.ceiling {
            return;
        }

        for _ in 0..num_acked {
            if self.is_slow_start() {
                self.cwnd += 1;
            }
            else {
                self.cwnd_cnt += 1;
                while self.cwnd_cnt >= self.cwnd {
                    self.cwnd_cnt -= self.cwnd;
                    self.cwnd += 1;
                }
            }
            if self.cwnd >= self.ceiling {
                self.cwnd = self.ceiling;
                self.cwnd_cnt = 0;
                break;
            }
        }
        trace!("cwnd is {} packets", self.cwnd);
    }

    pub fn on_loss(&mut self) {
        self.slow_start_threshold = max(self.cwnd / 2, 1);
        self.cwnd = max(self.cwnd / 2, 1);
        self.cwnd_cnt = 0;

        debug!("loss -> adjusting cwnd downwards to {}", self.cwnd);
    }

    /// number of packets that can be admitted in addition to those in flight
    pub fn capacity(&self, num_in_flight: usize) -> usize {
        (self.cwnd as usize).saturating_sub(min(num_in_flight, self.cwnd as usize))
    }
}
