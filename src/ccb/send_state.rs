use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::buffers::buffer_arena::ArenaBuf;
use crate::config::InterconnectConfig;
use crate::congestion_window::CongestionWindow;
use crate::rtt_estimator::RttEstimator;
use crate::sequence_number::SequenceNumber;

/// A sequenced packet that was sent and is retained until it is acknowledged
#[derive(Debug)]
pub struct InFlightPacket {
    /// the framed packet, ready to be re-sent
    pub buf: ArenaBuf,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub deadline: Instant,
    pub num_retransmits: u32,
    /// held in the receiver's out-of-order buffer, so its retransmit timer is suspended
    pub is_sacked: bool,
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct AckOutcome {
    pub num_acked: usize,
    /// the sequence number to retransmit immediately because the duplicate ACK threshold
    ///  was reached
    pub fast_retransmit: Option<SequenceNumber>,
}

/// Sending half of a connection: sequence number assignment, the in-flight set, congestion
///  window and RTT estimation. Everything here is synchronous and driven by explicit `now`
///  arguments, I/O is done by the send engine.
#[derive(Debug)]
pub struct SendState {
    next_sequence: SequenceNumber,
    window: CongestionWindow,
    in_flight: BTreeMap<SequenceNumber, InFlightPacket>,
    highest_cumulative_ack: SequenceNumber,
    num_duplicate_acks: u32,
    /// ack level at which the last fast retransmit happened - there is at most one per level
    fast_retransmit_ack_level: Option<SequenceNumber>,
    rtt: RttEstimator,
    fast_retransmit_threshold: u32,

    /// FIN was requested but not sent yet (waiting for an arena buffer)
    pub fin_pending: bool,
    pub fin_sequence: Option<SequenceNumber>,
}

impl SendState {
    pub fn new(config: &InterconnectConfig) -> SendState {
        SendState {
            next_sequence: SequenceNumber::FIRST,
            window: CongestionWindow::new(config.initial_window, config.window_ceiling()),
            in_flight: BTreeMap::new(),
            highest_cumulative_ack: SequenceNumber::ZERO,
            num_duplicate_acks: 0,
            fast_retransmit_ack_level: None,
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto, config.timer_tick),
            fast_retransmit_threshold: config.fast_retransmit_threshold,
            fin_pending: false,
            fin_sequence: None,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.window.cwnd()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// number of packets that the congestion window admits in addition to those in flight
    pub fn capacity(&self) -> usize {
        self.window.capacity(self.in_flight.len())
    }

    pub fn rto(&self) -> std::time::Duration {
        self.rtt.rto()
    }

    pub fn highest_cumulative_ack(&self) -> SequenceNumber {
        self.highest_cumulative_ack
    }

    /// The sequence number of the next sequenced packet. It is only consumed when the packet
    ///  is actually registered.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    pub fn register(&mut self, sequence: SequenceNumber, buf: ArenaBuf, now: Instant) {
        assert_eq!(sequence, self.next_sequence, "sequence numbers must be registered in order");
        self.next_sequence = sequence.next();

        self.in_flight.insert(sequence, InFlightPacket {
            buf,
            first_sent: now,
            last_sent: now,
            deadline: now + self.rtt.rto(),
            num_retransmits: 0,
            is_sacked: false,
        });
    }

    pub fn packet(&self, sequence: SequenceNumber) -> Option<&InFlightPacket> {
        self.in_flight.get(&sequence)
    }

    /// Process the acknowledgement information of an ACK packet (or the piggybacked ack
    ///  sequence of any other packet, with `count_duplicates == false`)
    ///
    /// Only ACKs that repeat the cumulative ack *and* carry selective acks count as duplicates
    ///  for fast retransmit. The receiver answers every duplicate DATA packet with a fresh ACK
    ///  that repeats the cumulative ack without selective acks, and those say nothing about a
    ///  hole in the sequence.
    pub fn on_ack(&mut self, cumulative_ack: SequenceNumber, sacked: &[SequenceNumber], count_duplicates: bool, now: Instant) -> AckOutcome {
        let mut result = AckOutcome::default();

        if cumulative_ack >= self.next_sequence {
            debug!("ACK for {} which was never sent - ignoring", cumulative_ack);
            return result;
        }

        if cumulative_ack > self.highest_cumulative_ack {
            let still_in_flight = self.in_flight.split_off(&cumulative_ack.next());
            let acked = std::mem::replace(&mut self.in_flight, still_in_flight);

            // Karn: only packets that were never retransmitted give unambiguous samples
            if let Some(p) = acked.values().rev().find(|p| p.num_retransmits == 0) {
                self.rtt.on_sample(now.saturating_duration_since(p.first_sent));
            }

            result.num_acked = acked.len();
            self.window.on_ack(acked.len().min(u32::MAX as usize) as u32);
            self.highest_cumulative_ack = cumulative_ack;
            self.num_duplicate_acks = 0;
            trace!("ACK up to {}: released {} packets, cwnd {}", cumulative_ack, acked.len(), self.window.cwnd());
            // dropping `acked` returns the buffers to the arena
        }
        else if count_duplicates && cumulative_ack == self.highest_cumulative_ack && !sacked.is_empty() && !self.in_flight.is_empty() {
            self.num_duplicate_acks += 1;
            trace!("duplicate ACK #{} for {}", self.num_duplicate_acks, cumulative_ack);

            if self.num_duplicate_acks >= self.fast_retransmit_threshold && self.fast_retransmit_ack_level != Some(cumulative_ack) {
                self.fast_retransmit_ack_level = Some(cumulative_ack);
                result.fast_retransmit = self.in_flight.iter()
                    .find(|(s, p)| !p.is_sacked && !sacked.contains(s))
                    .map(|(&s, _)| s);
                if result.fast_retransmit.is_some() {
                    self.window.on_loss();
                }
            }
        }

        for s in sacked {
            if let Some(p) = self.in_flight.get_mut(s) {
                p.is_sacked = true;
            }
        }

        result
    }

    /// The subset of `requested` that is still in flight and can be re-sent
    pub fn retransmittable(&self, requested: &[SequenceNumber]) -> Vec<SequenceNumber> {
        requested.iter()
            .filter(|s| self.in_flight.contains_key(s))
            .cloned()
            .collect()
    }

    /// Packets whose retransmit deadline passed. Selectively acknowledged packets are skipped,
    ///  they only need to be re-sent if the receiver explicitly asks for them.
    pub fn expired(&self, now: Instant) -> Vec<SequenceNumber> {
        self.in_flight.iter()
            .filter(|(_, p)| !p.is_sacked && p.deadline <= now)
            .map(|(&s, _)| s)
            .collect()
    }

    /// Record a retransmission, backing off the packet's retransmit deadline
    pub fn on_retransmitted(&mut self, sequence: SequenceNumber, now: Instant) {
        let rtt = &self.rtt;
        if let Some(p) = self.in_flight.get_mut(&sequence) {
            p.num_retransmits += 1;
            p.last_sent = now;
            p.deadline = now + rtt.backed_off_rto(p.num_retransmits);
        }
    }

    pub fn on_timeout_loss(&mut self) {
        self.window.on_loss();
    }

    /// nothing in flight, and no FIN waiting to be sent
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && !self.fin_pending
    }

    /// Drop every in-flight packet, returning their buffers to the arena
    pub fn release_all(&mut self) {
        self.in_flight.clear();
        self.fin_pending = false;
    }
}
