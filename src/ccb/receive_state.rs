use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::buffers::buffer_arena::ArenaBuf;
use crate::config::InterconnectConfig;
use crate::sequence_number::SequenceNumber;

/// A sequenced packet's content once it is received: DATA carries a payload, FIN marks the
///  end of the stream
#[derive(Debug)]
pub enum ReceivedItem {
    Payload(ArenaBuf),
    EndOfStream,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Classification {
    /// the next expected sequence number
    InOrder,
    /// ahead of the expected sequence number, but inside the out-of-order buffer's range.
    ///  `opens_gap` is set if there are missing sequence numbers between this and the highest
    ///  sequence number seen so far.
    Ahead { opens_gap: bool },
    /// delivered or buffered before
    Duplicate,
    /// too far ahead to be buffered
    Overflow,
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct AcceptOutcome {
    /// number of items appended to the delivery queue
    pub num_delivered: usize,
    /// the packet was in order and made buffered out-of-order packets contiguous
    pub filled_gap: bool,
    pub end_of_stream: bool,
}

/// Receiving half of a connection: ordering, duplicate detection, the delivery queue and
///  coalescing of acknowledgements.
#[derive(Debug)]
pub struct ReceiveState {
    highest_contiguous: SequenceNumber,
    highest_seen: SequenceNumber,
    out_of_order: BTreeMap<SequenceNumber, ReceivedItem>,
    max_out_of_order: usize,
    delivery_queue: VecDeque<ReceivedItem>,

    /// sequenced packets received before the connection was opened locally
    startup_cache: BTreeMap<SequenceNumber, ReceivedItem>,
    max_startup_cached: usize,

    num_unacked_arrivals: u32,
    oldest_unacked_arrival: Option<Instant>,

    end_of_stream_delivered: bool,
    end_of_stream_consumed: bool,
}

impl ReceiveState {
    pub fn new(config: &InterconnectConfig) -> ReceiveState {
        ReceiveState {
            highest_contiguous: SequenceNumber::ZERO,
            highest_seen: SequenceNumber::ZERO,
            out_of_order: BTreeMap::new(),
            max_out_of_order: config.max_out_of_order,
            delivery_queue: VecDeque::new(),
            startup_cache: BTreeMap::new(),
            max_startup_cached: config.max_startup_cached_packets,
            num_unacked_arrivals: 0,
            oldest_unacked_arrival: None,
            end_of_stream_delivered: false,
            end_of_stream_consumed: false,
        }
    }

    /// the cumulative ack value
    pub fn highest_contiguous(&self) -> SequenceNumber {
        self.highest_contiguous
    }

    pub fn highest_seen(&self) -> SequenceNumber {
        self.highest_seen
    }

    pub fn num_out_of_order(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn classify(&self, sequence: SequenceNumber) -> Classification {
        if sequence <= self.highest_contiguous || self.out_of_order.contains_key(&sequence) {
            return Classification::Duplicate;
        }
        if sequence == self.highest_contiguous.next() {
            return Classification::InOrder;
        }
        // the window starts at highest_contiguous + 1 which is never buffered, so a full
        //  window can not happen for a sequence number inside it
        if sequence > self.highest_contiguous + self.max_out_of_order as u64 || self.out_of_order.len() >= self.max_out_of_order {
            return Classification::Overflow;
        }
        Classification::Ahead {
            opens_gap: sequence > self.highest_seen.next(),
        }
    }

    /// Accept a packet that was classified as [Classification::InOrder] or
    ///  [Classification::Ahead]. Duplicates are ignored.
    pub fn accept(&mut self, sequence: SequenceNumber, item: ReceivedItem) -> AcceptOutcome {
        let mut result = AcceptOutcome::default();

        match self.classify(sequence) {
            Classification::InOrder => {
                result.filled_gap = !self.out_of_order.is_empty();
                self.deliver(item, &mut result);
                self.highest_contiguous = sequence;

                while let Some(next) = self.out_of_order.remove(&self.highest_contiguous.next()) {
                    self.deliver(next, &mut result);
                    self.highest_contiguous = self.highest_contiguous.next();
                }
            }
            Classification::Ahead { .. } => {
                trace!("buffering out-of-order packet {}", sequence);
                self.out_of_order.insert(sequence, item);
            }
            Classification::Duplicate | Classification::Overflow => {
                return result;
            }
        }

        self.highest_seen = self.highest_seen.max(sequence);
        result
    }

    fn deliver(&mut self, item: ReceivedItem, outcome: &mut AcceptOutcome) {
        if let ReceivedItem::EndOfStream = item {
            self.end_of_stream_delivered = true;
            outcome.end_of_stream = true;
        }
        self.delivery_queue.push_back(item);
        outcome.num_delivered += 1;
    }

    /// Sequence numbers that are missing below `upper_bound` (excluding), for a NAK
    pub fn missing_below(&self, upper_bound: SequenceNumber, max_len: usize) -> Vec<SequenceNumber> {
        self.highest_contiguous.next()
            .to(upper_bound)
            .filter(|s| !self.out_of_order.contains_key(s))
            .take(max_len)
            .collect()
    }

    /// Selective acknowledgement list for an ACK: everything in the out-of-order buffer
    pub fn selective_acks(&self, max_len: usize) -> Vec<SequenceNumber> {
        self.out_of_order.keys()
            .take(max_len)
            .cloned()
            .collect()
    }

    /// Cache a sequenced packet for a connection that is not open locally yet. Returns `false`
    ///  if the packet was not cached because the cache is full or holds this sequence number.
    pub fn cache_startup_packet(&mut self, sequence: SequenceNumber, item: ReceivedItem) -> bool {
        if self.startup_cache.len() >= self.max_startup_cached || self.startup_cache.contains_key(&sequence) {
            return false;
        }
        self.startup_cache.insert(sequence, item);
        true
    }

    pub fn take_startup_cache(&mut self) -> Vec<(SequenceNumber, ReceivedItem)> {
        std::mem::take(&mut self.startup_cache).into_iter().collect()
    }

    pub fn is_cached(&self, sequence: SequenceNumber) -> bool {
        self.startup_cache.contains_key(&sequence)
    }

    /// Record an in-order arrival for ACK coalescing. Returns `true` if enough arrivals are
    ///  unacknowledged that an ACK should be sent right away.
    pub fn on_in_order_arrival(&mut self, now: Instant, ack_every_n_packets: u32) -> bool {
        self.num_unacked_arrivals += 1;
        if self.oldest_unacked_arrival.is_none() {
            self.oldest_unacked_arrival = Some(now);
        }
        self.num_unacked_arrivals >= ack_every_n_packets
    }

    /// Is a delayed ACK due?
    pub fn is_ack_due(&self, now: Instant, max_ack_delay: Duration) -> bool {
        self.oldest_unacked_arrival
            .map(|t| now >= t + max_ack_delay)
            .unwrap_or(false)
    }

    pub fn on_ack_sent(&mut self) {
        self.num_unacked_arrivals = 0;
        self.oldest_unacked_arrival = None;
    }

    pub fn queue_len(&self) -> usize {
        self.delivery_queue.len()
    }

    /// Take the next item for the consumer
    pub fn pop_delivery(&mut self) -> Option<ReceivedItem> {
        let result = self.delivery_queue.pop_front();
        if let Some(ReceivedItem::EndOfStream) = result {
            self.end_of_stream_consumed = true;
        }
        result
    }

    pub fn is_end_of_stream_delivered(&self) -> bool {
        self.end_of_stream_delivered
    }

    pub fn is_end_of_stream_consumed(&self) -> bool {
        self.end_of_stream_consumed
    }

    /// Drop everything that is buffered, returning the buffers to the arena
    pub fn release_all(&mut self) {
        self.out_of_order.clear();
        self.delivery_queue.clear();
        self.startup_cache.clear();
    }
}
