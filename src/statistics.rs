use std::sync::atomic::{AtomicU64, Ordering};

use crate::safe_converter::SafeCast;

/// Point-in-time copy of the interconnect's counters. Every field is individually consistent,
///  there is no guarantee of consistency across fields.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct InterconnectStatistics {
    /// sum of delivery queue sizes, sampled whenever a consumer polls for data
    pub total_recv_queue_size: u64,
    pub recv_queue_size_counting_time: u64,
    /// sum of free congestion window capacity, sampled on every send attempt
    pub total_capacity: u64,
    pub capacity_counting_time: u64,
    /// sum of free arena buffers, sampled on every send attempt
    pub total_buffers: u64,
    pub buffer_counting_time: u64,
    pub active_connections: u64,
    pub retransmits: u64,
    pub startup_cached_packets: u64,
    pub sequence_mismatches: u64,
    pub checksum_errors: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub out_of_order_packets: u64,
    pub duplicate_packets: u64,
    pub acks_received: u64,
    pub status_query_messages: u64,
}

impl InterconnectStatistics {
    fn average(total: u64, count: u64) -> Option<f64> {
        if count == 0 {
            None
        }
        else {
            Some(total as f64 / count as f64)
        }
    }

    pub fn avg_recv_queue_size(&self) -> Option<f64> {
        Self::average(self.total_recv_queue_size, self.recv_queue_size_counting_time)
    }

    pub fn avg_capacity(&self) -> Option<f64> {
        Self::average(self.total_capacity, self.capacity_counting_time)
    }

    pub fn avg_buffers(&self) -> Option<f64> {
        Self::average(self.total_buffers, self.buffer_counting_time)
    }
}

/// The live counters, updated with relaxed atomics from all connections
#[derive(Default)]
pub struct StatisticsCollector {
    total_recv_queue_size: AtomicU64,
    recv_queue_size_counting_time: AtomicU64,
    total_capacity: AtomicU64,
    capacity_counting_time: AtomicU64,
    total_buffers: AtomicU64,
    buffer_counting_time: AtomicU64,
    active_connections: AtomicU64,
    retransmits: AtomicU64,
    startup_cached_packets: AtomicU64,
    sequence_mismatches: AtomicU64,
    checksum_errors: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    out_of_order_packets: AtomicU64,
    duplicate_packets: AtomicU64,
    acks_received: AtomicU64,
    status_query_messages: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatisticsCollector {
    pub fn sample_recv_queue_size(&self, queue_size: usize) {
        self.total_recv_queue_size.fetch_add(queue_size.safe_cast(), Ordering::Relaxed);
        inc(&self.recv_queue_size_counting_time);
    }

    pub fn sample_send_capacity(&self, window_capacity: usize, free_buffers: usize) {
        self.total_capacity.fetch_add(window_capacity.safe_cast(), Ordering::Relaxed);
        inc(&self.capacity_counting_time);
        self.total_buffers.fetch_add(free_buffers.safe_cast(), Ordering::Relaxed);
        inc(&self.buffer_counting_time);
    }

    pub fn on_connection_opened(&self) {
        inc(&self.active_connections);
    }

    pub fn on_connection_closed(&self) {
        // never below zero, even if a close is reported for a connection that was not counted
        let _ = self.active_connections.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn on_retransmit(&self) {
        inc(&self.retransmits);
    }

    pub fn on_startup_cached_packet(&self) {
        inc(&self.startup_cached_packets);
    }

    pub fn on_sequence_mismatch(&self) {
        inc(&self.sequence_mismatches);
    }

    pub fn on_checksum_error(&self) {
        inc(&self.checksum_errors);
    }

    pub fn on_packet_sent(&self) {
        inc(&self.packets_sent);
    }

    pub fn on_packet_received(&self) {
        inc(&self.packets_received);
    }

    pub fn on_out_of_order_packet(&self) {
        inc(&self.out_of_order_packets);
    }

    pub fn on_duplicate_packet(&self) {
        inc(&self.duplicate_packets);
    }

    pub fn on_ack_received(&self) {
        inc(&self.acks_received);
    }

    pub fn on_status_query(&self) {
        inc(&self.status_query_messages);
    }

    pub fn snapshot(&self) -> InterconnectStatistics {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        InterconnectStatistics {
            total_recv_queue_size: get(&self.total_recv_queue_size),
            recv_queue_size_counting_time: get(&self.recv_queue_size_counting_time),
            total_capacity: get(&self.total_capacity),
            capacity_counting_time: get(&self.capacity_counting_time),
            total_buffers: get(&self.total_buffers),
            buffer_counting_time: get(&self.buffer_counting_time),
            active_connections: get(&self.active_connections),
            retransmits: get(&self.retransmits),
            startup_cached_packets: get(&self.startup_cached_packets),
            sequence_mismatches: get(&self.sequence_mismatches),
            checksum_errors: get(&self.checksum_errors),
            packets_sent: get(&self.packets_sent),
            packets_received: get(&self.packets_received),
            out_of_order_packets: get(&self.out_of_order_packets),
            duplicate_packets: get(&self.duplicate_packets),
            acks_received: get(&self.acks_received),
            status_query_messages: get(&self.status_query_messages),
        }
    }
}
