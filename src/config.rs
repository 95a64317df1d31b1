use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::control_messages::SequenceList;
use crate::packet_header::PacketHeader;

#[derive(Debug, Clone)]
pub struct InterconnectConfig {
    pub self_addr: SocketAddr,

    /// This is the UDP payload size the interconnect assumes, i.e. the size of a packet including
    ///  its header. Packets are never fragmented by the interconnect, so this size must be
    ///  supported on all routes between nodes. Every arena buffer has this size.
    pub max_datagram_size: usize,

    /// The number of connections expected to be open concurrently. Together with
    ///  `buffers_per_connection` this determines the arena's size, which is allocated once
    ///  and never grows.
    pub expected_connections: usize,
    pub buffers_per_connection: usize,

    /// congestion window (in packets) of a new connection
    pub initial_window: u32,
    /// upper bound for the congestion window - the effective ceiling is further limited by
    ///  each connection's fair share of the arena
    pub max_window: u32,
    /// number of packets a receiver buffers beyond the highest contiguous sequence number
    pub max_out_of_order: usize,
    /// number of packets a receiver caches for a connection that the local consumer did
    ///  not open yet
    pub max_startup_cached_packets: usize,
    /// number of duplicate ACKs that trigger an immediate retransmission
    pub fast_retransmit_threshold: u32,

    /// in-order packets are acknowledged after this many arrivals or ...
    pub ack_every_n_packets: u32,
    /// ... once the oldest unacknowledged arrival is this old, whichever comes first
    pub max_ack_delay: Duration,

    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// resolution of each connection's timer driver (retransmit deadlines, delayed ACKs,
    ///  connect retries, drain deadline)
    pub timer_tick: Duration,

    pub connect_retry_interval: Duration,
    pub max_connect_attempts: u32,
    /// time a connection created by the peer waits to be opened locally before it is discarded
    pub accept_timeout: Duration,

    pub liveness_check_interval: Duration,
    /// an established connection without inbound traffic for this long is probed
    pub idle_threshold: Duration,
    pub probe_interval: Duration,
    pub max_probe_interval: Duration,
    /// growth factor between probes, in multiples of 1/8
    pub probe_backoff_factor_eighths: u32,
    /// randomization of probe intervals, 0.0 for none and < 1.0
    pub probe_jitter: f64,
    pub max_liveness_probes: u32,

    pub drain_timeout: Duration,

    /// maximum number of entries in an ACK's selective-ack list or a NAK's missing list
    pub max_sequence_list_len: usize,
}

impl InterconnectConfig {
    pub fn new(self_addr: SocketAddr) -> InterconnectConfig {
        InterconnectConfig {
            self_addr,
            max_datagram_size: 8192,
            expected_connections: 64,
            buffers_per_connection: 32,
            initial_window: 4,
            max_window: 32,
            max_out_of_order: 16,
            max_startup_cached_packets: 16,
            fast_retransmit_threshold: 3,
            ack_every_n_packets: 2,
            max_ack_delay: Duration::from_millis(2),
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_secs(5),
            timer_tick: Duration::from_millis(5),
            connect_retry_interval: Duration::from_millis(100),
            max_connect_attempts: 10,
            accept_timeout: Duration::from_secs(30),
            liveness_check_interval: Duration::from_millis(100),
            idle_threshold: Duration::from_secs(2),
            probe_interval: Duration::from_millis(500),
            max_probe_interval: Duration::from_secs(4),
            probe_backoff_factor_eighths: 16,
            probe_jitter: 0.1,
            max_liveness_probes: 3,
            drain_timeout: Duration::from_secs(10),
            max_sequence_list_len: 64,
        }
    }

    /// number of buffers in the shared arena
    pub fn arena_capacity(&self) -> usize {
        self.expected_connections * self.buffers_per_connection
    }

    /// memory (in bytes) that the arena allocates at startup
    pub fn arena_memory_size(&self) -> usize {
        self.arena_capacity() * self.max_datagram_size
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN
    }

    /// The congestion window never grows beyond this: a connection's fair share of the arena,
    ///  and never more than `max_window`
    pub fn window_ceiling(&self) -> u32 {
        let fair_share = (self.arena_capacity() / self.expected_connections.max(1))
            .min(u32::MAX as usize) as u32;
        self.max_window.min(fair_share).max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= PacketHeader::SERIALIZED_LEN || self.max_datagram_size > PacketHeader::MAX_DATAGRAM_SIZE {
            bail!("datagram size must be between {} and {}", PacketHeader::SERIALIZED_LEN + 1, PacketHeader::MAX_DATAGRAM_SIZE);
        }
        if self.max_sequence_list_len == 0 {
            bail!("sequence lists must allow at least one entry");
        }
        if PacketHeader::SERIALIZED_LEN + SequenceList::max_serialized_len(self.max_sequence_list_len) > self.max_datagram_size {
            bail!("an ACK / NAK with {} sequence numbers does not fit a datagram of {} bytes", self.max_sequence_list_len, self.max_datagram_size);
        }
        if self.expected_connections == 0 {
            bail!("expected number of connections must be positive");
        }
        if self.buffers_per_connection < 2 {
            bail!("the arena must provide at least two buffers per connection");
        }
        let Some(arena_capacity) = self.expected_connections.checked_mul(self.buffers_per_connection) else {
            bail!("arena of {} x {} buffers overflows", self.expected_connections, self.buffers_per_connection);
        };
        if arena_capacity.checked_mul(self.max_datagram_size).is_none() {
            bail!("arena of {} buffers of {} bytes overflows", arena_capacity, self.max_datagram_size);
        }
        if self.initial_window == 0 || self.max_window < self.initial_window {
            bail!("congestion window must start positive and not exceed its maximum");
        }
        if self.max_out_of_order == 0 {
            bail!("out-of-order buffer must hold at least one packet");
        }
        if self.fast_retransmit_threshold == 0 || self.ack_every_n_packets == 0 {
            bail!("ack thresholds must be positive");
        }
        if self.timer_tick.is_zero() || self.liveness_check_interval.is_zero() {
            bail!("timer intervals must be positive");
        }
        if self.min_rto.is_zero() || self.min_rto > self.initial_rto || self.initial_rto > self.max_rto {
            bail!("retransmit timeouts must satisfy 0 < min_rto <= initial_rto <= max_rto");
        }
        if self.max_connect_attempts == 0 || self.max_liveness_probes == 0 {
            bail!("connect attempts and liveness probes must be positive");
        }
        if self.probe_backoff_factor_eighths < 8 {
            bail!("probe backoff must not shrink the probe interval");
        }
        if !(0.0..1.0).contains(&self.probe_jitter) {
            bail!("probe jitter must be in [0.0, 1.0)");
        }
        if self.probe_interval > self.max_probe_interval {
            bail!("probe interval must not exceed the maximum probe interval");
        }

        Ok(())
    }
}
