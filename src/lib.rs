//! A reliable datagram interconnect between the nodes of an MPP database cluster. It carries
//!  ordered, loss-free, flow-controlled streams of bounded-size payloads between query
//!  execution processes, on top of a single UDP socket per node.
//!
//! ## Design goals
//!
//! * Many concurrent logical connections share one UDP socket per node
//!   * a connection is identified by the interconnect instance (i.e. the query), the peer's
//!      address and a channel id inside the instance
//!   * connections are cheap to set up: a sender can start sending before the receiver opened
//!      its side, the receiver caches a bounded number of early packets
//! * The abstraction is sending / receiving *payloads* of at most one packet each, delivered in
//!   submission order exactly once
//! * Packets are never fragmented by the interconnect, the datagram size is configured and must
//!   be supported on all routes
//! * Every packet carries a CRC-32C checksum, corrupt packets are dropped like lost ones
//! * Loss is repaired by retransmission: per-packet retransmit deadlines based on measured RTT,
//!   selective acknowledgements, explicit NAKs for packets the receiver can not buffer, and
//!   fast retransmit after duplicate ACKs
//! * Flow control through a per-connection congestion window (slow start, AIMD), bounded by
//!   the connection's fair share of a fixed-size buffer arena that is allocated once at startup
//! * Dead peers are detected by probing idle connections with STATUS_QUERY packets
//! * Failures that the protocol can not absorb (dead peer, drain timeout) are reported to the
//!   producer / consumer, everything else shows up in statistics only
//!
//! ## Header
//!
//! Packet header - all numbers in network byte order (BE):
//! ```ascii
//!  0: checksum (u32): CRC-32C over everything after it, i.e. the rest of the header and the
//!      payload
//!  4: protocol version (u8), currently 1
//!  5: packet kind (u8):
//!     * 1 CONNECT
//!     * 2 DATA
//!     * 3 ACK
//!     * 4 NAK
//!     * 5 STATUS_QUERY
//!     * 6 STATUS_REPLY
//!     * 7 FIN
//!  6: interconnect instance id (u32)
//! 10: channel id (u16)
//! 12: sequence number (u64): for DATA and FIN the packet's position in the connection's
//!      stream, starting at 1. For STATUS_QUERY and STATUS_REPLY the probe number, 0 otherwise.
//! 20: ack sequence number (u64): highest contiguous sequence number received from the peer,
//!      0 for none. Every packet carries it, so acknowledgements piggyback on reverse traffic.
//! 28: payload length (u16)
//! 30: payload
//! ```
//!
//! ## Control messages
//!
//! *CONNECT* is sent by the side opening a connection, with exponential backoff, until any
//!  packet from the peer arrives. It has no payload and is answered by an ACK.
//!
//! *ACK* and *NAK* carry a list of sequence numbers as their payload:
//!
//! ```ascii
//! 0: number of sequence numbers (varint usize)
//! *: (repeated) sequence number (u64 BE)
//! ```
//!
//! For ACK these are the packets held in the receiver's out-of-order buffer (selective
//!  acknowledgement), for NAK the packets the receiver is missing and requests to be re-sent.
//!
//! *STATUS_QUERY* probes an idle peer, which answers with a *STATUS_REPLY* echoing the probe
//!  number. Neither has a payload.
//!
//! *FIN* is the last sequenced packet of a stream. It is retransmitted and acknowledged like
//!  DATA, and a receiver closes its side once its consumer saw the end of the stream.
//!
//! ## Connection life cycle
//!
//! ```ascii
//!   SETUP ----> ESTABLISHED ----> DRAINING ----> CLOSED(reason)
//! ```
//!
//! See [ccb] for the details.

pub mod buffers;
pub mod ccb;
pub mod config;
pub mod connection;
pub mod connection_table;
mod congestion_window;
mod control_messages;
pub mod end_point;
pub mod error;
mod exponential_backoff;
mod liveness;
pub mod packet_header;
mod receive_engine;
mod rtt_estimator;
pub mod safe_converter;
mod send_engine;
pub mod send_pipeline;
pub mod sequence_number;
mod shutdown;
pub mod statistics;
mod transport_context;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
