//! Inbound half of the protocol: applying a decoded packet to its connection's CCB.
//!
//! Sequenced packets (DATA, FIN) go through ordering and duplicate detection before they reach
//!  the delivery queue, and every arrival is acknowledged - immediately if it was out of order,
//!  a duplicate, filled a gap or ended the stream, coalesced otherwise. Everything else is
//!  handed to the send engine.

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::ccb::receive_state::{Classification, ReceivedItem};
use crate::ccb::{Ccb, ConnectionState};
use crate::connection_table::ConnectionKey;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::send_engine;
use crate::sequence_number::SequenceNumber;
use crate::transport_context::TransportContext;

/// What changed for the connection's waiters while handling a packet
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ReceiveOutcome {
    /// the delivery queue grew
    pub data_available: bool,
    /// in-flight packets were released or the congestion window changed
    pub window_changed: bool,
    pub state_changed: bool,
}

pub async fn on_packet(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, header: &PacketHeader, payload: &[u8], now: Instant) -> ReceiveOutcome {
    let mut outcome = ReceiveOutcome::default();

    if ccb.state().is_closed() {
        trace!("{:?} for closed connection {} - ignoring", header.kind, key);
        return outcome;
    }
    ccb.liveness.on_traffic(now);

    if !ccb.is_locally_opened() {
        if header.kind.is_sequenced() {
            cache_startup_packet(ctx, key, ccb, header, payload);
        }
        return outcome;
    }

    if ccb.state() == ConnectionState::Setup {
        // anything from the peer means it knows about the connection
        outcome.state_changed |= ccb.establish();
    }

    if header.kind != PacketKind::Ack {
        let piggybacked = ccb.send.on_ack(header.ack_sequence, &[], false, now);
        outcome.window_changed |= piggybacked.num_acked > 0;
    }

    match header.kind {
        PacketKind::Connect => send_engine::send_ack(ctx, key, ccb).await,
        PacketKind::Data | PacketKind::Fin => on_sequenced(ctx, key, ccb, header, payload, now, &mut outcome).await,
        PacketKind::Ack => outcome.window_changed |= send_engine::on_ack_packet(ctx, key, ccb, header, payload, now).await,
        PacketKind::Nak => send_engine::on_nak_packet(ctx, key, ccb, payload, now).await,
        PacketKind::StatusQuery => send_engine::send_status_reply(ctx, key, ccb, header.sequence).await,
        PacketKind::StatusReply => trace!("status reply #{} from {}", header.sequence, key),
    }

    outcome
}

async fn on_sequenced(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, header: &PacketHeader, payload: &[u8], now: Instant, outcome: &mut ReceiveOutcome) {
    let sequence = header.sequence;

    match ccb.receive.classify(sequence) {
        Classification::Duplicate => {
            trace!("duplicate {} from {}", sequence, key);
            ctx.statistics.on_duplicate_packet();
            send_engine::send_ack(ctx, key, ccb).await;
        }
        Classification::Overflow => {
            debug!("{} from {} is beyond the out-of-order buffer - dropping", sequence, key);
            let missing = ccb.receive.missing_below(sequence, ctx.config.max_sequence_list_len);
            send_engine::send_nak(ctx, key, ccb, missing).await;
        }
        classification => {
            let Some(item) = received_item(ctx, key, header.kind, sequence, payload) else {
                // not acknowledged, the sender retransmits
                return;
            };

            let is_immediate_ack = accept(ctx, key, ccb, classification, sequence, item, now, outcome);
            if is_immediate_ack || ccb.receive.on_in_order_arrival(now, ctx.config.ack_every_n_packets) {
                send_engine::send_ack(ctx, key, ccb).await;
            }
        }
    }
}

/// Accept an in-order or ahead-of-order item, returning `true` if it should be acknowledged
///  immediately
#[allow(clippy::too_many_arguments)]
fn accept(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, classification: Classification, sequence: SequenceNumber, item: ReceivedItem, now: Instant, outcome: &mut ReceiveOutcome) -> bool {
    if let Classification::Ahead { opens_gap } = classification {
        trace!("out-of-order {} from {}", sequence, key);
        ctx.statistics.on_out_of_order_packet();
        if opens_gap {
            ctx.statistics.on_sequence_mismatch();
        }
    }

    let accepted = ccb.receive.accept(sequence, item);
    outcome.data_available |= accepted.num_delivered > 0;

    if accepted.end_of_stream {
        debug!("end of stream from {}", key);
        outcome.state_changed |= ccb.start_draining(now, &ctx.config);
    }

    classification != Classification::InOrder || accepted.filled_gap || accepted.end_of_stream
}

fn received_item(ctx: &TransportContext, key: &ConnectionKey, kind: PacketKind, sequence: SequenceNumber, payload: &[u8]) -> Option<ReceivedItem> {
    if kind == PacketKind::Fin {
        return Some(ReceivedItem::EndOfStream);
    }

    let Some(mut buf) = ctx.arena.acquire() else {
        debug!("buffer arena exhausted - dropping {} from {}", sequence, key);
        return None;
    };
    if !buf.fill_from(payload) {
        debug!("payload of {} bytes from {} exceeds the buffer size - dropping", payload.len(), key);
        return None;
    }
    Some(ReceivedItem::Payload(buf))
}

fn cache_startup_packet(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, header: &PacketHeader, payload: &[u8]) {
    if ccb.receive.is_cached(header.sequence) || ccb.receive.classify(header.sequence) == Classification::Duplicate {
        ctx.statistics.on_duplicate_packet();
        return;
    }

    let Some(item) = received_item(ctx, key, header.kind, header.sequence, payload) else {
        return;
    };
    if ccb.receive.cache_startup_packet(header.sequence, item) {
        trace!("cached {} from {} until the connection is opened", header.sequence, key);
        ctx.statistics.on_startup_cached_packet();
    }
    else {
        debug!("startup cache for {} is full - dropping {}", key, header.sequence);
    }
}

/// Run the packets that were cached before the connection was opened through the receive
///  path, and acknowledge them
pub async fn replay_startup_cache(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, now: Instant) -> ReceiveOutcome {
    let mut outcome = ReceiveOutcome::default();

    let cached = ccb.receive.take_startup_cache();
    debug!("replaying {} cached packets for {}", cached.len(), key);
    for (sequence, item) in cached {
        match ccb.receive.classify(sequence) {
            Classification::Duplicate | Classification::Overflow => {
                trace!("discarding cached {} for {}", sequence, key);
            }
            classification => {
                accept(ctx, key, ccb, classification, sequence, item, now, &mut outcome);
            }
        }
    }

    send_engine::send_ack(ctx, key, ccb).await;
    outcome
}
