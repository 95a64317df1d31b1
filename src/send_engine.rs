//! Outbound half of the protocol: framing and transmitting packets for a connection, and
//!  reacting to the peer's acknowledgements.
//!
//! These functions operate on a CCB the caller has locked for writing. Sequenced packets (DATA,
//!  FIN) live in arena buffers until they are acknowledged, control packets are framed into a
//!  small per-call buffer.

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::buffers::buffer_arena::ArenaBuf;
use crate::ccb::Ccb;
use crate::connection_table::ConnectionKey;
use crate::control_messages::SequenceList;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::sequence_number::SequenceNumber;
use crate::transport_context::TransportContext;

pub async fn send_control(ctx: &TransportContext, key: &ConnectionKey, kind: PacketKind, sequence: SequenceNumber, ack_sequence: SequenceNumber, payload: &[u8]) {
    let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
    PacketHeader::new(kind, key.instance_id, key.channel_id, sequence, ack_sequence)
        .encode(payload, &mut buf);

    trace!("sending {:?} to {}", kind, key);
    ctx.pipeline.send_packet(key.remote, &buf).await;
}

fn sequence_list_payload(sequences: Vec<SequenceNumber>, max_len: usize) -> BytesMut {
    let list = SequenceList::new(sequences).truncated(max_len);
    let mut payload = BytesMut::with_capacity(SequenceList::max_serialized_len(list.sequences.len()));
    list.ser(&mut payload);
    payload
}

/// ACK with the highest contiguous sequence number and the out-of-order buffer's content as
///  selective acknowledgements
pub async fn send_ack(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb) {
    let max_len = ctx.config.max_sequence_list_len;
    let payload = sequence_list_payload(ccb.receive.selective_acks(max_len), max_len);

    send_control(ctx, key, PacketKind::Ack, SequenceNumber::ZERO, ccb.receive.highest_contiguous(), &payload).await;
    ccb.receive.on_ack_sent();
}

/// ACK on behalf of a connection that no longer exists
pub async fn send_stateless_ack(ctx: &TransportContext, key: &ConnectionKey, ack_sequence: SequenceNumber) {
    let payload = sequence_list_payload(Vec::new(), 0);
    send_control(ctx, key, PacketKind::Ack, SequenceNumber::ZERO, ack_sequence, &payload).await;
}

pub async fn send_nak(ctx: &TransportContext, key: &ConnectionKey, ccb: &Ccb, missing: Vec<SequenceNumber>) {
    if missing.is_empty() {
        return;
    }
    debug!("requesting retransmission of {:?} from {}", missing, key);

    let payload = sequence_list_payload(missing, ctx.config.max_sequence_list_len);
    send_control(ctx, key, PacketKind::Nak, SequenceNumber::ZERO, ccb.receive.highest_contiguous(), &payload).await;
}

pub async fn send_connect(ctx: &TransportContext, key: &ConnectionKey, ccb: &Ccb) {
    debug!("sending CONNECT #{} to {}", ccb.handshake.num_attempts(), key);
    send_control(ctx, key, PacketKind::Connect, SequenceNumber::ZERO, ccb.receive.highest_contiguous(), &[]).await;
}

pub async fn send_status_query(ctx: &TransportContext, key: &ConnectionKey, ccb: &Ccb, probe: u64) {
    ctx.statistics.on_status_query();
    send_control(ctx, key, PacketKind::StatusQuery, SequenceNumber::from_raw(probe), ccb.receive.highest_contiguous(), &[]).await;
}

pub async fn send_status_reply(ctx: &TransportContext, key: &ConnectionKey, ccb: &Ccb, probe: SequenceNumber) {
    send_control(ctx, key, PacketKind::StatusReply, probe, ccb.receive.highest_contiguous(), &[]).await;
}

/// Frame `payload` as the connection's next DATA packet into `buf`, transmit it and keep it in
///  flight until it is acknowledged. The caller checked the congestion window and the payload's
///  size.
pub async fn send_data(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, buf: ArenaBuf, payload: &[u8], now: Instant) -> SequenceNumber {
    let sequence = ccb.send.next_sequence();
    send_sequenced(ctx, key, ccb, PacketKind::Data, sequence, buf, payload, now).await;
    sequence
}

#[allow(clippy::too_many_arguments)]
async fn send_sequenced(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, kind: PacketKind, sequence: SequenceNumber, mut buf: ArenaBuf, payload: &[u8], now: Instant) {
    PacketHeader::new(kind, key.instance_id, key.channel_id, sequence, ccb.receive.highest_contiguous())
        .encode(payload, &mut *buf);

    trace!("sending {:?} {} to {}", kind, sequence, key);
    ctx.pipeline.send_packet(key.remote, buf.as_ref()).await;

    ccb.send.register(sequence, buf, now);
    // the packet carried the cumulative ack
    ccb.receive.on_ack_sent();
}

/// Send a pending FIN. FIN bypasses the congestion window, but it needs an arena buffer - if
///  there is none, it stays pending and the timer driver retries. Returns `true` if FIN was
///  sent.
pub async fn try_send_fin(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, now: Instant) -> bool {
    if !ccb.send.fin_pending {
        return false;
    }
    let Some(buf) = ctx.arena.acquire() else {
        debug!("no arena buffer for FIN to {} - retrying later", key);
        return false;
    };

    let sequence = ccb.send.next_sequence();
    send_sequenced(ctx, key, ccb, PacketKind::Fin, sequence, buf, &[], now).await;
    ccb.send.fin_sequence = Some(sequence);
    ccb.send.fin_pending = false;
    true
}

pub async fn retransmit(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, sequence: SequenceNumber, now: Instant) {
    let Some(packet) = ccb.send.packet(sequence) else {
        return;
    };

    trace!("retransmitting {} to {} (attempt #{})", sequence, key, packet.num_retransmits + 1);
    ctx.statistics.on_retransmit();
    ctx.pipeline.send_packet(key.remote, packet.buf.as_ref()).await;

    ccb.send.on_retransmitted(sequence, now);
}

/// Handle an ACK packet. Returns `true` if in-flight packets were released or the window
///  changed, i.e. if blocked submitters should re-check.
pub async fn on_ack_packet(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, header: &PacketHeader, payload: &[u8], now: Instant) -> bool {
    ctx.statistics.on_ack_received();

    let mut parse_buf = payload;
    let sacked = match SequenceList::deser(&mut parse_buf, ctx.config.max_sequence_list_len) {
        Ok(list) => list.sequences,
        Err(e) => {
            debug!("ACK from {} with malformed selective ack list, using the cumulative ack only: {}", key, e);
            Vec::new()
        }
    };

    let outcome = ccb.send.on_ack(header.ack_sequence, &sacked, true, now);
    if let Some(sequence) = outcome.fast_retransmit {
        debug!("duplicate ACKs from {} - fast retransmit of {}", key, sequence);
        retransmit(ctx, key, ccb, sequence, now).await;
    }

    outcome.num_acked > 0 || outcome.fast_retransmit.is_some()
}

/// Handle a NAK packet, re-sending every requested packet that is still in flight
pub async fn on_nak_packet(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, payload: &[u8], now: Instant) {
    let mut parse_buf = payload;
    let requested = match SequenceList::deser(&mut parse_buf, ctx.config.max_sequence_list_len) {
        Ok(list) => list.sequences,
        Err(e) => {
            debug!("received unparseable NAK from {} - ignoring: {}", key, e);
            return;
        }
    };

    trace!("NAK from {} for {:?}", key, requested);
    for sequence in ccb.send.retransmittable(&requested) {
        retransmit(ctx, key, ccb, sequence, now).await;
    }
}

/// Re-send every in-flight packet whose deadline passed, halving the congestion window once
///  if there was any. Returns the number of retransmitted packets.
pub async fn retransmit_expired(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, now: Instant) -> usize {
    let expired = ccb.send.expired(now);
    if expired.is_empty() {
        return 0;
    }

    debug!("retransmit timeout for {:?} on {}", expired, key);
    for &sequence in &expired {
        retransmit(ctx, key, ccb, sequence, now).await;
    }
    ccb.send.on_timeout_loss();
    expired.len()
}
