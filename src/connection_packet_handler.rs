use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::packet::{Packet, PacketFlags};

/// What the handler decided to do about acknowledging, after applying a packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum AckDecision {
    /// push an ack right away (duplicate data, close, explicit request, choke)
    Immediate,
    /// new data - delay the ack a little, hoping to piggyback it
    Delayed,
    None,
}

/// Validate an inbound packet against a specific connection and apply its effects:
///  reassembly insert, ack/nack processing, RTT sampling (inside ack processing),
///  choke and close handling. Malformed or unverifiable packets are dropped without
///  a reply.
pub(crate) async fn receive_packet(conn: &Arc<Connection>, packet: Packet) {
    let local_id = conn.local_id();
    if !packet.send_stream_id.is_unknown() && packet.send_stream_id != local_id {
        warn!(
            "dropping packet {} aimed at stream {} but routed to {}",
            packet, packet.send_stream_id, local_id
        );
        return;
    }

    if !verify_if_required(conn, &packet).await {
        warn!("dropping packet {} on {}: missing or invalid signature", packet, local_id);
        return;
    }

    if packet.is_flag_set(PacketFlags::RESET) {
        conn.on_reset_received().await;
        return;
    }

    // the SYN carries the peer's identity; every packet carries the peer's stream id
    if let Some(from) = packet.option_from() {
        if let Err(e) = conn.set_remote_identity(from.clone()).await {
            warn!("dropping packet {} on {}: {}", packet, local_id, e);
            return;
        }
    }
    if !packet.receive_stream_id.is_unknown() {
        if let Err(e) = conn.set_remote_id(packet.receive_stream_id).await {
            // a mismatched stream id is a protocol error, not recoverable noise
            warn!("resetting {}: {}", local_id, e);
            conn.disconnect_hard(true).await;
            return;
        }
    }

    let decision = conn
        .with_inner(|inner| {
            if inner.is_reset() {
                return AckDecision::None;
            }
            inner.note_activity();

            if packet.is_flag_set(PacketFlags::SIGNATURE_REQUESTED) {
                inner.set_signature_requested();
            }
            if let Some(max_size) = packet.option_max_size() {
                if max_size > 0 {
                    inner.set_peer_max_payload(max_size as usize);
                }
            }
            match packet.option_delay() {
                Some(delay) if delay >= Packet::MIN_DELAY_CHOKE => {
                    debug!("{}: peer choked us", local_id);
                    inner.set_peer_choked(true);
                }
                Some(0) => inner.set_peer_choked(false),
                _ => {}
            }

            let mut decision = AckDecision::None;
            if packet.is_numbered() {
                let seq = packet.sequence_num;
                if !inner.input.can_accept(seq, packet.payload.len()) {
                    // no room - choke the peer instead of buffering unbounded data
                    debug!("{}: reassembly buffer full, choking peer", local_id);
                    inner.set_choking_peer(true);
                    return AckDecision::Immediate;
                }
                let is_new = inner.input.insert(seq, packet.payload.clone());
                if is_new {
                    inner.bump_unacked_inbound();
                    decision = AckDecision::Delayed;
                } else {
                    // retransmission-triggered duplicate: our ack most likely got
                    //  lost, repeat it without delay
                    let dups = inner.note_duplicate();
                    trace!("{}: dup #{} ({} total)", local_id, seq, dups);
                    decision = AckDecision::Immediate;
                }

                if packet.is_flag_set(PacketFlags::CLOSE) {
                    inner.input.set_close_received(seq);
                    inner.note_close_received();
                    decision = AckDecision::Immediate;
                }
            }

            if packet.option_delay() == Some(0) && decision == AckDecision::Delayed {
                // the peer explicitly asked for an immediate ack
                decision = AckDecision::Immediate;
            }
            decision
        })
        .await;

    if let Some(ack_through) = packet.ack_through() {
        conn.on_ack(ack_through, &packet.nacks).await;
    }

    match decision {
        AckDecision::Immediate => conn.send_ack_now().await,
        AckDecision::Delayed => conn.schedule_ack().await,
        AckDecision::None => {}
    }

    conn.notify_state_change();
    conn.event_occurred().await;
}

/// SYN / CLOSE / RESET class packets must carry a valid signature; other packets only
///  when the connection is configured to require it. The SYN is verified against the
///  identity it declares, everything else against the connection's known peer.
async fn verify_if_required(conn: &Arc<Connection>, packet: &Packet) -> bool {
    let required = packet
        .flags()
        .intersects(PacketFlags::SYNCHRONIZE | PacketFlags::CLOSE | PacketFlags::RESET)
        || conn.config().require_fully_signed;
    if !required {
        return true;
    }

    let from = match packet.option_from() {
        Some(from) => Some(from.clone()),
        None => conn.remote_identity().await,
    };
    let Some(from) = from else {
        return false;
    };

    let manager = conn.manager();
    let Some(manager) = manager else {
        return false;
    };
    packet.verify_signature(manager.queue().signer(), &from)
}
