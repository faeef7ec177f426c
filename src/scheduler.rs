use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::connection::{ConnSnapshot, Connection};

/// The lifecycle phase of a connection. Never stored: recomputed from a
///  [`ConnSnapshot`] on every evaluation, so transitions cannot be skipped or
///  corrupted by stale cached state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SchedulerPhase {
    /// locally aborted or reset sent/received, within the grace window
    HardDisconnected,
    /// locally created outbound, nothing sent yet (SYN possibly deferred)
    PreConnect,
    /// something sent, nothing acked yet
    Connecting,
    /// inbound, nothing sent yet - the SYN-ack is pending
    Received,
    /// acked at least once, neither side fully closed
    Connected,
    /// both sides closed, not everything acked yet
    Closing,
    /// both sides closed and acked, within the linger window
    Closed,
    /// grace window elapsed, or the connect attempt expired unanswered
    Dead,
}

fn grace_expired(s: &ConnSnapshot) -> bool {
    s.reset_at
        .map_or(false, |at| s.now.duration_since(at) >= StreamConfig::DISCONNECT_GRACE)
}

fn both_closed(s: &ConnSnapshot) -> bool {
    s.close_sent_at.is_some() && s.close_received_at.is_some()
}

fn close_done_at(s: &ConnSnapshot) -> Option<Instant> {
    match (s.close_sent_at, s.close_received_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

fn linger_expired(s: &ConnSnapshot) -> bool {
    close_done_at(s)
        .map_or(false, |at| s.now.duration_since(at) >= StreamConfig::CLOSE_LINGER)
}

/// An outbound attempt that never got a send-stream id assigned and ran out its
///  connect timeout. (Inbound connections know the peer's id from the SYN, so this
///  can never trigger for them.)
fn connect_expired(s: &ConnSnapshot) -> bool {
    !s.remote_id_set
        && !s.ack_received
        && s.now.duration_since(s.created_at) >= s.connect_timeout
}

fn accepts(phase: SchedulerPhase, s: &ConnSnapshot) -> bool {
    match phase {
        SchedulerPhase::HardDisconnected => s.reset && !grace_expired(s),
        SchedulerPhase::PreConnect => {
            !s.reset && !s.is_inbound && !s.anything_sent && !connect_expired(s)
        }
        SchedulerPhase::Connecting => {
            !s.reset && s.anything_sent && !s.ack_received && !both_closed(s) && !connect_expired(s)
        }
        SchedulerPhase::Received => !s.reset && s.is_inbound && !s.anything_sent,
        SchedulerPhase::Connected => !s.reset && s.ack_received && !both_closed(s),
        SchedulerPhase::Closing => !s.reset && both_closed(s) && !s.outbound_empty,
        SchedulerPhase::Closed => {
            !s.reset && both_closed(s) && s.outbound_empty && !linger_expired(s)
        }
        SchedulerPhase::Dead => {
            (s.reset && grace_expired(s))
                || (!s.reset && both_closed(s) && s.outbound_empty && linger_expired(s))
                || (!s.reset && !both_closed(s) && connect_expired(s))
        }
    }
}

/// priority order - the first accepting phase wins
const CHOOSER_ORDER: [SchedulerPhase; 8] = [
    SchedulerPhase::HardDisconnected,
    SchedulerPhase::PreConnect,
    SchedulerPhase::Connecting,
    SchedulerPhase::Received,
    SchedulerPhase::Connected,
    SchedulerPhase::Closing,
    SchedulerPhase::Closed,
    SchedulerPhase::Dead,
];

pub fn phase(s: &ConnSnapshot) -> SchedulerPhase {
    for candidate in CHOOSER_ORDER {
        if accepts(candidate, s) {
            return candidate;
        }
    }
    // the predicates are total over reachable snapshots
    debug_assert!(false, "no scheduler phase accepts {:?}", s);
    SchedulerPhase::Dead
}

/// React to an event (packet sent / received, timer fired) for one connection:
///  flush deferred work, arm the next lifecycle wakeup, or free the connection.
pub(crate) async fn event_occurred(conn: &Arc<Connection>) {
    let s = conn.snapshot().await;
    let current = phase(&s);
    trace!("connection {} is {:?}", conn.local_id(), current);

    match current {
        SchedulerPhase::HardDisconnected => {
            let due = s.reset_at.expect("hard-disconnected implies a reset timestamp")
                + StreamConfig::DISCONNECT_GRACE;
            conn.schedule_event_in(due.saturating_duration_since(s.now)).await;
        }
        SchedulerPhase::PreConnect => {
            match conn.config().connect_delay {
                Some(delay) if s.now.duration_since(s.created_at) < delay => {
                    // the SYN is deferred hoping for data to piggyback on it
                    let due = s.created_at + delay;
                    conn.schedule_event_in(due.saturating_duration_since(s.now)).await;
                }
                _ => {
                    let _ = conn.ensure_syn_sent().await;
                }
            }
        }
        SchedulerPhase::Connecting => {
            // only outbound attempts without an assigned id can expire into Dead
            if !s.is_inbound && !s.remote_id_set {
                let due = s.created_at + s.connect_timeout;
                conn.schedule_event_in(due.saturating_duration_since(s.now)).await;
            }
        }
        SchedulerPhase::Received => {
            // answer the inbound SYN: our own SYN (sequence 0) acks it and carries our id
            let _ = conn.ensure_syn_sent().await;
        }
        SchedulerPhase::Connected | SchedulerPhase::Closing => {
            // data and ack flow is driven by the packet handler and resend timers
        }
        SchedulerPhase::Closed => {
            let due = close_done_at(&s).expect("closed implies both close timestamps")
                + StreamConfig::CLOSE_LINGER;
            conn.schedule_event_in(due.saturating_duration_since(s.now)).await;
        }
        SchedulerPhase::Dead => {
            debug!("connection {} is dead, freeing it", conn.local_id());
            if let Some(manager) = conn.manager() {
                manager.remove_connection(conn).await;
            }
        }
    }
}
