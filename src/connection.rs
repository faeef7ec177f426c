use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{InactivityAction, StreamConfig};
use crate::connection_manager::ConnectionManager;
use crate::error::StreamError;
use crate::identity::Identity;
use crate::message_input_stream::MessageInputStream;
use crate::message_output_stream::{BlockSink, MessageOutputStream};
use crate::packet::{Packet, PacketFlags, StreamId};
use crate::packet_queue::PacketQueue;
use crate::scheduler;
use crate::tcb_share::TcbEntry;

/// Exponentially smoothed RTT / RTT-deviation estimator combining into the
///  retransmission timeout, RFC style: srtt = 7/8·srtt + 1/8·sample,
///  dev = 3/4·dev + 1/4·|sample − srtt|, rto = srtt + 4·dev, clamped.
pub(crate) struct RttEstimator {
    state: RttState,
    srtt: Duration,
    rtt_dev: Duration,
    rto: Duration,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum RttState {
    /// no sample yet - rto comes from configuration
    Init,
    /// exactly one sample - deviation is still a guess
    First,
    Steady,
}

impl RttEstimator {
    pub(crate) fn new(rtt_seed: Duration, initial_rto: Duration) -> RttEstimator {
        RttEstimator {
            state: RttState::Init,
            srtt: rtt_seed,
            rtt_dev: rtt_seed / 2,
            rto: Self::clamp(initial_rto),
        }
    }

    /// pre-warmed from the TCB cache - skips the first-sample initialization
    pub(crate) fn from_cache(rtt: Duration, rtt_dev: Duration) -> RttEstimator {
        let mut estimator = RttEstimator {
            state: RttState::Steady,
            srtt: rtt,
            rtt_dev,
            rto: Duration::ZERO,
        };
        estimator.recompute_rto();
        estimator
    }

    fn clamp(rto: Duration) -> Duration {
        rto.clamp(StreamConfig::MIN_RESEND_DELAY, StreamConfig::MAX_RESEND_DELAY)
    }

    fn recompute_rto(&mut self) {
        self.rto = Self::clamp(match self.state {
            RttState::Init => self.rto,
            RttState::First => self.srtt + self.srtt / 2,
            RttState::Steady => self.srtt + 4 * self.rtt_dev,
        });
    }

    pub(crate) fn update(&mut self, sample: Duration) {
        match self.state {
            RttState::Init => {
                self.state = RttState::First;
                self.srtt = sample;
                self.rtt_dev = sample / 2;
            }
            RttState::First | RttState::Steady => {
                self.state = RttState::Steady;
                let delta = if sample > self.srtt { sample - self.srtt } else { self.srtt - sample };
                self.rtt_dev = (self.rtt_dev * 3 + delta) / 4;
                self.srtt = (self.srtt * 7 + sample) / 8;
            }
        }
        self.recompute_rto();
    }

    /// RFC 6298 §5.5: back the timeout off after a congestion event so a window of 1
    ///  does not retransmit every packet forever
    pub(crate) fn double_rto(&mut self) {
        self.rto = Self::clamp(self.rto * 2);
    }

    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    pub(crate) fn srtt(&self) -> Duration {
        self.srtt
    }

    pub(crate) fn rtt_dev(&self) -> Duration {
        self.rtt_dev
    }
}

/// One packet in flight: retransmission bookkeeping for a numbered packet.
struct InFlightPacket {
    packet: Packet,
    num_sends: u32,
    nack_count: u32,
    last_sent_at: Instant,
    timer: Option<JoinHandle<()>>,
}

impl InFlightPacket {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// All mutable per-connection state, behind the connection's single mutex.
pub(crate) struct ConnectionInner {
    remote: Option<Identity>,
    /// the id the peer allocated for this stream - what we put into send-stream-id
    remote_id: StreamId,
    /// next data sequence number; 0 is consumed by the SYN
    next_send_seq: u32,
    syn_sent: bool,
    outbound: BTreeMap<u32, InFlightPacket>,
    highest_sent: Option<u32>,
    highest_acked_through: Option<u32>,

    window_size: u32,
    ssthresh: u32,
    acked_in_window: u32,
    active_resends: u32,
    ack_since_congestion: bool,
    /// highest sequence sent when the last congestion event was recorded
    last_congestion_mark: u32,
    rtt: RttEstimator,

    pub(crate) input: MessageInputStream,
    /// inbound data since the last ack we pushed out
    unacked_inbound: u32,
    ack_task: Option<JoinHandle<()>>,
    /// the peer told us to stop sending (delay-requested choke)
    peer_choked: bool,
    /// we told the peer to stop sending
    choking_peer: bool,
    /// unchoke messages still to repeat (the unchoke itself may get lost)
    unchokes_to_send: u32,
    peer_max_payload: usize,
    signature_requested_by_peer: bool,

    close_sent_at: Option<Instant>,
    close_received_at: Option<Instant>,
    reset_received: bool,
    reset_sent: bool,
    hard_aborted: bool,
    reset_at: Option<Instant>,

    last_activity: Instant,
    acked_packet_count: u64,
    dup_received_count: u64,
    event_task: Option<JoinHandle<()>>,
    removed: bool,
}

/// Scheduler input: an immutable snapshot of the lifecycle-relevant connection fields.
#[derive(Copy, Clone, Debug)]
pub struct ConnSnapshot {
    pub is_inbound: bool,
    pub created_at: Instant,
    pub anything_sent: bool,
    pub remote_id_set: bool,
    pub ack_received: bool,
    pub close_sent_at: Option<Instant>,
    pub close_received_at: Option<Instant>,
    pub outbound_empty: bool,
    pub reset: bool,
    pub reset_at: Option<Instant>,
    pub connect_timeout: Duration,
    pub now: Instant,
}

/// The protocol state for one peer-to-peer byte stream. Owned exclusively by the
///  [`ConnectionManager`]'s table (keyed by the local receive-stream id); everything
///  else - streams, timer tasks - holds a `Weak` handle and checks liveness on upgrade.
pub struct Connection {
    local_id: StreamId,
    is_inbound: bool,
    created_at: Instant,
    config: Arc<StreamConfig>,
    queue: Arc<PacketQueue>,
    manager: Weak<ConnectionManager>,
    pub(crate) inner: Mutex<ConnectionInner>,
    /// woken on any state change: data arrival, acks, reset, disconnect
    notify: Notify,
    output: MessageOutputStream,
}

struct ConnectionSink(Weak<Connection>);

#[async_trait::async_trait]
impl BlockSink for ConnectionSink {
    async fn receive_block(&self, data: Bytes) -> Result<(), StreamError> {
        match self.0.upgrade() {
            Some(conn) => conn.send_data_block(data).await,
            None => Err(StreamError::Closed),
        }
    }
}

impl Connection {
    /// delay before re-checking a resend that is not currently allowed to go out
    const RESEND_RECHECK: Duration = Duration::from_millis(1333);
    /// allow roughly half the window as concurrent active resends, minimum 3
    fn active_resend_allowance(window_size: u32) -> u32 {
        3.max((window_size + 1) / 2)
    }

    pub(crate) fn new(
        local_id: StreamId,
        is_inbound: bool,
        remote: Option<Identity>,
        config: Arc<StreamConfig>,
        queue: Arc<PacketQueue>,
        manager: Weak<ConnectionManager>,
        tcb_seed: Option<TcbEntry>,
    ) -> Arc<Connection> {
        let now = Instant::now();
        let (window_size, rtt) = match tcb_seed {
            Some(entry) => (
                entry.window_size.clamp(1, config.max_window_size),
                RttEstimator::from_cache(entry.rtt, entry.rtt_dev),
            ),
            None => (
                config.initial_window_size,
                RttEstimator::new(config.rtt_seed, config.initial_resend_delay),
            ),
        };

        Arc::new_cyclic(|weak: &Weak<Connection>| Connection {
            local_id,
            is_inbound,
            created_at: now,
            config: config.clone(),
            queue,
            manager,
            inner: Mutex::new(ConnectionInner {
                remote,
                remote_id: StreamId::UNKNOWN,
                next_send_seq: 1,
                syn_sent: false,
                outbound: BTreeMap::new(),
                highest_sent: None,
                highest_acked_through: None,
                window_size,
                ssthresh: config.max_window_size,
                acked_in_window: 0,
                active_resends: 0,
                ack_since_congestion: true,
                last_congestion_mark: 0,
                rtt,
                input: MessageInputStream::new(config.max_payload_size, config.max_receive_buffer),
                unacked_inbound: 0,
                ack_task: None,
                peer_choked: false,
                choking_peer: false,
                unchokes_to_send: 0,
                peer_max_payload: config.max_payload_size,
                signature_requested_by_peer: false,
                close_sent_at: None,
                close_received_at: None,
                reset_received: false,
                reset_sent: false,
                hard_aborted: false,
                reset_at: None,
                last_activity: now,
                acked_packet_count: 0,
                dup_received_count: 0,
                event_task: None,
                removed: false,
            }),
            notify: Notify::new(),
            output: MessageOutputStream::new(
                Arc::new(ConnectionSink(weak.clone())),
                config.max_payload_size,
                config.profile_interactive,
            ),
        })
    }

    pub fn local_id(&self) -> StreamId {
        self.local_id
    }

    pub fn is_inbound(&self) -> bool {
        self.is_inbound
    }

    pub(crate) fn config(&self) -> &Arc<StreamConfig> {
        &self.config
    }

    pub async fn remote_identity(&self) -> Option<Identity> {
        self.inner.lock().await.remote.clone()
    }

    /// Kick off the background inactivity watch. Called once by the manager after
    ///  registration.
    pub(crate) fn start_maintenance(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.inactivity_timeout;
        let action = self.config.inactivity_action;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // completes immediately
            loop {
                interval.tick().await;
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                if conn.check_inactivity(action, timeout).await {
                    return;
                }
            }
        });
    }

    /// returns true when the watch should stop
    async fn check_inactivity(self: &Arc<Self>, action: InactivityAction, timeout: Duration) -> bool {
        {
            let inner = self.inner.lock().await;
            if inner.removed || inner.hard_aborted || inner.reset_received {
                return true;
            }
            if Instant::now().duration_since(inner.last_activity) < timeout {
                return false;
            }
        }
        match action {
            InactivityAction::Noop => false,
            InactivityAction::SendKeepalive => {
                debug!("connection {} inactive, sending keepalive", self.local_id);
                self.send_ack_now().await;
                false
            }
            InactivityAction::Disconnect => {
                info!("connection {} inactive, disconnecting", self.local_id);
                self.disconnect_hard(true).await;
                true
            }
        }
    }

    // ---- identity / id assignment (each at most once) ------------------------------

    /// Protocol error if a different identity was already recorded.
    pub(crate) async fn set_remote_identity(&self, identity: Identity) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.remote {
            None => {
                inner.remote = Some(identity);
                Ok(())
            }
            Some(existing) if *existing == identity => Ok(()),
            Some(existing) => {
                anyhow::bail!("remote identity already set to {}, refusing {}", existing, identity)
            }
        }
    }

    /// Protocol error if a different id was already assigned.
    pub(crate) async fn set_remote_id(&self, id: StreamId) -> anyhow::Result<()> {
        if id.is_unknown() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.remote_id.is_unknown() {
            inner.remote_id = id;
            self.notify.notify_waiters();
            Ok(())
        } else if inner.remote_id == id {
            Ok(())
        } else {
            anyhow::bail!("send stream id already set to {}, refusing {}", inner.remote_id, id)
        }
    }

    // ---- application-facing stream API ---------------------------------------------

    pub async fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        self.output.write(data).await
    }

    pub async fn flush(&self) -> Result<(), StreamError> {
        self.output.flush().await
    }

    /// Read at least one byte into `buf`, waiting up to the configured read timeout.
    ///  Returns `Ok(0)` at orderly end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let deadline = self.config.read_timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                // a reset kills the stream immediately, buffered data included
                if inner.reset_received || inner.hard_aborted {
                    return Err(StreamError::Reset);
                }
                if inner.input.available() > 0 {
                    let n = inner.input.read_available(buf);
                    // draining the buffer lifts a choke we may have put on the peer
                    let unchoke = inner.choking_peer
                        && inner.input.available() * 2 < self.config.max_receive_buffer;
                    if unchoke {
                        inner.set_choking_peer(false);
                    }
                    drop(inner);
                    if unchoke {
                        self.send_ack_now().await;
                    }
                    return Ok(n);
                }
                if inner.input.is_eof() {
                    return Ok(0);
                }
                if inner.input.is_locally_closed() {
                    return Err(StreamError::Closed);
                }
            }
            match deadline {
                Some(deadline) => tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(deadline) => return Err(StreamError::Timeout),
                },
                None => notified.await,
            }
        }
    }

    /// Orderly close: flush buffered writes, then announce CLOSE to the peer. The
    ///  connection lingers until the close is acknowledged (and the grace period ran).
    pub async fn close(self: &Arc<Self>) -> Result<(), StreamError> {
        self.output.close().await?;

        let already_closed = self.inner.lock().await.close_sent_at.is_some();
        if !already_closed {
            self.send_close_packet().await?;
        }
        self.event_occurred().await;
        Ok(())
    }

    /// Local hard abort: everything in flight is dropped and the peer gets a RESET.
    pub async fn reset(self: &Arc<Self>) {
        self.disconnect_hard(true).await;
    }

    // ---- outbound path --------------------------------------------------------------

    /// The write path's admission control: blocks until the congestion window admits
    ///  another packet, the connection dies, or the deadline passes. Every wake
    ///  re-checks the full predicate - spurious wakeups are never treated as success.
    async fn packet_send_choke(&self, deadline: Instant) -> Result<(), StreamError> {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().await;
                if inner.reset_received || inner.hard_aborted {
                    return Err(StreamError::Reset);
                }
                let unacked = inner.outbound.len() as u32;
                let highest_sent = inner.highest_sent.map(|v| v as i64).unwrap_or(-1);
                let acked_through = inner.highest_acked_through.map(|v| v as i64).unwrap_or(-1);
                let syn_pending = inner.syn_sent && inner.remote_id.is_unknown();
                if unacked < inner.window_size
                    && inner.active_resends == 0
                    && highest_sent - acked_through <= inner.window_size as i64
                    && !inner.peer_choked
                    && !syn_pending
                {
                    return Ok(());
                }
                trace!(
                    "choking write on {}: {} unacked, window {}, {} active resends",
                    self.local_id, unacked, inner.window_size, inner.active_resends
                );
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(StreamError::Timeout),
            }
        }
    }

    /// One flushed block from the output stream becomes one numbered packet - or
    ///  several, when the peer advertised a smaller maximum packet size than ours.
    pub(crate) async fn send_data_block(self: &Arc<Self>, data: Bytes) -> Result<(), StreamError> {
        let choke_wait = self
            .config
            .write_timeout
            .unwrap_or(StreamConfig::MAX_WRITE_CHOKE)
            .min(StreamConfig::MAX_WRITE_CHOKE);

        let mut offset = 0;
        while offset < data.len() {
            let (syn_pending, max_payload) = {
                let inner = self.inner.lock().await;
                (!inner.syn_sent, inner.peer_max_payload.max(1))
            };
            let end = (offset + max_payload).min(data.len());
            let chunk = data.slice(offset..end);

            // the first chunk rides on the SYN and skips admission (nothing is in
            //  flight yet); everything after it waits for the window
            if !syn_pending {
                self.packet_send_choke(Instant::now() + choke_wait).await?;
            }
            self.send_numbered_packet(chunk, false).await?;
            offset = end;
        }
        Ok(())
    }

    /// Send the initial SYN, empty or carrying the first data block.
    ///
    /// Boxed: the scheduler awaits this, and sending feeds back into the scheduler,
    ///  so the future type would otherwise be infinitely recursive.
    pub(crate) fn ensure_syn_sent(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>> {
        Box::pin(async move {
            if self.inner.lock().await.syn_sent {
                return Ok(());
            }
            self.send_numbered_packet(Bytes::new(), false).await
        })
    }

    async fn send_close_packet(self: &Arc<Self>) -> Result<(), StreamError> {
        self.send_numbered_packet(Bytes::new(), true).await
    }

    /// The first numbered packet of the connection is always the SYN (sequence 0);
    ///  everything after it takes the next data sequence number.
    async fn send_numbered_packet(self: &Arc<Self>, data: Bytes, close: bool) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;

        let syn = !inner.syn_sent;
        let seq = if syn {
            0
        } else {
            let seq = inner.next_send_seq;
            inner.next_send_seq += 1;
            seq
        };

        let mut packet = self.build_packet(&mut inner, seq, data);
        if syn {
            packet.set_flag(PacketFlags::SYNCHRONIZE);
            packet.set_option_from(self.queue.local_identity());
            packet.set_option_max_size(self.config.max_payload_size as u16);
            if self.config.profile_interactive {
                packet.set_flag(PacketFlags::PROFILE_INTERACTIVE);
            }
            if self.config.require_fully_signed {
                packet.set_flag(PacketFlags::SIGNATURE_REQUESTED);
            }
            inner.syn_sent = true;
        }
        if close {
            packet.set_flag(PacketFlags::CLOSE);
            inner.close_sent_at = Some(Instant::now());
            // a CLOSE always asks for an immediate ack
            packet.set_option_delay(0);
        }

        inner.highest_sent = Some(inner.highest_sent.map_or(seq, |h| h.max(seq)));
        inner.unacked_inbound = 0;
        inner.last_activity = Instant::now();

        let rto = inner.rtt.rto();
        let timer = self.spawn_resend_timer(seq, rto);
        inner.outbound.insert(
            seq,
            InFlightPacket {
                packet: packet.clone(),
                num_sends: 1,
                nack_count: 0,
                last_sent_at: Instant::now(),
                timer: Some(timer),
            },
        );
        self.notify.notify_waiters();

        let delivered = self.enqueue_locked(&inner, &mut packet).await;
        drop(inner);

        if !delivered {
            self.disconnect_hard(false).await;
            return Err(StreamError::TransportFailure);
        }
        self.event_occurred().await;
        Ok(())
    }

    /// Common packet scaffolding: ids, acks, nacks, choke/unchoke signalling.
    fn build_packet(&self, inner: &mut ConnectionInner, seq: u32, data: Bytes) -> Packet {
        let mut packet = Packet::new(inner.remote_id, self.local_id, seq);
        packet.payload = data;
        packet.resend_delay = inner.rtt.rto().as_secs().min(255) as u8;

        match inner.input.highest_block() {
            Some(highest) => {
                packet.ack_through = highest;
                packet.nacks = inner.input.nacks();
                if packet.nacks.len() > Packet::MAX_NACKS {
                    packet.nacks.truncate(Packet::MAX_NACKS);
                }
            }
            None => packet.set_flag(PacketFlags::NO_ACK),
        }

        if inner.signature_requested_by_peer || self.config.require_fully_signed {
            packet.set_flag(PacketFlags::SIGNATURE_INCLUDED);
        }

        if inner.choking_peer {
            packet.set_option_delay(Packet::SEND_DELAY_CHOKE);
        } else if inner.unchokes_to_send > 0 {
            inner.unchokes_to_send -= 1;
            packet.set_option_delay(0);
        } else if seq > 0 {
            // help the peer out: ask for an immediate ack when our window runs low
            let remaining = inner.window_size.saturating_sub(inner.outbound.len() as u32);
            if remaining < 3 || remaining < (inner.window_size + 2) / 3 {
                packet.set_option_delay(0);
            }
        }
        packet
    }

    async fn enqueue_locked(&self, inner: &ConnectionInner, packet: &mut Packet) -> bool {
        let Some(remote) = inner.remote.clone() else {
            warn!("cannot send {} on {}: no remote identity", packet, self.local_id);
            return false;
        };
        self.queue
            .enqueue(&remote, packet, self.config.local_port, self.config.remote_port)
            .await
    }

    /// Push a pure ack (sequence 0): carries acks/nacks, enters no retransmission state.
    pub(crate) async fn send_ack_now(&self) {
        let mut inner = self.inner.lock().await;
        if inner.removed || inner.hard_aborted || inner.reset_received {
            return;
        }
        if let Some(task) = inner.ack_task.take() {
            task.abort();
        }
        inner.unacked_inbound = 0;
        let mut packet = self.build_packet(&mut inner, 0, Bytes::new());
        inner.last_activity = Instant::now();
        self.enqueue_locked(&inner, &mut packet).await;
    }

    /// Delay the ack a little, hoping to piggyback it onto outbound data. Re-arming
    ///  replaces the pending task rather than stacking another one.
    pub(crate) async fn schedule_ack(self: &Arc<Self>) {
        let delay = self.config.ack_delay;
        let mut inner = self.inner.lock().await;
        if inner.ack_task.is_some() {
            return; // an ack is already on its way
        }
        let weak = Arc::downgrade(self);
        inner.ack_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                // deregister first - send_ack_now aborts whatever task is registered,
                //  which at this point would be this very task
                conn.with_inner(|inner| inner.ack_task = None).await;
                conn.send_ack_now().await;
            }
        }));
    }

    // ---- retransmission -------------------------------------------------------------

    fn spawn_resend_timer(self: &Arc<Self>, seq: u32, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                conn.resend_event(seq).await;
            }
        })
    }

    /// Timer-driven (or fast-retransmit) resend of one unacked packet.
    async fn resend_event(self: &Arc<Self>, seq: u32) {
        let mut inner = self.inner.lock().await;
        if inner.removed || inner.hard_aborted || inner.reset_received {
            return;
        }
        if !inner.outbound.contains_key(&seq) {
            return; // acked in the meantime
        }

        let window_size = inner.window_size;
        let acked_through = inner.highest_acked_through.map(|v| v as i64).unwrap_or(-1);
        let allowance = Self::active_resend_allowance(window_size);
        let (is_lowest, fast_retransmit) = {
            let flight = &inner.outbound[&seq];
            (
                seq as i64 == acked_through + 1
                    || flight.num_sends > 1
                    || inner.active_resends < allowance,
                flight.nack_count >= self.config.fast_retransmit_threshold && flight.num_sends == 1,
            )
        };

        if !is_lowest && !fast_retransmit {
            // other resends are in the air - do not make a bad situation worse
            debug!(
                "delaying resend of #{} on {}: {} active resends, {} unacked",
                seq, self.local_id, inner.active_resends, inner.outbound.len()
            );
            let timer = self.spawn_resend_timer(seq, Self::RESEND_RECHECK);
            // NB: replace without aborting - the registered handle is this very task
            inner.outbound.get_mut(&seq).unwrap().timer = Some(timer);
            return;
        }

        // congestion accounting: halve at most once per window, guarded by
        //  "ack seen since the last congestion event"
        if inner.peer_choked {
            self.congestion_occurred(&mut inner);
            inner.window_size = 1;
        } else if inner.ack_since_congestion && seq > inner.last_congestion_mark {
            self.congestion_occurred(&mut inner);
            let halved = (inner.window_size / 2).max(1);
            debug!("congestion on {}: window {} -> {}", self.local_id, inner.window_size, halved);
            inner.ssthresh = halved;
            inner.window_size = halved;
            inner.rtt.double_rto();
        }

        let num_sends = {
            let flight = inner.outbound.get_mut(&seq).unwrap();
            flight.num_sends += 1;
            flight.num_sends
        };

        if num_sends - 1 > self.config.max_resends {
            info!("giving up on #{} after {} sends, disconnecting {}", seq, num_sends - 1, self.local_id);
            drop(inner);
            self.disconnect_hard(true).await;
            return;
        }

        // refresh acks / ids / choke signalling before the packet goes out again
        let mut packet = {
            let flight = &inner.outbound[&seq];
            let mut packet = flight.packet.clone();
            packet.send_stream_id = inner.remote_id;
            match inner.input.highest_block() {
                Some(highest) => {
                    packet.clear_flag(PacketFlags::NO_ACK);
                    packet.ack_through = highest;
                    packet.nacks = inner.input.nacks();
                }
                None => packet.set_flag(PacketFlags::NO_ACK),
            }
            if inner.choking_peer {
                packet.set_option_delay(Packet::SEND_DELAY_CHOKE);
            }
            packet
        };

        let backoff = inner
            .rtt
            .rto()
            .saturating_mul(1u32 << (num_sends - 1).min(16))
            .min(StreamConfig::MAX_RESEND_DELAY);
        if num_sends == 2 {
            inner.active_resends += 1;
        }
        debug!(
            "resending #{} on {} {} (send {}, next in {:?})",
            seq,
            self.local_id,
            if fast_retransmit { "(fast)" } else { "(timeout)" },
            num_sends,
            backoff
        );

        let timer = self.spawn_resend_timer(seq, backoff);
        {
            // NB: replace without aborting - the registered handle is this very task
            let flight = inner.outbound.get_mut(&seq).unwrap();
            flight.timer = Some(timer);
            flight.last_sent_at = Instant::now();
        }
        inner.last_activity = Instant::now();

        let delivered = self.enqueue_locked(&inner, &mut packet).await;
        drop(inner);
        if !delivered {
            self.disconnect_hard(false).await;
            return;
        }
        self.event_occurred().await;
    }

    fn congestion_occurred(&self, inner: &mut ConnectionInner) {
        inner.ack_since_congestion = false;
        inner.last_congestion_mark = inner.highest_sent.unwrap_or(0);
        inner.acked_in_window = 0;
    }

    // ---- inbound effects (driven by the packet handler) ----------------------------

    /// Apply the acks and nacks carried by an inbound packet.
    pub(crate) async fn on_ack(self: &Arc<Self>, ack_through: u32, nacks: &[u32]) {
        let mut fast_retransmits: Vec<u32> = Vec::new();
        {
            let mut inner = self.inner.lock().await;

            // the highest-acked-through pointer never moves backwards; the lowest nack
            //  bounds it from above
            let effective = match nacks.iter().min() {
                Some(&0) => None, // everything below the lowest nack, which is nothing
                Some(&lowest) => Some(ack_through.min(lowest - 1)),
                None => Some(ack_through),
            };
            if let Some(effective) = effective {
                if inner.highest_acked_through.map_or(true, |h| effective > h) {
                    inner.highest_acked_through = Some(effective);
                }
            }

            let mut acked_first_send: Vec<(u32, Instant)> = Vec::new();
            let mut newly_acked = 0u32;
            let to_check: Vec<u32> = inner
                .outbound
                .range(..=ack_through)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in to_check {
                if nacks.contains(&seq) {
                    let threshold = self.config.fast_retransmit_threshold;
                    let flight = inner.outbound.get_mut(&seq).unwrap();
                    flight.nack_count += 1;
                    if flight.nack_count >= threshold && flight.num_sends == 1 {
                        fast_retransmits.push(seq);
                    }
                    continue;
                }
                let mut flight = inner.outbound.remove(&seq).unwrap();
                flight.cancel_timer();
                if flight.num_sends > 1 {
                    inner.active_resends = inner.active_resends.saturating_sub(1);
                } else {
                    acked_first_send.push((seq, flight.last_sent_at));
                }
                newly_acked += 1;
            }

            if inner.outbound.is_empty() {
                inner.active_resends = 0;
            }

            if newly_acked > 0 {
                inner.ack_since_congestion = true;
                inner.acked_packet_count += newly_acked as u64;

                // RTT samples only from packets that were sent exactly once (Karn)
                let now = Instant::now();
                for (_, sent_at) in &acked_first_send {
                    inner.rtt.update(now.duration_since(*sent_at));
                }

                // window growth: slow start below ssthresh, additive increase above
                for _ in 0..newly_acked {
                    if inner.window_size < inner.ssthresh {
                        inner.window_size = (inner.window_size + 1).min(self.config.max_window_size);
                    } else {
                        inner.acked_in_window += 1;
                        if inner.acked_in_window >= inner.window_size {
                            inner.acked_in_window = 0;
                            inner.window_size = (inner.window_size + 1).min(self.config.max_window_size);
                        }
                    }
                }
                trace!(
                    "{}: {} newly acked, window now {}, rto {:?}",
                    self.local_id, newly_acked, inner.window_size, inner.rtt.rto()
                );
            }

            // a nacked packet over the threshold is resent immediately, bypassing the
            //  lowest-outstanding serialization
            for &seq in &fast_retransmits {
                let timer = self.spawn_resend_timer(seq, Duration::ZERO);
                if let Some(flight) = inner.outbound.get_mut(&seq) {
                    flight.cancel_timer();
                    flight.timer = Some(timer);
                }
            }

            inner.last_activity = Instant::now();
        }
        self.notify.notify_waiters();
    }

    /// Inbound RESET: drop everything in flight, wake every blocked caller.
    pub(crate) async fn on_reset_received(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.reset_received {
                return;
            }
            inner.reset_received = true;
            inner.reset_at = Some(Instant::now());
            Self::cancel_all_timers(&mut inner);
        }
        info!("connection {} reset by peer", self.local_id);
        self.notify.notify_waiters();
        self.event_occurred().await;
    }

    /// Local non-graceful teardown; optionally tells the peer via signed RESET.
    pub(crate) async fn disconnect_hard(self: &Arc<Self>, send_reset: bool) {
        let reset_packet = {
            let mut inner = self.inner.lock().await;
            if inner.hard_aborted || inner.reset_received {
                None
            } else {
                inner.hard_aborted = true;
                inner.reset_at = Some(Instant::now());
                // detach rather than abort: this may run inside one of those very
                //  timer tasks, and a self-abort would land before the RESET goes
                //  out. Detached timers exit on the hard-aborted guard when they fire.
                inner.outbound.clear();
                inner.active_resends = 0;
                if send_reset && !inner.remote_id.is_unknown() && inner.remote.is_some() {
                    inner.reset_sent = true;
                    let mut packet = Packet::new(inner.remote_id, self.local_id, 0);
                    packet.set_flag(PacketFlags::RESET);
                    packet.set_option_from(self.queue.local_identity());
                    Some((inner.remote.clone().unwrap(), packet))
                } else {
                    None
                }
            }
        };
        self.notify.notify_waiters();

        if let Some((remote, mut packet)) = reset_packet {
            self.queue
                .enqueue(&remote, &mut packet, self.config.local_port, self.config.remote_port)
                .await;
        }
        self.event_occurred().await;
    }

    fn cancel_all_timers(inner: &mut ConnectionInner) {
        for flight in inner.outbound.values_mut() {
            flight.cancel_timer();
        }
        inner.outbound.clear();
        inner.active_resends = 0;
        if let Some(task) = inner.ack_task.take() {
            task.abort();
        }
        if let Some(task) = inner.event_task.take() {
            task.abort();
        }
    }

    // ---- connect support ------------------------------------------------------------

    /// Wait until the SYN is acknowledged (the peer assigned us an id), bounded by the
    ///  connect timeout. A RESET during connect means refusal.
    pub(crate) async fn await_connect(self: &Arc<Self>) -> Result<(), StreamError> {
        let deadline = self.created_at + self.config.connect_timeout;
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().await;
                if inner.reset_received {
                    return Err(StreamError::Refused);
                }
                if inner.hard_aborted {
                    return Err(StreamError::Reset);
                }
                if inner.highest_acked_through.is_some() && !inner.remote_id.is_unknown() {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.disconnect_hard(false).await;
                    return Err(StreamError::Timeout);
                }
            }
        }
    }

    // ---- scheduler integration ------------------------------------------------------

    pub(crate) async fn snapshot(&self) -> ConnSnapshot {
        let inner = self.inner.lock().await;
        ConnSnapshot {
            is_inbound: self.is_inbound,
            created_at: self.created_at,
            anything_sent: inner.syn_sent,
            remote_id_set: !inner.remote_id.is_unknown(),
            ack_received: inner.highest_acked_through.is_some(),
            close_sent_at: inner.close_sent_at,
            close_received_at: inner.close_received_at,
            outbound_empty: inner.outbound.is_empty(),
            reset: inner.reset_received || inner.hard_aborted,
            reset_at: inner.reset_at,
            connect_timeout: self.config.connect_timeout,
            now: Instant::now(),
        }
    }

    /// Re-evaluate the lifecycle state machine. Invoked after every send, receive and
    ///  scheduled wakeup for this connection.
    pub(crate) fn event_occurred(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            scheduler::event_occurred(self).await;
        })
    }

    /// Arm (or re-arm, replacing the previous one) the scheduler wakeup.
    pub(crate) async fn schedule_event_in(self: &Arc<Self>, delay: Duration) {
        let mut inner = self.inner.lock().await;
        if inner.removed {
            return;
        }
        if let Some(task) = inner.event_task.take() {
            task.abort();
        }
        let weak = Arc::downgrade(self);
        inner.event_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                conn.event_occurred().await;
            }
        }));
    }

    /// Final teardown bookkeeping, called by the manager when it drops this connection
    ///  from its table. Returns the estimates to fold into the TCB cache, if any
    ///  packet was ever acked.
    pub(crate) async fn on_removed(&self) -> Option<(Identity, Duration, Duration, u32)> {
        let mut inner = self.inner.lock().await;
        if inner.removed {
            return None;
        }
        inner.removed = true;
        Self::cancel_all_timers(&mut inner);
        inner.input.set_locally_closed();
        self.notify.notify_waiters();

        if inner.acked_packet_count > 0 {
            inner.remote.clone().map(|remote| {
                (remote, inner.rtt.srtt(), inner.rtt.rtt_dev(), inner.window_size)
            })
        } else {
            None
        }
    }

    pub(crate) fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.manager.upgrade()
    }

    /// Whether this connection is the one the given peer/stream-id pair talks to -
    ///  used to recognize retransmitted SYNs for already-registered streams.
    pub(crate) async fn matches_remote(&self, identity: &Identity, remote_id: StreamId) -> bool {
        let inner = self.inner.lock().await;
        inner.remote.as_ref() == Some(identity) && inner.remote_id == remote_id
    }

    pub(crate) fn notify_state_change(&self) {
        self.notify.notify_waiters();
    }

    // ---- accessors for the packet handler -------------------------------------------

    pub(crate) async fn with_inner<R>(&self, f: impl FnOnce(&mut ConnectionInner) -> R) -> R {
        let mut inner = self.inner.lock().await;
        f(&mut inner)
    }
}

impl ConnectionInner {
    pub(crate) fn set_signature_requested(&mut self) {
        self.signature_requested_by_peer = true;
    }

    pub(crate) fn set_peer_choked(&mut self, choked: bool) {
        self.peer_choked = choked;
    }

    pub(crate) fn set_choking_peer(&mut self, choking: bool) {
        if self.choking_peer && !choking {
            // repeat the unchoke a few times in case it gets lost
            self.unchokes_to_send = 3;
        }
        self.choking_peer = choking;
    }

    pub(crate) fn set_peer_max_payload(&mut self, max: usize) {
        self.peer_max_payload = max;
    }

    pub(crate) fn note_close_received(&mut self) {
        if self.close_received_at.is_none() {
            self.close_received_at = Some(Instant::now());
        }
    }

    pub(crate) fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn note_duplicate(&mut self) -> u64 {
        self.dup_received_count += 1;
        self.dup_received_count
    }

    pub(crate) fn bump_unacked_inbound(&mut self) -> u32 {
        self.unacked_inbound += 1;
        self.unacked_inbound
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset_received || self.hard_aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    mod rtt {
        use super::*;

        #[rstest]
        fn test_initial_rto_comes_from_config() {
            let estimator = RttEstimator::new(Duration::from_secs(8), Duration::from_secs(9));
            assert_eq!(estimator.rto(), Duration::from_secs(9));
        }

        #[rstest]
        fn test_first_sample_taken_verbatim() {
            let mut estimator = RttEstimator::new(Duration::from_secs(8), Duration::from_secs(9));
            estimator.update(Duration::from_secs(2));
            assert_eq!(estimator.srtt(), Duration::from_secs(2));
            assert_eq!(estimator.rtt_dev(), Duration::from_secs(1));
            // first sample: rto = rtt + rtt/2
            assert_eq!(estimator.rto(), Duration::from_secs(3));
        }

        #[rstest]
        fn test_steady_state_smoothing() {
            let mut estimator = RttEstimator::new(Duration::from_secs(8), Duration::from_secs(9));
            estimator.update(Duration::from_millis(2000));
            estimator.update(Duration::from_millis(4000));

            // srtt = 7/8*2000 + 1/8*4000 = 2250; dev = 3/4*1000 + 1/4*2000 = 1250
            assert_eq!(estimator.srtt(), Duration::from_millis(2250));
            assert_eq!(estimator.rtt_dev(), Duration::from_millis(1250));
            // rto = srtt + 4*dev = 7250
            assert_eq!(estimator.rto(), Duration::from_millis(7250));
        }

        #[rstest]
        fn test_rto_clamped_to_bounds() {
            let mut estimator = RttEstimator::new(Duration::from_secs(8), Duration::from_secs(9));
            estimator.update(Duration::from_millis(10));
            assert_eq!(estimator.rto(), StreamConfig::MIN_RESEND_DELAY);

            for _ in 0..32 {
                estimator.update(Duration::from_secs(60));
            }
            assert_eq!(estimator.rto(), StreamConfig::MAX_RESEND_DELAY);
        }

        #[rstest]
        fn test_double_rto_clamps() {
            let mut estimator = RttEstimator::new(Duration::from_secs(8), Duration::from_secs(40));
            estimator.double_rto();
            assert_eq!(estimator.rto(), StreamConfig::MAX_RESEND_DELAY);
        }

        #[rstest]
        fn test_cache_seeding_skips_first_sample_state() {
            let estimator =
                RttEstimator::from_cache(Duration::from_millis(800), Duration::from_millis(100));
            // steady formula right away: 800 + 4*100, below the clamp floor of 1s
            assert_eq!(estimator.rto(), Duration::from_millis(1200));
        }
    }

    mod resend_allowance {
        use super::*;

        #[rstest]
        #[case(1, 3)]
        #[case(6, 3)]
        #[case(7, 4)]
        #[case(128, 64)]
        fn test_active_resend_allowance(#[case] window: u32, #[case] expected: u32) {
            assert_eq!(Connection::active_resend_allowance(window), expected);
        }
    }

    mod windowing {
        use super::*;
        use crate::identity::{MockSigner, Signature};
        use crate::transport::MockTransport;
        use std::sync::Mutex as StdMutex;

        fn peer() -> Identity {
            Identity::from_bytes(vec![0xbb; 8])
        }

        /// a connection wired to a recording transport, with no manager behind it
        fn wired_connection(config: StreamConfig) -> (Arc<Connection>, Arc<StdMutex<Vec<Vec<u8>>>>) {
            let sent: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
            let mut transport = MockTransport::new();
            let sink = sent.clone();
            transport.expect_send().returning(move |_, payload, _, _| {
                sink.lock().unwrap().push(payload.to_vec());
                true
            });
            let mut signer = MockSigner::new();
            signer
                .expect_local_identity()
                .returning(|| Identity::from_bytes(vec![0xaa; 8]));
            signer.expect_sign().returning(|_| Signature([1; Signature::LEN]));

            let queue = Arc::new(PacketQueue::new(Arc::new(transport), Arc::new(signer)));
            let conn = Connection::new(
                crate::packet::StreamId::from_raw(42),
                false,
                Some(peer()),
                Arc::new(config),
                queue,
                Weak::new(),
                None,
            );
            (conn, sent)
        }

        async fn establish(conn: &Arc<Connection>) {
            conn.ensure_syn_sent().await.unwrap();
            conn.set_remote_id(crate::packet::StreamId::from_raw(77)).await.unwrap();
            conn.on_ack(0, &[]).await;
        }

        async fn unacked_count(conn: &Arc<Connection>) -> usize {
            conn.inner.lock().await.outbound.len()
        }

        async fn window_size(conn: &Arc<Connection>) -> u32 {
            conn.inner.lock().await.window_size
        }

        /// unacked-outstanding never exceeds the window
        #[rstest]
        fn test_unacked_never_exceeds_window() {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let mut config = StreamConfig::default();
                config.initial_window_size = 3;
                config.max_window_size = 3;
                let (conn, _sent) = wired_connection(config);
                establish(&conn).await;

                let mut writers = Vec::new();
                for i in 0..6u8 {
                    let conn = conn.clone();
                    writers.push(tokio::spawn(async move {
                        conn.send_data_block(Bytes::from(vec![i; 10])).await
                    }));
                }

                // let the admitted writers proceed; the rest must choke on the window
                for _ in 0..20 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(unacked_count(&conn).await, 3);

                // every ack frees slots; the invariant holds at every step
                for acked in 1..=6u32 {
                    conn.on_ack(acked, &[]).await;
                    for _ in 0..20 {
                        tokio::task::yield_now().await;
                    }
                    let unacked = unacked_count(&conn).await as u32;
                    assert!(
                        unacked <= window_size(&conn).await,
                        "{} unacked with window {}",
                        unacked,
                        window_size(&conn).await
                    );
                }

                for writer in writers {
                    writer.await.unwrap().unwrap();
                }
            });
        }

        /// a loss halves the window exactly once per window, never below 1, and
        ///  resends from the same loss event do not halve again
        #[rstest]
        fn test_window_halves_once_per_loss_event() {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let mut config = StreamConfig::default();
                config.initial_window_size = 6;
                config.max_window_size = 6;
                let (conn, _sent) = wired_connection(config);
                establish(&conn).await;

                for i in 0..5u8 {
                    conn.send_data_block(Bytes::from(vec![i; 10])).await.unwrap();
                }
                assert_eq!(window_size(&conn).await, 6);

                // a timer-driven resend with acks seen since the last event: halve
                conn.resend_event(1).await;
                assert_eq!(window_size(&conn).await, 3);

                // second resend from the same loss burst: guarded, no re-halving
                conn.resend_event(2).await;
                assert_eq!(window_size(&conn).await, 3);

                // an ack re-arms the guard, but resending a packet from *before* the
                //  congestion mark still does not halve
                conn.on_ack(2, &[]).await;
                conn.resend_event(3).await;
                assert_eq!(window_size(&conn).await, 3);

                // drain (additive increase grows the window to 4), then a fresh loss
                //  beyond the mark halves again
                conn.on_ack(5, &[]).await;
                assert_eq!(window_size(&conn).await, 4);
                conn.send_data_block(Bytes::from(vec![9; 10])).await.unwrap();
                conn.resend_event(6).await;
                assert_eq!(window_size(&conn).await, 2);
                conn.resend_event(6).await;
                assert_eq!(window_size(&conn).await, 2);

                // repeated loss cycles bottom out at a window of 1, never 0
                conn.on_ack(6, &[]).await;
                conn.send_data_block(Bytes::from(vec![8; 10])).await.unwrap();
                conn.resend_event(7).await;
                assert_eq!(window_size(&conn).await, 1);
                conn.on_ack(7, &[]).await;
                conn.send_data_block(Bytes::from(vec![7; 10])).await.unwrap();
                conn.resend_event(8).await;
                assert_eq!(window_size(&conn).await, 1);
            });
        }

        /// nacked packets survive an ack-through that covers them
        #[rstest]
        fn test_nacked_packets_are_not_acked() {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let (conn, _sent) = wired_connection(StreamConfig::default());
                establish(&conn).await;

                for i in 0..3u8 {
                    conn.send_data_block(Bytes::from(vec![i; 10])).await.unwrap();
                }
                conn.on_ack(3, &[2]).await;

                let inner = conn.inner.lock().await;
                assert_eq!(inner.outbound.keys().copied().collect::<Vec<_>>(), vec![2]);
                assert_eq!(inner.outbound[&2].nack_count, 1);
                // the nack bounds the acked-through pointer from above
                assert_eq!(inner.highest_acked_through, Some(1));
            });
        }
    }
}
