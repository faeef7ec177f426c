use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::conn_throttler::ConnThrottler;
use crate::connection::Connection;
use crate::connection_packet_handler;
use crate::error::StreamError;
use crate::identity::{Identity, Signer};
use crate::packet::{Packet, PacketFlags, StreamId};
use crate::packet_queue::PacketQueue;
use crate::tcb_share::TcbShare;
use crate::transport::Transport;

/// Aggregate counters, folded from per-connection state as connections come and go.
#[derive(Default)]
struct ManagerStats {
    connections_created: AtomicU64,
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    connections_removed: AtomicU64,
    pings_received: AtomicU64,
    messages_received: AtomicU64,
}

#[derive(Copy, Clone, Debug)]
pub struct StatsSnapshot {
    pub connections_created: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub connections_removed: u64,
    pub pings_received: u64,
    pub messages_received: u64,
}

/// Owns the set of live connections for one local identity: demultiplexes inbound
///  packets by stream id, enforces concurrency and throttle ceilings on inbound
///  attempts, and answers liveness pings.
///
/// The embedder wires the transport's inbound callback to [`Self::on_message`], one
///  call per arrived message.
pub struct ConnectionManager {
    config: Arc<StreamConfig>,
    queue: Arc<PacketQueue>,
    connections: Mutex<FxHashMap<StreamId, Arc<Connection>>>,
    pending_pings: Mutex<FxHashMap<u32, oneshot::Sender<()>>>,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    accept_rx: Mutex<mpsc::Receiver<Arc<Connection>>>,
    throttler: ConnThrottler,
    tcb: TcbShare,
    stats: ManagerStats,
}

impl ConnectionManager {
    /// inbound connections waiting for accept() beyond this are refused
    const ACCEPT_QUEUE: usize = 16;

    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> anyhow::Result<Arc<ConnectionManager>> {
        config.validate()?;
        let (accept_tx, accept_rx) = mpsc::channel(Self::ACCEPT_QUEUE);
        Ok(Arc::new(ConnectionManager {
            throttler: ConnThrottler::new(
                config.throttle_per_minute,
                config.throttle_per_hour,
                config.throttle_per_day,
            ),
            config: Arc::new(config),
            queue: Arc::new(PacketQueue::new(transport, signer)),
            connections: Mutex::new(FxHashMap::default()),
            pending_pings: Mutex::new(FxHashMap::default()),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            tcb: TcbShare::new(TcbShare::DEFAULT_EXPIRY),
            stats: ManagerStats::default(),
        }))
    }

    pub fn local_identity(&self) -> Identity {
        self.queue.local_identity()
    }

    pub(crate) fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub async fn active_connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_created: self.stats.connections_created.load(Ordering::Relaxed),
            connections_accepted: self.stats.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.stats.connections_refused.load(Ordering::Relaxed),
            connections_removed: self.stats.connections_removed.load(Ordering::Relaxed),
            pings_received: self.stats.pings_received.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Open an outbound connection. Blocks until the first ack arrives, unless a
    ///  connect-delay is configured - then the connection is returned right away and
    ///  the SYN goes out with the first write (or when the delay runs out).
    pub async fn connect(self: &Arc<Self>, remote: Identity) -> Result<Arc<Connection>, StreamError> {
        let conn = {
            let mut connections = self.connections.lock().await;
            if connections.len() >= self.config.max_connections {
                warn!("refusing outbound connection to {}: {} live connections", remote, connections.len());
                return Err(StreamError::Refused);
            }
            let local_id = Self::allocate_id(&connections);
            let tcb_seed = self.tcb.seed(&remote);
            let conn = Connection::new(
                local_id,
                false,
                Some(remote),
                self.config.clone(),
                self.queue.clone(),
                Arc::downgrade(self),
                tcb_seed,
            );
            connections.insert(local_id, conn.clone());
            conn
        };
        conn.start_maintenance();
        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);
        debug!("outbound connection {} registered", conn.local_id());

        if self.config.connect_delay.is_some() {
            // defer the SYN hoping for first-write data to piggyback
            conn.event_occurred().await;
            return Ok(conn);
        }

        if let Err(e) = conn.ensure_syn_sent().await {
            self.remove_connection(&conn).await;
            return Err(e);
        }
        match conn.await_connect().await {
            Ok(()) => Ok(conn),
            Err(e) => {
                self.remove_connection(&conn).await;
                Err(e)
            }
        }
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<Arc<Connection>, StreamError> {
        let mut accept_rx = self.accept_rx.lock().await;
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, accept_rx.recv()).await {
                Ok(Some(conn)) => Ok(conn),
                Ok(None) => Err(StreamError::Closed),
                Err(_) => Err(StreamError::Timeout),
            },
            None => accept_rx.recv().await.ok_or(StreamError::Closed),
        }
    }

    /// Entry point for inbound transport messages, one call per message. Framing
    ///  errors are dropped silently; everything else demultiplexes by stream id.
    pub async fn on_message(self: &Arc<Self>, message: &[u8]) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let packet = match Packet::decode(message) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping unparsable message of {} bytes: {}", message.len(), e);
                return;
            }
        };

        if packet.is_flag_set(PacketFlags::ECHO) {
            self.receive_echo(packet).await;
            return;
        }

        if !packet.send_stream_id.is_unknown() {
            let conn = self.connections.lock().await.get(&packet.send_stream_id).cloned();
            match conn {
                Some(conn) => connection_packet_handler::receive_packet(&conn, packet).await,
                None => self.receive_unknown_stream(packet).await,
            }
        } else if packet.is_flag_set(PacketFlags::SYNCHRONIZE) {
            self.receive_connection(packet).await;
        } else {
            debug!("dropping packet {} with no stream id and no SYN", packet);
        }
    }

    /// An inbound SYN for a new stream: admission control, then registration.
    ///  Refusals answer with a signed RESET - except spoofed (unverifiable) SYNs,
    ///  which are dropped silently, and peers already over their throttle ceiling.
    async fn receive_connection(self: &Arc<Self>, packet: Packet) {
        let Some(from) = packet.option_from().cloned() else {
            debug!("dropping SYN without sender identity");
            return;
        };
        if !packet.verify_signature(self.queue.signer(), &from) {
            warn!("dropping SYN from {} with missing or invalid signature", from);
            return;
        }

        // a retransmitted SYN for a stream we already accepted (our answer is still in
        //  flight): route it to the existing connection instead of registering a twin -
        //  it must not count against the throttle either
        if !packet.receive_stream_id.is_unknown() {
            let candidates: Vec<Arc<Connection>> =
                self.connections.lock().await.values().cloned().collect();
            let mut existing = None;
            for conn in candidates {
                if conn.is_inbound() && conn.matches_remote(&from, packet.receive_stream_id).await {
                    existing = Some(conn);
                    break;
                }
            }
            if let Some(conn) = existing {
                debug!("SYN retransmission for known connection {}", conn.local_id());
                connection_packet_handler::receive_packet(&conn, packet).await;
                return;
            }
        }

        if self.config.deny_list.contains(&from)
            || (!self.config.access_list.is_empty() && !self.config.access_list.contains(&from))
        {
            info!("refusing connection from {}: not allowed", from);
            self.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
            self.send_refusal(&packet, &from).await;
            return;
        }

        let was_throttled = self.throttler.is_throttled(&from);
        if self.throttler.should_throttle(&from) {
            self.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
            if !was_throttled {
                // answer the first refused attempt; further ones are dropped silently
                self.send_refusal(&packet, &from).await;
            }
            return;
        }

        let conn = {
            let mut connections = self.connections.lock().await;
            if connections.len() >= self.config.max_connections {
                drop(connections);
                info!("refusing connection from {}: connection ceiling reached", from);
                self.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
                self.send_refusal(&packet, &from).await;
                return;
            }
            let local_id = Self::allocate_id(&connections);
            let conn = Connection::new(
                local_id,
                true,
                Some(from.clone()),
                self.config.clone(),
                self.queue.clone(),
                Arc::downgrade(self),
                self.tcb.seed(&from),
            );
            connections.insert(local_id, conn.clone());
            conn
        };
        conn.start_maintenance();
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        info!("inbound connection {} from {}", conn.local_id(), from);

        // the regular handler applies the SYN: stream ids, payload block 0, the ack
        connection_packet_handler::receive_packet(&conn, packet).await;

        if self.accept_tx.try_send(conn.clone()).is_err() {
            warn!("accept queue full, resetting inbound connection from {}", from);
            self.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
            conn.reset().await;
            self.remove_connection(&conn).await;
        }
    }

    /// A non-SYN packet for a stream we don't know: silently ignore RESETs, answer
    ///  verifiable packets with a RESET so the peer can tear down quickly.
    async fn receive_unknown_stream(&self, packet: Packet) {
        if packet.is_flag_set(PacketFlags::RESET) {
            return;
        }
        let Some(from) = packet.option_from().cloned() else {
            debug!("dropping packet {} for unknown stream", packet);
            return;
        };
        if !packet.verify_signature(self.queue.signer(), &from) {
            return;
        }
        debug!("answering packet {} for unknown stream with RESET", packet);
        let mut reset = Packet::new(packet.receive_stream_id, packet.send_stream_id, 0);
        reset.set_flag(PacketFlags::RESET | PacketFlags::NO_ACK);
        reset.set_option_from(self.queue.local_identity());
        self.queue
            .enqueue(&from, &mut reset, self.config.local_port, self.config.remote_port)
            .await;
    }

    async fn send_refusal(&self, syn: &Packet, to: &Identity) {
        let mut reset = Packet::new(syn.receive_stream_id, StreamId::UNKNOWN, 0);
        reset.set_flag(PacketFlags::RESET | PacketFlags::NO_ACK);
        reset.set_option_from(self.queue.local_identity());
        self.queue
            .enqueue(to, &mut reset, self.config.local_port, self.config.remote_port)
            .await;
    }

    /// Ping / pong, unrelated to any stream. A ping carries the ping id in the
    ///  send-stream-id field and must be signed; the pong echoes the id back in the
    ///  receive-stream-id field.
    async fn receive_echo(&self, packet: Packet) {
        if !packet.send_stream_id.is_unknown() {
            self.stats.pings_received.fetch_add(1, Ordering::Relaxed);
            let Some(from) = packet.option_from().cloned() else {
                debug!("dropping ping without sender identity");
                return;
            };
            if !packet.verify_signature(self.queue.signer(), &from) {
                warn!("dropping ping from {} with missing or invalid signature", from);
                return;
            }
            let mut pong = Packet::new(StreamId::UNKNOWN, packet.send_stream_id, 0);
            pong.set_flag(PacketFlags::ECHO | PacketFlags::NO_ACK);
            self.queue
                .enqueue(&from, &mut pong, self.config.local_port, self.config.remote_port)
                .await;
        } else if !packet.receive_stream_id.is_unknown() {
            if let Some(waiter) = self
                .pending_pings
                .lock()
                .await
                .remove(&packet.receive_stream_id.to_raw())
            {
                let _ = waiter.send(());
            }
        }
    }

    /// One-off liveness probe: send a signed echo packet and wait for the matching
    ///  reply. Defaults to failure on timeout.
    pub async fn ping(&self, peer: &Identity, timeout: Duration) -> bool {
        let ping_id = loop {
            let id = rand::random::<u32>();
            if id != 0 && !self.pending_pings.lock().await.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().await.insert(ping_id, tx);

        let mut ping = Packet::new(StreamId::from_raw(ping_id), StreamId::UNKNOWN, 0);
        ping.set_flag(PacketFlags::ECHO | PacketFlags::NO_ACK | PacketFlags::SIGNATURE_INCLUDED);
        ping.set_option_from(self.queue.local_identity());

        if !self
            .queue
            .enqueue(peer, &mut ping, self.config.local_port, self.config.remote_port)
            .await
        {
            self.pending_pings.lock().await.remove(&ping_id);
            return false;
        }

        let replied = tokio::time::timeout(timeout, rx).await.map(|r| r.is_ok()).unwrap_or(false);
        if !replied {
            self.pending_pings.lock().await.remove(&ping_id);
        }
        replied
    }

    /// Drop a connection from the table and fold its final estimates into the
    ///  TCB cache and the aggregate counters.
    pub(crate) async fn remove_connection(&self, conn: &Arc<Connection>) {
        let removed = self.connections.lock().await.remove(&conn.local_id()).is_some();
        if !removed {
            return;
        }
        self.stats.connections_removed.fetch_add(1, Ordering::Relaxed);
        if let Some((remote, rtt, rtt_dev, window)) = conn.on_removed().await {
            self.tcb.update(&remote, rtt, rtt_dev, window);
        }
        debug!("connection {} removed", conn.local_id());
    }

    /// Fresh random ids, collision-checked against the live table.
    fn allocate_id(connections: &FxHashMap<StreamId, Arc<Connection>>) -> StreamId {
        loop {
            let id = rand::random::<u32>();
            if id != 0 && !connections.contains_key(&StreamId::from_raw(id)) {
                return StreamId::from_raw(id);
            }
        }
    }
}
