use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

use crate::identity::Identity;

/// What to do when a connection has seen no traffic for the inactivity timeout.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InactivityAction {
    /// leave the connection alone
    Noop,
    /// send a payload-less keepalive packet to provoke an ack
    SendKeepalive,
    /// tear the connection down non-gracefully
    Disconnect,
}

/// Per-peer and aggregate admission ceilings for one throttle period. 0 = unlimited.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThrottleLimits {
    pub max_per_peer: u32,
    pub max_total: u32,
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager) and the
///  connections it creates.
///
/// The per-connection values here are *seeds*: window size and RTT evolve per
///  connection (and are additionally warmed from the TCB cache when a fresh entry
///  exists for the peer).
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// congestion window at connection start, in packets
    pub initial_window_size: u32,
    /// hard ceiling for congestion window growth, in packets
    pub max_window_size: u32,
    /// round-trip-time estimate used before the first sample arrives
    pub rtt_seed: Duration,
    /// retransmission timeout before the first RTT sample arrives
    pub initial_resend_delay: Duration,
    /// how long to sit on an ack hoping to piggyback it onto outbound data
    pub ack_delay: Duration,
    /// largest payload we put into a single packet (and advertise to the peer)
    pub max_payload_size: usize,
    /// ceiling on the inbound reassembly buffer, in bytes
    pub max_receive_buffer: usize,
    /// a packet resent more than this many times kills the connection
    pub max_resends: u32,
    /// how many times a packet must be nacked before it is fast-retransmitted
    pub fast_retransmit_threshold: u32,

    pub inactivity_timeout: Duration,
    pub inactivity_action: InactivityAction,

    pub connect_timeout: Duration,
    /// when set, the initial SYN is held back this long so that data from the first
    ///  write can piggyback on it
    pub connect_delay: Option<Duration>,
    /// `None` blocks indefinitely (bounded only by connection death)
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,

    /// ceiling on concurrent live connections (inbound refused, outbound fails)
    pub max_connections: usize,
    pub throttle_per_minute: ThrottleLimits,
    pub throttle_per_hour: ThrottleLimits,
    pub throttle_per_day: ThrottleLimits,
    /// when non-empty, only these identities may connect inbound
    pub access_list: FxHashSet<Identity>,
    /// these identities are always refused
    pub deny_list: FxHashSet<Identity>,

    /// latency-sensitive flow: flush small packets instead of filling them
    pub profile_interactive: bool,
    /// require every packet from the peer to be signed, not just the SYN/CLOSE/RESET class
    pub require_fully_signed: bool,

    pub local_port: u16,
    pub remote_port: u16,
}

impl StreamConfig {
    /// lower clamp for the retransmission timeout
    pub const MIN_RESEND_DELAY: Duration = Duration::from_secs(1);
    /// upper clamp for the retransmission timeout
    pub const MAX_RESEND_DELAY: Duration = Duration::from_secs(45);
    /// the write path never blocks longer than this, whatever the configured timeout
    pub const MAX_WRITE_CHOKE: Duration = Duration::from_secs(5 * 60);
    /// grace period before a reset / aborted connection is dropped from the table
    pub const DISCONNECT_GRACE: Duration = Duration::from_secs(5 * 60);
    /// linger period after an orderly close before the connection is dropped
    pub const CLOSE_LINGER: Duration = Duration::from_secs(30);

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_window_size == 0 {
            bail!("initial window size must be at least 1");
        }
        if self.max_window_size < self.initial_window_size {
            bail!("max window size below initial window size");
        }
        if self.max_payload_size == 0 || self.max_payload_size > crate::packet::Packet::MAX_PAYLOAD_SIZE {
            bail!("max payload size must be in 1..={}", crate::packet::Packet::MAX_PAYLOAD_SIZE);
        }
        if self.max_receive_buffer < self.max_payload_size {
            bail!("receive buffer smaller than a single packet payload");
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            initial_window_size: 6,
            max_window_size: 128,
            rtt_seed: Duration::from_secs(8),
            initial_resend_delay: Duration::from_secs(9),
            ack_delay: Duration::from_millis(500),
            max_payload_size: crate::packet::Packet::MAX_PAYLOAD_SIZE,
            max_receive_buffer: 256 * 1024,
            max_resends: 8,
            fast_retransmit_threshold: 2,
            inactivity_timeout: Duration::from_secs(90),
            inactivity_action: InactivityAction::Disconnect,
            connect_timeout: Duration::from_secs(60),
            connect_delay: None,
            read_timeout: None,
            write_timeout: None,
            max_connections: 256,
            throttle_per_minute: ThrottleLimits::default(),
            throttle_per_hour: ThrottleLimits::default(),
            throttle_per_day: ThrottleLimits::default(),
            access_list: FxHashSet::default(),
            deny_list: FxHashSet::default(),
            profile_interactive: false,
            require_fully_signed: false,
            local_port: 0,
            remote_port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_default_is_valid() {
        StreamConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::zero_window(|c: &mut StreamConfig| c.initial_window_size = 0)]
    #[case::max_below_initial(|c: &mut StreamConfig| c.max_window_size = 2)]
    #[case::oversized_payload(|c: &mut StreamConfig| c.max_payload_size = 64 * 1024)]
    #[case::tiny_receive_buffer(|c: &mut StreamConfig| c.max_receive_buffer = 100)]
    fn test_validate_rejects(#[case] mutate: fn(&mut StreamConfig)) {
        let mut config = StreamConfig::default();
        mutate(&mut config);
        assert!(config.validate().is_err());
    }
}
