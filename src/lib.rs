//! `rivulet` is a reliable, ordered, connection-oriented byte-stream protocol - a TCP
//!  analog - running entirely on top of an unreliable, message-oriented, high-latency
//!  transport that delivers discrete signed messages between two opaque network
//!  identities.
//!
//! ## Design goals
//!
//! * Provide TCP-like guarantees on a transport with none of TCP's substrate:
//!   * in-order delivery of a byte stream, with at-least-once transmission and
//!     receiver-side deduplication
//!   * flow control via a packet-count congestion window with slow start, additive
//!     increase and halve-on-loss
//!   * selective retransmission driven by explicit NACKs rather than timers alone -
//!     important when round trips are seconds, not milliseconds
//!   * graceful teardown (CLOSE exchanged and acknowledged, then a linger window)
//!     and abrupt teardown (signed RESET)
//! * Tolerate the transport's properties instead of fighting them:
//!   * no inherent ordering: every data block is numbered, out-of-order arrival is
//!     the normal case, reassembly is the receiver's job
//!   * variable and high latency: RTT is estimated per peer and cached *across*
//!     connections (RFC 2140 style), so a second connection to the same peer does
//!     not start from cold defaults
//!   * no connection concept: stream ids are negotiated in-band by the SYN exchange
//!   * message loss: per-packet retransmission timers with exponential backoff,
//!     bounded by a resend ceiling that eventually declares the connection dead
//! * Keep the lifecycle state machine impossible to corrupt: the scheduler phase is
//!   never stored, it is recomputed from connection state on every evaluation, so
//!   illegal transitions cannot happen by construction
//! * The engine is transport- and crypto-agnostic: sending, receiving and signing
//!   happen behind small traits ([`Transport`], [`Signer`]); the engine never opens
//!   sockets or touches key material
//!
//! ## Packet layout
//!
//! One packet travels inside one transport message - all numbers big-endian:
//!
//! ```ascii
//! 0:  send stream id (u32) - the id the recipient knows the stream by, 0 if unknown
//! 4:  receive stream id (u32) - the id replies should be addressed to
//! 8:  sequence number (u32) - 0 is reserved for un-numbered pure acks (unless SYN)
//! 12: ack-through (u32) - highest sequence seen in the other direction
//! 16: nack count (u8)
//! 17: nacks (u32 each) - sequence numbers known missing below ack-through
//! *:  resend delay (u8, seconds)
//! *:  flags (u16)
//! *:  option size (u16)
//! *:  option data gated by the flags, in flag-bit order:
//!       delay requested (u16 ms), sender identity (u16 length + bytes),
//!       max packet size (u16), signature (64 bytes)
//! *:  payload (up to 32 KiB), to the end of the message
//! ```
//!
//! The SYN / CLOSE / RESET packet classes are always signed; the signature covers the
//!  whole encoded packet with the signature field zeroed.
//!
//! ## Structure
//!
//! [`ConnectionManager`] owns the table of live [`Connection`]s for one local identity
//!  and demultiplexes inbound messages by stream id. Each connection owns its
//!  reassembly buffer (`MessageInputStream`), its write buffer
//!  (`MessageOutputStream`), and its retransmission/congestion state, all behind a
//!  single per-connection mutex. A per-phase scheduler (recomputed, never stored)
//!  decides each connection's next action: flush a deferred SYN, watch a connect
//!  timeout, linger after close, or free the connection.

mod config;
mod conn_throttler;
mod connection;
mod connection_manager;
mod connection_packet_handler;
mod error;
mod identity;
mod message_input_stream;
mod message_output_stream;
mod packet;
mod packet_queue;
mod scheduler;
mod tcb_share;
mod transport;

pub use config::{InactivityAction, StreamConfig, ThrottleLimits};
pub use connection::Connection;
pub use connection_manager::{ConnectionManager, StatsSnapshot};
pub use error::StreamError;
pub use identity::{Identity, Signature, Signer};
pub use packet::{Packet, PacketFlags, StreamId};
pub use scheduler::SchedulerPhase;
pub use transport::Transport;
