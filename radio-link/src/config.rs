//! Protocol timings and limits.
//!
//! The defaults fit a 2 Mbps transceiver with 32-byte packets. Peers must agree on
//! the windows: a responder's turnaround has to stay below the requester's
//! acknowledgement timeout, the sender's resend delay below the receiver's packet
//! timeout.
use std::time::Duration;

/// Number of transmissions of a reliable frame before giving up.
pub const MAX_RETRIES: usize = 30;

/// Number of packets a bulk transfer session can track.
pub const MAX_TRANSFER_PACKETS: usize = 32;

/// Parameters of the reliable single-packet delivery.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Transmissions of a reliable frame, first one included.
    pub max_retries: usize,
    /// Time waited for the acknowledgement of each transmission.
    pub ack_timeout: Duration,
    /// Delay before answering, covering the far end receive-to-transmit switch.
    pub turnaround: Duration,
    pub transfer: TransferParams,
    pub enumeration: EnumerationParams,
}

/// Parameters of the bulk transfer sessions.
#[derive(Debug, Clone)]
pub struct TransferParams {
    /// Packets a session can track, transfers above are refused. Never more than
    /// [SEQUENCE_SPACE](crate::bulk::SEQUENCE_SPACE), whatever the value here.
    pub max_packets: usize,
    /// Wait after DATA_START, letting the receiver prepare its session.
    pub settle_delay: Duration,
    /// Pacing between two streamed packets.
    pub packet_gap: Duration,
    /// Silence after which the receiver considers a burst finished.
    pub packet_timeout: Duration,
    /// Sender wait for each control reply (resend request or completion).
    pub control_timeout: Duration,
    /// Sender wait between acknowledging a resend request and resending.
    pub resend_delay: Duration,
}

/// Parameters of the enumeration protocol.
#[derive(Debug, Clone)]
pub struct EnumerationParams {
    /// Master `DEVICE_ID_GET` broadcasts per discovery round.
    pub repeat: usize,
    /// Master wait for a `DEVICE_ID_RESPONSE` after each broadcast.
    pub response_window: Duration,
    /// Copies of each unacknowledged `ENUMERATE_DEVICE`.
    pub unack_repeat: usize,
    /// Pause between two copies.
    pub unack_gap: Duration,
    /// Fixed part of the slave back-off, added to the identity nibble.
    pub backoff_offset: Duration,
    /// Slave wait for its `ENUMERATE_DEVICE` after each response.
    pub claim_window: Duration,
    /// Claim again identities already registered when they answer. A registered
    /// device only answers when every copy of its claim was lost.
    pub reclaim: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            ack_timeout: Duration::from_millis(20),
            turnaround: Duration::from_millis(1),
            transfer: TransferParams::default(),
            enumeration: EnumerationParams::default(),
        }
    }
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            max_packets: MAX_TRANSFER_PACKETS,
            settle_delay: Duration::from_millis(5),
            packet_gap: Duration::from_millis(1),
            packet_timeout: Duration::from_millis(20),
            control_timeout: Duration::from_millis(1000),
            resend_delay: Duration::from_millis(2),
        }
    }
}

impl Default for EnumerationParams {
    fn default() -> Self {
        Self {
            repeat: 5,
            response_window: Duration::from_millis(50),
            unack_repeat: 3,
            unack_gap: Duration::from_millis(2),
            backoff_offset: Duration::from_millis(2),
            claim_window: Duration::from_millis(30),
            reclaim: false,
        }
    }
}

impl LinkConfig {
    /// Worst case duration of a reliable send, transmission time excluded.
    pub fn reliable_budget(&self) -> Duration {
        self.ack_timeout * self.max_retries as u32
    }
}
