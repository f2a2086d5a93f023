use std::time::Duration;

/// Default number of payload bytes requested ahead of transmission.
pub const DEFAULT_LOOKAHEAD: usize = 4;

/// Upper bound on the lookahead window.
pub const MAX_LOOKAHEAD: usize = 64;

/// Default number of acknowledgments that can wait for the line.
pub const DEFAULT_ACK_QUEUE_DEPTH: usize = 4;

/// Default time to wait for an ACK before retransmitting.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of retransmissions before a send fails.
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Which kind of data frame this side sends.
///
/// Only one direction of a link is acknowledged: the host sends
/// `Acknowledged` frames to the device, the device answers with best-effort
/// frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutboundMode {
    /// Send `DATA` frames; completion means the closing delimiter left.
    #[default]
    BestEffort,
    /// Send `DATA_ACKED` frames; completion waits for the peer's ACK and
    /// retransmits on timeout or NACK.
    Acknowledged,
}

/// Configuration for the protocol engine.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Payload bytes pulled from the upper layer ahead of transmission.
    /// Clamped to `1..=MAX_LOOKAHEAD`. Default: 4.
    pub lookahead: usize,
    /// Capacity of the pending ACK/NACK queue. Default: 4.
    pub ack_queue_depth: usize,
    /// Time to wait for an ACK after the closing delimiter. Default: 250 ms.
    pub ack_timeout: Duration,
    /// Retransmissions after the first attempt. Default: 3.
    pub max_retries: u8,
    /// Sequence number of the first data frame. Default: 0.
    pub initial_sequence: u8,
    /// Outbound data frame kind. Default: best effort.
    pub outbound: OutboundMode,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            lookahead: DEFAULT_LOOKAHEAD,
            ack_queue_depth: DEFAULT_ACK_QUEUE_DEPTH,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_sequence: 0,
            outbound: OutboundMode::BestEffort,
        }
    }
}

impl ProtocolConfig {
    /// Host-side defaults: acknowledged outbound frames.
    pub fn host() -> Self {
        Self {
            outbound: OutboundMode::Acknowledged,
            ..Self::default()
        }
    }

    /// Device-side defaults: best-effort outbound frames.
    pub fn device() -> Self {
        Self::default()
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.lookahead = self.lookahead.clamp(1, MAX_LOOKAHEAD);
        self.ack_queue_depth = self.ack_queue_depth.max(1);
        self
    }
}
