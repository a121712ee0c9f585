//! Session configuration options.

use std::time::Duration;

use bitflags::bitflags;

/// When the stream packet size should be renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketSizeAdjustment {
    /// Keep whatever the device is configured with.
    Never,
    /// Probe once, before the first stream is created.
    Once,
    /// Probe before every stream creation.
    Always,
    /// Probe before every stream creation, but keep the current size if it
    /// already traverses the path.
    OnFailure,
    /// Probe before the first stream creation, keeping a working current size.
    #[default]
    OnFailureOnce,
}

bitflags! {
    /// Option bits handed through to the external streaming receiver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamOptions: u32 {
        /// Ask the receiver not to use a packet socket.
        const PACKET_SOCKET_DISABLED = 1 << 0;
    }
}

/// Tunables of a control session.
///
/// The defaults match the protocol recommendations; most applications only
/// ever touch [`packet_size_adjustment`](Self::packet_size_adjustment).
#[derive(Debug, Clone)]
pub struct GevConfig {
    /// Number of transmit attempts per exchange.
    pub n_retries: u32,
    /// Deadline of a single attempt, before pending-ack extensions.
    pub timeout: Duration,
    /// Interval between control-privilege heartbeat reads.
    pub heartbeat_period: Duration,
    /// Device-side lease expiry written to the heartbeat-timeout register
    /// when taking control. `None` keeps the device default.
    pub heartbeat_timeout: Option<Duration>,
    /// Scratch receive buffer size; grown to fit the largest defined ack.
    pub buffer_size: usize,
    /// Stream packet-size renegotiation policy.
    pub packet_size_adjustment: PacketSizeAdjustment,
    /// Option bits for the external streaming receiver.
    pub stream_options: StreamOptions,
    /// UDP port the device listens on for control traffic. The protocol fixes
    /// this to 3956; device simulators bind elsewhere.
    pub control_port: u16,
}

impl Default for GevConfig {
    fn default() -> Self {
        Self {
            n_retries: 6,
            timeout: Duration::from_millis(500),
            heartbeat_period: Duration::from_secs(1),
            heartbeat_timeout: None,
            buffer_size: 1024,
            packet_size_adjustment: PacketSizeAdjustment::default(),
            stream_options: StreamOptions::empty(),
            control_port: gvcp::GVCP_PORT,
        }
    }
}
