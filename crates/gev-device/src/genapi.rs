//! Seams towards the external GenICam evaluator.
//!
//! The control core never evaluates a feature tree itself. It hands the
//! fetched XML to a [`SchemaLoader`] supplied by the application and talks to
//! the resulting [`Genapi`] by feature name. The evaluator in turn reaches the
//! device through the [`MemoryIo`] handle it was constructed with.

use std::sync::Arc;

use async_trait::async_trait;

use crate::registers::{bootstrap, stream};
use crate::GevError;

/// Register access for the schema evaluator, backed by the session's
/// serialized exchange path.
#[async_trait]
pub trait MemoryIo: Send + Sync {
    /// Read an arbitrary-length memory range.
    async fn read_memory(&self, address: u32, out: &mut [u8]) -> Result<(), GevError>;
    /// Write an arbitrary-length memory range.
    async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), GevError>;
    /// Read a single 32-bit register.
    async fn read_register(&self, address: u32) -> Result<u32, GevError>;
    /// Write a single 32-bit register.
    async fn write_register(&self, address: u32, value: u32) -> Result<(), GevError>;
}

/// Integer feature range as reported by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerBounds {
    pub min: i64,
    pub max: i64,
    /// Step between representable values; at least 1.
    pub inc: i64,
}

/// Typed, by-name access to the device feature tree.
#[async_trait]
pub trait Genapi: Send + Sync {
    /// Whether the schema defines a node with this name.
    fn is_defined(&self, name: &str) -> bool;

    /// Whether the node executes as a command (as opposed to toggling a
    /// boolean). Names without a node return false.
    fn is_command(&self, name: &str) -> bool;

    /// Register a fallback node definition. Called only for names
    /// [`is_defined`](Self::is_defined) answered false for.
    fn define_default(&self, node: NodeDefault);

    async fn integer(&self, name: &str) -> Result<i64, GevError>;
    async fn set_integer(&self, name: &str, value: i64) -> Result<(), GevError>;
    async fn integer_bounds(&self, name: &str) -> Result<IntegerBounds, GevError>;
    async fn boolean(&self, name: &str) -> Result<bool, GevError>;
    async fn set_boolean(&self, name: &str, value: bool) -> Result<(), GevError>;
    async fn execute(&self, name: &str) -> Result<(), GevError>;
}

/// Constructor of the external schema evaluator.
pub trait SchemaLoader: Send + Sync {
    /// Build an evaluator from the fetched GenICam XML. The evaluator must
    /// route register traffic through `io`.
    fn load(&self, xml: &[u8], io: Arc<dyn MemoryIo>) -> Result<Arc<dyn Genapi>, GevError>;
}

/// Access mode of a default node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Register backing of a default node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Full 32-bit register.
    Integer { address: u32 },
    /// Bit range of a 32-bit register, LSB-relative and inclusive.
    MaskedInteger { address: u32, lsb: u8, msb: u8 },
    /// Single bit of a 32-bit register.
    Boolean { address: u32, bit: u8 },
    /// 64-bit value split over two consecutive registers.
    IntegerPair { high: u32, low: u32 },
}

/// Fallback node definition injected when the device schema is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDefault {
    pub name: &'static str,
    pub access: Access,
    pub kind: NodeKind,
}

/// Feature names the control core relies on.
pub mod features {
    pub const CURRENT_IP_CONFIGURATION_LLA: &str = "GevCurrentIPConfigurationLLA";
    pub const CURRENT_IP_CONFIGURATION_DHCP: &str = "GevCurrentIPConfigurationDHCP";
    pub const CURRENT_IP_CONFIGURATION_PERSISTENT_IP: &str =
        "GevCurrentIPConfigurationPersistentIP";
    pub const CURRENT_IP_ADDRESS: &str = "GevCurrentIPAddress";
    pub const CURRENT_SUBNET_MASK: &str = "GevCurrentSubnetMask";
    pub const CURRENT_DEFAULT_GATEWAY: &str = "GevCurrentDefaultGateway";
    pub const PERSISTENT_IP_ADDRESS: &str = "GevPersistentIPAddress";
    pub const PERSISTENT_SUBNET_MASK: &str = "GevPersistentSubnetMask";
    pub const PERSISTENT_DEFAULT_GATEWAY: &str = "GevPersistentDefaultGateway";
    pub const STREAM_CHANNEL_COUNT: &str = "GevStreamChannelCount";
    pub const TIMESTAMP_TICK_FREQUENCY: &str = "GevTimestampTickFrequency";
    pub const HEARTBEAT_TIMEOUT: &str = "GevHeartbeatTimeout";
    pub const SCP_HOST_PORT: &str = "GevSCPHostPort";
    pub const SCPS_PACKET_SIZE: &str = "GevSCPSPacketSize";
    pub const SCPS_FIRE_TEST_PACKET: &str = "GevSCPSFireTestPacket";
    pub const SCPS_DO_NOT_FRAGMENT: &str = "GevSCPSDoNotFragment";
    pub const SCPD: &str = "GevSCPD";
    pub const SCDA: &str = "GevSCDA";
}

/// Fallback definitions for the well-known feature catalog.
///
/// Covers the first stream channel; devices exposing more channels describe
/// them in their own schema.
pub fn default_nodes() -> Vec<NodeDefault> {
    use features as f;
    use Access::{ReadOnly, ReadWrite};

    let sc = stream::base_address(0);
    vec![
        NodeDefault {
            name: f::CURRENT_IP_CONFIGURATION_LLA,
            access: ReadWrite,
            kind: NodeKind::Boolean {
                address: bootstrap::CURRENT_IP_CONFIGURATION,
                bit: 2,
            },
        },
        NodeDefault {
            name: f::CURRENT_IP_CONFIGURATION_DHCP,
            access: ReadWrite,
            kind: NodeKind::Boolean {
                address: bootstrap::CURRENT_IP_CONFIGURATION,
                bit: 1,
            },
        },
        NodeDefault {
            name: f::CURRENT_IP_CONFIGURATION_PERSISTENT_IP,
            access: ReadWrite,
            kind: NodeKind::Boolean {
                address: bootstrap::CURRENT_IP_CONFIGURATION,
                bit: 0,
            },
        },
        NodeDefault {
            name: f::CURRENT_IP_ADDRESS,
            access: ReadOnly,
            kind: NodeKind::Integer {
                address: bootstrap::CURRENT_IP_ADDRESS,
            },
        },
        NodeDefault {
            name: f::CURRENT_SUBNET_MASK,
            access: ReadOnly,
            kind: NodeKind::Integer {
                address: bootstrap::CURRENT_SUBNET_MASK,
            },
        },
        NodeDefault {
            name: f::CURRENT_DEFAULT_GATEWAY,
            access: ReadOnly,
            kind: NodeKind::Integer {
                address: bootstrap::CURRENT_DEFAULT_GATEWAY,
            },
        },
        NodeDefault {
            name: f::PERSISTENT_IP_ADDRESS,
            access: ReadWrite,
            kind: NodeKind::Integer {
                address: bootstrap::PERSISTENT_IP_ADDRESS,
            },
        },
        NodeDefault {
            name: f::PERSISTENT_SUBNET_MASK,
            access: ReadWrite,
            kind: NodeKind::Integer {
                address: bootstrap::PERSISTENT_SUBNET_MASK,
            },
        },
        NodeDefault {
            name: f::PERSISTENT_DEFAULT_GATEWAY,
            access: ReadWrite,
            kind: NodeKind::Integer {
                address: bootstrap::PERSISTENT_DEFAULT_GATEWAY,
            },
        },
        NodeDefault {
            name: f::STREAM_CHANNEL_COUNT,
            access: ReadOnly,
            kind: NodeKind::Integer {
                address: bootstrap::N_STREAM_CHANNELS,
            },
        },
        NodeDefault {
            name: f::TIMESTAMP_TICK_FREQUENCY,
            access: ReadOnly,
            kind: NodeKind::IntegerPair {
                high: bootstrap::TIMESTAMP_TICK_FREQUENCY_HIGH,
                low: bootstrap::TIMESTAMP_TICK_FREQUENCY_LOW,
            },
        },
        NodeDefault {
            name: f::HEARTBEAT_TIMEOUT,
            access: ReadWrite,
            kind: NodeKind::Integer {
                address: bootstrap::HEARTBEAT_TIMEOUT,
            },
        },
        NodeDefault {
            name: f::SCP_HOST_PORT,
            access: ReadWrite,
            kind: NodeKind::MaskedInteger {
                address: sc + stream::CHANNEL_PORT,
                lsb: 0,
                msb: 15,
            },
        },
        NodeDefault {
            name: f::SCPS_PACKET_SIZE,
            access: ReadWrite,
            kind: NodeKind::MaskedInteger {
                address: sc + stream::PACKET_SIZE,
                lsb: 0,
                msb: 15,
            },
        },
        NodeDefault {
            name: f::SCPS_FIRE_TEST_PACKET,
            access: ReadWrite,
            kind: NodeKind::Boolean {
                address: sc + stream::PACKET_SIZE,
                bit: 31,
            },
        },
        NodeDefault {
            name: f::SCPS_DO_NOT_FRAGMENT,
            access: ReadWrite,
            kind: NodeKind::Boolean {
                address: sc + stream::PACKET_SIZE,
                bit: 30,
            },
        },
        NodeDefault {
            name: f::SCPD,
            access: ReadWrite,
            kind: NodeKind::Integer {
                address: sc + stream::PACKET_DELAY,
            },
        },
        NodeDefault {
            name: f::SCDA,
            access: ReadWrite,
            kind: NodeKind::Integer {
                address: sc + stream::DESTINATION_ADDRESS,
            },
        },
    ]
}
