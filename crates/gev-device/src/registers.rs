//! Well-known device register offsets and bitfields.
//!
//! Addresses follow the GigE Vision bootstrap register map; everything the
//! control core touches directly lives here so the facade and the default
//! node catalog agree on a single source.

use bitflags::bitflags;

/// Bootstrap register block.
pub mod bootstrap {
    /// Protocol version (major << 16 | minor).
    pub const VERSION: u32 = 0x0000;
    /// Device mode word; see [`DeviceMode`](super::DeviceMode).
    pub const DEVICE_MODE: u32 = 0x0004;
    /// Supported IP configuration schemes.
    pub const SUPPORTED_IP_CONFIGURATION: u32 = 0x0010;
    /// Currently active IP configuration schemes.
    pub const CURRENT_IP_CONFIGURATION: u32 = 0x0014;
    /// Current IP address of the first interface.
    pub const CURRENT_IP_ADDRESS: u32 = 0x0024;
    /// Current subnet mask of the first interface.
    pub const CURRENT_SUBNET_MASK: u32 = 0x0034;
    /// Current default gateway of the first interface.
    pub const CURRENT_DEFAULT_GATEWAY: u32 = 0x0044;
    /// Manufacturer name string.
    pub const MANUFACTURER_NAME: (u32, usize) = (0x0048, 32);
    /// Model name string.
    pub const MODEL_NAME: (u32, usize) = (0x0068, 32);
    /// Device version string.
    pub const DEVICE_VERSION: (u32, usize) = (0x0088, 32);
    /// Serial number string.
    pub const SERIAL_NUMBER: (u32, usize) = (0x00d8, 16);
    /// First GenICam XML URL slot.
    pub const XML_URL_0: u32 = 0x0200;
    /// Second GenICam XML URL slot.
    pub const XML_URL_1: u32 = 0x0400;
    /// Size of each XML URL slot, NUL terminator included.
    pub const XML_URL_SIZE: usize = 512;
    /// Persistent IP address of the first interface.
    pub const PERSISTENT_IP_ADDRESS: u32 = 0x064c;
    /// Persistent subnet mask of the first interface.
    pub const PERSISTENT_SUBNET_MASK: u32 = 0x065c;
    /// Persistent default gateway of the first interface.
    pub const PERSISTENT_DEFAULT_GATEWAY: u32 = 0x066c;
    /// Number of stream channels.
    pub const N_STREAM_CHANNELS: u32 = 0x0904;
    /// GVCP capability word; see [`GvcpCapability`](super::GvcpCapability).
    pub const GVCP_CAPABILITY: u32 = 0x0934;
    /// Device-side control lease expiry, in milliseconds.
    pub const HEARTBEAT_TIMEOUT: u32 = 0x0938;
    /// Timestamp tick frequency, upper 32 bits.
    pub const TIMESTAMP_TICK_FREQUENCY_HIGH: u32 = 0x093c;
    /// Timestamp tick frequency, lower 32 bits.
    pub const TIMESTAMP_TICK_FREQUENCY_LOW: u32 = 0x0940;
    /// Control channel privilege; see [`ControlPrivilege`](super::ControlPrivilege).
    pub const CONTROL_CHANNEL_PRIVILEGE: u32 = 0x0a00;
}

/// Per-channel stream register block.
pub mod stream {
    /// Host UDP port, lower 16 bits.
    pub const CHANNEL_PORT: u32 = 0x00;
    /// Packet size register: size in bits 0-15, do-not-fragment in bit 30,
    /// fire-test-packet in bit 31.
    pub const PACKET_SIZE: u32 = 0x04;
    /// Inter-packet delay in timestamp ticks.
    pub const PACKET_DELAY: u32 = 0x08;
    /// Stream destination IPv4 address.
    pub const DESTINATION_ADDRESS: u32 = 0x18;

    /// Base address of the register block for `channel`.
    pub const fn base_address(channel: u32) -> u32 {
        0x0d00 + 0x40 * channel
    }
}

bitflags! {
    /// Control channel privilege register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlPrivilege: u32 {
        /// Exclusive access: no other application may even read.
        const EXCLUSIVE = 1 << 0;
        /// Control access: configuration writes allowed, reads open.
        const CONTROL = 1 << 1;
    }
}

bitflags! {
    /// GVCP capability register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GvcpCapability: u32 {
        /// Multiple operations per command packet.
        const CONCATENATION = 1 << 0;
        /// WRITE_MEMORY command implemented.
        const WRITE_MEM = 1 << 1;
        /// Stream packet resend implemented.
        const PACKET_RESEND = 1 << 2;
        /// Event channel implemented.
        const EVENT = 1 << 3;
        /// Event-data channel implemented.
        const EVENT_DATA = 1 << 4;
        /// Pending acknowledgements implemented.
        const PENDING_ACK = 1 << 5;
        /// Action commands implemented.
        const ACTION = 1 << 6;
        /// Control switchover implemented.
        const SWITCHOVER = 1 << 21;
        /// Manifest table present.
        const MANIFEST_TABLE = 1 << 26;
        /// Heartbeat can be disabled.
        const HEARTBEAT_DISABLE = 1 << 29;
        /// Serial number register implemented.
        const SERIAL_NUMBER = 1 << 30;
        /// User-defined name register implemented.
        const USER_DEFINED_NAME = 1 << 31;
    }
}

bitflags! {
    /// IP configuration scheme bits shared by the supported/current registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpConfiguration: u32 {
        /// Persistent (static) IP.
        const PERSISTENT_IP = 1 << 0;
        /// DHCP.
        const DHCP = 1 << 1;
        /// Link-local addressing.
        const LLA = 1 << 2;
    }
}

/// Decoded device mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode(u32);

impl DeviceMode {
    /// Wrap a raw register value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw register value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Whether the device declares big-endian register data.
    pub const fn is_big_endian(self) -> bool {
        self.0 & (1 << 31) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_bits() {
        assert_eq!(ControlPrivilege::CONTROL.bits(), 0x2);
        assert_eq!(ControlPrivilege::EXCLUSIVE.bits(), 0x1);
    }

    #[test]
    fn device_mode_endianness() {
        assert!(DeviceMode::from_raw(0x8000_0000).is_big_endian());
        assert!(!DeviceMode::from_raw(0x7fff_ffff).is_big_endian());
    }

    #[test]
    fn stream_channel_blocks_are_64_bytes_apart() {
        assert_eq!(stream::base_address(0), 0x0d00);
        assert_eq!(stream::base_address(3), 0x0dc0);
    }
}
