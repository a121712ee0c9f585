//! GVCP: GigE Vision control protocol encode/decode (transport-agnostic).

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of a GVCP command header (in bytes).
pub const CMD_HEADER_SIZE: usize = 8;
/// Size of a GVCP acknowledgement header (in bytes).
pub const ACK_HEADER_SIZE: usize = 8;

/// GVCP control port as defined by the GigE Vision specification.
pub const GVCP_PORT: u16 = 3956;

/// Key byte carried by every GVCP command packet.
pub const CMD_KEY: u8 = 0x42;

/// Largest payload of a single memory transfer.
///
/// A command must fit in a 576 byte datagram (the minimum IPv4 reassembly
/// size) after 28 bytes of IP/UDP overhead and the 8 byte GVCP header.
pub const DATA_SIZE_MAX: usize = 540;

/// Smallest GVSP packet size the stream path may be configured with.
pub const GVSP_PACKET_SIZE_MIN: u32 = 576;
/// Largest GVSP packet size the stream path may be configured with.
pub const GVSP_PACKET_SIZE_MAX: u32 = 9216;
/// IP + UDP header bytes preceding a GVSP payload on the wire.
pub const GVSP_UDP_OVERHEAD: u32 = 28;

/// Acknowledgement value of the out-of-band pending acknowledgement.
pub const PENDING_ACK: u16 = 0x0089;

bitflags! {
    /// Flags byte of a GVCP command header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        /// Request an acknowledgement for this command.
        const ACK_REQUIRED = 0x01;
    }
}

/// GVCP operations used by the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read a 32-bit register.
    ReadRegister,
    /// Write a 32-bit register.
    WriteRegister,
    /// Read a block of memory.
    ReadMemory,
    /// Write a block of memory.
    WriteMemory,
}

impl Command {
    /// Raw command value as defined by the GVCP specification.
    pub const fn command_code(self) -> u16 {
        match self {
            Command::ReadRegister => 0x0080,
            Command::WriteRegister => 0x0082,
            Command::ReadMemory => 0x0084,
            Command::WriteMemory => 0x0086,
        }
    }

    /// Raw acknowledgement value answering this command.
    pub const fn ack_code(self) -> u16 {
        self.command_code() + 1
    }

    /// Map a raw command value back to the operation.
    pub fn from_command(code: u16) -> Result<Self, GvcpError> {
        match code {
            0x0080 => Ok(Command::ReadRegister),
            0x0082 => Ok(Command::WriteRegister),
            0x0084 => Ok(Command::ReadMemory),
            0x0086 => Ok(Command::WriteMemory),
            _ => Err(GvcpError::UnknownCommand(code)),
        }
    }
}

/// Status codes returned in GVCP acknowledgement headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvcpStatus {
    /// Command completed successfully.
    Success,
    /// The command is not implemented by the device.
    NotImplemented,
    /// One of the command parameters was invalid.
    InvalidParameter,
    /// The requested address does not exist.
    InvalidAddress,
    /// The register is write protected.
    WriteProtect,
    /// The address is badly aligned for the requested access.
    BadAlignment,
    /// The requester does not hold the required privilege.
    AccessDenied,
    /// The device was busy processing a previous command.
    Busy,
    /// The requested stream packet is no longer available for resend.
    PacketUnavailable,
    /// The device ran out of internal bandwidth or memory.
    DataOverrun,
    /// The command header was malformed.
    InvalidHeader,
    /// The requested stream packet has not been produced yet.
    PacketNotYetAvailable,
    /// The requested packet and previous ones were dropped from resend memory.
    PacketAndPrevRemoved,
    /// The requested packet was dropped from resend memory.
    PacketRemoved,
    /// Generic device-side failure.
    GenericError,
    /// A status code not known to this implementation.
    Unknown(u16),
}

impl GvcpStatus {
    /// Convert from the raw status field of an acknowledgement header.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => GvcpStatus::Success,
            0x8001 => GvcpStatus::NotImplemented,
            0x8002 => GvcpStatus::InvalidParameter,
            0x8003 => GvcpStatus::InvalidAddress,
            0x8004 => GvcpStatus::WriteProtect,
            0x8005 => GvcpStatus::BadAlignment,
            0x8006 => GvcpStatus::AccessDenied,
            0x8007 => GvcpStatus::Busy,
            0x800c => GvcpStatus::PacketUnavailable,
            0x800d => GvcpStatus::DataOverrun,
            0x800e => GvcpStatus::InvalidHeader,
            0x8010 => GvcpStatus::PacketNotYetAvailable,
            0x8011 => GvcpStatus::PacketAndPrevRemoved,
            0x8012 => GvcpStatus::PacketRemoved,
            0x8fff => GvcpStatus::GenericError,
            other => GvcpStatus::Unknown(other),
        }
    }

    /// Convert to the raw value stored in the packet header.
    pub const fn to_raw(self) -> u16 {
        match self {
            GvcpStatus::Success => 0x0000,
            GvcpStatus::NotImplemented => 0x8001,
            GvcpStatus::InvalidParameter => 0x8002,
            GvcpStatus::InvalidAddress => 0x8003,
            GvcpStatus::WriteProtect => 0x8004,
            GvcpStatus::BadAlignment => 0x8005,
            GvcpStatus::AccessDenied => 0x8006,
            GvcpStatus::Busy => 0x8007,
            GvcpStatus::PacketUnavailable => 0x800c,
            GvcpStatus::DataOverrun => 0x800d,
            GvcpStatus::InvalidHeader => 0x800e,
            GvcpStatus::PacketNotYetAvailable => 0x8010,
            GvcpStatus::PacketAndPrevRemoved => 0x8011,
            GvcpStatus::PacketRemoved => 0x8012,
            GvcpStatus::GenericError => 0x8fff,
            GvcpStatus::Unknown(code) => code,
        }
    }

    /// Whether this status reports success.
    pub const fn is_success(self) -> bool {
        matches!(self, GvcpStatus::Success)
    }

    /// Protocol-defined description of the status.
    pub const fn description(self) -> &'static str {
        match self {
            GvcpStatus::Success => "success",
            GvcpStatus::NotImplemented => "command not implemented",
            GvcpStatus::InvalidParameter => "invalid parameter",
            GvcpStatus::InvalidAddress => "invalid address",
            GvcpStatus::WriteProtect => "write protected register",
            GvcpStatus::BadAlignment => "bad address alignment",
            GvcpStatus::AccessDenied => "access denied",
            GvcpStatus::Busy => "device busy",
            GvcpStatus::PacketUnavailable => "packet unavailable for resend",
            GvcpStatus::DataOverrun => "data overrun",
            GvcpStatus::InvalidHeader => "invalid header",
            GvcpStatus::PacketNotYetAvailable => "packet not yet available",
            GvcpStatus::PacketAndPrevRemoved => {
                "packet and previous packets removed from resend memory"
            }
            GvcpStatus::PacketRemoved => "packet removed from resend memory",
            GvcpStatus::GenericError => "generic error",
            GvcpStatus::Unknown(_) => "unknown status",
        }
    }
}

impl std::fmt::Display for GvcpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#06x})", self.description(), self.to_raw())
    }
}

/// Errors that can occur when dealing with GVCP packets.
#[derive(Debug, Error)]
pub enum GvcpError {
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("unknown command: {0:#06x}")]
    UnknownCommand(u16),
    #[error("payload of {0} bytes exceeds the maximum transfer size")]
    PayloadTooLarge(usize),
}

/// Return the packet identifier following `previous`.
///
/// Identifiers are 16-bit and never zero; the sequence wraps to 1.
pub const fn next_packet_id(previous: u16) -> u16 {
    let id = previous.wrapping_add(1);
    if id == 0 {
        1
    } else {
        id
    }
}

fn encode_cmd(command: Command, packet_id: u16, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(CMD_HEADER_SIZE + payload.len());
    buf.put_u8(CMD_KEY);
    buf.put_u8(CommandFlags::ACK_REQUIRED.bits());
    buf.put_u16(command.command_code());
    buf.put_u16(payload.len() as u16);
    buf.put_u16(packet_id);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Build a read-register command for a single address.
pub fn read_register_cmd(packet_id: u16, address: u32) -> Bytes {
    encode_cmd(Command::ReadRegister, packet_id, &address.to_be_bytes())
}

/// Build a write-register command for a single address/value pair.
pub fn write_register_cmd(packet_id: u16, address: u32, value: u32) -> Bytes {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&address.to_be_bytes());
    payload[4..].copy_from_slice(&value.to_be_bytes());
    encode_cmd(Command::WriteRegister, packet_id, &payload)
}

/// Build a read-memory command.
pub fn read_memory_cmd(packet_id: u16, address: u32, size: u16) -> Result<Bytes, GvcpError> {
    if size as usize > DATA_SIZE_MAX {
        return Err(GvcpError::PayloadTooLarge(size as usize));
    }
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&address.to_be_bytes());
    payload[6..].copy_from_slice(&size.to_be_bytes());
    Ok(encode_cmd(Command::ReadMemory, packet_id, &payload))
}

/// Build a write-memory command.
pub fn write_memory_cmd(packet_id: u16, address: u32, data: &[u8]) -> Result<Bytes, GvcpError> {
    if data.len() > DATA_SIZE_MAX {
        return Err(GvcpError::PayloadTooLarge(data.len()));
    }
    let mut payload = BytesMut::with_capacity(4 + data.len());
    payload.put_u32(address);
    payload.extend_from_slice(data);
    Ok(encode_cmd(Command::WriteMemory, packet_id, &payload))
}

fn encode_ack(status: GvcpStatus, ack_command: u16, packet_id: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ACK_HEADER_SIZE + payload.len());
    buf.put_u16(status.to_raw());
    buf.put_u16(ack_command);
    buf.put_u16(payload.len() as u16);
    buf.put_u16(packet_id);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Build a read-register acknowledgement carrying a single value.
pub fn read_register_ack(packet_id: u16, value: u32) -> Bytes {
    encode_ack(
        GvcpStatus::Success,
        Command::ReadRegister.ack_code(),
        packet_id,
        &value.to_be_bytes(),
    )
}

/// Build a write-register acknowledgement.
pub fn write_register_ack(packet_id: u16) -> Bytes {
    // Reserved word followed by the index of the last written entry.
    let payload = [0u8, 0, 0, 1];
    encode_ack(
        GvcpStatus::Success,
        Command::WriteRegister.ack_code(),
        packet_id,
        &payload,
    )
}

/// Build a read-memory acknowledgement echoing the address.
pub fn read_memory_ack(packet_id: u16, address: u32, data: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(4 + data.len());
    payload.put_u32(address);
    payload.extend_from_slice(data);
    encode_ack(
        GvcpStatus::Success,
        Command::ReadMemory.ack_code(),
        packet_id,
        &payload,
    )
}

/// Build a write-memory acknowledgement reporting the written byte count.
pub fn write_memory_ack(packet_id: u16, written: u16) -> Bytes {
    let mut payload = [0u8; 4];
    payload[2..].copy_from_slice(&written.to_be_bytes());
    encode_ack(
        GvcpStatus::Success,
        Command::WriteMemory.ack_code(),
        packet_id,
        &payload,
    )
}

/// Build an error acknowledgement answering `command`.
pub fn error_ack(status: GvcpStatus, command: Command, packet_id: u16) -> Bytes {
    encode_ack(status, command.ack_code(), packet_id, &[])
}

/// Build a pending acknowledgement extending the caller's deadline.
pub fn pending_ack(packet_id: u16, timeout_ms: u16) -> Bytes {
    let mut payload = [0u8; 4];
    payload[2..].copy_from_slice(&timeout_ms.to_be_bytes());
    encode_ack(GvcpStatus::Success, PENDING_ACK, packet_id, &payload)
}

/// Classification of a received acknowledgement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Successful acknowledgement.
    Ack,
    /// Intermediate frame asking for more time.
    Pending,
    /// The device reported a recognized error status.
    Error(GvcpStatus),
    /// The device reported a status this implementation does not know.
    UnknownError(u16),
}

/// Borrowed view of a received acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack<'a> {
    /// Raw status field.
    pub status: GvcpStatus,
    /// Raw acknowledgement command value.
    pub command: u16,
    /// Payload length announced by the header.
    pub length: u16,
    /// Identifier of the answered request.
    pub packet_id: u16,
    /// Payload bytes following the header.
    pub payload: &'a [u8],
}

impl<'a> Ack<'a> {
    /// Parse an acknowledgement from a received datagram.
    pub fn parse(buf: &'a [u8]) -> Result<Self, GvcpError> {
        if buf.len() < ACK_HEADER_SIZE {
            return Err(GvcpError::InvalidPacket("ack too short"));
        }
        let mut cursor = buf;
        let status = GvcpStatus::from_raw(cursor.get_u16());
        let command = cursor.get_u16();
        let length = cursor.get_u16();
        let packet_id = cursor.get_u16();
        if buf.len() < ACK_HEADER_SIZE + length as usize {
            return Err(GvcpError::InvalidPacket("ack payload truncated"));
        }
        let payload = &buf[ACK_HEADER_SIZE..ACK_HEADER_SIZE + length as usize];
        Ok(Self {
            status,
            command,
            length,
            packet_id,
            payload,
        })
    }

    /// Classify the frame for the control channel state machine.
    pub fn kind(&self) -> AckKind {
        if self.command == PENDING_ACK {
            return AckKind::Pending;
        }
        match self.status {
            GvcpStatus::Success => AckKind::Ack,
            GvcpStatus::Unknown(code) => AckKind::UnknownError(code),
            status => AckKind::Error(status),
        }
    }

    /// Deadline extension of a pending acknowledgement, in milliseconds.
    pub fn pending_timeout_ms(&self) -> Result<u16, GvcpError> {
        if self.command != PENDING_ACK {
            return Err(GvcpError::InvalidPacket("not a pending ack"));
        }
        if self.payload.len() < 4 {
            return Err(GvcpError::InvalidPacket("pending ack payload too short"));
        }
        let mut cursor = self.payload;
        let _reserved = cursor.get_u16();
        Ok(cursor.get_u16())
    }

    /// Value carried by a read-register acknowledgement.
    pub fn register_value(&self) -> Result<u32, GvcpError> {
        if self.payload.len() < 4 {
            return Err(GvcpError::InvalidPacket("register ack payload too short"));
        }
        let mut cursor = self.payload;
        Ok(cursor.get_u32())
    }

    /// Data bytes of a read-memory acknowledgement, after the address echo.
    pub fn memory_data(&self) -> Result<&'a [u8], GvcpError> {
        if self.payload.len() < 4 {
            return Err(GvcpError::InvalidPacket("memory ack payload too short"));
        }
        Ok(&self.payload[4..])
    }
}

/// Borrowed view of a received command, used by device-side code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cmd<'a> {
    /// Decoded operation.
    pub command: Command,
    /// Payload length announced by the header.
    pub length: u16,
    /// Identifier chosen by the requester.
    pub packet_id: u16,
    /// Payload bytes following the header.
    pub payload: &'a [u8],
}

impl<'a> Cmd<'a> {
    /// Parse a command from a received datagram.
    pub fn parse(buf: &'a [u8]) -> Result<Self, GvcpError> {
        if buf.len() < CMD_HEADER_SIZE {
            return Err(GvcpError::InvalidPacket("command too short"));
        }
        let mut cursor = buf;
        let key = cursor.get_u8();
        let _flags = cursor.get_u8();
        if key != CMD_KEY {
            return Err(GvcpError::InvalidPacket("bad command key"));
        }
        let command = Command::from_command(cursor.get_u16())?;
        let length = cursor.get_u16();
        let packet_id = cursor.get_u16();
        if buf.len() < CMD_HEADER_SIZE + length as usize {
            return Err(GvcpError::InvalidPacket("command payload truncated"));
        }
        let payload = &buf[CMD_HEADER_SIZE..CMD_HEADER_SIZE + length as usize];
        Ok(Self {
            command,
            length,
            packet_id,
            payload,
        })
    }

    /// Address and size of a read-memory command.
    pub fn read_memory_args(&self) -> Result<(u32, u16), GvcpError> {
        if self.payload.len() < 8 {
            return Err(GvcpError::InvalidPacket("read-memory payload too short"));
        }
        let mut cursor = self.payload;
        let address = cursor.get_u32();
        let _reserved = cursor.get_u16();
        let size = cursor.get_u16();
        Ok((address, size))
    }

    /// Address and data of a write-memory command.
    pub fn write_memory_args(&self) -> Result<(u32, &'a [u8]), GvcpError> {
        if self.payload.len() < 4 {
            return Err(GvcpError::InvalidPacket("write-memory payload too short"));
        }
        let mut cursor = self.payload;
        let address = cursor.get_u32();
        Ok((address, &self.payload[4..]))
    }

    /// Address of a read-register command.
    pub fn read_register_args(&self) -> Result<u32, GvcpError> {
        if self.payload.len() < 4 {
            return Err(GvcpError::InvalidPacket("read-register payload too short"));
        }
        let mut cursor = self.payload;
        Ok(cursor.get_u32())
    }

    /// Address and value of a write-register command.
    pub fn write_register_args(&self) -> Result<(u32, u32), GvcpError> {
        if self.payload.len() < 8 {
            return Err(GvcpError::InvalidPacket("write-register payload too short"));
        }
        let mut cursor = self.payload;
        Ok((cursor.get_u32(), cursor.get_u32()))
    }
}
