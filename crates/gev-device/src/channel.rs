//! Serialized GVCP request/acknowledge exchange.
//!
//! One lock-guarded exchange path per session: the application tasks and the
//! heartbeat all funnel through [`Channel`], so at most one request occupies
//! the socket at a time. The retry loop owns the lock for its whole duration,
//! which keeps pending-ack deadline extensions per-request.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use gvcp::{Ack, AckKind, Command};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::GevConfig;
use crate::genapi::MemoryIo;
use crate::GevError;

/// First value of the packet identifier sequence.
///
/// Starting near the top of the 16-bit range exercises the wraparound (which
/// skips zero) early in every session.
pub const INITIAL_PACKET_ID: u16 = 65300;

/// Smallest scratch buffer able to hold the largest defined ack.
const MIN_BUFFER_SIZE: usize = gvcp::ACK_HEADER_SIZE + 4 + gvcp::DATA_SIZE_MAX;

struct Inner {
    socket: UdpSocket,
    buffer: Vec<u8>,
    last_id: u16,
    n_retries: u32,
    timeout: Duration,
}

/// GVCP control channel towards a single device.
pub struct Channel {
    peer: SocketAddr,
    inner: Mutex<Inner>,
}

impl Channel {
    /// Bind a control socket on `interface` and connect it to the device.
    pub async fn connect(
        interface: Ipv4Addr,
        device: Ipv4Addr,
        config: &GevConfig,
    ) -> Result<Self, GevError> {
        let socket = UdpSocket::bind(SocketAddr::from((interface, 0))).await?;
        let peer = SocketAddr::from((device, config.control_port));
        socket.connect(peer).await?;
        debug!(local = %socket.local_addr()?, %peer, "control channel bound");
        Ok(Self {
            peer,
            inner: Mutex::new(Inner {
                socket,
                buffer: vec![0; config.buffer_size.max(MIN_BUFFER_SIZE)],
                last_id: INITIAL_PACKET_ID,
                n_retries: config.n_retries.max(1),
                timeout: config.timeout,
            }),
        })
    }

    /// Device control endpoint this channel is connected to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Read a single 32-bit register.
    pub async fn read_register(&self, address: u32) -> Result<u32, GevError> {
        let mut inner = self.inner.lock().await;
        let payload = inner
            .exchange(
                Command::ReadRegister,
                |id| gvcp::read_register_cmd(id, address),
                4,
            )
            .await?;
        let mut cursor = payload.as_slice();
        Ok(cursor.get_u32())
    }

    /// Write a single 32-bit register.
    pub async fn write_register(&self, address: u32, value: u32) -> Result<(), GevError> {
        let mut inner = self.inner.lock().await;
        inner
            .exchange(
                Command::WriteRegister,
                |id| gvcp::write_register_cmd(id, address, value),
                0,
            )
            .await?;
        Ok(())
    }

    /// Read an arbitrary-length memory range.
    ///
    /// The range is split into protocol-sized transfers issued sequentially;
    /// on any failure the whole output buffer is zero-filled.
    pub async fn read_memory(&self, address: u32, out: &mut [u8]) -> Result<(), GevError> {
        let result = self.read_memory_chunks(address, out).await;
        if result.is_err() {
            out.fill(0);
        }
        result
    }

    async fn read_memory_chunks(&self, address: u32, out: &mut [u8]) -> Result<(), GevError> {
        end_address(address, out.len())?;
        let mut offset = 0usize;
        while offset < out.len() {
            let chunk = (out.len() - offset).min(gvcp::DATA_SIZE_MAX);
            let chunk_address = address + offset as u32;
            let mut inner = self.inner.lock().await;
            let payload = inner
                .exchange(
                    Command::ReadMemory,
                    |id| {
                        gvcp::read_memory_cmd(id, chunk_address, chunk as u16)
                            .expect("chunk bounded by DATA_SIZE_MAX")
                    },
                    4 + chunk,
                )
                .await?;
            drop(inner);
            out[offset..offset + chunk].copy_from_slice(&payload[4..4 + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    /// Write an arbitrary-length memory range.
    ///
    /// The protocol has no rollback: on failure the device-side range is
    /// indeterminate up to the failing transfer.
    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), GevError> {
        end_address(address, data.len())?;
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(gvcp::DATA_SIZE_MAX);
            let chunk_address = address + offset as u32;
            let chunk_data = &data[offset..offset + chunk];
            let mut inner = self.inner.lock().await;
            inner
                .exchange(
                    Command::WriteMemory,
                    |id| {
                        gvcp::write_memory_cmd(id, chunk_address, chunk_data)
                            .expect("chunk bounded by DATA_SIZE_MAX")
                    },
                    0,
                )
                .await?;
            offset += chunk;
        }
        Ok(())
    }
}

fn end_address(address: u32, len: usize) -> Result<(), GevError> {
    u32::try_from(len)
        .ok()
        .and_then(|len| address.checked_add(len))
        .map(|_| ())
        .ok_or_else(|| GevError::invalid("memory range exceeds the 32-bit address space"))
}

impl Inner {
    /// Run one request/acknowledge exchange with retries.
    ///
    /// Each transmit attempt carries a fresh identifier; a pending ack only
    /// extends the current attempt's deadline. Frames with a mismatched
    /// command or identifier (late answers to an earlier attempt included)
    /// are discarded without consuming the attempt.
    async fn exchange<F>(
        &mut self,
        command: Command,
        build: F,
        min_payload: usize,
    ) -> Result<Vec<u8>, GevError>
    where
        F: Fn(u16) -> Bytes,
    {
        for attempt in 1..=self.n_retries {
            let id = gvcp::next_packet_id(self.last_id);
            self.last_id = id;
            let packet = build(id);
            trace!(?command, id, attempt, bytes = packet.len(), "sending request");
            if let Err(err) = self.socket.send(&packet).await {
                warn!(?command, id, attempt, error = %err, "send failed");
                continue;
            }

            let mut deadline = Instant::now() + self.timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    debug!(?command, id, attempt, "attempt timed out");
                    break;
                }
                let received = match timeout(deadline - now, self.socket.recv(&mut self.buffer))
                    .await
                {
                    Err(_) => {
                        debug!(?command, id, attempt, "attempt timed out");
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(?command, id, attempt, error = %err, "receive failed");
                        break;
                    }
                    Ok(Ok(len)) => len,
                };

                let ack = match Ack::parse(&self.buffer[..received]) {
                    Ok(ack) => ack,
                    Err(err) => {
                        debug!(error = %err, bytes = received, "discarding malformed frame");
                        continue;
                    }
                };
                match ack.kind() {
                    AckKind::Pending => {
                        if ack.packet_id != id {
                            continue;
                        }
                        let extension = match ack.pending_timeout_ms() {
                            Ok(ms) => ms,
                            Err(err) => {
                                debug!(error = %err, "discarding malformed pending ack");
                                continue;
                            }
                        };
                        debug!(id, extension, "pending ack, extending deadline");
                        deadline = Instant::now() + Duration::from_millis(u64::from(extension));
                    }
                    AckKind::Ack => {
                        if ack.command != command.ack_code() || ack.packet_id != id {
                            trace!(
                                got_command = ack.command,
                                got_id = ack.packet_id,
                                "discarding stale acknowledgement"
                            );
                            continue;
                        }
                        if ack.payload.len() < min_payload {
                            warn!(
                                id,
                                bytes = ack.payload.len(),
                                expected = min_payload,
                                "discarding truncated acknowledgement"
                            );
                            continue;
                        }
                        return Ok(ack.payload.to_vec());
                    }
                    AckKind::Error(status) => {
                        if ack.command != command.ack_code() || ack.packet_id != id {
                            continue;
                        }
                        debug!(?command, id, %status, "device reported an error");
                        return Err(GevError::Protocol(status));
                    }
                    AckKind::UnknownError(code) => {
                        if ack.packet_id != id {
                            continue;
                        }
                        debug!(?command, id, code, "device reported an unknown error");
                        return Err(GevError::Protocol(gvcp::GvcpStatus::Unknown(code)));
                    }
                }
            }
        }
        Err(GevError::Timeout)
    }
}

#[async_trait]
impl MemoryIo for Channel {
    async fn read_memory(&self, address: u32, out: &mut [u8]) -> Result<(), GevError> {
        Channel::read_memory(self, address, out).await
    }

    async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), GevError> {
        Channel::write_memory(self, address, data).await
    }

    async fn read_register(&self, address: u32) -> Result<u32, GevError> {
        Channel::read_register(self, address).await
    }

    async fn write_register(&self, address: u32, value: u32) -> Result<(), GevError> {
        Channel::write_register(self, address, value).await
    }
}
