//! In-process GigE Vision device simulator.
//!
//! Answers GVCP commands over a real UDP socket against a 64 KiB memory
//! image. Tests script fault behaviors (dropped requests, pending acks,
//! error acks, spoofed identifiers) before issuing requests.

#![allow(dead_code)]

pub mod genapi;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gvcp::{Cmd, Command, GvcpStatus};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Size of the simulated register/memory image.
pub const MEMORY_SIZE: usize = 64 * 1024;

/// Where simulators place the GenICam payload referenced by the XML URL.
pub const XML_ADDRESS: u32 = 0x8000;

/// Default schema bytes served by [`Simulator::start`].
pub const XML: &[u8] = b"<RegisterDescription ModelName=\"SimCam\"/>";

/// One-shot pending-ack script.
#[derive(Debug, Clone, Copy)]
pub struct PendingScript {
    /// Extension advertised by the pending ack, in milliseconds.
    pub extension_ms: u16,
    /// Delay before the real ack follows.
    pub ack_delay: Duration,
}

#[derive(Default)]
pub struct SimState {
    pub memory: Mutex<Vec<u8>>,
    /// Drop this many requests silently (recorded, not answered).
    pub drop_requests: AtomicU32,
    /// One-shot: answer the next request with a pending ack first.
    pub pending: Mutex<Option<PendingScript>>,
    /// One-shot: answer the next request with this raw error status.
    pub error_status: Mutex<Option<u16>>,
    /// Send a wrong-identifier ack before this many real answers.
    pub spoof_before_answer: AtomicU32,
    /// Answer everything with wrong-identifier acks only.
    pub spoof_only: AtomicU32,
    pub seen_ids: Mutex<Vec<u16>>,
    pub request_count: AtomicU32,
}

pub struct Simulator {
    pub addr: SocketAddr,
    pub state: Arc<SimState>,
    task: JoinHandle<()>,
}

impl Simulator {
    /// Start a simulator with a populated bootstrap block and an XML URL
    /// pointing at [`XML`] in device memory.
    pub async fn start() -> Simulator {
        let sim = Self::start_blank().await;
        sim.write_u32(0x0004, 0x8000_0001); // device mode: big-endian
        // Capability: write-mem, packet-resend, pending-ack.
        sim.write_u32(0x0934, (1 << 1) | (1 << 2) | (1 << 5));
        sim.write_u32(0x0904, 1); // one stream channel
        sim.write_u32(0x0014, 1 << 2); // IP configuration: LLA
        sim.write_u32(0x0024, 0xC0A8_0164); // 192.168.1.100
        sim.write_u32(0x0034, 0xFFFF_FF00);
        sim.write_u32(0x0044, 0xC0A8_0101);
        sim.serve_xml(XML, false);
        sim
    }

    /// Start a simulator with zeroed memory and no XML URL.
    pub async fn start_blank() -> Simulator {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind simulator socket");
        let addr = socket.local_addr().expect("simulator address");
        let state = Arc::new(SimState {
            memory: Mutex::new(vec![0u8; MEMORY_SIZE]),
            ..SimState::default()
        });
        let task = tokio::spawn(run(socket, state.clone()));
        Simulator { addr, state, task }
    }

    /// Install `payload` at [`XML_ADDRESS`] and point URL slot 0 at it.
    pub fn serve_xml(&self, payload: &[u8], zipped: bool) {
        let name = if zipped { "sim.zip" } else { "sim.xml" };
        let url = format!("Local:{name};{XML_ADDRESS:x};{:x}", payload.len());
        self.set_memory(0x0200, url.as_bytes());
        self.set_memory(XML_ADDRESS, payload);
    }

    pub fn set_memory(&self, address: u32, data: &[u8]) {
        let mut memory = self.state.memory.lock().expect("memory lock");
        let start = address as usize;
        memory[start..start + data.len()].copy_from_slice(data);
    }

    pub fn write_u32(&self, address: u32, value: u32) {
        self.set_memory(address, &value.to_be_bytes());
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        let memory = self.state.memory.lock().expect("memory lock");
        let start = address as usize;
        u32::from_be_bytes(memory[start..start + 4].try_into().expect("4 bytes"))
    }

    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::SeqCst)
    }

    pub fn seen_ids(&self) -> Vec<u16> {
        self.state.seen_ids.lock().expect("ids lock").clone()
    }

    pub fn drop_next_requests(&self, count: u32) {
        self.state.drop_requests.store(count, Ordering::SeqCst);
    }

    pub fn answer_with_pending(&self, extension_ms: u16, ack_delay: Duration) {
        *self.state.pending.lock().expect("pending lock") = Some(PendingScript {
            extension_ms,
            ack_delay,
        });
    }

    pub fn answer_with_error(&self, status: GvcpStatus) {
        *self.state.error_status.lock().expect("error lock") = Some(status.to_raw());
    }

    pub fn spoof_before_answer(&self, count: u32) {
        self.state.spoof_before_answer.store(count, Ordering::SeqCst);
    }

    pub fn spoof_only(&self) {
        self.state.spoof_only.store(1, Ordering::SeqCst);
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(socket: UdpSocket, state: Arc<SimState>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(cmd) = Cmd::parse(&buf[..len]) else {
            continue;
        };
        state.request_count.fetch_add(1, Ordering::SeqCst);
        state
            .seen_ids
            .lock()
            .expect("ids lock")
            .push(cmd.packet_id);

        if state
            .drop_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            continue;
        }

        let error_status = state.error_status.lock().expect("error lock").take();
        if let Some(status) = error_status {
            let frame = gvcp::error_ack(GvcpStatus::from_raw(status), cmd.command, cmd.packet_id);
            let _ = socket.send_to(&frame, peer).await;
            continue;
        }

        if state.spoof_only.load(Ordering::SeqCst) != 0 {
            let frame = answer(&state, &cmd, cmd.packet_id.wrapping_add(100));
            let _ = socket.send_to(&frame, peer).await;
            continue;
        }

        if state
            .spoof_before_answer
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let frame = answer(&state, &cmd, cmd.packet_id.wrapping_add(100));
            let _ = socket.send_to(&frame, peer).await;
            // Fall through: the genuine answer follows the spoofed one.
        }

        let pending_script = state.pending.lock().expect("pending lock").take();
        if let Some(script) = pending_script {
            let frame = gvcp::pending_ack(cmd.packet_id, script.extension_ms);
            let _ = socket.send_to(&frame, peer).await;
            sleep(script.ack_delay).await;
        }

        let frame = answer(&state, &cmd, cmd.packet_id);
        let _ = socket.send_to(&frame, peer).await;
    }
}

fn answer(state: &SimState, cmd: &Cmd<'_>, ack_id: u16) -> bytes::Bytes {
    let mut memory = state.memory.lock().expect("memory lock");
    match cmd.command {
        Command::ReadRegister => match cmd.read_register_args() {
            Ok(address) if (address as usize) + 4 <= memory.len() => {
                let start = address as usize;
                let value =
                    u32::from_be_bytes(memory[start..start + 4].try_into().expect("4 bytes"));
                gvcp::read_register_ack(ack_id, value)
            }
            _ => gvcp::error_ack(GvcpStatus::InvalidAddress, cmd.command, ack_id),
        },
        Command::WriteRegister => match cmd.write_register_args() {
            Ok((address, value)) if (address as usize) + 4 <= memory.len() => {
                let start = address as usize;
                memory[start..start + 4].copy_from_slice(&value.to_be_bytes());
                gvcp::write_register_ack(ack_id)
            }
            _ => gvcp::error_ack(GvcpStatus::InvalidAddress, cmd.command, ack_id),
        },
        Command::ReadMemory => match cmd.read_memory_args() {
            Ok((address, size))
                if (address as usize) + (size as usize) <= memory.len() =>
            {
                let start = address as usize;
                gvcp::read_memory_ack(ack_id, address, &memory[start..start + size as usize])
            }
            _ => gvcp::error_ack(GvcpStatus::InvalidAddress, cmd.command, ack_id),
        },
        Command::WriteMemory => match cmd.write_memory_args() {
            Ok((address, data)) if (address as usize) + data.len() <= memory.len() => {
                let start = address as usize;
                memory[start..start + data.len()].copy_from_slice(data);
                gvcp::write_memory_ack(ack_id, data.len() as u16)
            }
            _ => gvcp::error_ack(GvcpStatus::InvalidAddress, cmd.command, ack_id),
        },
    }
}
