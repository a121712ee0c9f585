//! Automatic stream packet size negotiation.
//!
//! Finds the largest GVSP packet size that traverses the path unfragmented:
//! the device is asked to fire one test datagram per probed size towards an
//! ephemeral host socket, and the size range reported by the packet-size
//! feature is bisected on the outcome.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use gvcp::{GVSP_PACKET_SIZE_MAX, GVSP_PACKET_SIZE_MIN, GVSP_UDP_OVERHEAD};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::genapi::{features, Genapi};
use crate::GevError;

/// How long to wait for each test datagram.
const PROBE_TIMEOUT: Duration = Duration::from_millis(10);
/// Transmit attempts per probed size.
const PROBE_ATTEMPTS: u32 = 3;
/// Receive buffer requested for the test socket.
const PROBE_RCVBUF: usize = 1 << 20;

/// Run the probe and program the chosen size into the packet-size feature.
///
/// With `exit_early` the currently configured size is tested first and kept
/// if it already traverses the path.
pub async fn auto_packet_size(
    genapi: &dyn Genapi,
    interface: Ipv4Addr,
    exit_early: bool,
) -> Result<u32, GevError> {
    let bounds = genapi.integer_bounds(features::SCPS_PACKET_SIZE).await?;
    let inc = u32::try_from(bounds.inc.max(1))
        .map_err(|_| GevError::invalid("packet size increment out of range"))?;
    let current = u32::try_from(genapi.integer(features::SCPS_PACKET_SIZE).await?)
        .map_err(|_| GevError::invalid("negative packet size"))?;

    let min = bounds.min.max(i64::from(GVSP_PACKET_SIZE_MIN));
    let max = bounds.max.min(i64::from(GVSP_PACKET_SIZE_MAX));
    if max < min || i64::from(inc) > max - min {
        debug!(min, max, inc, current, "packet size range unusable, keeping current");
        return Ok(current);
    }
    let (min, max) = (min as u32, max as u32);

    let socket = bind_test_socket(interface)?;
    let port = socket.local_addr()?.port();
    genapi
        .set_integer(features::SCP_HOST_PORT, i64::from(port))
        .await?;
    genapi
        .set_integer(features::SCDA, i64::from(u32::from(interface)))
        .await?;

    let fragmenting = genapi.boolean(features::SCPS_DO_NOT_FRAGMENT).await?;
    genapi
        .set_boolean(features::SCPS_DO_NOT_FRAGMENT, true)
        .await?;
    let outcome = search(genapi, &socket, min, max, inc, current, exit_early).await;
    if let Err(err) = genapi
        .set_boolean(features::SCPS_DO_NOT_FRAGMENT, fragmenting)
        .await
    {
        warn!(error = %err, "failed to restore do-not-fragment");
    }

    let chosen = outcome?;
    genapi
        .set_integer(features::SCPS_PACKET_SIZE, i64::from(chosen))
        .await?;
    info!(packet_size = chosen, "stream packet size selected");
    Ok(chosen)
}

async fn search(
    genapi: &dyn Genapi,
    socket: &UdpSocket,
    mut min: u32,
    mut max: u32,
    inc: u32,
    current: u32,
    exit_early: bool,
) -> Result<u32, GevError> {
    if exit_early
        && (min..=max).contains(&current)
        && probe(genapi, socket, current).await?
    {
        debug!(current, "current packet size verified");
        return Ok(current);
    }

    let mut chosen = min;
    let mut previous = 0u32;
    loop {
        let candidate = min + round_down_to_inc((max - min) / 2 + 1, inc);
        if candidate == previous {
            break;
        }
        previous = candidate;
        if probe(genapi, socket, candidate).await? {
            trace!(candidate, "test packet delivered");
            chosen = candidate;
            min = candidate;
        } else {
            trace!(candidate, "test packet lost");
            max = candidate;
        }
        if min + inc >= max {
            break;
        }
    }
    Ok(chosen)
}

/// Configure `size` and fire test packets until one arrives intact.
async fn probe(genapi: &dyn Genapi, socket: &UdpSocket, size: u32) -> Result<bool, GevError> {
    genapi
        .set_integer(features::SCPS_PACKET_SIZE, i64::from(size))
        .await?;
    let expected = (size - GVSP_UDP_OVERHEAD) as usize;
    let mut buf = vec![0u8; GVSP_PACKET_SIZE_MAX as usize];
    for attempt in 1..=PROBE_ATTEMPTS {
        fire_test_packet(genapi).await?;
        let deadline = Instant::now() + PROBE_TIMEOUT;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match timeout(deadline - now, socket.recv(&mut buf)).await {
                Ok(Ok(len)) if len == expected => return Ok(true),
                Ok(Ok(len)) => {
                    trace!(len, expected, attempt, "discarding unexpected test datagram");
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "test socket receive failed");
                    break;
                }
                Err(_) => break,
            }
        }
    }
    Ok(false)
}

async fn fire_test_packet(genapi: &dyn Genapi) -> Result<(), GevError> {
    if genapi.is_command(features::SCPS_FIRE_TEST_PACKET) {
        genapi.execute(features::SCPS_FIRE_TEST_PACKET).await
    } else {
        genapi
            .set_boolean(features::SCPS_FIRE_TEST_PACKET, false)
            .await?;
        genapi
            .set_boolean(features::SCPS_FIRE_TEST_PACKET, true)
            .await
    }
}

fn bind_test_socket(interface: Ipv4Addr) -> Result<UdpSocket, GevError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Err(err) = socket.set_recv_buffer_size(PROBE_RCVBUF) {
        warn!(error = %err, "failed to grow test socket buffer");
    }
    socket.bind(&SocketAddr::from((interface, 0)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

const fn round_down_to_inc(value: u32, inc: u32) -> u32 {
    value - value % inc
}
