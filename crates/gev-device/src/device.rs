//! Device session facade.
//!
//! [`GevDevice`] owns the control channel, the privilege lease and the loaded
//! schema. Construction performs the whole bootstrap: socket setup, schema
//! retrieval, control takeover, heartbeat spawn, capability and endianness
//! discovery.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::bootstrap::{self, register_string, XmlUrl};
use crate::channel::Channel;
use crate::config::{GevConfig, PacketSizeAdjustment, StreamOptions};
use crate::genapi::{default_nodes, features, Genapi, MemoryIo, SchemaLoader};
use crate::heartbeat::Heartbeat;
use crate::mtu;
use crate::registers::{
    bootstrap as regs, ControlPrivilege, DeviceMode, GvcpCapability, IpConfiguration,
};
use crate::GevError;

type ControlLostHandler = Box<dyn Fn() + Send + Sync + 'static>;

/// State shared between the facade and the heartbeat task.
pub(crate) struct SessionShared {
    pub(crate) channel: Arc<Channel>,
    /// Read lock-free by the heartbeat; stale reads are harmless.
    pub(crate) is_controller: AtomicBool,
    control_lost: std::sync::Mutex<Option<ControlLostHandler>>,
}

impl SessionShared {
    pub(crate) fn notify_control_lost(&self) {
        if let Ok(guard) = self.control_lost.lock() {
            if let Some(handler) = guard.as_ref() {
                handler();
            }
        }
    }
}

/// Bootstrap identity strings of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub serial: Option<String>,
}

/// Everything the external streaming receiver needs to build a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Stream channel index.
    pub channel: u32,
    /// Negotiated GVSP packet size in bytes.
    pub packet_size: u32,
    /// Whether the device implements stream packet resend.
    pub resend_supported: bool,
    /// Option bits from the session configuration.
    pub options: StreamOptions,
    /// Local interface the receiver should bind on.
    pub interface: Ipv4Addr,
    /// Device address the stream originates from.
    pub device: Ipv4Addr,
}

/// Capability interface of a controllable device.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn read_memory(&self, address: u32, out: &mut [u8]) -> Result<(), GevError>;
    async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), GevError>;
    async fn read_register(&self, address: u32) -> Result<u32, GevError>;
    async fn write_register(&self, address: u32, value: u32) -> Result<(), GevError>;
    /// Raw GenICam data the schema was built from.
    fn genicam_xml(&self) -> &[u8];
    /// The loaded schema evaluator.
    fn genapi(&self) -> Arc<dyn Genapi>;
    /// Prepare a stream for the external receiver.
    async fn create_stream(&self) -> Result<StreamDescriptor, GevError>;
}

/// An open control session with a GigE Vision device.
pub struct GevDevice {
    shared: Arc<SessionShared>,
    heartbeat: AsyncMutex<Option<Heartbeat>>,
    genapi: Arc<dyn Genapi>,
    xml: Vec<u8>,
    xml_url: XmlUrl,
    interface: Ipv4Addr,
    device: Ipv4Addr,
    device_mode: DeviceMode,
    capability: GvcpCapability,
    config: GevConfig,
    first_stream_created: AtomicBool,
    closed: AtomicBool,
}

impl GevDevice {
    /// Open a control session.
    ///
    /// `interface` is the local NIC address to bind on, `device` the camera's
    /// control endpoint. Schema retrieval is fatal; a failed control takeover
    /// is not (the session degrades to monitoring until
    /// [`take_control`](Self::take_control) succeeds).
    pub async fn open(
        interface: IpAddr,
        device: IpAddr,
        loader: &dyn SchemaLoader,
        config: GevConfig,
    ) -> Result<Self, GevError> {
        let interface = require_ipv4(interface, "interface address")?;
        let device = require_ipv4(device, "device address")?;
        let channel = Arc::new(Channel::connect(interface, device, &config).await?);

        let (xml, xml_url) = bootstrap::load(&channel).await?;
        let io: Arc<dyn MemoryIo> = channel.clone();
        let genapi = loader.load(&xml, io)?;
        let mut injected = 0usize;
        for node in default_nodes() {
            if !genapi.is_defined(node.name) {
                genapi.define_default(node);
                injected += 1;
            }
        }
        debug!(injected, "fallback nodes injected");

        let shared = Arc::new(SessionShared {
            channel,
            is_controller: AtomicBool::new(false),
            control_lost: std::sync::Mutex::new(None),
        });

        match write_control_privilege(&shared, &config).await {
            Ok(()) => shared.is_controller.store(true, Ordering::Relaxed),
            Err(err) => warn!(error = %err, "could not take control of the device"),
        }

        let heartbeat = Heartbeat::spawn(shared.clone(), config.heartbeat_period);

        let probes = async {
            let mode = DeviceMode::from_raw(shared.channel.read_register(regs::DEVICE_MODE).await?);
            let capability = GvcpCapability::from_bits_retain(
                shared.channel.read_register(regs::GVCP_CAPABILITY).await?,
            );
            Ok::<_, GevError>((mode, capability))
        };
        let (device_mode, capability) = match probes.await {
            Ok(values) => values,
            Err(err) => {
                heartbeat.shutdown().await;
                return Err(err);
            }
        };

        info!(
            %device,
            big_endian = device_mode.is_big_endian(),
            packet_resend = capability.contains(GvcpCapability::PACKET_RESEND),
            write_mem = capability.contains(GvcpCapability::WRITE_MEM),
            controller = shared.is_controller.load(Ordering::Relaxed),
            "control session initialized"
        );

        Ok(Self {
            shared,
            heartbeat: AsyncMutex::new(Some(heartbeat)),
            genapi,
            xml,
            xml_url,
            interface,
            device,
            device_mode,
            capability,
            config,
            first_stream_created: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Local interface address the session is bound to.
    pub fn interface_address(&self) -> Ipv4Addr {
        self.interface
    }

    /// Device control endpoint address.
    pub fn device_address(&self) -> Ipv4Addr {
        self.device
    }

    /// URL the GenICam data was fetched from.
    pub fn genicam_url(&self) -> &XmlUrl {
        &self.xml_url
    }

    /// Decoded device mode register.
    pub fn device_mode(&self) -> DeviceMode {
        self.device_mode
    }

    /// Whether the device declares big-endian register data.
    pub fn is_big_endian_device(&self) -> bool {
        self.device_mode.is_big_endian()
    }

    /// Whether the device implements stream packet resend.
    pub fn is_packet_resend_supported(&self) -> bool {
        self.capability.contains(GvcpCapability::PACKET_RESEND)
    }

    /// Whether the device implements the WRITE_MEMORY command.
    pub fn is_write_memory_supported(&self) -> bool {
        self.capability.contains(GvcpCapability::WRITE_MEM)
    }

    /// Whether this session currently holds the control privilege.
    pub fn is_controller(&self) -> bool {
        self.shared.is_controller.load(Ordering::Relaxed)
    }

    /// Register the listener invoked (from the heartbeat task) when the
    /// control privilege is lost to another application.
    pub fn set_control_lost_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.shared.control_lost.lock() {
            *guard = Some(Box::new(handler));
        }
    }

    /// Acquire the control privilege.
    pub async fn take_control(&self) -> Result<(), GevError> {
        write_control_privilege(&self.shared, &self.config).await?;
        self.shared.is_controller.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Release the control privilege. A no-op when not controlling.
    pub async fn leave_control(&self) -> Result<(), GevError> {
        if !self.shared.is_controller.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        self.shared
            .channel
            .write_register(regs::CONTROL_CHANNEL_PRIVILEGE, 0)
            .await
    }

    /// Read the bootstrap identity strings.
    pub async fn device_info(&self) -> Result<DeviceInfo, GevError> {
        Ok(DeviceInfo {
            manufacturer: self.read_string(regs::MANUFACTURER_NAME).await?,
            model: self.read_string(regs::MODEL_NAME).await?,
            version: self.read_string(regs::DEVICE_VERSION).await?,
            serial: self.read_string(regs::SERIAL_NUMBER).await?,
        })
    }

    async fn read_string(&self, register: (u32, usize)) -> Result<Option<String>, GevError> {
        let mut raw = vec![0u8; register.1];
        self.shared.channel.read_memory(register.0, &mut raw).await?;
        Ok(register_string(&raw))
    }

    /// Timestamp tick frequency in Hz, combined from the register pair.
    pub async fn timestamp_tick_frequency(&self) -> Result<u64, GevError> {
        let ticks = self.genapi.integer(features::TIMESTAMP_TICK_FREQUENCY).await?;
        u64::try_from(ticks)
            .map_err(|_| GevError::schema("negative timestamp tick frequency".to_string()))
    }

    /// Currently active IP configuration schemes.
    pub async fn ip_configuration(&self) -> Result<IpConfiguration, GevError> {
        let raw = self
            .shared
            .channel
            .read_register(regs::CURRENT_IP_CONFIGURATION)
            .await?;
        Ok(IpConfiguration::from_bits_truncate(raw))
    }

    /// Current IP address of the device.
    pub async fn current_ip(&self) -> Result<Ipv4Addr, GevError> {
        self.feature_address(features::CURRENT_IP_ADDRESS).await
    }

    /// Current subnet mask of the device.
    pub async fn current_subnet_mask(&self) -> Result<Ipv4Addr, GevError> {
        self.feature_address(features::CURRENT_SUBNET_MASK).await
    }

    /// Current default gateway of the device.
    pub async fn current_default_gateway(&self) -> Result<Ipv4Addr, GevError> {
        self.feature_address(features::CURRENT_DEFAULT_GATEWAY).await
    }

    /// Persistent IP address stored on the device.
    pub async fn persistent_ip(&self) -> Result<Ipv4Addr, GevError> {
        self.feature_address(features::PERSISTENT_IP_ADDRESS).await
    }

    /// Persistent subnet mask stored on the device.
    pub async fn persistent_subnet_mask(&self) -> Result<Ipv4Addr, GevError> {
        self.feature_address(features::PERSISTENT_SUBNET_MASK).await
    }

    /// Persistent default gateway stored on the device.
    pub async fn persistent_default_gateway(&self) -> Result<Ipv4Addr, GevError> {
        self.feature_address(features::PERSISTENT_DEFAULT_GATEWAY).await
    }

    /// Store a persistent IP configuration and switch the device's IP
    /// configuration mode to persistent.
    pub async fn set_persistent_ip(
        &self,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<(), GevError> {
        self.set_feature_address(features::PERSISTENT_IP_ADDRESS, ip)
            .await?;
        self.set_feature_address(features::PERSISTENT_SUBNET_MASK, mask)
            .await?;
        self.set_feature_address(features::PERSISTENT_DEFAULT_GATEWAY, gateway)
            .await?;
        self.genapi
            .set_boolean(features::CURRENT_IP_CONFIGURATION_PERSISTENT_IP, true)
            .await
    }

    /// String variant of [`set_persistent_ip`](Self::set_persistent_ip).
    /// IPv6 inputs are rejected with invalid-parameter.
    pub async fn set_persistent_ip_from_string(
        &self,
        ip: &str,
        mask: &str,
        gateway: &str,
    ) -> Result<(), GevError> {
        let ip = parse_ipv4(ip)?;
        let mask = parse_ipv4(mask)?;
        let gateway = parse_ipv4(gateway)?;
        self.set_persistent_ip(ip, mask, gateway).await
    }

    async fn feature_address(&self, name: &str) -> Result<Ipv4Addr, GevError> {
        let value = self.genapi.integer(name).await?;
        u32::try_from(value)
            .map(Ipv4Addr::from)
            .map_err(|_| GevError::schema(format!("{name} out of the IPv4 range")))
    }

    async fn set_feature_address(&self, name: &str, address: Ipv4Addr) -> Result<(), GevError> {
        self.genapi
            .set_integer(name, i64::from(u32::from(address)))
            .await
    }

    /// Probe the path and program the largest deliverable stream packet size.
    pub async fn auto_packet_size(&self) -> Result<u32, GevError> {
        mtu::auto_packet_size(self.genapi.as_ref(), self.interface, false).await
    }

    /// Cancel the heartbeat, release control and end the session. Idempotent.
    pub async fn close(&self) -> Result<(), GevError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.shutdown().await;
        }
        if let Err(err) = self.leave_control().await {
            warn!(error = %err, "failed to release control");
        }
        debug!("control session closed");
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for GevDevice {
    async fn read_memory(&self, address: u32, out: &mut [u8]) -> Result<(), GevError> {
        self.shared.channel.read_memory(address, out).await
    }

    async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), GevError> {
        self.shared.channel.write_memory(address, data).await
    }

    async fn read_register(&self, address: u32) -> Result<u32, GevError> {
        self.shared.channel.read_register(address).await
    }

    async fn write_register(&self, address: u32, value: u32) -> Result<(), GevError> {
        self.shared.channel.write_register(address, value).await
    }

    fn genicam_xml(&self) -> &[u8] {
        &self.xml
    }

    fn genapi(&self) -> Arc<dyn Genapi> {
        self.genapi.clone()
    }

    async fn create_stream(&self) -> Result<StreamDescriptor, GevError> {
        if !self.is_controller() {
            return Err(GevError::NotController);
        }
        let channels = self.genapi.integer(features::STREAM_CHANNEL_COUNT).await?;
        if channels <= 0 {
            return Err(GevError::NoStreamChannel);
        }

        let adjusted_before = self.first_stream_created.load(Ordering::Relaxed);
        let adjust = match self.config.packet_size_adjustment {
            PacketSizeAdjustment::Never => None,
            PacketSizeAdjustment::Always => Some(false),
            PacketSizeAdjustment::OnFailure => Some(true),
            PacketSizeAdjustment::Once if !adjusted_before => Some(false),
            PacketSizeAdjustment::OnFailureOnce if !adjusted_before => Some(true),
            PacketSizeAdjustment::Once | PacketSizeAdjustment::OnFailureOnce => None,
        };
        let packet_size = match adjust {
            Some(exit_early) => {
                mtu::auto_packet_size(self.genapi.as_ref(), self.interface, exit_early).await?
            }
            None => {
                let size = self.genapi.integer(features::SCPS_PACKET_SIZE).await?;
                u32::try_from(size)
                    .map_err(|_| GevError::schema("negative packet size".to_string()))?
            }
        };
        self.first_stream_created.store(true, Ordering::Relaxed);

        Ok(StreamDescriptor {
            channel: 0,
            packet_size,
            resend_supported: self.is_packet_resend_supported(),
            options: self.config.stream_options,
            interface: self.interface,
            device: self.device,
        })
    }
}

impl Drop for GevDevice {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut guard) = self.heartbeat.try_lock() {
            if let Some(heartbeat) = guard.take() {
                heartbeat.abort();
            }
        }
    }
}

async fn write_control_privilege(
    shared: &SessionShared,
    config: &GevConfig,
) -> Result<(), GevError> {
    shared
        .channel
        .write_register(
            regs::CONTROL_CHANNEL_PRIVILEGE,
            ControlPrivilege::CONTROL.bits(),
        )
        .await?;
    if let Some(timeout) = config.heartbeat_timeout {
        let ms = u32::try_from(timeout.as_millis())
            .map_err(|_| GevError::invalid("heartbeat timeout too long"))?;
        shared
            .channel
            .write_register(regs::HEARTBEAT_TIMEOUT, ms)
            .await?;
    }
    Ok(())
}

fn require_ipv4(address: IpAddr, what: &str) -> Result<Ipv4Addr, GevError> {
    match address {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(GevError::invalid(format!("{what} must be IPv4"))),
    }
}

fn parse_ipv4(text: &str) -> Result<Ipv4Addr, GevError> {
    let address: IpAddr = text
        .trim()
        .parse()
        .map_err(|_| GevError::invalid(format!("unparsable address: {text}")))?;
    require_ipv4(address, "address")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_is_rejected() {
        assert!(matches!(
            parse_ipv4("fe80::1"),
            Err(GevError::InvalidParameter(_))
        ));
        assert!(matches!(
            parse_ipv4("not an address"),
            Err(GevError::InvalidParameter(_))
        ));
        assert_eq!(
            parse_ipv4("192.168.1.100").expect("parse"),
            Ipv4Addr::new(192, 168, 1, 100)
        );
    }
}
