#![cfg_attr(docsrs, feature(doc_cfg))]
//! GigE Vision device control: serialized GVCP transactions with retries and
//! pending-acknowledge extensions, block memory I/O, a control-privilege lease
//! kept alive by a background heartbeat, stream packet-size probing, and the
//! GenICam schema bootstrap.
//!
//! The crate owns the control plane only. Feature-tree evaluation and GVSP
//! stream reception are external collaborators reached through the [`Genapi`]
//! and [`StreamDescriptor`] seams.

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod device;
pub mod genapi;
mod heartbeat;
pub mod mtu;
pub mod registers;

use thiserror::Error;

pub use channel::Channel;
pub use config::{GevConfig, PacketSizeAdjustment, StreamOptions};
pub use device::{DeviceControl, DeviceInfo, GevDevice, StreamDescriptor};
pub use genapi::{
    default_nodes, features, Access, Genapi, IntegerBounds, MemoryIo, NodeDefault, NodeKind,
    SchemaLoader,
};

/// Errors surfaced by the device control core.
#[derive(Debug, Error)]
pub enum GevError {
    /// Bad address family, unparsable string or out-of-range argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// No conclusive acknowledgement after all retries.
    #[error("timeout waiting for acknowledgement")]
    Timeout,
    /// The device answered with an error acknowledgement.
    #[error("device error: {0}")]
    Protocol(gvcp::GvcpStatus),
    /// The device reports zero stream channels.
    #[error("device has no stream channel")]
    NoStreamChannel,
    /// The operation requires the control privilege.
    #[error("control privilege required")]
    NotController,
    /// Both XML URLs failed or decompression yielded nothing.
    #[error("GenICam data not found")]
    GenicamNotFound,
    /// Failure reported by the external schema evaluator.
    #[error("schema: {0}")]
    Schema(String),
    /// Socket or allocation failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl GevError {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        GevError::InvalidParameter(msg.into())
    }

    pub(crate) fn schema<S: Into<String>>(msg: S) -> Self {
        GevError::Schema(msg.into())
    }
}
