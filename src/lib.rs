//! GigE Vision device control core.
//!
//! Re-exports the workspace crates: [`gvcp`] for the wire codec and
//! [`device`] for the control session.
//!
//! ```rust,no_run
//! use std::net::IpAddr;
//! use std::sync::Arc;
//!
//! use gev_rs::device::{Genapi, GevConfig, GevDevice, GevError, MemoryIo, SchemaLoader};
//!
//! # struct MyLoader;
//! # impl SchemaLoader for MyLoader {
//! #     fn load(
//! #         &self,
//! #         _xml: &[u8],
//! #         _io: Arc<dyn MemoryIo>,
//! #     ) -> Result<Arc<dyn Genapi>, GevError> {
//! #         unimplemented!("plug in a GenICam evaluator")
//! #     }
//! # }
//! # async fn run() -> Result<(), GevError> {
//! let interface: IpAddr = "192.168.1.2".parse().expect("interface");
//! let camera: IpAddr = "192.168.1.100".parse().expect("camera");
//! let device = GevDevice::open(interface, camera, &MyLoader, GevConfig::default()).await?;
//! println!("controller: {}", device.is_controller());
//! device.close().await?;
//! # Ok(())
//! # }
//! ```

pub use gev_device as device;
pub use gvcp;

pub use gev_device::{DeviceControl, GevConfig, GevDevice, GevError, StreamDescriptor};
