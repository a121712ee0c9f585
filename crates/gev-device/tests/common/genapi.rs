//! Minimal schema evaluator for tests.
//!
//! Resolves every feature through the default node definitions injected by
//! the session, routing register traffic through the provided [`MemoryIo`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gev_device::{
    Genapi, GevError, IntegerBounds, MemoryIo, NodeDefault, NodeKind, SchemaLoader,
};

pub struct MockGenapi {
    io: Arc<dyn MemoryIo>,
    nodes: Mutex<HashMap<&'static str, NodeDefault>>,
}

impl MockGenapi {
    pub fn new(io: Arc<dyn MemoryIo>) -> Self {
        Self {
            io,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn node(&self, name: &str) -> Result<NodeDefault, GevError> {
        self.nodes
            .lock()
            .expect("nodes lock")
            .get(name)
            .copied()
            .ok_or_else(|| GevError::Schema(format!("no node named {name}")))
    }
}

#[async_trait]
impl Genapi for MockGenapi {
    fn is_defined(&self, name: &str) -> bool {
        self.nodes.lock().expect("nodes lock").contains_key(name)
    }

    fn is_command(&self, _name: &str) -> bool {
        false
    }

    fn define_default(&self, node: NodeDefault) {
        self.nodes
            .lock()
            .expect("nodes lock")
            .insert(node.name, node);
    }

    async fn integer(&self, name: &str) -> Result<i64, GevError> {
        match self.node(name)?.kind {
            NodeKind::Integer { address } => {
                Ok(i64::from(self.io.read_register(address).await?))
            }
            NodeKind::MaskedInteger { address, lsb, msb } => {
                let raw = self.io.read_register(address).await?;
                let width = msb - lsb + 1;
                let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
                Ok(i64::from((raw >> lsb) & mask))
            }
            NodeKind::IntegerPair { high, low } => {
                let high = u64::from(self.io.read_register(high).await?);
                let low = u64::from(self.io.read_register(low).await?);
                Ok(((high << 32) | low) as i64)
            }
            NodeKind::Boolean { .. } => Err(GevError::Schema(format!("{name} is a boolean"))),
        }
    }

    async fn set_integer(&self, name: &str, value: i64) -> Result<(), GevError> {
        match self.node(name)?.kind {
            NodeKind::Integer { address } => {
                let value = u32::try_from(value)
                    .map_err(|_| GevError::Schema(format!("{name} value out of range")))?;
                self.io.write_register(address, value).await
            }
            NodeKind::MaskedInteger { address, lsb, msb } => {
                let width = msb - lsb + 1;
                let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
                let value = u32::try_from(value)
                    .map_err(|_| GevError::Schema(format!("{name} value out of range")))?;
                if value & !mask != 0 {
                    return Err(GevError::Schema(format!("{name} value out of range")));
                }
                let raw = self.io.read_register(address).await?;
                let raw = (raw & !(mask << lsb)) | (value << lsb);
                self.io.write_register(address, raw).await
            }
            NodeKind::IntegerPair { high, low } => {
                let value = value as u64;
                self.io.write_register(high, (value >> 32) as u32).await?;
                self.io.write_register(low, value as u32).await
            }
            NodeKind::Boolean { .. } => Err(GevError::Schema(format!("{name} is a boolean"))),
        }
    }

    async fn integer_bounds(&self, name: &str) -> Result<IntegerBounds, GevError> {
        self.node(name)?;
        Ok(IntegerBounds {
            min: 0,
            max: i64::from(u32::MAX),
            inc: 1,
        })
    }

    async fn boolean(&self, name: &str) -> Result<bool, GevError> {
        match self.node(name)?.kind {
            NodeKind::Boolean { address, bit } => {
                let raw = self.io.read_register(address).await?;
                Ok(raw & (1 << bit) != 0)
            }
            _ => Err(GevError::Schema(format!("{name} is not a boolean"))),
        }
    }

    async fn set_boolean(&self, name: &str, value: bool) -> Result<(), GevError> {
        match self.node(name)?.kind {
            NodeKind::Boolean { address, bit } => {
                let raw = self.io.read_register(address).await?;
                let raw = if value {
                    raw | (1 << bit)
                } else {
                    raw & !(1 << bit)
                };
                self.io.write_register(address, raw).await
            }
            _ => Err(GevError::Schema(format!("{name} is not a boolean"))),
        }
    }

    async fn execute(&self, name: &str) -> Result<(), GevError> {
        Err(GevError::Schema(format!("{name} is not a command")))
    }
}

/// Loader handing out [`MockGenapi`] instances.
pub struct MockLoader;

impl SchemaLoader for MockLoader {
    fn load(&self, xml: &[u8], io: Arc<dyn MemoryIo>) -> Result<Arc<dyn Genapi>, GevError> {
        if xml.is_empty() {
            return Err(GevError::Schema("empty schema".to_string()));
        }
        Ok(Arc::new(MockGenapi::new(io)))
    }
}
