//! Port definitions.

use serde::{Deserialize, Serialize};

use venc_common::{EngineError, PortIndex};
use venc_device::BufferRequirements;

/// Worker-owned configuration of one port.
#[derive(Clone, Debug)]
pub struct PortState {
    pub port: PortIndex,
    pub enabled: bool,
    pub min_count: u32,
    pub actual_count: u32,
    pub buffer_size: usize,
}

impl PortState {
    /// Port built from the device's requirements, with an optional count
    /// override from configuration.
    pub fn from_requirements(
        port: PortIndex,
        req: BufferRequirements,
        count_override: Option<u32>,
    ) -> Result<Self, EngineError> {
        let actual_count = count_override.unwrap_or(req.actual_count);
        if actual_count < req.min_count {
            return Err(EngineError::BadParameter(format!(
                "{port} port needs at least {} buffers, {actual_count} configured",
                req.min_count
            )));
        }
        if req.buffer_size == 0 {
            return Err(EngineError::Hardware(format!(
                "device reported a zero buffer size for the {port} port"
            )));
        }
        Ok(Self {
            port,
            enabled: true,
            min_count: req.min_count,
            actual_count,
            buffer_size: req.buffer_size,
        })
    }

    pub fn actual(&self) -> usize {
        self.actual_count as usize
    }
}

/// Read-only view of a port, published to client threads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub port: PortIndex,
    pub enabled: bool,
    pub populated: bool,
    pub min_count: u32,
    pub actual_count: u32,
    pub buffer_size: usize,
    /// Slots currently allocated.
    pub allocated: usize,
    pub pending_enable: bool,
    pub pending_disable: bool,
}

impl PortDefinition {
    pub(crate) fn placeholder(port: PortIndex) -> Self {
        Self {
            port,
            enabled: true,
            populated: false,
            min_count: 0,
            actual_count: 0,
            buffer_size: 0,
            allocated: 0,
            pending_enable: false,
            pending_disable: false,
        }
    }
}
