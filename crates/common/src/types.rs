//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two data ports of the encoder component.
///
/// Raw frames enter on `Input`; encoded bitstream leaves on `Output`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortIndex {
    Input,
    Output,
}

impl PortIndex {
    pub const ALL: [PortIndex; 2] = [PortIndex::Input, PortIndex::Output];

    /// Position of the port in per-port arrays (`[input, output]`).
    pub fn as_usize(self) -> usize {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Input => Self::Output,
            Self::Output => Self::Input,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target of a port-scoped command: a single port or both of them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortScope {
    Port(PortIndex),
    Both,
}

impl PortScope {
    /// Ports covered by this scope, input first.
    pub fn ports(self) -> &'static [PortIndex] {
        match self {
            Self::Port(PortIndex::Input) => &[PortIndex::Input],
            Self::Port(PortIndex::Output) => &[PortIndex::Output],
            Self::Both => &PortIndex::ALL,
        }
    }

    pub fn contains(self, port: PortIndex) -> bool {
        match self {
            Self::Port(p) => p == port,
            Self::Both => true,
        }
    }
}

impl From<PortIndex> for PortScope {
    fn from(port: PortIndex) -> Self {
        Self::Port(port)
    }
}

/// Lifecycle state of the component.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    Loaded,
    WaitForResources,
    Idle,
    Executing,
    Paused,
    /// Terminal. Entered only through the hardware-error path.
    Invalid,
}

impl ComponentState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Loaded => "Loaded",
            Self::WaitForResources => "WaitForResources",
            Self::Idle => "Idle",
            Self::Executing => "Executing",
            Self::Paused => "Paused",
            Self::Invalid => "Invalid",
        }
    }

    /// States in which buffers may be exchanged with the device.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Executing | Self::Paused)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable slot index of a buffer within its port's pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferIndex(pub usize);

impl BufferIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Presentation timestamp in microseconds.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Opaque client tag carried by a `MarkBuffer` command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkTag(pub u64);

/// Outcome attached to a buffer when it is handed back to its owner.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Not yet returned, or returned after normal processing.
    #[default]
    Ok,
    /// Returned unprocessed by a flush.
    Flushed,
    /// Rejected because a flush was running on the port when it arrived.
    FlushInProgress,
    /// Rejected because the component could not accept it in its current state.
    Rejected,
    /// The device reported a failure for this buffer.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_ports() {
        assert_eq!(PortScope::Both.ports(), &[PortIndex::Input, PortIndex::Output]);
        assert_eq!(PortScope::Port(PortIndex::Output).ports(), &[PortIndex::Output]);
        assert!(PortScope::Both.contains(PortIndex::Input));
        assert!(!PortScope::from(PortIndex::Input).contains(PortIndex::Output));
    }

    #[test]
    fn port_helpers() {
        assert_eq!(PortIndex::Input.other(), PortIndex::Output);
        assert_eq!(PortIndex::Output.as_usize(), 1);
        assert_eq!(PortIndex::Input.to_string(), "input");
    }

    #[test]
    fn streaming_states() {
        assert!(ComponentState::Executing.is_streaming());
        assert!(ComponentState::Paused.is_streaming());
        assert!(!ComponentState::Idle.is_streaming());
        assert!(!ComponentState::Invalid.is_streaming());
    }

    #[test]
    fn timestamp_conversion() {
        let ts = Timestamp::from_micros(1_500_000);
        assert!((ts.as_secs_f64() - 1.5).abs() < 1e-9);
        assert_eq!(ts.to_string(), "1500000us");
    }
}
