//! Component statistics.

use serde::{Deserialize, Serialize};

/// Running counters of the buffer traffic through the component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStats {
    /// Input buffers accepted by the worker.
    pub inputs_submitted: u64,
    /// Input buffers handed back to the client (any status).
    pub inputs_returned: u64,
    /// Output buffers accepted by the worker.
    pub outputs_submitted: u64,
    /// Output buffers handed back to the client (any status).
    pub outputs_returned: u64,
    /// Total payload bytes of returned output buffers.
    pub output_bytes: u64,
    /// Output buffers that carried end of stream.
    pub eos_outputs: u64,
    /// Zero-payload EOS inputs substituted with an internal buffer.
    pub eos_substitutions: u64,
    /// Flush operations started per port.
    pub flushes: u64,
}

impl ComponentStats {
    /// Input buffers currently held by the component or device.
    pub fn inputs_outstanding(&self) -> u64 {
        self.inputs_submitted.saturating_sub(self.inputs_returned)
    }

    pub fn outputs_outstanding(&self) -> u64 {
        self.outputs_submitted.saturating_sub(self.outputs_returned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outstanding_counts() {
        let stats = ComponentStats {
            inputs_submitted: 5,
            inputs_returned: 3,
            outputs_submitted: 2,
            outputs_returned: 2,
            ..ComponentStats::default()
        };
        assert_eq!(stats.inputs_outstanding(), 2);
        assert_eq!(stats.outputs_outstanding(), 0);
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_string(&ComponentStats::default()).unwrap();
        assert!(json.contains("\"eos_outputs\":0"));
    }
}
