//! Per-buffer flags exchanged between client, component and device.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags carried by a buffer descriptor.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const EOS = 1 << 0;
        /// Payload is a complete frame (always set by the encoder on output).
        const END_OF_FRAME = 1 << 4;
        /// Payload is an intra / sync frame.
        const SYNC_FRAME = 1 << 5;
        /// Payload carries extra data after the bitstream.
        const EXTRA_DATA = 1 << 6;
        /// Payload is codec configuration (sequence / picture headers).
        const CODEC_CONFIG = 1 << 7;
    }
}

impl BufferFlags {
    pub fn is_eos(self) -> bool {
        self.contains(Self::EOS)
    }
}
