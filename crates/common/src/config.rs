//! Configuration structs for the encoder component.
//!
//! Loadable from TOML or JSON; every field has a default so a config file
//! only needs to name what it changes:
//!
//! ```toml
//! input_mode = "staged"
//! probe_timeout_ms = 500
//!
//! [codec]
//! kind = "avc"
//! profile = "High"
//! level = 40
//! p_frames = 59
//! b_frames = 0
//! entropy = "Cabac"
//! inband_headers = true
//!
//! [frame]
//! width = 1920
//! height = 1080
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::ConfigError;

/// Raw frame colour layout accepted on the input port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    #[default]
    Nv12,
    Nv21,
    I420,
}

impl ColorFormat {
    /// Bytes of one frame of `width` x `height` pixels (all formats are 4:2:0).
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        luma + luma / 2
    }
}

/// Geometry and cadence of the input frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub color: ColorFormat,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            width: 176,
            height: 144,
            fps_num: 30,
            fps_den: 1,
            color: ColorFormat::Nv12,
        }
    }
}

impl FrameFormat {
    pub fn frame_size(&self) -> usize {
        self.color.frame_size(self.width, self.height)
    }
}

/// Bitrate control.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateControl {
    /// Constant bitrate (bits/sec).
    Cbr(u32),
    /// Variable bitrate (target bits/sec).
    Vbr(u32),
    /// Rate control disabled; fixed QP.
    Off,
}

impl Default for RateControl {
    fn default() -> Self {
        Self::Vbr(64_000)
    }
}

/// How client input buffers reach the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Client input buffers are registered with the device and submitted as is.
    #[default]
    Registered,
    /// Client input buffers stay private; payloads are copied into internal
    /// staging buffers that the device owns a registration for.
    Staged,
}

/// Optional per-port override of the device's buffer requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortOverrides {
    /// Actual buffer count; must not be below the device minimum.
    pub buffer_count: Option<u32>,
}

/// Top-level component configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub codec: Codec,
    pub frame: FrameFormat,
    pub rate: RateControl,
    pub input_mode: InputMode,
    pub input: PortOverrides,
    pub output: PortOverrides,
    /// Upper bound on the synchronous codec-header probe.
    pub probe_timeout_ms: u64,
    /// Poll interval of the device event thread.
    pub event_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            frame: FrameFormat::default(),
            rate: RateControl::default(),
            input_mode: InputMode::Registered,
            input: PortOverrides::default(),
            output: PortOverrides::default(),
            probe_timeout_ms: 1000,
            event_poll_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` or (any other extension) TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.codec.validate()?;
        let frame = &self.frame;
        if frame.width == 0 || frame.height == 0 || frame.width % 2 != 0 || frame.height % 2 != 0
        {
            return Err(ConfigError::Field {
                field: "frame",
                reason: format!(
                    "{}x{} must be non-zero and even",
                    frame.width, frame.height
                ),
            });
        }
        if frame.fps_num == 0 || frame.fps_den == 0 {
            return Err(ConfigError::Field {
                field: "frame rate",
                reason: format!("{}/{} is not a valid rate", frame.fps_num, frame.fps_den),
            });
        }
        if let RateControl::Cbr(0) | RateControl::Vbr(0) = self.rate {
            return Err(ConfigError::Field {
                field: "rate",
                reason: "bitrate must be non-zero".into(),
            });
        }
        for (field, overrides) in [("input", &self.input), ("output", &self.output)] {
            if overrides.buffer_count == Some(0) {
                return Err(ConfigError::Field {
                    field,
                    reason: "buffer count must be non-zero".into(),
                });
            }
        }
        if self.probe_timeout_ms == 0 || self.event_poll_ms == 0 {
            return Err(ConfigError::Field {
                field: "timeouts",
                reason: "probe and poll intervals must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AvcProfile, EntropyCoding};
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.frame.frame_size(), 176 * 144 * 3 / 2);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            input_mode = "staged"

            [codec]
            kind = "avc"
            profile = "High"
            level = 40
            p_frames = 59
            b_frames = 2
            entropy = "Cabac"
            inband_headers = true

            [frame]
            width = 1280
            height = 720

            [output]
            buffer_count = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.input_mode, InputMode::Staged);
        assert_eq!(config.frame.width, 1280);
        assert_eq!(config.frame.fps_num, 30);
        assert_eq!(config.output.buffer_count, Some(6));
        assert_eq!(config.input.buffer_count, None);
        match &config.codec {
            Codec::Avc(p) => {
                assert_eq!(p.profile, AvcProfile::High);
                assert_eq!(p.entropy, EntropyCoding::Cabac);
            }
            other => panic!("unexpected codec {other:?}"),
        }
    }

    #[test]
    fn invalid_codec_is_rejected_on_load() {
        let err = EngineConfig::from_toml_str(
            r#"
            [codec]
            kind = "vp8"
            profile = 9
            p_frames = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Codec(_)));
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let mut config = EngineConfig::default();
        config.frame.width = 175;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("175x144"));
    }

    #[test]
    fn json_roundtrip() {
        let config = EngineConfig {
            rate: RateControl::Cbr(2_000_000),
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn load_from_file_by_extension() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(toml_file, "event_poll_ms = 20").unwrap();
        let config = EngineConfig::from_file(toml_file.path()).unwrap();
        assert_eq!(config.event_poll_interval(), Duration::from_millis(20));

        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json_file, "{{\"probe_timeout_ms\": 250}}").unwrap();
        let config = EngineConfig::from_file(json_file.path()).unwrap();
        assert_eq!(config.probe_timeout_ms, 250);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::from_file("/nonexistent/venc.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
