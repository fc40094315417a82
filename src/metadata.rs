//! Capture sidecar metadata.
//!
//! Every capture file is accompanied by a JSON sidecar that records
//! when the capture was taken, at what sample rate, which channels are
//! present in the file and a snapshot of the hardware configuration.

use crate::bram::ConfigSnapshot;
use crate::error::{Error, Result};
use crate::frame::ChannelSet;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata saved alongside a capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// ISO 8601 timestamp of the capture start.
    pub timestamp: String,
    /// Sample rate in samples per second.
    pub sample_rate: u64,
    /// Channels present in the file, 1-indexed ascending.
    pub channels: Vec<u8>,
    /// Snapshot of the hardware configuration, if available.
    pub config: Option<ConfigSnapshot>,
}

impl CaptureMetadata {
    /// Creates metadata for a capture starting now.
    pub fn new(
        sample_rate: u64,
        channels: &ChannelSet,
        config: Option<ConfigSnapshot>,
    ) -> CaptureMetadata {
        CaptureMetadata {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            sample_rate,
            channels: channels.to_list(),
            config,
        }
    }

    /// The sidecar path for a capture file: the `.bin` extension
    /// replaced by `.json` (or `.json` appended).
    pub fn sidecar_path(capture: &Path) -> PathBuf {
        capture.with_extension("json")
    }

    /// Renders the metadata as pretty-printed JSON.
    pub fn to_json(&self) -> String {
        let mut s = serde_json::to_string_pretty(self).expect("metadata serializes");
        s.push('\n');
        s
    }

    /// Writes the sidecar next to the given capture file.
    pub fn write_sidecar(&self, capture: &Path) -> Result<()> {
        let path = Self::sidecar_path(capture);
        std::fs::write(&path, self.to_json())
            .map_err(|e| Error::device_io(format!("write sidecar {}", path.display()), e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bram::Filter;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            ddc0_freq_mhz: 125,
            ddc1_freq_mhz: 1,
            ddc2_freq_mhz: 1,
            ddc0_enabled: true,
            ddc1_enabled: false,
            ddc2_enabled: false,
            attenuation_db: 15,
            filter: Filter::Lp500Mhz,
            calibration_mode: false,
            system_enable: true,
        }
    }

    #[test]
    fn sidecar_json_has_documented_fields() {
        let channels = ChannelSet::from_list(&[1, 3, 5]).unwrap();
        let meta = CaptureMetadata::new(244_400_000, &channels, Some(snapshot()));
        let json: serde_json::Value = serde_json::from_str(&meta.to_json()).unwrap();
        assert_eq!(json["sample_rate"], 244_400_000u64);
        assert_eq!(json["channels"], serde_json::json!([1, 3, 5]));
        assert_eq!(json["config"]["ddc0_freq_mhz"], 125);
        assert_eq!(json["config"]["attenuation_db"], 15);
        assert_eq!(json["config"]["filter"], "500mhz");
        assert_eq!(json["config"]["calibration_mode"], false);
        assert_eq!(json["config"]["system_enable"], true);
        // RFC 3339 timestamp, UTC.
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn sidecar_path_replaces_extension() {
        assert_eq!(
            CaptureMetadata::sidecar_path(Path::new("data/capture_01.bin")),
            Path::new("data/capture_01.json")
        );
        assert_eq!(
            CaptureMetadata::sidecar_path(Path::new("capture")),
            Path::new("capture.json")
        );
    }

    #[test]
    fn sidecar_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("run.bin");
        let meta = CaptureMetadata::new(244_400_000, &ChannelSet::default(), None);
        meta.write_sidecar(&capture).unwrap();
        let read: CaptureMetadata =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("run.json")).unwrap())
                .unwrap();
        assert_eq!(read, meta);
    }
}
