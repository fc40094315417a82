//! Structured events exposed to upper layers.
//!
//! The core does not talk to clients directly; it publishes structured
//! messages on a broadcast channel that a façade (HTTP, WebSocket,
//! logging) can subscribe to and forward. Events serialize to JSON
//! with a `type` tag.

use crate::bram::Filter;
use serde::Serialize;

/// A structured message published by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A recording started or finished.
    RecordingStatus {
        /// Whether a recording is now in progress.
        recording: bool,
        /// Output filename.
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        /// Total samples requested.
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        /// Whether the recording ran to completion; absent while
        /// starting.
        #[serde(skip_serializing_if = "Option::is_none")]
        finished: Option<bool>,
        /// Error message if the recording ended abnormally.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Periodic progress of an in-flight recording.
    RecordingProgress {
        /// Samples captured so far.
        current: u64,
        /// Total samples requested.
        total: u64,
    },
    /// Observed DMA throughput, reported every couple of seconds.
    DataRate {
        /// Published bytes per second in GB/s.
        gbps: f64,
        /// Total GB published since the producer started.
        total_gb: f64,
        /// Current ring head.
        head: u64,
    },
    /// A DDC mixer frequency changed.
    DdcFreqUpdate {
        /// DDC index (0..=2).
        ddc_index: usize,
        /// Achieved frequency in real-world MHz.
        freq_mhz: i64,
    },
    /// A DDC was enabled or disabled.
    DdcEnableUpdate {
        /// DDC index (0..=2).
        ddc_index: usize,
        /// New enable state.
        enabled: bool,
    },
    /// The front-end attenuation changed.
    AttenuationUpdate {
        /// New attenuation in dB.
        attenuation_db: u32,
    },
    /// The front-end filter selection changed.
    FilterUpdate {
        /// Newly selected filter.
        filter: Filter,
    },
    /// Calibration mode was toggled.
    CalibrationUpdate {
        /// New calibration state.
        enabled: bool,
    },
    /// The system enable changed.
    SystemEnableUpdate {
        /// New system enable state.
        enabled: bool,
    },
}
