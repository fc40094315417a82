//! BRAM parameter controller for the digitiser FPGA.
//!
//! The FPGA exposes its runtime parameters through a block-RAM region
//! programmed by the host over the control device. The host keeps the
//! authoritative shadow of every parameter value and negotiates schema
//! initialisation and per-parameter updates with the gateware through
//! bit flags in a single 32-bit status register. Both negotiations are
//! explicit state machines whose transitions are a read-modify-write
//! of the status word followed by a bounded poll; the controller never
//! OR-assigns without reading first and serialises every handshake
//! under one internal lock, so concurrent updates are totally ordered.

use crate::control::ControlPort;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Start-of-region token, also used as the end-of-header token.
pub const START_TOKEN: u32 = 0xDEAD_BEEF;
/// Word offset of the start token.
pub const START_TOKEN_ADDR: usize = 0x00;
/// Word offset of the status register.
pub const STATUS_ADDR: usize = 0x01;
/// Schema version written at [`SCHEMA_VERSION_ADDR`].
pub const SCHEMA_VERSION: u32 = 0x01;
/// Word offset of the schema version.
pub const SCHEMA_VERSION_ADDR: usize = 0x02;
/// Word offset of the host timestamp.
pub const HOST_TIMESTAMP_ADDR: usize = 0x03;
/// Word offset of the device timestamp. Device-owned; never written
/// by the host.
pub const DEVICE_TIMESTAMP_ADDR: usize = 0x04;
/// Word offset of the parameter count.
pub const NUM_PARAMS_ADDR: usize = 0x05;
/// Word offset of the end-of-header token.
pub const END_HEADER_ADDR: usize = 0x06;
/// Token opening each parameter entry.
pub const PARAM_START_TOKEN: u32 = 0xCCCC_CCCC;
/// Separator between the fixed fields and the name words of an entry.
pub const KEY_VAL_SEP: u32 = 0xBBBB_BBBB;
/// Token closing each parameter entry.
pub const PARAM_END: u32 = 0xEEEE_EEEE;
/// Marker after the last parameter entry.
pub const LAST_PARAM: u32 = 0xABAB_ABAB;
/// Final token of the region.
pub const END_TOKEN: u32 = 0xEEEE_EEEE;
/// Word offset, within an entry, of the value relative to the entry id.
const VALUE_OFFSET: u32 = 3;

/// Host requests a parameter change (host-owned).
pub const HOST_PARAM_CHANGE: u32 = 1 << 31;
/// Device acknowledges a parameter change (device-owned).
pub const PARAM_CHANGE_ACK: u32 = 1 << 30;
/// Host signals the re-programmed table is ready (host-owned).
pub const PARAM_CHANGE_DONE: u32 = 1 << 29;
/// Device parameter-change status (device-owned).
pub const PARAM_CHANGE_STAT: u32 = 1 << 28;
/// Device requests schema initialisation (device-owned).
pub const BRAM_SETUP_REQUEST: u32 = 1 << 27;
/// Host signals schema programming complete (host-owned).
pub const HOST_SETUP_DONE: u32 = 1 << 26;
/// Device schema return flag (device-owned).
pub const BRAM_SCHEMA_RETURN: u32 = 1 << 25;
/// Device schema valid flag (device-owned).
pub const BRAM_SCHEMA_VALID: u32 = 1 << 24;
/// Host independent-operation request (host-owned).
pub const HOST_IND_OP_REQUEST: u32 = 1 << 23;
/// Device independent-operation acknowledge (device-owned).
pub const IND_OP_ACK: u32 = 1 << 22;
/// Device independent-operation online flag (device-owned).
pub const IND_OP_ONLINE: u32 = 1 << 21;

/// Nominal FPGA design-time clock in MHz. The ratio of this clock to
/// the operator-selected instantaneous bandwidth scales all
/// frequency-like parameters.
pub const DESIGN_CLOCK_MHZ: f64 = 250.0;

/// How long the schema-setup acknowledge pulse is held high.
const SETUP_ACK_PULSE: Duration = Duration::from_millis(50);
/// Default bound on each handshake poll.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Sleep between status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Identifier of an FPGA runtime parameter.
///
/// The set is fixed at build time; the discriminant doubles as the
/// parameter's index in the BRAM table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum ParamId {
    Ch0En,
    Ch1En,
    Ch2En,
    Ch3En,
    Ch4En,
    Ch5En,
    Ch6En,
    Ch7En,
    Ddc0En,
    Ddc1En,
    Ddc2En,
    Ddc0Fmix,
    Ddc0Sfout,
    Ddc1Fmix,
    Ddc1Sfout,
    Ddc2Fmix,
    Ddc2Sfout,
    Lp500MhzEn,
    Lp1GhzEn,
    Lp2GhzEn,
    BypassEn,
    AttenuationBval,
    SystemEn,
    CalEn,
}

/// Number of parameters in the table.
pub const NUM_PARAMS: usize = 24;

/// The static parameter table: id, BRAM name, default value.
pub const PARAM_TABLE: [(ParamId, &str, u32); NUM_PARAMS] = [
    (ParamId::Ch0En, "CH0_EN", 0),
    (ParamId::Ch1En, "CH1_EN", 0),
    (ParamId::Ch2En, "CH2_EN", 0),
    (ParamId::Ch3En, "CH3_EN", 0),
    (ParamId::Ch4En, "CH4_EN", 0),
    (ParamId::Ch5En, "CH5_EN", 0),
    (ParamId::Ch6En, "CH6_EN", 0),
    (ParamId::Ch7En, "CH7_EN", 0),
    (ParamId::Ddc0En, "DDC0_EN", 0),
    (ParamId::Ddc1En, "DDC1_EN", 0),
    (ParamId::Ddc2En, "DDC2_EN", 0),
    (ParamId::Ddc0Fmix, "DDC0_FMIX", 10),
    (ParamId::Ddc0Sfout, "DDC0_SFOUT", 1),
    (ParamId::Ddc1Fmix, "DDC1_FMIX", 1),
    (ParamId::Ddc1Sfout, "DDC1_SFOUT", 1),
    (ParamId::Ddc2Fmix, "DDC2_FMIX", 1),
    (ParamId::Ddc2Sfout, "DDC2_SFOUT", 1),
    (ParamId::Lp500MhzEn, "LP500MHZ_EN", 1),
    (ParamId::Lp1GhzEn, "LP1GHZ_EN", 0),
    (ParamId::Lp2GhzEn, "LP2GHZ_EN", 0),
    (ParamId::BypassEn, "BYPASS_EN", 0),
    (ParamId::AttenuationBval, "ATTENUATION_BVAL", 0),
    (ParamId::SystemEn, "SYSTEM_EN", 1),
    (ParamId::CalEn, "CAL_EN", 0),
];

impl ParamId {
    /// The parameter's index in the BRAM table.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The parameter's ASCII name as written into the BRAM.
    pub fn name(self) -> &'static str {
        PARAM_TABLE[self.index()].1
    }
}

/// Analog front-end filter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// 500 MHz low-pass filter.
    #[serde(rename = "500mhz")]
    Lp500Mhz,
    /// 1 GHz low-pass filter.
    #[serde(rename = "1ghz")]
    Lp1Ghz,
    /// 2 GHz low-pass filter.
    #[serde(rename = "2ghz")]
    Lp2Ghz,
    /// Filter bypass path.
    #[serde(rename = "bypass")]
    Bypass,
    /// No single filter enable is set; only reported, never selected.
    #[serde(rename = "unknown")]
    Unknown,
}

impl std::str::FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Filter> {
        match s {
            "500mhz" => Ok(Filter::Lp500Mhz),
            "1ghz" => Ok(Filter::Lp1Ghz),
            "2ghz" => Ok(Filter::Lp2Ghz),
            "bypass" => Ok(Filter::Bypass),
            other => Err(Error::invalid_argument(format!(
                "unknown filter {other:?} (expected 500mhz, 1ghz, 2ghz or bypass)"
            ))),
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Filter::Lp500Mhz => "500mhz",
            Filter::Lp1Ghz => "1ghz",
            Filter::Lp2Ghz => "2ghz",
            Filter::Bypass => "bypass",
            Filter::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl Filter {
    fn enable_param(self) -> Option<ParamId> {
        match self {
            Filter::Lp500Mhz => Some(ParamId::Lp500MhzEn),
            Filter::Lp1Ghz => Some(ParamId::Lp1GhzEn),
            Filter::Lp2Ghz => Some(ParamId::Lp2GhzEn),
            Filter::Bypass => Some(ParamId::BypassEn),
            Filter::Unknown => None,
        }
    }
}

/// A partial hardware configuration.
///
/// Every field is optional; applying a configuration performs the
/// appropriate handshakes for the fields that are present and leaves
/// the rest of the shadow untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// DDC0 mixer frequency in real-world MHz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddc0_freq_mhz: Option<f64>,
    /// DDC1 mixer frequency in real-world MHz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddc1_freq_mhz: Option<f64>,
    /// DDC2 mixer frequency in real-world MHz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddc2_freq_mhz: Option<f64>,
    /// DDC0 enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddc0_enabled: Option<bool>,
    /// DDC1 enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddc1_enabled: Option<bool>,
    /// DDC2 enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddc2_enabled: Option<bool>,
    /// Front-end attenuation in dB (0..=31).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attenuation_db: Option<u32>,
    /// Filter selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Calibration mode enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration_mode: Option<bool>,
    /// System enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_enable: Option<bool>,
}

/// A snapshot of the current hardware configuration, with frequencies
/// reverse-scaled to real-world MHz. Recorded in capture sidecars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// DDC0 mixer frequency in real-world MHz.
    pub ddc0_freq_mhz: i64,
    /// DDC1 mixer frequency in real-world MHz.
    pub ddc1_freq_mhz: i64,
    /// DDC2 mixer frequency in real-world MHz.
    pub ddc2_freq_mhz: i64,
    /// DDC0 enable.
    pub ddc0_enabled: bool,
    /// DDC1 enable.
    pub ddc1_enabled: bool,
    /// DDC2 enable.
    pub ddc2_enabled: bool,
    /// Front-end attenuation in dB.
    pub attenuation_db: u32,
    /// Active filter, or [`Filter::Unknown`] if no enable is set.
    pub filter: Filter,
    /// Calibration mode enable.
    pub calibration_mode: bool,
    /// System enable.
    pub system_enable: bool,
}

/// Packs an ASCII name into little-endian 32-bit words, zero-padded to
/// a 4-byte boundary.
pub fn pack_name(name: &str) -> Vec<u32> {
    name.as_bytes()
        .chunks(4)
        .map(|chunk| {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(bytes)
        })
        .collect()
}

/// Decodes a name packed by [`pack_name`], stopping at the first NUL.
pub fn unpack_name(words: &[u32]) -> String {
    words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .take_while(|&b| b != 0)
        .map(char::from)
        .collect()
}

/// Schema-setup state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupState {
    Idle,
    SetupRequested,
    Programming,
    AckPulseHigh,
    AckPulseLow,
    Ready,
}

/// Per-parameter update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateState {
    RequestChange,
    AwaitAck,
    ClearRequest,
    Reprogram,
    PublishIndex,
    SignalDone,
    AwaitAckClear,
    ClearDone,
    Done,
}

struct Inner {
    port: Box<dyn ControlPort>,
    values: [u32; NUM_PARAMS],
}

/// Controller for the FPGA parameter BRAM.
///
/// Owns the control-device port and the host-side parameter shadow.
/// All operations are blocking (status polls sleep in 1 ms steps) and
/// should be driven from a blocking context.
pub struct BramController {
    inner: Mutex<Inner>,
    ibw_mhz: f64,
    ack_timeout: Duration,
}

impl std::fmt::Debug for BramController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BramController")
            .field("ibw_mhz", &self.ibw_mhz)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

impl BramController {
    /// Creates a controller over the given port.
    ///
    /// `ibw_mhz` is the operator-selected instantaneous bandwidth used
    /// to scale frequency-like parameters against the design clock.
    /// The shadow is initialised from the table defaults.
    pub fn new(port: Box<dyn ControlPort>, ibw_mhz: f64) -> BramController {
        let mut values = [0u32; NUM_PARAMS];
        for (i, &(_, _, default)) in PARAM_TABLE.iter().enumerate() {
            values[i] = default;
        }
        BramController {
            inner: Mutex::new(Inner { port, values }),
            ibw_mhz,
            ack_timeout: ACK_TIMEOUT,
        }
    }

    /// Overrides the handshake acknowledge timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> BramController {
        self.ack_timeout = timeout;
        self
    }

    /// Current shadow value of a parameter.
    pub fn parameter(&self, id: ParamId) -> u32 {
        self.inner.lock().unwrap().values[id.index()]
    }

    /// Reads the raw status register.
    pub fn status(&self) -> Result<u32> {
        self.inner.lock().unwrap().port.read_word(STATUS_ADDR)
    }

    /// Programs the schema if the device is requesting it.
    ///
    /// Runs the schema-setup state machine: when [`BRAM_SETUP_REQUEST`]
    /// is observed the whole parameter table is written, then
    /// [`HOST_SETUP_DONE`] is pulsed high for 50 ms. Returns `true` if
    /// programming happened, `false` if the device was not requesting
    /// setup. The machine re-arms: calling again after the device
    /// raises the request bit re-runs the sequence.
    pub fn setup_schema(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let mut state = SetupState::Idle;
        loop {
            state = match state {
                SetupState::Idle => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    if status & BRAM_SETUP_REQUEST == 0 {
                        return Ok(false);
                    }
                    SetupState::SetupRequested
                }
                SetupState::SetupRequested => {
                    tracing::info!("BRAM setup requested, programming parameter table");
                    SetupState::Programming
                }
                SetupState::Programming => {
                    Self::program_table(&mut inner)?;
                    SetupState::AckPulseHigh
                }
                SetupState::AckPulseHigh => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    inner
                        .port
                        .write_word(STATUS_ADDR, status | HOST_SETUP_DONE)?;
                    std::thread::sleep(SETUP_ACK_PULSE);
                    SetupState::AckPulseLow
                }
                SetupState::AckPulseLow => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    inner
                        .port
                        .write_word(STATUS_ADDR, status & !HOST_SETUP_DONE)?;
                    SetupState::Ready
                }
                SetupState::Ready => {
                    tracing::info!("BRAM schema ready");
                    return Ok(true);
                }
            };
        }
    }

    /// Updates a parameter's shadow value and runs the full change
    /// handshake with the device.
    ///
    /// The handshake is run even when the value is unchanged. On
    /// [`Error::HandshakeTimeout`] the shadow keeps the requested
    /// value; the caller is warned that the device may be
    /// inconsistent.
    pub fn update_parameter(&self, id: ParamId, value: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let index = id.index();
        inner.values[index] = value;
        tracing::debug!(param = id.name(), value, index, "updating BRAM parameter");
        self.handshake(&mut inner, index)
    }

    fn handshake(&self, inner: &mut Inner, index: usize) -> Result<()> {
        let mut state = UpdateState::RequestChange;
        loop {
            state = match state {
                UpdateState::RequestChange => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    inner
                        .port
                        .write_word(STATUS_ADDR, status | HOST_PARAM_CHANGE)?;
                    UpdateState::AwaitAck
                }
                UpdateState::AwaitAck => {
                    Self::wait_status(
                        &mut *inner.port,
                        PARAM_CHANGE_ACK,
                        true,
                        "param change ack",
                        self.ack_timeout,
                    )?;
                    UpdateState::ClearRequest
                }
                UpdateState::ClearRequest => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    inner
                        .port
                        .write_word(STATUS_ADDR, status & !HOST_PARAM_CHANGE)?;
                    UpdateState::Reprogram
                }
                UpdateState::Reprogram => {
                    Self::program_table(inner)?;
                    UpdateState::PublishIndex
                }
                UpdateState::PublishIndex => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    let status = (status & 0xFFFF_0000) | (index as u32 & 0xFFFF);
                    inner.port.write_word(STATUS_ADDR, status)?;
                    UpdateState::SignalDone
                }
                UpdateState::SignalDone => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    inner
                        .port
                        .write_word(STATUS_ADDR, status | PARAM_CHANGE_DONE)?;
                    UpdateState::AwaitAckClear
                }
                UpdateState::AwaitAckClear => {
                    Self::wait_status(
                        &mut *inner.port,
                        PARAM_CHANGE_ACK,
                        false,
                        "param change done",
                        self.ack_timeout,
                    )?;
                    UpdateState::ClearDone
                }
                UpdateState::ClearDone => {
                    let status = inner.port.read_word(STATUS_ADDR)?;
                    inner
                        .port
                        .write_word(STATUS_ADDR, status & !PARAM_CHANGE_DONE)?;
                    UpdateState::Done
                }
                UpdateState::Done => return Ok(()),
            };
        }
    }

    fn wait_status(
        port: &mut dyn ControlPort,
        mask: u32,
        set: bool,
        step: &'static str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = port.read_word(STATUS_ADDR)?;
            if ((status & mask) != 0) == set {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout { step, timeout });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Writes the header, the full parameter table and the trailer.
    fn program_table(inner: &mut Inner) -> Result<()> {
        let port = &mut inner.port;
        port.write_word(START_TOKEN_ADDR, START_TOKEN)?;
        port.write_word(SCHEMA_VERSION_ADDR, SCHEMA_VERSION)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        port.write_word(HOST_TIMESTAMP_ADDR, now)?;
        port.write_word(NUM_PARAMS_ADDR, NUM_PARAMS as u32)?;
        port.write_word(END_HEADER_ADDR, START_TOKEN)?;

        let mut addr = END_HEADER_ADDR + 1;
        for (index, &(_, name, _)) in PARAM_TABLE.iter().enumerate() {
            let value = inner.values[index];
            port.write_word(addr, PARAM_START_TOKEN)?;
            port.write_word(addr + 1, index as u32)?;
            port.write_word(addr + 2, name.len() as u32)?;
            port.write_word(addr + 3, VALUE_OFFSET)?;
            port.write_word(addr + 4, value)?;
            port.write_word(addr + 5, KEY_VAL_SEP)?;
            addr += 6;
            for word in pack_name(name) {
                port.write_word(addr, word)?;
                addr += 1;
            }
            port.write_word(addr, PARAM_END)?;
            addr += 1;
        }
        port.write_word(addr, LAST_PARAM)?;
        port.write_word(addr + 1, END_TOKEN)?;
        Ok(())
    }

    fn fmix_param(ddc_index: usize) -> Result<ParamId> {
        match ddc_index {
            0 => Ok(ParamId::Ddc0Fmix),
            1 => Ok(ParamId::Ddc1Fmix),
            2 => Ok(ParamId::Ddc2Fmix),
            other => Err(Error::invalid_argument(format!(
                "DDC index {other} outside 0..=2"
            ))),
        }
    }

    fn enable_param(ddc_index: usize) -> Result<ParamId> {
        match ddc_index {
            0 => Ok(ParamId::Ddc0En),
            1 => Ok(ParamId::Ddc1En),
            2 => Ok(ParamId::Ddc2En),
            other => Err(Error::invalid_argument(format!(
                "DDC index {other} outside 0..=2"
            ))),
        }
    }

    fn scale_to_hw(&self, freq_mhz: f64) -> i32 {
        (freq_mhz * DESIGN_CLOCK_MHZ / self.ibw_mhz).round() as i32
    }

    fn scale_from_hw(&self, hw: i32) -> f64 {
        (f64::from(hw) * self.ibw_mhz / DESIGN_CLOCK_MHZ).round()
    }

    /// Sets a DDC mixer frequency from a real-world MHz value.
    ///
    /// The value is scaled by `design_clock / actual_ibw` and rounded
    /// to the nearest integer before the handshake. Returns the
    /// achieved frequency in real-world MHz after reverse scaling.
    pub fn set_ddc_frequency_mhz(&self, ddc_index: usize, freq_mhz: f64) -> Result<f64> {
        let id = Self::fmix_param(ddc_index)?;
        let hw = self.scale_to_hw(freq_mhz);
        self.update_parameter(id, hw as u32)?;
        Ok(self.scale_from_hw(hw))
    }

    /// Reads back a DDC mixer frequency in real-world MHz.
    pub fn ddc_frequency_mhz(&self, ddc_index: usize) -> Result<f64> {
        let id = Self::fmix_param(ddc_index)?;
        Ok(self.scale_from_hw(self.parameter(id) as i32))
    }

    /// Enables or disables a DDC.
    pub fn set_ddc_enable(&self, ddc_index: usize, enabled: bool) -> Result<()> {
        self.update_parameter(Self::enable_param(ddc_index)?, enabled.into())
    }

    /// Sets the front-end attenuation; valid range is 0..=31 dB.
    pub fn set_attenuation_db(&self, db: u32) -> Result<()> {
        if db > 31 {
            return Err(Error::invalid_argument(format!(
                "attenuation {db} dB outside 0..=31"
            )));
        }
        self.update_parameter(ParamId::AttenuationBval, db)
    }

    /// Selects a front-end filter.
    ///
    /// Filter enables are mutually exclusive: all four are cleared and
    /// then the chosen one is set, each step running the full
    /// handshake.
    pub fn select_filter(&self, filter: Filter) -> Result<()> {
        let chosen = filter
            .enable_param()
            .ok_or_else(|| Error::invalid_argument("cannot select filter \"unknown\""))?;
        for id in [
            ParamId::Lp500MhzEn,
            ParamId::Lp1GhzEn,
            ParamId::Lp2GhzEn,
            ParamId::BypassEn,
        ] {
            self.update_parameter(id, 0)?;
        }
        self.update_parameter(chosen, 1)
    }

    /// Enables or disables calibration mode.
    pub fn set_calibration(&self, enabled: bool) -> Result<()> {
        self.update_parameter(ParamId::CalEn, enabled.into())
    }

    /// Enables or disables the system.
    pub fn set_system_enable(&self, enabled: bool) -> Result<()> {
        self.update_parameter(ParamId::SystemEn, enabled.into())
    }

    /// Applies a partial configuration, performing the appropriate
    /// update handshakes for every field that is present.
    pub fn apply_config(&self, config: &HardwareConfig) -> Result<()> {
        for (ddc, freq) in [
            (0, config.ddc0_freq_mhz),
            (1, config.ddc1_freq_mhz),
            (2, config.ddc2_freq_mhz),
        ] {
            if let Some(freq) = freq {
                self.set_ddc_frequency_mhz(ddc, freq)?;
            }
        }
        for (ddc, enabled) in [
            (0, config.ddc0_enabled),
            (1, config.ddc1_enabled),
            (2, config.ddc2_enabled),
        ] {
            if let Some(enabled) = enabled {
                self.set_ddc_enable(ddc, enabled)?;
            }
        }
        if let Some(db) = config.attenuation_db {
            self.set_attenuation_db(db)?;
        }
        if let Some(filter) = config.filter {
            self.select_filter(filter)?;
        }
        if let Some(enabled) = config.calibration_mode {
            self.set_calibration(enabled)?;
        }
        if let Some(enabled) = config.system_enable {
            self.set_system_enable(enabled)?;
        }
        Ok(())
    }

    /// Snapshot of the current configuration for sidecar metadata.
    pub fn config_snapshot(&self) -> ConfigSnapshot {
        let values = self.inner.lock().unwrap().values;
        let value = |id: ParamId| values[id.index()];
        let freq = |id: ParamId| self.scale_from_hw(value(id) as i32) as i64;
        let filter = if value(ParamId::Lp500MhzEn) == 1 {
            Filter::Lp500Mhz
        } else if value(ParamId::Lp1GhzEn) == 1 {
            Filter::Lp1Ghz
        } else if value(ParamId::Lp2GhzEn) == 1 {
            Filter::Lp2Ghz
        } else if value(ParamId::BypassEn) == 1 {
            Filter::Bypass
        } else {
            Filter::Unknown
        };
        ConfigSnapshot {
            ddc0_freq_mhz: freq(ParamId::Ddc0Fmix),
            ddc1_freq_mhz: freq(ParamId::Ddc1Fmix),
            ddc2_freq_mhz: freq(ParamId::Ddc2Fmix),
            ddc0_enabled: value(ParamId::Ddc0En) == 1,
            ddc1_enabled: value(ParamId::Ddc1En) == 1,
            ddc2_enabled: value(ParamId::Ddc2En) == 1,
            attenuation_db: value(ParamId::AttenuationBval),
            filter,
            calibration_mode: value(ParamId::CalEn) == 1,
            system_enable: value(ParamId::SystemEn) == 1,
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A mock FPGA implementing the device side of the handshakes.

    use super::*;
    use std::sync::{Arc, Mutex};

    pub(crate) struct MockState {
        pub words: Vec<u32>,
        pub auto_ack: bool,
        pub param_changes: u32,
    }

    /// Cloneable mock control port; clones share the register file so
    /// tests can inspect the device after handing the port to a
    /// controller.
    #[derive(Clone)]
    pub(crate) struct MockFpga {
        state: Arc<Mutex<MockState>>,
    }

    impl MockFpga {
        pub fn new() -> MockFpga {
            MockFpga {
                state: Arc::new(Mutex::new(MockState {
                    words: vec![0u32; 4096],
                    auto_ack: true,
                    param_changes: 0,
                })),
            }
        }

        pub fn with_status(status: u32) -> MockFpga {
            let mock = MockFpga::new();
            mock.state.lock().unwrap().words[STATUS_ADDR] = status;
            mock
        }

        pub fn set_auto_ack(&self, auto_ack: bool) {
            self.state.lock().unwrap().auto_ack = auto_ack;
        }

        pub fn word(&self, word: usize) -> u32 {
            self.state.lock().unwrap().words[word]
        }

        pub fn words(&self, range: std::ops::Range<usize>) -> Vec<u32> {
            self.state.lock().unwrap().words[range].to_vec()
        }

        pub fn param_changes(&self) -> u32 {
            self.state.lock().unwrap().param_changes
        }
    }

    impl ControlPort for MockFpga {
        fn read_word(&mut self, word: usize) -> Result<u32> {
            Ok(self.state.lock().unwrap().words[word])
        }

        fn write_word(&mut self, word: usize, value: u32) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.words[word] = value;
            if word == STATUS_ADDR && state.auto_ack {
                if value & HOST_PARAM_CHANGE != 0 {
                    state.words[STATUS_ADDR] |= PARAM_CHANGE_ACK;
                    state.param_changes += 1;
                }
                if value & PARAM_CHANGE_DONE != 0 {
                    state.words[STATUS_ADDR] &= !PARAM_CHANGE_ACK;
                }
            }
            Ok(())
        }
    }
}
