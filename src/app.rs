//! qcapture application.
//!
//! This module contains a top-level structure [`App`] that represents
//! the long-running acquisition daemon and a structure [`AppState`]
//! that holds the shared state: the BRAM controller, the capture
//! coordinator and the upward event channel. Control operations live
//! on [`AppState`] so that a façade (HTTP, WebSocket) can borrow the
//! state and drive the hardware while the DMA producer and the schema
//! watcher run concurrently.

use crate::{
    args::{Args, CaptureArgs, RunArgs},
    bram::{BramController, ConfigSnapshot, Filter, HardwareConfig},
    capture::{
        parse_size, CaptureCoordinator, CaptureReport, CaptureRequest, Quota, SourceConfig,
    },
    control::UserDevice,
    error::Error,
    event::Event,
    frame::ChannelSet,
    producer::DmaProducer,
    ring::{self, RingBuffer},
};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How often the schema watcher polls for a device setup request.
const SCHEMA_POLL: Duration = Duration::from_secs(1);

/// qcapture acquisition daemon.
///
/// Owns the DMA producer and the shared state, and runs them
/// concurrently until one fails or an interrupt arrives.
#[derive(Debug)]
pub struct App {
    state: AppState,
    producer: DmaProducer,
    ring_name: String,
}

impl App {
    /// Creates the daemon: a fresh ring buffer, the DMA producer, the
    /// BRAM controller (unless `--no-hardware`) and the capture
    /// coordinator.
    #[tracing::instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(args: &Args, run: &RunArgs) -> Result<App> {
        let (events, _) = broadcast::channel(16);
        let cancel = CancellationToken::new();

        let bram = open_controller(args);
        if let Some(bram) = &bram {
            let bram = Arc::clone(bram);
            if let Err(e) = tokio::task::spawn_blocking(move || bram.setup_schema()).await? {
                tracing::warn!(error = %e, "BRAM setup failed at startup");
            }
        }

        // Fresh ring semantics: drop any stale object before creating.
        RingBuffer::remove(&args.ring_name)?;
        let payload = run
            .ring_gb
            .checked_mul(1024 * 1024 * 1024)
            .context("ring size overflows")?;
        let ring = RingBuffer::create(&args.ring_name, payload)?;

        let source = if run.record_from_ring {
            SourceConfig::Ring(ring::shm_path(&args.ring_name))
        } else {
            SourceConfig::Device(args.device.clone())
        };
        let coordinator = CaptureCoordinator::new(source, events.clone());
        // Direct-device recordings take the device exclusively, so the
        // producer must yield while the recording flag is set.
        // Ring-sourced recordings consume from this producer instead,
        // which must keep the device and keep publishing.
        let producer_yield = if run.record_from_ring {
            Arc::new(std::sync::atomic::AtomicBool::new(false))
        } else {
            coordinator.recording_flag()
        };
        let producer = DmaProducer::new(
            ring,
            args.device.clone(),
            run.block_size,
            producer_yield,
            cancel.clone(),
            events.clone(),
        )?;

        let state = AppState::new(bram, coordinator, events, cancel);
        Ok(App {
            state,
            producer,
            ring_name: args.ring_name.clone(),
        })
    }

    /// The shared application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Runs the daemon.
    ///
    /// Returns when the producer fails, the schema watcher fails, or
    /// an interrupt is received. The ring object is removed on the way
    /// out.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<()> {
        let producer = self.producer;
        let producer = tokio::task::spawn_blocking(move || producer.run());
        let ret = tokio::select! {
            ret = producer => match ret {
                Ok(ret) => ret.map_err(anyhow::Error::from),
                Err(join) => Err(join.into()),
            },
            ret = Self::run_schema_watcher(self.state.clone()) => ret,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                Ok(())
            }
        };
        self.state.cancel().cancel();
        RingBuffer::remove(&self.ring_name)?;
        ret
    }

    /// Polls the status register for a schema setup request and
    /// re-runs the setup sequence whenever the device raises it.
    async fn run_schema_watcher(state: AppState) -> Result<()> {
        let Some(bram) = state.bram().cloned() else {
            // No hardware: nothing to watch, but don't end the app.
            return std::future::pending().await;
        };
        let mut interval = tokio::time::interval(SCHEMA_POLL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let bram = Arc::clone(&bram);
            if let Err(e) = tokio::task::spawn_blocking(move || bram.setup_schema()).await? {
                tracing::warn!(error = %e, "BRAM schema watcher");
            }
        }
    }
}

fn open_controller(args: &Args) -> Option<Arc<BramController>> {
    if args.no_hardware {
        return None;
    }
    match UserDevice::open(&args.control_device) {
        Ok(device) => Some(Arc::new(BramController::new(
            Box::new(device),
            args.ibw_mhz,
        ))),
        Err(e) => {
            tracing::warn!(
                device = %args.control_device.display(),
                error = %e,
                "hardware unavailable, parameter control disabled"
            );
            None
        }
    }
}

/// Shared application state.
///
/// Behaves as an `Arc<...>`: it is cheaply clonable and clones
/// represent a reference to the same shared object. Control operations
/// update the BRAM shadow through the full handshake and publish the
/// corresponding event.
#[derive(Debug, Clone)]
pub struct AppState(Arc<State>);

#[derive(Debug)]
struct State {
    bram: Option<Arc<BramController>>,
    coordinator: CaptureCoordinator,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
    recording_cancel: Mutex<Option<CancellationToken>>,
}

impl AppState {
    /// Assembles the shared state. `bram` is `None` when running
    /// without the control device.
    pub fn new(
        bram: Option<Arc<BramController>>,
        coordinator: CaptureCoordinator,
        events: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> AppState {
        AppState(Arc::new(State {
            bram,
            coordinator,
            events,
            cancel,
            recording_cancel: Mutex::new(None),
        }))
    }

    /// The BRAM controller, if the hardware is available.
    pub fn bram(&self) -> Option<&Arc<BramController>> {
        self.0.bram.as_ref()
    }

    /// The capture coordinator.
    pub fn coordinator(&self) -> &CaptureCoordinator {
        &self.0.coordinator
    }

    /// The upward event channel.
    pub fn events(&self) -> &broadcast::Sender<Event> {
        &self.0.events
    }

    /// Subscribes to the upward event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.0.events.subscribe()
    }

    /// The application-wide cancellation token.
    pub fn cancel(&self) -> &CancellationToken {
        &self.0.cancel
    }

    fn bram_required(&self) -> Result<&Arc<BramController>> {
        self.bram()
            .ok_or_else(|| anyhow::anyhow!("hardware unavailable"))
    }

    /// Sets a DDC mixer frequency in real-world MHz and returns the
    /// achieved value.
    pub fn set_ddc_frequency(&self, ddc_index: usize, freq_mhz: f64) -> Result<i64> {
        let achieved = self
            .bram_required()?
            .set_ddc_frequency_mhz(ddc_index, freq_mhz)? as i64;
        let _ = self.0.events.send(Event::DdcFreqUpdate {
            ddc_index,
            freq_mhz: achieved,
        });
        Ok(achieved)
    }

    /// Enables or disables a DDC.
    pub fn set_ddc_enable(&self, ddc_index: usize, enabled: bool) -> Result<()> {
        self.bram_required()?.set_ddc_enable(ddc_index, enabled)?;
        let _ = self.0.events.send(Event::DdcEnableUpdate { ddc_index, enabled });
        Ok(())
    }

    /// Sets the front-end attenuation (0..=31 dB).
    pub fn set_attenuation(&self, db: u32) -> Result<()> {
        self.bram_required()?.set_attenuation_db(db)?;
        let _ = self
            .0
            .events
            .send(Event::AttenuationUpdate { attenuation_db: db });
        Ok(())
    }

    /// Selects a front-end filter.
    pub fn select_filter(&self, filter: Filter) -> Result<()> {
        self.bram_required()?.select_filter(filter)?;
        let _ = self.0.events.send(Event::FilterUpdate { filter });
        Ok(())
    }

    /// Enables or disables calibration mode.
    pub fn set_calibration(&self, enabled: bool) -> Result<()> {
        self.bram_required()?.set_calibration(enabled)?;
        let _ = self.0.events.send(Event::CalibrationUpdate { enabled });
        Ok(())
    }

    /// Enables or disables the system.
    pub fn set_system_enable(&self, enabled: bool) -> Result<()> {
        self.bram_required()?.set_system_enable(enabled)?;
        let _ = self.0.events.send(Event::SystemEnableUpdate { enabled });
        Ok(())
    }

    /// Applies a partial hardware configuration.
    pub fn apply_config(&self, config: &HardwareConfig) -> Result<()> {
        self.bram_required()?.apply_config(config)?;
        Ok(())
    }

    /// Snapshot of the hardware configuration, if available.
    pub fn config_snapshot(&self) -> Option<ConfigSnapshot> {
        self.bram().map(|b| b.config_snapshot())
    }

    /// Runs a recording on the blocking pool.
    ///
    /// At most one recording runs at a time; a concurrent call fails
    /// with `AlreadyBusy`. The recording can be interrupted with
    /// [`stop_recording`](AppState::stop_recording).
    pub async fn record(&self, request: CaptureRequest) -> Result<CaptureReport> {
        let token = CancellationToken::new();
        {
            let mut slot = self.0.recording_cancel.lock().unwrap();
            if slot.is_some() {
                return Err(Error::AlreadyBusy.into());
            }
            *slot = Some(token.clone());
        }
        let state = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            state.0.coordinator.record(&request, &token)
        })
        .await;
        self.0.recording_cancel.lock().unwrap().take();
        Ok(result??)
    }

    /// Requests a stop of the in-flight recording. Returns whether a
    /// recording was running.
    pub fn stop_recording(&self) -> bool {
        match self.0.recording_cancel.lock().unwrap().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Runs the one-shot `capture` subcommand.
pub async fn run_capture(args: &Args, cap: &CaptureArgs) -> Result<()> {
    let (events, _) = broadcast::channel(16);

    let bram = open_controller(args);
    if let Some(bram) = &bram {
        {
            let bram = Arc::clone(bram);
            if let Err(e) = tokio::task::spawn_blocking(move || bram.setup_schema()).await? {
                tracing::warn!(error = %e, "BRAM setup failed");
            }
        }
        if let Some(path) = &cap.config {
            let config: HardwareConfig = serde_json::from_str(
                &std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?,
            )
            .context("failed to parse config file")?;
            tracing::info!(config = %path.display(), "applying hardware configuration");
            let bram = Arc::clone(bram);
            if let Err(e) =
                tokio::task::spawn_blocking(move || bram.apply_config(&config)).await?
            {
                tracing::warn!(error = %e, "error applying config");
            }
        }
    }

    let quota = if let Some(samples) = cap.samples {
        Quota::Samples(samples)
    } else if let Some(seconds) = cap.seconds {
        Quota::Duration(Duration::from_secs_f64(seconds))
    } else {
        Quota::Bytes(parse_size(&cap.size)?)
    };
    let channels = ChannelSet::parse(&cap.channels)?;
    let source = if cap.from_ring {
        SourceConfig::Ring(ring::shm_path(&args.ring_name))
    } else {
        SourceConfig::Device(args.device.clone())
    };
    // One-shot mode: there is no live streamer to yield the device.
    let coordinator =
        CaptureCoordinator::new(source, events).with_stream_yield(Duration::ZERO);

    let request = CaptureRequest {
        quota,
        channels,
        output: cap.output.clone(),
        align_shift: cap.align_shift,
        config: bram.as_ref().map(|b| b.config_snapshot()),
    };
    let report = tokio::task::spawn_blocking(move || {
        coordinator.record(&request, &CancellationToken::new())
    })
    .await??;
    tracing::info!(
        "capture finished: {} samples, {} bytes in {:.3} s ({:.2} MB/s) -> {}",
        report.samples,
        report.bytes_written,
        report.duration.as_secs_f64(),
        report.throughput_mbps,
        cap.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bram::mock::MockFpga;
    use crate::bram::ParamId;
    use crate::frame::FRAME_SIZE;

    fn state_with_mock(dir: &tempfile::TempDir) -> (AppState, MockFpga) {
        let mock = MockFpga::new();
        let bram = Arc::new(BramController::new(Box::new(mock.clone()), 250.0));
        let (events, _) = broadcast::channel(64);
        let coordinator = CaptureCoordinator::new(
            SourceConfig::Device(dir.path().join("device")),
            events.clone(),
        )
        .with_stream_yield(Duration::ZERO);
        (
            AppState::new(Some(bram), coordinator, events, CancellationToken::new()),
            mock,
        )
    }

    #[test]
    fn control_operations_emit_events() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _mock) = state_with_mock(&dir);
        let mut rx = state.subscribe();

        assert_eq!(state.set_ddc_frequency(0, 125.0).unwrap(), 125);
        state.set_attenuation(15).unwrap();
        state.select_filter(Filter::Bypass).unwrap();

        match rx.try_recv().unwrap() {
            Event::DdcFreqUpdate {
                ddc_index: 0,
                freq_mhz: 125,
            } => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::AttenuationUpdate { attenuation_db: 15 }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::FilterUpdate {
                filter: Filter::Bypass
            }
        ));

        let bram = state.bram().unwrap();
        assert_eq!(bram.parameter(ParamId::AttenuationBval), 15);
        assert_eq!(bram.parameter(ParamId::BypassEn), 1);
    }

    #[test]
    fn operations_fail_without_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _) = broadcast::channel(16);
        let coordinator = CaptureCoordinator::new(
            SourceConfig::Device(dir.path().join("device")),
            events.clone(),
        );
        let state = AppState::new(None, coordinator, events, CancellationToken::new());
        assert!(state.set_attenuation(3).is_err());
        assert!(state.config_snapshot().is_none());
    }

    #[tokio::test]
    async fn record_runs_and_clears_recording_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _mock) = state_with_mock(&dir);
        std::fs::write(
            dir.path().join("device"),
            vec![0x11u8; 64 * FRAME_SIZE],
        )
        .unwrap();

        let request = CaptureRequest {
            quota: Quota::Samples(32),
            channels: ChannelSet::default(),
            output: dir.path().join("out.bin"),
            align_shift: false,
            config: state.config_snapshot(),
        };
        let report = state.record(request.clone()).await.unwrap();
        assert_eq!(report.samples, 32);
        assert!(!state.stop_recording());

        // The slot is free again: a second recording may run.
        let report = state.record(request).await.unwrap();
        assert_eq!(report.samples, 32);
    }
}
