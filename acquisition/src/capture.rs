/*!
Exposure acquisition loop.

Drives the devices through the synchronization state machine:

1. Program the timing hardware and wait for the first sync pulse
2. Sleep until just before each predicted boundary, sampling GPS on the 1PPS line
3. Catch the sync pulse (or give up on it) and read its GPS time
4. Read the camera frame and hand the completed exposure to the sink

Every wait goes through the shared [`Poller`], so clearing the running flag
stops the loop within one sleep slice or pulse window.
*/

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use shared::correlation::{ClockMeasurement, CorrectionSnapshot};
use shared::devices::{Camera, ExposureSink};
use shared::exposure::{Exposure, ImageBuffer, ImageType};
use shared::gps::{DecoderStats, GpsDecoder};
use shared::timing_unit::TimingStatus;
use shared::{Polled, Poller, Result, SharedError};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::frame_sync::{Boundary, FrameSyncEngine, PulseObservation, StopReason, SyncStats, SyncTuning};
use crate::hardware::AcquisitionDevices;

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Outcome of one acquisition run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub stats: SyncStats,
    pub decoder: DecoderStats,
    pub measurements: Vec<ClockMeasurement>,
    pub rejected_measurements: u64,
    pub final_correction_ms: i64,
    pub status_reports: u64,
    pub status_failures: u64,
}

impl RunSummary {
    fn stopped_early(stop_reason: StopReason) -> Self {
        Self {
            stop_reason,
            stats: SyncStats::default(),
            decoder: DecoderStats::default(),
            measurements: Vec::new(),
            rejected_measurements: 0,
            final_correction_ms: 0,
            status_reports: 0,
            status_failures: 0,
        }
    }

    /// Log the final statistics
    pub fn log(&self) {
        info!("📊 Acquisition finished: {:?}", self.stop_reason);
        info!("📊 Exposures completed: {}", self.stats.exposures_completed);
        info!(
            "📊 Sync pulses: {} detected, {} missed",
            self.stats.pulses_detected, self.stats.missed_sync_pulses
        );
        info!(
            "📊 Clock: {} discrepancies, {} resyncs, correction {} ms from {} measurements ({} rejected)",
            self.stats.clock_discrepancies,
            self.stats.resyncs,
            self.final_correction_ms,
            self.measurements.len(),
            self.rejected_measurements
        );
        info!(
            "📊 GPS: {} samples ({} rejected), {} packets decoded, {} malformed, {} overruns",
            self.stats.gps_samples,
            self.stats.gps_samples_rejected,
            self.decoder.decoded,
            self.decoder.malformed,
            self.decoder.overruns
        );
        if self.status_reports > 0 || self.status_failures > 0 {
            info!(
                "📊 Timing status: {} reports, {} failed queries",
                self.status_reports, self.status_failures
            );
        }
    }
}

/// Runs the exposure loop against a set of devices
pub struct ExposureAcquisition {
    poller: Poller,
    tuning: SyncTuning,
    exposure_seconds: u32,
    image_type: ImageType,
    exposure_count: Option<u64>,
    report_status: bool,
    status_reports: u64,
    status_failures: u64,
    correction: CorrectionSnapshot,
}

impl ExposureAcquisition {
    pub fn new(config: &AppConfig, poller: Poller) -> Self {
        Self {
            poller,
            tuning: config.timing.clone(),
            exposure_seconds: config.acquisition.exposure_time_seconds,
            image_type: config.acquisition.image_type,
            exposure_count: config.acquisition.exposure_count,
            report_status: config.acquisition.report_timing_status,
            status_reports: 0,
            status_failures: 0,
            correction: CorrectionSnapshot::default(),
        }
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        self.poller.running_flag()
    }

    /// Handle other threads can read the current clock correction from
    pub fn correction_snapshot(&self) -> CorrectionSnapshot {
        self.correction.clone()
    }

    /// Program the timing hardware and acquire exposures until stopped.
    ///
    /// Returns `InitialSyncFailure` when the first pulse never arrives.
    /// Missed pulses and bad GPS readings are absorbed and counted.
    pub fn run(&mut self, devices: &mut AcquisitionDevices, sink: &mut dyn ExposureSink) -> Result<RunSummary> {
        self.status_reports = 0;
        self.status_failures = 0;

        devices.timing.set_exposure_time(self.exposure_seconds)?;
        if self.exposure_seconds == 0 {
            info!("⏹️ Exposure time 0 programmed on {}, sync pulses stopped", devices.timing.name());
            return Ok(RunSummary::stopped_early(StopReason::ExposureZero));
        }
        info!(
            "🚀 Acquiring {} s {:?} exposures via {}",
            self.exposure_seconds,
            self.image_type,
            devices.timing.name()
        );

        let mut engine = FrameSyncEngine::new(self.tuning.clone(), self.exposure_seconds);
        engine.share_correction(&self.correction);
        let mut decoder = GpsDecoder::new();

        engine.start_session(self.poller.now_ms());
        if self.tuning.resync_on_start {
            self.resync(devices, &mut engine);
        }

        devices.camera.start_acquisition()?;
        let result = self.acquire(&mut engine, &mut decoder, devices, sink);
        if let Err(e) = devices.camera.stop_acquisition() {
            warn!("⚠️ Failed to stop camera acquisition: {}", e);
        }

        let stop_reason = result?;
        engine.stop(stop_reason);

        Ok(RunSummary {
            stop_reason,
            stats: engine.stats(),
            decoder: decoder.stats(),
            measurements: engine.clock().measurements().to_vec(),
            rejected_measurements: engine.clock().rejected_count(),
            final_correction_ms: engine.clock().current_correction(),
            status_reports: self.status_reports,
            status_failures: self.status_failures,
        })
    }

    fn acquire(
        &mut self,
        engine: &mut FrameSyncEngine,
        decoder: &mut GpsDecoder,
        devices: &mut AcquisitionDevices,
        sink: &mut dyn ExposureSink,
    ) -> Result<StopReason> {
        let Some(first) = self.wait_for_first_pulse(engine, decoder, devices)? else {
            return Ok(StopReason::Requested);
        };
        devices.camera.purge_images()?;

        let duration_ms = i64::from(self.exposure_seconds) * 1000;
        let mut finishing = self.start_exposure(1, duration_ms, first);

        loop {
            if self.exposure_count.is_some_and(|count| engine.stats().exposures_completed >= count) {
                return Ok(StopReason::ExposureLimit);
            }

            let predicted = engine.predict_next(finishing.system_start_ms);
            if !self.sleep_until_boundary(engine, decoder, devices, predicted)? {
                return Ok(StopReason::Requested);
            }

            let Some(observation) = self.catch_boundary_pulse(decoder, devices, predicted)? else {
                return Ok(StopReason::Requested);
            };
            let outcome = engine.close_cycle(observation, self.poller.now_ms());
            if outcome.resync_due {
                self.fire_resync(devices);
            }

            let Some(image) = self.read_image(devices.camera.as_mut())? else {
                return Ok(StopReason::Requested);
            };

            let boundary = outcome.boundary;
            finishing.finish(boundary.system_ms, boundary.gps_ms, boundary.confirmed, boundary.gps_estimated);
            finishing.image = Some(image);

            let next = self.start_exposure(finishing.sequence_number + 1, duration_ms, boundary);
            let done = std::mem::replace(&mut finishing, next);

            if done.is_fully_confirmed() {
                info!("📸 Exposure {}", done.describe());
            } else {
                warn!("⚠️ Exposure {} (not fully confirmed)", done.describe());
            }
            engine.record_exposure();
            sink.on_exposure_complete(done);

            if self.report_status {
                let wake = engine.wake_time(engine.predict_next(finishing.system_start_ms));
                self.report_timing_status(devices, sink, wake);
            }
        }
    }

    fn start_exposure(&self, sequence_number: u64, duration_ms: i64, boundary: Boundary) -> Exposure {
        let mut exposure = Exposure::starting_at(
            sequence_number,
            self.image_type,
            duration_ms,
            boundary.system_ms,
            boundary.gps_ms,
        );
        exposure.start_confirmed = boundary.confirmed;
        exposure.gps_start_estimated = boundary.gps_estimated;
        exposure
    }

    /// Wait for the first sync pulse in short windows, dropping stale GPS
    /// packets between them. `Ok(None)` when stopped.
    fn wait_for_first_pulse(
        &self,
        engine: &mut FrameSyncEngine,
        decoder: &mut GpsDecoder,
        devices: &mut AcquisitionDevices,
    ) -> Result<Option<Boundary>> {
        let started = self.poller.now_ms();
        let deadline = started + self.tuning.initial_sync_timeout_ms;
        info!("⏳ Waiting for the first sync pulse");

        loop {
            if !self.poller.is_running() {
                return Ok(None);
            }
            let now = self.poller.now_ms();
            if now >= deadline {
                engine.fail_initial_sync();
                return Err(SharedError::InitialSyncFailure {
                    waited_ms: (now - started) as u64,
                });
            }

            decoder.flush(devices.gps.as_mut())?;
            let window = millis(self.tuning.pulse_window_ms.min(deadline - now));
            if devices.pulses.wait_for_output_signal(window)? {
                if !self.poller.is_running() {
                    return Ok(None);
                }
                let system_ms = self.poller.now_ms();
                let gps_ms = decoder.read_timestamp(
                    devices.gps.as_mut(),
                    &self.poller,
                    millis(self.tuning.gps_read_budget_ms),
                )?;
                return Ok(Some(engine.seed(system_ms, gps_ms)));
            }
        }
    }

    /// Sleep until just before `predicted`, sampling GPS on 1PPS edges.
    /// Returns false when stopped.
    fn sleep_until_boundary(
        &self,
        engine: &mut FrameSyncEngine,
        decoder: &mut GpsDecoder,
        devices: &mut AcquisitionDevices,
        predicted: i64,
    ) -> Result<bool> {
        let wake = engine.wake_time(predicted);
        debug!("Next boundary predicted at {} ms, waking at {} ms", predicted, wake);

        loop {
            if !self.poller.is_running() {
                return Ok(false);
            }
            let now = self.poller.now_ms();
            if now >= wake {
                return Ok(true);
            }

            if engine.should_sample_gps(now, wake) {
                decoder.flush(devices.gps.as_mut())?;
                if devices
                    .pulses
                    .wait_for_input_signal(millis(self.tuning.gps_sample_window_ms))?
                {
                    let system_ms = self.poller.now_ms();
                    let budget = self.tuning.gps_read_budget_ms.min(wake - system_ms);
                    let gps_ms = decoder.read_timestamp(devices.gps.as_mut(), &self.poller, millis(budget))?;
                    engine.record_gps_sample(system_ms, gps_ms);
                }
            }

            let remaining = wake - self.poller.now_ms();
            if remaining > 0 && !self.poller.sleep(millis(self.tuning.sleep_slice_ms.min(remaining))) {
                return Ok(false);
            }
        }
    }

    /// Watch the window around `predicted` for the sync pulse.
    /// `Ok(None)` when stopped.
    fn catch_boundary_pulse(
        &self,
        decoder: &mut GpsDecoder,
        devices: &mut AcquisitionDevices,
        predicted: i64,
    ) -> Result<Option<PulseObservation>> {
        decoder.flush(devices.gps.as_mut())?;
        let window_end = predicted + self.tuning.wake_lead_ms;
        let window = (window_end - self.poller.now_ms()).clamp(0, self.tuning.pulse_window_ms);

        let detected = devices.pulses.wait_for_output_signal(millis(window))?;
        if !self.poller.is_running() {
            return Ok(None);
        }
        if !detected {
            return Ok(Some(PulseObservation::Missed { predicted_ms: predicted }));
        }

        let system_ms = self.poller.now_ms();
        let gps_ms = decoder.read_timestamp(
            devices.gps.as_mut(),
            &self.poller,
            millis(self.tuning.gps_read_budget_ms),
        )?;
        Ok(Some(PulseObservation::Detected { system_ms, gps_ms }))
    }

    /// Poll the camera until a frame is ready and read it. `Ok(None)` when stopped.
    fn read_image(&self, camera: &mut dyn Camera) -> Result<Option<ImageBuffer>> {
        let polled = self
            .poller
            .poll_until(i64::MAX, millis(self.tuning.camera_poll_ms), || {
                camera.is_image_ready().map(|ready| ready.then_some(()))
            })?;
        if !matches!(polled, Polled::Ready(())) {
            return Ok(None);
        }

        let mut image = ImageBuffer::new(camera.width(), camera.height());
        camera.get_image(&mut image.pixels)?;
        Ok(Some(image))
    }

    fn resync(&self, devices: &mut AcquisitionDevices, engine: &mut FrameSyncEngine) {
        self.fire_resync(devices);
        engine.note_resync(self.poller.now_ms());
    }

    fn fire_resync(&self, devices: &mut AcquisitionDevices) {
        if let Err(e) = devices.time_server.resync_with_time_server() {
            warn!("⚠️ Time server resync failed: {}", e);
        }
    }

    /// Query and forward the timing hardware's last pulse times; failures only warn.
    /// The query must finish by `wake_ms` so the next boundary is still caught.
    fn report_timing_status(&mut self, devices: &mut AcquisitionDevices, sink: &mut dyn ExposureSink, wake_ms: i64) {
        let budget = wake_ms - self.poller.now_ms();
        if budget <= 0 {
            debug!("No time left for a timing status query before the next boundary");
            return;
        }

        match devices.timing.status(millis(budget)) {
            Ok(Some(status)) => {
                self.status_reports += 1;
                debug!("Timing status: {:?}", status);
                sink.on_status(&status);
            }
            Ok(None) => {}
            Err(SharedError::Stopped) => {}
            Err(e) => {
                self.status_failures += 1;
                warn!("⚠️ Timing status query failed: {}", e);
            }
        }
    }
}

/// What the acquisition thread hands to the consumer thread
#[derive(Debug)]
pub enum AcquisitionEvent {
    Exposure(Exposure),
    Status(TimingStatus),
}

/// Sink forwarding events over a bounded channel without blocking
pub struct ChannelSink {
    sender: Sender<AcquisitionEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn new(sender: Sender<AcquisitionEvent>) -> Self {
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of exposures lost to a full channel
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl ExposureSink for ChannelSink {
    fn on_exposure_complete(&mut self, exposure: Exposure) {
        let sequence_number = exposure.sequence_number;
        match self.sender.try_send(AcquisitionEvent::Exposure(exposure)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Exposure channel full, dropping exposure #{}", sequence_number);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Exposure consumer gone, dropping exposure #{}", sequence_number);
            }
        }
    }

    fn on_status(&mut self, status: &TimingStatus) {
        if self.sender.try_send(AcquisitionEvent::Status(*status)).is_err() {
            debug!("Channel busy, skipping timing status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn exposure(sequence_number: u64) -> Exposure {
        Exposure::starting_at(sequence_number, ImageType::Target, 5000, 10_003, 10_000)
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (tx, rx) = bounded(1);
        let mut sink = ChannelSink::new(tx);
        let dropped = sink.dropped_counter();

        sink.on_exposure_complete(exposure(1));
        sink.on_exposure_complete(exposure(2));
        sink.on_status(&TimingStatus::default());

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        match rx.try_recv().unwrap() {
            AcquisitionEvent::Exposure(e) => assert_eq!(e.sequence_number, 1),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_disconnected_consumer() {
        let (tx, rx) = bounded(4);
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        sink.on_exposure_complete(exposure(1));
        assert_eq!(sink.dropped_counter().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_millis_clamps_negative() {
        assert_eq!(millis(-5), Duration::ZERO);
        assert_eq!(millis(20), Duration::from_millis(20));
    }
}
