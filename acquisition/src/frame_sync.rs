/*!
Exposure boundary synchronization state machine.

Tracks which sync pulse the acquisition is waiting for, predicts the next
exposure boundary and turns each pulse observation into a GPS-timed boundary.
The engine owns the clock correlation model; the capture loop feeds it
observations and performs the waiting.

```text
AwaitingFirstPulse ──seed──▶ Tracking { cycle: 1 } ──close_cycle──▶ Tracking { cycle: 2 } ...
        │                              │
        └──────────────┬───────────────┘
                       ▼
                Stopped(reason)
```
*/

use serde::{Deserialize, Serialize};
use shared::correlation::{ClockCorrelation, CorrectionSnapshot};
use tracing::{debug, info, warn};

/// Frame synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSyncState {
    /// Waiting for the pulse that opens the first exposure
    AwaitingFirstPulse,
    /// Waiting for the pulse that closes exposure `cycle`
    Tracking { cycle: u64 },
    /// Terminal
    Stopped(StopReason),
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The running flag was cleared
    Requested,
    /// Exposure time zero was programmed
    ExposureZero,
    /// The configured number of exposures was reached
    ExposureLimit,
    InitialSyncFailure,
}

/// Tunable thresholds of the synchronization loop, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// How long to wait for the first sync pulse
    pub initial_sync_timeout_ms: i64,
    /// Length of one pulse wait window
    pub pulse_window_ms: i64,
    /// Wake up this long before a predicted boundary
    pub wake_lead_ms: i64,
    pub sleep_slice_ms: i64,
    /// Predicted boundaries this close past a whole second snap back to it
    pub boundary_round_threshold_ms: i64,
    /// Largest |system - GPS| accepted into the correlation model
    pub measurement_tolerance_ms: i64,
    /// Larger |system - GPS| means the GPS reading is discarded
    pub gps_valid_tolerance_ms: i64,
    /// Drift that triggers a time server resync
    pub drift_tolerance_ms: i64,
    /// Minimum spacing between resyncs
    pub resync_interval_ms: i64,
    /// Half-width of the window around a whole second used for GPS sampling
    pub gps_sample_window_ms: i64,
    /// Minimum spacing between GPS samples
    pub gps_sample_interval_ms: i64,
    /// Longest wait for a GPS packet after a pulse
    pub gps_read_budget_ms: i64,
    pub camera_poll_ms: i64,
    /// Resync with the time server before the first exposure
    pub resync_on_start: bool,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            initial_sync_timeout_ms: 31_000,
            pulse_window_ms: 200,
            wake_lead_ms: 100,
            sleep_slice_ms: 10,
            boundary_round_threshold_ms: 200,
            measurement_tolerance_ms: 50,
            gps_valid_tolerance_ms: 500,
            drift_tolerance_ms: 20,
            resync_interval_ms: 120_000,
            gps_sample_window_ms: 20,
            gps_sample_interval_ms: 980,
            gps_read_budget_ms: 1000,
            camera_poll_ms: 200,
            resync_on_start: true,
        }
    }
}

impl SyncTuning {
    pub fn validate(&self) -> Result<(), String> {
        let positive = [
            ("initial_sync_timeout_ms", self.initial_sync_timeout_ms),
            ("pulse_window_ms", self.pulse_window_ms),
            ("sleep_slice_ms", self.sleep_slice_ms),
            ("gps_sample_window_ms", self.gps_sample_window_ms),
            ("gps_read_budget_ms", self.gps_read_budget_ms),
            ("camera_poll_ms", self.camera_poll_ms),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(format!("{} must be positive", name));
            }
        }
        if self.wake_lead_ms < 0 {
            return Err("wake_lead_ms must not be negative".to_string());
        }
        if !(0..1000).contains(&self.boundary_round_threshold_ms) {
            return Err("boundary_round_threshold_ms must be between 0 and 999".to_string());
        }
        if self.measurement_tolerance_ms > self.gps_valid_tolerance_ms {
            return Err("measurement_tolerance_ms must not exceed gps_valid_tolerance_ms".to_string());
        }
        Ok(())
    }
}

/// Next boundary `exposure_seconds` after `start_ms`.
///
/// Pulses start on whole GPS seconds, so a prediction just past a whole
/// second is pulled back onto it.
pub fn predict_boundary(start_ms: i64, exposure_seconds: u32, round_threshold_ms: i64) -> i64 {
    let predicted = start_ms + i64::from(exposure_seconds) * 1000;
    let residual = predicted.rem_euclid(1000);
    if residual <= round_threshold_ms {
        predicted - residual
    } else {
        predicted
    }
}

/// What the capture loop saw in the window around a predicted boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseObservation {
    /// Pulse seen at `system_ms`; `gps_ms` is the GPS packet read after it
    Detected { system_ms: i64, gps_ms: Option<i64> },
    Missed { predicted_ms: i64 },
}

/// One exposure boundary on both clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub system_ms: i64,
    pub gps_ms: i64,
    /// Observed pulse rather than a prediction
    pub confirmed: bool,
    /// GPS time taken from the correlation model
    pub gps_estimated: bool,
}

/// Result of closing one exposure cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub boundary: Boundary,
    /// The GPS reading was missing or implausible
    pub discrepancy: bool,
    /// The system clock has drifted and a resync is due now
    pub resync_due: bool,
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub exposures_completed: u64,
    pub pulses_detected: u64,
    pub missed_sync_pulses: u64,
    pub clock_discrepancies: u64,
    pub resyncs: u64,
    pub gps_samples: u64,
    pub gps_samples_rejected: u64,
}

/// Boundary bookkeeping for one acquisition run
#[derive(Debug)]
pub struct FrameSyncEngine {
    state: FrameSyncState,
    tuning: SyncTuning,
    exposure_seconds: u32,
    clock: ClockCorrelation,
    stats: SyncStats,
    last_resync_ms: Option<i64>,
    last_gps_sample_ms: Option<i64>,
}

impl FrameSyncEngine {
    pub fn new(tuning: SyncTuning, exposure_seconds: u32) -> Self {
        Self {
            state: FrameSyncState::AwaitingFirstPulse,
            clock: ClockCorrelation::with_tolerance(tuning.measurement_tolerance_ms),
            tuning,
            exposure_seconds,
            stats: SyncStats::default(),
            last_resync_ms: None,
            last_gps_sample_ms: None,
        }
    }

    pub fn state(&self) -> FrameSyncState {
        self.state
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn tuning(&self) -> &SyncTuning {
        &self.tuning
    }

    pub fn clock(&self) -> &ClockCorrelation {
        &self.clock
    }

    /// Publish the session's clock correction through `handle`
    pub fn share_correction(&mut self, handle: &CorrectionSnapshot) {
        self.clock.attach(handle);
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, FrameSyncState::Stopped(_))
    }

    /// Mark the start of the resync interval, with or without an actual resync
    pub fn start_session(&mut self, now_ms: i64) {
        self.last_resync_ms = Some(now_ms);
    }

    /// Record a resync fired at `now_ms`
    pub fn note_resync(&mut self, now_ms: i64) {
        self.last_resync_ms = Some(now_ms);
        self.stats.resyncs += 1;
    }

    pub fn stop(&mut self, reason: StopReason) {
        if !self.is_stopped() {
            info!("🛑 Synchronization stopped: {:?}", reason);
            self.state = FrameSyncState::Stopped(reason);
        }
    }

    /// Accept the pulse that opens the first exposure
    pub fn seed(&mut self, system_ms: i64, gps_ms: Option<i64>) -> Boundary {
        self.stats.pulses_detected += 1;
        let (boundary, _) = self.resolve_detected(system_ms, gps_ms);
        info!(
            "🔒 First sync pulse at system {} ms, GPS {} ms{}",
            boundary.system_ms,
            boundary.gps_ms,
            if boundary.gps_estimated { " (estimated)" } else { "" }
        );
        self.state = FrameSyncState::Tracking { cycle: 1 };
        boundary
    }

    pub fn fail_initial_sync(&mut self) {
        warn!(
            "⚠️ No sync pulse within {} ms of starting acquisition",
            self.tuning.initial_sync_timeout_ms
        );
        self.stop(StopReason::InitialSyncFailure);
    }

    /// Predicted boundary closing the exposure that started at `start_ms`
    pub fn predict_next(&self, start_ms: i64) -> i64 {
        predict_boundary(
            start_ms,
            self.exposure_seconds,
            self.tuning.boundary_round_threshold_ms,
        )
    }

    /// When to stop sleeping and start watching for the pulse
    pub fn wake_time(&self, predicted_ms: i64) -> i64 {
        predicted_ms - self.tuning.wake_lead_ms
    }

    /// Whether a GPS sample taken now fits before `wake_ms` and is due
    pub fn should_sample_gps(&self, now_ms: i64, wake_ms: i64) -> bool {
        let window = self.tuning.gps_sample_window_ms;
        let into_second = now_ms.rem_euclid(1000);
        let near_second = into_second > 1000 - window || into_second < window;
        let due = self
            .last_gps_sample_ms
            .map_or(true, |last| now_ms - last > self.tuning.gps_sample_interval_ms);
        near_second && due && now_ms + window < wake_ms
    }

    /// Feed a GPS sample taken on a 1PPS edge while sleeping.
    /// Returns true when it was added to the correlation model.
    pub fn record_gps_sample(&mut self, system_ms: i64, gps_ms: Option<i64>) -> bool {
        let accepted = gps_ms.is_some_and(|gps| self.clock.add_measurement(system_ms, gps));
        if accepted {
            self.stats.gps_samples += 1;
            self.last_gps_sample_ms = Some(system_ms);
            debug!(
                "GPS sample at {} ms, correction now {} ms",
                system_ms,
                self.clock.current_correction()
            );
        } else {
            self.stats.gps_samples_rejected += 1;
            debug!("GPS sample at {} ms rejected ({:?})", system_ms, gps_ms);
        }
        accepted
    }

    /// Turn the observation around a predicted boundary into the boundary
    /// that closes the current exposure and opens the next one.
    pub fn close_cycle(&mut self, observation: PulseObservation, now_ms: i64) -> CycleOutcome {
        let cycle = match self.state {
            FrameSyncState::Tracking { cycle } => cycle,
            _ => 0,
        };

        let (boundary, discrepancy) = match observation {
            PulseObservation::Detected { system_ms, gps_ms } => {
                self.stats.pulses_detected += 1;
                self.resolve_detected(system_ms, gps_ms)
            }
            PulseObservation::Missed { predicted_ms } => {
                self.stats.missed_sync_pulses += 1;
                let gps_ms = self.clock.estimate_gps_time(predicted_ms);
                warn!(
                    "⚠️ Missed sync pulse for exposure #{} (predicted {} ms), using GPS estimate {} ms",
                    cycle, predicted_ms, gps_ms
                );
                let boundary = Boundary {
                    system_ms: predicted_ms,
                    gps_ms,
                    confirmed: false,
                    gps_estimated: true,
                };
                (boundary, false)
            }
        };

        let drift = (boundary.system_ms - boundary.gps_ms).abs();
        let resync_due = drift > self.tuning.drift_tolerance_ms
            && self
                .last_resync_ms
                .map_or(true, |last| now_ms - last >= self.tuning.resync_interval_ms);
        if resync_due {
            info!("🕒 System clock {} ms from GPS, resync due", drift);
            self.note_resync(now_ms);
        }

        if !self.is_stopped() {
            self.state = FrameSyncState::Tracking { cycle: cycle + 1 };
        }

        CycleOutcome {
            cycle,
            boundary,
            discrepancy,
            resync_due,
        }
    }

    pub fn record_exposure(&mut self) {
        self.stats.exposures_completed += 1;
    }

    /// Validate the GPS reading for an observed pulse
    fn resolve_detected(&mut self, system_ms: i64, gps_ms: Option<i64>) -> (Boundary, bool) {
        let plausible = gps_ms.filter(|gps| (system_ms - gps).abs() <= self.tuning.gps_valid_tolerance_ms);

        match plausible {
            Some(gps) => {
                if self.clock.add_measurement(system_ms, gps) {
                    self.last_gps_sample_ms = Some(system_ms);
                }
                let boundary = Boundary {
                    system_ms,
                    gps_ms: gps,
                    confirmed: true,
                    gps_estimated: false,
                };
                (boundary, false)
            }
            None => {
                self.stats.clock_discrepancies += 1;
                let estimate = self.clock.estimate_gps_time(system_ms);
                match gps_ms {
                    Some(gps) => warn!(
                        "⚠️ Clock discrepancy: system {} ms vs GPS {} ms, using estimate {} ms",
                        system_ms, gps, estimate
                    ),
                    None => warn!(
                        "⚠️ Clock discrepancy: no GPS time for pulse at {} ms, using estimate {} ms",
                        system_ms, estimate
                    ),
                }
                let boundary = Boundary {
                    system_ms,
                    gps_ms: estimate,
                    confirmed: true,
                    gps_estimated: true,
                };
                (boundary, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FrameSyncEngine {
        FrameSyncEngine::new(SyncTuning::default(), 5)
    }

    #[test]
    fn test_predict_boundary_rounding() {
        assert_eq!(predict_boundary(10_003, 5, 200), 15_000);
        assert_eq!(predict_boundary(10_200, 5, 200), 15_000);
        assert_eq!(predict_boundary(10_201, 5, 200), 15_201);
        assert_eq!(predict_boundary(10_000, 5, 200), 15_000);
        assert_eq!(predict_boundary(9_950, 1, 200), 10_950);
    }

    #[test]
    fn test_seed_moves_to_tracking() {
        let mut engine = engine();
        assert_eq!(engine.state(), FrameSyncState::AwaitingFirstPulse);

        let boundary = engine.seed(10_003, Some(10_000));
        assert_eq!(engine.state(), FrameSyncState::Tracking { cycle: 1 });
        assert_eq!(boundary.gps_ms, 10_000);
        assert!(boundary.confirmed && !boundary.gps_estimated);
        assert_eq!(engine.clock().current_correction(), 3);
    }

    #[test]
    fn test_detected_pulse_outside_tolerance_not_measured() {
        let mut engine = engine();
        engine.seed(10_003, Some(10_000));

        let outcome = engine.close_cycle(
            PulseObservation::Detected {
                system_ms: 15_080,
                gps_ms: Some(15_000),
            },
            15_100,
        );
        // Plausible but too far off to feed the model.
        assert!(!outcome.discrepancy);
        assert_eq!(outcome.boundary.gps_ms, 15_000);
        assert_eq!(engine.clock().len(), 1);
        assert_eq!(engine.state(), FrameSyncState::Tracking { cycle: 2 });
    }

    #[test]
    fn test_implausible_gps_uses_estimate() {
        let mut engine = engine();
        engine.seed(10_003, Some(10_000));

        let outcome = engine.close_cycle(
            PulseObservation::Detected {
                system_ms: 15_003,
                gps_ms: Some(22_000),
            },
            15_030,
        );
        assert!(outcome.discrepancy);
        assert!(outcome.boundary.gps_estimated);
        assert_eq!(outcome.boundary.gps_ms, 15_000);

        let outcome = engine.close_cycle(
            PulseObservation::Detected {
                system_ms: 20_003,
                gps_ms: None,
            },
            20_030,
        );
        assert!(outcome.discrepancy);
        assert_eq!(engine.stats().clock_discrepancies, 2);
    }

    #[test]
    fn test_missed_pulse_uses_prediction() {
        let mut engine = engine();
        engine.seed(10_003, Some(10_000));

        let outcome = engine.close_cycle(PulseObservation::Missed { predicted_ms: 15_000 }, 15_100);
        assert_eq!(outcome.cycle, 1);
        assert_eq!(outcome.boundary.system_ms, 15_000);
        assert_eq!(outcome.boundary.gps_ms, 14_997);
        assert!(!outcome.boundary.confirmed);
        assert_eq!(engine.stats().missed_sync_pulses, 1);
        assert_eq!(engine.state(), FrameSyncState::Tracking { cycle: 2 });
    }

    #[test]
    fn test_resync_respects_interval() {
        let mut engine = engine();
        engine.start_session(0);
        engine.seed(1_030, Some(1_000));

        let drifted = |system_ms: i64| PulseObservation::Detected {
            system_ms,
            gps_ms: Some(system_ms - 30),
        };
        assert!(!engine.close_cycle(drifted(6_030), 6_055).resync_due);
        assert!(engine.close_cycle(drifted(121_030), 121_055).resync_due);
        assert!(!engine.close_cycle(drifted(126_030), 126_055).resync_due);
        assert_eq!(engine.stats().resyncs, 1);
    }

    #[test]
    fn test_gps_sampling_window() {
        let mut engine = engine();
        engine.seed(10_003, Some(10_000));

        assert!(!engine.should_sample_gps(10_500, 14_900));
        assert!(engine.should_sample_gps(10_995, 14_900));
        assert!(engine.should_sample_gps(11_005, 14_900));
        // Would overrun the wake-up time.
        assert!(!engine.should_sample_gps(11_995, 12_010));

        assert!(engine.record_gps_sample(11_003, Some(11_000)));
        // Too soon after the last sample.
        assert!(!engine.should_sample_gps(11_981, 14_900));
        assert!(engine.should_sample_gps(11_990, 14_900));

        assert!(!engine.record_gps_sample(12_003, None));
        assert_eq!(engine.stats().gps_samples, 1);
        assert_eq!(engine.stats().gps_samples_rejected, 1);
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut engine = engine();
        engine.fail_initial_sync();
        assert_eq!(engine.state(), FrameSyncState::Stopped(StopReason::InitialSyncFailure));
        engine.stop(StopReason::Requested);
        assert_eq!(engine.state(), FrameSyncState::Stopped(StopReason::InitialSyncFailure));
    }

    #[test]
    fn test_tuning_validation() {
        assert!(SyncTuning::default().validate().is_ok());
        let tuning = SyncTuning {
            boundary_round_threshold_ms: 1000,
            ..SyncTuning::default()
        };
        assert!(tuning.validate().is_err());
    }
}
