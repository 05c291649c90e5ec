/*!
Clock correlation model.

Pairs of (system clock, GPS clock) readings taken at the same physical pulse
give the offset of the host clock from GPS time. Only pairs that agree to
within a tolerance are kept; the most recently added pair defines the current
correction.
*/

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

/// Readings further apart than this are not trusted as a measurement
pub const DEFAULT_MEASUREMENT_TOLERANCE_MS: i64 = 50;

/// One simultaneous reading of the system and GPS clocks (epoch ms, UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockMeasurement {
    pub system_time_ms: i64,
    pub gps_time_ms: i64,
}

impl ClockMeasurement {
    pub fn new(system_time_ms: i64, gps_time_ms: i64) -> Self {
        Self {
            system_time_ms,
            gps_time_ms,
        }
    }

    /// System time minus GPS time
    pub fn correction(&self) -> i64 {
        self.system_time_ms - self.gps_time_ms
    }
}

/// Append-only history of accepted measurements
#[derive(Debug)]
pub struct ClockCorrelation {
    measurements: Vec<ClockMeasurement>,
    tolerance_ms: i64,
    rejected: u64,
    shared: Arc<SharedCorrection>,
}

#[derive(Debug, Default)]
struct SharedCorrection {
    correction_ms: AtomicI64,
    present: AtomicBool,
}

/// Read-only view of the current correction for other threads
#[derive(Debug, Clone, Default)]
pub struct CorrectionSnapshot {
    shared: Arc<SharedCorrection>,
}

impl CorrectionSnapshot {
    /// Current correction, 0 before the first measurement
    pub fn correction_ms(&self) -> i64 {
        self.shared.correction_ms.load(Ordering::Acquire)
    }

    pub fn has_measurement(&self) -> bool {
        self.shared.present.load(Ordering::Acquire)
    }

    pub fn estimate_gps_time(&self, system_time_ms: i64) -> i64 {
        system_time_ms - self.correction_ms()
    }
}

impl ClockCorrelation {
    pub fn new() -> Self {
        Self::with_tolerance(DEFAULT_MEASUREMENT_TOLERANCE_MS)
    }

    pub fn with_tolerance(tolerance_ms: i64) -> Self {
        Self {
            measurements: Vec::new(),
            tolerance_ms,
            rejected: 0,
            shared: Arc::new(SharedCorrection::default()),
        }
    }

    /// Record a measurement. Returns false, leaving the model untouched, when
    /// the two readings differ by more than the tolerance.
    pub fn add_measurement(&mut self, system_time_ms: i64, gps_time_ms: i64) -> bool {
        let measurement = ClockMeasurement::new(system_time_ms, gps_time_ms);
        if measurement.correction().abs() > self.tolerance_ms {
            self.rejected += 1;
            debug!(
                "Rejected clock measurement, system - GPS = {} ms",
                measurement.correction()
            );
            return false;
        }

        self.measurements.push(measurement);
        self.shared
            .correction_ms
            .store(measurement.correction(), Ordering::Release);
        self.shared.present.store(true, Ordering::Release);
        true
    }

    /// Correction of the most recently added measurement, 0 when empty
    pub fn current_correction(&self) -> i64 {
        self.latest().map(|m| m.correction()).unwrap_or(0)
    }

    pub fn estimate_gps_time(&self, system_time_ms: i64) -> i64 {
        system_time_ms - self.current_correction()
    }

    pub fn latest(&self) -> Option<&ClockMeasurement> {
        self.measurements.last()
    }

    pub fn measurements(&self) -> &[ClockMeasurement] {
        &self.measurements
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Publish this model's correction through an existing handle from now on
    pub fn attach(&mut self, snapshot: &CorrectionSnapshot) {
        let present = !self.is_empty();
        snapshot
            .shared
            .correction_ms
            .store(self.current_correction(), Ordering::Release);
        snapshot.shared.present.store(present, Ordering::Release);
        self.shared = Arc::clone(&snapshot.shared);
    }
}

impl Default for ClockCorrelation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_model_has_zero_correction() {
        let clock = ClockCorrelation::new();
        assert!(clock.is_empty());
        assert_eq!(clock.current_correction(), 0);
        assert_eq!(clock.estimate_gps_time(1_000_123), 1_000_123);
    }

    #[test]
    fn test_latest_measurement_wins() {
        let mut clock = ClockCorrelation::new();
        assert!(clock.add_measurement(10_003, 10_000));
        assert!(clock.add_measurement(15_007, 15_000));
        assert_eq!(clock.len(), 2);
        assert_eq!(clock.current_correction(), 7);
        assert_eq!(clock.estimate_gps_time(20_007), 20_000);
    }

    #[test]
    fn test_repeated_measurement_is_idempotent_for_correction() {
        let mut clock = ClockCorrelation::new();
        clock.add_measurement(5_012, 5_000);
        let first = clock.current_correction();
        clock.add_measurement(5_012, 5_000);
        assert_eq!(clock.current_correction(), first);
    }

    #[test]
    fn test_distant_measurement_rejected() {
        let mut clock = ClockCorrelation::new();
        assert!(clock.add_measurement(1_000, 990));
        assert!(!clock.add_measurement(2_051, 2_000));
        assert!(!clock.add_measurement(2_000, 2_051));
        assert_eq!(clock.len(), 1);
        assert_eq!(clock.rejected_count(), 2);
        assert_eq!(clock.current_correction(), 10);

        // Exactly at the tolerance is still accepted.
        assert!(clock.add_measurement(3_050, 3_000));
    }

    #[test]
    fn test_snapshot_tracks_model() {
        let mut clock = ClockCorrelation::new();
        let snapshot = CorrectionSnapshot::default();
        clock.attach(&snapshot);
        assert!(!snapshot.has_measurement());
        assert_eq!(snapshot.correction_ms(), 0);

        clock.add_measurement(8_000, 8_021);
        let reader = std::thread::spawn(move || (snapshot.has_measurement(), snapshot.estimate_gps_time(9_000)));
        assert_eq!(reader.join().unwrap(), (true, 9_021));
    }

    #[test]
    fn test_attach_resets_handle_for_new_session() {
        let handle = CorrectionSnapshot::default();
        let mut first = ClockCorrelation::new();
        first.attach(&handle);
        first.add_measurement(8_004, 8_000);
        assert_eq!(handle.correction_ms(), 4);

        let mut second = ClockCorrelation::new();
        second.attach(&handle);
        assert!(!handle.has_measurement());
        assert_eq!(handle.correction_ms(), 0);

        second.add_measurement(9_010, 9_000);
        assert!(handle.has_measurement());
        assert_eq!(handle.estimate_gps_time(9_500), 9_490);
    }
}
