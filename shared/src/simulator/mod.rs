/*!
In-process hardware simulator.

All simulated devices share one [`SimTimeline`]: GPS time runs
`system_offset_ms` behind the host clock, the GPS receiver pulses on every
whole GPS second and the timing hardware emits camera sync pulses every
exposure period starting on the first whole GPS second after it was
programmed. Devices wait through the shared [`Poller`], so on a
[`crate::time::VirtualClock`] an entire acquisition run completes without
wall-clock delays.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::devices::{check_exposure_time, ByteChannel, Camera, PulseSource, TimingHardware};
use crate::error::{Result, SharedError};
use crate::gps::{encode_supplementary_packet, GpsTimingMessage};
use crate::protocol::TIMER_CARD_MAX_EXPOSURE_SECONDS;
use crate::time::Poller;

pub mod timing_unit;

pub use timing_unit::SimulatedTimingUnit;

/// Largest number of unread GPS bytes kept before old bytes are dropped
const MAX_GPS_BACKLOG_BYTES: usize = 4096;

/// Bytes injected ahead of each GPS packet when line noise is enabled
const LINE_NOISE: [u8; 6] = [0xFF, 0x10, 0x03, 0x10, 0x42, 0x99];

/// Simulator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// Host clock minus GPS clock
    pub system_offset_ms: i64,
    /// Delay between a GPS second and its timing packet on the serial line
    pub gps_latency_ms: i64,
    pub pulse_width_ms: i64,
    /// Delay between a sync pulse and the camera image becoming readable
    pub readout_ms: i64,
    pub camera_width: usize,
    pub camera_height: usize,
    pub utc_offset_seconds: i16,
    /// Report UTC calendar fields instead of GPS-scale ones
    pub report_utc: bool,
    /// Follow each primary packet with a supplementary `0x8F-AC` packet
    pub supplementary_packets: bool,
    /// Inject junk bytes ahead of each GPS packet
    pub line_noise: bool,
    /// Sync pulse indices the pulse detector never sees
    pub suppressed_pulses: Vec<u64>,
    /// GPS seconds (since the Unix epoch) whose packets carry a wrong time
    pub corrupt_gps_seconds: Vec<i64>,
    /// Number of "updating" replies the timing unit gives before answering;
    /// `u32::MAX` keeps it busy forever
    pub timing_unit_updating_replies: u32,
    /// Timing unit reports a lost GPS lock alongside its replies
    pub timing_unit_degraded: bool,
    /// Sync and GPS pulse-time queries always get an "updating" reply
    pub timing_unit_pulse_times_busy: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            system_offset_ms: 3,
            gps_latency_ms: 25,
            pulse_width_ms: 10,
            readout_ms: 100,
            camera_width: 64,
            camera_height: 48,
            utc_offset_seconds: 18,
            report_utc: false,
            supplementary_packets: true,
            line_noise: false,
            suppressed_pulses: Vec::new(),
            corrupt_gps_seconds: Vec::new(),
            timing_unit_updating_replies: 2,
            timing_unit_degraded: false,
            timing_unit_pulse_times_busy: false,
        }
    }
}

impl SimulatorSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0..900).contains(&self.gps_latency_ms) {
            return Err(SharedError::config("gps_latency_ms must be between 0 and 899"));
        }
        if self.pulse_width_ms <= 0 || self.readout_ms < 0 {
            return Err(SharedError::config("pulse_width_ms must be positive and readout_ms non-negative"));
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(SharedError::config("camera dimensions must be non-zero"));
        }
        Ok(())
    }
}

/// Shared schedule of simulated pulses
#[derive(Debug)]
pub struct SimTimeline {
    poller: Poller,
    system_offset_ms: i64,
    pulse_width_ms: i64,
    suppressed: Vec<u64>,
    first_pulse_gps_ms: AtomicI64,
    period_ms: AtomicI64,
}

impl SimTimeline {
    pub fn new(settings: &SimulatorSettings, poller: Poller) -> Self {
        Self {
            poller,
            system_offset_ms: settings.system_offset_ms,
            pulse_width_ms: settings.pulse_width_ms,
            suppressed: settings.suppressed_pulses.clone(),
            first_pulse_gps_ms: AtomicI64::new(0),
            period_ms: AtomicI64::new(0),
        }
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn system_now(&self) -> i64 {
        self.poller.now_ms()
    }

    pub fn gps_now(&self) -> i64 {
        self.system_now() - self.system_offset_ms
    }

    pub fn system_offset_ms(&self) -> i64 {
        self.system_offset_ms
    }

    /// Start pulsing every `period_ms` from the next whole GPS second; zero stops
    pub fn program(&self, period_ms: i64) {
        let first = (self.gps_now().div_euclid(1000) + 1) * 1000;
        self.first_pulse_gps_ms.store(first, Ordering::SeqCst);
        self.period_ms.store(period_ms.max(0), Ordering::SeqCst);
        debug!("Simulated sync pulses every {} ms from GPS {}", period_ms, first);
    }

    pub fn period_ms(&self) -> i64 {
        self.period_ms.load(Ordering::SeqCst)
    }

    pub fn pulse_gps(&self, index: u64) -> Option<i64> {
        let period = self.period_ms();
        (period > 0).then(|| self.first_pulse_gps_ms.load(Ordering::SeqCst) + index as i64 * period)
    }

    pub fn pulse_system(&self, index: u64) -> Option<i64> {
        self.pulse_gps(index).map(|t| t + self.system_offset_ms)
    }

    /// First pulse at or after `system_ms`
    pub fn first_pulse_not_before(&self, system_ms: i64) -> Option<u64> {
        let period = self.period_ms();
        let p0 = self.pulse_system(0)?;
        if system_ms <= p0 {
            return Some(0);
        }
        Some(((system_ms - p0 + period - 1) / period) as u64)
    }

    /// First pulse strictly after `system_ms`
    pub fn first_pulse_after(&self, system_ms: i64) -> Option<u64> {
        let period = self.period_ms();
        let p0 = self.pulse_system(0)?;
        if system_ms < p0 {
            return Some(0);
        }
        Some(((system_ms - p0) / period + 1) as u64)
    }

    /// Latest pulse at or before `system_ms`
    pub fn last_pulse_at_or_before(&self, system_ms: i64) -> Option<u64> {
        let period = self.period_ms();
        let p0 = self.pulse_system(0)?;
        if system_ms < p0 {
            return None;
        }
        Some(((system_ms - p0) / period) as u64)
    }

    pub fn is_suppressed(&self, index: u64) -> bool {
        self.suppressed.contains(&index)
    }

    pub fn pulse_width_ms(&self) -> i64 {
        self.pulse_width_ms
    }
}

/// GPS receiver serial feed; one primary timing packet per GPS second
#[derive(Debug)]
pub struct SimulatedGpsFeed {
    timeline: Arc<SimTimeline>,
    pending: VecDeque<u8>,
    next_second: i64,
    latency_ms: i64,
    utc_offset_seconds: i16,
    report_utc: bool,
    supplementary: bool,
    line_noise: bool,
    corrupt_seconds: Vec<i64>,
    packets_sent: u64,
}

impl SimulatedGpsFeed {
    pub fn new(timeline: Arc<SimTimeline>, settings: &SimulatorSettings) -> Self {
        let next_second = (timeline.gps_now() - settings.gps_latency_ms).div_euclid(1000) + 1;
        Self {
            timeline,
            pending: VecDeque::new(),
            next_second,
            latency_ms: settings.gps_latency_ms,
            utc_offset_seconds: settings.utc_offset_seconds,
            report_utc: settings.report_utc,
            supplementary: settings.supplementary_packets,
            line_noise: settings.line_noise,
            corrupt_seconds: settings.corrupt_gps_seconds.clone(),
            packets_sent: 0,
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    fn refill(&mut self) -> Result<()> {
        let gps_now = self.timeline.gps_now();
        while self.next_second * 1000 + self.latency_ms <= gps_now {
            let second = self.next_second;
            self.next_second += 1;

            // Nobody has listened for a while; only the latest seconds matter.
            if second * 1000 + self.latency_ms + 2000 < gps_now {
                continue;
            }

            if self.line_noise {
                self.pending.extend(LINE_NOISE);
            }
            let reported_second = if self.corrupt_seconds.contains(&second) {
                second + 7
            } else {
                second
            };
            let message =
                GpsTimingMessage::from_utc_millis(reported_second * 1000, self.utc_offset_seconds, self.report_utc)?;
            self.pending.extend(message.encode());
            if self.supplementary {
                self.pending
                    .extend(encode_supplementary_packet(&[0x00, 0x01, 0x02, 0x10, 0x03]));
            }
            self.packets_sent += 1;
        }

        if self.pending.len() > MAX_GPS_BACKLOG_BYTES {
            let excess = self.pending.len() - MAX_GPS_BACKLOG_BYTES;
            self.pending.drain(..excess);
        }
        Ok(())
    }
}

impl ByteChannel for SimulatedGpsFeed {
    fn bytes_available(&mut self) -> Result<usize> {
        self.refill()?;
        Ok(self.pending.len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        self.refill()?;
        Ok(self.pending.pop_front())
    }
}

/// Sync output and GPS 1PPS input lines
#[derive(Debug)]
pub struct SimulatedPulses {
    timeline: Arc<SimTimeline>,
    last_output: Option<u64>,
    last_input_second: Option<i64>,
}

impl SimulatedPulses {
    pub fn new(timeline: Arc<SimTimeline>) -> Self {
        Self {
            timeline,
            last_output: None,
            last_input_second: None,
        }
    }

    /// Sleep until `target_ms` or the deadline; false when stopped
    fn sleep_to(&self, target_ms: i64) -> bool {
        self.timeline
            .poller()
            .sleep_until(target_ms, Duration::from_millis(10))
    }
}

impl PulseSource for SimulatedPulses {
    fn wait_for_output_signal(&mut self, timeout: Duration) -> Result<bool> {
        let now = self.timeline.system_now();
        let deadline = now + timeout.as_millis() as i64;
        let width = self.timeline.pulse_width_ms();

        if let Some(mut index) = self.timeline.first_pulse_not_before(now - width) {
            if let Some(last) = self.last_output {
                index = index.max(last + 1);
            }
            while let Some(at) = self.timeline.pulse_system(index) {
                if at > deadline {
                    break;
                }
                if self.timeline.is_suppressed(index) {
                    index += 1;
                    continue;
                }
                if !self.sleep_to(at.max(now)) {
                    return Ok(false);
                }
                self.last_output = Some(index);
                return Ok(true);
            }
        }

        self.sleep_to(deadline);
        Ok(false)
    }

    fn wait_for_input_signal(&mut self, timeout: Duration) -> Result<bool> {
        let now = self.timeline.system_now();
        let deadline = now + timeout.as_millis() as i64;
        let offset = self.timeline.system_offset_ms();
        let width = self.timeline.pulse_width_ms();

        // Earliest GPS second whose pulse is still high at `now`
        let mut second = (now - offset - width).div_euclid(1000);
        if second * 1000 + offset + width < now {
            second += 1;
        }
        if let Some(last) = self.last_input_second {
            second = second.max(last + 1);
        }

        let at = second * 1000 + offset;
        if at <= deadline {
            if !self.sleep_to(at.max(now)) {
                return Ok(false);
            }
            self.last_input_second = Some(second);
            return Ok(true);
        }

        self.sleep_to(deadline);
        Ok(false)
    }

    fn get_output_signal_level(&mut self) -> Result<bool> {
        let now = self.timeline.system_now();
        Ok(self
            .timeline
            .last_pulse_at_or_before(now)
            .and_then(|index| self.timeline.pulse_system(index))
            .map(|at| now < at + self.timeline.pulse_width_ms())
            .unwrap_or(false))
    }
}

/// Camera that reads out one frame per sync pulse
#[derive(Debug)]
pub struct SimulatedCamera {
    timeline: Arc<SimTimeline>,
    width: usize,
    height: usize,
    readout_ms: i64,
    acquiring: bool,
    next_frame: Option<u64>,
    frames_read: u64,
}

impl SimulatedCamera {
    pub fn new(timeline: Arc<SimTimeline>, settings: &SimulatorSettings) -> Self {
        Self {
            timeline,
            width: settings.camera_width,
            height: settings.camera_height,
            readout_ms: settings.readout_ms,
            acquiring: false,
            next_frame: None,
            frames_read: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn discard_triggered(&mut self) {
        let now = self.timeline.system_now();
        self.next_frame = self.timeline.first_pulse_after(now);
    }

    /// Star field with a slowly drifting bright spot
    fn render(&self, frame: u64, buffer: &mut [u32]) {
        let spot_x = (frame as usize * 3) % self.width;
        let spot_y = (frame as usize * 2) % self.height;
        for (i, pixel) in buffer.iter_mut().enumerate() {
            let x = i % self.width;
            let y = i / self.width;
            let background = 100 + ((x * 31 + y * 17 + frame as usize * 7) % 64) as u32;
            let dx = x.abs_diff(spot_x);
            let dy = y.abs_diff(spot_y);
            *pixel = if dx <= 1 && dy <= 1 {
                background + 4000 / (1 + (dx + dy) as u32)
            } else {
                background
            };
        }
    }
}

impl Camera for SimulatedCamera {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn is_image_ready(&mut self) -> Result<bool> {
        if !self.acquiring {
            return Ok(false);
        }
        if self.next_frame.is_none() {
            // Pulses may have been programmed after acquisition started.
            self.discard_triggered();
        }
        let now = self.timeline.system_now();
        Ok(self
            .next_frame
            .and_then(|frame| self.timeline.pulse_system(frame))
            .map(|at| at + self.readout_ms <= now)
            .unwrap_or(false))
    }

    fn get_image(&mut self, buffer: &mut [u32]) -> Result<()> {
        if buffer.len() != self.width * self.height {
            return Err(SharedError::device(format!(
                "image buffer holds {} pixels, camera produces {}",
                buffer.len(),
                self.width * self.height
            )));
        }
        if !self.is_image_ready()? {
            return Err(SharedError::device("no image ready"));
        }
        let frame = self.next_frame.unwrap_or_default();
        self.render(frame, buffer);
        self.next_frame = Some(frame + 1);
        self.frames_read += 1;
        Ok(())
    }

    fn purge_images(&mut self) -> Result<()> {
        self.discard_triggered();
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<()> {
        self.acquiring = true;
        self.discard_triggered();
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.acquiring = false;
        Ok(())
    }
}

/// Parallel-port timer card; pulses at whole-second periods up to 30 s
#[derive(Debug)]
pub struct LegacyTimerCard {
    timeline: Arc<SimTimeline>,
    exposure_seconds: u32,
}

impl LegacyTimerCard {
    pub fn new(timeline: Arc<SimTimeline>) -> Self {
        Self {
            timeline,
            exposure_seconds: 0,
        }
    }

    pub fn exposure_seconds(&self) -> u32 {
        self.exposure_seconds
    }
}

impl TimingHardware for LegacyTimerCard {
    fn name(&self) -> &str {
        "legacy timer card"
    }

    fn max_exposure_seconds(&self) -> u32 {
        TIMER_CARD_MAX_EXPOSURE_SECONDS
    }

    fn set_exposure_time(&mut self, seconds: u32) -> Result<()> {
        check_exposure_time(seconds, TIMER_CARD_MAX_EXPOSURE_SECONDS)?;
        self.exposure_seconds = seconds;
        self.timeline.program(i64::from(seconds) * 1000);
        Ok(())
    }
}

/// Every simulated device wired to one timeline
pub struct SimulatedHardware {
    pub timeline: Arc<SimTimeline>,
    pub gps: SimulatedGpsFeed,
    pub pulses: SimulatedPulses,
    pub camera: SimulatedCamera,
    settings: SimulatorSettings,
}

impl SimulatedHardware {
    pub fn new(settings: &SimulatorSettings, poller: Poller) -> Result<Self> {
        settings.validate()?;
        let timeline = Arc::new(SimTimeline::new(settings, poller));
        info!(
            "🧪 Simulated hardware: system clock {:+} ms from GPS, {}x{} camera",
            settings.system_offset_ms, settings.camera_width, settings.camera_height
        );

        Ok(Self {
            gps: SimulatedGpsFeed::new(Arc::clone(&timeline), settings),
            pulses: SimulatedPulses::new(Arc::clone(&timeline)),
            camera: SimulatedCamera::new(Arc::clone(&timeline), settings),
            timeline,
            settings: settings.clone(),
        })
    }

    pub fn timer_card(&self) -> LegacyTimerCard {
        LegacyTimerCard::new(Arc::clone(&self.timeline))
    }

    pub fn timing_unit(&self) -> SimulatedTimingUnit {
        SimulatedTimingUnit::new(Arc::clone(&self.timeline), &self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::GpsDecoder;
    use crate::time::{TimeSource, VirtualClock};
    use std::sync::atomic::AtomicBool;

    const START_MS: i64 = 1_700_000_000_000;

    fn hardware(settings: SimulatorSettings) -> (Arc<VirtualClock>, Poller, SimulatedHardware) {
        let clock = Arc::new(VirtualClock::new(START_MS));
        let poller = Poller::new(clock.clone(), Arc::new(AtomicBool::new(true)));
        let hardware = SimulatedHardware::new(&settings, poller.clone()).unwrap();
        (clock, poller, hardware)
    }

    #[test]
    fn test_pulses_follow_programmed_period() {
        let (clock, _poller, mut hw) = hardware(SimulatorSettings::default());
        hw.timer_card().set_exposure_time(5).unwrap();

        // First pulse lands on the next whole GPS second, 3 ms late on the host clock.
        assert!(hw.pulses.wait_for_output_signal(Duration::from_millis(2000)).unwrap());
        assert_eq!(clock.now_ms(), START_MS + 3);

        // The same pulse is not reported twice.
        assert!(!hw.pulses.wait_for_output_signal(Duration::from_millis(200)).unwrap());

        clock.set(START_MS + 9950);
        assert!(hw.pulses.wait_for_output_signal(Duration::from_millis(200)).unwrap());
        assert_eq!(clock.now_ms(), START_MS + 10_003);
    }

    #[test]
    fn test_suppressed_pulse_is_not_detected() {
        let settings = SimulatorSettings {
            suppressed_pulses: vec![1],
            ..SimulatorSettings::default()
        };
        let (clock, _poller, mut hw) = hardware(settings);
        hw.timer_card().set_exposure_time(2).unwrap();

        clock.set(START_MS + 1900);
        assert!(!hw.pulses.wait_for_output_signal(Duration::from_millis(200)).unwrap());
        assert_eq!(clock.now_ms(), START_MS + 2100);
    }

    #[test]
    fn test_no_pulses_when_stopped() {
        let (clock, _poller, mut hw) = hardware(SimulatorSettings::default());
        hw.timer_card().set_exposure_time(0).unwrap();
        assert!(!hw.pulses.wait_for_output_signal(Duration::from_millis(3000)).unwrap());
        assert_eq!(clock.now_ms(), START_MS + 3000);
    }

    #[test]
    fn test_gps_feed_reports_each_second() {
        let (clock, poller, mut hw) = hardware(SimulatorSettings {
            line_noise: true,
            ..SimulatorSettings::default()
        });
        let mut decoder = GpsDecoder::new();

        clock.set(START_MS + 990);
        hw.gps.drain().unwrap();
        let gps = decoder
            .read_timestamp(&mut hw.gps, &poller, Duration::from_millis(1000))
            .unwrap();
        assert_eq!(gps, Some(START_MS + 1000));
        // Packet for GPS second N leaves the receiver latency after N (+ system offset).
        assert_eq!(clock.now_ms(), START_MS + 1000 + 25 + 3);
        assert_eq!(decoder.stats().malformed, 0);
    }

    #[test]
    fn test_corrupt_second_reports_wrong_time() {
        let second = START_MS / 1000 + 1;
        let (clock, poller, mut hw) = hardware(SimulatorSettings {
            corrupt_gps_seconds: vec![second],
            ..SimulatorSettings::default()
        });
        clock.set(START_MS + 990);
        hw.gps.drain().unwrap();
        let gps = GpsDecoder::new()
            .read_timestamp(&mut hw.gps, &poller, Duration::from_millis(1000))
            .unwrap();
        assert_eq!(gps, Some((second + 7) * 1000));
    }

    #[test]
    fn test_input_pulse_on_gps_second() {
        let (clock, _poller, mut hw) = hardware(SimulatorSettings::default());
        clock.set(START_MS + 985);
        assert!(hw.pulses.wait_for_input_signal(Duration::from_millis(20)).unwrap());
        assert_eq!(clock.now_ms(), START_MS + 1003);

        clock.set(START_MS + 1500);
        assert!(!hw.pulses.wait_for_input_signal(Duration::from_millis(20)).unwrap());
        assert_eq!(clock.now_ms(), START_MS + 1520);
    }

    #[test]
    fn test_camera_reads_out_after_pulse() {
        let (clock, _poller, mut hw) = hardware(SimulatorSettings::default());
        hw.timer_card().set_exposure_time(5).unwrap();
        hw.camera.start_acquisition().unwrap();

        clock.set(START_MS + 50);
        assert!(!hw.camera.is_image_ready().unwrap());
        clock.set(START_MS + 103);
        assert!(hw.camera.is_image_ready().unwrap());

        hw.camera.purge_images().unwrap();
        assert!(!hw.camera.is_image_ready().unwrap());

        clock.set(START_MS + 5103);
        let mut pixels = vec![0u32; 64 * 48];
        hw.camera.get_image(&mut pixels).unwrap();
        assert!(pixels.iter().any(|&p| p > 1000));
        assert!(!hw.camera.is_image_ready().unwrap());
        assert_eq!(hw.camera.frames_read(), 1);
    }

    #[test]
    fn test_timer_card_rejects_long_exposures() {
        let (_clock, _poller, hw) = hardware(SimulatorSettings::default());
        let mut card = hw.timer_card();
        assert!(matches!(
            card.set_exposure_time(31),
            Err(SharedError::InvalidExposureTime { seconds: 31, max: 30 })
        ));
        assert_eq!(card.max_exposure_seconds(), 30);
    }
}
