/*!
Simulated USB timing unit.

Answers requests written to it with replies queued for reading, the way the
real unit does over its virtual COM port. Setting the exposure time
reprograms the shared pulse timeline.
*/

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use super::{SimTimeline, SimulatorSettings};
use crate::devices::ByteChannel;
use crate::error::Result;
use crate::protocol::{DLE, ETX, TIMING_UNIT_MAX_EXPOSURE_SECONDS};
use crate::timing_unit::{encode_response, format_timestamp_payload, ClockState, MessageType};

#[derive(Debug)]
pub struct SimulatedTimingUnit {
    timeline: Arc<SimTimeline>,
    pending: VecDeque<u8>,
    exposure_seconds: u32,
    updating_replies: u32,
    degraded: bool,
    pulse_times_busy: bool,
}

impl SimulatedTimingUnit {
    pub fn new(timeline: Arc<SimTimeline>, settings: &SimulatorSettings) -> Self {
        Self {
            timeline,
            pending: VecDeque::new(),
            exposure_seconds: 0,
            updating_replies: settings.timing_unit_updating_replies,
            degraded: settings.timing_unit_degraded,
            pulse_times_busy: settings.timing_unit_pulse_times_busy,
        }
    }

    fn ok_status(&self) -> ClockState {
        if self.degraded {
            ClockState(ClockState::NO_ERROR | ClockState::NO_GPS_LOCK)
        } else {
            ClockState(ClockState::NO_ERROR)
        }
    }

    /// Consume one pending "updating" reply, if any remain
    fn take_updating(&mut self) -> bool {
        match self.updating_replies {
            0 => false,
            u32::MAX => true,
            _ => {
                self.updating_replies -= 1;
                true
            }
        }
    }

    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let malformed = request.len() < 5 || request[0] != DLE || !request.ends_with(&[DLE, ETX]);
        let code = request.get(1).copied().unwrap_or(0);
        let message_type = match MessageType::try_from(code) {
            Ok(message_type) if !malformed => message_type,
            _ => return encode_response(code, ClockState(ClockState::PACKET_ID_INVALID), &[]),
        };

        let pulse_query = matches!(message_type, MessageType::GetSyncTime | MessageType::GetGpsTime);
        if (pulse_query && self.pulse_times_busy) || self.take_updating() {
            let busy = ClockState(self.ok_status().0 | ClockState::SYNC_TIME_UPDATING);
            return encode_response(code, busy, &[]);
        }

        let payload: Vec<u8> = match message_type {
            MessageType::Echo => vec![MessageType::Echo.code()],
            MessageType::GetExposureTime => format!("{:04}", self.exposure_seconds).into_bytes(),
            MessageType::SetExposureTime => {
                let digits = &request[3..request.len() - 2];
                let seconds = std::str::from_utf8(digits)
                    .ok()
                    .filter(|d| d.len() == 4)
                    .and_then(|d| d.parse::<u32>().ok())
                    .filter(|&s| s <= TIMING_UNIT_MAX_EXPOSURE_SECONDS);
                let Some(seconds) = seconds else {
                    return encode_response(code, ClockState(ClockState::PACKET_ID_INVALID), &[]);
                };
                self.exposure_seconds = seconds;
                self.timeline.program(i64::from(seconds) * 1000);
                format!("{:04}", seconds).into_bytes()
            }
            MessageType::GetSyncTime => {
                let now = self.timeline.system_now();
                self.timeline
                    .last_pulse_at_or_before(now)
                    .and_then(|index| self.timeline.pulse_gps(index))
                    .map(|gps| format_timestamp_payload(gps).into_bytes())
                    .unwrap_or_default()
            }
            MessageType::GetGpsTime => {
                let last_second = self.timeline.gps_now().div_euclid(1000) * 1000;
                format_timestamp_payload(last_second).into_bytes()
            }
        };
        encode_response(code, self.ok_status(), &payload)
    }
}

impl ByteChannel for SimulatedTimingUnit {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.pending.len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.pending.pop_front())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let reply = self.respond(bytes);
        trace!("Simulated timing unit {} -> {}", hex::encode(bytes), hex::encode(&reply));
        self.pending.extend(reply);
        Ok(())
    }
}
