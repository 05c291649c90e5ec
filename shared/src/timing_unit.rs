/*!
USB timing unit protocol client.

The timing unit generates the camera sync pulses and timestamps them against
its own GPS receiver. The host talks to it with short DLE/ETX framed
request/response exchanges:

```text
request   DLE type 0x00 [payload] DLE ETX
response  DLE type status [DLE] payload DLE ETX
```

The extra DLE after the status byte is present only when the status byte
itself equals DLE. The status byte is a set of [`ClockState`] flags; the
"updating" flags mean the unit is busy latching a new value and the request
should be repeated after a short pause.
*/

use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::devices::{check_exposure_time, ByteChannel, TimingHardware};
use crate::error::{Result, SharedError};
use crate::protocol::{DLE, ETX, MAX_PACKET_BYTES, TIMING_UNIT_MAX_EXPOSURE_SECONDS};
use crate::time::{Polled, Poller};

/// Timestamp layout used by the timestamp replies
pub const TIMESTAMP_FORMAT: &str = "%Y:%m:%d:%H:%M:%S:%3f";

/// Request/response message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Echo,
    GetGpsTime,
    GetExposureTime,
    GetSyncTime,
    SetExposureTime,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Echo => 0x01,
            MessageType::GetGpsTime => 0x23,
            MessageType::GetExposureTime => 0x24,
            MessageType::GetSyncTime => 0x25,
            MessageType::SetExposureTime => 0x44,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = SharedError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x01 => Ok(MessageType::Echo),
            0x23 => Ok(MessageType::GetGpsTime),
            0x24 => Ok(MessageType::GetExposureTime),
            0x25 => Ok(MessageType::GetSyncTime),
            0x44 => Ok(MessageType::SetExposureTime),
            other => Err(SharedError::invalid_response(format!(
                "unknown message type 0x{:02x}",
                other
            ))),
        }
    }
}

/// How a status byte should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Reply is valid
    Good,
    /// Reply is valid but the unit has lost its GPS lock or serial feed
    Degraded,
    /// Unit is latching a new value; repeat the request
    Updating,
    /// Request cannot succeed
    Hard,
}

/// Status flags reported in every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockState(pub u8);

impl ClockState {
    pub const NO_ERROR: u8 = 0x01;
    pub const PACKET_ID_INVALID: u8 = 0x02;
    pub const UTC_TIME_UPDATING: u8 = 0x04;
    pub const SYNC_TIME_UPDATING: u8 = 0x08;
    pub const BAD_TIMING_PACKET: u8 = 0x10;
    pub const NO_GPS_LOCK: u8 = 0x20;
    pub const NO_GPS_SERIAL: u8 = 0x40;

    const FLAG_NAMES: [(u8, &'static str); 7] = [
        (Self::NO_ERROR, "no error"),
        (Self::PACKET_ID_INVALID, "packet id invalid"),
        (Self::UTC_TIME_UPDATING, "UTC time updating"),
        (Self::SYNC_TIME_UPDATING, "sync time updating"),
        (Self::BAD_TIMING_PACKET, "bad timing packet"),
        (Self::NO_GPS_LOCK, "no GPS lock"),
        (Self::NO_GPS_SERIAL, "no GPS serial"),
    ];

    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn classify(self) -> StatusClass {
        if self.has(Self::PACKET_ID_INVALID) || self.has(Self::BAD_TIMING_PACKET) {
            StatusClass::Hard
        } else if self.has(Self::UTC_TIME_UPDATING) || self.has(Self::SYNC_TIME_UPDATING) {
            StatusClass::Updating
        } else if self.0 == Self::NO_ERROR {
            StatusClass::Good
        } else if self.has(Self::NO_ERROR)
            && self.0 & !(Self::NO_ERROR | Self::NO_GPS_LOCK | Self::NO_GPS_SERIAL) == 0
        {
            StatusClass::Degraded
        } else {
            StatusClass::Hard
        }
    }
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.has(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "0x{:02x}", self.0)
        } else {
            write!(f, "0x{:02x} ({})", self.0, names.join(", "))
        }
    }
}

/// Latest pulse times reported by the timing hardware (epoch ms, UTC)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingStatus {
    pub last_sync_ms: Option<i64>,
    pub last_gps_ms: Option<i64>,
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingUnitResponse {
    pub message_type: u8,
    pub status: ClockState,
    pub payload: Vec<u8>,
}

/// Request `[DLE, type, 0, DLE, ETX]`
pub fn build_request(message_type: MessageType) -> Vec<u8> {
    vec![DLE, message_type.code(), 0x00, DLE, ETX]
}

/// Set-exposure request carrying the time as four ASCII digits
pub fn build_set_exposure_request(seconds: u32) -> Result<Vec<u8>> {
    check_exposure_time(seconds, TIMING_UNIT_MAX_EXPOSURE_SECONDS)?;
    let mut request = vec![DLE, MessageType::SetExposureTime.code(), 0x00];
    request.extend_from_slice(format!("{:04}", seconds).as_bytes());
    request.extend_from_slice(&[DLE, ETX]);
    Ok(request)
}

/// Encode a reply the way the timing unit sends it
pub fn encode_response(message_type: u8, status: ClockState, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![DLE, message_type, status.0];
    if status.0 == DLE {
        frame.push(DLE);
    }
    for &byte in payload {
        frame.push(byte);
        if byte == DLE {
            frame.push(DLE);
        }
    }
    frame.extend_from_slice(&[DLE, ETX]);
    frame
}

/// Decode a complete reply frame
pub fn parse_response(frame: &[u8]) -> Result<TimingUnitResponse> {
    if frame.first() != Some(&DLE) {
        return Err(SharedError::invalid_response(format!(
            "reply does not start with DLE: {}",
            hex::encode(frame)
        )));
    }
    if frame.len() < 5 || !frame.ends_with(&[DLE, ETX]) {
        return Err(SharedError::invalid_response(format!(
            "incomplete reply: {}",
            hex::encode(frame)
        )));
    }

    let status = ClockState(frame[2]);
    let mut start = 3;
    if status.0 == DLE {
        if frame[3] != DLE {
            return Err(SharedError::invalid_response("status byte DLE is not doubled"));
        }
        start = 4;
    }
    let end = frame.len() - 2;
    if start > end {
        return Err(SharedError::invalid_response(format!(
            "truncated reply: {}",
            hex::encode(frame)
        )));
    }

    let mut payload = Vec::with_capacity(end - start);
    let mut body = frame[start..end].iter().copied().peekable();
    while let Some(byte) = body.next() {
        payload.push(byte);
        if byte == DLE && body.peek() == Some(&DLE) {
            body.next();
        }
    }

    Ok(TimingUnitResponse {
        message_type: frame[1],
        status,
        payload,
    })
}

/// Parse a `yyyy:MM:dd:HH:mm:ss:SSS` payload; empty means no time yet
pub fn parse_timestamp_payload(payload: &[u8]) -> Result<Option<i64>> {
    if payload.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(payload)
        .map_err(|_| SharedError::invalid_response("timestamp is not ASCII"))?;
    let parsed = NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
        .map_err(|e| SharedError::invalid_response(format!("bad timestamp {:?}: {}", text, e)))?;
    Ok(Some(parsed.and_utc().timestamp_millis()))
}

/// Format epoch milliseconds as a timestamp payload
pub fn format_timestamp_payload(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default()
}

fn parse_digits(payload: &[u8]) -> Result<u32> {
    let digits = payload
        .get(..4)
        .filter(|d| d.iter().all(u8::is_ascii_digit))
        .ok_or_else(|| {
            SharedError::invalid_response(format!("expected four digits, got {}", hex::encode(payload)))
        })?;
    Ok(digits
        .iter()
        .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0')))
}

/// Per-operation time budgets in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingUnitTimeouts {
    pub exposure_ms: u64,
    pub sync_time_ms: u64,
    pub gps_time_ms: u64,
    pub echo_ms: u64,
    /// How long to wait for a reply before resending
    pub read_ms: u64,
    /// Pause after an "updating" reply
    pub busy_backoff_ms: u64,
}

impl Default for TimingUnitTimeouts {
    fn default() -> Self {
        Self {
            exposure_ms: 1100,
            sync_time_ms: 11_000,
            gps_time_ms: 900,
            echo_ms: 100,
            read_ms: 20,
            busy_backoff_ms: 2,
        }
    }
}

/// Collects one reply; ends at ETX after an odd trailing DLE run
#[derive(Debug, Default)]
struct ResponseAssembler {
    buffer: Vec<u8>,
}

impl ResponseAssembler {
    fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.buffer.push(byte);

        // The first byte after a request is the start of the reply, whatever it is.
        if self.buffer[0] != DLE || self.buffer.len() > MAX_PACKET_BYTES {
            return Some(std::mem::take(&mut self.buffer));
        }

        if byte == ETX && self.buffer.len() >= 3 {
            let body = &self.buffer[1..self.buffer.len() - 1];
            let trailing = body.iter().rev().take_while(|&&b| b == DLE).count();
            if trailing % 2 == 1 {
                return Some(std::mem::take(&mut self.buffer));
            }
        }
        None
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Client for the USB timing unit
pub struct TimingUnitClient<C: ByteChannel> {
    channel: C,
    poller: Poller,
    timeouts: TimingUnitTimeouts,
    assembler: ResponseAssembler,
    updating_replies: u64,
}

impl<C: ByteChannel> TimingUnitClient<C> {
    pub fn new(channel: C, poller: Poller) -> Self {
        Self {
            channel,
            poller,
            timeouts: TimingUnitTimeouts::default(),
            assembler: ResponseAssembler::default(),
            updating_replies: 0,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimingUnitTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check the unit answers an echo request
    pub fn echo(&mut self) -> Result<()> {
        let request = build_request(MessageType::Echo);
        let response = self.transact(MessageType::Echo, &request, self.timeouts.echo_ms)?;
        if response.payload != [MessageType::Echo.code()] {
            return Err(SharedError::invalid_response(format!(
                "echo payload {}",
                hex::encode(&response.payload)
            )));
        }
        Ok(())
    }

    /// Exposure time currently programmed into the unit (seconds)
    pub fn get_exposure_time(&mut self) -> Result<u32> {
        let request = build_request(MessageType::GetExposureTime);
        let response = self.transact(MessageType::GetExposureTime, &request, self.timeouts.exposure_ms)?;
        parse_digits(&response.payload)
    }

    /// Program the exposure time (0 to 9999 s); zero stops the sync pulses
    pub fn set_exposure_time(&mut self, seconds: u32) -> Result<()> {
        let request = build_set_exposure_request(seconds)?;
        let response = self.transact(MessageType::SetExposureTime, &request, self.timeouts.exposure_ms)?;
        let acknowledged = parse_digits(&response.payload)?;
        if acknowledged != seconds {
            return Err(SharedError::invalid_response(format!(
                "requested exposure time {} s, unit acknowledged {} s",
                seconds, acknowledged
            )));
        }
        debug!("Timing unit exposure time set to {} s", seconds);
        Ok(())
    }

    /// GPS timestamp of the last camera sync pulse
    pub fn get_last_sync_pulse_time(&mut self) -> Result<Option<i64>> {
        self.query_timestamp(MessageType::GetSyncTime, self.timeouts.sync_time_ms)
    }

    /// GPS timestamp of the last GPS pulse-per-second
    pub fn get_last_gps_pulse_time(&mut self) -> Result<Option<i64>> {
        self.query_timestamp(MessageType::GetGpsTime, self.timeouts.gps_time_ms)
    }

    fn query_timestamp(&mut self, message_type: MessageType, timeout_ms: u64) -> Result<Option<i64>> {
        let request = build_request(message_type);
        let response = self.transact(message_type, &request, timeout_ms)?;
        parse_timestamp_payload(&response.payload)
    }

    /// Number of "updating" replies seen so far
    pub fn updating_replies(&self) -> u64 {
        self.updating_replies
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Send `request` until a usable reply arrives or `timeout_ms` passes
    fn transact(&mut self, message_type: MessageType, request: &[u8], timeout_ms: u64) -> Result<TimingUnitResponse> {
        let started = self.poller.now_ms();
        let deadline = started + timeout_ms as i64;
        let read_window = self.timeouts.read_ms.max(1) as i64;

        loop {
            if !self.poller.is_running() {
                return Err(SharedError::Stopped);
            }

            self.assembler.reset();
            let stale = self.channel.drain()?;
            if stale > 0 {
                trace!("Dropped {} stale bytes before {:?} request", stale, message_type);
            }
            self.channel.write_bytes(request)?;

            let read_deadline = (self.poller.now_ms() + read_window).min(deadline);
            if let Some(frame) = self.read_frame(read_deadline)? {
                let response = parse_response(&frame)?;
                if response.message_type != message_type.code() {
                    return Err(SharedError::invalid_response(format!(
                        "sent {:?} (0x{:02x}) but reply has type 0x{:02x}",
                        message_type,
                        message_type.code(),
                        response.message_type
                    )));
                }

                match response.status.classify() {
                    StatusClass::Good => return Ok(response),
                    StatusClass::Degraded => {
                        warn!("⚠️ Timing unit status {} for {:?}", response.status, message_type);
                        return Ok(response);
                    }
                    StatusClass::Updating => {
                        self.updating_replies += 1;
                        trace!("Timing unit busy ({}), retrying {:?}", response.status, message_type);
                        self.poller
                            .sleep(Duration::from_millis(self.timeouts.busy_backoff_ms));
                    }
                    StatusClass::Hard => {
                        return Err(SharedError::hard_device(format!(
                            "{:?} request failed with status {}",
                            message_type, response.status
                        )));
                    }
                }
            }

            let now = self.poller.now_ms();
            if now >= deadline {
                return Err(SharedError::timeout(
                    format!("timing unit {:?} reply", message_type),
                    (now - started) as u64,
                ));
            }
        }
    }

    fn read_frame(&mut self, deadline_ms: i64) -> Result<Option<Vec<u8>>> {
        let channel = &mut self.channel;
        let assembler = &mut self.assembler;
        let polled = self.poller.poll_until(deadline_ms, Duration::from_millis(1), || {
            while channel.bytes_available()? > 0 {
                let Some(byte) = channel.read_byte()? else {
                    break;
                };
                if let Some(frame) = assembler.push(byte) {
                    return Ok(Some(frame));
                }
            }
            Ok(None)
        })?;

        match polled {
            Polled::Ready(frame) => Ok(Some(frame)),
            Polled::Expired | Polled::Stopped => Ok(None),
        }
    }
}

impl<C: ByteChannel> TimingHardware for TimingUnitClient<C> {
    fn name(&self) -> &str {
        "USB timing unit"
    }

    fn max_exposure_seconds(&self) -> u32 {
        TIMING_UNIT_MAX_EXPOSURE_SECONDS
    }

    fn set_exposure_time(&mut self, seconds: u32) -> Result<()> {
        TimingUnitClient::set_exposure_time(self, seconds)
    }

    /// Both pulse-time queries share `budget`; each keeps its own cap
    fn status(&mut self, budget: Duration) -> Result<Option<TimingStatus>> {
        let deadline = self.poller.now_ms() + budget.as_millis() as i64;

        let sync_budget = self.timeouts.sync_time_ms.min(budget.as_millis() as u64);
        let last_sync_ms = self.query_timestamp(MessageType::GetSyncTime, sync_budget)?;

        let remaining = deadline - self.poller.now_ms();
        if remaining <= 0 {
            return Err(SharedError::timeout("timing unit status", budget.as_millis() as u64));
        }
        let gps_budget = self.timeouts.gps_time_ms.min(remaining as u64);
        let last_gps_ms = self.query_timestamp(MessageType::GetGpsTime, gps_budget)?;

        Ok(Some(TimingStatus {
            last_sync_ms,
            last_gps_ms,
        }))
    }
}
