/*!
GPS serial packet framing and decoding.

The GPS receiver streams DLE/ETX framed report packets. A packet starts at a
DLE byte and ends at an ETX byte that is immediately preceded by an odd run of
DLE bytes; DLE bytes inside the packet body are doubled. Only the primary
timing packet (`0x8F-AB`) is decoded, everything else is counted and dropped.

Byte offsets below count the leading DLE as index 0 of the unstuffed frame:

| Offset | Field                         |
|--------|-------------------------------|
| 1      | packet id (`0x8F`)            |
| 2      | subcode (`0xAB`)              |
| 3..7   | GPS time of week (s)          |
| 7..9   | GPS week number               |
| 9..11  | UTC offset (s, signed)        |
| 11     | timing flags (bit 0 = UTC)    |
| 12     | seconds                       |
| 13     | minutes                       |
| 14     | hours                         |
| 15     | day of month                  |
| 16     | month                         |
| 17..19 | year                          |
*/

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::devices::ByteChannel;
use crate::error::{Result, SharedError};
use crate::protocol::{
    DLE, ETX, GPS_TIMING_PACKET, MAX_PACKET_BYTES, PRIMARY_TIMING_PACKET_LEN, PRIMARY_TIMING_SUBCODE,
    SUPPLEMENTARY_TIMING_SUBCODE,
};
use crate::time::{Polled, Poller};

/// Timing flag bit set when the packet carries UTC rather than GPS time
pub const TIMING_FLAG_UTC: u8 = 0x01;

/// Timing flag bit set when the packet reports the PPS on UTC rather than GPS
pub const TIMING_FLAG_UTC_PPS: u8 = 0x02;

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06)
const GPS_EPOCH_UNIX_SECONDS: i64 = 315_964_800;

const SECONDS_PER_WEEK: i64 = 7 * 24 * 3600;

/// Decoded primary timing packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpsTimingMessage {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub utc_offset_seconds: i16,
    pub timing_flags: u8,
}

impl GpsTimingMessage {
    /// Build a message describing `utc_ms` (truncated to the second).
    /// When `as_utc` is false the calendar fields are given on the GPS scale,
    /// `utc_offset_seconds` behind the UTC instant.
    pub fn from_utc_millis(utc_ms: i64, utc_offset_seconds: i16, as_utc: bool) -> Result<Self> {
        let calendar_ms = if as_utc {
            utc_ms
        } else {
            utc_ms - i64::from(utc_offset_seconds) * 1000
        };
        let t = DateTime::<Utc>::from_timestamp_millis(calendar_ms)
            .ok_or_else(|| SharedError::malformed_packet(format!("timestamp {} out of range", calendar_ms)))?;
        let year = u16::try_from(t.year())
            .map_err(|_| SharedError::malformed_packet(format!("year {} out of range", t.year())))?;

        Ok(Self {
            year,
            month: t.month() as u8,
            day: t.day() as u8,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
            utc_offset_seconds,
            timing_flags: if as_utc {
                TIMING_FLAG_UTC | TIMING_FLAG_UTC_PPS
            } else {
                0
            },
        })
    }

    /// True when the calendar fields are already UTC
    pub fn is_utc(&self) -> bool {
        self.timing_flags & TIMING_FLAG_UTC != 0
    }

    /// Milliseconds since the Unix epoch. GPS-scale messages have the UTC
    /// offset added to the calendar instant.
    pub fn to_utc_millis(&self) -> Result<i64> {
        let date = NaiveDate::from_ymd_opt(i32::from(self.year), u32::from(self.month), u32::from(self.day))
            .ok_or_else(|| {
                SharedError::malformed_packet(format!(
                    "invalid date {:04}-{:02}-{:02}",
                    self.year, self.month, self.day
                ))
            })?;

        // A leap second is carried as 60 and maps onto chrono's 59.1000 representation.
        let time = if self.second == 60 {
            NaiveTime::from_hms_milli_opt(u32::from(self.hour), u32::from(self.minute), 59, 1_000)
        } else {
            NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), u32::from(self.second))
        }
        .ok_or_else(|| {
            SharedError::malformed_packet(format!(
                "invalid time {:02}:{:02}:{:02}",
                self.hour, self.minute, self.second
            ))
        })?;

        let calendar_ms = date.and_time(time).and_utc().timestamp_millis();
        if self.is_utc() {
            Ok(calendar_ms)
        } else {
            Ok(calendar_ms + i64::from(self.utc_offset_seconds) * 1000)
        }
    }

    /// Encode as a framed, DLE-stuffed primary timing packet
    pub fn encode(&self) -> Vec<u8> {
        let utc_seconds = self.to_utc_millis().map(|ms| ms.div_euclid(1000)).unwrap_or(0);
        let gps_seconds = (utc_seconds - GPS_EPOCH_UNIX_SECONDS + i64::from(self.utc_offset_seconds)).max(0);
        let week = (gps_seconds / SECONDS_PER_WEEK) as u16;
        let time_of_week = (gps_seconds % SECONDS_PER_WEEK) as u32;

        let mut body = Vec::with_capacity(PRIMARY_TIMING_PACKET_LEN);
        body.push(GPS_TIMING_PACKET);
        body.push(PRIMARY_TIMING_SUBCODE);
        body.extend_from_slice(&time_of_week.to_be_bytes());
        body.extend_from_slice(&week.to_be_bytes());
        body.extend_from_slice(&self.utc_offset_seconds.to_be_bytes());
        body.push(self.timing_flags);
        body.push(self.second);
        body.push(self.minute);
        body.push(self.hour);
        body.push(self.day);
        body.push(self.month);
        body.extend_from_slice(&self.year.to_be_bytes());
        frame_packet(&body)
    }
}

/// Wrap a packet body (id onwards) in DLE ... DLE ETX, doubling body DLEs
pub fn frame_packet(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(DLE);
    for &byte in body {
        frame.push(byte);
        if byte == DLE {
            frame.push(DLE);
        }
    }
    frame.push(DLE);
    frame.push(ETX);
    frame
}

/// Supplementary timing packet (`0x8F-AC`) with an opaque body
pub fn encode_supplementary_packet(payload: &[u8]) -> Vec<u8> {
    let mut body = vec![GPS_TIMING_PACKET, SUPPLEMENTARY_TIMING_SUBCODE];
    body.extend_from_slice(payload);
    frame_packet(&body)
}

/// Collapse doubled DLE bytes back to single bytes
pub fn unstuff(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len());
    let mut i = 0;
    while i < frame.len() {
        out.push(frame[i]);
        if frame[i] == DLE && frame.get(i + 1) == Some(&DLE) {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

/// Parse one complete frame as produced by [`FrameAssembler`].
///
/// Returns `Ok(None)` for well-formed packets of other types.
pub fn parse_packet(frame: &[u8]) -> Result<Option<GpsTimingMessage>> {
    let packet = unstuff(frame);

    if packet.len() < 3 || packet[1] != GPS_TIMING_PACKET || packet[2] != PRIMARY_TIMING_SUBCODE {
        return Ok(None);
    }

    if packet.len() < PRIMARY_TIMING_PACKET_LEN {
        return Err(SharedError::malformed_packet(format!(
            "primary timing packet has {} bytes, expected {}",
            packet.len(),
            PRIMARY_TIMING_PACKET_LEN
        )));
    }

    let message = GpsTimingMessage {
        year: u16::from_be_bytes([packet[17], packet[18]]),
        month: packet[16],
        day: packet[15],
        hour: packet[14],
        minute: packet[13],
        second: packet[12],
        utc_offset_seconds: i16::from_be_bytes([packet[9], packet[10]]),
        timing_flags: packet[11],
    };

    // Reject calendar values that do not form a real instant.
    message.to_utc_millis()?;
    Ok(Some(message))
}

/// Splits a byte stream into DLE ... DLE ETX frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    in_frame: bool,
    dle_run: usize,
    overruns: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns the raw (still stuffed) frame when one completes.
    ///
    /// Resynchronisation only happens on an odd DLE run. Noise ending in an
    /// even run of DLEs swallows the next packet's leading DLE, so that packet
    /// comes out as an unrecognised frame and its second is lost.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if !self.in_frame {
            if byte == DLE {
                self.start_frame();
            }
            return None;
        }

        self.buffer.push(byte);
        match byte {
            DLE => self.dle_run += 1,
            ETX if self.dle_run % 2 == 1 => {
                self.in_frame = false;
                self.dle_run = 0;
                return Some(std::mem::take(&mut self.buffer));
            }
            _ if self.dle_run % 2 == 1 => {
                // An unpaired DLE followed by data is the start of a new packet;
                // whatever came before it was noise or a truncated packet.
                trace!("Resynchronising on unpaired DLE, dropping {} bytes", self.buffer.len() - 2);
                self.buffer.drain(..self.buffer.len() - 2);
                self.dle_run = 0;
            }
            _ => self.dle_run = 0,
        }

        if self.buffer.len() > MAX_PACKET_BYTES {
            self.overruns += 1;
            self.reset();
        }
        None
    }

    /// Discard any partially assembled frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.dle_run = 0;
    }

    pub fn has_partial_frame(&self) -> bool {
        self.in_frame
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    fn start_frame(&mut self) {
        self.buffer.clear();
        self.buffer.push(DLE);
        self.in_frame = true;
        self.dle_run = 0;
    }
}

/// Decoder counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub frames: u64,
    pub decoded: u64,
    pub unrecognised: u64,
    pub malformed: u64,
    pub overruns: u64,
}

/// Reads primary timing messages from a GPS byte channel
#[derive(Debug)]
pub struct GpsDecoder {
    assembler: FrameAssembler,
    stats: DecoderStats,
    poll_interval: Duration,
}

impl GpsDecoder {
    pub fn new() -> Self {
        Self {
            assembler: FrameAssembler::new(),
            stats: DecoderStats::default(),
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Read the next primary timing message within `budget`.
    ///
    /// Returns `Ok(None)` when no complete recognised message arrived in
    /// time or the poller was stopped. Malformed frames are logged and
    /// skipped. Only channel failures are errors.
    pub fn read_message(
        &mut self,
        channel: &mut dyn ByteChannel,
        poller: &Poller,
        budget: Duration,
    ) -> Result<Option<GpsTimingMessage>> {
        let deadline = poller.now_ms() + budget.as_millis() as i64;
        let assembler = &mut self.assembler;
        let stats = &mut self.stats;

        let polled = poller.poll_until(deadline, self.poll_interval, || {
            while channel.bytes_available()? > 0 {
                let Some(byte) = channel.read_byte()? else {
                    break;
                };
                let Some(frame) = assembler.push(byte) else {
                    continue;
                };
                stats.frames += 1;
                match parse_packet(&frame) {
                    Ok(Some(message)) => {
                        stats.decoded += 1;
                        return Ok(Some(message));
                    }
                    Ok(None) => {
                        stats.unrecognised += 1;
                        trace!("Skipping GPS packet {}", hex::encode(&frame));
                    }
                    Err(e) => {
                        stats.malformed += 1;
                        warn!("⚠️ Discarding GPS packet: {} ({})", e, hex::encode(&frame));
                    }
                }
            }
            Ok(None)
        })?;
        self.stats.overruns = self.assembler.overruns();

        match polled {
            Polled::Ready(message) => Ok(Some(message)),
            Polled::Expired => {
                debug!("No GPS timing packet within {} ms", budget.as_millis());
                self.assembler.reset();
                Ok(None)
            }
            Polled::Stopped => Ok(None),
        }
    }

    /// Read the next message and convert it to epoch milliseconds.
    /// Messages whose instant cannot be composed are treated as missing.
    pub fn read_timestamp(
        &mut self,
        channel: &mut dyn ByteChannel,
        poller: &Poller,
        budget: Duration,
    ) -> Result<Option<i64>> {
        Ok(self
            .read_message(channel, poller, budget)?
            .and_then(|message| message.to_utc_millis().ok()))
    }

    /// Drop partial frames and any bytes waiting on the channel
    pub fn flush(&mut self, channel: &mut dyn ByteChannel) -> Result<usize> {
        self.assembler.reset();
        channel.drain()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

impl Default for GpsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MemoryChannel;
    use crate::time::VirtualClock;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// 2008-04-06 16:49:03 UTC, offset 14 s, UTC flags set
    const SAMPLE_PACKET: [u8; 21] = [
        0x10, 0x8F, 0xAB, 0x00, 0x00, 0x00, 0x00, 0x05, 0x9E, 0x00, 0x0E, 0x03, 0x03, 0x31, 0x10,
        0x10, 0x06, 0x04, 0x07, 0xD8, 0x10,
    ];

    fn sample_frame() -> Vec<u8> {
        let mut frame = SAMPLE_PACKET.to_vec();
        frame.push(ETX);
        frame
    }

    fn assemble(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut assembler = FrameAssembler::new();
        bytes.iter().filter_map(|&b| assembler.push(b)).collect()
    }

    fn poller() -> Poller {
        Poller::new(Arc::new(VirtualClock::new(0)), Arc::new(AtomicBool::new(true)))
    }

    #[test]
    fn test_sample_packet_decodes() {
        let frames = assemble(&sample_frame());
        assert_eq!(frames.len(), 1);

        let message = parse_packet(&frames[0]).unwrap().unwrap();
        assert_eq!(message.year, 2008);
        assert_eq!(message.month, 4);
        assert_eq!(message.day, 6);
        assert_eq!(message.hour, 16);
        assert_eq!(message.minute, 49);
        assert_eq!(message.second, 3);
        assert_eq!(message.utc_offset_seconds, 14);
        assert!(message.is_utc());
        assert_eq!(message.to_utc_millis().unwrap(), 1_207_500_543_000);
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut bytes = vec![0x55, 0x03, 0x10, 0x03, 0xAA, 0x10, 0x42, 0x99];
        bytes.extend_from_slice(&sample_frame());
        let frames = assemble(&bytes);
        let decoded: Vec<_> = frames
            .iter()
            .filter_map(|f| parse_packet(f).ok().flatten())
            .collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].to_utc_millis().unwrap(), 1_207_500_543_000);
    }

    #[test]
    fn test_stuffed_dle_before_etx_does_not_end_frame() {
        // Payload byte 0x10 followed by 0x03 must not terminate the frame.
        let message = GpsTimingMessage {
            year: 2010,
            month: 3,
            day: 16,
            hour: 16,
            minute: 0,
            second: 3,
            utc_offset_seconds: 15,
            timing_flags: TIMING_FLAG_UTC,
        };
        let frame = message.encode();
        let frames = assemble(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
        assert_eq!(parse_packet(&frames[0]).unwrap(), Some(message));
    }

    #[test]
    fn test_even_dle_noise_loses_following_packet() {
        let mut bytes = vec![0x55, 0x10, 0x10];
        bytes.extend_from_slice(&sample_frame());
        bytes.extend_from_slice(&sample_frame());

        let frames = assemble(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..4], &[0x10, 0x10, 0x10, 0x8F]);
        assert_eq!(parse_packet(&frames[0]).unwrap(), None);
        // The decoder is back in step for the next second.
        assert!(parse_packet(&frames[1]).unwrap().is_some());
    }

    #[test]
    fn test_even_dle_run_before_etx_continues() {
        let frames = assemble(&[0x10, 0x8F, 0x10, 0x10, 0x03, 0x42, 0x10, 0x03]);
        assert_eq!(frames, vec![vec![0x10, 0x8F, 0x10, 0x10, 0x03, 0x42, 0x10, 0x03]]);
    }

    #[test]
    fn test_odd_dle_run_of_three_ends_frame() {
        let frames = assemble(&[0x10, 0x8F, 0x10, 0x10, 0x10, 0x03]);
        assert_eq!(frames.len(), 1);
        assert_eq!(unstuff(&frames[0]), vec![0x10, 0x8F, 0x10, 0x10, 0x03]);
    }

    #[test]
    fn test_gps_scale_adds_offset() {
        let mut message = parse_packet(&sample_frame()).unwrap().unwrap();
        message.timing_flags = 0;
        assert!(!message.is_utc());
        assert_eq!(message.to_utc_millis().unwrap(), 1_207_500_543_000 + 14_000);
    }

    #[test]
    fn test_from_utc_millis_roundtrip_gps_scale() {
        let utc_ms = 1_700_000_000_000;
        let message = GpsTimingMessage::from_utc_millis(utc_ms, 18, false).unwrap();
        assert!(!message.is_utc());
        assert_eq!(message.second, 2);
        assert_eq!(message.to_utc_millis().unwrap(), utc_ms);
    }

    #[test]
    fn test_leap_second_accepted() {
        let message = GpsTimingMessage {
            year: 2016,
            month: 12,
            day: 31,
            hour: 23,
            minute: 59,
            second: 60,
            utc_offset_seconds: 18,
            timing_flags: TIMING_FLAG_UTC,
        };
        let next = GpsTimingMessage { second: 0, minute: 0, hour: 0, day: 1, month: 1, year: 2017, ..message };
        assert_eq!(message.to_utc_millis().unwrap(), next.to_utc_millis().unwrap());
    }

    #[test]
    fn test_short_primary_packet_is_malformed() {
        let frame = frame_packet(&[0x8F, 0xAB, 0x00, 0x01]);
        assert!(matches!(parse_packet(&frame), Err(SharedError::MalformedPacket(_))));
    }

    #[test]
    fn test_invalid_calendar_is_malformed() {
        let mut packet = SAMPLE_PACKET.to_vec();
        packet[17] = 13; // month, shifted by the doubled hour byte
        packet.push(ETX);
        assert!(matches!(parse_packet(&packet), Err(SharedError::MalformedPacket(_))));
    }

    #[test]
    fn test_other_packets_are_unrecognised() {
        assert_eq!(parse_packet(&encode_supplementary_packet(&[1, 2, 3])).unwrap(), None);
        assert_eq!(parse_packet(&frame_packet(&[0x41, 0x00])).unwrap(), None);
    }

    #[test]
    fn test_overlong_frame_resets() {
        let mut assembler = FrameAssembler::new();
        assembler.push(DLE);
        for _ in 0..=MAX_PACKET_BYTES {
            assert!(assembler.push(0x42).is_none());
        }
        assert_eq!(assembler.overruns(), 1);
        assert!(!assembler.has_partial_frame());
    }

    #[test]
    fn test_decoder_skips_bad_packets() {
        let mut bytes = encode_supplementary_packet(&[0x00; 8]);
        bytes.extend(frame_packet(&[0x8F, 0xAB, 0x01]));
        bytes.extend(sample_frame());
        let mut channel = MemoryChannel::with_input(&bytes);
        let mut decoder = GpsDecoder::new();

        let message = decoder
            .read_message(&mut channel, &poller(), Duration::from_millis(1000))
            .unwrap();
        assert_eq!(message.unwrap().second, 3);

        let stats = decoder.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.unrecognised, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.decoded, 1);
    }

    #[test]
    fn test_decoder_times_out_without_packet() {
        let mut channel = MemoryChannel::with_input(&[0x10, 0x8F, 0xAB, 0x00]);
        let poller = poller();
        let start = poller.now_ms();
        let mut decoder = GpsDecoder::new();

        let message = decoder
            .read_message(&mut channel, &poller, Duration::from_millis(1000))
            .unwrap();
        assert!(message.is_none());
        assert_eq!(poller.now_ms() - start, 1000);
    }

    #[test]
    fn test_decoder_returns_none_when_stopped() {
        let mut channel = MemoryChannel::with_input(&sample_frame());
        let poller = poller();
        poller.stop();
        let mut decoder = GpsDecoder::new();
        assert!(decoder
            .read_message(&mut channel, &poller, Duration::from_millis(1000))
            .unwrap()
            .is_none());
    }
}
