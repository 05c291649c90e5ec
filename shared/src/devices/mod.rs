/*!
Device interfaces used by the acquisition loop.

Each physical collaborator sits behind a small trait so the acquisition
loop can be driven by real hardware ([`serial`]) or by the in-process
simulator (`crate::simulator`).
*/

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Result, SharedError};
use crate::exposure::Exposure;
use crate::timing_unit::TimingStatus;

pub mod serial;

pub use serial::{ModemLinePulses, SerialChannel};

/// Byte-oriented serial link
pub trait ByteChannel: Send {
    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read one byte, `None` when nothing arrived before the link's read timeout
    fn read_byte(&mut self) -> Result<Option<u8>>;

    fn write_bytes(&mut self, _bytes: &[u8]) -> Result<()> {
        Err(SharedError::device("channel does not accept writes"))
    }

    /// Discard everything currently buffered; returns the number of bytes dropped
    fn drain(&mut self) -> Result<usize> {
        let mut dropped = 0;
        while self.bytes_available()? > 0 {
            if self.read_byte()?.is_none() {
                break;
            }
            dropped += 1;
        }
        Ok(dropped)
    }
}

/// Hardware pulse lines: the camera sync output and the GPS 1PPS input
pub trait PulseSource: Send {
    /// Wait for the next camera sync pulse; false when none arrived in time
    fn wait_for_output_signal(&mut self, timeout: Duration) -> Result<bool>;

    /// Wait for the next GPS pulse-per-second edge
    fn wait_for_input_signal(&mut self, timeout: Duration) -> Result<bool>;

    fn get_output_signal_level(&mut self) -> Result<bool>;
}

/// Camera triggered by the external sync pulses
pub trait Camera: Send {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn is_image_ready(&mut self) -> Result<bool>;

    /// Copy the oldest completed image into `buffer` (row-major, `width * height`)
    fn get_image(&mut self, buffer: &mut [u32]) -> Result<()>;

    /// Drop every image the camera has buffered or is currently reading out
    fn purge_images(&mut self) -> Result<()>;

    fn start_acquisition(&mut self) -> Result<()>;
    fn stop_acquisition(&mut self) -> Result<()>;
}

/// Network time resynchronisation, fire-and-forget
pub trait TimeServer: Send {
    fn resync_with_time_server(&mut self) -> Result<()>;
}

/// Receives completed exposures
pub trait ExposureSink: Send {
    fn on_exposure_complete(&mut self, exposure: Exposure);

    fn on_status(&mut self, _status: &TimingStatus) {}
}

/// Device that generates the camera sync pulses at the exposure cadence
pub trait TimingHardware: Send {
    fn name(&self) -> &str;

    fn max_exposure_seconds(&self) -> u32;

    /// Program the pulse period; zero stops pulse generation
    fn set_exposure_time(&mut self, seconds: u32) -> Result<()>;

    /// Latest pulse times reported by the hardware, if it can report them,
    /// giving up once `budget` has passed
    fn status(&mut self, _budget: Duration) -> Result<Option<TimingStatus>> {
        Ok(None)
    }
}

/// Validate an exposure time against a hardware limit
pub fn check_exposure_time(seconds: u32, max: u32) -> Result<()> {
    if seconds > max {
        return Err(SharedError::InvalidExposureTime { seconds, max });
    }
    Ok(())
}

/// Channel backed by in-memory buffers, handy for replaying captured bytes
#[derive(Debug, Default)]
pub struct MemoryChannel {
    input: VecDeque<u8>,
    written: Vec<u8>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(bytes: &[u8]) -> Self {
        Self {
            input: bytes.iter().copied().collect(),
            written: Vec::new(),
        }
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl ByteChannel for MemoryChannel {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.input.len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.input.pop_front())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empties_channel() {
        let mut channel = MemoryChannel::with_input(&[1, 2, 3]);
        assert_eq!(channel.drain().unwrap(), 3);
        assert_eq!(channel.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_exposure_limits() {
        assert!(check_exposure_time(30, 30).is_ok());
        assert!(check_exposure_time(0, 30).is_ok());
        assert!(matches!(
            check_exposure_time(31, 30),
            Err(SharedError::InvalidExposureTime { seconds: 31, max: 30 })
        ));
    }
}
