/*!
# Shared Types and Utilities

This crate contains the protocol, clock and device layers used by the
GPS-timed exposure acquisition application.

## Core Types

- [`GpsTimingMessage`] - Decoded primary timing packet
- [`ClockCorrelation`] - System-to-GPS clock correction model
- [`TimingUnitClient`] - Request/response client for the USB timing unit
- [`Exposure`] - A timestamped camera frame

## Modules

- [`gps`] - GPS serial packet framing and decoding
- [`correlation`] - Clock correlation model
- [`timing_unit`] - Timing unit protocol client
- [`exposure`] - Exposure records and image buffers
- [`devices`] - Device interfaces and serial-port bindings
- [`simulator`] - In-process hardware simulator
- [`time`] - Time sources and cooperative polling
- [`error`] - Common error types
*/

pub mod correlation;
pub mod devices;
pub mod error;
pub mod exposure;
pub mod gps;
pub mod simulator;
pub mod time;
pub mod timing_unit;

// Re-export commonly used types
pub use correlation::{ClockCorrelation, ClockMeasurement, CorrectionSnapshot};
pub use error::{Result, SharedError};
pub use exposure::{Exposure, ImageBuffer, ImageType};
pub use gps::{GpsDecoder, GpsTimingMessage};
pub use time::{Poller, Polled, SystemClock, TimeSource, VirtualClock};
pub use timing_unit::{ClockState, TimingStatus, TimingUnitClient};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Packet start byte, doubled when it appears inside a packet
    pub const DLE: u8 = 0x10;

    /// Packet end byte when preceded by an odd run of DLE bytes
    pub const ETX: u8 = 0x03;

    /// GPS report packet carrying timing information
    pub const GPS_TIMING_PACKET: u8 = 0x8F;

    /// Primary timing packet subcode
    pub const PRIMARY_TIMING_SUBCODE: u8 = 0xAB;

    /// Supplementary timing packet subcode (ignored by the decoder)
    pub const SUPPLEMENTARY_TIMING_SUBCODE: u8 = 0xAC;

    /// Unstuffed length of a primary timing packet including DLE/ETX framing
    pub const PRIMARY_TIMING_PACKET_LEN: usize = 21;

    /// Largest frame the assemblers will buffer before resynchronising
    pub const MAX_PACKET_BYTES: usize = 512;

    /// Largest exposure time accepted by the legacy timer card (seconds)
    pub const TIMER_CARD_MAX_EXPOSURE_SECONDS: u32 = 30;

    /// Largest exposure time accepted by the USB timing unit (seconds)
    pub const TIMING_UNIT_MAX_EXPOSURE_SECONDS: u32 = 9999;
}
