/*!
Exposure records and image buffers.
*/

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::time::format_millis;

/// What the frame was taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Focus,
    Dark,
    Flat,
    #[default]
    Target,
}

/// Row-major pixel intensities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u32>,
}

impl ImageBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }
}

/// One camera frame bounded by two sync pulses
#[derive(Debug, Clone, Serialize)]
pub struct Exposure {
    pub sequence_number: u64,
    pub image_type: ImageType,
    /// Nominal exposure length
    pub duration_ms: i64,
    pub system_start_ms: i64,
    pub system_end_ms: i64,
    pub gps_start_ms: i64,
    pub gps_end_ms: i64,
    /// Start boundary was an observed pulse rather than a predicted time
    pub start_confirmed: bool,
    pub end_confirmed: bool,
    /// GPS value came from the clock model rather than a live reading
    pub gps_start_estimated: bool,
    pub gps_end_estimated: bool,
    #[serde(skip)]
    pub image: Option<ImageBuffer>,
}

impl Exposure {
    /// Exposure beginning at the given boundary
    pub fn starting_at(
        sequence_number: u64,
        image_type: ImageType,
        duration_ms: i64,
        system_start_ms: i64,
        gps_start_ms: i64,
    ) -> Self {
        Self {
            sequence_number,
            image_type,
            duration_ms,
            system_start_ms,
            system_end_ms: system_start_ms,
            gps_start_ms,
            gps_end_ms: gps_start_ms,
            start_confirmed: true,
            end_confirmed: false,
            gps_start_estimated: false,
            gps_end_estimated: false,
            image: None,
        }
    }

    /// Close the exposure at the given boundary
    pub fn finish(&mut self, system_end_ms: i64, gps_end_ms: i64, confirmed: bool, gps_estimated: bool) {
        self.system_end_ms = system_end_ms.max(self.system_start_ms);
        self.gps_end_ms = gps_end_ms;
        self.end_confirmed = confirmed;
        self.gps_end_estimated = gps_estimated;
    }

    /// Measured length on the GPS clock
    pub fn gps_duration_ms(&self) -> i64 {
        self.gps_end_ms - self.gps_start_ms
    }

    pub fn system_duration_ms(&self) -> i64 {
        self.system_end_ms - self.system_start_ms
    }

    /// Both boundaries observed and GPS-timed
    pub fn is_fully_confirmed(&self) -> bool {
        self.start_confirmed && self.end_confirmed && !self.gps_start_estimated && !self.gps_end_estimated
    }

    /// One-line JSON description without pixel data
    pub fn summary_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn describe(&self) -> String {
        format!(
            "#{} {:?} GPS {} -> {} ({} ms)",
            self.sequence_number,
            self.image_type,
            format_millis(self.gps_start_ms),
            format_millis(self.gps_end_ms),
            self.gps_duration_ms()
        )
    }
}
