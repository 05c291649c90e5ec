/*!
Serial-port bindings.

[`SerialChannel`] carries the GPS receiver feed or the USB timing unit's
virtual COM port. [`ModemLinePulses`] watches modem status lines for the
pulses: CTS carries the camera sync output and DCD the GPS 1PPS.
*/

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::info;

use super::{ByteChannel, PulseSource};
use crate::error::{Result, SharedError};
use crate::time::{Polled, Poller};

/// Byte channel over a serial port
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialChannel {
    /// Open `path`; `read_timeout` bounds each single-byte read
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        info!("🔌 Opening serial port: {} at {} bps", path, baud_rate);

        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| SharedError::device_open(path, e))?;

        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ByteChannel for SerialChannel {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }
}

/// Rising-edge detection on modem status lines
pub struct ModemLinePulses {
    port: Box<dyn SerialPort>,
    poller: Poller,
    poll_interval: Duration,
    output_level: bool,
    input_level: bool,
}

impl ModemLinePulses {
    pub fn open(path: &str, poller: Poller) -> Result<Self> {
        info!("🔌 Opening pulse lines on {}", path);

        let mut port = serialport::new(path, 9600)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| SharedError::device_open(path, e))?;
        let output_level = port.read_clear_to_send()?;
        let input_level = port.read_carrier_detect()?;

        Ok(Self {
            port,
            poller,
            poll_interval: Duration::from_millis(1),
            output_level,
            input_level,
        })
    }

    fn wait_for_edge(&mut self, timeout: Duration, output: bool) -> Result<bool> {
        let deadline = self.poller.now_ms() + timeout.as_millis() as i64;
        let port = &mut self.port;
        let last_level = if output {
            &mut self.output_level
        } else {
            &mut self.input_level
        };

        let polled = self.poller.poll_until(deadline, self.poll_interval, || {
            let level = if output {
                port.read_clear_to_send()?
            } else {
                port.read_carrier_detect()?
            };
            let rising = level && !*last_level;
            *last_level = level;
            Ok(rising.then_some(()))
        })?;

        Ok(matches!(polled, Polled::Ready(())))
    }
}

impl PulseSource for ModemLinePulses {
    fn wait_for_output_signal(&mut self, timeout: Duration) -> Result<bool> {
        self.wait_for_edge(timeout, true)
    }

    fn wait_for_input_signal(&mut self, timeout: Duration) -> Result<bool> {
        self.wait_for_edge(timeout, false)
    }

    fn get_output_signal_level(&mut self) -> Result<bool> {
        Ok(self.port.read_clear_to_send()?)
    }
}
