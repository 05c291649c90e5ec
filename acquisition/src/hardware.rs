/*!
Device wiring for an acquisition run.

Builds the set of device handles the capture loop drives, either from the
in-process simulator or from serial ports. The camera driver belongs to the
embedding application, so real hardware needs one passed in.
*/

use std::process::Command;
use std::thread;
use std::time::Duration;

use shared::devices::{ByteChannel, Camera, ModemLinePulses, PulseSource, SerialChannel, TimeServer, TimingHardware};
use shared::simulator::SimulatedHardware;
use shared::timing_unit::{TimingUnitClient, TimingUnitTimeouts};
use shared::{Poller, Result, SharedError};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, HardwarePath};

/// Read timeout for serial ports; the decoder polls in 1 ms steps
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Owned handles for everything the capture loop talks to
pub struct AcquisitionDevices {
    pub gps: Box<dyn ByteChannel>,
    pub pulses: Box<dyn PulseSource>,
    pub camera: Box<dyn Camera>,
    pub timing: Box<dyn TimingHardware>,
    pub time_server: Box<dyn TimeServer>,
}

impl AcquisitionDevices {
    /// Open the devices selected by `config`
    pub fn open(config: &AppConfig, poller: &Poller, camera: Option<Box<dyn Camera>>) -> Result<Self> {
        if config.acquisition.simulate_hardware {
            let hardware = SimulatedHardware::new(&config.simulator, poller.clone())?;
            // Never touch the host clock while simulating.
            let time_server = Box::new(CommandTimeServer::new(Vec::new()));
            return Ok(Self::from_simulator(
                hardware,
                config.acquisition.hardware_path,
                config.timing_unit.clone(),
                time_server,
            ));
        }

        let camera = camera.ok_or_else(|| {
            SharedError::device_open("camera", "no camera driver available, enable simulate_hardware")
        })?;
        Self::open_serial(config, poller, camera)
    }

    /// Wire every simulated device to one timeline
    pub fn from_simulator(
        hardware: SimulatedHardware,
        path: HardwarePath,
        timeouts: TimingUnitTimeouts,
        time_server: Box<dyn TimeServer>,
    ) -> Self {
        let timing: Box<dyn TimingHardware> = match path {
            HardwarePath::LegacyTimerCard => Box::new(hardware.timer_card()),
            HardwarePath::UsbTimingUnit => {
                let poller = hardware.timeline.poller().clone();
                Box::new(TimingUnitClient::new(hardware.timing_unit(), poller).with_timeouts(timeouts))
            }
        };

        Self {
            gps: Box::new(hardware.gps),
            pulses: Box::new(hardware.pulses),
            camera: Box::new(hardware.camera),
            timing,
            time_server,
        }
    }

    fn open_serial(config: &AppConfig, poller: &Poller, camera: Box<dyn Camera>) -> Result<Self> {
        let devices = &config.devices;

        let timing: Box<dyn TimingHardware> = match config.acquisition.hardware_path {
            HardwarePath::UsbTimingUnit => {
                let channel =
                    SerialChannel::open(&devices.timing_unit_port, devices.timing_unit_baud_rate, SERIAL_READ_TIMEOUT)?;
                let mut client = TimingUnitClient::new(channel, poller.clone()).with_timeouts(config.timing_unit.clone());
                client.echo()?;
                info!("🔌 Timing unit answering on {}", devices.timing_unit_port);
                Box::new(client)
            }
            HardwarePath::LegacyTimerCard => {
                return Err(SharedError::device_open(
                    "timer card",
                    "the parallel-port timer card is only available in simulation",
                ))
            }
        };

        let gps = SerialChannel::open(&devices.gps_port, devices.gps_baud_rate, SERIAL_READ_TIMEOUT)?;
        let pulses = ModemLinePulses::open(&devices.pulse_port, poller.clone())?;
        info!("🔌 Pulse lines on {}", devices.pulse_port);

        Ok(Self {
            gps: Box::new(gps),
            pulses: Box::new(pulses),
            camera,
            timing,
            time_server: Box::new(CommandTimeServer::new(devices.resync_command.clone())),
        })
    }
}

/// Resyncs the host clock by running an external command.
///
/// The command is spawned and reaped on a helper thread; the caller never
/// waits for it.
#[derive(Debug, Clone)]
pub struct CommandTimeServer {
    command: Vec<String>,
}

impl CommandTimeServer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl TimeServer for CommandTimeServer {
    fn resync_with_time_server(&mut self) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            debug!("No resync command configured");
            return Ok(());
        };

        let mut child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| SharedError::device(format!("failed to run {}: {}", program, e)))?;
        info!("🕒 Resyncing system clock with {}", self.command.join(" "));

        let program = program.clone();
        thread::spawn(move || match child.wait() {
            Ok(status) if status.success() => debug!("{} finished", program),
            Ok(status) => warn!("⚠️ {} exited with {}", program, status),
            Err(e) => warn!("⚠️ Failed to wait for {}: {}", program, e),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::VirtualClock;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn poller() -> Poller {
        Poller::new(
            Arc::new(VirtualClock::new(1_700_000_000_000)),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn test_simulated_devices_follow_hardware_path() {
        let mut config = AppConfig::new();
        config.acquisition.hardware_path = HardwarePath::LegacyTimerCard;
        let devices = AcquisitionDevices::open(&config, &poller(), None).unwrap();
        assert_eq!(devices.timing.max_exposure_seconds(), 30);

        config.acquisition.hardware_path = HardwarePath::UsbTimingUnit;
        let devices = AcquisitionDevices::open(&config, &poller(), None).unwrap();
        assert_eq!(devices.timing.max_exposure_seconds(), 9999);
    }

    #[test]
    fn test_real_hardware_requires_camera() {
        let mut config = AppConfig::new();
        config.acquisition.simulate_hardware = false;
        let result = AcquisitionDevices::open(&config, &poller(), None);
        assert!(matches!(result, Err(SharedError::DeviceOpen { .. })));
    }

    #[test]
    fn test_empty_resync_command_is_noop() {
        let mut server = CommandTimeServer::new(Vec::new());
        assert!(server.resync_with_time_server().is_ok());
    }

    #[test]
    fn test_missing_resync_program_reports_error() {
        let mut server = CommandTimeServer::new(vec!["/nonexistent/resync-clock".to_string()]);
        assert!(matches!(server.resync_with_time_server(), Err(SharedError::Device(_))));
    }
}
