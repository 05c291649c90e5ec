/*!
GPS-synchronised camera exposure acquisition.

The [`capture`] loop waits for hardware sync pulses, timestamps each exposure
boundary against GPS time through the [`frame_sync`] state machine and hands
completed exposures to a sink. [`hardware`] wires up simulated or serial
devices from the [`config`].
*/

pub mod capture;
pub mod config;
pub mod frame_sync;
pub mod hardware;

pub use capture::{AcquisitionEvent, ChannelSink, ExposureAcquisition, RunSummary};
pub use config::{AppConfig, HardwarePath};
pub use frame_sync::{FrameSyncEngine, FrameSyncState, StopReason, SyncStats, SyncTuning};
pub use hardware::{AcquisitionDevices, CommandTimeServer};
