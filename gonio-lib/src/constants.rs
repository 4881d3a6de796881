// Protocol constants shared with the rig firmware

use std::time::Duration;

/// Default token separator on the wire
pub const DEFAULT_SEPARATOR: char = ',';

/// Separator used by the Arduino firmware build
pub const FIRMWARE_SEPARATOR: char = ';';

/// Bound applied to every ACK wait (start and stop handshakes)
pub const ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Bound applied to a single blocking channel read
pub const READ_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pause before re-reading when a read returned no data
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pause the firmware needs between two outbound commands
pub const COMMAND_DELAY: Duration = Duration::from_millis(1500);

/// Default serial baud rate of the rig
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Payload fields following DATA in a measurement record (polar, azimuth, raw)
pub const MEASURE_RECORD_FIELDS: usize = 3;

/// Payload fields following DATA in a calibration record (offset)
pub const CALIBRATION_RECORD_FIELDS: usize = 1;

/// Polar angle of the far pole, in degrees
pub const FAR_POLE_DEG: f32 = 180.0;

/// Default regular expression used to pick the rig among serial ports
pub const DEFAULT_DEVICE_REGEX: &str = ".*[aA]rduino.*";
