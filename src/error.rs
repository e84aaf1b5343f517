use std::time::Duration;

use crate::codec::Opcode;
use crate::config::ConfigError;

/// Every failure the protocol layer can report.
///
/// Variants are grouped by who is at fault: the port (`PortUnavailable`,
/// `ClosedHandle`, `Io`), the wire (`Timeout`, `Malformed`), the device
/// (`DeviceError`), the caller (`OutOfRange`, `InvalidConfig`, `NotHomed`) or a
/// composite operation that ran out of budget (`MotionTimeout`,
/// `StabilizationTimeout`, `Cancelled`).
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("Serial port {port} is unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Instrument handle is closed")]
    ClosedHandle,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response within {waited:?}")]
    Timeout { waited: Duration },

    #[error("Malformed response '{raw}': {reason}")]
    Malformed { raw: String, reason: String },

    #[error("Device reported error code {code}")]
    DeviceError { code: i32 },

    #[error("The {dialect} dialect has no mapping for {opcode:?}")]
    UnsupportedOpcode {
        dialect: &'static str,
        opcode: Opcode,
    },

    #[error("Cannot encode {opcode:?}: {reason}")]
    Encode { opcode: Opcode, reason: String },

    #[error("{quantity} {value} is outside the allowed range [{min}, {max}]")]
    OutOfRange {
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stage must be homed before it can move")]
    NotHomed,

    #[error("Motion did not complete after {attempts} timed-out polls or {elapsed:?}")]
    MotionTimeout { attempts: u32, elapsed: Duration },

    #[error("Stage stopped at {actual_mm} mm, target was {target_mm} mm")]
    PositionNotReached { target_mm: f64, actual_mm: f64 },

    #[error("Temperature did not settle at {setpoint_c} °C (last reading {last_c:?})")]
    StabilizationTimeout {
        setpoint_c: f64,
        last_c: Option<f64>,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl InstrumentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Only a bare timeout is transient. Protocol and device faults mean the
    /// line or the instrument is in an unexpected state.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }

    pub(crate) fn malformed(raw: &[u8], reason: impl Into<String>) -> Self {
        Self::Malformed {
            raw: String::from_utf8_lossy(raw).into_owned(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for InstrumentError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl From<serialport::Error> for InstrumentError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => Self::Io(std::io::Error::new(kind, err.description)),
            _ => Self::Io(std::io::Error::other(err.description)),
        }
    }
}

pub type Result<T> = std::result::Result<T, InstrumentError>;
