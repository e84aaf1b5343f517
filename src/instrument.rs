use crate::codec::Dialect;
use crate::dialect::{CounterDialect, StageDialect, TemperatureDialect};
use crate::error::Result;

/// The instruments of the lab kit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    DelayStage,
    CoincidenceCounter,
    TemperatureController,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::DelayStage => "delay_stage",
            InstrumentKind::CoincidenceCounter => "coincidence_counter",
            InstrumentKind::TemperatureController => "temperature_controller",
        }
    }

    /// The opcode table this kind of instrument speaks.
    pub fn dialect(&self) -> &'static dyn Dialect {
        match self {
            InstrumentKind::DelayStage => &StageDialect,
            InstrumentKind::CoincidenceCounter => &CounterDialect,
            InstrumentKind::TemperatureController => &TemperatureDialect,
        }
    }
}

/// Lifecycle shared by every driver.
pub trait Instrument {
    fn kind(&self) -> InstrumentKind;

    fn is_open(&self) -> bool;

    /// Release the serial port. Idempotent; afterwards every operation fails
    /// with [`InstrumentError::ClosedHandle`](crate::InstrumentError::ClosedHandle).
    fn close(&mut self) -> Result<()>;
}
