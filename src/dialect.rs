//! Opcode tables for the three instruments of the lab kit.
//!
//! Each table lists the wire mnemonic, parameter order and reply shape of every
//! opcode the instrument understands. Opcodes missing from a table are
//! rejected with [`InstrumentError::UnsupportedOpcode`](crate::InstrumentError::UnsupportedOpcode).

use crate::codec::{Dialect, Opcode, OpcodeEntry, ParamKind, ResponseShape};

/// Stage positions travel as millimetres with four decimals, i.e. in tenths
/// of a micrometre.
pub const POSITION_SCALE: u8 = 4;
/// Crystal temperatures travel as degrees Celsius with three decimals.
pub const TEMPERATURE_SCALE: u8 = 3;
/// The counter takes its dwell time in seconds with millisecond resolution.
pub const DWELL_SCALE: u8 = 3;
/// TEC current and voltage readbacks.
pub const ELECTRICAL_SCALE: u8 = 3;

/// Motorized delay stage: 9600 baud, requests end in `\n`.
///
/// | opcode       | request             | reply                  |
/// |--------------|---------------------|------------------------|
/// | Home         | `:HOME`             | `OK`                   |
/// | MoveAbsolute | `:MOVE ABS 12.3456` | `OK`                   |
/// | MotionStatus | `MOVE?`             | `1` moving, `0` done   |
/// | Position     | `POSI?`             | mm, e.g. `12.3456`     |
/// | Stop         | `:STOP`             | `OK`                   |
#[derive(Debug, Clone, Copy, Default)]
pub struct StageDialect;

static STAGE_TABLE: &[OpcodeEntry] = &[
    OpcodeEntry {
        opcode: Opcode::Home,
        mnemonic: ":HOME",
        params: &[],
        reply: ResponseShape::Ack,
    },
    OpcodeEntry {
        opcode: Opcode::MoveAbsolute,
        mnemonic: ":MOVE ABS",
        params: &[ParamKind::Decimal {
            scale: POSITION_SCALE,
        }],
        reply: ResponseShape::Ack,
    },
    OpcodeEntry {
        opcode: Opcode::MotionStatus,
        mnemonic: "MOVE?",
        params: &[],
        reply: ResponseShape::Flag,
    },
    OpcodeEntry {
        opcode: Opcode::Position,
        mnemonic: "POSI?",
        params: &[],
        reply: ResponseShape::Decimal {
            scale: POSITION_SCALE,
        },
    },
    OpcodeEntry {
        opcode: Opcode::Stop,
        mnemonic: ":STOP",
        params: &[],
        reply: ResponseShape::Ack,
    },
];

impl Dialect for StageDialect {
    fn name(&self) -> &'static str {
        "delay stage"
    }

    fn terminator(&self) -> &'static str {
        "\n"
    }

    fn table(&self) -> &'static [OpcodeEntry] {
        STAGE_TABLE
    }
}

/// CC1 coincidence counter: 19200 baud, requests end in `\n`.
///
/// | opcode               | request       | reply                   |
/// |----------------------|---------------|-------------------------|
/// | SetDwellTime         | `:DWEL 0.100` | `OK`                    |
/// | DwellTime            | `DWEL?`       | ms, e.g. `100ms`        |
/// | SetCoincidenceWindow | `:WIND 3`     | `OK`                    |
/// | CoincidenceWindow    | `WIND?`       | ns, e.g. `3`            |
/// | SetChannelDelay      | `:DELA 4`     | `OK`                    |
/// | ChannelDelay         | `DELA?`       | ns, e.g. `4`            |
/// | ReadCounts           | `COUN?`       | `ch1,ch2,coincidences`  |
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDialect;

static COUNTER_TABLE: &[OpcodeEntry] = &[
    OpcodeEntry {
        opcode: Opcode::SetDwellTime,
        mnemonic: ":DWEL",
        params: &[ParamKind::Decimal { scale: DWELL_SCALE }],
        reply: ResponseShape::Ack,
    },
    OpcodeEntry {
        opcode: Opcode::DwellTime,
        mnemonic: "DWEL?",
        params: &[],
        reply: ResponseShape::Integer { suffix: Some("ms") },
    },
    OpcodeEntry {
        opcode: Opcode::SetCoincidenceWindow,
        mnemonic: ":WIND",
        params: &[ParamKind::Integer],
        reply: ResponseShape::Ack,
    },
    OpcodeEntry {
        opcode: Opcode::CoincidenceWindow,
        mnemonic: "WIND?",
        params: &[],
        reply: ResponseShape::Integer { suffix: Some("ns") },
    },
    OpcodeEntry {
        opcode: Opcode::SetChannelDelay,
        mnemonic: ":DELA",
        params: &[ParamKind::Integer],
        reply: ResponseShape::Ack,
    },
    OpcodeEntry {
        opcode: Opcode::ChannelDelay,
        mnemonic: "DELA?",
        params: &[],
        reply: ResponseShape::Integer { suffix: Some("ns") },
    },
    OpcodeEntry {
        opcode: Opcode::ReadCounts,
        mnemonic: "COUN?",
        params: &[],
        reply: ResponseShape::Counts,
    },
];

impl Dialect for CounterDialect {
    fn name(&self) -> &'static str {
        "coincidence counter"
    }

    fn terminator(&self) -> &'static str {
        "\n"
    }

    fn table(&self) -> &'static [OpcodeEntry] {
        COUNTER_TABLE
    }
}

/// Crystal temperature controller of the bi-photon source: 115200 baud,
/// requests end in `\r\n`. Setpoints are integers in millidegrees
/// (10000–50000 on the stock firmware).
///
/// | opcode       | request       | reply                  |
/// |--------------|---------------|------------------------|
/// | SetSetpoint  | `:SETT 45000` | `OK`                   |
/// | Setpoint     | `SETP?`       | m°C, e.g. `45000`      |
/// | Temperature  | `TEMP?`       | °C, e.g. `44.987`      |
/// | TecCurrent   | `CURR?`       | A                      |
/// | TecVoltage   | `VOLT?`       | V                      |
/// | FaultStatus  | `FAUL?`       | `0` ok, `1` fault      |
/// | HeatingState | `HORC?`       | `H` or `C`             |
/// | Firmware     | `FIRM?`       | free text              |
#[derive(Debug, Clone, Copy, Default)]
pub struct TemperatureDialect;

static TEMPERATURE_TABLE: &[OpcodeEntry] = &[
    OpcodeEntry {
        opcode: Opcode::SetSetpoint,
        mnemonic: ":SETT",
        params: &[ParamKind::Integer],
        reply: ResponseShape::Ack,
    },
    OpcodeEntry {
        opcode: Opcode::Setpoint,
        mnemonic: "SETP?",
        params: &[],
        reply: ResponseShape::Integer { suffix: None },
    },
    OpcodeEntry {
        opcode: Opcode::Temperature,
        mnemonic: "TEMP?",
        params: &[],
        reply: ResponseShape::Decimal {
            scale: TEMPERATURE_SCALE,
        },
    },
    OpcodeEntry {
        opcode: Opcode::TecCurrent,
        mnemonic: "CURR?",
        params: &[],
        reply: ResponseShape::Decimal {
            scale: ELECTRICAL_SCALE,
        },
    },
    OpcodeEntry {
        opcode: Opcode::TecVoltage,
        mnemonic: "VOLT?",
        params: &[],
        reply: ResponseShape::Decimal {
            scale: ELECTRICAL_SCALE,
        },
    },
    OpcodeEntry {
        opcode: Opcode::FaultStatus,
        mnemonic: "FAUL?",
        params: &[],
        reply: ResponseShape::Flag,
    },
    OpcodeEntry {
        opcode: Opcode::HeatingState,
        mnemonic: "HORC?",
        params: &[],
        reply: ResponseShape::Text,
    },
    OpcodeEntry {
        opcode: Opcode::Firmware,
        mnemonic: "FIRM?",
        params: &[],
        reply: ResponseShape::Text,
    },
];

impl Dialect for TemperatureDialect {
    fn name(&self) -> &'static str {
        "temperature controller"
    }

    fn terminator(&self) -> &'static str {
        "\r\n"
    }

    fn table(&self) -> &'static [OpcodeEntry] {
        TEMPERATURE_TABLE
    }
}
