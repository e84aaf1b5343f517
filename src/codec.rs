//! Shared framing for the instrument dialects.
//!
//! All three instruments speak the same shape of protocol: one ASCII request
//! line `MNEMONIC[ param]*` followed by a terminator, answered by one ASCII
//! line ending in `\n`. What differs per instrument is the opcode table, which
//! lives in [`crate::dialect`].
//!
//! Response grammar, common to every dialect:
//!
//! | shape     | accepted text                         |
//! |-----------|---------------------------------------|
//! | `Ack`     | `OK` (any case)                       |
//! | `Decimal` | `[+-]digits[.digits]`, parsed exactly |
//! | `Integer` | `[+-]digits`, optional unit suffix    |
//! | `Flag`    | `0` or `1`                            |
//! | `Counts`  | `n,n,n` (unsigned)                    |
//! | `Text`    | anything non-empty                    |
//!
//! Any line starting with `ERR`/`ERROR` followed by an integer code is a device
//! fault and decodes to [`InstrumentError::DeviceError`]. A trailing `\r` and
//! surrounding whitespace are ignored.

use std::fmt;

use crate::error::{InstrumentError, Result};

/// Every response line ends with this byte, whatever the request terminator.
pub const RESPONSE_DELIMITER: u8 = b'\n';

/// Semantic name of a request, independent of any wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Home,
    MoveAbsolute,
    MotionStatus,
    Position,
    Stop,
    SetDwellTime,
    DwellTime,
    SetCoincidenceWindow,
    CoincidenceWindow,
    SetChannelDelay,
    ChannelDelay,
    ReadCounts,
    SetSetpoint,
    Setpoint,
    Temperature,
    TecCurrent,
    TecVoltage,
    FaultStatus,
    HeatingState,
    Firmware,
}

impl Opcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Home => "home",
            Opcode::MoveAbsolute => "move_absolute",
            Opcode::MotionStatus => "motion_status",
            Opcode::Position => "position",
            Opcode::Stop => "stop",
            Opcode::SetDwellTime => "set_dwell_time",
            Opcode::DwellTime => "dwell_time",
            Opcode::SetCoincidenceWindow => "set_coincidence_window",
            Opcode::CoincidenceWindow => "coincidence_window",
            Opcode::SetChannelDelay => "set_channel_delay",
            Opcode::ChannelDelay => "channel_delay",
            Opcode::ReadCounts => "read_counts",
            Opcode::SetSetpoint => "set_setpoint",
            Opcode::Setpoint => "setpoint",
            Opcode::Temperature => "temperature",
            Opcode::TecCurrent => "tec_current",
            Opcode::TecVoltage => "tec_voltage",
            Opcode::FaultStatus => "fault_status",
            Opcode::HeatingState => "heating_state",
            Opcode::Firmware => "firmware",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-point decimal: `units / 10^scale`.
///
/// Device readings are parsed straight from their digits into integer units,
/// so decoding the same line twice always yields the same value and repeated
/// decodes never accumulate floating-point error. Scales above 18 are not
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    units: i64,
    scale: u8,
}

impl Decimal {
    pub const fn new(units: i64, scale: u8) -> Self {
        Self { units, scale }
    }

    pub const fn units(self) -> i64 {
        self.units
    }

    pub const fn scale(self) -> u8 {
        self.scale
    }

    /// Parse `[+-]digits[.digits]` exactly. Digits beyond `scale` are rounded
    /// half away from zero.
    pub fn parse(text: &str, scale: u8) -> Option<Self> {
        let text = text.trim();
        let (negative, digits) = match text.as_bytes().first()? {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }

        let mut units: i64 = 0;
        for digit in whole.bytes() {
            units = units.checked_mul(10)?.checked_add(i64::from(digit - b'0'))?;
        }
        let mut fraction = fraction.bytes();
        for _ in 0..scale {
            let digit = fraction.next().map_or(0, |b| b - b'0');
            units = units.checked_mul(10)?.checked_add(i64::from(digit))?;
        }
        if fraction.next().is_some_and(|b| b >= b'5') {
            units = units.checked_add(1)?;
        }

        Some(Self::new(if negative { -units } else { units }, scale))
    }

    /// Round a caller-supplied value onto the device grid.
    pub fn from_f64(value: f64, scale: u8) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * 10f64.powi(i32::from(scale))).round();
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Self::new(scaled as i64, scale))
    }

    /// Distance between two values on the same grid, in units. Never
    /// overflows, whatever the device sent.
    pub const fn abs_diff(self, other: Self) -> u64 {
        self.units.abs_diff(other.units)
    }

    pub fn to_f64(self) -> f64 {
        self.units as f64 / 10f64.powi(i32::from(self.scale))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.units < 0 { "-" } else { "" };
        let magnitude = self.units.unsigned_abs();
        if self.scale == 0 {
            return write!(f, "{sign}{magnitude}");
        }
        let divisor = 10_u64.pow(u32::from(self.scale));
        write!(
            f,
            "{sign}{}.{:0width$}",
            magnitude / divisor,
            magnitude % divisor,
            width = usize::from(self.scale)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Decimal(Decimal),
    Integer(i64),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Decimal(value) => fmt::Display::fmt(value, f),
            Param::Integer(value) => fmt::Display::fmt(value, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Decimal { scale: u8 },
    Integer,
}

impl ParamKind {
    fn accepts(self, param: &Param) -> bool {
        match (self, param) {
            (ParamKind::Decimal { scale }, Param::Decimal(value)) => value.scale() == scale,
            (ParamKind::Integer, Param::Integer(_)) => true,
            _ => false,
        }
    }
}

/// What a well-formed reply to an opcode looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Ack,
    Decimal { scale: u8 },
    Integer { suffix: Option<&'static str> },
    Flag,
    Counts,
    Text,
}

/// A decoded, well-formed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Decimal(Decimal),
    Integer(i64),
    Flag(bool),
    Counts([u64; 3]),
    Text(String),
}

impl Reply {
    pub fn expect_ack(self) -> Result<()> {
        match self {
            Reply::Ack => Ok(()),
            other => Err(other.mismatch("acknowledgement")),
        }
    }

    pub fn into_decimal(self) -> Result<Decimal> {
        match self {
            Reply::Decimal(value) => Ok(value),
            other => Err(other.mismatch("decimal")),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self {
            Reply::Integer(value) => Ok(value),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn into_flag(self) -> Result<bool> {
        match self {
            Reply::Flag(value) => Ok(value),
            other => Err(other.mismatch("flag")),
        }
    }

    pub fn into_counts(self) -> Result<[u64; 3]> {
        match self {
            Reply::Counts(values) => Ok(values),
            other => Err(other.mismatch("count triple")),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Reply::Text(text) => Ok(text),
            other => Err(other.mismatch("text")),
        }
    }

    fn mismatch(&self, expected: &str) -> InstrumentError {
        InstrumentError::Malformed {
            raw: format!("{self:?}"),
            reason: format!("expected {expected}"),
        }
    }
}

/// One row of a dialect's opcode table.
#[derive(Debug)]
pub struct OpcodeEntry {
    pub opcode: Opcode,
    pub mnemonic: &'static str,
    pub params: &'static [ParamKind],
    pub reply: ResponseShape,
}

/// An encoded-once request: opcode, ordered parameters and the reply shape the
/// dialect table promises for it. Build one with [`Dialect::command`].
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    opcode: Opcode,
    params: Vec<Param>,
    shape: ResponseShape,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }
}

/// A per-instrument opcode table plus the shared encode/decode rules.
pub trait Dialect: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Appended to every request line.
    fn terminator(&self) -> &'static str;

    fn table(&self) -> &'static [OpcodeEntry];

    fn entry(&self, opcode: Opcode) -> Result<&'static OpcodeEntry> {
        self.table()
            .iter()
            .find(|entry| entry.opcode == opcode)
            .ok_or(InstrumentError::UnsupportedOpcode {
                dialect: self.name(),
                opcode,
            })
    }

    fn command(&self, opcode: Opcode, params: Vec<Param>) -> Result<Command> {
        let entry = self.entry(opcode)?;
        check_params(entry, &params)?;
        Ok(Command {
            opcode,
            params,
            shape: entry.reply,
        })
    }

    fn encode(&self, command: &Command) -> Result<Vec<u8>> {
        let entry = self.entry(command.opcode)?;
        check_params(entry, &command.params)?;

        let mut line = String::from(entry.mnemonic);
        for param in &command.params {
            line.push(' ');
            line.push_str(&param.to_string());
        }
        line.push_str(self.terminator());
        Ok(line.into_bytes())
    }

    fn decode(&self, command: &Command, raw: &[u8]) -> Result<Reply> {
        decode_line(command.shape, raw)
    }
}

fn check_params(entry: &OpcodeEntry, params: &[Param]) -> Result<()> {
    if params.len() != entry.params.len() {
        return Err(InstrumentError::Encode {
            opcode: entry.opcode,
            reason: format!(
                "expected {} parameter(s), got {}",
                entry.params.len(),
                params.len()
            ),
        });
    }
    for (index, (kind, param)) in entry.params.iter().zip(params).enumerate() {
        if !kind.accepts(param) {
            return Err(InstrumentError::Encode {
                opcode: entry.opcode,
                reason: format!("parameter {index} should be {kind:?}, got {param:?}"),
            });
        }
    }
    Ok(())
}

/// Parse one response line (delimiter already removed) against `shape`.
pub fn decode_line(shape: ResponseShape, raw: &[u8]) -> Result<Reply> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| InstrumentError::malformed(raw, "response is not valid ASCII"))?
        .trim();
    if text.is_empty() {
        return Err(InstrumentError::malformed(raw, "empty response"));
    }

    if let Some(rest) = text
        .strip_prefix("ERROR")
        .or_else(|| text.strip_prefix("ERR"))
    {
        let code = rest.trim_start_matches([':', ' ']).trim();
        return match code.parse::<i32>() {
            Ok(code) => Err(InstrumentError::DeviceError { code }),
            Err(_) => Err(InstrumentError::malformed(
                raw,
                "error token without a numeric code",
            )),
        };
    }

    match shape {
        ResponseShape::Ack => {
            if text.eq_ignore_ascii_case("OK") {
                Ok(Reply::Ack)
            } else {
                Err(InstrumentError::malformed(raw, "expected OK"))
            }
        }
        ResponseShape::Decimal { scale } => Decimal::parse(text, scale)
            .map(Reply::Decimal)
            .ok_or_else(|| InstrumentError::malformed(raw, "not a decimal number")),
        ResponseShape::Integer { suffix } => {
            let digits = suffix
                .and_then(|suffix| text.strip_suffix(suffix))
                .unwrap_or(text)
                .trim_end();
            digits
                .parse::<i64>()
                .map(Reply::Integer)
                .map_err(|_| InstrumentError::malformed(raw, "not an integer"))
        }
        ResponseShape::Flag => match text {
            "0" => Ok(Reply::Flag(false)),
            "1" => Ok(Reply::Flag(true)),
            _ => Err(InstrumentError::malformed(raw, "expected 0 or 1")),
        },
        ResponseShape::Counts => {
            let fields: Vec<&str> = text.split(',').map(str::trim).collect();
            if fields.len() != 3 {
                return Err(InstrumentError::malformed(
                    raw,
                    format!("expected 3 comma-separated counts, got {}", fields.len()),
                ));
            }
            let mut counts = [0u64; 3];
            for (slot, field) in counts.iter_mut().zip(&fields) {
                *slot = field
                    .parse()
                    .map_err(|_| InstrumentError::malformed(raw, "count is not a number"))?;
            }
            Ok(Reply::Counts(counts))
        }
        ResponseShape::Text => Ok(Reply::Text(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_parse_is_exact() {
        assert_eq!(Decimal::parse("12.3456", 4), Some(Decimal::new(123_456, 4)));
        assert_eq!(Decimal::parse("5", 4), Some(Decimal::new(50_000, 4)));
        assert_eq!(Decimal::parse("-0.5", 3), Some(Decimal::new(-500, 3)));
        assert_eq!(Decimal::parse("+1.", 1), Some(Decimal::new(10, 1)));
        assert_eq!(Decimal::parse(".25", 2), Some(Decimal::new(25, 2)));
    }

    #[test]
    fn test_decimal_parse_rounds_extra_digits() {
        assert_eq!(Decimal::parse("1.23456", 4), Some(Decimal::new(12_346, 4)));
        assert_eq!(Decimal::parse("1.23454", 4), Some(Decimal::new(12_345, 4)));
        assert_eq!(Decimal::parse("-1.00005", 4), Some(Decimal::new(-10_001, 4)));
    }

    #[test]
    fn test_decimal_parse_rejects_garbage() {
        for text in ["", "-", ".", "1.2.3", "abc", "1e3", "12,5"] {
            assert_eq!(Decimal::parse(text, 3), None, "{text:?} should not parse");
        }
        assert_eq!(Decimal::parse("99999999999999999999", 0), None);
    }

    #[test]
    fn test_decimal_abs_diff_at_the_extremes() {
        let low = Decimal::parse("-922337203685477.5807", 4).unwrap();
        let high = Decimal::new(i64::MAX, 4);
        assert_eq!(low.abs_diff(high), u64::MAX - 1);
        assert_eq!(Decimal::new(100_000, 4).abs_diff(Decimal::new(100_100, 4)), 100);
    }

    #[test]
    fn test_decimal_display() {
        assert_eq!(Decimal::new(50_000, 4).to_string(), "5.0000");
        assert_eq!(Decimal::new(100, 3).to_string(), "0.100");
        assert_eq!(Decimal::new(-1_234, 3).to_string(), "-1.234");
        assert_eq!(Decimal::new(42, 0).to_string(), "42");
    }

    #[test]
    fn test_decimal_from_f64_rounds_to_grid() {
        assert_eq!(Decimal::from_f64(5.0, 4), Some(Decimal::new(50_000, 4)));
        assert_eq!(Decimal::from_f64(45.0004, 3), Some(Decimal::new(45_000, 3)));
        assert_eq!(Decimal::from_f64(f64::NAN, 3), None);
        assert_eq!(Decimal::from_f64(f64::INFINITY, 3), None);
    }

    #[test]
    fn test_repeated_decode_is_stable() {
        let first = decode_line(ResponseShape::Decimal { scale: 4 }, b"0.1000\r").unwrap();
        for _ in 0..1000 {
            let again = decode_line(ResponseShape::Decimal { scale: 4 }, b"0.1000\r").unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_decode_counts() {
        assert_eq!(
            decode_line(ResponseShape::Counts, b"12,9,3").unwrap(),
            Reply::Counts([12, 9, 3])
        );
        assert_eq!(
            decode_line(ResponseShape::Counts, b" 120 , 98 ,7 \r").unwrap(),
            Reply::Counts([120, 98, 7])
        );
    }

    #[test]
    fn test_decode_counts_wrong_arity_is_malformed() {
        for raw in [&b"12,9"[..], b"12,9,3,1", b"12,x,3", b"12,-1,3"] {
            let err = decode_line(ResponseShape::Counts, raw).unwrap_err();
            assert!(matches!(err, InstrumentError::Malformed { .. }), "{err:?}");
        }
    }

    #[test]
    fn test_decode_error_token() {
        let err = decode_line(ResponseShape::Ack, b"ERR 7\r").unwrap_err();
        assert!(matches!(err, InstrumentError::DeviceError { code: 7 }));

        let err = decode_line(ResponseShape::Decimal { scale: 3 }, b"ERROR:12").unwrap_err();
        assert!(matches!(err, InstrumentError::DeviceError { code: 12 }));

        let err = decode_line(ResponseShape::Ack, b"ERR").unwrap_err();
        assert!(matches!(err, InstrumentError::Malformed { .. }));
    }

    #[test]
    fn test_decode_integer_with_unit_suffix() {
        let shape = ResponseShape::Integer { suffix: Some("ms") };
        assert_eq!(decode_line(shape, b"1000ms\r").unwrap(), Reply::Integer(1000));
        assert_eq!(decode_line(shape, b"250 ms").unwrap(), Reply::Integer(250));
        assert_eq!(decode_line(shape, b"250").unwrap(), Reply::Integer(250));
        assert!(decode_line(shape, b"250 s").is_err());
    }

    #[test]
    fn test_decode_flag_and_ack() {
        assert_eq!(decode_line(ResponseShape::Flag, b"1").unwrap(), Reply::Flag(true));
        assert_eq!(decode_line(ResponseShape::Flag, b"0\r").unwrap(), Reply::Flag(false));
        assert!(decode_line(ResponseShape::Flag, b"2").is_err());
        assert_eq!(decode_line(ResponseShape::Ack, b"ok").unwrap(), Reply::Ack);
        assert!(decode_line(ResponseShape::Ack, b"OKAY").is_err());
    }

    #[test]
    fn test_decode_rejects_empty_and_binary() {
        assert!(matches!(
            decode_line(ResponseShape::Text, b"\r"),
            Err(InstrumentError::Malformed { .. })
        ));
        assert!(matches!(
            decode_line(ResponseShape::Text, &[0xff, 0xfe]),
            Err(InstrumentError::Malformed { .. })
        ));
    }
}
