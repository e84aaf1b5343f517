//! Simulated instruments for tests and dry runs.
//!
//! [`SimulatedTransport`] implements [`Transport`] without hardware. Every
//! written command is recorded and answered by a responder closure, so a test
//! can model as much of a device as it needs, from "always reply `12,9,3`" to
//! a stage that reports motion complete after three polls.
//!
//! ```
//! use qolab_rs::sim::{SimReply, SimulatedTransport};
//! use qolab_rs::Transport;
//! use std::time::Duration;
//!
//! let mut sim = SimulatedTransport::new(|command| match command {
//!     "POSI?" => SimReply::line("5.0000"),
//!     _ => SimReply::Timeout,
//! });
//! sim.write(b"POSI?\n")?;
//! assert_eq!(sim.read_until(b'\n', Duration::from_secs(1))?, b"5.0000\r");
//! assert_eq!(sim.writes(), ["POSI?"]);
//! # Ok::<(), qolab_rs::InstrumentError>(())
//! ```
//!
//! [`delay_stage`], [`coincidence_counter`] and [`temperature_controller`]
//! return ready-made device models that answer their instrument's full opcode
//! table.

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::ManualClock;
use crate::codec::Decimal;
use crate::dialect::{DWELL_SCALE, POSITION_SCALE};
use crate::error::{InstrumentError, Result};
use crate::transport::Transport;

/// What the simulated device does in answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// A complete line; the device appends `\r\n`.
    Line(String),
    /// Exact bytes, delimiter included or not.
    Raw(Vec<u8>),
    /// Stay silent until the reader gives up.
    Timeout,
}

impl SimReply {
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line(text.into())
    }

    pub fn ok() -> Self {
        Self::line("OK")
    }
}

type Responder = Box<dyn FnMut(&str) -> SimReply + Send>;

pub struct SimulatedTransport {
    responder: Responder,
    clock: Option<ManualClock>,
    pending: Option<SimReply>,
    writes: Vec<String>,
    reads: usize,
    open: bool,
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("writes", &self.writes)
            .field("reads", &self.reads)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl SimulatedTransport {
    /// Answer each command (terminator stripped) with `responder(command)`.
    pub fn new(responder: impl FnMut(&str) -> SimReply + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            clock: None,
            pending: None,
            writes: Vec::new(),
            reads: 0,
            open: true,
        }
    }

    /// Answer commands with `replies` in order, then time out forever.
    pub fn scripted(replies: impl IntoIterator<Item = SimReply>) -> Self {
        let mut queue: VecDeque<SimReply> = replies.into_iter().collect();
        Self::new(move |_| queue.pop_front().unwrap_or(SimReply::Timeout))
    }

    /// Answer every command the same way.
    pub fn always(reply: SimReply) -> Self {
        Self::new(move |_| reply.clone())
    }

    /// A device that never answers.
    pub fn silent() -> Self {
        Self::always(SimReply::Timeout)
    }

    /// Charge every timed-out read against `clock`, as a real port would
    /// spend the whole timeout waiting.
    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Every command written so far, without terminators.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Number of `read_until` calls, successful or not.
    pub fn read_count(&self) -> usize {
        self.reads
    }
}

impl Transport for SimulatedTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(InstrumentError::ClosedHandle);
        }
        let command = String::from_utf8_lossy(bytes)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        log::trace!("sim <- {command:?}");
        self.pending = Some((self.responder)(&command));
        self.writes.push(command);
        Ok(())
    }

    fn read_until(&mut self, delimiter: u8, timeout: Duration) -> Result<Vec<u8>> {
        if !self.open {
            return Err(InstrumentError::ClosedHandle);
        }
        self.reads += 1;

        let bytes = match self.pending.take() {
            Some(SimReply::Line(text)) => format!("{text}\r\n").into_bytes(),
            Some(SimReply::Raw(bytes)) => bytes,
            Some(SimReply::Timeout) | None => Vec::new(),
        };
        match bytes.iter().position(|&b| b == delimiter) {
            Some(index) => Ok(bytes[..index].to_vec()),
            None => {
                if let Some(clock) = &self.clock {
                    clock.advance(timeout);
                }
                Err(InstrumentError::Timeout { waited: timeout })
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.pending = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// A delay stage that reports "moving" for `polls_per_move` status polls after
/// every `:HOME` or `:MOVE ABS`, then settles exactly on its target.
pub fn delay_stage(polls_per_move: usize) -> SimulatedTransport {
    let mut position = Decimal::new(0, POSITION_SCALE);
    let mut remaining = 0;
    SimulatedTransport::new(move |command| {
        if let Some(target) = command.strip_prefix(":MOVE ABS ") {
            return match Decimal::parse(target, POSITION_SCALE) {
                Some(target) => {
                    position = target;
                    remaining = polls_per_move;
                    SimReply::ok()
                }
                None => SimReply::line("ERR 2"),
            };
        }
        match command {
            ":HOME" => {
                position = Decimal::new(0, POSITION_SCALE);
                remaining = polls_per_move;
                SimReply::ok()
            }
            "MOVE?" if remaining > 0 => {
                remaining -= 1;
                SimReply::line("1")
            }
            "MOVE?" => SimReply::line("0"),
            "POSI?" => SimReply::line(position.to_string()),
            ":STOP" => {
                remaining = 0;
                SimReply::ok()
            }
            _ => SimReply::line("ERR 1"),
        }
    })
}

/// A coincidence counter that remembers its settings and answers every
/// `COUN?` with `counts`.
pub fn coincidence_counter(counts: [u64; 3]) -> SimulatedTransport {
    let mut dwell_ms = 1000;
    let mut window_ns: u32 = 3;
    let mut delay_ns: u32 = 0;
    SimulatedTransport::new(move |command| {
        let (mnemonic, argument) = command.split_once(' ').unwrap_or((command, ""));
        match mnemonic {
            ":DWEL" => match Decimal::parse(argument, DWELL_SCALE) {
                Some(seconds) => {
                    dwell_ms = seconds.units();
                    SimReply::ok()
                }
                None => SimReply::line("ERR 2"),
            },
            ":WIND" => match argument.parse() {
                Ok(ns) => {
                    window_ns = ns;
                    SimReply::ok()
                }
                Err(_) => SimReply::line("ERR 2"),
            },
            ":DELA" => match argument.parse() {
                Ok(ns) => {
                    delay_ns = ns;
                    SimReply::ok()
                }
                Err(_) => SimReply::line("ERR 2"),
            },
            "DWEL?" => SimReply::line(format!("{dwell_ms}ms")),
            "WIND?" => SimReply::line(format!("{window_ns}ns")),
            "DELA?" => SimReply::line(format!("{delay_ns}ns")),
            "COUN?" => SimReply::line(format!("{},{},{}", counts[0], counts[1], counts[2])),
            _ => SimReply::line("ERR 1"),
        }
    })
}

/// A crystal oven whose `TEMP?` replies walk through `readings` and then stay
/// on the last one.
pub fn temperature_controller(readings: impl IntoIterator<Item = f64>) -> SimulatedTransport {
    let mut readings: VecDeque<f64> = readings.into_iter().collect();
    let mut current = readings.pop_front().unwrap_or(25.0);
    let mut started = false;
    let mut setpoint_mc: i64 = 25_000;
    SimulatedTransport::new(move |command| {
        let (mnemonic, argument) = command.split_once(' ').unwrap_or((command, ""));
        match mnemonic {
            ":SETT" => match argument.parse() {
                Ok(millidegrees) => {
                    setpoint_mc = millidegrees;
                    SimReply::ok()
                }
                Err(_) => SimReply::line("ERR 2"),
            },
            "SETP?" => SimReply::line(setpoint_mc.to_string()),
            "TEMP?" => {
                if started {
                    if let Some(next) = readings.pop_front() {
                        current = next;
                    }
                }
                started = true;
                SimReply::line(format!("{current:.3}"))
            }
            "CURR?" => SimReply::line("0.512"),
            "VOLT?" => SimReply::line("1.204"),
            "FAUL?" => SimReply::line("0"),
            "HORC?" if current * 1000.0 < setpoint_mc as f64 => SimReply::line("H"),
            "HORC?" => SimReply::line("C"),
            "FIRM?" => SimReply::line("QES 2.4 (simulated)"),
            _ => SimReply::line("ERR 1"),
        }
    })
}
