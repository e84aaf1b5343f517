use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{CancelToken, Clock, SystemClock};
use crate::codec::{Command, Decimal, Opcode, Param};
use crate::config::DelayStageConfig;
use crate::dialect::POSITION_SCALE;
use crate::error::{InstrumentError, Result};
use crate::instrument::{Instrument, InstrumentKind};
use crate::session::Session;
use crate::transport::{SerialTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingState {
    Unhomed,
    Homing,
    Homed,
}

/// Motorized delay stage.
///
/// The stage refuses to move until it has been homed. Every motion is
/// confirmed by polling the motion status and then reading the position back,
/// so a successful [`move_to`](Self::move_to) means the stage is parked
/// within `position_tolerance_mm` of the target.
///
/// Worst case, `home` and `move_to` block for `motion_timeout` plus one read
/// timeout.
pub struct DelayStage<T: Transport = SerialTransport> {
    session: Session<T>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    min_position_mm: f64,
    max_position_mm: f64,
    tolerance: Decimal,
    retry_count: u32,
    poll_interval: Duration,
    motion_timeout: Duration,
    state: HomingState,
    faulted: bool,
    position: Option<Decimal>,
}

impl<T: Transport> fmt::Debug for DelayStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayStage")
            .field("port", &self.session.label())
            .field("state", &self.state)
            .field("faulted", &self.faulted)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl DelayStage<SerialTransport> {
    /// Open the stage's serial port. The stage starts out unhomed.
    pub fn open(config: &DelayStageConfig) -> Result<Self> {
        config.validate()?;
        let transport = SerialTransport::open(&config.serial_settings())?;
        Self::with_transport(transport, config, Arc::new(SystemClock))
    }
}

impl<T: Transport> DelayStage<T> {
    pub fn with_transport(
        transport: T,
        config: &DelayStageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let tolerance = Decimal::from_f64(config.position_tolerance_mm, POSITION_SCALE)
            .ok_or_else(|| {
                InstrumentError::InvalidConfig("position_tolerance_mm is not representable".into())
            })?;

        Ok(Self {
            session: Session::new(
                transport,
                InstrumentKind::DelayStage.dialect(),
                config.read_timeout(),
                config.port_path.clone(),
            ),
            clock,
            cancel: CancelToken::new(),
            min_position_mm: config.min_position_mm,
            max_position_mm: config.max_position_mm,
            tolerance,
            retry_count: config.retry_count,
            poll_interval: config.poll_interval(),
            motion_timeout: config.motion_timeout(),
            state: HomingState::Unhomed,
            faulted: false,
            position: None,
        })
    }

    pub fn homing_state(&self) -> HomingState {
        self.state
    }

    /// Set after any failed operation until the next successful homing.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn limits_mm(&self) -> (f64, f64) {
        (self.min_position_mm, self.max_position_mm)
    }

    /// Last confirmed position, or `None` if it has not been read since the
    /// stage last moved or failed.
    pub fn cached_position(&self) -> Option<f64> {
        self.position.map(Decimal::to_f64)
    }

    /// A handle another thread can use to abort `home` or `move_to`.
    ///
    /// Only a request made while one of them is running counts. Each call
    /// clears the token when it starts, so a request left over from an idle
    /// moment cannot abort the next motion.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &T {
        self.session.transport()
    }

    /// Find the reference position.
    ///
    /// A no-op on a stage that is already homed and has not faulted since.
    #[tracing::instrument(skip(self), fields(port = %self.session.label()))]
    pub fn home(&mut self) -> Result<()> {
        if self.state == HomingState::Homed && !self.faulted {
            log::debug!("{}: already homed", self.session.label());
            return Ok(());
        }

        let command = self.session.command(Opcode::Home, Vec::new())?;
        self.cancel.reset();
        self.state = HomingState::Homing;
        self.position = None;
        match self.run_motion(&command) {
            Ok(()) => {
                log::debug!("{}: homed", self.session.label());
                self.state = HomingState::Homed;
                self.faulted = false;
                Ok(())
            }
            Err(e) => {
                log::warn!("{}: homing failed: {}", self.session.label(), e);
                self.state = HomingState::Unhomed;
                self.faulted = true;
                Err(e)
            }
        }
    }

    /// Move to `position_mm` and wait until the stage has arrived.
    ///
    /// Returns the confirmed position. Out-of-range targets are rejected
    /// before anything is sent.
    #[tracing::instrument(skip(self), fields(port = %self.session.label()))]
    pub fn move_to(&mut self, position_mm: f64) -> Result<f64> {
        if !position_mm.is_finite()
            || position_mm < self.min_position_mm
            || position_mm > self.max_position_mm
        {
            return Err(InstrumentError::OutOfRange {
                quantity: "position_mm",
                value: position_mm,
                min: self.min_position_mm,
                max: self.max_position_mm,
            });
        }
        if self.state != HomingState::Homed {
            return Err(InstrumentError::NotHomed);
        }
        let target = Decimal::from_f64(position_mm, POSITION_SCALE).ok_or(
            InstrumentError::OutOfRange {
                quantity: "position_mm",
                value: position_mm,
                min: self.min_position_mm,
                max: self.max_position_mm,
            },
        )?;

        self.cancel.reset();
        self.position = None;
        let result = self
            .session
            .command(Opcode::MoveAbsolute, vec![Param::Decimal(target)])
            .and_then(|command| self.run_motion(&command))
            .and_then(|()| self.confirm_position(target));
        match result {
            Ok(actual) => {
                log::debug!("{}: at {} mm", self.session.label(), actual);
                Ok(actual.to_f64())
            }
            Err(e) => {
                log::warn!("{}: move to {} mm failed: {}", self.session.label(), target, e);
                self.faulted = true;
                self.position = None;
                Err(e)
            }
        }
    }

    /// Ask the stage where it is and remember the answer.
    pub fn position(&mut self) -> Result<f64> {
        match self.query_position() {
            Ok(position) => Ok(position.to_f64()),
            Err(e) => {
                self.position = None;
                Err(e)
            }
        }
    }

    /// Halt any motion in progress. The position has to be re-read afterwards.
    pub fn stop(&mut self) -> Result<()> {
        self.position = None;
        let command = self.session.command(Opcode::Stop, Vec::new())?;
        self.session.exchange(&command)?.expect_ack()
    }

    fn query_position(&mut self) -> Result<Decimal> {
        let position = self.session.query(Opcode::Position)?.into_decimal()?;
        self.position = Some(position);
        Ok(position)
    }

    fn confirm_position(&mut self, target: Decimal) -> Result<Decimal> {
        let actual = self.query_position()?;
        if actual.abs_diff(target) > self.tolerance.units().unsigned_abs() {
            self.position = None;
            return Err(InstrumentError::PositionNotReached {
                target_mm: target.to_f64(),
                actual_mm: actual.to_f64(),
            });
        }
        Ok(actual)
    }

    /// Send `command` and poll the motion status until the stage reports
    /// that it stopped.
    ///
    /// Every read that times out, the acknowledgement of `command` included,
    /// uses up one of `retry_count` attempts.
    fn run_motion(&mut self, command: &Command) -> Result<()> {
        let start = self.clock.now();
        let mut timeouts = 0;

        match self.session.exchange(command) {
            Ok(reply) => reply.expect_ack()?,
            Err(e) if e.is_timeout() => self.note_timeout(&mut timeouts, start)?,
            Err(e) => return Err(e),
        }

        let status = self.session.command(Opcode::MotionStatus, Vec::new())?;
        loop {
            if self.cancel.take() {
                log::debug!("{}: motion cancelled", self.session.label());
                return Err(InstrumentError::Cancelled);
            }
            let elapsed = self.clock.now() - start;
            if elapsed >= self.motion_timeout {
                return Err(InstrumentError::MotionTimeout {
                    attempts: timeouts,
                    elapsed,
                });
            }

            self.clock.sleep(self.poll_interval);
            match self.session.exchange(&status) {
                Ok(reply) => {
                    if !reply.into_flag()? {
                        return Ok(());
                    }
                }
                Err(e) if e.is_timeout() => self.note_timeout(&mut timeouts, start)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn note_timeout(&self, timeouts: &mut u32, start: Instant) -> Result<()> {
        *timeouts += 1;
        log::warn!(
            "{}: no reply during motion ({}/{})",
            self.session.label(),
            timeouts,
            self.retry_count
        );
        if *timeouts >= self.retry_count {
            return Err(InstrumentError::MotionTimeout {
                attempts: *timeouts,
                elapsed: self.clock.now() - start,
            });
        }
        Ok(())
    }
}

impl<T: Transport> Instrument for DelayStage<T> {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::DelayStage
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    fn close(&mut self) -> Result<()> {
        self.position = None;
        self.session.close()
    }
}
