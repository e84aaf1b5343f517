use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{CancelToken, Clock, SystemClock};
use crate::codec::{Decimal, Opcode, Param};
use crate::config::TemperatureControllerConfig;
use crate::dialect::TEMPERATURE_SCALE;
use crate::error::{InstrumentError, Result};
use crate::instrument::{Instrument, InstrumentKind};
use crate::session::Session;
use crate::transport::{SerialTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stabilizing,
    Stable,
}

/// Whether the TEC is currently pumping heat in or out of the crystal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatingMode {
    Heating,
    Cooling,
}

/// Phase-matching oven of the bi-photon source.
///
/// Temperatures are compared in whole millidegrees, the controller's own
/// resolution, so a reading either is or is not within tolerance regardless
/// of how the caller's float happened to round.
pub struct TemperatureController<T: Transport = SerialTransport> {
    session: Session<T>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    min_setpoint_c: f64,
    max_setpoint_c: f64,
    retry_count: u32,
    poll_interval: Duration,
    stable_samples: u32,
    stability_tolerance: Decimal,
    setpoint: Option<Decimal>,
    last_reading: Option<Decimal>,
    in_tolerance: u32,
}

impl<T: Transport> fmt::Debug for TemperatureController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemperatureController")
            .field("port", &self.session.label())
            .field("setpoint", &self.setpoint)
            .field("last_reading", &self.last_reading)
            .field("in_tolerance", &self.in_tolerance)
            .finish_non_exhaustive()
    }
}

impl TemperatureController<SerialTransport> {
    pub fn open(config: &TemperatureControllerConfig) -> Result<Self> {
        config.validate()?;
        let transport = SerialTransport::open(&config.serial_settings())?;
        Self::with_transport(transport, config, Arc::new(SystemClock))
    }
}

impl<T: Transport> TemperatureController<T> {
    pub fn with_transport(
        transport: T,
        config: &TemperatureControllerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let stability_tolerance = millidegrees(config.stability_tolerance_c).ok_or_else(|| {
            InstrumentError::InvalidConfig("stability_tolerance_c is not representable".into())
        })?;

        Ok(Self {
            session: Session::new(
                transport,
                InstrumentKind::TemperatureController.dialect(),
                config.read_timeout(),
                config.port_path.clone(),
            ),
            clock,
            cancel: CancelToken::new(),
            min_setpoint_c: config.min_setpoint_c,
            max_setpoint_c: config.max_setpoint_c,
            retry_count: config.retry_count,
            poll_interval: config.poll_interval(),
            stable_samples: config.stable_samples,
            stability_tolerance,
            setpoint: None,
            last_reading: None,
            in_tolerance: 0,
        })
    }

    /// A handle another thread can use to abort `wait_for_stable`. The wait
    /// clears it on entry, so only a request made while it runs counts.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &T {
        self.session.transport()
    }

    /// Most recent reading, if any.
    pub fn last_temperature(&self) -> Option<f64> {
        self.last_reading.map(Decimal::to_f64)
    }

    /// Judged from the readings taken so far, with the configured stability
    /// tolerance.
    pub fn stability(&self) -> Stability {
        if self.setpoint.is_some() && self.in_tolerance >= self.stable_samples {
            Stability::Stable
        } else {
            Stability::Stabilizing
        }
    }

    pub fn set_setpoint(&mut self, setpoint_c: f64) -> Result<()> {
        let out_of_range = || InstrumentError::OutOfRange {
            quantity: "setpoint_c",
            value: setpoint_c,
            min: self.min_setpoint_c,
            max: self.max_setpoint_c,
        };
        if !setpoint_c.is_finite()
            || setpoint_c < self.min_setpoint_c
            || setpoint_c > self.max_setpoint_c
        {
            return Err(out_of_range());
        }
        let setpoint = millidegrees(setpoint_c).ok_or_else(out_of_range)?;

        self.setpoint = None;
        self.in_tolerance = 0;
        let command = self
            .session
            .command(Opcode::SetSetpoint, vec![Param::Integer(setpoint.units())])?;
        self.session.exchange(&command)?.expect_ack()?;

        log::debug!("{}: setpoint {} °C", self.session.label(), setpoint);
        self.setpoint = Some(setpoint);
        Ok(())
    }

    /// Ask the controller for its setpoint, in °C.
    pub fn setpoint(&mut self) -> Result<f64> {
        Ok(self.query_setpoint()?.to_f64())
    }

    pub fn read_temperature(&mut self) -> Result<f64> {
        Ok(self.sample()?.to_f64())
    }

    /// Block until `tolerance_c` has held for `stable_samples` consecutive
    /// readings, and return the last of them.
    ///
    /// A reading is taken every `poll_interval`. A read that times out breaks
    /// the streak; after `retry_count` of them, or once `timeout` has passed,
    /// the wait fails with [`InstrumentError::StabilizationTimeout`]. Worst
    /// case this blocks for `timeout` plus one read timeout.
    #[tracing::instrument(skip(self), fields(port = %self.session.label()))]
    pub fn wait_for_stable(&mut self, tolerance_c: f64, timeout: Duration) -> Result<f64> {
        let tolerance = match millidegrees(tolerance_c) {
            Some(tolerance) if tolerance_c >= 0.0 => tolerance,
            _ => {
                return Err(InstrumentError::OutOfRange {
                    quantity: "tolerance_c",
                    value: tolerance_c,
                    min: 0.0,
                    max: f64::INFINITY,
                })
            }
        };
        let setpoint = match self.setpoint {
            Some(setpoint) => setpoint,
            None => self.query_setpoint()?,
        };

        self.cancel.reset();
        let start = self.clock.now();
        let mut streak = 0;
        let mut timeouts = 0;
        let mut last = None;
        loop {
            if self.cancel.take() {
                log::debug!("{}: wait for stability cancelled", self.session.label());
                return Err(InstrumentError::Cancelled);
            }
            if self.clock.now() - start >= timeout {
                return Err(self.stabilization_timeout(setpoint, last));
            }

            match self.sample() {
                Ok(reading) => {
                    last = Some(reading);
                    if reading.abs_diff(setpoint) <= tolerance.units().unsigned_abs() {
                        streak += 1;
                        log::trace!(
                            "{}: {} °C in tolerance ({}/{})",
                            self.session.label(),
                            reading,
                            streak,
                            self.stable_samples
                        );
                        if streak >= self.stable_samples {
                            log::debug!("{}: stable at {} °C", self.session.label(), reading);
                            return Ok(reading.to_f64());
                        }
                    } else {
                        streak = 0;
                    }
                }
                Err(e) if e.is_timeout() => {
                    streak = 0;
                    timeouts += 1;
                    log::warn!(
                        "{}: no temperature reading ({}/{})",
                        self.session.label(),
                        timeouts,
                        self.retry_count
                    );
                    if timeouts >= self.retry_count {
                        return Err(self.stabilization_timeout(setpoint, last));
                    }
                }
                Err(e) => return Err(e),
            }

            self.clock.sleep(self.poll_interval);
        }
    }

    /// Current through the TEC, in amperes.
    pub fn tec_current(&mut self) -> Result<f64> {
        Ok(self.session.query(Opcode::TecCurrent)?.into_decimal()?.to_f64())
    }

    /// Voltage across the TEC, in volts.
    pub fn tec_voltage(&mut self) -> Result<f64> {
        Ok(self.session.query(Opcode::TecVoltage)?.into_decimal()?.to_f64())
    }

    /// `true` if the controller has latched a fault.
    pub fn fault_status(&mut self) -> Result<bool> {
        self.session.query(Opcode::FaultStatus)?.into_flag()
    }

    pub fn heating_state(&mut self) -> Result<HeatingMode> {
        let text = self.session.query(Opcode::HeatingState)?.into_text()?;
        match text.as_str() {
            "H" | "h" => Ok(HeatingMode::Heating),
            "C" | "c" => Ok(HeatingMode::Cooling),
            _ => Err(InstrumentError::Malformed {
                raw: text,
                reason: "expected H or C".into(),
            }),
        }
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        self.session.query(Opcode::Firmware)?.into_text()
    }

    fn query_setpoint(&mut self) -> Result<Decimal> {
        let units = self.session.query(Opcode::Setpoint)?.into_integer()?;
        let setpoint = Decimal::new(units, TEMPERATURE_SCALE);
        if self.setpoint != Some(setpoint) {
            self.in_tolerance = 0;
        }
        self.setpoint = Some(setpoint);
        Ok(setpoint)
    }

    /// Read the temperature and feed it to the stability tracker.
    fn sample(&mut self) -> Result<Decimal> {
        let reading = match self.session.query(Opcode::Temperature) {
            Ok(reply) => reply.into_decimal()?,
            Err(e) => {
                self.in_tolerance = 0;
                return Err(e);
            }
        };
        self.last_reading = Some(reading);
        match self.setpoint {
            Some(setpoint)
                if reading.abs_diff(setpoint) <= self.stability_tolerance.units().unsigned_abs() =>
            {
                self.in_tolerance = self.in_tolerance.saturating_add(1);
            }
            _ => self.in_tolerance = 0,
        }
        Ok(reading)
    }

    fn stabilization_timeout(&self, setpoint: Decimal, last: Option<Decimal>) -> InstrumentError {
        InstrumentError::StabilizationTimeout {
            setpoint_c: setpoint.to_f64(),
            last_c: last.map(Decimal::to_f64),
        }
    }
}

fn millidegrees(celsius: f64) -> Option<Decimal> {
    Decimal::from_f64(celsius, TEMPERATURE_SCALE)
}

impl<T: Transport> Instrument for TemperatureController<T> {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::TemperatureController
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::{self, SimReply, SimulatedTransport};
    use std::sync::Mutex;

    fn controller(
        sim: SimulatedTransport,
        config: TemperatureControllerConfig,
    ) -> (TemperatureController<SimulatedTransport>, ManualClock) {
        let clock = ManualClock::new();
        let controller = TemperatureController::with_transport(
            sim.with_clock(clock.clone()),
            &config,
            Arc::new(clock.clone()),
        )
        .unwrap();
        (controller, clock)
    }

    fn config() -> TemperatureControllerConfig {
        TemperatureControllerConfig::new("/dev/ttyUSB2")
    }

    fn temperature_reads(controller: &TemperatureController<SimulatedTransport>) -> usize {
        controller
            .transport()
            .writes()
            .iter()
            .filter(|command| *command == "TEMP?")
            .count()
    }

    #[test]
    fn test_setpoint_is_sent_in_millidegrees() {
        let (mut controller, _) = controller(sim::temperature_controller([25.0]), config());
        controller.set_setpoint(45.0).unwrap();
        assert_eq!(controller.transport().writes(), [":SETT 45000"]);
        assert_eq!(controller.setpoint().unwrap(), 45.0);
    }

    #[test]
    fn test_setpoint_out_of_range_is_rejected_before_io() {
        let (mut controller, _) = controller(sim::temperature_controller([25.0]), config());
        for setpoint in [9.99, 50.5, f64::NAN] {
            assert!(matches!(
                controller.set_setpoint(setpoint),
                Err(InstrumentError::OutOfRange { .. })
            ));
        }
        assert_eq!(controller.transport().write_count(), 0);
    }

    #[test]
    fn test_timeout_elapses_at_poll_boundary() {
        let (mut controller, clock) = controller(sim::temperature_controller([40.0]), config());
        controller.set_setpoint(45.0).unwrap();
        let err = controller
            .wait_for_stable(0.5, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::StabilizationTimeout {
                last_c: Some(last),
                ..
            } if last == 40.0
        ));
        assert_eq!(temperature_reads(&controller), 5);
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_read_timeouts_exhaust_retry_budget() {
        let (mut controller, _) = controller(
            SimulatedTransport::new(|command| match command {
                ":SETT 30000" => SimReply::ok(),
                _ => SimReply::Timeout,
            }),
            config(),
        );
        controller.set_setpoint(30.0).unwrap();
        let err = controller
            .wait_for_stable(0.1, Duration::from_secs(3600))
            .unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::StabilizationTimeout { last_c: None, .. }
        ));
        assert_eq!(temperature_reads(&controller), 5);
    }

    #[test]
    fn test_single_lucky_sample_is_not_enough() {
        let mut config = config();
        config.stable_samples = 2;
        let (mut controller, _) = controller(
            sim::temperature_controller([40.0, 45.0, 41.0, 44.9, 45.05]),
            config,
        );
        controller.set_setpoint(45.0).unwrap();
        let stable = controller
            .wait_for_stable(0.2, Duration::from_secs(60))
            .unwrap();
        assert_eq!(stable, 45.05);
        assert_eq!(temperature_reads(&controller), 5);
    }

    #[test]
    fn test_malformed_reading_surfaces_immediately() {
        let (mut controller, _) = controller(
            SimulatedTransport::scripted([SimReply::ok(), SimReply::line("hot")]),
            config(),
        );
        controller.set_setpoint(45.0).unwrap();
        assert!(matches!(
            controller.wait_for_stable(0.5, Duration::from_secs(60)),
            Err(InstrumentError::Malformed { .. })
        ));
        assert_eq!(temperature_reads(&controller), 1);
    }

    #[test]
    fn test_unknown_setpoint_is_queried() {
        let mut config = config();
        config.stable_samples = 1;
        let (mut controller, _) = controller(
            SimulatedTransport::scripted([SimReply::line("30000"), SimReply::line("30.020")]),
            config,
        );
        assert_eq!(
            controller
                .wait_for_stable(0.05, Duration::from_secs(10))
                .unwrap(),
            30.02
        );
        assert_eq!(controller.transport().writes(), ["SETP?", "TEMP?"]);
    }

    #[test]
    fn test_passive_stability_tracking() {
        let (mut controller, _) =
            controller(sim::temperature_controller([44.5, 44.95, 45.0, 45.05]), config());
        controller.set_setpoint(45.0).unwrap();
        controller.read_temperature().unwrap();
        assert_eq!(controller.stability(), Stability::Stabilizing);
        for _ in 0..3 {
            controller.read_temperature().unwrap();
        }
        assert_eq!(controller.stability(), Stability::Stable);

        controller.set_setpoint(40.0).unwrap();
        assert_eq!(controller.stability(), Stability::Stabilizing);
    }

    #[test]
    fn test_cancel() {
        let token = Arc::new(Mutex::new(None::<CancelToken>));
        let slot = Arc::clone(&token);
        let (mut controller, _) = controller(
            SimulatedTransport::new(move |command| match command {
                "TEMP?" => {
                    if let Some(token) = slot.lock().unwrap().as_ref() {
                        token.cancel();
                    }
                    SimReply::line("40.000")
                }
                _ => SimReply::ok(),
            }),
            config(),
        );
        *token.lock().unwrap() = Some(controller.cancel_token());
        controller.set_setpoint(45.0).unwrap();

        assert!(matches!(
            controller.wait_for_stable(0.5, Duration::from_secs(60)),
            Err(InstrumentError::Cancelled)
        ));
        assert_eq!(temperature_reads(&controller), 1);
        assert!(controller.is_open());
    }

    #[test]
    fn test_cancel_while_idle_does_not_abort_next_wait() {
        let (mut controller, _) = controller(sim::temperature_controller([45.0]), config());
        controller.set_setpoint(45.0).unwrap();
        controller.cancel_token().cancel();
        assert_eq!(
            controller
                .wait_for_stable(0.5, Duration::from_secs(60))
                .unwrap(),
            45.0
        );
        assert_eq!(temperature_reads(&controller), 3);
    }

    #[test]
    fn test_negative_tolerance_is_rejected_before_io() {
        let (mut controller, _) = controller(sim::temperature_controller([45.0]), config());
        for tolerance in [-0.0001, -0.5, f64::NAN] {
            assert!(matches!(
                controller.wait_for_stable(tolerance, Duration::from_secs(60)),
                Err(InstrumentError::OutOfRange { .. })
            ));
        }
        assert_eq!(controller.transport().write_count(), 0);
    }

    #[test]
    fn test_extreme_reading_is_out_of_tolerance() {
        let (mut controller, _) = controller(
            SimulatedTransport::new(|command| match command {
                "TEMP?" => SimReply::line("-9223372036854775.807"),
                _ => SimReply::ok(),
            }),
            config(),
        );
        controller.set_setpoint(45.0).unwrap();
        controller.read_temperature().unwrap();
        assert_eq!(controller.stability(), Stability::Stabilizing);
        assert!(matches!(
            controller.wait_for_stable(0.5, Duration::from_secs(3)),
            Err(InstrumentError::StabilizationTimeout { .. })
        ));
    }

    #[test]
    fn test_diagnostics() {
        let (mut controller, _) = controller(sim::temperature_controller([25.0]), config());
        controller.set_setpoint(45.0).unwrap();
        controller.read_temperature().unwrap();
        assert_eq!(controller.heating_state().unwrap(), HeatingMode::Heating);
        assert_eq!(controller.tec_current().unwrap(), 0.512);
        assert_eq!(controller.tec_voltage().unwrap(), 1.204);
        assert!(!controller.fault_status().unwrap());
        assert_eq!(controller.firmware_version().unwrap(), "QES 2.4 (simulated)");
    }
}
