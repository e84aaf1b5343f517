use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::codec::{Decimal, Opcode, Param};
use crate::config::CoincidenceCounterConfig;
use crate::dialect::DWELL_SCALE;
use crate::error::{InstrumentError, Result};
use crate::instrument::{Instrument, InstrumentKind};
use crate::session::Session;
use crate::transport::{SerialTransport, Transport};

/// Integration windows the counter accepts.
pub const INTEGRATION_WINDOW_RANGE_MS: RangeInclusive<u32> = 100..=30_000;
pub const COINCIDENCE_WINDOW_RANGE_NS: RangeInclusive<u32> = 0..=8;
/// Channel 1 delay, in steps of 2 ns.
pub const CHANNEL_DELAY_RANGE_NS: RangeInclusive<u32> = 0..=14;
/// Detector inputs on the CC1.
pub const CHANNELS: u8 = 2;

/// One integration window worth of detector events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Counts {
    pub ch1: u64,
    pub ch2: u64,
    pub coincidences: u64,
}

/// What the counter has acknowledged so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSettings {
    pub channels: u8,
    pub integration_window_ms: u32,
    pub coincidence_window_ns: u32,
    pub channel1_delay_ns: u32,
}

/// Two-channel coincidence counter.
///
/// [`read_counts`](Self::read_counts) blocks for at least one integration
/// window. If the counter stays silent it is asked again, up to
/// `retry_count` attempts in total, so the worst case is
/// `retry_count × (read_timeout + integration window + poll_interval)`.
pub struct CoincidenceCounter<T: Transport = SerialTransport> {
    session: Session<T>,
    clock: Arc<dyn Clock>,
    settings: CounterSettings,
    /// Set when a dwell command may have reached the counter without an
    /// answer, so the running integration window is unknown.
    window_unverified: bool,
    retry_count: u32,
    poll_interval: Duration,
}

impl<T: Transport> fmt::Debug for CoincidenceCounter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoincidenceCounter")
            .field("port", &self.session.label())
            .field("settings", &self.settings)
            .field("window_unverified", &self.window_unverified)
            .finish_non_exhaustive()
    }
}

impl CoincidenceCounter<SerialTransport> {
    pub fn open(config: &CoincidenceCounterConfig) -> Result<Self> {
        config.validate()?;
        let transport = SerialTransport::open(&config.serial_settings())?;
        Self::with_transport(transport, config, Arc::new(SystemClock))
    }
}

impl<T: Transport> CoincidenceCounter<T> {
    /// Wrap an already open transport. Nothing is sent until the first
    /// operation; the configured windows are assumed to be what the counter
    /// is set to.
    pub fn with_transport(
        transport: T,
        config: &CoincidenceCounterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session: Session::new(
                transport,
                InstrumentKind::CoincidenceCounter.dialect(),
                config.read_timeout(),
                config.port_path.clone(),
            ),
            clock,
            settings: CounterSettings {
                channels: CHANNELS,
                integration_window_ms: config.integration_window_ms,
                coincidence_window_ns: config.coincidence_window_ns,
                channel1_delay_ns: 0,
            },
            window_unverified: false,
            retry_count: config.retry_count,
            poll_interval: config.poll_interval(),
        })
    }

    pub fn settings(&self) -> CounterSettings {
        self.settings
    }

    pub fn transport(&self) -> &T {
        self.session.transport()
    }

    /// Set the integration and coincidence windows.
    ///
    /// Both values are checked before anything is sent. Each local setting
    /// changes as soon as the counter acknowledges it, so a rejected
    /// coincidence window leaves the new integration window in place. If the
    /// dwell command goes unanswered, [`read_counts`](Self::read_counts)
    /// allows for the longest window until the next successful `configure`
    /// or [`refresh_settings`](Self::refresh_settings).
    pub fn configure(&mut self, window_ms: u32, coincidence_ns: u32) -> Result<()> {
        if window_ms == 0 || !INTEGRATION_WINDOW_RANGE_MS.contains(&window_ms) {
            return Err(InstrumentError::InvalidConfig(format!(
                "integration window {window_ms} ms is outside {INTEGRATION_WINDOW_RANGE_MS:?}"
            )));
        }
        if !COINCIDENCE_WINDOW_RANGE_NS.contains(&coincidence_ns) {
            return Err(InstrumentError::InvalidConfig(format!(
                "coincidence window {coincidence_ns} ns is outside {COINCIDENCE_WINDOW_RANGE_NS:?}"
            )));
        }

        let dwell = self.session.command(
            Opcode::SetDwellTime,
            vec![Param::Decimal(Decimal::new(i64::from(window_ms), DWELL_SCALE))],
        )?;
        let window = self.session.command(
            Opcode::SetCoincidenceWindow,
            vec![Param::Integer(i64::from(coincidence_ns))],
        )?;
        match self.session.exchange(&dwell) {
            Ok(reply) => reply.expect_ack()?,
            Err(e) => {
                if e.is_timeout() {
                    self.window_unverified = true;
                }
                return Err(e);
            }
        }
        self.settings.integration_window_ms = window_ms;
        self.window_unverified = false;
        self.session.exchange(&window)?.expect_ack()?;

        log::debug!(
            "{}: integration window {} ms, coincidence window {} ns",
            self.session.label(),
            window_ms,
            coincidence_ns
        );
        self.settings.coincidence_window_ns = coincidence_ns;
        Ok(())
    }

    /// Delay channel 1 relative to channel 2. Only even values are accepted.
    pub fn set_channel1_delay(&mut self, delay_ns: u32) -> Result<()> {
        if delay_ns % 2 != 0 || !CHANNEL_DELAY_RANGE_NS.contains(&delay_ns) {
            return Err(InstrumentError::InvalidConfig(format!(
                "channel delay {delay_ns} ns must be even and within {CHANNEL_DELAY_RANGE_NS:?}"
            )));
        }
        let command = self.session.command(
            Opcode::SetChannelDelay,
            vec![Param::Integer(i64::from(delay_ns))],
        )?;
        self.session.exchange(&command)?.expect_ack()?;
        self.settings.channel1_delay_ns = delay_ns;
        Ok(())
    }

    /// Read the windows and delay back from the counter.
    pub fn refresh_settings(&mut self) -> Result<CounterSettings> {
        let settings = CounterSettings {
            channels: CHANNELS,
            integration_window_ms: self.query_u32(Opcode::DwellTime)?,
            coincidence_window_ns: self.query_u32(Opcode::CoincidenceWindow)?,
            channel1_delay_ns: self.query_u32(Opcode::ChannelDelay)?,
        };
        self.settings = settings;
        self.window_unverified = false;
        Ok(settings)
    }

    /// Count for one integration window.
    ///
    /// Only a silent counter is asked again. A garbled or error reply is
    /// returned at once, since it means the line is out of step.
    #[tracing::instrument(skip(self), fields(port = %self.session.label()))]
    pub fn read_counts(&mut self) -> Result<Counts> {
        let command = self.session.command(Opcode::ReadCounts, Vec::new())?;
        let window_ms = if self.window_unverified {
            *INTEGRATION_WINDOW_RANGE_MS.end()
        } else {
            self.settings.integration_window_ms
        };
        let timeout = self.session.read_timeout() + Duration::from_millis(u64::from(window_ms));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.session.exchange_within(&command, timeout) {
                Ok(reply) => {
                    let [ch1, ch2, coincidences] = reply.into_counts()?;
                    return Ok(Counts {
                        ch1,
                        ch2,
                        coincidences,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.retry_count => {
                    log::warn!(
                        "{}: no counts ({}/{}), retrying",
                        self.session.label(),
                        attempt,
                        self.retry_count
                    );
                    self.clock.sleep(self.poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn query_u32(&mut self, opcode: Opcode) -> Result<u32> {
        let value = self.session.query(opcode)?.into_integer()?;
        u32::try_from(value).map_err(|_| InstrumentError::Malformed {
            raw: value.to_string(),
            reason: format!("{opcode} must not be negative"),
        })
    }
}

impl<T: Transport> Instrument for CoincidenceCounter<T> {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::CoincidenceCounter
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}
