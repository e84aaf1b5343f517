use std::time::Duration;

use crate::codec::{Command, Dialect, Opcode, Param, Reply, RESPONSE_DELIMITER};
use crate::error::Result;
use crate::transport::Transport;

/// One open conversation with one instrument.
///
/// A session owns its transport and speaks exactly one dialect. Each
/// [`exchange`](Self::exchange) writes the whole request before reading the
/// reply, and there is never more than one request in flight. Dropping the
/// session closes the transport.
#[derive(Debug)]
pub struct Session<T: Transport> {
    transport: T,
    dialect: &'static dyn Dialect,
    read_timeout: Duration,
    label: String,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        dialect: &'static dyn Dialect,
        read_timeout: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            dialect,
            read_timeout,
            label: label.into(),
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn command(&self, opcode: Opcode, params: Vec<Param>) -> Result<Command> {
        self.dialect.command(opcode, params)
    }

    pub fn exchange(&mut self, command: &Command) -> Result<Reply> {
        self.exchange_within(command, self.read_timeout)
    }

    /// Like [`exchange`](Self::exchange) but waits up to `timeout` for the
    /// reply, for commands the device takes longer to answer.
    pub fn exchange_within(&mut self, command: &Command, timeout: Duration) -> Result<Reply> {
        let frame = self.dialect.encode(command)?;
        self.transport.write(&frame)?;
        let raw = self.transport.read_until(RESPONSE_DELIMITER, timeout)?;
        let reply = self.dialect.decode(command, &raw);
        log::trace!("{}: {} -> {:?}", self.label, command.opcode(), reply);
        reply
    }

    /// Build and exchange a parameterless query in one step.
    pub fn query(&mut self, opcode: Opcode) -> Result<Reply> {
        let command = self.command(opcode, Vec::new())?;
        self.exchange(&command)
    }

    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.transport.is_open() {
            log::debug!("{}: releasing port", self.label);
            if let Err(e) = self.transport.close() {
                log::warn!("{}: failed to close port: {}", self.label, e);
            }
        }
    }
}
