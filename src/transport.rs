use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crate::error::{InstrumentError, Result};

/// Byte-level, half-duplex link to one instrument.
///
/// A transport owns its endpoint exclusively. After [`close`](Self::close),
/// every other call fails with [`InstrumentError::ClosedHandle`].
pub trait Transport: Send {
    /// Write all of `bytes` before returning.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Return the bytes received before `delimiter`, without the delimiter.
    ///
    /// If no delimiter arrives within `timeout`, whatever was received is
    /// dropped and [`InstrumentError::Timeout`] is returned, so a partial
    /// frame never leaks into the next read.
    fn read_until(&mut self, delimiter: u8, timeout: Duration) -> Result<Vec<u8>>;

    /// Release the endpoint. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Everything needed to open a serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: serialport::DataBits,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
    pub read_timeout: Duration,
}

impl SerialSettings {
    /// 8N1 without flow control, which is what all three lab instruments use.
    pub fn new(path: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: serialport::DataBits::Eight,
            parity: serialport::Parity::None,
            stop_bits: serialport::StopBits::One,
            read_timeout,
        }
    }
}

/// How long a single OS-level read may block while we wait for a delimiter.
const READ_SLICE: Duration = Duration::from_millis(10);

/// Bytes received but not yet returned as a frame.
///
/// A port may hand over half a frame, or several frames at once, in one read.
/// Whatever follows the delimiter stays here for the next call.
#[derive(Debug, Default)]
struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    fn len(&self) -> usize {
        self.pending.len()
    }

    /// Split off the first complete frame, without its delimiter.
    fn take_frame(&mut self, delimiter: u8) -> Option<Vec<u8>> {
        let index = self.pending.iter().position(|&b| b == delimiter)?;
        let mut frame: Vec<u8> = self.pending.drain(..=index).collect();
        frame.pop();
        Some(frame)
    }

    /// Empty the buffer and hand back what was in it.
    fn discard(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Read from `source` until a whole frame is buffered or `timeout` has
    /// passed. On timeout the partial frame is dropped.
    fn read_frame<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
        delimiter: u8,
        timeout: Duration,
        label: &str,
    ) -> Result<Vec<u8>> {
        let start = Instant::now();
        loop {
            if let Some(frame) = self.take_frame(delimiter) {
                log::trace!("{} -> {:?}", label, String::from_utf8_lossy(&frame));
                return Ok(frame);
            }

            if start.elapsed() >= timeout {
                let partial = self.discard();
                if !partial.is_empty() {
                    log::debug!(
                        "{}: timeout, dropping partial frame {:?}",
                        label,
                        String::from_utf8_lossy(&partial)
                    );
                }
                return Err(InstrumentError::Timeout { waited: timeout });
            }

            let mut chunk = [0u8; 64];
            match source.read(&mut chunk) {
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
    frames: FrameBuffer,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("open", &self.port.is_some())
            .field("pending", &self.frames.len())
            .finish()
    }
}

impl SerialTransport {
    /// Open the port described by `settings`.
    ///
    /// On Unix the port is opened in exclusive mode, so a port that is already
    /// held by another handle fails here with `PortUnavailable`.
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        log::debug!(
            "Opening {} at {} baud ({:?}, {:?}, {:?})",
            settings.path,
            settings.baud_rate,
            settings.data_bits,
            settings.parity,
            settings.stop_bits
        );
        let serial = serialport::new(&settings.path, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_SLICE.min(settings.read_timeout))
            .open()
            .map_err(|e| InstrumentError::PortUnavailable {
                port: settings.path.clone(),
                reason: e.description,
            })?;

        let mut transport = Self {
            port: Some(serial),
            path: settings.path.clone(),
            frames: FrameBuffer::default(),
        };
        transport.flush()?;
        Ok(transport)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Drop everything buffered, locally and in the OS.
    fn flush(&mut self) -> Result<()> {
        self.frames.discard();
        if let Some(port) = self.port.as_mut() {
            port.clear(serialport::ClearBuffer::All)?;
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(InstrumentError::ClosedHandle)?;
        let stale = self.frames.discard();
        if !stale.is_empty() {
            log::warn!(
                "{}: discarding {} stale byte(s) before next command: {:?}",
                self.path,
                stale.len(),
                String::from_utf8_lossy(&stale)
            );
        }
        log::trace!("{} <- {:?}", self.path, String::from_utf8_lossy(bytes));
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_until(&mut self, delimiter: u8, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port.as_mut().ok_or(InstrumentError::ClosedHandle)?;
        let result = self.frames.read_frame(&mut **port, delimiter, timeout, &self.path);
        if matches!(result, Err(InstrumentError::Timeout { .. })) {
            port.clear(serialport::ClearBuffer::Input)?;
        }
        result
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            log::debug!("Closed {}", self.path);
        }
        self.frames.discard();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one chunk per read, then behaves like an idle port.
    struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkedReader {
        fn new<const N: usize>(chunks: [&[u8]; N]) -> Self {
            Self {
                chunks: chunks.iter().map(|chunk| chunk.to_vec()).collect(),
            }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(ErrorKind::TimedOut.into())
                }
            }
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(20);

    #[test]
    fn test_delimiter_split_across_reads() {
        let mut reader = ChunkedReader::new([b"12,", b"9,3", b"\n"]);
        let mut frames = FrameBuffer::default();
        let frame = frames.read_frame(&mut reader, b'\n', TIMEOUT, "test").unwrap();
        assert_eq!(frame, b"12,9,3");
        assert_eq!(frames.len(), 0);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut reader = ChunkedReader::new([b"OK\n1\n"]);
        let mut frames = FrameBuffer::default();
        assert_eq!(frames.read_frame(&mut reader, b'\n', TIMEOUT, "test").unwrap(), b"OK");
        assert_eq!(frames.read_frame(&mut reader, b'\n', TIMEOUT, "test").unwrap(), b"1");
    }

    #[test]
    fn test_partial_frame_is_dropped_on_timeout() {
        let mut reader = ChunkedReader::new([b"44.9"]);
        let mut frames = FrameBuffer::default();
        let err = frames
            .read_frame(&mut reader, b'\n', TIMEOUT, "test")
            .unwrap_err();
        assert!(matches!(err, InstrumentError::Timeout { waited } if waited == TIMEOUT));
        assert_eq!(frames.len(), 0);

        reader.chunks.push_back(b"45.012\n".to_vec());
        assert_eq!(frames.read_frame(&mut reader, b'\n', TIMEOUT, "test").unwrap(), b"45.012");
    }

    #[test]
    fn test_stale_bytes_are_discarded() {
        let mut reader = ChunkedReader::new([b"OK\nlate", b"0\n"]);
        let mut frames = FrameBuffer::default();
        assert_eq!(frames.read_frame(&mut reader, b'\n', TIMEOUT, "test").unwrap(), b"OK");
        assert_eq!(frames.discard(), b"late");
        assert_eq!(frames.read_frame(&mut reader, b'\n', TIMEOUT, "test").unwrap(), b"0");
    }

    #[test]
    fn test_read_error_is_reported() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(ErrorKind::BrokenPipe.into())
            }
        }
        let mut frames = FrameBuffer::default();
        assert!(frames.read_frame(&mut Broken, b'\n', TIMEOUT, "test").is_err());
    }

    #[test]
    fn test_serial_settings_default_to_8n1() {
        let settings = SerialSettings::new("/dev/ttyUSB0", 9600, Duration::from_secs(1));
        assert_eq!(settings.data_bits, serialport::DataBits::Eight);
        assert_eq!(settings.parity, serialport::Parity::None);
        assert_eq!(settings.stop_bits, serialport::StopBits::One);
    }

    #[test]
    fn test_open_missing_port_is_unavailable() {
        let settings = SerialSettings::new(
            "/dev/qolab-no-such-port",
            9600,
            Duration::from_millis(100),
        );
        let err = SerialTransport::open(&settings).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::PortUnavailable { ref port, .. } if port == "/dev/qolab-no-such-port"
        ));
    }
}
