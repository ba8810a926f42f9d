// src/transport.rs
//
// Byte-level transport seam underneath the SLCAN link. `serialport`'s
// `Box<dyn SerialPort>` implements `Read + Write`, same as the teacher's
// `SlcanReader` in io/slcan.rs; we generalize that to a small trait so
// tests can substitute an in-memory duplex instead of real hardware.

use std::io;
use std::time::Duration;

/// Anything that can be read from and written to like a serial port.
pub trait SerialTransport: io::Read + io::Write + Send {
    /// Discard any buffered input (best-effort).
    fn clear_input(&mut self) -> io::Result<()>;

    /// Per-read timeout already configured on the transport.
    fn timeout(&self) -> Duration;
}

impl SerialTransport for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        serialport::SerialPort::clear(self.as_mut(), serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn timeout(&self) -> Duration {
        serialport::SerialPort::timeout(self.as_ref())
    }
}

/// Open a real serial port at the given path/baud, mapping open failures
/// to the taxonomy the rest of the link expects (§7).
pub fn open_serial(path: &str, baud_rate: u32) -> crate::error::Result<Box<dyn serialport::SerialPort>> {
    use crate::error::Error;

    serialport::new(path, baud_rate)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| match e.kind {
            serialport::ErrorKind::NoDevice => Error::DeviceNotFound {
                device: path.to_string(),
            },
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => Error::DevicePermission {
                device: path.to_string(),
            },
            _ => Error::DeviceUnavailable {
                device: path.to_string(),
                details: e.to_string(),
            },
        })
}

/// An in-memory duplex pair for tests: writes to `inbox` become available
/// to read back, and everything written via `write` is recorded in `sent`.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;

    pub struct MockTransport {
        pub inbox: VecDeque<u8>,
        pub sent: Vec<u8>,
        pub timeout: Duration,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                inbox: VecDeque::new(),
                sent: Vec::new(),
                timeout: Duration::from_millis(100),
            }
        }

        pub fn push_inbound(&mut self, bytes: &[u8]) {
            self.inbox.extend(bytes.iter().copied());
        }
    }

    impl io::Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbox.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            Ok(n)
        }
    }

    impl io::Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialTransport for MockTransport {
        fn clear_input(&mut self) -> io::Result<()> {
            self.inbox.clear();
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }
    }
}
