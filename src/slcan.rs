// src/slcan.rs
//
// slcan (Serial Line CAN) link: ASCII-framed serial transport to the
// USBtin adapter, Lawicel protocol. Protocol reference:
// http://www.can232.com/docs/can232_v3.pdf
//
// Frame formats on the wire (extended only — this device never uses
// standard 11-bit frames):
//   T<ID:8hex><DLC:1hex><DATA:2hex*DLC>\r — extended data frame
//   R<ID:8hex><DLC:1hex>\r                — extended RTR
//   z / Z                                 — adapter ACK, ignored

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::frame::CanFrame;
use crate::transport::SerialTransport;

/// Default CAN bus bitrate command for this heat pump (125 Kbit/s).
const SET_125_KBIT: &[u8] = b"S4\r";

/// slcan link over a serial transport.
pub struct SlcanLink<T: SerialTransport> {
    transport: T,
    line_buf: Vec<u8>,
    read_only: bool,
    device: String,
}

impl<T: SerialTransport> SlcanLink<T> {
    /// Wrap an already-open transport. Does not run the open sequence —
    /// call `open()` for that.
    pub fn new(transport: T, device: impl Into<String>, read_only: bool) -> Self {
        Self {
            transport,
            line_buf: Vec::with_capacity(32),
            read_only,
            device: device.into(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Direct access to the underlying transport, for test doubles that
    /// need to prime inbound bytes from outside this module.
    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run the initial connection sequence: close, set bitrate, open.
    pub fn open(&mut self) -> Result<()> {
        self.write_line(b"C\r")?;
        std::thread::sleep(Duration::from_millis(100));
        self.flush_input()?;

        self.write_line(SET_125_KBIT)?;
        std::thread::sleep(Duration::from_millis(100));

        self.write_line(b"O\r")?;
        std::thread::sleep(Duration::from_millis(100));
        self.flush_input()?;

        tracing::info!(device = %self.device, "slcan link opened at 125 kbit/s");
        Ok(())
    }

    /// Teardown: close the channel. Does not close the underlying port —
    /// callers drop the transport themselves.
    pub fn close(&mut self) -> Result<()> {
        self.write_line(b"C\r")?;
        tracing::info!(device = %self.device, "slcan link closed");
        Ok(())
    }

    fn write_line(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport
            .write_all(bytes)
            .map_err(|e| self.io_err(e))?;
        self.transport.flush().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn io_err(&self, e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout {
                operation: "serial write".to_string(),
                timeout_ms: self.transport.timeout().as_millis() as u64,
            },
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                Error::DeviceDisconnected {
                    device: self.device.clone(),
                }
            }
            _ => Error::DeviceUnavailable {
                device: self.device.clone(),
                details: e.to_string(),
            },
        }
    }

    /// Discard all buffered and available serial bytes.
    pub fn flush_input(&mut self) -> Result<()> {
        self.line_buf.clear();
        self.transport.clear_input().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Send a CAN frame. Transmitting a non-RTR frame while the link is
    /// read-only fails with `ReadOnly`.
    pub fn send(&mut self, frame: &CanFrame) -> Result<()> {
        if !frame.rtr && self.read_only {
            return Err(Error::ReadOnly {
                details: "link is in read-only mode".to_string(),
            });
        }
        let line = encode_frame(frame);
        tracing::debug!(device = %self.device, line = %line.trim_end(), "slcan tx");
        self.write_line(line.as_bytes())
    }

    /// Await the next fully decoded frame, or `Timeout` if none arrives
    /// within the window. Buffers partial lines across calls.
    pub fn receive(&mut self, timeout: Duration) -> Result<CanFrame> {
        let deadline = Instant::now() + timeout;
        let mut byte_buf = [0u8; 256];

        loop {
            if let Some(frame) = self.try_take_line()? {
                return Ok(frame);
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: "slcan receive".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            match self.transport.read(&mut byte_buf) {
                Ok(0) => {
                    return Err(Error::DeviceDisconnected {
                        device: self.device.clone(),
                    });
                }
                Ok(n) => self.line_buf.extend_from_slice(&byte_buf[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.io_err(e)),
            }
        }
    }

    /// Pull and decode the next complete `\r`-terminated line out of the
    /// buffer, if one is present. ACK/unknown lines are skipped silently;
    /// malformed frame lines raise `Protocol`.
    fn try_take_line(&mut self) -> Result<Option<CanFrame>> {
        loop {
            let Some(cr_pos) = self.line_buf.iter().position(|&b| b == b'\r') else {
                return Ok(None);
            };
            let line: Vec<u8> = self.line_buf.drain(..=cr_pos).collect();
            let line = &line[..line.len() - 1]; // drop trailing \r

            if line.is_empty() {
                continue;
            }
            match line[0] {
                b'z' | b'Z' => continue, // adapter ACK
                b'T' | b'R' => match decode_frame(line) {
                    Some(frame) => return Ok(Some(frame)),
                    None => {
                        return Err(Error::Protocol {
                            details: format!(
                                "malformed slcan line: {}",
                                String::from_utf8_lossy(line)
                            ),
                        })
                    }
                },
                _ => continue, // unknown response, ignore
            }
        }
    }
}

/// Encode a CAN frame to its slcan ASCII command, including trailing `\r`.
pub fn encode_frame(frame: &CanFrame) -> String {
    let mut line = String::with_capacity(32);
    if frame.rtr {
        line.push('R');
    } else {
        line.push('T');
    }
    line.push_str(&frame.id_hex());
    line.push_str(&format!("{:X}", frame.dlc().min(8)));
    if !frame.rtr {
        for byte in &frame.data {
            line.push_str(&format!("{:02X}", byte));
        }
    }
    line.push('\r');
    line
}

/// Decode a `T`/`R`-prefixed slcan line (without the trailing `\r`) into a
/// `CanFrame`. Returns `None` on malformed hex or truncated data.
fn decode_frame(line: &[u8]) -> Option<CanFrame> {
    let is_rtr = line[0] == b'R';
    const ID_LEN: usize = 8;
    let min_len = 1 + ID_LEN + 1;
    if line.len() < min_len {
        return None;
    }

    let id_str = std::str::from_utf8(&line[1..1 + ID_LEN]).ok()?;
    let id = u32::from_str_radix(id_str, 16).ok()?;

    let dlc = (line[1 + ID_LEN] as char).to_digit(16)? as u8;
    if dlc > 8 {
        return None;
    }

    let mut data = Vec::with_capacity(dlc as usize);
    if !is_rtr && dlc > 0 {
        let data_start = 1 + ID_LEN + 1;
        let expected_len = data_start + dlc as usize * 2;
        if line.len() < expected_len {
            return None;
        }
        for i in 0..dlc as usize {
            let byte_str =
                std::str::from_utf8(&line[data_start + i * 2..data_start + i * 2 + 2]).ok()?;
            data.push(u8::from_str_radix(byte_str, 16).ok()?);
        }
    }

    if is_rtr {
        CanFrame::rtr(id).ok()
    } else {
        CanFrame::data(id, data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::MockTransport;

    fn link(read_only: bool) -> SlcanLink<MockTransport> {
        SlcanLink::new(MockTransport::new(), "mock", read_only)
    }

    #[test]
    fn encode_extended_data_frame() {
        let f = CanFrame::data(0x0C007FE0, vec![0x02]).unwrap();
        assert_eq!(encode_frame(&f), "T0C007FE0102\r");
    }

    #[test]
    fn encode_rtr_frame() {
        let f = CanFrame::rtr(0x04007FE0).unwrap();
        assert_eq!(encode_frame(&f), "R04007FE00\r");
    }

    #[test]
    fn decode_data_frame_roundtrip() {
        let original = CanFrame::data(0x0C007FE0, vec![0x00, 0x69]).unwrap();
        let line = encode_frame(&original);
        let decoded = decode_frame(line[..line.len() - 1].as_bytes()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn receive_parses_buffered_line_and_skips_ack() {
        let mut l = link(false);
        l.transport.push_inbound(b"z\rT0C007FE0102\r");
        let frame = l.receive(Duration::from_millis(200)).unwrap();
        assert_eq!(frame.id, 0x0C007FE0);
        assert_eq!(frame.data, vec![0x02]);
    }

    #[test]
    fn receive_times_out_with_no_data() {
        let mut l = link(false);
        let err = l.receive(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn receive_rejects_malformed_line() {
        let mut l = link(false);
        l.transport.push_inbound(b"TZZZZZZZZ1\r");
        let err = l.receive(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn send_rejects_data_frame_when_read_only() {
        let mut l = link(true);
        let f = CanFrame::data(0x100, vec![0x01]).unwrap();
        let err = l.send(&f).unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
    }

    #[test]
    fn send_allows_rtr_even_when_read_only() {
        let mut l = link(true);
        let f = CanFrame::rtr(0x100).unwrap();
        assert!(l.send(&f).is_ok());
    }

    #[test]
    fn flush_input_clears_partial_line_buffer() {
        let mut l = link(false);
        l.transport.push_inbound(b"T0C007FE0");
        // prime the partial buffer
        let _ = l.try_take_line();
        l.flush_input().unwrap();
        assert!(l.line_buf.is_empty());
    }
}
