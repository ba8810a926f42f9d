// src/discovery.rs
//
// Bulk parameter-discovery handshake (§4.F). Binary element layout and
// the signed/unsigned reinterpretation rule mirror
// fhem/26_KM273v018.pm's unpack("nH14NNc", ...) / `unpack 'l*', pack 'L*'`
// idiom, as documented in tests/unit/test_discovery.py of the Python
// reference this spec was distilled from.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::CanFrame;
use crate::slcan::SlcanLink;
use crate::table::Parameter;
use crate::transport::SerialTransport;

pub const ELEMENT_COUNT_SEND: u32 = 0x01FD_7FE0;
pub const ELEMENT_COUNT_RECV: u32 = 0x09FD_7FE0;
pub const ELEMENT_DATA_SEND: u32 = 0x01FD_3FE0;
pub const ELEMENT_DATA_RECV: u32 = 0x09FD_BFE0;

/// Chunk size requested per discovery round.
const CHUNK_SIZE: u32 = 4096;

/// Minimum fraction of the declared element count that counts as a
/// successful (if partial) discovery.
const MIN_ACCEPTABLE_FRACTION: f64 = 0.95;

/// One parsed discovery element, before it's widened into a full
/// `Parameter` (discovery alone never learns `format`/`read`).
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    pub idx: u32,
    pub ext_id: String,
    pub max: i32,
    pub min: i32,
    pub name: String,
}

impl From<Element> for Parameter {
    fn from(e: Element) -> Self {
        Parameter {
            index: e.idx,
            ext_id: e.ext_id,
            min: e.min as i64,
            max: e.max as i64,
            format: "int".to_string(),
            read: 0,
            name: e.name,
        }
    }
}

/// Parse one element starting at `offset`. Returns the element and the
/// number of bytes consumed, or `None` if the header/name doesn't fit —
/// in which case the caller stops parsing and keeps what it already has.
pub fn parse_element(buf: &[u8], offset: usize) -> Option<(Element, usize)> {
    const HEADER_LEN: usize = 18;
    let remaining = buf.len().checked_sub(offset)?;
    if remaining < HEADER_LEN {
        return None;
    }

    let idx = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u32;
    let ext_id_bytes = &buf[offset + 2..offset + 9];
    let ext_id = hex::encode_upper(ext_id_bytes);

    let max_u = u32::from_be_bytes([
        buf[offset + 9],
        buf[offset + 10],
        buf[offset + 11],
        buf[offset + 12],
    ]);
    let min_u = u32::from_be_bytes([
        buf[offset + 13],
        buf[offset + 14],
        buf[offset + 15],
        buf[offset + 16],
    ]);
    // "read as u32, bit-cast to i32" — matches Perl's unpack 'l*', pack 'L*'.
    let max = max_u as i32;
    let min = min_u as i32;

    let name_len = buf[offset + 17] as usize;
    if name_len <= 1 || name_len >= 100 {
        return None;
    }

    let name_start = offset + HEADER_LEN;
    if buf.len() < name_start + name_len {
        return None;
    }
    let name_bytes = &buf[name_start..name_start + name_len - 1]; // exclude trailing NUL
    let name = String::from_utf8_lossy(name_bytes).to_string();

    let element = Element {
        idx,
        ext_id,
        max,
        min,
        name,
    };
    Some((element, HEADER_LEN + name_len))
}

/// Parse as many elements as possible out of a concatenated buffer,
/// stopping (without error) at the first rejection.
pub fn parse_elements(buf: &[u8]) -> Vec<Element> {
    let mut elements = Vec::new();
    let mut offset = 0;
    while let Some((element, consumed)) = parse_element(buf, offset) {
        elements.push(element);
        offset += consumed;
    }
    elements
}

/// Result of a discovery run: the elements gathered and whether the
/// declared count was fully satisfied.
pub struct DiscoveryResult {
    pub elements: Vec<Element>,
    pub declared_count: u32,
}

/// Run the two-step bulk-enumeration handshake over an open slcan link.
pub fn discover<T: SerialTransport>(
    link: &mut SlcanLink<T>,
    per_frame_timeout: Duration,
    collect_window: Duration,
) -> Result<DiscoveryResult> {
    link.flush_input()?;
    link.send(&CanFrame::rtr(ELEMENT_COUNT_SEND)?)?;

    let count_frame = loop {
        let frame = link.receive(per_frame_timeout)?;
        if frame.id == ELEMENT_COUNT_RECV {
            break frame;
        }
    };
    if count_frame.data.len() < 4 {
        return Err(Error::Protocol {
            details: "element count response shorter than 4 bytes".to_string(),
        });
    }
    let declared_count = u32::from_be_bytes([
        count_frame.data[0],
        count_frame.data[1],
        count_frame.data[2],
        count_frame.data[3],
    ]);
    tracing::info!(declared_count, "discovery: element count received");

    let mut buf: Vec<u8> = Vec::new();
    let mut elements: Vec<Element> = Vec::new();
    let mut offset: u32 = 0;

    loop {
        let mut request = Vec::with_capacity(8);
        request.extend_from_slice(&CHUNK_SIZE.to_be_bytes());
        request.extend_from_slice(&offset.to_be_bytes());
        link.send(&CanFrame::data(ELEMENT_DATA_SEND, request)?)?;

        let deadline = std::time::Instant::now() + collect_window;
        let chunk_start = buf.len();
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match link.receive(remaining) {
                Ok(frame) if frame.id == ELEMENT_DATA_RECV => {
                    buf.extend_from_slice(&frame.data);
                }
                Ok(_) => {}
                Err(Error::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        let received_this_round = buf.len() - chunk_start;
        elements = parse_elements(&buf);

        tracing::debug!(
            offset,
            buf_len = buf.len(),
            parsed = elements.len(),
            received_this_round,
            "discovery: chunk processed"
        );

        if elements.len() as u32 >= declared_count {
            break;
        }
        if received_this_round == 0 {
            // No further frames arrived for this offset — buffer exhausted.
            break;
        }
        offset += CHUNK_SIZE;
    }

    Ok(DiscoveryResult {
        elements,
        declared_count,
    })
}

/// Accept a discovery result only if it cleared the minimum acceptable
/// fraction of the declared count; otherwise surface `DiscoveryIncomplete`.
pub fn require_near_complete(result: DiscoveryResult) -> Result<Vec<Element>> {
    let received = result.elements.len();
    let declared = result.declared_count as usize;
    if declared == 0 {
        return Ok(result.elements);
    }
    let fraction = received as f64 / declared as f64;
    if fraction < MIN_ACCEPTABLE_FRACTION {
        return Err(Error::DiscoveryIncomplete {
            received,
            declared,
            fraction: fraction * 100.0,
        });
    }
    Ok(result.elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element_binary(idx: u16, ext_id_hex: &str, max: i32, min: i32, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&idx.to_be_bytes());
        buf.extend_from_slice(&hex::decode(ext_id_hex).unwrap());
        buf.extend_from_slice(&(max as u32).to_be_bytes());
        buf.extend_from_slice(&(min as u32).to_be_bytes());
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        buf.push(name_bytes.len() as u8);
        buf.extend_from_slice(&name_bytes);
        buf
    }

    #[test]
    fn parse_element_matches_scenario_5() {
        // Scenario 5: first 19 bytes give ACCESS_LEVEL, advance offset by 18+13=31
        let buf = element_binary(1, "61E1E1FC660023", 5, 0, "ACCESS_LEVEL");
        let (element, consumed) = parse_element(&buf, 0).unwrap();
        assert_eq!(element.idx, 1);
        assert_eq!(element.ext_id, "61E1E1FC660023");
        assert_eq!(element.max, 5);
        assert_eq!(element.min, 0);
        assert_eq!(element.name, "ACCESS_LEVEL");
        assert_eq!(consumed, 18 + 13);
    }

    #[test]
    fn parse_element_reinterprets_negative_min() {
        let buf = element_binary(11, "E555E4E11002E9", 40, -30, "ADDITIONAL_BLOCK_HIGH_T2_TEMP");
        let (element, _) = parse_element(&buf, 0).unwrap();
        assert_eq!(element.min, -30);
        assert_eq!(element.max, 40);
    }

    #[test]
    fn parse_element_rejects_short_header() {
        let buf = vec![0u8; 10];
        assert!(parse_element(&buf, 0).is_none());
    }

    #[test]
    fn parse_element_rejects_degenerate_name_len() {
        let mut buf = element_binary(1, "61E1E1FC660023", 5, 0, "X");
        buf[17] = 1; // name_len <= 1
        assert!(parse_element(&buf, 0).is_none());
    }

    #[test]
    fn parse_element_rejects_truncated_name() {
        let mut buf = element_binary(1, "61E1E1FC660023", 5, 0, "ACCESS_LEVEL");
        buf.truncate(20); // header + name_len but not enough name bytes
        assert!(parse_element(&buf, 0).is_none());
    }

    #[test]
    fn parse_elements_stops_at_first_rejection_keeping_prior_elements() {
        let mut buf = element_binary(1, "61E1E1FC660023", 5, 0, "ACCESS_LEVEL");
        buf.extend_from_slice(&[0u8; 5]); // trailing garbage too short to parse
        let elements = parse_elements(&buf);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].name, "ACCESS_LEVEL");
    }

    #[test]
    fn require_near_complete_accepts_at_threshold() {
        let result = DiscoveryResult {
            elements: vec![Element {
                idx: 0,
                ext_id: "00".repeat(7),
                max: 0,
                min: 0,
                name: "A".to_string(),
            }],
            declared_count: 1,
        };
        assert!(require_near_complete(result).is_ok());
    }

    #[test]
    fn require_near_complete_rejects_below_threshold() {
        let result = DiscoveryResult {
            elements: vec![],
            declared_count: 10,
        };
        assert!(matches!(
            require_near_complete(result).unwrap_err(),
            Error::DiscoveryIncomplete { .. }
        ));
    }
}
