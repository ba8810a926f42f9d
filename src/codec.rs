// src/codec.rs
//
// Format-directed decode/encode between raw CAN payload bytes and
// semantic values. Format rules mirror
// custom_components/buderus_wps/buderus_wps/formats.py's FHEM_FORMATS
// table (factor + unit + optional selector list) exactly.

use crate::error::{Error, Result};

/// Raw 16-bit dead-sensor sentinel (0xDEAD, -8531 as signed two's complement).
pub const DEAD_SENSOR_RAW: i64 = -8531;

/// A decoded parameter value, tagged by what kind of format produced it.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
    /// Identity formats: int, t15, sw1, sw2.
    Int(i64),
    /// Scaled formats with a unit: hm1/hm2 (s), tem (°C), pw2/pw3 (kW).
    Scaled { value: f64, unit: &'static str },
    /// Enumerated selector formats: rp1, rp2, dp1, dp2.
    Selector { raw: i64, label: String },
    /// Raw 16-bit 0xDEAD — sensor disconnected or faulty.
    Disconnected,
}

impl DecodedValue {
    /// Render for text/JSON display, matching the CLI's `"<value>"` rules.
    pub fn display(&self) -> String {
        match self {
            DecodedValue::Int(v) => v.to_string(),
            DecodedValue::Scaled { value, unit } => {
                if unit.is_empty() {
                    format!("{}", value)
                } else {
                    format!("{} {}", value, unit)
                }
            }
            DecodedValue::Selector { label, .. } => label.clone(),
            DecodedValue::Disconnected => "disconnected".to_string(),
        }
    }
}

/// A selector option, e.g. `"0:Automatic"`.
struct SelectorFormat {
    options: &'static [&'static str],
}

fn selector_for(format: &str) -> Option<SelectorFormat> {
    const RP1: &[&str] = &[
        "0:HP_Optimized",
        "1:Program_1",
        "2:Program_2",
        "3:Family",
        "4:Morning",
        "5:Evening",
        "6:Seniors",
    ];
    const RP2: &[&str] = &["0:Automatic", "1:Normal", "2:Exception", "3:HeatingOff"];
    const DP1: &[&str] = &["0:Always_On", "1:Program_1", "2:Program_2"];
    const DP2: &[&str] = &["0:Automatic", "1:Always_On", "2:Always_Off"];

    match format {
        "rp1" => Some(SelectorFormat { options: RP1 }),
        "rp2" => Some(SelectorFormat { options: RP2 }),
        "dp1" => Some(SelectorFormat { options: DP1 }),
        "dp2" => Some(SelectorFormat { options: DP2 }),
        _ => None,
    }
}

/// Decode raw big-endian bytes as two's complement, sized by the slice's
/// length (1, 2, or 4 bytes — the only canonical widths this protocol uses).
fn decode_signed(bytes: &[u8]) -> Result<i64> {
    match bytes.len() {
        1 => Ok(bytes[0] as i8 as i64),
        2 => Ok(i16::from_be_bytes([bytes[0], bytes[1]]) as i64),
        4 => Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64),
        n => Err(Error::DecodeError {
            format: "int".to_string(),
            details: format!("unsupported payload width {}", n),
        }),
    }
}

/// Decode a raw payload for the given format tag.
pub fn decode(format: &str, bytes: &[u8]) -> Result<DecodedValue> {
    if bytes.is_empty() {
        return Err(Error::DecodeError {
            format: format.to_string(),
            details: "empty payload".to_string(),
        });
    }

    let raw = decode_signed(bytes)?;

    if bytes.len() == 2 && raw == DEAD_SENSOR_RAW {
        return Ok(DecodedValue::Disconnected);
    }

    if let Some(sel) = selector_for(format) {
        let label = sel
            .options
            .iter()
            .find(|opt| opt.starts_with(&format!("{}:", raw)))
            .map(|s| s.to_string())
            .unwrap_or_else(|| raw.to_string());
        return Ok(DecodedValue::Selector { raw, label });
    }

    match format {
        "int" | "t15" | "sw1" | "sw2" => Ok(DecodedValue::Int(raw)),
        "hm1" => Ok(DecodedValue::Scaled {
            value: raw as f64,
            unit: "s",
        }),
        "hm2" => Ok(DecodedValue::Scaled {
            value: (raw * 10) as f64,
            unit: "s",
        }),
        "tem" => Ok(DecodedValue::Scaled {
            value: raw as f64 * 0.1,
            unit: "\u{B0}C",
        }),
        "pw2" => Ok(DecodedValue::Scaled {
            value: raw as f64 * 0.01,
            unit: "kW",
        }),
        "pw3" => Ok(DecodedValue::Scaled {
            value: raw as f64 * 0.001,
            unit: "kW",
        }),
        other => Err(Error::DecodeError {
            format: other.to_string(),
            details: "unknown format tag".to_string(),
        }),
    }
}

/// Semantic input to the encoder: either a bare number or a selector string
/// (`"Name"`, `"<n>"`, or `"<n>:Name"`).
#[derive(Clone, Debug)]
pub enum EncodeInput<'a> {
    Number(i64),
    Text(&'a str),
}

/// Canonical payload width for a format: `tem` is always 2 bytes; other
/// formats default to 1 byte unless the value needs more.
fn canonical_width(format: &str, value: i64) -> usize {
    if format == "tem" {
        return 2;
    }
    if (-128..=127).contains(&value) {
        1
    } else if (-32768..=32767).contains(&value) {
        2
    } else {
        4
    }
}

fn resolve_selector_value(sel: &SelectorFormat, input: &EncodeInput) -> Result<i64> {
    match input {
        EncodeInput::Number(n) => Ok(*n),
        EncodeInput::Text(text) => {
            // "<n>" or "<n>:Name"
            if let Some(prefix) = text.split(':').next() {
                if let Ok(n) = prefix.parse::<i64>() {
                    return Ok(n);
                }
            }
            // Bare name — search for a matching option by suffix.
            for opt in sel.options {
                if let Some((n_str, label)) = opt.split_once(':') {
                    if label.eq_ignore_ascii_case(text) {
                        return n_str
                            .parse::<i64>()
                            .map_err(|_| Error::DecodeError {
                                format: "selector".to_string(),
                                details: format!("malformed option {}", opt),
                            });
                    }
                }
            }
            Err(Error::DecodeError {
                format: "selector".to_string(),
                details: format!("no selector option matches '{}'", text),
            })
        }
    }
}

/// Encode a semantic value into a big-endian payload for the given format.
/// Range-checks against `[min, max]` before producing bytes.
pub fn encode(format: &str, min: i64, max: i64, input: EncodeInput) -> Result<Vec<u8>> {
    let value = if let Some(sel) = selector_for(format) {
        resolve_selector_value(&sel, &input)?
    } else {
        match input {
            EncodeInput::Number(n) => n,
            EncodeInput::Text(text) => text.parse::<i64>().map_err(|_| Error::DecodeError {
                format: format.to_string(),
                details: format!("'{}' is not numeric", text),
            })?,
        }
    };

    if max >= min && (value < min || value > max) {
        return Err(Error::OutOfRange {
            parameter: format.to_string(),
            value,
            min,
            max,
        });
    }

    let width = canonical_width(format, value);
    let bytes = value.to_be_bytes(); // 8 bytes, big-endian
    Ok(bytes[8 - width..].to_vec())
}
