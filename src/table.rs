// src/table.rs
//
// Parameter descriptor and the immutable registry over it. Mirrors
// buderus_wps/parameter.py's Parameter/HeatPump split: an immutable,
// Clone-able descriptor plus a container with O(1) lookup by index and
// by case-insensitive name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// CAN ID constants for parameter addressing (§4.C / §6, bit-exact).
pub const READ_ID_BASE: u32 = 0x0400_3FE0;
pub const WRITE_ID_BASE: u32 = 0x0C00_3FE0;

/// Immutable parameter descriptor, addressed by `index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub index: u32,
    pub ext_id: String,
    pub min: i64,
    pub max: i64,
    pub format: String,
    pub read: i32,
    pub name: String,
}

impl Parameter {
    /// `read == 0` means writable; any non-zero flag means read-only.
    pub fn is_writable(&self) -> bool {
        self.read == 0
    }

    /// `max < min` descriptors are preserved verbatim from the reference
    /// table but must never be treated as a normal range (§4.C, §9b).
    pub fn has_inconsistent_range(&self) -> bool {
        self.max < self.min
    }

    /// CAN ID for reading this parameter: `0x04003FE0 | (index << 14)`.
    pub fn read_id(&self) -> u32 {
        read_id(self.index)
    }

    /// CAN ID for writing this parameter / the response to a read:
    /// `0x0C003FE0 | (index << 14)`.
    pub fn write_id(&self) -> u32 {
        write_id(self.index)
    }

    /// Validate a value against `[min, max]`. Refuses outright (distinct
    /// from "out of range") when the descriptor's range is inconsistent.
    pub fn validate(&self, value: i64) -> Result<()> {
        if self.has_inconsistent_range() {
            return Err(Error::InconsistentRange(self.name.clone()));
        }
        if value < self.min || value > self.max {
            return Err(Error::OutOfRange {
                parameter: self.name.clone(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// CAN ID for reading parameter `index`.
pub fn read_id(index: u32) -> u32 {
    READ_ID_BASE | (index << 14)
}

/// CAN ID for writing parameter `index` (also the read response ID).
pub fn write_id(index: u32) -> u32 {
    WRITE_ID_BASE | (index << 14)
}

/// Immutable registry over a set of parameter descriptors, indexed by
/// `index` and by case-insensitive `name`.
#[derive(Debug)]
pub struct ParameterTable {
    by_index: HashMap<u32, Parameter>,
    by_name: HashMap<String, u32>, // uppercased name -> index
}

impl ParameterTable {
    /// Build a table from a parameter list, enforcing the uniqueness
    /// invariants from §3 (unique index, unique name, unique ext_id).
    pub fn build(parameters: Vec<Parameter>) -> Result<Self> {
        let mut by_index = HashMap::with_capacity(parameters.len());
        let mut by_name = HashMap::with_capacity(parameters.len());
        let mut seen_ext_ids = std::collections::HashSet::with_capacity(parameters.len());

        for p in parameters {
            let upper_name = p.name.to_uppercase();
            if by_index.contains_key(&p.index) {
                return Err(Error::Protocol {
                    details: format!("duplicate parameter index {}", p.index),
                });
            }
            if by_name.contains_key(&upper_name) {
                return Err(Error::Protocol {
                    details: format!("duplicate parameter name {}", p.name),
                });
            }
            if !seen_ext_ids.insert(p.ext_id.clone()) {
                return Err(Error::Protocol {
                    details: format!("duplicate ext_id {}", p.ext_id),
                });
            }
            by_name.insert(upper_name, p.index);
            by_index.insert(p.index, p);
        }

        Ok(Self { by_index, by_name })
    }

    pub fn by_index(&self, index: u32) -> Result<&Parameter> {
        self.by_index
            .get(&index)
            .ok_or_else(|| Error::UnknownParameter(index.to_string()))
    }

    pub fn by_name(&self, name: &str) -> Result<&Parameter> {
        let upper = name.to_uppercase();
        let index = self
            .by_name
            .get(&upper)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        self.by_index(*index)
    }

    /// Resolve a parameter by either its numeric index or its name, the
    /// way every CLI command (`read <name|index>`, `write <name|index>
    /// <value>`) addresses a parameter.
    pub fn resolve(&self, selector: &str) -> Result<&Parameter> {
        if let Ok(index) = selector.parse::<u32>() {
            if let Ok(p) = self.by_index(index) {
                return Ok(p);
            }
        }
        self.by_name(selector)
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.by_index.contains_key(&index)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// All parameters, sorted by index.
    pub fn all(&self) -> Vec<&Parameter> {
        let mut v: Vec<&Parameter> = self.by_index.values().collect();
        v.sort_by_key(|p| p.index);
        v
    }

    pub fn writable(&self) -> Vec<&Parameter> {
        let mut v: Vec<&Parameter> = self.by_index.values().filter(|p| p.is_writable()).collect();
        v.sort_by_key(|p| p.index);
        v
    }

    pub fn read_only(&self) -> Vec<&Parameter> {
        let mut v: Vec<&Parameter> = self
            .by_index
            .values()
            .filter(|p| !p.is_writable())
            .collect();
        v.sort_by_key(|p| p.index);
        v
    }
}
