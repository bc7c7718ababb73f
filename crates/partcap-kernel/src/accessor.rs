//! Typed get/set of capabilities through named `cap-<name>` properties.
//!
//! Values cross the configuration boundary as a [`PropertyValue`]: a
//! boolean, an enumerated string or a byte count, depending on the
//! capability's [`ValueKind`].  Setters are all-or-nothing: a value that
//! fails to decode leaves the machine untouched.

use std::fmt;

use partcap_types::{CapError, CapabilityId, Level};

use crate::capability_set::MachineCaps;
use crate::registry::{self, CapabilityDescriptor, ValueKind};

/// Decoded value of a capability property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Str(String),
    /// Byte count.
    Size(u64),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(true) => f.write_str("on"),
            PropertyValue::Bool(false) => f.write_str("off"),
            PropertyValue::Str(s) => f.write_str(s),
            PropertyValue::Size(bytes) => f.write_str(&format_size(*bytes)),
        }
    }
}

/// Presentation of one configuration property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub type_name: &'static str,
    pub description: &'static str,
    pub help: Option<&'static str>,
}

/// Every `cap-*` property in id order.
pub fn properties() -> Vec<PropertyInfo> {
    registry::descriptors()
        .map(|d| PropertyInfo {
            name: d.property_name(),
            type_name: d.kind.type_name(),
            description: d.description,
            help: d.help(),
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Encode / decode
// ────────────────────────────────────────────────────────────────────────────

/// External representation of `level` for `desc`.
///
/// # Errors
///
/// [`CapError::LevelOutOfRange`] when an enumerated level has no name.
pub fn encode_level(
    desc: &CapabilityDescriptor,
    level: Level,
) -> Result<PropertyValue, CapError> {
    match desc.kind {
        ValueKind::Boolean => Ok(PropertyValue::Bool(level == 1)),
        ValueKind::Enumerated(possible) => possible
            .name(level)
            .map(|name| PropertyValue::Str(name.to_string()))
            .ok_or_else(|| CapError::LevelOutOfRange {
                capability: desc.name.to_string(),
                level,
            }),
        ValueKind::Log2Size => Ok(PropertyValue::Size(1u64 << level.min(63))),
    }
}

/// Internal level for an external `value` of `desc`.
///
/// # Errors
///
/// - [`CapError::WrongType`] – the value's type does not match the kind.
/// - [`CapError::Help`] – `"?"` on an enumerated capability.
/// - [`CapError::InvalidValue`] – no enumerated name matches.
/// - [`CapError::NotPowerOfTwo`] – a size that is not an exact power of two.
pub fn decode_value(desc: &CapabilityDescriptor, value: &PropertyValue) -> Result<Level, CapError> {
    match (&desc.kind, value) {
        (ValueKind::Boolean, PropertyValue::Bool(b)) => Ok(Level::from(*b)),
        (ValueKind::Enumerated(possible), PropertyValue::Str(s)) => {
            if s == "?" {
                return Err(CapError::Help(possible.help.to_string()));
            }
            possible.position(s).ok_or_else(|| CapError::InvalidValue {
                capability: desc.name.to_string(),
                value: s.clone(),
            })
        }
        (ValueKind::Log2Size, PropertyValue::Size(bytes)) => {
            if !bytes.is_power_of_two() {
                return Err(CapError::NotPowerOfTwo {
                    capability: desc.name.to_string(),
                    value: *bytes,
                });
            }
            Ok(bytes.trailing_zeros() as Level)
        }
        (kind, _) => Err(CapError::WrongType {
            capability: desc.name.to_string(),
            expected: kind.type_name().to_string(),
        }),
    }
}

/// Decode the textual form of a property value, as typed on a command line
/// or in a shell.
pub fn parse_value(desc: &CapabilityDescriptor, raw: &str) -> Result<PropertyValue, CapError> {
    let raw = raw.trim();
    match desc.kind {
        ValueKind::Boolean => parse_bool(raw)
            .map(PropertyValue::Bool)
            .ok_or_else(|| CapError::WrongType {
                capability: desc.name.to_string(),
                expected: "bool".to_string(),
            }),
        ValueKind::Enumerated(_) => Ok(PropertyValue::Str(raw.to_string())),
        ValueKind::Log2Size => parse_size(raw).map(PropertyValue::Size),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parse a byte count with an optional binary suffix (`K`, `M`, `G`, `T`).
///
/// ```
/// use partcap_kernel::accessor::parse_size;
///
/// assert_eq!(parse_size("65536").unwrap(), 65536);
/// assert_eq!(parse_size("64K").unwrap(), 65536);
/// assert_eq!(parse_size("16m").unwrap(), 16 << 20);
/// assert!(parse_size("lots").is_err());
/// ```
pub fn parse_size(raw: &str) -> Result<u64, CapError> {
    let invalid = || CapError::InvalidSize(raw.to_string());
    let raw_trim = raw.trim();
    let (digits, shift) = match raw_trim.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'B' => 0,
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(invalid()),
            };
            (&raw_trim[..raw_trim.len() - 1], shift)
        }
        _ => (raw_trim, 0),
    };
    let base: u64 = digits.trim().parse().map_err(|_| invalid())?;
    base.checked_mul(1u64 << shift).ok_or_else(invalid)
}

/// Compact byte count, e.g. `64K` or `16G`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u32, &str); 4] = [(40, "T"), (30, "G"), (20, "M"), (10, "K")];
    for (shift, suffix) in UNITS {
        if bytes >= 1u64 << shift && bytes % (1u64 << shift) == 0 {
            return format!("{}{suffix}", bytes >> shift);
        }
    }
    bytes.to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// Machine-level accessors
// ────────────────────────────────────────────────────────────────────────────

/// Current value of capability `id`.
pub fn get(caps: &MachineCaps, id: CapabilityId) -> Result<PropertyValue, CapError> {
    encode_level(registry::descriptor(id), caps.level(id))
}

/// Set capability `id` and mark it overridden.  Leaves `caps` unchanged on
/// error.
pub fn set(
    caps: &mut MachineCaps,
    id: CapabilityId,
    value: &PropertyValue,
) -> Result<(), CapError> {
    let level = decode_value(registry::descriptor(id), value)?;
    caps.set_override(id, level);
    Ok(())
}

/// Current value of the property called `name` (`cap-htm` or `htm`).
pub fn get_property(caps: &MachineCaps, name: &str) -> Result<PropertyValue, CapError> {
    let desc = registry::lookup(name).ok_or_else(|| CapError::UnknownProperty(name.to_string()))?;
    get(caps, desc.id)
}

/// Set the property called `name` from its textual form.
///
/// # Example
///
/// ```
/// use partcap_kernel::accessor::{get_property, set_property, PropertyValue};
/// use partcap_kernel::capability_set::{CapabilitySet, MachineCaps};
///
/// let mut caps = MachineCaps::new(CapabilitySet::default());
/// set_property(&mut caps, "cap-cfpc", "WORKAROUND").unwrap();
/// assert_eq!(
///     get_property(&caps, "cap-cfpc").unwrap(),
///     PropertyValue::Str("workaround".into())
/// );
/// ```
pub fn set_property(caps: &mut MachineCaps, name: &str, raw: &str) -> Result<(), CapError> {
    let desc = registry::lookup(name).ok_or_else(|| CapError::UnknownProperty(name.to_string()))?;
    let value = parse_value(desc, raw)?;
    set(caps, desc.id, &value)
}
