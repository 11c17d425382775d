//! Per-dialect device option registries.
//!
//! Options live in a handful of MSR bytes reported by the BSL during
//! identify. Each dialect has its own layout; encoding is a compose of
//! single-field updates over the device-reported bytes, so unspecified
//! options keep their current values.

use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::ProtocolKind;

mod stc12;
mod stc12a;
mod stc15;
mod stc15a;
mod stc8;
mod stc89;

pub use stc12::Stc12Options;
pub use stc12a::Stc12AOptions;
pub use stc15::Stc15Options;
pub use stc15a::Stc15AOptions;
pub use stc8::Stc8Options;
pub use stc89::Stc89Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(u32),
    Named(&'static str),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Named(v) => write!(f, "{}", v),
        }
    }
}

pub trait OptionSet {
    fn names(&self) -> &'static [&'static str];

    fn get(&self, name: &str) -> Result<OptionValue>;

    /// Set an option from its CLI string form. Unknown names and
    /// out-of-domain values are `BadOption`.
    fn set(&mut self, name: &str, value: &str) -> Result<()>;

    /// Cross-field constraints, checked once before the MSR is encoded.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Current MSR bytes with all updates applied.
    fn msr(&self) -> Vec<u8>;

    fn describe(&self) {
        log::info!("Target options:");
        for name in self.names() {
            if let Ok(value) = self.get(name) {
                log::info!("  {}={}", name, value);
            }
        }
    }
}

/// A default-initialized option set for a dialect, used to validate `-o`
/// names and values before any device I/O. `None` for dialects without
/// options (there are none today).
pub fn default_for(kind: ProtocolKind) -> Option<Box<dyn OptionSet>> {
    match kind {
        ProtocolKind::Stc89 => Some(Box::new(Stc89Options::new(0))),
        ProtocolKind::Stc12A => Some(Box::new(Stc12AOptions::new([0; 4]))),
        ProtocolKind::Stc12 | ProtocolKind::Stc12B => Some(Box::new(Stc12Options::new([0; 4]))),
        ProtocolKind::Stc15A => Some(Box::new(Stc15AOptions::new([0; 13]))),
        ProtocolKind::Stc15 | ProtocolKind::Usb15 => {
            Some(Box::new(Stc15Options::new(vec![0; 5])))
        }
        ProtocolKind::Stc8 => Some(Box::new(Stc8Options::new([0; 5]))),
        ProtocolKind::Auto => None,
    }
}

/// Pre-flight validation of a `KEY=VAL` pair against one dialect.
pub fn preflight(kind: ProtocolKind, name: &str, value: &str) -> Result<()> {
    match default_for(kind) {
        Some(mut set) => set.set(name, value),
        None => Ok(()),
    }
}

/// Pre-flight for `-P auto`: the pair must be accepted by at least one
/// dialect registry; the concrete dialect re-validates after detection.
pub fn preflight_any(name: &str, value: &str) -> Result<()> {
    let all = [
        ProtocolKind::Stc89,
        ProtocolKind::Stc12A,
        ProtocolKind::Stc12B,
        ProtocolKind::Stc12,
        ProtocolKind::Stc15A,
        ProtocolKind::Stc15,
        ProtocolKind::Stc8,
        ProtocolKind::Usb15,
    ];
    let mut last = None;
    for kind in all {
        match preflight(kind, name, value) {
            Ok(()) => return Ok(()),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| bad(name, "unknown option")))
}

pub(crate) fn bad(name: &str, msg: &str) -> Error {
    Error::BadOption(format!("{} ({})", name, msg))
}

pub(crate) fn unknown(name: &str) -> Error {
    Error::BadOption(format!("unknown option '{}'", name))
}

/// Lenient boolean in the tradition of the original tool: `true`/`t`/`1`
/// are true, everything else is false.
pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(value.chars().next(), Some('t') | Some('T') | Some('1'))
}

pub(crate) fn parse_int(name: &str, value: &str) -> Result<u32> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| bad(name, "invalid integer"))
}

pub(crate) fn parse_named(name: &str, value: &str, domain: &[(&'static str, u8)]) -> Result<u8> {
    domain
        .iter()
        .find(|(label, _)| *label == value)
        .map(|(_, bits)| *bits)
        .ok_or_else(|| {
            let labels: Vec<&str> = domain.iter().map(|(l, _)| *l).collect();
            bad(name, &format!("must be one of {}", labels.join(", ")))
        })
}

/// Watchdog prescaler domain shared by every family that has one.
pub(crate) fn prescale_to_bits(name: &str, value: &str) -> Result<u8> {
    let val = parse_int(name, value)?;
    if (2..=256).contains(&val) && val.is_power_of_two() {
        Ok((val.trailing_zeros() - 1) as u8)
    } else {
        Err(bad(name, "must be a power of two between 2 and 256"))
    }
}

pub(crate) fn prescale_from_bits(bits: u8) -> u32 {
    1 << ((bits & 0x07) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prescale_domain() {
        assert_eq!(prescale_to_bits("watchdog_prescale", "2").unwrap(), 0);
        assert_eq!(prescale_to_bits("watchdog_prescale", "256").unwrap(), 7);
        assert!(prescale_to_bits("watchdog_prescale", "5").is_err());
        assert!(prescale_to_bits("watchdog_prescale", "512").is_err());
        assert!(prescale_to_bits("watchdog_prescale", "0").is_err());
        for bits in 0..8 {
            let val = prescale_from_bits(bits);
            assert_eq!(prescale_to_bits("x", &val.to_string()).unwrap(), bits);
        }
    }

    #[test]
    fn preflight_rejects_unknown_names_everywhere() {
        assert!(preflight_any("no_such_option", "1").is_err());
        assert!(preflight_any("watchdog_por_enabled", "true").is_ok());
    }

    #[test]
    fn preflight_rejects_bad_prescale_before_io() {
        // -o watchdog_prescale=5 must fail before anything touches the port
        assert!(matches!(
            preflight_any("watchdog_prescale", "5"),
            Err(Error::BadOption(_))
        ));
    }

    #[test]
    fn option_name_known_by_one_dialect_only() {
        assert!(preflight(ProtocolKind::Stc8, "program_eeprom_split", "4096").is_ok());
        assert!(preflight(ProtocolKind::Stc89, "program_eeprom_split", "4096").is_err());
        assert!(preflight_any("program_eeprom_split", "4096").is_ok());
    }
}
