//! STC89/90 series option byte.

use super::{parse_bool, parse_named, unknown, OptionSet, OptionValue};
use crate::error::Result;

const NAMES: &[&str] = &[
    "cpu_6t_enabled",
    "bsl_pindetect_enabled",
    "eeprom_erase_enabled",
    "clock_gain",
    "ale_enabled",
    "xram_enabled",
    "watchdog_por_enabled",
];

/// All options share a single MSR byte. Most bits are active-low.
pub struct Stc89Options {
    msr: u8,
}

impl Stc89Options {
    pub fn new(msr: u8) -> Self {
        Stc89Options { msr }
    }

    fn set_inverted_bit(&mut self, mask: u8, enabled: bool) {
        self.msr &= !mask;
        if !enabled {
            self.msr |= mask;
        }
    }

    fn set_bit(&mut self, mask: u8, enabled: bool) {
        self.msr &= !mask;
        if enabled {
            self.msr |= mask;
        }
    }
}

impl OptionSet for Stc89Options {
    fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        Ok(match name {
            "cpu_6t_enabled" => OptionValue::Bool(self.msr & 0x01 == 0),
            "bsl_pindetect_enabled" => OptionValue::Bool(self.msr & 0x04 == 0),
            "eeprom_erase_enabled" => OptionValue::Bool(self.msr & 0x08 == 0),
            "clock_gain" => OptionValue::Named(if self.msr & 0x10 != 0 { "high" } else { "low" }),
            "ale_enabled" => OptionValue::Bool(self.msr & 0x20 != 0),
            "xram_enabled" => OptionValue::Bool(self.msr & 0x40 != 0),
            "watchdog_por_enabled" => OptionValue::Bool(self.msr & 0x80 == 0),
            _ => return Err(unknown(name)),
        })
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "cpu_6t_enabled" => self.set_inverted_bit(0x01, parse_bool(value)),
            "bsl_pindetect_enabled" => self.set_inverted_bit(0x04, parse_bool(value)),
            "eeprom_erase_enabled" => self.set_inverted_bit(0x08, parse_bool(value)),
            "clock_gain" => {
                let bits = parse_named(name, value, &[("low", 0x00), ("high", 0x10)])?;
                self.msr = (self.msr & 0xef) | bits;
            }
            "ale_enabled" => self.set_bit(0x20, parse_bool(value)),
            "xram_enabled" => self.set_bit(0x40, parse_bool(value)),
            "watchdog_por_enabled" => self.set_inverted_bit(0x80, parse_bool(value)),
            _ => return Err(unknown(name)),
        }
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        vec![self.msr]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_bits() {
        let mut opts = Stc89Options::new(0x00);
        // all-zero MSR means every active-low feature is on
        assert_eq!(opts.get("cpu_6t_enabled").unwrap(), OptionValue::Bool(true));
        assert_eq!(opts.get("watchdog_por_enabled").unwrap(), OptionValue::Bool(true));

        opts.set("cpu_6t_enabled", "false").unwrap();
        opts.set("clock_gain", "high").unwrap();
        opts.set("ale_enabled", "true").unwrap();
        opts.set("watchdog_por_enabled", "false").unwrap();
        assert_eq!(opts.msr(), vec![0x01 | 0x10 | 0x20 | 0x80]);

        assert_eq!(opts.get("cpu_6t_enabled").unwrap(), OptionValue::Bool(false));
        assert_eq!(opts.get("clock_gain").unwrap(), OptionValue::Named("high"));
        assert_eq!(opts.get("ale_enabled").unwrap(), OptionValue::Bool(true));
    }

    #[test]
    fn rejects_unknown_name_and_value() {
        let mut opts = Stc89Options::new(0xff);
        assert!(opts.set("low_voltage_reset", "1").is_err());
        assert!(opts.set("clock_gain", "medium").is_err());
    }
}
