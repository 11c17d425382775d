//! STC12x052 series option bytes.

use super::{
    bad, parse_bool, parse_named, prescale_from_bits, prescale_to_bits, unknown, OptionSet,
    OptionValue,
};
use crate::error::Result;

const NAMES: &[&str] = &[
    "low_voltage_reset",
    "clock_source",
    "watchdog_por_enabled",
    "watchdog_stop_idle",
    "watchdog_prescale",
    "eeprom_erase_enabled",
    "bsl_pindetect_enabled",
];

pub struct Stc12AOptions {
    msr: [u8; 4],
    prescale_touched: bool,
}

impl Stc12AOptions {
    pub fn new(msr: [u8; 4]) -> Self {
        Stc12AOptions {
            msr,
            prescale_touched: false,
        }
    }

    fn watchdog_enabled(&self) -> bool {
        self.msr[1] & 0x20 == 0
    }
}

impl OptionSet for Stc12AOptions {
    fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        Ok(match name {
            "low_voltage_reset" => {
                OptionValue::Named(if self.msr[3] & 0x40 != 0 { "low" } else { "high" })
            }
            "clock_source" => {
                OptionValue::Named(if self.msr[0] & 0x02 != 0 { "external" } else { "internal" })
            }
            "watchdog_por_enabled" => OptionValue::Bool(self.watchdog_enabled()),
            "watchdog_stop_idle" => OptionValue::Bool(self.msr[1] & 0x08 == 0),
            "watchdog_prescale" => OptionValue::Int(prescale_from_bits(self.msr[1])),
            "eeprom_erase_enabled" => OptionValue::Bool(self.msr[2] & 0x02 == 0),
            "bsl_pindetect_enabled" => OptionValue::Bool(self.msr[2] & 0x01 == 0),
            _ => return Err(unknown(name)),
        })
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "low_voltage_reset" => {
                let bits = parse_named(name, value, &[("low", 1), ("high", 0)])?;
                self.msr[3] = (self.msr[3] & 0xbf) | (bits << 6);
            }
            "clock_source" => {
                let bits = parse_named(name, value, &[("internal", 0), ("external", 1)])?;
                self.msr[0] = (self.msr[0] & 0xfd) | (bits << 1);
            }
            "watchdog_por_enabled" => {
                self.msr[1] &= 0xdf;
                if !parse_bool(value) {
                    self.msr[1] |= 0x20;
                }
            }
            "watchdog_stop_idle" => {
                self.msr[1] &= 0xf7;
                if !parse_bool(value) {
                    self.msr[1] |= 0x08;
                }
            }
            "watchdog_prescale" => {
                let bits = prescale_to_bits(name, value)?;
                self.msr[1] = (self.msr[1] & 0xf8) | bits;
                self.prescale_touched = true;
            }
            "eeprom_erase_enabled" => {
                self.msr[2] &= 0xfd;
                if !parse_bool(value) {
                    self.msr[2] |= 0x02;
                }
            }
            "bsl_pindetect_enabled" => {
                self.msr[2] &= 0xfe;
                if !parse_bool(value) {
                    self.msr[2] |= 0x01;
                }
            }
            _ => return Err(unknown(name)),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.prescale_touched && !self.watchdog_enabled() {
            return Err(bad(
                "watchdog_prescale",
                "meaningless while watchdog_por_enabled is false",
            ));
        }
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        self.msr.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prescale_requires_watchdog() {
        let mut opts = Stc12AOptions::new([0; 4]);
        opts.set("watchdog_por_enabled", "false").unwrap();
        opts.set("watchdog_prescale", "32").unwrap();
        assert!(opts.validate().is_err());

        let mut opts = Stc12AOptions::new([0; 4]);
        opts.set("watchdog_por_enabled", "true").unwrap();
        opts.set("watchdog_prescale", "32").unwrap();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.get("watchdog_prescale").unwrap(), OptionValue::Int(32));
    }

    #[test]
    fn clock_source_bits() {
        let mut opts = Stc12AOptions::new([0; 4]);
        opts.set("clock_source", "external").unwrap();
        assert_eq!(opts.msr()[0], 0x02);
        opts.set("clock_source", "internal").unwrap();
        assert_eq!(opts.msr()[0], 0x00);
        assert!(opts.set("clock_source", "rc").is_err());
    }
}
