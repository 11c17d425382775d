//! Early STC15 series option bytes, 13-byte MSR with embedded trim counter.

use super::{
    bad, parse_bool, parse_int, prescale_from_bits, prescale_to_bits, unknown, OptionSet,
    OptionValue,
};
use crate::error::Result;

const NAMES: &[&str] = &[
    "reset_pin_enabled",
    "watchdog_por_enabled",
    "watchdog_stop_idle",
    "watchdog_prescale",
    "low_voltage_reset",
    "low_voltage_threshold",
    "eeprom_lvd_inhibit",
    "eeprom_erase_enabled",
    "bsl_pindetect_enabled",
];

pub struct Stc15AOptions {
    msr: [u8; 13],
    prescale_touched: bool,
}

impl Stc15AOptions {
    pub fn new(msr: [u8; 13]) -> Self {
        Stc15AOptions {
            msr,
            prescale_touched: false,
        }
    }

    /// The RC trim counter determined during handshake lives in the MSR.
    pub fn set_trim(&mut self, value: u16) {
        self.msr[3..5].copy_from_slice(&value.to_be_bytes());
    }

    fn watchdog_enabled(&self) -> bool {
        self.msr[2] & 0x20 == 0
    }
}

impl OptionSet for Stc15AOptions {
    fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        Ok(match name {
            "reset_pin_enabled" => OptionValue::Bool(self.msr[0] & 0x10 != 0),
            "watchdog_por_enabled" => OptionValue::Bool(self.watchdog_enabled()),
            "watchdog_stop_idle" => OptionValue::Bool(self.msr[2] & 0x08 == 0),
            "watchdog_prescale" => OptionValue::Int(prescale_from_bits(self.msr[2])),
            "low_voltage_reset" => OptionValue::Bool(self.msr[1] & 0x40 != 0),
            "low_voltage_threshold" => OptionValue::Int((self.msr[1] & 0x07) as u32),
            "eeprom_lvd_inhibit" => OptionValue::Bool(self.msr[1] & 0x80 != 0),
            "eeprom_erase_enabled" => OptionValue::Bool(self.msr[12] & 0x02 == 0),
            "bsl_pindetect_enabled" => OptionValue::Bool(self.msr[12] & 0x01 == 0),
            _ => return Err(unknown(name)),
        })
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "reset_pin_enabled" => {
                self.msr[0] &= 0xef;
                if parse_bool(value) {
                    self.msr[0] |= 0x10;
                }
            }
            "watchdog_por_enabled" => {
                self.msr[2] &= 0xdf;
                if !parse_bool(value) {
                    self.msr[2] |= 0x20;
                }
            }
            "watchdog_stop_idle" => {
                self.msr[2] &= 0xf7;
                if !parse_bool(value) {
                    self.msr[2] |= 0x08;
                }
            }
            "watchdog_prescale" => {
                let bits = prescale_to_bits(name, value)?;
                self.msr[2] = (self.msr[2] & 0xf8) | bits;
                self.prescale_touched = true;
            }
            "low_voltage_reset" => {
                self.msr[1] &= 0xbf;
                if parse_bool(value) {
                    self.msr[1] |= 0x40;
                }
            }
            "low_voltage_threshold" => {
                let val = parse_int(name, value)?;
                if val > 7 {
                    return Err(bad(name, "must be between 0 and 7"));
                }
                self.msr[1] = (self.msr[1] & 0xf8) | val as u8;
            }
            "eeprom_lvd_inhibit" => {
                self.msr[1] &= 0x7f;
                if parse_bool(value) {
                    self.msr[1] |= 0x80;
                }
            }
            "eeprom_erase_enabled" => {
                self.msr[12] &= 0xfd;
                if !parse_bool(value) {
                    self.msr[12] |= 0x02;
                }
            }
            "bsl_pindetect_enabled" => {
                self.msr[12] &= 0xfe;
                if !parse_bool(value) {
                    self.msr[12] |= 0x01;
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
    fn trim_counter_lands_in_msr() {
        let mut opts = Stc15AOptions::new([0xff; 13]);
        opts.set_trim(0x1234);
        let msr = opts.msr();
        assert_eq!(&msr[3..5], &[0x12, 0x34]);
    }

    #[test]
    fn threshold_domain() {
        let mut opts = Stc15AOptions::new([0; 13]);
        opts.set("low_voltage_threshold", "5").unwrap();
        assert_eq!(opts.get("low_voltage_threshold").unwrap(), OptionValue::Int(5));
        assert!(opts.set("low_voltage_threshold", "8").is_err());
    }
}
