//! STC8 series option bytes, including the code/EEPROM split.

use super::{
    bad, parse_bool, parse_int, parse_named, prescale_from_bits, prescale_to_bits, unknown,
    OptionSet, OptionValue,
};
use crate::error::Result;

const NAMES: &[&str] = &[
    "reset_pin_enabled",
    "clock_gain",
    "watchdog_por_enabled",
    "watchdog_stop_idle",
    "watchdog_prescale",
    "low_voltage_reset",
    "low_voltage_threshold",
    "eeprom_erase_enabled",
    "bsl_pindetect_enabled",
    "por_reset_delay",
    "rstout_por_state",
    "uart1_remap",
    "uart2_passthrough",
    "uart2_pin_mode",
    "epwm_open_drain",
    "program_eeprom_split",
];

pub struct Stc8Options {
    msr: [u8; 5],
    prescale_touched: bool,
}

impl Stc8Options {
    pub fn new(msr: [u8; 5]) -> Self {
        Stc8Options {
            msr,
            prescale_touched: false,
        }
    }

    fn watchdog_enabled(&self) -> bool {
        self.msr[3] & 0x20 == 0
    }

    /// Configured code/EEPROM boundary in bytes.
    pub fn eeprom_split(&self) -> u32 {
        self.msr[4] as u32 * 256
    }
}

impl OptionSet for Stc8Options {
    fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        Ok(match name {
            "reset_pin_enabled" => OptionValue::Bool(self.msr[2] & 0x10 == 0),
            "clock_gain" => OptionValue::Named(if self.msr[1] & 0x02 != 0 { "high" } else { "low" }),
            "watchdog_por_enabled" => OptionValue::Bool(self.watchdog_enabled()),
            "watchdog_stop_idle" => OptionValue::Bool(self.msr[3] & 0x08 == 0),
            "watchdog_prescale" => OptionValue::Int(prescale_from_bits(self.msr[3])),
            "low_voltage_reset" => OptionValue::Bool(self.msr[2] & 0x40 == 0),
            "low_voltage_threshold" => {
                OptionValue::Int((3u8.wrapping_sub(self.msr[2]) & 0x03) as u32)
            }
            "eeprom_erase_enabled" => OptionValue::Bool(self.msr[0] & 0x02 != 0),
            "bsl_pindetect_enabled" => OptionValue::Bool(self.msr[0] & 0x01 == 0),
            "por_reset_delay" => {
                OptionValue::Named(if self.msr[1] & 0x80 != 0 { "long" } else { "short" })
            }
            "rstout_por_state" => {
                OptionValue::Named(if self.msr[1] & 0x08 != 0 { "high" } else { "low" })
            }
            "uart1_remap" => OptionValue::Bool(self.msr[1] & 0x40 != 0),
            "uart2_passthrough" => OptionValue::Bool(self.msr[1] & 0x10 != 0),
            "uart2_pin_mode" => {
                OptionValue::Named(if self.msr[1] & 0x20 != 0 { "push-pull" } else { "normal" })
            }
            "epwm_open_drain" => OptionValue::Bool(self.msr[1] & 0x04 != 0),
            "program_eeprom_split" => OptionValue::Int(self.eeprom_split()),
            _ => return Err(unknown(name)),
        })
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "reset_pin_enabled" => {
                self.msr[2] &= 0xef;
                if !parse_bool(value) {
                    self.msr[2] |= 0x10;
                }
            }
            "clock_gain" => {
                let bits = parse_named(name, value, &[("low", 0), ("high", 1)])?;
                self.msr[1] = (self.msr[1] & 0xfd) | (bits << 1);
            }
            "watchdog_por_enabled" => {
                self.msr[3] &= 0xdf;
                if !parse_bool(value) {
                    self.msr[3] |= 0x20;
                }
            }
            "watchdog_stop_idle" => {
                self.msr[3] &= 0xf7;
                if !parse_bool(value) {
                    self.msr[3] |= 0x08;
                }
            }
            "watchdog_prescale" => {
                let bits = prescale_to_bits(name, value)?;
                self.msr[3] = (self.msr[3] & 0xf8) | bits;
                self.prescale_touched = true;
            }
            "low_voltage_reset" => {
                self.msr[2] &= 0xbf;
                if !parse_bool(value) {
                    self.msr[2] |= 0x40;
                }
            }
            "low_voltage_threshold" => {
                let val = parse_int(name, value)?;
                if val > 3 {
                    return Err(bad(name, "must be between 0 and 3"));
                }
                self.msr[2] = (self.msr[2] & 0xfc) | (3 - val as u8);
            }
            "eeprom_erase_enabled" => {
                self.msr[0] &= 0xfd;
                if parse_bool(value) {
                    self.msr[0] |= 0x02;
                }
            }
            "bsl_pindetect_enabled" => {
                self.msr[0] &= 0xfe;
                if !parse_bool(value) {
                    self.msr[0] |= 0x01;
                }
            }
            "por_reset_delay" => {
                let bits = parse_named(name, value, &[("short", 0), ("long", 1)])?;
                self.msr[1] = (self.msr[1] & 0x7f) | (bits << 7);
            }
            "rstout_por_state" => {
                let bits = parse_named(name, value, &[("low", 0), ("high", 1)])?;
                self.msr[1] = (self.msr[1] & 0xf7) | (bits << 3);
            }
            "uart1_remap" => {
                self.msr[1] &= 0xbf;
                if parse_bool(value) {
                    self.msr[1] |= 0x40;
                }
            }
            "uart2_passthrough" => {
                self.msr[1] &= 0xef;
                if parse_bool(value) {
                    self.msr[1] |= 0x10;
                }
            }
            "uart2_pin_mode" => {
                let bits = parse_named(name, value, &[("normal", 0), ("push-pull", 1)])?;
                self.msr[1] = (self.msr[1] & 0xdf) | (bits << 5);
            }
            "epwm_open_drain" => {
                self.msr[1] &= 0xfb;
                if parse_bool(value) {
                    self.msr[1] |= 0x04;
                }
            }
            "program_eeprom_split" => {
                let val = parse_int(name, value)?;
                if !(512..=65024).contains(&val) || val % 512 != 0 {
                    return Err(bad(
                        name,
                        "must be between 512 and 65024 bytes and a multiple of 512 bytes",
                    ));
                }
                self.msr[4] = (val / 256) as u8;
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
    fn split_domain() {
        let mut opts = Stc8Options::new([0; 5]);
        opts.set("program_eeprom_split", "4096").unwrap();
        assert_eq!(opts.get("program_eeprom_split").unwrap(), OptionValue::Int(4096));
        assert_eq!(opts.eeprom_split(), 4096);
        assert_eq!(opts.msr()[4], 16);

        assert!(opts.set("program_eeprom_split", "100").is_err());
        assert!(opts.set("program_eeprom_split", "1000").is_err());
        assert!(opts.set("program_eeprom_split", "65536").is_err());
    }

    #[test]
    fn low_voltage_threshold_is_inverted_in_msr() {
        let mut opts = Stc8Options::new([0; 5]);
        opts.set("low_voltage_threshold", "2").unwrap();
        assert_eq!(opts.msr()[2] & 0x03, 1);
        assert_eq!(opts.get("low_voltage_threshold").unwrap(), OptionValue::Int(2));
    }
}
