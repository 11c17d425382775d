//! STC15 mainline option bytes. Four MSR bytes everywhere, a fifth with the
//! core voltage selector on the parts that report one.

use super::{
    bad, parse_bool, parse_int, parse_named, prescale_from_bits, prescale_to_bits, unknown,
    OptionSet, OptionValue,
};
use crate::error::Result;

const NAMES: &[&str] = &[
    "reset_pin_enabled",
    "clock_source",
    "clock_gain",
    "watchdog_por_enabled",
    "watchdog_stop_idle",
    "watchdog_prescale",
    "low_voltage_reset",
    "low_voltage_threshold",
    "eeprom_lvd_inhibit",
    "eeprom_erase_enabled",
    "bsl_pindetect_enabled",
    "por_reset_delay",
    "rstout_por_state",
    "uart2_passthrough",
    "uart2_pin_mode",
];

const NAMES_WITH_VOLTAGE: &[&str] = &[
    "reset_pin_enabled",
    "clock_source",
    "clock_gain",
    "watchdog_por_enabled",
    "watchdog_stop_idle",
    "watchdog_prescale",
    "low_voltage_reset",
    "low_voltage_threshold",
    "eeprom_lvd_inhibit",
    "eeprom_erase_enabled",
    "bsl_pindetect_enabled",
    "por_reset_delay",
    "rstout_por_state",
    "uart2_passthrough",
    "uart2_pin_mode",
    "cpu_core_voltage",
];

pub struct Stc15Options {
    msr: Vec<u8>,
    prescale_touched: bool,
}

impl Stc15Options {
    pub fn new(msr: Vec<u8>) -> Self {
        debug_assert!(msr.len() >= 4);
        Stc15Options {
            msr,
            prescale_touched: false,
        }
    }

    fn has_core_voltage(&self) -> bool {
        self.msr.len() > 4
    }

    fn watchdog_enabled(&self) -> bool {
        self.msr[0] & 0x20 == 0
    }
}

impl OptionSet for Stc15Options {
    fn names(&self) -> &'static [&'static str] {
        if self.has_core_voltage() {
            NAMES_WITH_VOLTAGE
        } else {
            NAMES
        }
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        Ok(match name {
            "reset_pin_enabled" => OptionValue::Bool(self.msr[2] & 0x10 == 0),
            "clock_source" => {
                OptionValue::Named(if self.msr[2] & 0x01 != 0 { "internal" } else { "external" })
            }
            "clock_gain" => OptionValue::Named(if self.msr[2] & 0x02 != 0 { "high" } else { "low" }),
            "watchdog_por_enabled" => OptionValue::Bool(self.watchdog_enabled()),
            "watchdog_stop_idle" => OptionValue::Bool(self.msr[0] & 0x08 == 0),
            "watchdog_prescale" => OptionValue::Int(prescale_from_bits(self.msr[0])),
            "low_voltage_reset" => OptionValue::Bool(self.msr[1] & 0x40 == 0),
            "low_voltage_threshold" => OptionValue::Int((self.msr[1] & 0x07) as u32),
            "eeprom_lvd_inhibit" => OptionValue::Bool(self.msr[1] & 0x80 != 0),
            "eeprom_erase_enabled" => OptionValue::Bool(self.msr[3] & 0x02 != 0),
            "bsl_pindetect_enabled" => OptionValue::Bool(self.msr[3] & 0x01 == 0),
            "por_reset_delay" => {
                OptionValue::Named(if self.msr[2] & 0x80 != 0 { "long" } else { "short" })
            }
            "rstout_por_state" => {
                OptionValue::Named(if self.msr[2] & 0x08 != 0 { "high" } else { "low" })
            }
            "uart2_passthrough" => OptionValue::Bool(self.msr[2] & 0x40 != 0),
            "uart2_pin_mode" => {
                OptionValue::Named(if self.msr[2] & 0x20 != 0 { "push-pull" } else { "normal" })
            }
            "cpu_core_voltage" if self.has_core_voltage() => OptionValue::Named(match self.msr[4] {
                0xea => "low",
                0xf7 => "mid",
                0xfd => "high",
                _ => "unknown",
            }),
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
            "clock_source" => {
                let bits = parse_named(name, value, &[("internal", 1), ("external", 0)])?;
                self.msr[2] = (self.msr[2] & 0xfe) | bits;
            }
            "clock_gain" => {
                let bits = parse_named(name, value, &[("low", 0), ("high", 1)])?;
                self.msr[2] = (self.msr[2] & 0xfd) | (bits << 1);
            }
            "watchdog_por_enabled" => {
                self.msr[0] &= 0xdf;
                if !parse_bool(value) {
                    self.msr[0] |= 0x20;
                }
            }
            "watchdog_stop_idle" => {
                self.msr[0] &= 0xf7;
                if !parse_bool(value) {
                    self.msr[0] |= 0x08;
                }
            }
            "watchdog_prescale" => {
                let bits = prescale_to_bits(name, value)?;
                self.msr[0] = (self.msr[0] & 0xf8) | bits;
                self.prescale_touched = true;
            }
            "low_voltage_reset" => {
                self.msr[1] &= 0xbf;
                if !parse_bool(value) {
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
                self.msr[3] &= 0xfd;
                if parse_bool(value) {
                    self.msr[3] |= 0x02;
                }
            }
            "bsl_pindetect_enabled" => {
                self.msr[3] &= 0xfe;
                if !parse_bool(value) {
                    self.msr[3] |= 0x01;
                }
            }
            "por_reset_delay" => {
                let bits = parse_named(name, value, &[("short", 0), ("long", 1)])?;
                self.msr[2] = (self.msr[2] & 0x7f) | (bits << 7);
            }
            "rstout_por_state" => {
                let bits = parse_named(name, value, &[("low", 0), ("high", 1)])?;
                self.msr[2] = (self.msr[2] & 0xf7) | (bits << 3);
            }
            "uart2_passthrough" => {
                self.msr[2] &= 0xbf;
                if parse_bool(value) {
                    self.msr[2] |= 0x40;
                }
            }
            "uart2_pin_mode" => {
                let bits = parse_named(name, value, &[("normal", 0), ("push-pull", 1)])?;
                self.msr[2] = (self.msr[2] & 0xdf) | (bits << 5);
            }
            "cpu_core_voltage" if self.has_core_voltage() => {
                let bits = parse_named(name, value, &[("low", 0xea), ("mid", 0xf7), ("high", 0xfd)])?;
                self.msr[4] = bits;
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
        self.msr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_randomized_mappings() {
        let mut state: u32 = 0x5151_a0a0;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        let bools = ["true", "false"];
        for _ in 0..200 {
            let mut opts = Stc15Options::new(vec![(next() & 0xff) as u8; 5]);
            let wd = bools[(next() % 2) as usize];
            let prescale = 1u32 << ((next() % 8) + 1);
            opts.set("watchdog_por_enabled", wd).unwrap();
            opts.set("watchdog_prescale", &prescale.to_string()).unwrap();
            opts.set("clock_source", "internal").unwrap();
            assert_eq!(
                opts.get("watchdog_por_enabled").unwrap(),
                OptionValue::Bool(wd == "true")
            );
            assert_eq!(opts.get("watchdog_prescale").unwrap(), OptionValue::Int(prescale));
            assert_eq!(opts.get("clock_source").unwrap(), OptionValue::Named("internal"));
        }
    }

    #[test]
    fn core_voltage_only_with_fifth_byte() {
        let mut short = Stc15Options::new(vec![0; 4]);
        assert!(short.set("cpu_core_voltage", "mid").is_err());
        assert!(!short.names().contains(&"cpu_core_voltage"));

        let mut long = Stc15Options::new(vec![0; 5]);
        long.set("cpu_core_voltage", "mid").unwrap();
        assert_eq!(long.get("cpu_core_voltage").unwrap(), OptionValue::Named("mid"));
        assert_eq!(long.msr()[4], 0xf7);
    }
}
