//! STC10/11/12 series option bytes.

use super::{
    bad, parse_bool, parse_int, parse_named, prescale_from_bits, prescale_to_bits, unknown,
    OptionSet, OptionValue,
};
use crate::error::Result;

const NAMES: &[&str] = &[
    "reset_pin_enabled",
    "low_voltage_reset",
    "oscillator_stable_delay",
    "por_reset_delay",
    "clock_gain",
    "clock_source",
    "watchdog_por_enabled",
    "watchdog_stop_idle",
    "watchdog_prescale",
    "eeprom_erase_enabled",
    "bsl_pindetect_enabled",
];

pub struct Stc12Options {
    msr: [u8; 4],
    prescale_touched: bool,
}

impl Stc12Options {
    pub fn new(msr: [u8; 4]) -> Self {
        Stc12Options {
            msr,
            prescale_touched: false,
        }
    }

    fn watchdog_enabled(&self) -> bool {
        self.msr[2] & 0x20 == 0
    }
}

impl OptionSet for Stc12Options {
    fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        Ok(match name {
            "reset_pin_enabled" => OptionValue::Bool(self.msr[0] & 0x01 != 0),
            "low_voltage_reset" => OptionValue::Bool(self.msr[0] & 0x40 == 0),
            "oscillator_stable_delay" => {
                OptionValue::Int(1u32 << (((self.msr[0] >> 4) & 0x03) + 12))
            }
            "por_reset_delay" => {
                OptionValue::Named(if self.msr[1] & 0x80 == 0 { "long" } else { "short" })
            }
            "clock_gain" => OptionValue::Named(if self.msr[1] & 0x40 != 0 { "high" } else { "low" }),
            "clock_source" => {
                OptionValue::Named(if self.msr[1] & 0x02 != 0 { "external" } else { "internal" })
            }
            "watchdog_por_enabled" => OptionValue::Bool(self.watchdog_enabled()),
            "watchdog_stop_idle" => OptionValue::Bool(self.msr[2] & 0x08 == 0),
            "watchdog_prescale" => OptionValue::Int(prescale_from_bits(self.msr[2])),
            "eeprom_erase_enabled" => OptionValue::Bool(self.msr[3] & 0x02 == 0),
            "bsl_pindetect_enabled" => OptionValue::Bool(self.msr[3] & 0x01 == 0),
            _ => return Err(unknown(name)),
        })
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "reset_pin_enabled" => {
                self.msr[0] &= 0xfe;
                if parse_bool(value) {
                    self.msr[0] |= 0x01;
                }
            }
            "low_voltage_reset" => {
                self.msr[0] &= 0xbf;
                if !parse_bool(value) {
                    self.msr[0] |= 0x40;
                }
            }
            "oscillator_stable_delay" => {
                let val = parse_int(name, value)?;
                let bits = match val {
                    4096 => 0,
                    8192 => 1,
                    16384 => 2,
                    32768 => 3,
                    _ => return Err(bad(name, "must be one of 4096, 8192, 16384, 32768")),
                };
                self.msr[0] = (self.msr[0] & 0xcf) | (bits << 4);
            }
            "por_reset_delay" => {
                let bits = parse_named(name, value, &[("short", 1), ("long", 0)])?;
                self.msr[1] = (self.msr[1] & 0x7f) | (bits << 7);
            }
            "clock_gain" => {
                let bits = parse_named(name, value, &[("low", 0), ("high", 1)])?;
                self.msr[1] = (self.msr[1] & 0xbf) | (bits << 6);
            }
            "clock_source" => {
                let bits = parse_named(name, value, &[("internal", 0), ("external", 1)])?;
                self.msr[1] = (self.msr[1] & 0xfd) | (bits << 1);
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
            "eeprom_erase_enabled" => {
                self.msr[3] &= 0xfd;
                if !parse_bool(value) {
                    self.msr[3] |= 0x02;
                }
            }
            "bsl_pindetect_enabled" => {
                self.msr[3] &= 0xfe;
                if !parse_bool(value) {
                    self.msr[3] |= 0x01;
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
    fn roundtrip_over_random_settings() {
        // every settable value must read back identically
        let mut opts = Stc12Options::new([0xff; 4]);
        let cases: &[(&str, &str, OptionValue)] = &[
            ("reset_pin_enabled", "true", OptionValue::Bool(true)),
            ("low_voltage_reset", "false", OptionValue::Bool(false)),
            ("oscillator_stable_delay", "16384", OptionValue::Int(16384)),
            ("por_reset_delay", "short", OptionValue::Named("short")),
            ("clock_gain", "high", OptionValue::Named("high")),
            ("clock_source", "internal", OptionValue::Named("internal")),
            ("watchdog_por_enabled", "true", OptionValue::Bool(true)),
            ("watchdog_stop_idle", "false", OptionValue::Bool(false)),
            ("watchdog_prescale", "64", OptionValue::Int(64)),
            ("eeprom_erase_enabled", "true", OptionValue::Bool(true)),
            ("bsl_pindetect_enabled", "false", OptionValue::Bool(false)),
        ];
        for (name, value, expected) in cases {
            opts.set(name, value).unwrap();
            assert_eq!(opts.get(name).unwrap(), *expected, "{}", name);
        }
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn unspecified_options_keep_device_defaults() {
        let base = [0xa5, 0x5a, 0x12, 0x34];
        let mut opts = Stc12Options::new(base);
        opts.set("reset_pin_enabled", "false").unwrap();
        let msr = opts.msr();
        // only bit 0 of byte 0 may differ
        assert_eq!(msr[0] | 0x01, base[0] | 0x01);
        assert_eq!(&msr[1..], &base[1..]);
    }

    #[test]
    fn bad_osc_delay_rejected() {
        let mut opts = Stc12Options::new([0; 4]);
        assert!(opts.set("oscillator_stable_delay", "1000").is_err());
    }
}
